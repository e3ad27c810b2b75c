use console::style;
use skilldeck_core::{ParamKind, ParamSpec, Params, SkillError};
use skilldeck_engine::{Dispatch, Session};
use skilldeck_skills::{Candidate, Resolution, SkillDescriptor};
use std::time::Duration;

use super::workflow::{self, Review};
use super::{Outcome, SkillAction};

pub(super) async fn cmd_skill(session: &Session, action: SkillAction) -> skilldeck_core::Result<Outcome> {
    let registry = session.registry();

    match action {
        SkillAction::List { json } => {
            let skills = registry.list();
            if json {
                let descriptors: Vec<&SkillDescriptor> = skills.iter().map(|s| &**s).collect();
                println!("{}", serde_json::to_string_pretty(&descriptors)?);
            } else if skills.is_empty() {
                let dirs = &session.config().skills.user_dirs;
                println!("No skills found.");
                if let Some(dir) = dirs.first() {
                    println!("  Create one in {} with: skilldeck skill create <id>", dir.display());
                }
            } else {
                println!("{}\n", style(format!("Available Skills ({}):", skills.len())).bold());
                for s in &skills {
                    println!(
                        "  {} v{} {}",
                        style(&s.id).cyan(),
                        s.version,
                        style(format!("[{}]", s.category)).dim()
                    );
                    if !s.description.is_empty() {
                        println!("    {}", s.description);
                    }
                    if !s.triggers.is_empty() {
                        println!("    Triggers: {}", s.triggers.join(", "));
                    }
                    println!();
                }
                let libraries = registry.libraries();
                if !libraries.is_empty() {
                    println!("  Shared libraries: {}", libraries.join(", "));
                }
            }
        }
        SkillAction::Show { id } => {
            let skill = registry.resolve(&id)?;
            println!("{} v{}", style(&skill.title).bold(), skill.version);
            if !skill.description.is_empty() {
                println!("  {}", skill.description);
            }
            println!("  Id: {}  Category: {}", skill.id, skill.category);
            if !skill.triggers.is_empty() {
                println!("  Triggers: {}", skill.triggers.join(", "));
            }
            if !skill.requires.is_empty() {
                let creds = session.credentials();
                let marks: Vec<String> = skill
                    .requires
                    .iter()
                    .map(|k| {
                        if creds.contains(k) {
                            format!("{k} ✓")
                        } else {
                            format!("{k} ✗")
                        }
                    })
                    .collect();
                println!("  Requires: {}", marks.join(", "));
            }
            if !skill.uses.is_empty() {
                println!("  Uses: {}", skill.uses.join(", "));
            }
            if let Some(days) = skill.lookback_days {
                println!("  Lookback: {days} day(s)");
            }

            if skill.contract.params.is_empty() {
                println!("\n  {} accepts any parameters", style("Contract:").bold());
            } else {
                println!("\n  {}", style("Parameters:").bold());
                for p in &skill.contract.params {
                    println!("    {}", describe_param(p));
                }
            }
            if let Some(ref result) = skill.contract.result {
                println!("  Returns: {result}");
            }
            println!("  File: {}", skill.file_path.display());

            if !skill.body.trim().is_empty() {
                println!("\n  {}", style("Notes:").bold());
                for line in skill.body.lines() {
                    println!("    {line}");
                }
            }
        }
        SkillAction::Triggers => {
            let mut rows: Vec<(String, String)> = registry
                .list_triggers()
                .into_iter()
                .map(|(phrase, id, category)| (phrase, format!("skill:{id} ({category})")))
                .collect();
            for def in session.catalog().list() {
                for phrase in &def.triggers {
                    rows.push((phrase.clone(), format!("workflow:{} ({})", def.id, def.category)));
                }
            }
            if rows.is_empty() {
                println!("No trigger phrases registered.");
            }
            let width = rows.iter().map(|(p, _)| p.chars().count()).max().unwrap_or(0);
            for (phrase, target) in rows {
                println!("  {phrase:<width$}  → {}", style(target).cyan());
            }
        }
        SkillAction::Create { id } => {
            let dir = session.config().skills.user_dirs.first().cloned().ok_or_else(|| {
                SkillError::Config("skills.user_dirs is empty; nowhere to create a skill".into())
            })?;
            let path = registry.create(&dir, &id)?;
            println!("✅ Created skill template at {}", path.display());
            println!("   Fill in the SKILL.md and its command; it is picked up on the next run.");
        }
        SkillAction::Invoke { id, params } => {
            let pb = spinner(format!("invoking {id}…"));
            let result = session.invoke_skill(&id, super::to_params(params)).await;
            pb.finish_and_clear();
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
    }
    Ok(Outcome::Success)
}

pub(super) fn cmd_match(session: &Session, utterance: &str, json: bool) -> skilldeck_core::Result<Outcome> {
    let outcome = session.match_utterance(utterance);
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(Outcome::Success);
    }

    if outcome.is_empty() {
        println!("No skill or workflow matches \"{utterance}\".");
        return Ok(Outcome::Success);
    }

    let ambiguous = matches!(outcome.resolution(), Resolution::Ambiguous(_));
    for (i, c) in outcome.candidates.iter().enumerate() {
        let marker = if i == 0 && !ambiguous { "→" } else { " " };
        println!("  {marker} {}", describe_candidate(c));
    }
    if ambiguous {
        println!("\n  ⚠️  top candidates tie; `skilldeck ask` will ask which one to use");
    }
    Ok(Outcome::Success)
}

pub(super) async fn cmd_ask(
    session: Session,
    utterance: &str,
    params: Params,
    yes: bool,
) -> skilldeck_core::Result<Outcome> {
    let dispatch = match session.dispatch(utterance)? {
        Dispatch::Ambiguous(tied) => choose(&session, &tied)?,
        other => other,
    };

    match dispatch {
        Dispatch::Skill(skill) => {
            println!("→ skill {}", style(&skill.id).cyan());
            let pb = spinner(format!("invoking {}…", skill.id));
            let result = session.invoke_skill(&skill.id, params).await;
            pb.finish_and_clear();
            println!("{}", serde_json::to_string_pretty(&result?)?);
            Ok(Outcome::Success)
        }
        Dispatch::Workflow(def) => {
            println!("→ workflow {}", style(&def.id).cyan());
            let review = Review::from_flags(yes, false);
            workflow::run_workflow(session, &def.id, params, review).await
        }
        Dispatch::NoMatch | Dispatch::Ambiguous(_) => Err(SkillError::Validation(format!(
            "no skill or workflow matches \"{utterance}\""
        ))),
    }
}

/// Let the user break a trigger tie.
fn choose(session: &Session, tied: &[Candidate]) -> skilldeck_core::Result<Dispatch> {
    use dialoguer::{Select, theme::ColorfulTheme};
    use skilldeck_skills::MatchTarget;

    if !console::user_attended() {
        let names: Vec<String> = tied.iter().map(|c| c.target.to_string()).collect();
        return Err(SkillError::Validation(format!(
            "ambiguous request, candidates: {}",
            names.join(", ")
        )));
    }

    let items: Vec<String> = tied.iter().map(describe_candidate).collect();
    let idx = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Several skills match equally well; which one?")
        .items(&items)
        .default(0)
        .interact()
        .map_err(|e| SkillError::Other(e.into()))?;

    match &tied[idx].target {
        MatchTarget::Skill(id) => Ok(Dispatch::Skill(session.registry().resolve(id)?)),
        MatchTarget::Workflow(id) => Ok(Dispatch::Workflow(session.catalog().get(id)?)),
    }
}

fn describe_candidate(c: &Candidate) -> String {
    format!(
        "{} {} via \"{}\" ({:?}, {} tokens)",
        style(&c.target).cyan(),
        style(format!("[{}]", c.category)).dim(),
        c.phrase,
        c.specificity.kind,
        c.specificity.tokens
    )
}

fn describe_param(p: &ParamSpec) -> String {
    let kind = match &p.kind {
        ParamKind::String => "string".to_string(),
        ParamKind::Integer => "integer".to_string(),
        ParamKind::Date => "date".to_string(),
        ParamKind::Bool => "bool".to_string(),
        ParamKind::Enum(values) => format!("enum({})", values.join("|")),
    };
    let mut line = format!("{}: {kind}", p.name);
    if !p.required {
        line.push('?');
    }
    if let Some(ref pattern) = p.pattern {
        line.push_str(&format!("  /{pattern}/"));
    }
    line
}

/// A spinner on stderr, hidden when nobody is watching.
pub(super) fn spinner(message: String) -> indicatif::ProgressBar {
    if !console::user_attended_stderr() {
        return indicatif::ProgressBar::hidden();
    }
    let pb = indicatif::ProgressBar::new_spinner();
    if let Ok(style) = indicatif::ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
