use chrono::{TimeDelta, Utc};
use console::style;
use skilldeck_core::SkillError;
use skilldeck_engine::Session;
use skilldeck_store::ContextFilter;

use super::{Outcome, truncate_output};

pub(super) fn cmd_history(
    session: &Session,
    run: Option<String>,
    project: Option<String>,
    kind: Option<String>,
    days: Option<i64>,
    limit: usize,
    json: bool,
) -> skilldeck_core::Result<Outcome> {
    let since = match days {
        Some(d) => {
            let window = TimeDelta::try_days(d)
                .filter(|w| *w > TimeDelta::zero())
                .ok_or_else(|| SkillError::Validation(format!("--days {d} is out of range")))?;
            Some(Utc::now() - window)
        }
        None => None,
    };
    let filter = ContextFilter {
        run_id: run,
        project,
        kind,
        since,
        limit: Some(limit),
    };
    let entries = session.history(&filter)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(Outcome::Success);
    }
    if entries.is_empty() {
        println!("No history entries.");
        return Ok(Outcome::Success);
    }

    println!("{} ({} entries)", style("History").bold(), entries.len());
    println!("{}", "-".repeat(80));
    for entry in &entries {
        let kind = style(&entry.kind);
        let kind = match entry.kind.as_str() {
            k if k.ends_with("failed") || k.contains("rejected") || k.contains("cancelled") => kind.red(),
            k if k.starts_with("checkpoint") || k == "run_halted" => kind.yellow(),
            k if k.ends_with("succeeded") || k.ends_with("completed") || k.contains("approved") => {
                kind.green()
            }
            "note" => kind.magenta(),
            _ => kind.cyan(),
        };
        let scope = entry
            .project
            .as_deref()
            .map(|p| format!(" [{p}]"))
            .unwrap_or_default();
        println!(
            "{}  {kind}{scope}  {}",
            style(entry.created_at.format("%Y-%m-%d %H:%M:%S")).dim(),
            truncate_output(&entry.message, 100)
        );
    }

    Ok(Outcome::Success)
}

pub(super) fn cmd_note(
    session: &Session,
    message: &str,
    project: Option<&str>,
) -> skilldeck_core::Result<Outcome> {
    let entry = session.note(message, project)?;
    println!("📝 Noted (#{})", entry.id);
    Ok(Outcome::Success)
}
