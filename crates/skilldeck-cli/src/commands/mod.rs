use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use serde_json::Value;
use skilldeck_config::{ConfigLoader, SkilldeckConfig, WarningSeverity};
use skilldeck_core::{ItemStatus, Params, SkillError};
use skilldeck_engine::Session;
use std::path::PathBuf;
use tracing::debug;

mod history;
mod retry;
mod setup;
mod skills;
mod workflow;

/// skilldeck: run skills and multi-step workflows from the terminal
#[derive(Parser)]
#[command(name = "skilldeck", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to skilldeck.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect, scaffold and invoke skills
    Skill {
        #[command(subcommand)]
        action: SkillAction,
    },
    /// Show which skills or workflows an utterance would trigger
    Match {
        /// The request, e.g. "retry failed pipelines"
        #[arg(required = true, num_args = 1..)]
        utterance: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Route an utterance to a skill or workflow and execute it
    Ask {
        #[arg(required = true, num_args = 1..)]
        utterance: Vec<String>,

        /// Parameter for the matched skill or workflow (repeatable)
        #[arg(short, long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Approve every checkpoint without prompting
        #[arg(short, long)]
        yes: bool,
    },
    /// Run workflows and manage their checkpoints
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Re-submit failed items through a batch-capable skill
    Retry {
        /// Skill that lists and re-submits items (e.g. pipeline-runs)
        skill: String,

        /// Explicit item ids; without them the lookback window is listed
        ids: Vec<String>,

        /// Look back this many days (default: the skill's own setting)
        #[arg(long, conflicts_with_all = ["start", "end"])]
        days: Option<u32>,

        /// Window start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Window end date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Status to retry (repeatable, default from batch.default_statuses)
        #[arg(short, long = "status")]
        statuses: Vec<ItemStatus>,

        /// Retry at most this many items
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Pause between submissions in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Submissions in flight at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Report what would be retried without submitting anything
        #[arg(long)]
        dry_run: bool,

        /// Also write the JSON report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the JSON report instead of the table
        #[arg(long)]
        json: bool,
    },
    /// Show the project context log
    History {
        /// Only entries for this run
        #[arg(long)]
        run: Option<String>,

        /// Only entries for this project (workflow id or note project)
        #[arg(short, long)]
        project: Option<String>,

        /// Only entries of this kind (e.g. step_failed, note)
        #[arg(short, long)]
        kind: Option<String>,

        /// Only entries from the last N days
        #[arg(long)]
        days: Option<i64>,

        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Append a note to the context log
    Note {
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,

        /// Project the note belongs to
        #[arg(short, long)]
        project: Option<String>,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set a config value in skilldeck.toml (dot-notation key)
    Set {
        /// Config key in dot notation (e.g. engine.max_attempts, batch.delay_ms)
        key: String,
        /// Value to set
        value: String,
    },
    /// Initialize a new skilldeck.toml and its skill and workflow directories
    Init {
        /// Create in current directory instead of ~/.skilldeck/
        #[arg(long)]
        local: bool,
    },
    /// Validate configuration, definitions and the context log
    Doctor,
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub(crate) enum SkillAction {
    /// List all loaded skills
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a skill's descriptor, contract and notes
    Show { id: String },
    /// List every registered trigger phrase
    Triggers,
    /// Scaffold a new user skill
    Create {
        /// Skill id (lowercase letters, digits, '-' or '_')
        id: String,
    },
    /// Invoke a skill directly
    Invoke {
        id: String,

        /// Parameters as key=value
        #[arg(value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
}

#[derive(Subcommand)]
pub(crate) enum WorkflowAction {
    /// List all loaded workflows
    List,
    /// Show a workflow's steps
    Show { id: String },
    /// Start a workflow run
    Run {
        id: String,

        /// Run parameters as key=value
        #[arg(value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Approve every checkpoint without prompting
        #[arg(short, long, conflicts_with = "detach")]
        yes: bool,

        /// Suspend at checkpoints instead of prompting
        #[arg(short, long)]
        detach: bool,
    },
    /// Show one run in detail
    Status {
        run_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List runs (active only unless --all)
    Runs {
        /// Include finished runs
        #[arg(short, long)]
        all: bool,
    },
    /// Approve the pending checkpoint and continue the run
    Approve {
        run_id: String,

        /// Approve later checkpoints without prompting
        #[arg(short, long)]
        yes: bool,
    },
    /// Reject the pending checkpoint and abort the run
    Reject {
        run_id: String,

        /// Why the output was rejected
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Cancel a run
    Cancel { run_id: String },
    /// Continue a pending or interrupted run
    Resume {
        run_id: String,

        #[arg(short, long)]
        yes: bool,
    },
    /// Re-execute the failed step of a halted run
    RetryStep {
        run_id: String,

        #[arg(short, long)]
        yes: bool,
    },
}

/// How a command finished, as seen by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Completed, but some items or steps failed.
    PartialFailure,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::PartialFailure => 2,
        }
    }

    fn from_failures(failed: bool) -> Self {
        if failed {
            Outcome::PartialFailure
        } else {
            Outcome::Success
        }
    }
}

/// Parse "key=value" CLI arguments.
fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{s}`"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// Command-line values stay strings; skill contracts coerce them.
fn to_params(pairs: Vec<(String, String)>) -> Params {
    pairs
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect()
}

impl Cli {
    pub async fn run(self) -> skilldeck_core::Result<Outcome> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // Resolve log level: --verbose > --quiet > --log-level > RUST_LOG > config
        let flag_level = if self.verbose {
            Some("debug")
        } else if self.quiet {
            Some("error")
        } else {
            self.log_level.as_deref()
        };
        let filter = match flag_level {
            Some(level) => tracing_subscriber::EnvFilter::new(level),
            None => tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        };

        // Logs go to stderr so --json output stays parseable
        if config.logging.format == "json" {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_target(true)
                .with_writer(std::io::stderr)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        debug!(config = %config_loader.path().display(), "configuration loaded");

        match self.command {
            Commands::Config { json } => Self::cmd_config(config, json),
            Commands::Set { key, value } => {
                Self::cmd_config_set(config_loader.path().to_path_buf(), key, value)
            }
            Commands::Init { local } => setup::cmd_init(local),
            Commands::Completions { shell } => Self::cmd_completions(shell),
            Commands::Doctor => Self::cmd_doctor(&config_loader),
            command => {
                let session = Session::open(&config_loader)?;
                Self::dispatch(session, command).await
            }
        }
    }

    async fn dispatch(session: Session, command: Commands) -> skilldeck_core::Result<Outcome> {
        match command {
            Commands::Skill { action } => skills::cmd_skill(&session, action).await,
            Commands::Match { utterance, json } => {
                skills::cmd_match(&session, &utterance.join(" "), json)
            }
            Commands::Ask {
                utterance,
                params,
                yes,
            } => skills::cmd_ask(session, &utterance.join(" "), to_params(params), yes).await,
            Commands::Workflow { action } => workflow::cmd_workflow(session, action).await,
            Commands::Retry {
                skill,
                ids,
                days,
                start,
                end,
                statuses,
                limit,
                delay_ms,
                concurrency,
                dry_run,
                output,
                json,
            } => {
                let args = retry::RetryArgs {
                    skill,
                    ids,
                    days,
                    start,
                    end,
                    statuses,
                    limit,
                    delay_ms,
                    concurrency,
                    dry_run,
                    output,
                    json,
                };
                retry::cmd_retry(&session, args).await
            }
            Commands::History {
                run,
                project,
                kind,
                days,
                limit,
                json,
            } => history::cmd_history(&session, run, project, kind, days, limit, json),
            Commands::Note { message, project } => {
                history::cmd_note(&session, &message.join(" "), project.as_deref())
            }
            Commands::Config { .. }
            | Commands::Set { .. }
            | Commands::Init { .. }
            | Commands::Doctor
            | Commands::Completions { .. } => Ok(Outcome::Success),
        }
    }

    fn cmd_config(config: SkilldeckConfig, json: bool) -> skilldeck_core::Result<Outcome> {
        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| SkillError::Config(e.to_string()))?
            );
        }
        Ok(Outcome::Success)
    }

    fn cmd_config_set(
        path: PathBuf,
        key: String,
        value: String,
    ) -> skilldeck_core::Result<Outcome> {
        let content = if path.exists() {
            std::fs::read_to_string(&path).map_err(|e| {
                SkillError::Config(format!("Cannot read {}: {}", path.display(), e))
            })?
        } else {
            String::new()
        };

        let mut doc = content.parse::<toml_edit::DocumentMut>().map_err(|e| {
            SkillError::Config(format!("Invalid TOML in {}: {}", path.display(), e))
        })?;

        // "engine.max_attempts" → table path ["engine"], leaf "max_attempts"
        let parts: Vec<&str> = key.split('.').collect();
        let Some((leaf_key, table_parts)) = parts.split_last() else {
            return Err(SkillError::Config("Empty key".into()));
        };
        if leaf_key.is_empty() {
            return Err(SkillError::Config(format!("Invalid key '{key}'")));
        }

        let mut table: &mut toml_edit::Item = doc.as_item_mut();
        for part in table_parts {
            if table.get(part).is_none() {
                table[part] = toml_edit::Item::Table(toml_edit::Table::new());
            }
            table = &mut table[part];
        }

        // Infer the value type: bool, integer, float, or string
        let toml_value = if value == "true" {
            toml_edit::value(true)
        } else if value == "false" {
            toml_edit::value(false)
        } else if let Ok(i) = value.parse::<i64>() {
            toml_edit::value(i)
        } else if let Ok(f) = value.parse::<f64>() {
            toml_edit::value(f)
        } else {
            toml_edit::value(&value)
        };

        let old_value = table.get(leaf_key).map(|v| v.to_string());
        table[*leaf_key] = toml_value;

        // Refuse to write something the loader would reject
        let updated = doc.to_string();
        let parsed: SkilldeckConfig = toml::from_str(&updated)
            .map_err(|e| SkillError::Config(format!("{key} = {value} is not valid: {e}")))?;
        parsed.validate().map_err(SkillError::Config)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, updated).map_err(|e| {
            SkillError::Config(format!("Cannot write {}: {}", path.display(), e))
        })?;

        match old_value {
            Some(old) => println!("✅ {} = {} (was {})", key, value, old.trim()),
            None => println!("✅ {key} = {value} (new)"),
        }

        Ok(Outcome::Success)
    }

    fn cmd_doctor(loader: &ConfigLoader) -> skilldeck_core::Result<Outcome> {
        let config = loader.get();
        println!("🩺 skilldeck doctor");
        println!("   config: {}", loader.path().display());
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{e}");
                return Ok(Outcome::PartialFailure);
            }
        };

        let mut warn_count = 0;
        let mut info_count = 0;
        let mut ok_count = 0;

        for w in &warnings {
            println!("  {w}");
            match w.severity {
                WarningSeverity::Warning => warn_count += 1,
                WarningSeverity::Info => info_count += 1,
                WarningSeverity::Error => {}
            }
        }
        if warnings.is_empty() {
            ok_count += 1;
        }

        // Definitions on disk: a bad file is skipped at load time, so report it here
        match Session::open(loader) {
            Ok(session) => {
                println!(
                    "  ✅ {} skills, {} workflows loaded",
                    session.registry().count(),
                    session.catalog().len()
                );
                ok_count += 1;
                for issue in session.catalog().issues() {
                    println!("  ⚠️  {}: {}", issue.path.display(), issue.reason);
                    warn_count += 1;
                }

                let report = session.store().verify_context_chain()?;
                if report.is_intact() {
                    println!("  ✅ context log intact ({} entries)", report.entries);
                    ok_count += 1;
                } else {
                    println!(
                        "  ❌ context log checksum mismatch at entry {}",
                        report.first_broken.unwrap_or_default()
                    );
                    warn_count += 1;
                }
            }
            Err(e) => {
                println!("  ❌ cannot load skills: {e}");
                warn_count += 1;
            }
        }

        println!();
        println!(
            "  ✅ {ok_count} checks passed, ⚠️  {warn_count} warnings, 💡 {info_count} suggestions"
        );

        Ok(Outcome::from_failures(warn_count > 0))
    }

    fn cmd_completions(shell: Shell) -> skilldeck_core::Result<Outcome> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "skilldeck", &mut std::io::stdout());
        Ok(Outcome::Success)
    }
}

/// Truncate a string to `max` characters, appending "..." if truncated.
fn truncate_output(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max).collect();
        format!("{cut}...")
    }
}
