use chrono::NaiveDate;
use console::style;
use skilldeck_core::ItemStatus;
use skilldeck_engine::{BatchPolicy, BatchRetryResult, ItemOutcome, ItemQuery, Session};
use std::path::PathBuf;
use std::time::Duration;

use super::{Outcome, truncate_output};

pub(super) struct RetryArgs {
    pub skill: String,
    pub ids: Vec<String>,
    pub days: Option<u32>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub statuses: Vec<ItemStatus>,
    pub limit: Option<usize>,
    pub delay_ms: Option<u64>,
    pub concurrency: Option<usize>,
    pub dry_run: bool,
    pub output: Option<PathBuf>,
    pub json: bool,
}

impl RetryArgs {
    /// Flags override `[batch]` from the config.
    fn policy(&self, session: &Session) -> BatchPolicy {
        let mut policy = BatchPolicy::from_config(&session.config().batch).with_dry_run(self.dry_run);
        if !self.statuses.is_empty() {
            policy = policy.with_statuses(self.statuses.iter().copied());
        }
        if let Some(limit) = self.limit {
            policy = policy.with_max_items(limit);
        }
        if let Some(ms) = self.delay_ms {
            policy = policy.with_delay(Duration::from_millis(ms));
        }
        if let Some(n) = self.concurrency {
            policy = policy.with_concurrency(n);
        }
        policy
    }

    fn query(&self) -> ItemQuery {
        ItemQuery {
            keys: self.ids.clone(),
            days: self.days,
            start: self.start,
            end: self.end,
        }
    }
}

pub(super) async fn cmd_retry(session: &Session, args: RetryArgs) -> skilldeck_core::Result<Outcome> {
    let query = args.query();
    query.validate()?;
    let policy = args.policy(session);

    let pb = if args.json {
        indicatif::ProgressBar::hidden()
    } else {
        let verb = if args.dry_run { "checking" } else { "retrying" };
        super::skills::spinner(format!("{verb} items through {}…", args.skill))
    };
    let result = session.batch_retry(&args.skill, &query, &policy).await;
    pb.finish_and_clear();
    let result = result?;

    let report = serde_json::to_string_pretty(&result)?;
    if let Some(ref path) = args.output {
        std::fs::write(path, &report)?;
    }
    if args.json {
        println!("{report}");
    } else {
        print_report(&args.skill, &result);
        if let Some(ref path) = args.output {
            println!("  Report written to {}", path.display());
        }
    }

    Ok(Outcome::from_failures(result.has_failures()))
}

fn print_report(skill: &str, result: &BatchRetryResult) {
    let title = if result.dry_run {
        format!("Batch retry via {skill} (dry run)")
    } else {
        format!("Batch retry via {skill}")
    };
    println!("{}", style(title).bold());

    if result.items.is_empty() {
        println!("  No items listed.");
    }
    let width = result.items.iter().map(|r| r.key.chars().count()).max().unwrap_or(0);
    for item in &result.items {
        let outcome = style(item.outcome.to_string());
        let outcome = match item.outcome {
            ItemOutcome::Retried => outcome.green(),
            ItemOutcome::WouldRetry => outcome.cyan(),
            ItemOutcome::FailedAgain => outcome.red(),
            ItemOutcome::SkippedStatusFiltered
            | ItemOutcome::SkippedCap
            | ItemOutcome::SkippedDuplicate => outcome.dim(),
        };
        println!("  {:<width$}  {:<9} {}", item.key, item.status.as_str(), outcome);
        if let Some(ref err) = item.error {
            println!("  {:<width$}  {} {}", "", err.kind, truncate_output(&err.message, 100));
        }
    }

    let c = &result.counters;
    println!();
    if result.dry_run {
        println!(
            "  {} listed, {} would be retried, {} over the cap, {} already submitted, {} not eligible",
            c.total, c.would_retry, c.skipped_cap, c.skipped_duplicate, c.skipped_status_filtered
        );
    } else {
        println!(
            "  {} listed, {} retried, {} failed again, {} over the cap, {} already submitted, {} not eligible",
            c.total,
            c.retried,
            c.failed_again,
            c.skipped_cap,
            c.skipped_duplicate,
            c.skipped_status_filtered
        );
    }
}
