use skilldeck_config::ConfigLoader;
use std::path::{Path, PathBuf};

use super::Outcome;

const TEMPLATE: &str = r#"# skilldeck configuration
# Relative paths resolve against the directory holding this file.

[skills]
system_dirs = ["skills/system"]
user_dirs = ["skills/user"]

[workflows]
system_dirs = ["workflows/system"]
user_dirs = ["workflows/user"]

[engine]
max_attempts = 3
retry_delay_ms = 1000
backoff_factor = 2.0
# max_delay_ms = 30000
# step_timeout_secs = 120
# checkpoint_timeout_secs = 0   # 0 waits for a decision indefinitely
continue_on_error = true

[batch]
default_statuses = ["FAILED", "ERROR", "TIMEOUT"]
max_items = 50
delay_ms = 500
# concurrency = 1
# default_lookback_days = 1

[state]
db_path = "state.db"

[logging]
level = "info"
# format = "pretty"   # or "json"

[credentials]
# LINEAR_API_KEY = "..."   # or set it in the environment
"#;

const DIRS: [&str; 4] = ["skills/system", "skills/user", "workflows/system", "workflows/user"];

/// Initialize a new skilldeck configuration with sensible defaults.
pub(super) fn cmd_init(local: bool) -> skilldeck_core::Result<Outcome> {
    let dir = if local {
        std::env::current_dir()?
    } else {
        ConfigLoader::home_dir()
    };

    match init_at(&dir)? {
        Some(config_path) => {
            println!("✅ Created {}", config_path.display());
            for sub in DIRS {
                println!("   {}/", dir.join(sub).display());
            }
            println!("   Add a skill with: skilldeck skill create <id>");
        }
        None => {
            println!("⚠️  {} already exists", dir.join("skilldeck.toml").display());
            println!("   Change values with: skilldeck set <key> <value>");
        }
    }
    Ok(Outcome::Success)
}

/// Write the config and create its directories. `None` if a config exists.
fn init_at(dir: &Path) -> skilldeck_core::Result<Option<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let config_path = dir.join("skilldeck.toml");
    if config_path.exists() {
        return Ok(None);
    }

    std::fs::write(&config_path, TEMPLATE)?;
    for sub in DIRS {
        std::fs::create_dir_all(dir.join(sub))?;
    }
    Ok(Some(config_path))
}
