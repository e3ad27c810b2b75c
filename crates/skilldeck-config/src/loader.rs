use parking_lot::RwLock;
use skilldeck_core::{Credentials, SkillError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::SkilldeckConfig;

/// Loads the skilldeck configuration and resolves credentials.
#[derive(Debug)]
pub struct ConfigLoader {
    config: Arc<RwLock<SkilldeckConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > SKILLDECK_CONFIG env > ~/.skilldeck/skilldeck.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("SKILLDECK_CONFIG") {
            return PathBuf::from(p);
        }
        Self::home_dir().join("skilldeck.toml")
    }

    /// `~/.skilldeck`, or `./.skilldeck` when no home directory is known.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".skilldeck")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> skilldeck_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = Self::read(&config_path)?;

        // Warnings are logged, errors abort the load
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(SkillError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an in-memory config (for tests and embedding).
    pub fn from_config(config: SkilldeckConfig, config_path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        }
    }

    fn read(config_path: &Path) -> skilldeck_core::Result<SkilldeckConfig> {
        let mut config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(config_path)?;
            toml::from_str::<SkilldeckConfig>(&raw).map_err(|e| {
                SkillError::Config(format!("failed to parse {}: {}", config_path.display(), e))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            SkilldeckConfig::default()
        };

        let config_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));

        config = Self::apply_env_overrides(config);
        config.resolve_paths(config_dir);
        Ok(config)
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> SkilldeckConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<SkilldeckConfig>> {
        Arc::clone(&self.config)
    }

    /// Path the config was (or would have been) loaded from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (SKILLDECK_LOG_LEVEL, SKILLDECK_STATE_DB, ...)
    fn apply_env_overrides(mut config: SkilldeckConfig) -> SkilldeckConfig {
        if let Ok(v) = std::env::var("SKILLDECK_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("SKILLDECK_LOG_FORMAT") {
            config.logging.format = v;
        }
        if let Ok(v) = std::env::var("SKILLDECK_STATE_DB") {
            config.state.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SKILLDECK_CHECKPOINT_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                config.engine.checkpoint_timeout_secs = secs;
            }
        }
        config
    }

    /// Build the process-wide credential store.
    ///
    /// Keys set in the config file take priority; the environment fills in
    /// everything else.
    pub fn credentials(&self) -> Credentials {
        Self::merge_credentials(&self.config.read(), std::env::vars())
    }

    fn merge_credentials(
        config: &SkilldeckConfig,
        env: impl Iterator<Item = (String, String)>,
    ) -> Credentials {
        let mut creds = Credentials::from_map(config.credentials.clone());
        for (key, value) in env {
            if !creds.contains(&key) {
                creds.insert(key, value);
            }
        }
        creds
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> skilldeck_core::Result<()> {
        if !self.config_path.exists() {
            return Err(SkillError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::read(&self.config_path)?;
        new_config.validate().map_err(SkillError::Config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }
}
