use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::role::{RoleKey, BUILDER_ROLE, REVIEWER_ROLE, USER_ROLE};
use crate::{alog_debug, Error, Result};

pub const DEFAULT_LEASE_SECS: u64 = 90;
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;
pub const DEFAULT_RESTART_COOLDOWN_SECS: u64 = 10;
pub const DEFAULT_RESTART_SETTLE_MS: u64 = 2_000;
pub const DEFAULT_MACHINE_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Roles involved in the review gate for `new_feature` work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewGate {
    pub author_role: String,
    pub reviewer_role: String,
}

impl Default for ReviewGate {
    fn default() -> Self {
        Self {
            author_role: BUILDER_ROLE.to_string(),
            reviewer_role: REVIEWER_ROLE.to_string(),
        }
    }
}

impl ReviewGate {
    pub fn author(&self) -> RoleKey {
        RoleKey::new(&self.author_role)
    }

    pub fn reviewer(&self) -> RoleKey {
        RoleKey::new(&self.reviewer_role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Heartbeat lease length.
    pub lease_secs: u64,
    /// Consecutive revive attempts before a role is given up on.
    pub max_restart_attempts: u32,
    /// Window in which repeated auto-restart requests are ignored.
    pub restart_cooldown_secs: u64,
    /// Pause between stopping and starting an agent.
    pub restart_settle_ms: u64,
    pub machine_command_timeout_secs: u64,
    /// Role name that stands for the human.
    pub user_role: String,
    pub review_gate: ReviewGate,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lease_secs: DEFAULT_LEASE_SECS,
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            restart_cooldown_secs: DEFAULT_RESTART_COOLDOWN_SECS,
            restart_settle_ms: DEFAULT_RESTART_SETTLE_MS,
            machine_command_timeout_secs: DEFAULT_MACHINE_COMMAND_TIMEOUT_SECS,
            user_role: USER_ROLE.to_string(),
            review_gate: ReviewGate::default(),
        }
    }
}

impl Config {
    pub fn agentroom_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".agentroom"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::agentroom_dir()?.join("agentroom.toml"))
    }

    pub fn state_path() -> Result<PathBuf> {
        Ok(Self::agentroom_dir()?.join("state.json"))
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs as i64)
    }

    pub fn restart_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.restart_cooldown_secs as i64)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn machine_command_timeout(&self) -> Duration {
        Duration::from_secs(self.machine_command_timeout_secs)
    }

    pub fn user(&self) -> RoleKey {
        RoleKey::new(&self.user_role)
    }

    /// Reject settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.lease_secs == 0 {
            return Err(Error::Validation("lease_secs must be positive".to_string()));
        }
        if self.max_restart_attempts == 0 {
            return Err(Error::Validation(
                "max_restart_attempts must be at least 1".to_string(),
            ));
        }
        if self.user().is_empty() {
            return Err(Error::Validation("user_role must not be empty".to_string()));
        }
        if self.review_gate.author() == self.review_gate.reviewer() {
            return Err(Error::Validation(
                "review_gate author and reviewer must differ".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        alog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            alog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        alog_debug!(
            "Config loaded: lease={}s max_restarts={} cooldown={}s",
            config.lease_secs,
            config.max_restart_attempts,
            config.restart_cooldown_secs
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                alog_debug!("Creating config directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        alog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}
