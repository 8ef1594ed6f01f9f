use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::bot::ListenerSettings;
use crate::rooms::SchedulerSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the homeserver, e.g. `https://matrix.example.org`.
    pub homeserver_url: String,
    /// Full Matrix id of the bot account.
    pub user_id: String,
    pub access_token: String,
    pub data_dir: PathBuf,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Minimum power level whose commands are obeyed.
    #[serde(default = "default_admin_power_level")]
    pub admin_power_level: i64,
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,
    /// How often a room with nothing scheduled rescans its history.
    #[serde(default = "default_idle_poll_secs")]
    pub idle_poll_secs: u64,
    /// Events per history page.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    /// Client-side timeout for each HTTP request. Must exceed the sync long-poll.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reconnect_initial_secs")]
    pub reconnect_initial_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// Commands older than this are ignored.
    #[serde(default = "default_command_max_age_secs")]
    pub command_max_age_secs: u64,
}

fn default_command_prefix() -> String {
    "!c".to_string()
}

fn default_admin_power_level() -> i64 {
    100
}

fn default_startup_delay_secs() -> u64 {
    2
}

fn default_idle_poll_secs() -> u64 {
    60
}

fn default_page_limit() -> u32 {
    100
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    90
}

fn default_reconnect_initial_secs() -> u64 {
    5
}

fn default_reconnect_max_secs() -> u64 {
    300
}

fn default_command_max_age_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            homeserver_url: "https://matrix.example.org".to_string(),
            user_id: String::new(),
            access_token: String::new(),
            data_dir: PathBuf::from("./data"),
            command_prefix: default_command_prefix(),
            admin_power_level: default_admin_power_level(),
            startup_delay_secs: default_startup_delay_secs(),
            idle_poll_secs: default_idle_poll_secs(),
            page_limit: default_page_limit(),
            sync_timeout_ms: default_sync_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_initial_secs: default_reconnect_initial_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            command_max_age_secs: default_command_max_age_secs(),
        }
    }
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("destroyer.db")
    }

    /// Returns the default config file path for a given data directory.
    pub fn config_file_path(data_dir: &Path) -> PathBuf {
        data_dir.join("config.yaml")
    }

    /// Load config from a YAML file. Returns None if the file does not exist.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Option<Config>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(Some(config))
    }

    /// Write a documented config template. Refuses to overwrite.
    pub fn write_default_config(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            anyhow::bail!(
                "config file already exists: {}. Remove it first to regenerate.",
                path.display()
            );
        }
        let template = include_str!("config_template.yaml");
        std::fs::write(path, template)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.homeserver_url.starts_with("http://") && !self.homeserver_url.starts_with("https://") {
            anyhow::bail!(
                "homeserver_url must start with http:// or https://: {}",
                self.homeserver_url
            );
        }
        if self.user_id.trim().is_empty() {
            anyhow::bail!("user_id is required");
        }
        if !self.user_id.starts_with('@') || !self.user_id.contains(':') {
            anyhow::bail!("user_id must look like @name:server, got {}", self.user_id);
        }
        if self.access_token.trim().is_empty() {
            anyhow::bail!("access_token is required");
        }
        if self.command_prefix.trim().is_empty() {
            anyhow::bail!("command_prefix must not be empty");
        }
        if self.page_limit == 0 {
            anyhow::bail!("page_limit must be at least 1");
        }
        if self.request_timeout_secs.saturating_mul(1000) <= self.sync_timeout_ms {
            tracing::warn!(
                request_timeout_secs = self.request_timeout_secs,
                sync_timeout_ms = self.sync_timeout_ms,
                "request timeout is shorter than the sync long-poll"
            );
        }
        Ok(())
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            startup_delay: Duration::from_secs(self.startup_delay_secs),
            idle_poll: Duration::from_secs(self.idle_poll_secs),
            page_limit: self.page_limit,
            command_prefix: self.command_prefix.clone(),
        }
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            command_prefix: self.command_prefix.clone(),
            admin_power_level: self.admin_power_level,
            command_max_age: Duration::from_secs(self.command_max_age_secs),
            sync_timeout_ms: self.sync_timeout_ms,
            reconnect_initial: Duration::from_secs(self.reconnect_initial_secs),
            reconnect_max: Duration::from_secs(self.reconnect_max_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            user_id: "@destroyer:example.org".to_string(),
            access_token: "syt_secret".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn yaml_minimal_fills_defaults() {
        let yaml = "homeserver_url: https://hs.example\nuser_id: \"@bot:hs.example\"\naccess_token: t\ndata_dir: ./data\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.command_prefix, "!c");
        assert_eq!(config.admin_power_level, 100);
        assert_eq!(config.page_limit, 100);
        assert_eq!(config.command_max_age_secs, 300);
    }

    #[test]
    fn template_parses_and_matches_defaults() {
        let config: Config = serde_yaml::from_str(include_str!("config_template.yaml")).unwrap();
        let defaults = Config::default();
        assert_eq!(config.command_prefix, defaults.command_prefix);
        assert_eq!(config.idle_poll_secs, defaults.idle_poll_secs);
        assert_eq!(config.sync_timeout_ms, defaults.sync_timeout_ms);
    }

    #[test]
    fn write_default_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = Config::config_file_path(dir.path());
        Config::write_default_config(&path).unwrap();
        assert!(Config::write_default_config(&path).is_err());
        assert!(Config::load_from_file(&path).unwrap().is_some());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_from_file(&dir.path().join("nope.yaml"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn validate_rejects_bad_fields() {
        assert!(valid().validate().is_ok());
        assert!(Config { access_token: String::new(), ..valid() }.validate().is_err());
        assert!(Config { user_id: "destroyer".into(), ..valid() }.validate().is_err());
        assert!(Config { homeserver_url: "matrix.org".into(), ..valid() }.validate().is_err());
        assert!(Config { page_limit: 0, ..valid() }.validate().is_err());
    }

    #[test]
    fn huge_request_timeout_validates() {
        let config = Config { request_timeout_secs: u64::MAX, ..valid() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn settings_carry_durations() {
        let config = Config { idle_poll_secs: 7, ..valid() };
        assert_eq!(config.scheduler_settings().idle_poll, Duration::from_secs(7));
        assert_eq!(
            config.listener_settings().command_max_age,
            Duration::from_secs(300)
        );
    }
}
