use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Optional human-readable name, used in logs only.
    #[serde(default)]
    pub name: Option<String>,

    /// Capacity of the routing seen-set consulted before broadcast fan-out.
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Mirror log output to stdout in addition to the log file.
    #[serde(default)]
    pub stdout: bool,

    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_seen_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: None,
            seen_capacity: default_seen_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: false,
            file: None,
        }
    }
}

impl StageConfig {
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StageConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StageConfig::default();
        assert_eq!(config.seen_capacity, 1024);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.stdout);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: StageConfig = toml::from_str(
            r#"
            name = "root"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.name.as_deref(), Some("root"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.seen_capacity, 1024);
    }
}
