//! Configuration
//!
//! A JSON5 file with one section per subsystem. Every section has defaults,
//! so a missing file or a partial file is valid.

use crate::autoreply::{validate_definitions, TriggerDefinition};
use crate::logging::LoggingConfig;
use crate::messages::{DeliverySettings, OverflowPolicy};
use crate::scripts::sandbox::DEFAULT_EXTENSIONS;
use crate::scripts::{ExecutorLimits, OversizePolicy, Position, ReplyPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "MESHRESPONDER_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResponderConfig {
    pub logging: LoggingConfig,
    pub scripts: ScriptsConfig,
    pub replies: RepliesConfig,
    pub delivery: DeliveryConfig,
    pub mesh: MeshConfig,
    /// Trigger list, in priority order
    pub triggers: Vec<TriggerDefinition>,
    /// Separate JSON5 file holding the trigger list; replaces `triggers`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggers_file: Option<PathBuf>,
}

/// Script sandbox settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptsConfig {
    pub dir: PathBuf,
    pub timeout_secs: u64,
    pub kill_grace_ms: u64,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
    pub max_concurrent: usize,
    pub allowed_extensions: Vec<String>,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        let limits = ExecutorLimits::default();
        Self {
            dir: PathBuf::from("/data/scripts"),
            timeout_secs: limits.timeout.as_secs(),
            kill_grace_ms: limits.kill_grace.as_millis() as u64,
            max_stdout_bytes: limits.max_stdout_bytes,
            max_stderr_bytes: limits.max_stderr_bytes,
            max_concurrent: limits.max_concurrent,
            allowed_extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl ScriptsConfig {
    pub fn limits(&self) -> ExecutorLimits {
        ExecutorLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            max_stdout_bytes: self.max_stdout_bytes,
            max_stderr_bytes: self.max_stderr_bytes,
            max_concurrent: self.max_concurrent,
        }
    }
}

/// Reply length rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepliesConfig {
    pub max_chars: usize,
    pub oversize_policy: OversizePolicy,
}

impl Default for RepliesConfig {
    fn default() -> Self {
        let policy = ReplyPolicy::default();
        Self {
            max_chars: policy.max_chars,
            oversize_policy: policy.oversize,
        }
    }
}

impl RepliesConfig {
    pub fn policy(&self) -> ReplyPolicy {
        ReplyPolicy {
            max_chars: self.max_chars,
            oversize: self.oversize_policy,
        }
    }
}

/// Delivery pacing, retries and queue bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeliveryConfig {
    pub spacing_secs: u64,
    pub max_attempts: u32,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        let settings = DeliverySettings::default();
        Self {
            spacing_secs: settings.spacing.as_secs(),
            max_attempts: settings.max_attempts,
            queue_capacity: crate::messages::queue::DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl DeliveryConfig {
    pub fn settings(&self) -> DeliverySettings {
        DeliverySettings {
            spacing: Duration::from_secs(self.spacing_secs),
            max_attempts: self.max_attempts,
        }
    }
}

/// Local radio facts passed to scripts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// Initial `{NODECOUNT}`; `serve` status lines update it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_count: Option<usize>,
}

impl MeshConfig {
    pub fn position(&self) -> Option<Position> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(Position::new(lat, lon)),
            _ => None,
        }
    }
}

/// Config file location: `$MESHRESPONDER_CONFIG`, else the platform config dir
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("meshresponder").join("config.json5"))
}

impl ResponderConfig {
    /// Parse JSON5 text
    pub fn from_json5(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        json5::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load and validate a config file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json5(&text, path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if let Some(file) = config.triggers_file.clone() {
            // Relative trigger files sit next to the config
            let file = match path.parent() {
                Some(parent) if file.is_relative() => parent.join(file),
                _ => file,
            };
            config.triggers = load_triggers(&file)?;
            config.triggers_file = Some(file);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from [`default_config_path`], or defaults when there is none
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.scripts.timeout_secs == 0 {
            errors.push("scripts.timeoutSecs must be greater than 0".to_string());
        }
        if self.scripts.max_concurrent == 0 {
            errors.push("scripts.maxConcurrent must be greater than 0".to_string());
        }
        if self.scripts.max_stdout_bytes == 0 {
            errors.push("scripts.maxStdoutBytes must be greater than 0".to_string());
        }
        if self.scripts.allowed_extensions.is_empty() {
            errors.push("scripts.allowedExtensions must not be empty".to_string());
        }
        if self.replies.max_chars == 0 {
            errors.push("replies.maxChars must be greater than 0".to_string());
        }
        if self.delivery.max_attempts == 0 {
            errors.push("delivery.maxAttempts must be greater than 0".to_string());
        }
        if self.delivery.queue_capacity == 0 {
            errors.push("delivery.queueCapacity must be greater than 0".to_string());
        }
        if self.mesh.latitude.is_some() != self.mesh.longitude.is_some() {
            errors.push("mesh.latitude and mesh.longitude must be set together".to_string());
        }
        if let Err(e) = validate_definitions(&self.triggers) {
            errors.push(format!("triggers: {}", e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// Read a JSON5 array of trigger definitions
pub fn load_triggers(path: &Path) -> Result<Vec<TriggerDefinition>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    json5::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoreply::ResponseType;
    use crate::logging::LogFormat;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = ResponderConfig::default();
        assert_eq!(config.scripts.dir, PathBuf::from("/data/scripts"));
        assert_eq!(config.scripts.timeout_secs, 10);
        assert_eq!(config.scripts.allowed_extensions, vec![".js", ".mjs", ".py", ".sh"]);
        assert_eq!(config.replies.max_chars, 200);
        assert_eq!(config.delivery.spacing_secs, 30);
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.delivery.overflow_policy, OverflowPolicy::DropOldest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json5() {
        let text = r#"{
            // comments and trailing commas are fine
            logging: { format: "json" },
            delivery: { spacingSecs: 5, overflowPolicy: "rejectNew", },
            replies: { oversizePolicy: "reject" },
            mesh: { ip: "192.168.1.20", port: 4403, latitude: 30.2, longitude: -97.7, nodeCount: 9 },
            triggers: [
                { id: "ping", pattern: "ping", response: "pong" },
                { id: "wx", pattern: "weather {location:.+}", responseType: "script", response: "weather.py" },
            ],
        }"#;
        let config = ResponderConfig::from_json5(text, Path::new("test.json5")).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.delivery.spacing_secs, 5);
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.delivery.overflow_policy, OverflowPolicy::RejectNew);
        assert_eq!(config.replies.policy().oversize, OversizePolicy::Reject);
        assert_eq!(config.mesh.position(), Some(Position::new(30.2, -97.7)));
        assert_eq!(config.mesh.node_count, Some(9));
        assert_eq!(config.triggers.len(), 2);
        assert_eq!(config.triggers[0].response_type, ResponseType::StaticText);
        assert_eq!(config.triggers[1].response_type, ResponseType::Script);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = ResponderConfig::default();
        config.scripts.timeout_secs = 0;
        config.scripts.allowed_extensions.clear();
        config.delivery.max_attempts = 0;
        config.mesh.latitude = Some(1.0);

        match config.validate() {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 4),
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ResponderConfig::load(&dir.path().join("absent.json5")).unwrap();
        assert_eq!(config.delivery.queue_capacity, 100);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json5");
        fs::write(&path, "{ scripts: ").unwrap();
        let err = ResponderConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.json5"));
    }

    #[test]
    fn test_triggers_file_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("triggers.json5"),
            r#"[{ id: "hi", pattern: "hi", response: "hello" }]"#,
        )
        .unwrap();
        let path = dir.path().join("config.json5");
        fs::write(&path, r#"{ triggersFile: "triggers.json5" }"#).unwrap();

        let config = ResponderConfig::load(&path).unwrap();
        assert_eq!(config.triggers.len(), 1);
        assert_eq!(config.triggers_file, Some(dir.path().join("triggers.json5")));
    }

    #[test]
    fn test_duplicate_trigger_ids_rejected() {
        let text = r#"{ triggers: [
            { id: "a", pattern: "x", response: "1" },
            { id: "a", pattern: "y", response: "2" },
        ] }"#;
        let config = ResponderConfig::from_json5(text, Path::new("c.json5")).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
