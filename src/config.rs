use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::BackoffPolicy;

/// Configuration shared by every session of a registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory holding one credential row per account.
    pub credentials_path: String,
    /// Secret the credential blob key is derived from.
    pub encryption_secret: String,
    /// Display name announced for newly paired devices.
    pub push_name: Option<String>,
    /// Country calling code applied to national numbers, e.g. `"55"`.
    pub default_country_code: Option<String>,
    /// Upper bound for one connect-and-handshake attempt.
    pub connect_timeout_ms: u64,
    /// Validity of the first pairing challenge of a round.
    pub pairing_initial_timeout_ms: u64,
    /// Validity of every later pairing challenge.
    pub pairing_timeout_ms: u64,
    /// Rounds of pairing refs requested before giving up.
    pub pairing_rounds: u32,
    /// Capacity of each session's command queue.
    pub command_buffer: usize,
    /// Capacity of each link's protocol event queue.
    pub event_buffer: usize,
    pub backoff: BackoffPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials_path: "./data/credentials".into(),
            encryption_secret: "local-dev-secret".into(),
            push_name: None,
            default_country_code: None,
            connect_timeout_ms: 20_000,
            pairing_initial_timeout_ms: 60_000,
            pairing_timeout_ms: 20_000,
            pairing_rounds: 3,
            command_buffer: 32,
            event_buffer: 64,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(String),
    #[error("cannot parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl SessionConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.encryption_secret.is_empty() {
            return invalid("encryption_secret must not be empty");
        }
        if self.command_buffer == 0 || self.event_buffer == 0 {
            return invalid("command_buffer and event_buffer must be positive");
        }
        if self.pairing_rounds == 0 {
            return invalid("pairing_rounds must be positive");
        }
        if self.backoff.max_attempts == 0 {
            return invalid("backoff.max_attempts must be positive");
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return invalid("backoff.max_delay_ms must not be below backoff.base_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return invalid("backoff.jitter must be within [0, 1]");
        }
        Ok(())
    }

    /// Override the credential directory.
    pub fn with_credentials_path(mut self, path: impl Into<String>) -> Self {
        self.credentials_path = path.into();
        self
    }

    /// Override the symmetric encryption secret used for credential sealing.
    pub fn with_encryption_secret(mut self, secret: impl Into<String>) -> Self {
        self.encryption_secret = secret.into();
        self
    }

    pub fn with_push_name(mut self, name: impl Into<String>) -> Self {
        self.push_name = Some(name.into());
        self
    }

    pub fn with_default_country_code(mut self, code: impl Into<String>) -> Self {
        self.default_country_code = Some(code.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_pairing_timeouts(mut self, initial: Duration, later: Duration) -> Self {
        self.pairing_initial_timeout_ms = initial.as_millis() as u64;
        self.pairing_timeout_ms = later.as_millis() as u64;
        self
    }

    pub fn with_pairing_rounds(mut self, rounds: u32) -> Self {
        self.pairing_rounds = rounds;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pairing_initial_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_initial_timeout_ms)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pairing_initial_timeout(), Duration::from_secs(60));
        assert_eq!(config.pairing_timeout(), Duration::from_secs(20));
        assert_eq!(config.backoff.max_attempts, 5);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            SessionConfig::default().with_encryption_secret(""),
            SessionConfig::default().with_pairing_rounds(0),
            SessionConfig {
                event_buffer: 0,
                ..SessionConfig::default()
            },
            SessionConfig::default().with_backoff(BackoffPolicy {
                max_attempts: 0,
                ..BackoffPolicy::default()
            }),
            SessionConfig::default().with_backoff(BackoffPolicy {
                base_delay_ms: 5_000,
                max_delay_ms: 1_000,
                ..BackoffPolicy::default()
            }),
            SessionConfig::default().with_backoff(BackoffPolicy {
                jitter: 1.5,
                ..BackoffPolicy::default()
            }),
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"encryption_secret": "s3cret", "default_country_code": "55", "backoff": {{"max_attempts": 2}}}}"#
        )
        .unwrap();

        let config = SessionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.encryption_secret, "s3cret");
        assert_eq!(config.default_country_code.as_deref(), Some("55"));
        assert_eq!(config.backoff.max_attempts, 2);
        assert_eq!(config.backoff.base_delay_ms, 1_000);
        assert_eq!(config.pairing_rounds, 3);
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            SessionConfig::from_file("/nonexistent/wa-session.json"),
            Err(ConfigError::Io(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(SessionConfig::from_file(file.path()), Err(ConfigError::Parse(_))));
    }
}
