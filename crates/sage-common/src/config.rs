//! Runtime configuration.
//!
//! Configuration is read from a TOML file, then selectively overridden from
//! `SAGE_*` environment variables. All durations are plain integers so the
//! file stays readable:
//!
//! ```toml
//! [session]
//! max_age_secs = 3600
//! idle_timeout_secs = 600
//! max_messages = 1000
//!
//! [replay]
//! nonce_ttl_secs = 300
//! sequence_policy = "strict"
//!
//! [handshake]
//! timeout_secs = 30
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SageConfig {
    pub session: SessionSettings,
    pub replay: ReplaySettings,
    pub handshake: HandshakeSettings,
    pub log: LogSettings,
}

/// Session lifecycle limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Absolute lifetime of a session.
    pub max_age_secs: u64,
    /// Session expires after this long without traffic.
    pub idle_timeout_secs: u64,
    /// Session expires after this many encrypt/decrypt operations (0 = unlimited).
    pub max_messages: u64,
    /// How often the session manager sweeps expired sessions.
    pub cleanup_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_age_secs: 3600,
            idle_timeout_secs: 600,
            max_messages: 1000,
            cleanup_interval_secs: 30,
        }
    }
}

impl SessionSettings {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// How the ordering check treats sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencePolicySetting {
    /// Each sequence must exceed the last accepted one; gaps are fine.
    Strict,
    /// Bounded reordering inside a sliding window; repeats are rejected.
    Windowed,
}

/// Anti-replay and ordering settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    pub nonce_ttl_secs: u64,
    pub duplicate_ttl_secs: u64,
    /// Allowed backwards drift between consecutive message timestamps.
    pub timestamp_tolerance_ms: u64,
    /// Allowed difference between a message timestamp and local time (0 disables).
    pub max_clock_skew_secs: u64,
    pub cleanup_interval_secs: u64,
    pub sequence_policy: SequencePolicySetting,
    /// Window size for `Windowed` policy (1..=128).
    pub window_size: u64,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            nonce_ttl_secs: 300,
            duplicate_ttl_secs: 180,
            timestamp_tolerance_ms: 1000,
            max_clock_skew_secs: 30,
            cleanup_interval_secs: 60,
            sequence_policy: SequencePolicySetting::Strict,
            window_size: 128,
        }
    }
}

impl ReplaySettings {
    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }

    pub fn duplicate_ttl(&self) -> Duration {
        Duration::from_secs(self.duplicate_ttl_secs)
    }

    pub fn timestamp_tolerance(&self) -> Duration {
        Duration::from_millis(self.timestamp_tolerance_ms)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Handshake settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeSettings {
    /// Deadline for a complete client handshake.
    pub timeout_secs: u64,
    /// How long the server keeps a half-finished handshake.
    pub pending_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            pending_ttl_secs: 900,
            cleanup_interval_secs: 600,
        }
    }
}

impl HandshakeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SageConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(Error::serialization)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup (used by tests).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_u64(name: &str, value: &str) -> Result<u64> {
            value
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("{name} must be an integer, got {value:?}")))
        }

        let numeric: [(&str, &mut u64); 8] = [
            ("SAGE_SESSION_MAX_AGE_SECS", &mut self.session.max_age_secs),
            ("SAGE_SESSION_IDLE_TIMEOUT_SECS", &mut self.session.idle_timeout_secs),
            ("SAGE_SESSION_MAX_MESSAGES", &mut self.session.max_messages),
            ("SAGE_NONCE_TTL_SECS", &mut self.replay.nonce_ttl_secs),
            ("SAGE_DUPLICATE_TTL_SECS", &mut self.replay.duplicate_ttl_secs),
            ("SAGE_TIMESTAMP_TOLERANCE_MS", &mut self.replay.timestamp_tolerance_ms),
            ("SAGE_HANDSHAKE_TIMEOUT_SECS", &mut self.handshake.timeout_secs),
            ("SAGE_HANDSHAKE_PENDING_TTL_SECS", &mut self.handshake.pending_ttl_secs),
        ];
        for (name, slot) in numeric {
            if let Some(value) = lookup(name) {
                *slot = parse_u64(name, &value)?;
            }
        }

        if let Some(value) = lookup("SAGE_SEQUENCE_POLICY") {
            self.replay.sequence_policy = match value.trim().to_ascii_lowercase().as_str() {
                "strict" => SequencePolicySetting::Strict,
                "windowed" => SequencePolicySetting::Windowed,
                other => {
                    return Err(Error::config(format!(
                        "SAGE_SEQUENCE_POLICY must be strict or windowed, got {other:?}"
                    )))
                }
            };
        }
        if let Some(value) = lookup("SAGE_LOG_LEVEL") {
            self.log.level = value;
        }

        self.validate()
    }

    /// Reject settings the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.session.max_age_secs == 0 {
            return Err(Error::config("session.max_age_secs must be non-zero"));
        }
        if self.replay.nonce_ttl_secs == 0 {
            return Err(Error::config("replay.nonce_ttl_secs must be non-zero"));
        }
        if self.replay.sequence_policy == SequencePolicySetting::Windowed
            && !(1..=128).contains(&self.replay.window_size)
        {
            return Err(Error::config("replay.window_size must be 1-128"));
        }
        if self.handshake.timeout_secs == 0 {
            return Err(Error::config("handshake.timeout_secs must be non-zero"));
        }
        for (name, secs) in [
            ("session.cleanup_interval_secs", self.session.cleanup_interval_secs),
            ("replay.cleanup_interval_secs", self.replay.cleanup_interval_secs),
            ("handshake.cleanup_interval_secs", self.handshake.cleanup_interval_secs),
        ] {
            if secs == 0 {
                return Err(Error::config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
