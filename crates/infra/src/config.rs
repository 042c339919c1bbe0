//! Environment-backed configuration values.
//!
//! Lookups go through [`Env`] so settings can be read from the process
//! environment in binaries and from a fixed map in tests.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),

    #[error("invalid value {value:?} for {key}: {message}")]
    Invalid {
        key: String,
        value: String,
        message: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, message: impl Display) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            message: message.to_string(),
        }
    }
}

enum Source {
    Process,
    Fixed(HashMap<String, String>),
}

/// A source of string settings.
pub struct Env {
    source: Source,
}

impl Env {
    pub fn from_process() -> Self {
        Self {
            source: Source::Process,
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            source: Source::Fixed(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Raw lookup. Blank values count as unset.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match &self.source {
            Source::Process => std::env::var(key).ok(),
            Source::Fixed(map) => map.get(key).cloned(),
        }?;
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    pub fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| ConfigError::invalid(key, &raw, e)),
            None => Ok(default),
        }
    }

    pub fn duration_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(key) {
            Some(raw) => parse_duration(&raw).map_err(|message| ConfigError::invalid(key, &raw, message)),
            None => Ok(default),
        }
    }

    /// Comma-separated list; empty entries are dropped.
    pub fn list_or(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.get(key) {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => default.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Parse `250ms`, `30s`, `5m`, `1h`, `2d` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    if digits.is_empty() {
        return Err("expected a number".to_string());
    }
    let n: u64 = digits.parse().map_err(|e| format!("{e}"))?;

    let secs = match unit.trim() {
        "ms" => return Ok(Duration::from_millis(n)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        other => return Err(format!("unknown unit {other:?}")),
    };
    n.checked_mul(secs)
        .map(Duration::from_secs)
        .ok_or_else(|| "duration overflows".to_string())
}
