use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONNECT_TIMEOUT_ENV: &str = "ROWBRIDGE_CONNECT_TIMEOUT_SECS";
pub const QUERY_TIMEOUT_ENV: &str = "ROWBRIDGE_QUERY_TIMEOUT_SECS";
pub const LOAD_TIMEOUT_ENV: &str = "ROWBRIDGE_LOAD_TIMEOUT_SECS";
pub const PREVIEW_ROWS_ENV: &str = "ROWBRIDGE_PREVIEW_ROWS";

/// Timeouts and limits handed to each port when it is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub load_timeout_secs: u64,
    pub preview_rows: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            query_timeout_secs: 300,
            load_timeout_secs: 600,
            preview_rows: 10,
        }
    }
}

impl EngineSettings {
    /// Reads an optional TOML file, then applies `ROWBRIDGE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).with_context(|| {
                    format!("Failed to read settings file at '{}'", path.display())
                })?;
                toml::from_str(&contents).with_context(|| {
                    format!("Failed to parse settings TOML from '{}'", path.display())
                })?
            }
            None => Self::default(),
        };

        settings.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = parse_override(&lookup, CONNECT_TIMEOUT_ENV)? {
            self.connect_timeout_secs = secs;
        }
        if let Some(secs) = parse_override(&lookup, QUERY_TIMEOUT_ENV)? {
            self.query_timeout_secs = secs;
        }
        if let Some(secs) = parse_override(&lookup, LOAD_TIMEOUT_ENV)? {
            self.load_timeout_secs = secs;
        }
        if let Some(rows) = parse_override(&lookup, PREVIEW_ROWS_ENV)? {
            self.preview_rows = rows;
        }
        Ok(self)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

fn parse_override<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{key} must be a non-negative integer, got '{raw}'")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let settings: EngineSettings = toml::from_str("query_timeout_secs = 30").expect("parse");
        assert_eq!(settings.query_timeout_secs, 30);
        assert_eq!(settings.connect_timeout_secs, 15);
        assert_eq!(settings.load_timeout(), Duration::from_secs(600));
        assert_eq!(settings.preview_rows, 10);
    }

    #[test]
    fn environment_overrides_win() {
        let env: HashMap<&str, &str> =
            HashMap::from([(LOAD_TIMEOUT_ENV, "42"), (PREVIEW_ROWS_ENV, " 3 ")]);
        let settings = EngineSettings::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(settings.load_timeout_secs, 42);
        assert_eq!(settings.preview_rows, 3);
        assert_eq!(settings.query_timeout_secs, 300);
    }

    #[test]
    fn malformed_override_names_the_variable() {
        let err = EngineSettings::default()
            .with_overrides(|key| (key == QUERY_TIMEOUT_ENV).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(QUERY_TIMEOUT_ENV));
    }
}
