//! Value checks shared by the engine and host sections.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read argos configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed argos configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A value is out of range or inconsistent with another one.
    #[error("invalid argos configuration: {0}")]
    Invalid(String),
}

/// Parse a polling interval or timeout such as `2m`, `90s` or `1h 30m`.
///
/// Bare numbers are rejected: the unit is mandatory.
///
/// ```
/// use argos::config::parse_duration;
///
/// assert_eq!(parse_duration("2m").unwrap().as_secs(), 120);
/// assert_eq!(parse_duration("1h 30m").unwrap().as_secs(), 5400);
/// assert!(parse_duration("120").is_err());
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{s}': {e}"))
}

/// Check a 6-field cron expression (`sec min hour day month weekday`).
pub fn validate_cron(expr: &str) -> Result<(), String> {
    cron::Schedule::from_str(expr)
        .map(|_| ())
        .map_err(|e| format!("invalid cron expression '{expr}': {e}"))
}

fn env_ref_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("valid env reference regex")
    })
}

/// Substitute `${VAR}` and `${VAR:-default}` in secrets. An unset variable
/// without default becomes the empty string.
///
/// Connector placeholders such as `${source::KEY}` are left alone: variable
/// names cannot contain `:`.
pub fn expand_env_vars(input: &str) -> String {
    env_ref_regex()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let fallback = caps.get(2).map_or("", |m| m.as_str());
            std::env::var(&caps[1]).unwrap_or_else(|_| fallback.to_string())
        })
        .into_owned()
}
