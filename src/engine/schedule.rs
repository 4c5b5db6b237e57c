//! Host polling schedules.

use std::time::Duration;

use crate::config::validate_cron;

use super::EngineError;

/// Minimum allowed interval (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Schedule of a host's cycles.
///
/// Supports both fixed interval and cron-based scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed interval between cycles.
    Interval(Duration),

    /// Cron expression: `sec min hour day month weekday` (6-field).
    /// Example: `"0 */5 * * * *"` = every 5 minutes at second 0
    Cron(String),
}

impl Schedule {
    /// Create an interval schedule.
    ///
    /// Interval is clamped to a minimum of 1 second.
    pub fn interval(duration: Duration) -> Self {
        if duration < MIN_INTERVAL {
            tracing::warn!(min_interval = ?MIN_INTERVAL,
                "Interval duration is less than minimum allowed. Using minimum duration."
            );
            Self::Interval(MIN_INTERVAL)
        } else {
            Self::Interval(duration)
        }
    }

    /// Create a cron schedule with immediate validation.
    ///
    /// # Errors
    /// Returns `EngineError::Config` if the cron expression is invalid.
    pub fn cron(expr: impl AsRef<str>) -> Result<Self, EngineError> {
        let expr = expr.as_ref();
        validate_cron(expr).map_err(EngineError::Config)?;
        Ok(Self::Cron(expr.to_string()))
    }

    /// Check a schedule built directly from its variants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Interval(d) if *d < MIN_INTERVAL => Err(format!(
                "interval {:?} is below the minimum of {:?}",
                d, MIN_INTERVAL
            )),
            Self::Interval(_) => Ok(()),
            Self::Cron(expr) => validate_cron(expr),
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "every {:?}", d),
            Self::Cron(expr) => write!(f, "cron: {}", expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_is_clamped() {
        assert_eq!(
            Schedule::interval(Duration::from_millis(10)),
            Schedule::Interval(MIN_INTERVAL)
        );
        assert_eq!(Schedule::interval(Duration::from_secs(120)).to_string(), "every 120s");
    }

    #[test]
    fn test_cron_validation() {
        let result = Schedule::cron("invalid cron expression");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid cron"));

        let schedule = Schedule::cron("0 */5 * * * *").unwrap();
        assert_eq!(schedule.to_string(), "cron: 0 */5 * * * *");
    }

    #[test]
    fn test_validate() {
        assert!(Schedule::Interval(Duration::from_millis(500)).validate().is_err());
        assert!(Schedule::Interval(Duration::from_secs(1)).validate().is_ok());
        assert!(Schedule::Cron("nope".into()).validate().is_err());
    }
}
