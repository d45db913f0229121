//! Rotation cadence arithmetic
//!
//! A cadence is a `(value, unit)` pair. Due-ness is decided by comparing
//! stored instants, so the only arithmetic the scheduler needs is turning a
//! cadence into a duration and adding it to the previous anchor.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::{SchedulerError, SchedulerResult};

// ============================================================================
// Cadence Unit
// ============================================================================

/// Unit of a rotation cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CadenceUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl CadenceUnit {
    /// Get all units
    pub fn all() -> Vec<Self> {
        vec![
            Self::Seconds,
            Self::Minutes,
            Self::Hours,
            Self::Days,
            Self::Weeks,
        ]
    }

    /// Get unit ID as stored
    pub fn id(&self) -> &'static str {
        match self {
            Self::Seconds => "seconds",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
            Self::Weeks => "weeks",
        }
    }

    /// Length of one unit in seconds
    pub fn seconds(&self) -> i64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 3_600,
            Self::Days => 86_400,
            Self::Weeks => 604_800,
        }
    }
}

impl fmt::Display for CadenceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for CadenceUnit {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "seconds" => Ok(Self::Seconds),
            "minutes" => Ok(Self::Minutes),
            "hours" => Ok(Self::Hours),
            "days" => Ok(Self::Days),
            "weeks" => Ok(Self::Weeks),
            _ => Err(SchedulerError::invalid_cadence(format!(
                "unknown unit '{s}'"
            ))),
        }
    }
}

// ============================================================================
// Cadence
// ============================================================================

/// Longest cadence accepted for a campaign
pub const MAX_CADENCE_DAYS: i64 = 3_650;

/// How often a campaign advances to its next variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cadence {
    pub value: u32,
    pub unit: CadenceUnit,
}

impl Cadence {
    /// Create a new cadence
    pub fn new(value: u32, unit: CadenceUnit) -> Self {
        Self { value, unit }
    }

    /// Check that the cadence describes a positive, bounded interval
    pub fn validate(&self) -> Result<(), String> {
        if self.value == 0 {
            return Err("cadence value must be greater than 0".to_string());
        }
        if self.as_duration() > TimeDelta::days(MAX_CADENCE_DAYS) {
            return Err(format!(
                "cadence {self} exceeds the {MAX_CADENCE_DAYS}-day maximum"
            ));
        }
        Ok(())
    }

    /// Length of one rotation cycle
    pub fn as_duration(&self) -> TimeDelta {
        TimeDelta::try_seconds(i64::from(self.value) * self.unit.seconds())
            .unwrap_or(TimeDelta::MAX)
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// Next due instant, anchored to the previous scheduled instant
///
/// Uses `anchor + cadence` rather than `now + cadence`, so a tick that fires
/// late never pushes later rotations back.
pub fn next_due_after(anchor: DateTime<Utc>, cadence: Cadence) -> SchedulerResult<DateTime<Utc>> {
    anchor
        .checked_add_signed(cadence.as_duration())
        .ok_or_else(|| {
            SchedulerError::invalid_cadence(format!("{cadence} overflows from {anchor}"))
        })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unit_durations() {
        assert_eq!(
            Cadence::new(30, CadenceUnit::Seconds).as_duration(),
            TimeDelta::seconds(30)
        );
        assert_eq!(
            Cadence::new(15, CadenceUnit::Minutes).as_duration(),
            TimeDelta::minutes(15)
        );
        assert_eq!(
            Cadence::new(4, CadenceUnit::Hours).as_duration(),
            TimeDelta::hours(4)
        );
        assert_eq!(
            Cadence::new(2, CadenceUnit::Days).as_duration(),
            TimeDelta::days(2)
        );
        assert_eq!(
            Cadence::new(1, CadenceUnit::Weeks).as_duration(),
            TimeDelta::weeks(1)
        );
    }

    #[test]
    fn test_unit_from_str() {
        for unit in CadenceUnit::all() {
            assert_eq!(unit.id().parse::<CadenceUnit>().unwrap(), unit);
        }
        assert_eq!("HOURS".parse::<CadenceUnit>().unwrap(), CadenceUnit::Hours);
        assert!("fortnights".parse::<CadenceUnit>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let cadence = Cadence::new(3, CadenceUnit::Days);
        let json = serde_json::to_string(&cadence).unwrap();
        assert_eq!(json, r#"{"value":3,"unit":"days"}"#);

        let back: Cadence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cadence);
    }

    #[test]
    fn test_next_due_is_anchored() {
        let anchor = Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap();
        let next = next_due_after(anchor, Cadence::new(1, CadenceUnit::Hours)).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 5, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_next_due_overflow_is_error() {
        let result = next_due_after(
            DateTime::<Utc>::MAX_UTC,
            Cadence::new(1, CadenceUnit::Weeks),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_value_invalid() {
        assert!(Cadence::new(0, CadenceUnit::Hours).validate().is_err());
        assert!(Cadence::new(1, CadenceUnit::Hours).validate().is_ok());
    }

    #[test]
    fn test_huge_value_rejected_without_panic() {
        let cadence = Cadence::new(u32::MAX, CadenceUnit::Weeks);
        assert_eq!(cadence.as_duration(), TimeDelta::MAX);
        assert!(cadence.validate().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Cadence::new(4, CadenceUnit::Hours).to_string(), "4 hours");
    }
}
