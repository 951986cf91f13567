//! # Pot Configuration
//!
//! A pot is data, not code: one [`PotConfig`] per independently-scheduled
//! prize pool. Configs are loaded once at startup and never mutated.
//!
//! ## Schedules
//!
//! ```text
//! Interval { every_secs: 600 }            ->  */10 * * * *   (wall-clock aligned)
//! Daily    { hour: 12, minute: 0 }        ->  0 12 * * *
//! Weekly   { weekday: "sun", 0, 0 }       ->  0 0 * * 0
//! ```
//!
//! All schedules are evaluated in UTC.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amount::{Lamports, BPS_DENOMINATOR};

/// Pot identifier as used in URLs and the persisted document.
pub type PotId = String;

/// Default fee withheld from each payout (3%).
pub const DEFAULT_FEE_BPS: u32 = 300;

/// Default contribution-match tolerance (0.0001 native units).
pub const DEFAULT_TOLERANCE: Lamports = Lamports(100_000);

// ════════════════════════════════════════════════════════════════════════════
// ERROR
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PotConfigError {
    #[error("no pots configured")]
    Empty,

    #[error("pot id must be non-empty and URL-safe: {0:?}")]
    InvalidId(String),

    #[error("duplicate pot id: {0}")]
    DuplicateId(String),

    #[error("pot {pot}: fee_bps {fee_bps} exceeds {max}")]
    FeeTooHigh { pot: String, fee_bps: u32, max: u64 },

    #[error("pot {pot}: invalid schedule: {reason}")]
    InvalidSchedule { pot: String, reason: String },
}

// ════════════════════════════════════════════════════════════════════════════
// SCHEDULE
// ════════════════════════════════════════════════════════════════════════════

/// Recurring draw cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DrawSchedule {
    /// Fires on every wall-clock multiple of `every_secs` since the epoch.
    Interval { every_secs: u64 },
    /// Fires once a day at `hour:minute` UTC.
    Daily { hour: u32, minute: u32 },
    /// Fires once a week on `weekday` at `hour:minute` UTC.
    /// `weekday` accepts chrono's names ("sun", "Sunday", ...).
    Weekly { weekday: String, hour: u32, minute: u32 },
}

impl DrawSchedule {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            DrawSchedule::Interval { every_secs } => {
                if *every_secs == 0 {
                    return Err("every_secs must be > 0".to_string());
                }
                if *every_secs > i64::MAX as u64 {
                    return Err("every_secs out of range".to_string());
                }
                Ok(())
            }
            DrawSchedule::Daily { hour, minute } => check_time_of_day(*hour, *minute),
            DrawSchedule::Weekly { weekday, hour, minute } => {
                Weekday::from_str(weekday)
                    .map_err(|_| format!("unknown weekday {:?}", weekday))?;
                check_time_of_day(*hour, *minute)
            }
        }
    }

    /// Returns the first fire instant strictly after `now`.
    ///
    /// Invalid schedules (which `validate` rejects at load) fall back to
    /// one hour from `now` instead of panicking.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let fallback = now + Duration::hours(1);
        match self {
            DrawSchedule::Interval { every_secs } => {
                let every = match i64::try_from(*every_secs) {
                    Ok(e) if e > 0 => e,
                    _ => return fallback,
                };
                let next = (now.timestamp().div_euclid(every) + 1).saturating_mul(every);
                Utc.timestamp_opt(next, 0).single().unwrap_or(fallback)
            }
            DrawSchedule::Daily { hour, minute } => {
                match at_time_of_day(now, 0, *hour, *minute) {
                    Some(t) if t > now => t,
                    Some(t) => t + Duration::days(1),
                    None => fallback,
                }
            }
            DrawSchedule::Weekly { weekday, hour, minute } => {
                let target = match Weekday::from_str(weekday) {
                    Ok(w) => w,
                    Err(_) => return fallback,
                };
                let today = now.weekday().num_days_from_monday() as i64;
                let wanted = target.num_days_from_monday() as i64;
                let offset = (wanted - today).rem_euclid(7);
                match at_time_of_day(now, offset, *hour, *minute) {
                    Some(t) if t > now => t,
                    Some(t) => t + Duration::days(7),
                    None => fallback,
                }
            }
        }
    }
}

fn check_time_of_day(hour: u32, minute: u32) -> Result<(), String> {
    if hour >= 24 {
        return Err(format!("hour {} out of range", hour));
    }
    if minute >= 60 {
        return Err(format!("minute {} out of range", minute));
    }
    Ok(())
}

fn at_time_of_day(
    now: DateTime<Utc>,
    day_offset: i64,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Utc>> {
    let date = now.date_naive() + Duration::days(day_offset);
    let naive = date.and_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

// ════════════════════════════════════════════════════════════════════════════
// POT CONFIG
// ════════════════════════════════════════════════════════════════════════════

/// Immutable configuration of a single pot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotConfig {
    pub id: PotId,
    pub label: String,
    pub schedule: DrawSchedule,
    /// Fraction of the pool withheld from the payout, in basis points.
    #[serde(default = "default_fee_bps")]
    pub fee_bps: u32,
    /// Maximum accepted |claimed − on-chain| difference.
    #[serde(default = "default_tolerance")]
    pub tolerance: Lamports,
}

fn default_fee_bps() -> u32 {
    DEFAULT_FEE_BPS
}

fn default_tolerance() -> Lamports {
    DEFAULT_TOLERANCE
}

impl PotConfig {
    pub fn new(id: &str, label: &str, schedule: DrawSchedule) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            schedule,
            fee_bps: DEFAULT_FEE_BPS,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn validate(&self) -> Result<(), PotConfigError> {
        let id_ok = !self.id.is_empty()
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !id_ok {
            return Err(PotConfigError::InvalidId(self.id.clone()));
        }
        if self.fee_bps as u64 > BPS_DENOMINATOR {
            return Err(PotConfigError::FeeTooHigh {
                pot: self.id.clone(),
                fee_bps: self.fee_bps,
                max: BPS_DENOMINATOR,
            });
        }
        self.schedule
            .validate()
            .map_err(|reason| PotConfigError::InvalidSchedule {
                pot: self.id.clone(),
                reason,
            })
    }
}

/// Validates a full pot set: non-empty, each valid, ids unique.
pub fn validate_pots(pots: &[PotConfig]) -> Result<(), PotConfigError> {
    if pots.is_empty() {
        return Err(PotConfigError::Empty);
    }
    let mut seen = HashSet::new();
    for pot in pots {
        pot.validate()?;
        if !seen.insert(pot.id.as_str()) {
            return Err(PotConfigError::DuplicateId(pot.id.clone()));
        }
    }
    Ok(())
}

/// The stock deployment: a 10-minute main pot, an hourly pot and a weekly
/// pot drawn Sunday 00:00 UTC.
pub fn default_pots() -> Vec<PotConfig> {
    vec![
        PotConfig::new("main", "Rapid Draw", DrawSchedule::Interval { every_secs: 600 }),
        PotConfig::new("hourly", "Hourly Draw", DrawSchedule::Interval { every_secs: 3600 }),
        PotConfig::new(
            "weekly",
            "Weekly Draw",
            DrawSchedule::Weekly {
                weekday: "sun".to_string(),
                hour: 0,
                minute: 0,
            },
        ),
    ]
}
