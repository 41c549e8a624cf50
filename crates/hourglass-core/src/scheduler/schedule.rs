//! Schedules - rules that produce fire times for a trigger
//!
//! Supports:
//! - Cron: cron expressions evaluated in UTC
//! - Interval: fixed period with an optional repeat limit
//! - Once: a single fire time
//! - Daily: a fixed time of day

use chrono::{DateTime, Duration, NaiveTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Result, StoreError};

/// Fire-time rule of a trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Cron expression (5, 6 or 7 fields; 5-field expressions fire at second 0)
    /// Examples:
    ///   "0 9 * * *" - Every day at 9:00
    ///   "*/10 * * * * *" - Every 10 seconds
    Cron(CronSchedule),
    /// Fixed interval from the start time
    Interval(IntervalSchedule),
    /// Single execution
    Once(OnceSchedule),
    /// Every day at a fixed time (UTC)
    Daily(DailySchedule),
}

/// Cron-based schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    /// Cron expression
    pub expression: String,
}

/// Interval-based schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSchedule {
    /// Period in milliseconds
    pub every_ms: u64,
    /// Repeats after the first firing; `None` repeats forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_count: Option<u32>,
}

/// One-time schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnceSchedule {
    /// Fire time
    pub at: DateTime<Utc>,
}

/// Time-of-day schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySchedule {
    /// Time of day (UTC)
    pub at: NaiveTime,
}

/// What to do with a trigger whose fire time passed unnoticed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Pick per schedule kind
    #[default]
    Smart,
    /// Never reschedule; fire late occurrences as they are
    IgnoreMisfires,
    /// Fire once as soon as possible
    FireNow,
    /// Skip missed occurrences and wait for the next one
    DoNothing,
}

/// Range a schedule is allowed to fire in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FireWindow {
    /// Earliest fire time
    pub start: DateTime<Utc>,
    /// Latest fire time, inclusive
    pub end: Option<DateTime<Utc>>,
}

impl FireWindow {
    fn admits(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.end {
            Some(end) if time > end => None,
            _ => Some(time),
        }
    }
}

impl Schedule {
    /// Create a cron schedule, validating the expression
    pub fn cron(expression: impl Into<String>) -> Result<Self> {
        let schedule = Self::Cron(CronSchedule {
            expression: expression.into(),
        });
        schedule.validate()?;
        Ok(schedule)
    }

    /// Create an unbounded interval schedule
    pub fn interval(every: Duration) -> Self {
        Self::Interval(IntervalSchedule {
            every_ms: every.num_milliseconds().max(0) as u64,
            repeat_count: None,
        })
    }

    /// Create an interval schedule firing `repeat_count + 1` times
    pub fn interval_repeating(every: Duration, repeat_count: u32) -> Self {
        Self::Interval(IntervalSchedule {
            every_ms: every.num_milliseconds().max(0) as u64,
            repeat_count: Some(repeat_count),
        })
    }

    /// Create a one-time schedule
    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once(OnceSchedule {
            at: at.trunc_subsecs(3),
        })
    }

    /// Create a daily schedule
    pub fn daily(at: NaiveTime) -> Self {
        Self::Daily(DailySchedule { at })
    }

    /// Check that the schedule can produce fire times
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Cron(cron) => parse_cron(&cron.expression).map(|_| ()),
            Self::Interval(interval) if interval.every_ms == 0 => Err(
                StoreError::InvalidSchedule("interval must be positive".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// First fire time at or after the window start
    pub fn first_fire_time(&self, window: &FireWindow) -> Option<DateTime<Utc>> {
        match self {
            Self::Once(once) => window.admits(once.at.max(window.start)),
            Self::Interval(_) => window.admits(window.start),
            _ => self.fire_time_after(window.start - Duration::milliseconds(1), window),
        }
    }

    /// First fire time strictly after `after`
    pub fn fire_time_after(
        &self,
        after: DateTime<Utc>,
        window: &FireWindow,
    ) -> Option<DateTime<Utc>> {
        let after = after.max(window.start - Duration::milliseconds(1));
        let next = match self {
            Self::Cron(cron) => {
                let parsed = parse_cron(&cron.expression).ok()?;
                parsed.after(&after).next()
            }
            Self::Interval(interval) => {
                let every = interval.every_ms as i64;
                if every == 0 {
                    return None;
                }
                let elapsed = (after - window.start).num_milliseconds();
                let index = if elapsed < 0 { 0 } else { elapsed / every + 1 };
                if let Some(repeat) = interval.repeat_count {
                    if index > i64::from(repeat) {
                        return None;
                    }
                }
                Some(window.start + Duration::milliseconds(index * every))
            }
            Self::Once(once) => (once.at > after).then_some(once.at),
            Self::Daily(daily) => {
                let today = after.date_naive().and_time(daily.at).and_utc();
                if today > after {
                    Some(today)
                } else {
                    Some(today + Duration::days(1))
                }
            }
        }?;
        window.admits(next)
    }

    /// Resolve `Smart` to the concrete policy for this schedule kind
    pub fn effective_policy(&self, policy: MisfirePolicy) -> MisfirePolicy {
        match (policy, self) {
            (MisfirePolicy::Smart, Self::Once(_)) => MisfirePolicy::FireNow,
            (MisfirePolicy::Smart, _) => MisfirePolicy::DoNothing,
            (other, _) => other,
        }
    }

    /// New next fire time for a misfired trigger
    pub fn next_after_misfire(
        &self,
        policy: MisfirePolicy,
        current: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        window: &FireWindow,
    ) -> Option<DateTime<Utc>> {
        match self.effective_policy(policy) {
            MisfirePolicy::IgnoreMisfires => current,
            MisfirePolicy::FireNow => current.and_then(|_| window.admits(now.trunc_subsecs(3))),
            _ => self.fire_time_after(now, window),
        }
    }
}

/// Parse a cron expression, accepting the 5-field form without seconds
fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| StoreError::InvalidSchedule(format!("{}: {}", expression, e)))
}

#[cfg(test)]
mod tests;
