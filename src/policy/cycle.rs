//! Recurring policy cycles.
//!
//! A [`RecurrenceRule`] anchors a cycle at a start instant and repeats it
//! every [`CyclePeriod`]. [`current_window_at`] finds the cycle instance
//! containing a given instant and counts the whole days left in it,
//! today included.

use chrono::{DateTime, Days, FixedOffset, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{start_of_day, Clock};
use crate::error::{BudgetError, Result};

const SECONDS_PER_DAY: i64 = 86_400;

/// Length of one cycle. Both parts add up; `{ months: 1, days: 0 }` is a
/// calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclePeriod {
    #[serde(default)]
    pub months: i32,
    #[serde(default)]
    pub days: i32,
}

impl CyclePeriod {
    pub fn monthly() -> Self {
        Self { months: 1, days: 0 }
    }

    pub fn days(days: i32) -> Self {
        Self { months: 0, days }
    }

    /// Rejects negative parts and the zero period.
    pub fn validate(&self) -> Result<()> {
        if self.months < 0 || self.days < 0 || (self.months == 0 && self.days == 0) {
            return Err(BudgetError::InvalidRecurrence(format!(
                "period must be positive, got {} month(s) {} day(s)",
                self.months, self.days
            )));
        }
        Ok(())
    }

    /// Upper bound on the period length in days, used to seed the search.
    fn max_days(&self) -> i64 {
        i64::from(self.months) * 31 + i64::from(self.days)
    }
}

/// Cycle definition of a quota policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub start: DateTime<FixedOffset>,
    #[serde(default)]
    pub end: Option<DateTime<FixedOffset>>,
    pub period: CyclePeriod,
}

impl RecurrenceRule {
    pub fn new(start: DateTime<FixedOffset>, period: CyclePeriod) -> Self {
        Self {
            start,
            end: None,
            period,
        }
    }

    pub fn monthly(start: DateTime<FixedOffset>) -> Self {
        Self::new(start, CyclePeriod::monthly())
    }

    pub fn with_end(mut self, end: DateTime<FixedOffset>) -> Self {
        self.end = Some(end);
        self
    }

    /// Start of the `k`-th cycle. `None` on calendar overflow.
    fn boundary(&self, k: u32) -> Option<DateTime<FixedOffset>> {
        let months = u32::try_from(self.period.months).ok()?.checked_mul(k)?;
        let days = u64::try_from(self.period.days).ok()?.checked_mul(u64::from(k))?;
        self.start
            .checked_add_months(Months::new(months))?
            .checked_add_days(Days::new(days))
    }
}

/// The cycle instance containing "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleWindow {
    pub lower: DateTime<Utc>,
    pub upper: DateTime<Utc>,
    /// Whole days from the start of today to `upper`, at least 1.
    pub remaining_days: u64,
}

/// Current window of `rule` according to `clock`.
pub fn current_window(rule: &RecurrenceRule, clock: &dyn Clock) -> Result<Option<CycleWindow>> {
    current_window_at(rule, clock.now(), clock.timezone())
}

/// Find the window `[lower, upper)` of `rule` that contains `now`.
///
/// Returns `Ok(None)` when no cycle is active: `now` is before the rule
/// starts, at or after its end, or beyond what the calendar can represent.
/// A non-positive period is an error.
pub fn current_window_at(
    rule: &RecurrenceRule,
    now: DateTime<Utc>,
    tz: FixedOffset,
) -> Result<Option<CycleWindow>> {
    rule.period.validate()?;

    if now < rule.start {
        return Ok(None);
    }

    let elapsed_days = (now - rule.start.with_timezone(&Utc)).num_days();
    let mut k = u32::try_from(elapsed_days / rule.period.max_days()).unwrap_or(u32::MAX);

    let (lower, upper) = loop {
        let Some(lower) = rule.boundary(k) else {
            return Ok(None);
        };
        if lower > now {
            // Seed overshot; only possible near calendar clamping.
            match k.checked_sub(1) {
                Some(prev) => {
                    k = prev;
                    continue;
                }
                None => return Ok(None),
            }
        }
        let Some(upper) = k.checked_add(1).and_then(|next| rule.boundary(next)) else {
            return Ok(None);
        };
        if upper <= now {
            k += 1;
            continue;
        }
        break (lower, upper);
    };

    let mut upper = upper.with_timezone(&Utc);
    let lower = lower.with_timezone(&Utc);
    if let Some(end) = rule.end {
        let end = end.with_timezone(&Utc);
        if lower >= end || now >= end {
            return Ok(None);
        }
        upper = upper.min(end);
    }

    Ok(Some(CycleWindow {
        lower,
        upper,
        remaining_days: remaining_days(now, upper, tz),
    }))
}

/// Whole days from the start of today (in `tz`) to `upper`, rounded up,
/// never below 1.
pub fn remaining_days(now: DateTime<Utc>, upper: DateTime<Utc>, tz: FixedOffset) -> u64 {
    let secs = (upper - start_of_day(now, tz)).num_seconds();
    if secs <= 0 {
        return 1;
    }
    let days = 1 + (secs - 1) / SECONDS_PER_DAY;
    u64::try_from(days).unwrap_or(1).max(1)
}
