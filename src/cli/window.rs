//! `multipath-budget window` handler.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};

use multipath_budget::policy::{current_window_at, CyclePeriod, CycleWindow, RecurrenceRule};

/// Handle `multipath-budget window`.
pub(crate) fn cmd_window(
    start: DateTime<FixedOffset>,
    months: i32,
    days: i32,
    now: Option<DateTime<FixedOffset>>,
) -> Result<()> {
    let now = now.map_or_else(Utc::now, |n| n.with_timezone(&Utc));
    let tz = *start.offset();
    let rule = RecurrenceRule::new(start, CyclePeriod { months, days });

    match window_for(&rule, now, tz)? {
        Some(window) => {
            println!("{:<16} {}", "Lower", window.lower.with_timezone(&tz).to_rfc3339());
            println!("{:<16} {}", "Upper", window.upper.with_timezone(&tz).to_rfc3339());
            println!("{:<16} {}", "Remaining days", window.remaining_days);
        }
        None => println!("No active cycle at {}", now.with_timezone(&tz).to_rfc3339()),
    }
    Ok(())
}

fn window_for(
    rule: &RecurrenceRule,
    now: DateTime<Utc>,
    tz: FixedOffset,
) -> Result<Option<CycleWindow>> {
    current_window_at(rule, now, tz).context("cannot compute cycle window")
}
