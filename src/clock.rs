//! Clock capability passed explicitly to everything that reads "now".

use chrono::{DateTime, FixedOffset, Local, Offset, Utc};

/// Source of the current instant and the local timezone used for day
/// boundaries.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn timezone(&self) -> FixedOffset;
}

/// Wall clock. Days start at local midnight, using the system offset in
/// effect at the time of the call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn timezone(&self) -> FixedOffset {
        Local::now().offset().fix()
    }
}

/// A clock frozen at one instant. Used by tests and the simulator.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    now: DateTime<Utc>,
    tz: FixedOffset,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>, tz: FixedOffset) -> Self {
        Self { now, tz }
    }

    pub fn utc(now: DateTime<Utc>) -> Self {
        Self::new(now, Utc.fix())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn timezone(&self) -> FixedOffset {
        self.tz
    }
}

/// Midnight of the day containing `now`, in `tz`, expressed in UTC.
pub fn start_of_day(now: DateTime<Utc>, tz: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(tz).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        // Fixed offsets have no gaps, so this only guards the type.
        .unwrap_or(now)
}
