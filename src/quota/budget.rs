//! Daily allowance arithmetic.

use super::resolver::QuotaSource;

/// Share of the remaining cycle quota that may be spent opportunistically
/// per day.
pub const OPPORTUNISTIC_FRACTION: f64 = 0.05;

/// `1 / OPPORTUNISTIC_FRACTION`, kept exact for integer arithmetic.
const OPPORTUNISTIC_DIVISOR: u128 = 20;

/// Allowance for the whole day, before subtracting today's usage.
pub fn daily_budget(source: &QuotaSource) -> u64 {
    match *source {
        QuotaSource::SubscriptionQuota(bytes)
        | QuotaSource::DefaultSetting(bytes)
        | QuotaSource::ResourceDefault(bytes) => bytes,
        QuotaSource::CyclePolicy {
            remaining_bytes,
            remaining_days,
        } => {
            let days = u128::from(remaining_days.max(1));
            let share = u128::from(remaining_bytes) / (days * OPPORTUNISTIC_DIVISOR);
            // share <= remaining_bytes, so it always fits back.
            u64::try_from(share).unwrap_or(u64::MAX)
        }
    }
}

/// Bytes still available today; never negative.
pub fn daily_remaining(source: &QuotaSource, used_today: u64) -> u64 {
    daily_budget(source).saturating_sub(used_today)
}
