//! Reward point accrual math.
//!
//! Points accrue at a fixed base rate per staked token per hour, boosted by a
//! duration multiplier that grows linearly with total staking age and
//! saturates at +50% after 720 hours (30 days). All math runs at millisecond
//! resolution so sub-hour cycles still accrue fractional-hour credit.

use chrono::{DateTime, Utc};

/// Base accrual rate: points per staked token per hour.
pub const BASE_POINTS_PER_TOKEN_PER_HOUR: f64 = 10.0;

/// Total staking age (hours) at which the duration bonus stops growing.
pub const DURATION_BONUS_SATURATION_HOURS: f64 = 720.0;

/// Ceiling on the duration bonus (+50% on top of the base rate).
pub const DURATION_BONUS_CAP: f64 = 0.5;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Points earned over the interval `(last_calc, now]` for a position staked
/// since `staking_start`, rounded to the nearest whole point.
///
/// Pure and deterministic: same inputs, same output. A zero-length interval
/// earns zero, so re-running at an unchanged `now` is a no-op.
pub fn accrue_points(
    staked_amount: f64,
    staking_start: DateTime<Utc>,
    last_calc: DateTime<Utc>,
    now: DateTime<Utc>,
) -> i64 {
    let hours_since_last = hours_between(last_calc, now);
    let total_staking_hours = hours_between(staking_start, now);

    let raw = staked_amount * BASE_POINTS_PER_TOKEN_PER_HOUR * hours_since_last;
    (raw * duration_multiplier(total_staking_hours)).round() as i64
}

/// Duration bonus multiplier for a position `total_staking_hours` old:
/// `1 + min(total_staking_hours / 720, 0.5)`.
pub fn duration_multiplier(total_staking_hours: f64) -> f64 {
    1.0 + (total_staking_hours / DURATION_BONUS_SATURATION_HOURS).min(DURATION_BONUS_CAP)
}

// Clamped at zero so a skewed clock can never produce a negative accrual.
fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / MS_PER_HOUR).max(0.0)
}
