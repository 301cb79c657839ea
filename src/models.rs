use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single wallet's staking record. One wallet may hold several positions;
/// they accrue independently and roll up into the same user aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingPosition {
    pub id: String,
    pub wallet_address: String,
    /// Last known authoritative staked quantity, in whole tokens.
    pub staked_amount: f64,
    /// Instant the position began. Immutable; anchors the duration bonus.
    pub staking_start_ts: DateTime<Utc>,
    /// Instant through which points have been accrued. Never moves backward.
    pub last_reward_calc_ts: DateTime<Utc>,
    /// Instant of the last successful balance verification.
    pub last_verification_ts: Option<DateTime<Utc>>,
    pub accumulated_points: i64,
    /// False is terminal: the engine never reactivates a position.
    pub is_active: bool,
}

impl StakingPosition {
    /// Fresh position opened at `now` with no accrual history.
    pub fn open(wallet_address: &str, staked_amount: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            wallet_address: wallet_address.to_string(),
            staked_amount,
            staking_start_ts: now,
            last_reward_calc_ts: now,
            last_verification_ts: None,
            accumulated_points: 0,
            is_active: true,
        }
    }
}

/// Per-wallet point aggregate. Only ever incremented by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub wallet_address: String,
    pub points: i64,
    pub updated_at: DateTime<Utc>,
}

/// Outcome tallies for one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Active positions pulled at the start of the run.
    pub scanned: usize,
    /// Unchanged-or-increased positions that accrued normally.
    pub accrued: usize,
    pub partial_unstakes: usize,
    pub full_unstakes: usize,
    /// Oracle unavailable; position untouched this run, retried next cycle.
    pub deferred: usize,
    /// Conditional write lost to a concurrent run; nothing written.
    pub contended: usize,
    /// Persistence or task failure; skipped this run.
    pub failed: usize,
    /// Total points posted to user aggregates this run.
    pub points_awarded: i64,
}

impl CycleReport {
    /// Empty report for a run opening at `now` over `scanned` positions.
    pub fn begin(now: DateTime<Utc>, scanned: usize) -> Self {
        Self {
            cycle_id: Uuid::new_v4().to_string(),
            started_at: now,
            finished_at: now,
            scanned,
            accrued: 0,
            partial_unstakes: 0,
            full_unstakes: 0,
            deferred: 0,
            contended: 0,
            failed: 0,
            points_awarded: 0,
        }
    }
}
