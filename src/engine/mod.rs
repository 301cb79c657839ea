//! Reward reconciliation engine.
//!
//! One cycle walks every active position, asks the balance oracle what the
//! wallet actually holds, classifies the answer against the recorded stake,
//! and settles points. Positions are processed in parallel under a
//! verification semaphore; each one succeeds or fails on its own.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::accrual::accrue_points;
use crate::config::VerifyFailurePolicy;
use crate::models::{CycleReport, StakingPosition};
use crate::oracle::{BalanceVerifier, Verification};
use crate::store::{AccrualWrite, RewardsDb};


/// Classification of a verified on-chain balance against the recorded stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceState {
    /// Wallet no longer holds the mint.
    FullyUnstaked,
    /// Wallet holds less than the recorded stake.
    PartiallyUnstaked,
    /// Wallet holds the recorded stake or more.
    Unchanged,
}

/// A balance equal to the recorded stake is unchanged; only a strict
/// decrease counts as a withdrawal.
pub fn classify(verified: f64, staked: f64) -> BalanceState {
    if verified <= 0.0 {
        BalanceState::FullyUnstaked
    } else if verified < staked {
        BalanceState::PartiallyUnstaked
    } else {
        BalanceState::Unchanged
    }
}

/// What one position contributed to a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionOutcome {
    /// Balance intact; points accrued at the recorded amount.
    Accrued { points: i64 },
    /// Part of the stake left the wallet; points accrued at the old amount,
    /// then the verified balance was written back.
    PartialUnstake { points: i64 },
    /// Wallet emptied; position closed, trailing interval forfeited.
    FullyUnstaked,
    /// No usable oracle answer; position left untouched for the next cycle.
    Deferred,
    /// A concurrent run advanced the position first; nothing was written.
    Contended,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: RewardsDb,
    verifier: Arc<dyn BalanceVerifier>,
    policy: VerifyFailurePolicy,
    verify_sem: Arc<Semaphore>,
}

impl ReconciliationEngine {
    pub fn new(
        store: RewardsDb,
        verifier: Arc<dyn BalanceVerifier>,
        policy: VerifyFailurePolicy,
        max_concurrent_verifications: usize,
    ) -> Self {
        Self {
            store,
            verifier,
            policy,
            verify_sem: Arc::new(Semaphore::new(max_concurrent_verifications.max(1))),
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Runs one reconciliation pass with `now` pinned, so every position in
    /// the cycle accrues up to the same closing instant.
    ///
    /// Failing to list positions aborts the run; everything after that is
    /// per-position and lands in the report's failed count instead.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let positions = self
            .store
            .list_active_positions()
            .await
            .context("list active positions")?;
        let mut report = CycleReport::begin(now, positions.len());
        info!(positions = report.scanned, "🔄 Starting reward cycle");

        let mut handles = Vec::with_capacity(positions.len());
        for position in positions {
            let engine = self.clone();
            let id = position.id.clone();
            let handle = tokio::spawn(async move {
                engine.process_position(&position, now).await
            });
            handles.push((id, handle));
        }

        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(PositionOutcome::Accrued { points })) => {
                    report.accrued += 1;
                    report.points_awarded += points;
                }
                Ok(Ok(PositionOutcome::PartialUnstake { points })) => {
                    report.partial_unstakes += 1;
                    report.points_awarded += points;
                }
                Ok(Ok(PositionOutcome::FullyUnstaked)) => report.full_unstakes += 1,
                Ok(Ok(PositionOutcome::Deferred)) => report.deferred += 1,
                Ok(Ok(PositionOutcome::Contended)) => report.contended += 1,
                Ok(Err(e)) => {
                    warn!(position = %id, error = %e, "⚠️ Position reconciliation failed");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(position = %id, error = %e, "⚠️ Reconciliation task panicked");
                    report.failed += 1;
                }
            }
        }

        report.finished_at = Utc::now();
        if let Err(e) = self.store.record_cycle(&report).await {
            warn!(error = %e, "⚠️ Failed to record cycle history");
        }

        info!(
            scanned = report.scanned,
            accrued = report.accrued,
            partial = report.partial_unstakes,
            full = report.full_unstakes,
            deferred = report.deferred,
            contended = report.contended,
            failed = report.failed,
            points = report.points_awarded,
            "✅ Reward cycle complete"
        );
        Ok(report)
    }

    /// Reconciles a single position at the pinned instant.
    async fn process_position(
        &self,
        position: &StakingPosition,
        now: DateTime<Utc>,
    ) -> Result<PositionOutcome> {
        // A cycle pinned behind the position clock cannot settle anything
        // without regressing it; leave the row for a later cycle.
        if now < position.last_reward_calc_ts {
            warn!(
                position = %position.id,
                "cycle instant predates last calculation, deferring"
            );
            return Ok(PositionOutcome::Deferred);
        }

        let verification = {
            let _permit = self.verify_sem.acquire().await.context("semaphore")?;
            self.verifier.verify(&position.wallet_address).await
        };

        let verified = match verification {
            Verification::Balance(amount) => amount,
            Verification::Unavailable(reason) => match self.policy {
                VerifyFailurePolicy::Defer => {
                    debug!(
                        position = %position.id,
                        wallet = %position.wallet_address,
                        %reason,
                        "oracle unavailable, deferring accrual"
                    );
                    return Ok(PositionOutcome::Deferred);
                }
                VerifyFailurePolicy::AssumeUnstaked => {
                    warn!(
                        position = %position.id,
                        wallet = %position.wallet_address,
                        %reason,
                        "oracle unavailable, treating wallet as unstaked by policy"
                    );
                    0.0
                }
            },
        };

        match classify(verified, position.staked_amount) {
            BalanceState::FullyUnstaked => {
                // Closing never touches earned points or the accrual clock.
                if self.store.deactivate_position(&position.id, now).await? {
                    Ok(PositionOutcome::FullyUnstaked)
                } else {
                    Ok(PositionOutcome::Contended)
                }
            }
            BalanceState::PartiallyUnstaked => {
                // The interval being settled was staked at the recorded
                // amount; the verified balance applies from `now` forward.
                let points = accrue_points(
                    position.staked_amount,
                    position.staking_start_ts,
                    position.last_reward_calc_ts,
                    now,
                );
                let write = self
                    .store
                    .apply_accrual(
                        &position.id,
                        &position.wallet_address,
                        position.last_reward_calc_ts,
                        Some(verified),
                        now,
                        points,
                    )
                    .await?;
                match write {
                    AccrualWrite::Applied => Ok(PositionOutcome::PartialUnstake { points }),
                    AccrualWrite::Contended => Ok(PositionOutcome::Contended),
                }
            }
            BalanceState::Unchanged => {
                let points = accrue_points(
                    position.staked_amount,
                    position.staking_start_ts,
                    position.last_reward_calc_ts,
                    now,
                );
                let write = self
                    .store
                    .apply_accrual(
                        &position.id,
                        &position.wallet_address,
                        position.last_reward_calc_ts,
                        None,
                        now,
                        points,
                    )
                    .await?;
                match write {
                    AccrualWrite::Applied => Ok(PositionOutcome::Accrued { points }),
                    AccrualWrite::Contended => Ok(PositionOutcome::Contended),
                }
            }
        }
    }
}
