//! Stakepoints Engine Library
//!
//! Exposes the accrual calculator, balance oracle, reconciliation engine,
//! and SQLite store for use by the daemon binary and tests.

pub mod accrual;
pub mod config;
pub mod engine;
pub mod models;
pub mod oracle;
pub mod store;

pub use config::{Config, VerifyFailurePolicy};
pub use engine::{PositionOutcome, ReconciliationEngine};
pub use models::{CycleReport, StakingPosition, UserAccount};
