//! SQLite persistence for positions, user aggregates, and cycle history.
//!
//! All mutations the engine needs are expressed as single statements or a
//! single transaction, so one position's write either lands whole or not at
//! all. Timestamps are stored as integer milliseconds; the accrual guard
//! compares them for exact equality, so the representation must round-trip.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{CycleReport, StakingPosition, UserAccount};

/// Result of a conditional accrual write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccrualWrite {
    /// Position advanced and the user aggregate was incremented.
    Applied,
    /// The position moved under us (a concurrent run advanced or closed it
    /// first); nothing was written.
    Contended,
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS staking_positions (
    id TEXT PRIMARY KEY,
    wallet_address TEXT NOT NULL,
    staked_amount REAL NOT NULL,
    staking_start_ts INTEGER NOT NULL,
    last_reward_calc_ts INTEGER NOT NULL,
    last_verification_ts INTEGER,
    accumulated_points INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_positions_active
    ON staking_positions(is_active) WHERE is_active = 1;
CREATE INDEX IF NOT EXISTS idx_positions_wallet
    ON staking_positions(wallet_address);

CREATE TABLE IF NOT EXISTS users (
    wallet_address TEXT PRIMARY KEY,
    points INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS reward_cycles (
    id TEXT PRIMARY KEY,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    scanned INTEGER NOT NULL,
    accrued INTEGER NOT NULL,
    partial_unstakes INTEGER NOT NULL,
    full_unstakes INTEGER NOT NULL,
    deferred INTEGER NOT NULL,
    contended INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    points_awarded INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reward_cycles_started
    ON reward_cycles(started_at DESC);
";

const USER_INCREMENT_SQL: &str = "INSERT INTO users (wallet_address, points, updated_at)
     VALUES (?1, ?2, ?3)
     ON CONFLICT(wallet_address) DO UPDATE SET
        points = points + excluded.points,
        updated_at = excluded.updated_at";

const POSITION_COLUMNS: &str = "id, wallet_address, staked_amount, staking_start_ts, \
     last_reward_calc_ts, last_verification_ts, accumulated_points, is_active";

#[derive(Clone)]
pub struct RewardsDb {
    conn: Arc<Mutex<Connection>>,
}

impl RewardsDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open rewards db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(SCHEMA_SQL)
            .context("create rewards schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn upsert_position(&self, position: &StakingPosition) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO staking_positions \
             (id, wallet_address, staked_amount, staking_start_ts, last_reward_calc_ts, \
              last_verification_ts, accumulated_points, is_active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(id) DO UPDATE SET \
                wallet_address = excluded.wallet_address, \
                staked_amount = excluded.staked_amount, \
                staking_start_ts = excluded.staking_start_ts, \
                last_reward_calc_ts = excluded.last_reward_calc_ts, \
                last_verification_ts = excluded.last_verification_ts, \
                accumulated_points = excluded.accumulated_points, \
                is_active = excluded.is_active",
            params![
                &position.id,
                &position.wallet_address,
                position.staked_amount,
                to_millis(position.staking_start_ts),
                to_millis(position.last_reward_calc_ts),
                position.last_verification_ts.map(to_millis),
                position.accumulated_points,
                position.is_active,
            ],
        )
        .context("upsert staking position")?;
        Ok(())
    }

    pub async fn get_position(&self, id: &str) -> Result<Option<StakingPosition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM staking_positions WHERE id = ?1 LIMIT 1",
            POSITION_COLUMNS
        ))?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row_to_position(row)?))
    }

    pub async fn list_active_positions(&self) -> Result<Vec<StakingPosition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM staking_positions WHERE is_active = 1 ORDER BY staking_start_ts ASC",
            POSITION_COLUMNS
        ))?;

        let mut out = Vec::new();
        let rows = stmt.query_map([], row_to_position)?;
        for r in rows {
            if let Ok(p) = r {
                out.push(p);
            }
        }
        Ok(out)
    }

    /// Marks a fully-unstaked position inactive: balance zeroed, verification
    /// timestamp stamped, point totals and the accrual clock untouched.
    /// Returns false when the row was already inactive (an overlapping run
    /// got there first).
    pub async fn deactivate_position(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE staking_positions \
                 SET is_active = 0, staked_amount = 0, last_verification_ts = ?2 \
                 WHERE id = ?1 AND is_active = 1",
                params![id, to_millis(now)],
            )
            .context("deactivate staking position")?;
        Ok(changed == 1)
    }

    /// Applies one position's accrual as a single transaction: the position
    /// row advances only while its calculation timestamp still equals the
    /// value the engine read, and the user aggregate is incremented only when
    /// the row advanced. A stale timestamp means a concurrent run already
    /// covered the interval; the transaction rolls back untouched.
    ///
    /// `new_staked_amount` carries the verified balance on partial unstakes;
    /// `None` leaves the recorded amount in place.
    pub async fn apply_accrual(
        &self,
        position_id: &str,
        wallet_address: &str,
        expected_last_calc: DateTime<Utc>,
        new_staked_amount: Option<f64>,
        now: DateTime<Utc>,
        points: i64,
    ) -> Result<AccrualWrite> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin accrual transaction")?;

        let changed = tx
            .execute(
                "UPDATE staking_positions \
                 SET staked_amount = COALESCE(?4, staked_amount), \
                     last_reward_calc_ts = ?3, \
                     last_verification_ts = ?3, \
                     accumulated_points = accumulated_points + ?5 \
                 WHERE id = ?1 AND is_active = 1 AND last_reward_calc_ts = ?2",
                params![
                    position_id,
                    to_millis(expected_last_calc),
                    to_millis(now),
                    new_staked_amount,
                    points,
                ],
            )
            .context("advance staking position")?;

        if changed == 0 {
            // Dropping the transaction rolls it back.
            return Ok(AccrualWrite::Contended);
        }

        tx.execute(
            USER_INCREMENT_SQL,
            params![wallet_address, points, to_millis(now)],
        )
        .context("increment user points")?;

        tx.commit().context("commit accrual transaction")?;
        Ok(AccrualWrite::Applied)
    }

    /// Atomic add, never read-modify-write, so increments from positions
    /// sharing a wallet cannot lose updates.
    pub async fn increment_user_points(
        &self,
        wallet_address: &str,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(USER_INCREMENT_SQL, params![wallet_address, delta, to_millis(now)])
            .context("increment user points")?;
        Ok(())
    }

    pub async fn get_user(&self, wallet_address: &str) -> Result<Option<UserAccount>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT wallet_address, points, updated_at FROM users WHERE wallet_address = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query(params![wallet_address])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(UserAccount {
            wallet_address: row.get(0)?,
            points: row.get(1)?,
            updated_at: from_millis(row.get(2)?),
        }))
    }

    pub async fn get_user_points(&self, wallet_address: &str) -> Result<i64> {
        Ok(self
            .get_user(wallet_address)
            .await?
            .map(|u| u.points)
            .unwrap_or(0))
    }

    pub async fn list_users(&self, limit: usize) -> Result<Vec<UserAccount>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT wallet_address, points, updated_at FROM users \
             ORDER BY points DESC, wallet_address ASC LIMIT ?1",
        )?;

        let mut out = Vec::new();
        let rows = stmt.query_map(params![limit], |row| {
            Ok(UserAccount {
                wallet_address: row.get(0)?,
                points: row.get(1)?,
                updated_at: from_millis(row.get(2)?),
            })
        })?;
        for r in rows {
            if let Ok(u) = r {
                out.push(u);
            }
        }
        Ok(out)
    }

    pub async fn count_active_positions(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT COUNT(*) FROM staking_positions WHERE is_active = 1")?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count)
    }

    pub async fn record_cycle(&self, report: &CycleReport) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO reward_cycles \
             (id, started_at, finished_at, scanned, accrued, partial_unstakes, full_unstakes, \
              deferred, contended, failed, points_awarded) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &report.cycle_id,
                to_millis(report.started_at),
                to_millis(report.finished_at),
                report.scanned as i64,
                report.accrued as i64,
                report.partial_unstakes as i64,
                report.full_unstakes as i64,
                report.deferred as i64,
                report.contended as i64,
                report.failed as i64,
                report.points_awarded,
            ],
        )
        .context("record reward cycle")?;
        Ok(())
    }

    pub async fn list_recent_cycles(&self, limit: usize) -> Result<Vec<CycleReport>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, started_at, finished_at, scanned, accrued, partial_unstakes, \
                    full_unstakes, deferred, contended, failed, points_awarded \
             FROM reward_cycles ORDER BY started_at DESC LIMIT ?1",
        )?;

        let mut out = Vec::new();
        let rows = stmt.query_map(params![limit], |row| {
            Ok(CycleReport {
                cycle_id: row.get(0)?,
                started_at: from_millis(row.get(1)?),
                finished_at: from_millis(row.get(2)?),
                scanned: row.get::<_, i64>(3)? as usize,
                accrued: row.get::<_, i64>(4)? as usize,
                partial_unstakes: row.get::<_, i64>(5)? as usize,
                full_unstakes: row.get::<_, i64>(6)? as usize,
                deferred: row.get::<_, i64>(7)? as usize,
                contended: row.get::<_, i64>(8)? as usize,
                failed: row.get::<_, i64>(9)? as usize,
                points_awarded: row.get(10)?,
            })
        })?;
        for r in rows {
            if let Ok(c) = r {
                out.push(c);
            }
        }
        Ok(out)
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<StakingPosition> {
    let last_verification: Option<i64> = row.get(5)?;
    Ok(StakingPosition {
        id: row.get(0)?,
        wallet_address: row.get(1)?,
        staked_amount: row.get(2)?,
        staking_start_ts: from_millis(row.get(3)?),
        last_reward_calc_ts: from_millis(row.get(4)?),
        last_verification_ts: last_verification.map(from_millis),
        accumulated_points: row.get(6)?,
        is_active: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::NamedTempFile;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn create_test_db() -> (RewardsDb, NamedTempFile) {
        let tmp = NamedTempFile::new().expect("create temp db file");
        let db = RewardsDb::new(tmp.path().to_str().expect("temp path utf8"))
            .expect("open test db");
        (db, tmp)
    }

    #[tokio::test]
    async fn test_upsert_and_get_round_trip() {
        let (db, _tmp) = create_test_db();
        let now = t0();

        let mut position = StakingPosition::open("wallet-a", 50.0, now);
        position.last_verification_ts = Some(now);
        db.upsert_position(&position).await.unwrap();

        let loaded = db.get_position(&position.id).await.unwrap().unwrap();
        assert_eq!(loaded.wallet_address, "wallet-a");
        assert_eq!(loaded.staked_amount, 50.0);
        assert_eq!(loaded.staking_start_ts, now);
        assert_eq!(loaded.last_reward_calc_ts, now);
        assert_eq!(loaded.last_verification_ts, Some(now));
        assert_eq!(loaded.accumulated_points, 0);
        assert!(loaded.is_active);

        assert!(db.get_position("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_active_skips_inactive() {
        let (db, _tmp) = create_test_db();
        let now = t0();

        let open = StakingPosition::open("wallet-a", 10.0, now);
        let closed = StakingPosition::open("wallet-b", 20.0, now);
        db.upsert_position(&open).await.unwrap();
        db.upsert_position(&closed).await.unwrap();
        assert!(db.deactivate_position(&closed.id, now).await.unwrap());

        let active = db.list_active_positions().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, open.id);
        assert_eq!(db.count_active_positions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_zeroes_balance_but_leaves_points() {
        let (db, _tmp) = create_test_db();
        let start = t0();
        let now = start + Duration::hours(24);

        let mut position = StakingPosition::open("wallet-a", 75.0, start);
        position.accumulated_points = 1234;
        db.upsert_position(&position).await.unwrap();

        assert!(db.deactivate_position(&position.id, now).await.unwrap());

        let closed = db.get_position(&position.id).await.unwrap().unwrap();
        assert!(!closed.is_active);
        assert_eq!(closed.staked_amount, 0.0);
        assert_eq!(closed.last_verification_ts, Some(now));
        // Accrual history is untouched by a close.
        assert_eq!(closed.accumulated_points, 1234);
        assert_eq!(closed.last_reward_calc_ts, start);

        // Second close loses the condition: the row is already inactive.
        assert!(!db.deactivate_position(&position.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_accrual_advances_position_and_user() {
        let (db, _tmp) = create_test_db();
        let start = t0();
        let now = start + Duration::hours(1);

        let position = StakingPosition::open("wallet-a", 100.0, start);
        db.upsert_position(&position).await.unwrap();

        let write = db
            .apply_accrual(&position.id, "wallet-a", start, None, now, 1001)
            .await
            .unwrap();
        assert_eq!(write, AccrualWrite::Applied);

        let updated = db.get_position(&position.id).await.unwrap().unwrap();
        assert_eq!(updated.staked_amount, 100.0);
        assert_eq!(updated.last_reward_calc_ts, now);
        assert_eq!(updated.last_verification_ts, Some(now));
        assert_eq!(updated.accumulated_points, 1001);
        assert_eq!(db.get_user_points("wallet-a").await.unwrap(), 1001);
    }

    #[tokio::test]
    async fn test_apply_accrual_writes_back_partial_amount() {
        let (db, _tmp) = create_test_db();
        let start = t0();
        let now = start + Duration::hours(1);

        let position = StakingPosition::open("wallet-a", 50.0, start);
        db.upsert_position(&position).await.unwrap();

        let write = db
            .apply_accrual(&position.id, "wallet-a", start, Some(20.0), now, 500)
            .await
            .unwrap();
        assert_eq!(write, AccrualWrite::Applied);

        let updated = db.get_position(&position.id).await.unwrap().unwrap();
        assert_eq!(updated.staked_amount, 20.0);
        assert_eq!(updated.accumulated_points, 500);
    }

    #[tokio::test]
    async fn test_stale_expected_timestamp_is_contended() {
        let (db, _tmp) = create_test_db();
        let start = t0();
        let now = start + Duration::hours(1);

        let position = StakingPosition::open("wallet-a", 100.0, start);
        db.upsert_position(&position).await.unwrap();

        // A competing run already advanced the clock.
        let first = db
            .apply_accrual(&position.id, "wallet-a", start, None, now, 1001)
            .await
            .unwrap();
        assert_eq!(first, AccrualWrite::Applied);

        let second = db
            .apply_accrual(&position.id, "wallet-a", start, Some(1.0), now, 9999)
            .await
            .unwrap();
        assert_eq!(second, AccrualWrite::Contended);

        // The losing write left nothing behind: no position change, no points.
        let updated = db.get_position(&position.id).await.unwrap().unwrap();
        assert_eq!(updated.staked_amount, 100.0);
        assert_eq!(updated.accumulated_points, 1001);
        assert_eq!(db.get_user_points("wallet-a").await.unwrap(), 1001);
    }

    #[tokio::test]
    async fn test_accrual_on_inactive_position_is_contended() {
        let (db, _tmp) = create_test_db();
        let start = t0();
        let now = start + Duration::hours(1);

        let position = StakingPosition::open("wallet-a", 100.0, start);
        db.upsert_position(&position).await.unwrap();
        assert!(db.deactivate_position(&position.id, now).await.unwrap());

        let write = db
            .apply_accrual(&position.id, "wallet-a", start, None, now, 1001)
            .await
            .unwrap();
        assert_eq!(write, AccrualWrite::Contended);
        assert_eq!(db.get_user_points("wallet-a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_user_points_accumulate_across_positions() {
        let (db, _tmp) = create_test_db();
        let start = t0();
        let now = start + Duration::hours(1);

        let first = StakingPosition::open("wallet-a", 10.0, start);
        let second = StakingPosition::open("wallet-a", 30.0, start);
        db.upsert_position(&first).await.unwrap();
        db.upsert_position(&second).await.unwrap();

        db.apply_accrual(&first.id, "wallet-a", start, None, now, 100)
            .await
            .unwrap();
        db.apply_accrual(&second.id, "wallet-a", start, None, now, 300)
            .await
            .unwrap();
        db.increment_user_points("wallet-a", 5, now).await.unwrap();

        assert_eq!(db.get_user_points("wallet-a").await.unwrap(), 405);

        let users = db.list_users(10).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].points, 405);
    }

    #[tokio::test]
    async fn test_cycle_history_round_trip() {
        let (db, _tmp) = create_test_db();
        let started = t0();

        for (i, points) in [(0i64, 100i64), (1, 250)] {
            let report = CycleReport {
                cycle_id: format!("cycle-{}", i),
                started_at: started + Duration::hours(i),
                finished_at: started + Duration::hours(i) + Duration::seconds(30),
                scanned: 5,
                accrued: 3,
                partial_unstakes: 1,
                full_unstakes: 1,
                deferred: 0,
                contended: 0,
                failed: 0,
                points_awarded: points,
            };
            db.record_cycle(&report).await.unwrap();
        }

        let cycles = db.list_recent_cycles(10).await.unwrap();
        assert_eq!(cycles.len(), 2);
        // Newest first.
        assert_eq!(cycles[0].cycle_id, "cycle-1");
        assert_eq!(cycles[0].points_awarded, 250);
        assert_eq!(cycles[1].scanned, 5);
        assert_eq!(cycles[1].full_unstakes, 1);
    }
}
