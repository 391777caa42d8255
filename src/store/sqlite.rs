//! SQLite-backed [`ExperimentStore`].
//!
//! The `(experiment_id, visitor_id)` unique index is the idempotency anchor:
//! assignments go in with `INSERT ... ON CONFLICT DO NOTHING`, and counters are
//! bumped with `SET visitors = visitors + 1` in the same `IMMEDIATE`
//! transaction, so two processes sharing one database file also stay
//! consistent.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{AssignOutcome, ExperimentStore};
use crate::error::{ExperimentError, Result};
use crate::lifecycle;
use crate::model::{
    Assignment, Churn, ConfidenceLevel, Conversion, Experiment, ExperimentMetadata,
    ExperimentStatus, TargetPlan, TransitionAction, Variant,
};

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS experiments (
    id                      TEXT PRIMARY KEY,
    org_id                  TEXT NOT NULL,
    name                    TEXT NOT NULL,
    hypothesis              TEXT NOT NULL,
    target_plan_id          TEXT NOT NULL,
    target_plan_name        TEXT NOT NULL,
    target_plan_price_cents INTEGER,
    status                  TEXT NOT NULL,
    planned_duration_days   INTEGER NOT NULL,
    traffic_allocation      REAL NOT NULL,
    minimum_sample_size     INTEGER NOT NULL,
    confidence_level        REAL NOT NULL,
    created_at_ms           INTEGER NOT NULL,
    started_at_ms           INTEGER,
    ended_at_ms             INTEGER,
    metadata                TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_experiments_org ON experiments(org_id);

CREATE TABLE IF NOT EXISTS variants (
    id                   TEXT PRIMARY KEY,
    experiment_id        TEXT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    position             INTEGER NOT NULL,
    name                 TEXT NOT NULL,
    price_cents          INTEGER NOT NULL,
    original_price_cents INTEGER NOT NULL,
    is_control           INTEGER NOT NULL,
    visitors             INTEGER NOT NULL DEFAULT 0,
    conversions          INTEGER NOT NULL DEFAULT 0,
    churned              INTEGER NOT NULL DEFAULT 0,
    total_revenue_cents  INTEGER NOT NULL DEFAULT 0,
    CHECK (conversions <= visitors),
    CHECK (churned <= conversions)
);

CREATE TABLE IF NOT EXISTS assignments (
    id                       TEXT PRIMARY KEY,
    experiment_id            TEXT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    visitor_id               TEXT NOT NULL,
    variant_id               TEXT NOT NULL REFERENCES variants(id) ON DELETE CASCADE,
    assigned_at_ms           INTEGER NOT NULL,
    converted                INTEGER NOT NULL DEFAULT 0,
    converted_at_ms          INTEGER,
    customer_id              TEXT,
    subscription_id          TEXT,
    conversion_revenue_cents INTEGER,
    churned                  INTEGER NOT NULL DEFAULT 0,
    churned_at_ms            INTEGER,
    lifetime_revenue_cents   INTEGER,
    UNIQUE (experiment_id, visitor_id)
);
CREATE INDEX IF NOT EXISTS idx_assignments_customer ON assignments(experiment_id, customer_id);
"#;

const EXPERIMENT_COLUMNS: &str = "id, org_id, name, hypothesis, target_plan_id, target_plan_name, \
    target_plan_price_cents, status, planned_duration_days, traffic_allocation, \
    minimum_sample_size, confidence_level, created_at_ms, started_at_ms, ended_at_ms, metadata";

const VARIANT_COLUMNS: &str = "id, experiment_id, name, price_cents, original_price_cents, \
    is_control, visitors, conversions, churned, total_revenue_cents";

const ASSIGNMENT_COLUMNS: &str = "id, experiment_id, visitor_id, variant_id, assigned_at_ms, \
    converted, converted_at_ms, customer_id, subscription_id, conversion_revenue_cents, \
    churned, churned_at_ms, lifetime_revenue_cents";

// SQLite integers are signed; counters and timestamps never get near i64::MAX.
fn to_db(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_db(v: i64) -> u64 {
    v.max(0) as u64
}

fn opt_from_db(v: Option<i64>) -> Option<u64> {
    v.map(from_db)
}

fn conversion_failure(col: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

/// Experiment row without its variants.
fn experiment_from_row(row: &Row<'_>) -> rusqlite::Result<Experiment> {
    let status: String = row.get(7)?;
    let status = status
        .parse::<ExperimentStatus>()
        .map_err(|e| conversion_failure(7, e))?;
    let confidence: f64 = row.get(11)?;
    let confidence_level =
        ConfidenceLevel::try_from(confidence).map_err(|e| conversion_failure(11, e))?;
    let metadata: String = row.get(15)?;
    let metadata: ExperimentMetadata = serde_json::from_str(&metadata)
        .map_err(|e| conversion_failure(15, e.to_string()))?;

    Ok(Experiment {
        id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        hypothesis: row.get(3)?,
        target_plan: TargetPlan {
            id: row.get(4)?,
            name: row.get(5)?,
            price_cents: opt_from_db(row.get(6)?),
        },
        status,
        planned_duration_days: row.get::<_, i64>(8)?.clamp(0, u32::MAX as i64) as u32,
        traffic_allocation: row.get(9)?,
        minimum_sample_size: from_db(row.get(10)?),
        confidence_level,
        created_at_ms: from_db(row.get(12)?),
        started_at_ms: opt_from_db(row.get(13)?),
        ended_at_ms: opt_from_db(row.get(14)?),
        metadata,
        variants: Vec::new(),
    })
}

fn variant_from_row(row: &Row<'_>) -> rusqlite::Result<Variant> {
    Ok(Variant {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        name: row.get(2)?,
        price_cents: from_db(row.get(3)?),
        original_price_cents: from_db(row.get(4)?),
        is_control: row.get(5)?,
        visitors: from_db(row.get(6)?),
        conversions: from_db(row.get(7)?),
        churned: from_db(row.get(8)?),
        total_revenue_cents: from_db(row.get(9)?),
    })
}

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        visitor_id: row.get(2)?,
        variant_id: row.get(3)?,
        assigned_at_ms: from_db(row.get(4)?),
        converted: row.get(5)?,
        converted_at_ms: opt_from_db(row.get(6)?),
        customer_id: row.get(7)?,
        subscription_id: row.get(8)?,
        conversion_revenue_cents: opt_from_db(row.get(9)?),
        churned: row.get(10)?,
        churned_at_ms: opt_from_db(row.get(11)?),
        lifetime_revenue_cents: opt_from_db(row.get(12)?),
    })
}

fn load_variants(conn: &Connection, experiment_id: &str) -> Result<Vec<Variant>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {VARIANT_COLUMNS} FROM variants WHERE experiment_id = ?1 ORDER BY position"
    ))?;
    let variants = stmt
        .query_map(params![experiment_id], variant_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(variants)
}

fn load_experiment(conn: &Connection, id: &str) -> Result<Option<Experiment>> {
    let experiment = conn
        .query_row(
            &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE id = ?1"),
            params![id],
            experiment_from_row,
        )
        .optional()?;
    match experiment {
        Some(mut e) => {
            e.variants = load_variants(conn, &e.id)?;
            Ok(Some(e))
        }
        None => Ok(None),
    }
}

fn load_status(conn: &Connection, id: &str) -> Result<ExperimentStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM experiments WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    let status = status
        .ok_or_else(|| ExperimentError::not_found(id))?
        .parse::<ExperimentStatus>()
        .map_err(|e| conversion_failure(0, e))?;
    Ok(status)
}

fn load_assignment(
    conn: &Connection,
    experiment_id: &str,
    visitor_id: &str,
) -> Result<Option<Assignment>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM assignments \
                 WHERE experiment_id = ?1 AND visitor_id = ?2"
            ),
            params![experiment_id, visitor_id],
            assignment_from_row,
        )
        .optional()?)
}

/// Durable store over a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        // journal_mode answers with a row, so it cannot go through execute_batch
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl ExperimentStore for SqliteStore {
    fn insert_experiment(&self, experiment: &Experiment) -> Result<()> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            &format!(
                "INSERT INTO experiments ({EXPERIMENT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                experiment.id,
                experiment.org_id,
                experiment.name,
                experiment.hypothesis,
                experiment.target_plan.id,
                experiment.target_plan.name,
                experiment.target_plan.price_cents.map(to_db),
                experiment.status.as_str(),
                experiment.planned_duration_days,
                experiment.traffic_allocation,
                to_db(experiment.minimum_sample_size),
                experiment.confidence_level.value(),
                to_db(experiment.created_at_ms),
                experiment.started_at_ms.map(to_db),
                experiment.ended_at_ms.map(to_db),
                serde_json::to_string(&experiment.metadata)?,
            ],
        )?;
        for (position, v) in experiment.variants.iter().enumerate() {
            tx.execute(
                &format!(
                    "INSERT INTO variants (position, {VARIANT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    position as i64,
                    v.id,
                    experiment.id,
                    v.name,
                    to_db(v.price_cents),
                    to_db(v.original_price_cents),
                    v.is_control,
                    to_db(v.visitors),
                    to_db(v.conversions),
                    to_db(v.churned),
                    to_db(v.total_revenue_cents),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        let conn = self.conn.lock()?;
        load_experiment(&conn, id)
    }

    fn list_experiments(&self, org_id: &str) -> Result<Vec<Experiment>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE org_id = ?1 \
             ORDER BY created_at_ms DESC, rowid DESC"
        ))?;
        let mut experiments = stmt
            .query_map(params![org_id], experiment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for e in &mut experiments {
            e.variants = load_variants(&conn, &e.id)?;
        }
        Ok(experiments)
    }

    fn transition(&self, id: &str, action: TransitionAction, now_ms: u64) -> Result<Experiment> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut experiment =
            load_experiment(&tx, id)?.ok_or_else(|| ExperimentError::not_found(id))?;
        lifecycle::apply(&mut experiment, action, now_ms)?;
        tx.execute(
            "UPDATE experiments SET status = ?1, started_at_ms = ?2, ended_at_ms = ?3 \
             WHERE id = ?4",
            params![
                experiment.status.as_str(),
                experiment.started_at_ms.map(to_db),
                experiment.ended_at_ms.map(to_db),
                id,
            ],
        )?;
        tx.commit()?;
        Ok(experiment)
    }

    fn delete_experiment(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        lifecycle::ensure_deletable(load_status(&tx, id)?)?;
        tx.execute(
            "DELETE FROM experiments WHERE id = ?1 AND status = 'DRAFT'",
            params![id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn find_assignment(
        &self,
        experiment_id: &str,
        visitor_id: &str,
    ) -> Result<Option<Assignment>> {
        let conn = self.conn.lock()?;
        load_assignment(&conn, experiment_id, visitor_id)
    }

    fn insert_assignment(&self, assignment: Assignment) -> Result<AssignOutcome> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status = load_status(&tx, &assignment.experiment_id)?;
        if status != ExperimentStatus::Running {
            return Ok(AssignOutcome::NotRunning(status));
        }

        let owned: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM variants WHERE id = ?1 AND experiment_id = ?2",
                params![assignment.variant_id, assignment.experiment_id],
                |r| r.get(0),
            )
            .optional()?;
        if owned.is_none() {
            return Err(ExperimentError::Validation(format!(
                "variant '{}' does not belong to experiment '{}'",
                assignment.variant_id, assignment.experiment_id
            )));
        }

        let inserted = tx.execute(
            &format!(
                "INSERT INTO assignments ({ASSIGNMENT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, NULL, NULL, NULL, 0, NULL, NULL) \
                 ON CONFLICT (experiment_id, visitor_id) DO NOTHING"
            ),
            params![
                assignment.id,
                assignment.experiment_id,
                assignment.visitor_id,
                assignment.variant_id,
                to_db(assignment.assigned_at_ms),
            ],
        )?;
        if inserted == 1 {
            tx.execute(
                "UPDATE variants SET visitors = visitors + 1 WHERE id = ?1",
                params![assignment.variant_id],
            )?;
        }

        let stored = load_assignment(&tx, &assignment.experiment_id, &assignment.visitor_id)?
            .ok_or_else(|| ExperimentError::not_found(&assignment.experiment_id))?;
        tx.commit()?;
        Ok(if inserted == 1 {
            AssignOutcome::Inserted(stored)
        } else {
            AssignOutcome::Existing(stored)
        })
    }

    fn mark_converted(
        &self,
        experiment_id: &str,
        visitor_id: &str,
        conversion: &Conversion,
    ) -> Result<Option<Assignment>> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !load_status(&tx, experiment_id)?.accepts_outcomes() {
            return Ok(None);
        }
        let changed = tx.execute(
            "UPDATE assignments SET converted = 1, converted_at_ms = ?1, customer_id = ?2, \
             subscription_id = ?3, conversion_revenue_cents = ?4 \
             WHERE experiment_id = ?5 AND visitor_id = ?6 AND converted = 0",
            params![
                to_db(conversion.converted_at_ms),
                conversion.customer_id,
                conversion.subscription_id,
                to_db(conversion.revenue_cents),
                experiment_id,
                visitor_id,
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        let Some(updated) = load_assignment(&tx, experiment_id, visitor_id)? else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE variants SET conversions = conversions + 1, \
             total_revenue_cents = MIN(total_revenue_cents + ?1, 9223372036854775807) \
             WHERE id = ?2",
            params![to_db(conversion.revenue_cents), updated.variant_id],
        )?;
        tx.commit()?;
        Ok(Some(updated))
    }

    fn mark_churned(
        &self,
        experiment_id: &str,
        customer_id: &str,
        churn: Churn,
    ) -> Result<Option<Assignment>> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !load_status(&tx, experiment_id)?.accepts_outcomes() {
            return Ok(None);
        }
        let target: Option<(String, String)> = tx
            .query_row(
                "SELECT visitor_id, variant_id FROM assignments \
                 WHERE experiment_id = ?1 AND customer_id = ?2 AND converted = 1 AND churned = 0 \
                 ORDER BY converted_at_ms DESC, rowid DESC LIMIT 1",
                params![experiment_id, customer_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((visitor_id, variant_id)) = target else {
            return Ok(None);
        };

        let changed = tx.execute(
            "UPDATE assignments SET churned = 1, churned_at_ms = ?1, lifetime_revenue_cents = ?2 \
             WHERE experiment_id = ?3 AND visitor_id = ?4 AND churned = 0",
            params![
                to_db(churn.churned_at_ms),
                to_db(churn.lifetime_revenue_cents),
                experiment_id,
                visitor_id,
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        tx.execute(
            "UPDATE variants SET churned = churned + 1 WHERE id = ?1",
            params![variant_id],
        )?;
        let updated = load_assignment(&tx, experiment_id, &visitor_id)?;
        tx.commit()?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
    }

    #[test]
    fn test_unique_visitor_index_enforced_by_schema() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        let idx: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master \
                 WHERE type = 'index' AND tbl_name = 'assignments'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        // the UNIQUE constraint's autoindex plus the customer index
        assert!(idx >= 2, "indexes={idx}");
    }

    #[test]
    fn test_to_db_saturates() {
        assert_eq!(to_db(u64::MAX), i64::MAX);
        assert_eq!(from_db(-5), 0);
    }
}
