//! SQLite persistence layer.
//!
//! RULE: Only store.rs talks to the database.
//! The engine calls store methods; it never executes SQL directly.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    capture::CaptureSet,
    error::SimResult,
    output::{OutputLog, OutputRow},
    types::{RegionId, StepIndex},
};

pub struct SimStore {
    conn: Connection,
}

impl SimStore {
    /// Open (or create) the simulation database at `path`.
    pub fn open(path: &str) -> SimResult<Self> {
        let conn = Connection::open(path)?;
        // WAL mode: better concurrent read performance.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> SimResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> SimResult<()> {
        self.conn.execute_batch(include_str!("../../migrations/001_foundation.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(&self, run_id: &str, version: &str) -> SimResult<()> {
        self.conn.execute(
            "INSERT INTO run (run_id, version, started_at) VALUES (?1, ?2, ?3)",
            params![run_id, version, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn run_exists(&self, run_id: &str) -> SimResult<bool> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM run WHERE run_id = ?1", params![run_id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    // ── Output ─────────────────────────────────────────────────

    /// Persist `rows` in one transaction, one record per region × attribute.
    pub fn append_output_rows(&self, run_id: &str, log: &OutputLog, rows: &[OutputRow]) -> SimResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO output (run_id, step, time, region, attribute, value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let width = log.capture().len();
            for row in rows {
                for (r, region) in log.regions().iter().enumerate() {
                    for (a, attribute) in log.capture().iter().enumerate() {
                        stmt.execute(params![
                            run_id,
                            row.step as i64,
                            row.time,
                            region,
                            attribute,
                            row.values[r * width + a],
                        ])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn last_output_step(&self, run_id: &str) -> SimResult<Option<StepIndex>> {
        let step: Option<i64> = self.conn.query_row(
            "SELECT MAX(step) FROM output WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(step.map(|s| s as u64))
    }

    /// Reassemble stored output into log rows for `regions` × `capture`.
    /// Missing or NULL values (SQLite stores NaN as NULL) come back as NaN.
    pub fn output_rows(
        &self,
        run_id: &str,
        regions: &[RegionId],
        capture: &CaptureSet,
    ) -> SimResult<Vec<OutputRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT step, time, region, attribute, value
             FROM output WHERE run_id = ?1
             ORDER BY step ASC",
        )?;
        let records = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let width = capture.len();
        let mut rows: BTreeMap<StepIndex, OutputRow> = BTreeMap::new();
        for (step, time, region, attribute, value) in records {
            let row = rows.entry(step).or_insert_with(|| OutputRow {
                step,
                time,
                values: vec![f64::NAN; regions.len() * width],
            });
            let r = regions.iter().position(|id| *id == region);
            let a = capture.position(&attribute);
            if let (Some(r), Some(a)) = (r, a) {
                row.values[r * width + a] = value.unwrap_or(f64::NAN);
            }
        }
        Ok(rows.into_values().collect())
    }

    // ── Snapshot ───────────────────────────────────────────────

    pub fn save_snapshot(&self, run_id: &str, step: StepIndex, state_json: &str) -> SimResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO snapshot (run_id, step, state_json) VALUES (?1, ?2, ?3)",
            params![run_id, step as i64, state_json],
        )?;
        Ok(())
    }

    pub fn latest_snapshot(&self, run_id: &str) -> SimResult<Option<(StepIndex, String)>> {
        let result = self
            .conn
            .query_row(
                "SELECT step, state_json FROM snapshot
                 WHERE run_id = ?1
                 ORDER BY step DESC LIMIT 1",
                params![run_id],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(result)
    }
}
