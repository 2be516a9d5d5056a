#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use glyco_override_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, OverrideEventRecord, OverrideHistory,
    OverrideHistoryDelegate, ScheduleOverride,
};
use rusqlite::{params, Connection};

const OVERRIDE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_OVERRIDES_V1: &str = r"
CREATE TABLE IF NOT EXISTS override_events (
  position INTEGER PRIMARY KEY AUTOINCREMENT,
  override_json TEXT NOT NULL,
  end_date TEXT
);
";

/// Snapshot persistence for an [`OverrideHistory`]: the stored rows mirror
/// the history's raw records, in chronological order.
pub struct SqliteOverrideStore {
    conn: Connection,
}

#[derive(Debug)]
pub struct LoadedHistory {
    pub history: OverrideHistory,
    /// Rows dropped because their stored override or early-end timestamp no
    /// longer decodes. Mirrors the engine's tolerant raw-value decode.
    pub skipped_records: usize,
}

impl SqliteOverrideStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_OVERRIDES_V1)
            .context("failed to apply override schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![OVERRIDE_MIGRATION_VERSION, now],
            )
            .context("failed to register override schema migration")?;

        Ok(())
    }

    /// Replaces the stored snapshot with the history's current raw records.
    pub fn save_history(&mut self, history: &OverrideHistory) -> Result<()> {
        let records = history.raw_value();

        let tx = self
            .conn
            .transaction()
            .context("failed to start snapshot transaction")?;

        tx.execute("DELETE FROM override_events", [])
            .context("failed to clear previous snapshot")?;

        {
            let mut stmt = tx
                .prepare("INSERT INTO override_events(override_json, end_date) VALUES (?1, ?2)")
                .context("failed to prepare snapshot insert")?;

            for record in &records {
                let override_json = serde_json::to_string(&record.override_value)
                    .context("failed to serialize override")?;
                let end_date = record
                    .end_date
                    .map(format_rfc3339)
                    .transpose()
                    .map_err(|err| anyhow!(err.to_string()))?;

                stmt.execute(params![override_json, end_date])
                    .context("failed to insert override event row")?;
            }
        }

        tx.commit().context("failed to commit snapshot transaction")
    }

    /// Loads the stored snapshot in chronological order, skipping rows that
    /// no longer decode. Zero rows yields a valid empty history.
    pub fn load_history(&self) -> Result<LoadedHistory> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT override_json, end_date
                 FROM override_events
                 ORDER BY position ASC",
            )
            .context("failed to prepare snapshot query")?;

        let mut rows = stmt.query([]).context("failed to query snapshot rows")?;
        let mut records = Vec::new();
        let mut skipped_records = 0_usize;

        while let Some(row) = rows.next()? {
            let override_json: String = row.get(0)?;
            let end_date_raw: Option<String> = row.get(1)?;

            let Ok(override_value) = serde_json::from_str::<ScheduleOverride>(&override_json)
            else {
                skipped_records += 1;
                continue;
            };

            let end_date = match end_date_raw.as_deref().map(parse_rfc3339_utc).transpose() {
                Ok(value) => value,
                Err(_) => {
                    skipped_records += 1;
                    continue;
                }
            };

            records.push(OverrideEventRecord {
                override_value,
                end_date,
            });
        }

        Ok(LoadedHistory {
            history: OverrideHistory::from_raw_value(records),
            skipped_records,
        })
    }

    pub fn stored_event_count(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM override_events", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to count override event rows")?;

        usize::try_from(count).with_context(|| format!("invalid snapshot row count: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Delegate that writes the history back to its store on every mutation.
///
/// A delegate callback has no error channel, so a failed save is recorded
/// instead of propagated; owners should poll [`HistoryAutosaver::take_last_error`].
pub struct HistoryAutosaver {
    store: Mutex<SqliteOverrideStore>,
    last_error: Mutex<Option<String>>,
}

impl HistoryAutosaver {
    #[must_use]
    pub fn new(store: SqliteOverrideStore) -> Self {
        Self {
            store: Mutex::new(store),
            last_error: Mutex::new(None),
        }
    }

    pub fn take_last_error(&self) -> Option<String> {
        match self.last_error.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => Some("autosave error slot mutex poisoned".to_string()),
        }
    }
}

impl OverrideHistoryDelegate for HistoryAutosaver {
    fn override_history_did_update(&self, history: &OverrideHistory) {
        let result = match self.store.lock() {
            Ok(mut store) => store.save_history(history),
            Err(_) => Err(anyhow!("autosave store mutex poisoned")),
        };

        if let Err(err) = result {
            if let Ok(mut slot) = self.last_error.lock() {
                *slot = Some(err.to_string());
            }
        }
    }
}
