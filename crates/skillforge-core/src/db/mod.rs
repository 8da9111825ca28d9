//! SQLite database operations for skillforge
//!
//! Owns the `activities` / `activity_state_history` schema. The rest of the
//! application database is opaque to the core and only travels through
//! snapshots and restores.

use chrono::{Local, NaiveDate, NaiveDateTime};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Result as SqliteResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::types::{Activity, ActivityState, StateHistoryEntry, TransitionOutcome};

const SCHEMA: &str = r#"
-- Activities (owned by the CRUD layer; the core reads/writes state only)
CREATE TABLE IF NOT EXISTS activities (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  state TEXT NOT NULL DEFAULT 'draft',
  scheduled_date TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activities_state_date ON activities(state, scheduled_date);

-- State history (append-only)
CREATE TABLE IF NOT EXISTS activity_state_history (
  id TEXT PRIMARY KEY,
  activity_id TEXT NOT NULL,
  state TEXT NOT NULL,
  timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_activity ON activity_state_history(activity_id);
"#;

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Stored states written by anything other than the core are rejected, never
/// guessed.
impl FromSql for ActivityState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        ActivityState::from_str(raw)
            .ok_or_else(|| FromSqlError::Other(format!("unknown activity state '{}'", raw).into()))
    }
}

/// SQLite database handle shared by the transition engine and the control
/// facade.
pub struct ForgeDB {
    conn: std::sync::Mutex<Connection>,
    /// `None` for in-memory databases
    path: Option<PathBuf>,
    /// Set when reattaching after `detached` failed; the next caller reopens
    needs_reopen: AtomicBool,
}

impl ForgeDB {
    /// Open (or create) the database file and apply the schema
    pub fn open<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Self::connect(&path)?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
            path: Some(path),
            needs_reopen: AtomicBool::new(false),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
            path: None,
            needs_reopen: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn connect(path: &Path) -> SqliteResult<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(&conn)?;
        Ok(conn)
    }

    /// Get a lock on the database connection, reopening the file first if
    /// the last reattach failed
    fn conn(&self) -> SqliteResult<std::sync::MutexGuard<'_, Connection>> {
        let mut guard = self.conn.lock().expect("ForgeDB mutex poisoned");
        if self.needs_reopen.load(Ordering::Acquire) {
            let path = self
                .path
                .as_deref()
                .ok_or_else(|| rusqlite::Error::InvalidPath(":memory:".into()))?;
            *guard = Self::connect(path)?;
            self.needs_reopen.store(false, Ordering::Release);
            tracing::info!(path = %path.display(), "Database connection reopened");
        }
        Ok(guard)
    }

    fn init(conn: &Connection) -> SqliteResult<()> {
        conn.execute_batch(SCHEMA)?;
        Self::migrate(conn)
    }

    /// Run schema migrations for existing databases (also applied after a
    /// restore, since the backup may predate a column)
    fn migrate(conn: &Connection) -> SqliteResult<()> {
        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(activity_state_history)")?
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();

        if !columns.iter().any(|c| c == "meta") {
            conn.execute_batch("ALTER TABLE activity_state_history ADD COLUMN meta TEXT;")?;
        }

        // Same activity, same state, same second = same logical transition
        conn.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_history_logical
             ON activity_state_history(activity_id, state, timestamp);",
        )?;
        Ok(())
    }

    /// Close the live connection, run `f`, then reopen the file.
    ///
    /// Used by restore: the file under the connection is replaced while no
    /// handle is open on it. The connection is reopened even when `f` fails.
    pub fn detached<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| CoreError::Sqlite(rusqlite::Error::InvalidPath(":memory:".into())))?;

        // Not `conn()`: a restore must still work when the last reopen failed
        let mut guard = self.conn.lock().expect("ForgeDB mutex poisoned");
        let live = std::mem::replace(&mut *guard, Connection::open_in_memory()?);
        if let Err((conn, e)) = live.close() {
            *guard = conn;
            return Err(e.into());
        }
        tracing::debug!(path = %path.display(), "Database connection detached");

        let result = f();

        match Self::connect(&path) {
            Ok(conn) => {
                *guard = conn;
                self.needs_reopen.store(false, Ordering::Release);
            }
            Err(e) => {
                // The placeholder has no schema; never serve it
                self.needs_reopen.store(true, Ordering::Release);
                tracing::error!(path = %path.display(), error = %e, "Failed to reopen database");
                return Err(result.err().unwrap_or_else(|| e.into()));
            }
        }
        tracing::debug!(path = %path.display(), "Database connection reattached");
        result
    }

    // ============ Activities ============

    /// Insert a new activity in DRAFT with its initial history row
    pub fn create_activity(&self, name: &str, scheduled_date: Option<&str>) -> SqliteResult<Activity> {
        let id = Uuid::new_v4().to_string();
        let now = format_ts(Local::now().naive_local());
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO activities (id, name, state, scheduled_date, created_at, updated_at)
             VALUES (?1, ?2, 'draft', ?3, ?4, ?4)",
            params![id, name, scheduled_date, now],
        )?;
        tx.execute(
            "INSERT INTO activity_state_history (id, activity_id, state, timestamp)
             VALUES (?1, ?2, 'draft', ?3)",
            params![Uuid::new_v4().to_string(), id, now],
        )?;
        tx.commit()?;
        drop(conn);

        self.get_activity(&id)?
            .ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    /// Get an activity by ID
    pub fn get_activity(&self, id: &str) -> SqliteResult<Option<Activity>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM activities WHERE id = ?1",
            params![id],
            |row| Self::row_to_activity(row),
        )
        .optional()
    }

    /// List activities in a given state, oldest first
    pub fn list_activities_by_state(&self, state: ActivityState) -> SqliteResult<Vec<Activity>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM activities WHERE state = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![state.as_str()], |row| Self::row_to_activity(row))?;
        let mut activities = Vec::new();
        for activity in rows {
            activities.push(activity?);
        }
        Ok(activities)
    }

    /// Move an activity along a permitted edge and record it in history
    pub fn transition_activity(
        &self,
        id: &str,
        to: ActivityState,
        meta: Option<&serde_json::Value>,
    ) -> Result<Activity> {
        let now = Local::now().naive_local();
        self.transition_activity_at(id, to, meta, None, now)
    }

    /// Set the scheduled date and perform ANALYZED -> SCHEDULED
    pub fn schedule_activity(&self, id: &str, date: NaiveDate) -> Result<Activity> {
        let now = Local::now().naive_local();
        let date = date.format("%Y-%m-%d").to_string();
        self.transition_activity_at(id, ActivityState::Scheduled, None, Some(&date), now)
    }

    fn transition_activity_at(
        &self,
        id: &str,
        to: ActivityState,
        meta: Option<&serde_json::Value>,
        scheduled_date: Option<&str>,
        now: NaiveDateTime,
    ) -> Result<Activity> {
        let ts = format_ts(now);
        let meta = meta.map(|m| m.to_string());
        {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT state FROM activities WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let current = current.ok_or_else(|| CoreError::ActivityNotFound(id.to_string()))?;
            let from = ActivityState::from_str(&current)
                .ok_or_else(|| CoreError::UnknownState(current.clone()))?;
            if !from.can_transition_to(to) {
                return Err(CoreError::IllegalTransition { from, to });
            }

            tx.execute(
                "UPDATE activities
                 SET state = ?1, scheduled_date = COALESCE(?2, scheduled_date), updated_at = ?3
                 WHERE id = ?4",
                params![to.as_str(), scheduled_date, ts, id],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO activity_state_history (id, activity_id, state, timestamp, meta)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![Uuid::new_v4().to_string(), id, to.as_str(), ts, meta],
            )?;
            tx.commit()?;
        }
        tracing::debug!(activity_id = %id, state = %to, "Activity transitioned");

        self.get_activity(id)?
            .ok_or_else(|| CoreError::ActivityNotFound(id.to_string()))
    }

    /// History rows for an activity in insertion order
    pub fn activity_history(&self, activity_id: &str) -> SqliteResult<Vec<StateHistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM activity_state_history WHERE activity_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![activity_id], |row| Self::row_to_history(row))?;
        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }

    // ============ Scheduled transitions ============

    /// Advance every SCHEDULED activity whose date is on or before `today`
    /// to PENDING_REVIEW, in one transaction.
    ///
    /// Comparison is date-only, on the calendar date as written: a time part
    /// or UTC offset never shifts the day. A history insert that hits the
    /// uniqueness constraint is treated as already recorded.
    pub fn advance_due_scheduled(
        &self,
        today: NaiveDate,
        now: NaiveDateTime,
    ) -> SqliteResult<TransitionOutcome> {
        let today = today.format("%Y-%m-%d").to_string();
        let ts = format_ts(now);
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM activities
                 WHERE state = 'scheduled'
                   AND scheduled_date IS NOT NULL
                   AND trim(scheduled_date) <> ''
                   AND date(substr(trim(scheduled_date), 1, 10)) <= ?1
                 ORDER BY scheduled_date ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![today], |row| row.get(0))?;
            rows.collect::<SqliteResult<_>>()?
        };

        if ids.is_empty() {
            // Nothing due: drop the transaction without writing
            return Ok(TransitionOutcome::default());
        }

        {
            let mut update = tx.prepare(
                "UPDATE activities SET state = 'pending_review', updated_at = ?1 WHERE id = ?2",
            )?;
            let mut insert_history = tx.prepare(
                "INSERT INTO activity_state_history (id, activity_id, state, timestamp)
                 VALUES (?1, ?2, 'pending_review', ?3)",
            )?;
            for id in &ids {
                update.execute(params![ts, id])?;
                match insert_history.execute(params![Uuid::new_v4().to_string(), id, ts]) {
                    Ok(_) => {}
                    Err(e) if is_constraint_violation(&e) => {
                        tracing::debug!(activity_id = %id, "History row already recorded");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        tx.commit()?;

        Ok(TransitionOutcome {
            count: ids.len(),
            ids,
        })
    }

    // ============ Row mapping ============

    fn row_to_activity(row: &rusqlite::Row) -> SqliteResult<Activity> {
        Ok(Activity {
            id: row.get("id")?,
            name: row.get("name")?,
            state: row.get("state")?,
            scheduled_date: row.get("scheduled_date")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_history(row: &rusqlite::Row) -> SqliteResult<StateHistoryEntry> {
        let meta: Option<String> = row.get("meta")?;
        Ok(StateHistoryEntry {
            id: row.get("id")?,
            activity_id: row.get("activity_id")?,
            state: row.get("state")?,
            timestamp: row.get("timestamp")?,
            meta: meta.and_then(|m| serde_json::from_str(&m).ok()),
        })
    }

    /// Direct insert used by fixtures that need a specific state/date
    #[cfg(test)]
    pub(crate) fn insert_activity_raw(
        &self,
        id: &str,
        state: ActivityState,
        scheduled_date: Option<&str>,
    ) -> SqliteResult<()> {
        let now = format_ts(Local::now().naive_local());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO activities (id, name, state, scheduled_date, created_at, updated_at)
             VALUES (?1, ?1, ?2, ?3, ?4, ?4)",
            params![id, state.as_str(), scheduled_date, now],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn insert_history_raw(
        &self,
        activity_id: &str,
        state: ActivityState,
        timestamp: NaiveDateTime,
    ) -> SqliteResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO activity_state_history (id, activity_id, state, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![Uuid::new_v4().to_string(), activity_id, state.as_str(), format_ts(timestamp)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveTime};

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn at(date: &str, hms: &str) -> NaiveDateTime {
        day(date).and_time(NaiveTime::parse_from_str(hms, "%H:%M:%S").unwrap())
    }

    #[test]
    fn test_create_and_get_activity() {
        let db = ForgeDB::in_memory().unwrap();
        let activity = db.create_activity("Lab report", None).unwrap();

        let retrieved = db.get_activity(&activity.id).unwrap().unwrap();
        assert_eq!(retrieved.name, "Lab report");
        assert_eq!(retrieved.state, ActivityState::Draft);

        let history = db.activity_history(&activity.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, ActivityState::Draft);
    }

    #[test]
    fn test_transition_follows_table() {
        let db = ForgeDB::in_memory().unwrap();
        let a = db.create_activity("Essay", None).unwrap();

        let a = db.transition_activity(&a.id, ActivityState::Analyzed, None).unwrap();
        assert_eq!(a.state, ActivityState::Analyzed);

        let err = db
            .transition_activity(&a.id, ActivityState::Evaluated, None)
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::IllegalTransition {
                from: ActivityState::Analyzed,
                to: ActivityState::Evaluated
            }
        ));
        // Rejected transition leaves no trace
        assert_eq!(db.activity_history(&a.id).unwrap().len(), 2);
        assert_eq!(
            db.get_activity(&a.id).unwrap().unwrap().state,
            ActivityState::Analyzed
        );
    }

    #[test]
    fn test_transition_unknown_activity() {
        let db = ForgeDB::in_memory().unwrap();
        let err = db
            .transition_activity("missing", ActivityState::Analyzed, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::ActivityNotFound(id) if id == "missing"));
    }

    #[test]
    fn test_transition_rejects_unknown_stored_state() {
        let db = ForgeDB::in_memory().unwrap();
        db.conn()
            .unwrap()
            .execute(
                "INSERT INTO activities (id, name, state, created_at, updated_at)
                 VALUES ('X', 'Legacy', 'evaluada', '2026-03-01 08:00:00', '2026-03-01 08:00:00')",
                [],
            )
            .unwrap();

        let err = db
            .transition_activity("X", ActivityState::Analyzed, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownState(ref s) if s == "evaluada"));

        // Row untouched, nothing recorded
        let raw: String = db
            .conn()
            .unwrap()
            .query_row("SELECT state FROM activities WHERE id = 'X'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(raw, "evaluada");
        assert!(db.activity_history("X").unwrap().is_empty());

        // Reads refuse to guess a state either
        assert!(matches!(
            db.get_activity("X"),
            Err(rusqlite::Error::FromSqlConversionFailure(..))
        ));
    }

    #[test]
    fn test_history_rejects_unknown_stored_state() {
        let db = ForgeDB::in_memory().unwrap();
        db.insert_activity_raw("A", ActivityState::Draft, None).unwrap();
        db.conn()
            .unwrap()
            .execute(
                "INSERT INTO activity_state_history (id, activity_id, state, timestamp)
                 VALUES ('h1', 'A', 'archived', '2026-03-01 08:00:00')",
                [],
            )
            .unwrap();

        assert!(db.activity_history("A").is_err());
    }

    #[test]
    fn test_transition_records_meta() {
        let db = ForgeDB::in_memory().unwrap();
        let a = db.create_activity("Quiz", None).unwrap();
        let meta = serde_json::json!({"ceDetected": 4});
        db.transition_activity(&a.id, ActivityState::Analyzed, Some(&meta))
            .unwrap();

        let history = db.activity_history(&a.id).unwrap();
        assert_eq!(history.last().unwrap().meta, Some(meta));
    }

    #[test]
    fn test_schedule_activity_sets_date() {
        let db = ForgeDB::in_memory().unwrap();
        let a = db.create_activity("Project", None).unwrap();
        db.transition_activity(&a.id, ActivityState::Analyzed, None).unwrap();

        let a = db.schedule_activity(&a.id, day("2026-03-02")).unwrap();
        assert_eq!(a.state, ActivityState::Scheduled);
        assert_eq!(a.scheduled_date.as_deref(), Some("2026-03-02"));
    }

    #[test]
    fn test_advance_due_scheduled_yesterday() {
        let db = ForgeDB::in_memory().unwrap();
        db.insert_activity_raw("A", ActivityState::Scheduled, Some("2026-03-01"))
            .unwrap();

        let outcome = db
            .advance_due_scheduled(day("2026-03-02"), at("2026-03-02", "00:05:00"))
            .unwrap();
        assert_eq!(outcome, TransitionOutcome { count: 1, ids: vec!["A".to_string()] });

        let a = db.get_activity("A").unwrap().unwrap();
        assert_eq!(a.state, ActivityState::PendingReview);

        let history = db.activity_history("A").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, ActivityState::PendingReview);
        assert_eq!(history[0].timestamp, "2026-03-02 00:05:00");
    }

    #[test]
    fn test_advance_due_scheduled_filters() {
        let db = ForgeDB::in_memory().unwrap();
        let today = day("2026-03-02");
        db.insert_activity_raw("today", ActivityState::Scheduled, Some("2026-03-02T18:30:00"))
            .unwrap();
        db.insert_activity_raw("future", ActivityState::Scheduled, Some("2026-03-03"))
            .unwrap();
        db.insert_activity_raw("undated", ActivityState::Scheduled, None).unwrap();
        db.insert_activity_raw("blank", ActivityState::Scheduled, Some("")).unwrap();
        db.insert_activity_raw("analyzed", ActivityState::Analyzed, Some("2026-02-01"))
            .unwrap();
        db.insert_activity_raw("closed", ActivityState::Closed, Some("2026-02-01"))
            .unwrap();

        let outcome = db
            .advance_due_scheduled(today, at("2026-03-02", "08:00:00"))
            .unwrap();
        assert_eq!(outcome.ids, vec!["today".to_string()]);

        let state = |id: &str| db.get_activity(id).unwrap().unwrap().state;
        assert_eq!(state("today"), ActivityState::PendingReview);
        assert_eq!(state("future"), ActivityState::Scheduled);
        assert_eq!(state("undated"), ActivityState::Scheduled);
        assert_eq!(state("blank"), ActivityState::Scheduled);
        assert_eq!(state("analyzed"), ActivityState::Analyzed);
        assert_eq!(state("closed"), ActivityState::Closed);
    }

    #[test]
    fn test_advance_due_scheduled_uses_written_calendar_date() {
        let db = ForgeDB::in_memory().unwrap();
        // date() would shift these to 03-02 and 03-03 in UTC
        db.insert_activity_raw("east", ActivityState::Scheduled, Some("2026-03-03T00:30:00+02:00"))
            .unwrap();
        db.insert_activity_raw("west", ActivityState::Scheduled, Some("2026-03-02T23:30:00-05:00"))
            .unwrap();

        let outcome = db
            .advance_due_scheduled(day("2026-03-02"), at("2026-03-02", "08:00:00"))
            .unwrap();
        assert_eq!(outcome.ids, vec!["west".to_string()]);
        assert_eq!(
            db.get_activity("east").unwrap().unwrap().state,
            ActivityState::Scheduled
        );

        let outcome = db
            .advance_due_scheduled(day("2026-03-03"), at("2026-03-03", "08:00:00"))
            .unwrap();
        assert_eq!(outcome.ids, vec!["east".to_string()]);
    }

    #[test]
    fn test_advance_due_scheduled_is_idempotent() {
        let db = ForgeDB::in_memory().unwrap();
        db.insert_activity_raw("A", ActivityState::Scheduled, Some("2026-03-01"))
            .unwrap();
        let now = at("2026-03-02", "00:05:00");

        let first = db.advance_due_scheduled(now.date(), now).unwrap();
        assert_eq!(first.count, 1);

        let later = now + Duration::hours(1);
        let second = db.advance_due_scheduled(later.date(), later).unwrap();
        assert!(second.is_empty());
        assert_eq!(db.activity_history("A").unwrap().len(), 1);
    }

    #[test]
    fn test_advance_due_scheduled_tolerates_duplicate_history() {
        let db = ForgeDB::in_memory().unwrap();
        let now = at("2026-03-02", "00:05:00");
        db.insert_activity_raw("A", ActivityState::Scheduled, Some("2026-03-01"))
            .unwrap();
        db.insert_activity_raw("B", ActivityState::Scheduled, Some("2026-03-01"))
            .unwrap();
        // A retry already recorded A's transition for this instant
        db.insert_history_raw("A", ActivityState::PendingReview, now).unwrap();

        let outcome = db.advance_due_scheduled(now.date(), now).unwrap();
        assert_eq!(outcome.count, 2);

        assert_eq!(
            db.get_activity("A").unwrap().unwrap().state,
            ActivityState::PendingReview
        );
        assert_eq!(
            db.get_activity("B").unwrap().unwrap().state,
            ActivityState::PendingReview
        );
        assert_eq!(db.activity_history("A").unwrap().len(), 1);
        assert_eq!(db.activity_history("B").unwrap().len(), 1);
    }

    #[test]
    fn test_list_activities_by_state() {
        let db = ForgeDB::in_memory().unwrap();
        db.insert_activity_raw("A", ActivityState::Scheduled, None).unwrap();
        db.insert_activity_raw("B", ActivityState::Draft, None).unwrap();
        db.insert_activity_raw("C", ActivityState::Scheduled, None).unwrap();

        let scheduled = db.list_activities_by_state(ActivityState::Scheduled).unwrap();
        let ids: Vec<_> = scheduled.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
    }

    #[test]
    fn test_detached_reopens_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = ForgeDB::open(dir.path().join("forge.sqlite")).unwrap();
        let a = db.create_activity("Before", None).unwrap();

        let err = db
            .detached(|| -> Result<()> { Err(CoreError::CorruptBackup("boom".into())) })
            .unwrap_err();
        assert!(matches!(err, CoreError::CorruptBackup(_)));

        // Connection is usable again after a failed detached section
        assert!(db.get_activity(&a.id).unwrap().is_some());
    }

    #[test]
    fn test_detached_retries_reopen_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.sqlite");
        let db = ForgeDB::open(&path).unwrap();
        db.create_activity("Before", None).unwrap();

        let remove_sidecars = |path: &Path| {
            for suffix in ["-wal", "-shm"] {
                let mut side = path.as_os_str().to_owned();
                side.push(suffix);
                let _ = std::fs::remove_file(side);
            }
        };

        // Leave something that is not a database behind
        let err = db
            .detached(|| -> Result<()> {
                remove_sidecars(&path);
                std::fs::write(&path, vec![0x42u8; 4096])?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Sqlite(_)));

        // Never served from the schema-less placeholder
        assert!(db.get_activity("anything").is_err());
        assert!(db.list_activities_by_state(ActivityState::Draft).is_err());

        // Once the file is usable again the next call reconnects
        std::fs::remove_file(&path).unwrap();
        remove_sidecars(&path);
        assert!(db.get_activity("anything").unwrap().is_none());
        let a = db.create_activity("After", None).unwrap();
        assert_eq!(db.get_activity(&a.id).unwrap().unwrap().name, "After");
    }

    #[test]
    fn test_detached_rejects_in_memory() {
        let db = ForgeDB::in_memory().unwrap();
        assert!(db.detached(|| Ok(())).is_err());
    }
}
