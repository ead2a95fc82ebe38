//! SQLite-backed persistence for interview records.
//!
//! The store owns a single connection behind a mutex, so every statement
//! runs serialized. That is plenty for this workload: interview mutations
//! are rare compared to transcription itself.

use crate::error::{AppError, AppResult};
use crate::interviews::records::{InterviewRecord, InterviewStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Column list shared by every SELECT so row mapping never drifts.
const COLUMNS: &str =
    "id, filename, filepath, interviewee, project_name, date, status, \
     transcript_path, segments_path, error";

pub struct InterviewStore {
    conn: Arc<Mutex<Connection>>,
}

impl InterviewStore {
    /// Open (creating if necessary) the database at `path`.
    pub fn open(path: &str) -> AppResult<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        debug!(path = %path, "interview store opened");
        Ok(store)
    }

    /// In-memory store backing the tests.
    #[cfg(test)]
    pub fn new_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> AppResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS interviews (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                filepath TEXT NOT NULL,
                interviewee TEXT NOT NULL,
                project_name TEXT NOT NULL,
                date TEXT NOT NULL,
                status TEXT NOT NULL,
                transcript_path TEXT,
                segments_path TEXT,
                error TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_interviews_date ON interviews(date DESC)",
            [],
        )?;

        Ok(())
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Storage("interview store lock poisoned".to_string()))
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<InterviewRecord> {
        let date_raw: String = row.get(5)?;
        let date = DateTime::parse_from_rfc3339(&date_raw)
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?
            .with_timezone(&Utc);

        let status_raw: String = row.get(6)?;
        let status: InterviewStatus = status_raw.parse().map_err(|err: AppError| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;

        Ok(InterviewRecord {
            id: row.get(0)?,
            filename: row.get(1)?,
            filepath: row.get(2)?,
            interviewee: row.get(3)?,
            project_name: row.get(4)?,
            date,
            status,
            transcript_path: row.get(7)?,
            segments_path: row.get(8)?,
            error: row.get(9)?,
        })
    }

    pub fn insert(&self, record: &InterviewRecord) -> AppResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO interviews (id, filename, filepath, interviewee, project_name, \
             date, status, transcript_path, segments_path, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.filename,
                record.filepath,
                record.interviewee,
                record.project_name,
                record.date.to_rfc3339(),
                record.status.as_str(),
                record.transcript_path,
                record.segments_path,
                record.error,
            ],
        )?;

        Ok(())
    }

    pub fn get(&self, id: &str) -> AppResult<Option<InterviewRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM interviews WHERE id = ?1",
            COLUMNS
        ))?;
        let record = stmt
            .query_row(params![id], Self::row_to_record)
            .optional()?;

        Ok(record)
    }

    /// All records, newest interview date first.
    pub fn list(&self) -> AppResult<Vec<InterviewRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM interviews ORDER BY date DESC",
            COLUMNS
        ))?;
        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    /// Move a record into `processing`. Returns whether the record existed.
    pub fn mark_processing(&self, id: &str) -> AppResult<bool> {
        let conn = self.lock()?;

        let updated = conn.execute(
            "UPDATE interviews SET status = ?1, error = NULL WHERE id = ?2",
            params![InterviewStatus::Processing.as_str(), id],
        )?;

        Ok(updated > 0)
    }

    /// Record a finished transcription and where its artifacts live.
    ///
    /// A record deleted while its transcription was running makes this a
    /// no-op, reported through the return value.
    pub fn mark_completed(
        &self,
        id: &str,
        transcript_path: &str,
        segments_path: &str,
    ) -> AppResult<bool> {
        let conn = self.lock()?;

        let updated = conn.execute(
            "UPDATE interviews SET status = ?1, transcript_path = ?2, segments_path = ?3, \
             error = NULL WHERE id = ?4",
            params![
                InterviewStatus::Completed.as_str(),
                transcript_path,
                segments_path,
                id
            ],
        )?;

        Ok(updated > 0)
    }

    /// Record a failed transcription with its error message.
    pub fn mark_failed(&self, id: &str, message: &str) -> AppResult<bool> {
        let conn = self.lock()?;

        let updated = conn.execute(
            "UPDATE interviews SET status = ?1, error = ?2 WHERE id = ?3",
            params![InterviewStatus::Failed.as_str(), message, id],
        )?;

        Ok(updated > 0)
    }

    /// Remove a record. Returns whether anything was deleted.
    pub fn delete(&self, id: &str) -> AppResult<bool> {
        let conn = self.lock()?;

        let deleted = conn.execute("DELETE FROM interviews WHERE id = ?1", params![id])?;

        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record_with_date(id: &str, date: DateTime<Utc>) -> InterviewRecord {
        InterviewRecord::new(
            id.to_string(),
            format!("{}.wav", id),
            format!("data/uploads/{}.wav", id),
        )
        .with_date(Some(date))
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let store = InterviewStore::new_in_memory().unwrap();
        let record = InterviewRecord::new(
            "a1".to_string(),
            "standup.wav".to_string(),
            "data/uploads/a1_standup.wav".to_string(),
        )
        .with_interviewee(Some("Ada".to_string()));

        store.insert(&record).unwrap();
        let loaded = store.get("a1").unwrap().unwrap();

        assert_eq!(loaded, record);
    }

    #[test]
    fn test_get_unknown_id_returns_none() {
        let store = InterviewStore::new_in_memory().unwrap();
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_insert_is_a_storage_error() {
        let store = InterviewStore::new_in_memory().unwrap();
        let record = record_with_date("a1", Utc::now());

        store.insert(&record).unwrap();
        let result = store.insert(&record);

        assert!(matches!(result, Err(AppError::Storage(_))));
    }

    #[test]
    fn test_list_orders_newest_first() {
        let store = InterviewStore::new_in_memory().unwrap();
        let jan = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2024, 2, 15, 9, 0, 0).unwrap();
        let mar = Utc.with_ymd_and_hms(2024, 3, 15, 9, 0, 0).unwrap();

        store.insert(&record_with_date("jan", jan)).unwrap();
        store.insert(&record_with_date("mar", mar)).unwrap();
        store.insert(&record_with_date("feb", feb)).unwrap();

        let ids: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|record| record.id)
            .collect();

        assert_eq!(ids, vec!["mar", "feb", "jan"]);
    }

    #[test]
    fn test_status_transitions_are_persisted() {
        let store = InterviewStore::new_in_memory().unwrap();
        store.insert(&record_with_date("a1", Utc::now())).unwrap();

        assert!(store.mark_processing("a1").unwrap());
        assert_eq!(
            store.get("a1").unwrap().unwrap().status,
            InterviewStatus::Processing
        );

        assert!(store
            .mark_completed("a1", "data/transcripts/a1.txt", "data/transcripts/a1.json")
            .unwrap());
        let completed = store.get("a1").unwrap().unwrap();
        assert_eq!(completed.status, InterviewStatus::Completed);
        assert_eq!(
            completed.transcript_path.as_deref(),
            Some("data/transcripts/a1.txt")
        );
        assert_eq!(
            completed.segments_path.as_deref(),
            Some("data/transcripts/a1.json")
        );
    }

    #[test]
    fn test_mark_failed_records_the_error() {
        let store = InterviewStore::new_in_memory().unwrap();
        store.insert(&record_with_date("a1", Utc::now())).unwrap();

        assert!(store.mark_failed("a1", "decoder exploded").unwrap());
        let failed = store.get("a1").unwrap().unwrap();

        assert_eq!(failed.status, InterviewStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("decoder exploded"));
    }

    #[test]
    fn test_marking_a_missing_record_reports_absence() {
        let store = InterviewStore::new_in_memory().unwrap();
        assert!(!store.mark_processing("missing").unwrap());
        assert!(!store.mark_failed("missing", "whatever").unwrap());
    }

    #[test]
    fn test_delete_reports_presence() {
        let store = InterviewStore::new_in_memory().unwrap();
        store.insert(&record_with_date("a1", Utc::now())).unwrap();

        assert!(store.delete("a1").unwrap());
        assert!(!store.delete("a1").unwrap());
        assert!(store.get("a1").unwrap().is_none());
    }
}
