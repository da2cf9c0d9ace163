//! Key/value sync bookkeeping.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{Database, DbResult};

/// Completion time of the last clean sync pass.
pub const LAST_SYNC_KEY: &str = "last_sync";
/// High-water mark for incremental pulls.
pub const LAST_PULL_KEY: &str = "last_pull_at";

impl Database {
    /// Get sync state value.
    pub fn get_sync_state(&self, key: &str) -> DbResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Set sync state value.
    pub fn set_sync_state(&self, key: &str, value: &str) -> DbResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_state (key, value, updated_at) VALUES (?, ?, datetime('now'))",
            params![key, value],
        )?;
        Ok(())
    }

    /// Read a timestamp entry; empty or unparsable values read as `None`.
    pub fn get_sync_timestamp(&self, key: &str) -> DbResult<Option<DateTime<Utc>>> {
        let value = self.get_sync_state(key)?;
        Ok(value
            .filter(|s| !s.is_empty())
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Store a timestamp entry as RFC 3339.
    pub fn set_sync_timestamp(&self, key: &str, at: DateTime<Utc>) -> DbResult<()> {
        self.set_sync_state(key, &at.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state() {
        let db = Database::open_in_memory().unwrap();

        // Default values from schema
        let last_sync = db.get_sync_state(LAST_SYNC_KEY).unwrap();
        assert_eq!(last_sync, Some("".to_string()));
        assert_eq!(db.get_sync_timestamp(LAST_SYNC_KEY).unwrap(), None);

        // Update
        db.set_sync_state(LAST_SYNC_KEY, "2024-01-15T10:00:00Z")
            .unwrap();
        let last_sync = db.get_sync_timestamp(LAST_SYNC_KEY).unwrap().unwrap();
        assert_eq!(last_sync.to_rfc3339(), "2024-01-15T10:00:00+00:00");
    }

    #[test]
    fn test_unknown_key() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_sync_state("nope").unwrap(), None);
        assert_eq!(db.get_sync_timestamp("nope").unwrap(), None);
    }
}
