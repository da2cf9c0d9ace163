//! Operation log database operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{Database, DbError, DbResult};
use crate::models::{Operation, OperationKind, OperationPayload, OperationStatus};

const SELECT_OPERATION: &str = r#"
    SELECT seq, op_id, target_local_id, kind, payload, status, attempts,
           last_error, next_attempt_at, terminal, created_at
    FROM operations
"#;

impl Database {
    /// Append an operation to the log, returning its sequence number.
    pub fn append_operation(&self, op: &Operation) -> DbResult<i64> {
        let payload_json = serde_json::to_string(&op.payload)?;

        self.conn.execute(
            r#"
            INSERT INTO operations (
                op_id, target_local_id, kind, payload, status, attempts,
                last_error, next_attempt_at, terminal, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                op.id.to_string(),
                op.target_local_id,
                kind_to_string(op.kind()),
                payload_json,
                status_to_string(op.status),
                op.attempts,
                op.last_error,
                op.next_attempt_at,
                op.terminal,
                op.created_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Get an operation by its idempotency key.
    pub fn get_operation(&self, id: &Uuid) -> DbResult<Option<Operation>> {
        let sql = format!("{SELECT_OPERATION} WHERE op_id = ?");
        self.conn
            .query_row(&sql, [id.to_string()], OperationRow::from_row)
            .optional()?
            .map(TryInto::try_into)
            .transpose()
    }

    /// All operations not yet done, in log order.
    pub fn list_open_operations(&self) -> DbResult<Vec<Operation>> {
        let sql = format!("{SELECT_OPERATION} WHERE status != 'done' ORDER BY seq");
        self.query_operations(&sql, [])
    }

    /// Open operations of one lane, in log order.
    pub fn list_lane_operations(&self, local_id: &str) -> DbResult<Vec<Operation>> {
        let sql = format!(
            "{SELECT_OPERATION} WHERE target_local_id = ? AND status != 'done' ORDER BY seq"
        );
        self.query_operations(&sql, [local_id])
    }

    /// Oldest open operation of every lane, in log order.
    pub fn list_lane_heads(&self) -> DbResult<Vec<Operation>> {
        let sql = format!(
            r#"{SELECT_OPERATION} WHERE seq IN (
                SELECT MIN(seq) FROM operations
                WHERE status != 'done'
                GROUP BY target_local_id
            )
            ORDER BY seq"#
        );
        self.query_operations(&sql, [])
    }

    /// Permanently failed operations, in log order.
    pub fn list_terminal_operations(&self) -> DbResult<Vec<Operation>> {
        let sql = format!(
            "{SELECT_OPERATION} WHERE status = 'failed' AND terminal = 1 ORDER BY seq"
        );
        self.query_operations(&sql, [])
    }

    /// Persist the mutable state of an operation.
    pub fn save_operation_state(&self, op: &Operation) -> DbResult<bool> {
        let completed_at = (op.status == OperationStatus::Done).then(Utc::now);
        let rows_affected = self.conn.execute(
            r#"
            UPDATE operations SET
                status = ?2,
                attempts = ?3,
                last_error = ?4,
                next_attempt_at = ?5,
                terminal = ?6,
                completed_at = ?7
            WHERE op_id = ?1
            "#,
            params![
                op.id.to_string(),
                status_to_string(op.status),
                op.attempts,
                op.last_error,
                op.next_attempt_at,
                op.terminal,
                completed_at,
            ],
        )?;
        Ok(rows_affected > 0)
    }

    /// Remove one operation from the log.
    pub fn delete_operation(&self, id: &Uuid) -> DbResult<bool> {
        let rows_affected = self
            .conn
            .execute("DELETE FROM operations WHERE op_id = ?", [id.to_string()])?;
        Ok(rows_affected > 0)
    }

    /// Remove every open operation of a lane.
    pub fn delete_open_lane(&self, local_id: &str) -> DbResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM operations WHERE target_local_id = ? AND status != 'done'",
            [local_id],
        )?)
    }

    /// Whether a lane still has unconfirmed work.
    pub fn has_open_operations(&self, local_id: &str) -> DbResult<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM operations WHERE target_local_id = ? AND status != 'done')",
            [local_id],
            |row| row.get(0),
        )?)
    }

    /// Whether a lane has a delete not yet confirmed.
    pub fn has_pending_delete(&self, local_id: &str) -> DbResult<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM operations
             WHERE target_local_id = ? AND kind = 'delete' AND status != 'done')",
            [local_id],
            |row| row.get(0),
        )?)
    }

    /// Make every retrying operation due now. Terminal failures stay put.
    pub fn clear_retry_schedule(&self) -> DbResult<usize> {
        Ok(self.conn.execute(
            "UPDATE operations SET next_attempt_at = NULL
             WHERE status = 'failed' AND terminal = 0 AND next_attempt_at IS NOT NULL",
            [],
        )?)
    }

    /// Count operations not yet done.
    pub fn count_open_operations(&self) -> DbResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM operations WHERE status != 'done'",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Count permanently failed operations.
    pub fn count_terminal_operations(&self) -> DbResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM operations WHERE status = 'failed' AND terminal = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Return operations stranded in flight by a previous process to pending.
    pub fn reset_in_flight_operations(&self) -> DbResult<usize> {
        Ok(self.conn.execute(
            "UPDATE operations SET status = 'pending' WHERE status = 'in_flight'",
            [],
        )?)
    }

    /// Drop done operations completed before `before`.
    pub fn prune_done_operations(&self, before: DateTime<Utc>) -> DbResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM operations WHERE status = 'done' AND completed_at < ?",
            [before],
        )?)
    }

    fn query_operations<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> DbResult<Vec<Operation>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, OperationRow::from_row)?;

        let mut operations = Vec::new();
        for row in rows {
            operations.push(row?.try_into()?);
        }
        Ok(operations)
    }
}

/// Intermediate row struct for database mapping.
struct OperationRow {
    seq: i64,
    op_id: String,
    target_local_id: String,
    kind: String,
    payload: String,
    status: String,
    attempts: u32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    terminal: bool,
    created_at: DateTime<Utc>,
}

impl OperationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            op_id: row.get(1)?,
            target_local_id: row.get(2)?,
            kind: row.get(3)?,
            payload: row.get(4)?,
            status: row.get(5)?,
            attempts: row.get(6)?,
            last_error: row.get(7)?,
            next_attempt_at: row.get(8)?,
            terminal: row.get(9)?,
            created_at: row.get(10)?,
        })
    }
}

impl TryFrom<OperationRow> for Operation {
    type Error = DbError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.op_id)
            .map_err(|e| DbError::Constraint(format!("Invalid operation id {}: {}", row.op_id, e)))?;
        let payload: OperationPayload = serde_json::from_str(&row.payload)?;
        let kind = string_to_kind(&row.kind)?;
        if payload.kind() != kind {
            return Err(DbError::Constraint(format!(
                "Operation {} payload does not match kind {}",
                row.op_id, row.kind
            )));
        }

        Ok(Operation {
            id,
            seq: row.seq,
            target_local_id: row.target_local_id,
            payload,
            created_at: row.created_at,
            status: string_to_status(&row.status)?,
            attempts: row.attempts,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            terminal: row.terminal,
        })
    }
}

fn kind_to_string(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Create => "create",
        OperationKind::Update => "update",
        OperationKind::Delete => "delete",
    }
}

fn string_to_kind(s: &str) -> Result<OperationKind, DbError> {
    match s {
        "create" => Ok(OperationKind::Create),
        "update" => Ok(OperationKind::Update),
        "delete" => Ok(OperationKind::Delete),
        _ => Err(DbError::Constraint(format!("Unknown operation kind: {}", s))),
    }
}

fn status_to_string(status: OperationStatus) -> &'static str {
    match status {
        OperationStatus::Pending => "pending",
        OperationStatus::InFlight => "in_flight",
        OperationStatus::Failed => "failed",
        OperationStatus::Done => "done",
    }
}

fn string_to_status(s: &str) -> Result<OperationStatus, DbError> {
    match s {
        "pending" => Ok(OperationStatus::Pending),
        "in_flight" => Ok(OperationStatus::InFlight),
        "failed" => Ok(OperationStatus::Failed),
        "done" => Ok(OperationStatus::Done),
        _ => Err(DbError::Constraint(format!("Unknown operation status: {}", s))),
    }
}
