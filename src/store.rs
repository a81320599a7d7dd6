//! Per-user log entry storage.
//!
//! Every query is scoped to an owner: an entry that belongs to someone else
//! behaves exactly like one that does not exist.

use chrono::{NaiveDate, NaiveDateTime};
use sqlx::SqlitePool;

use crate::models::{LogEntry, LogEntryInput, UnknownTankType, WaterData};

/// How many past entries the advice prompt looks at.
pub const HISTORY_LIMIT: i64 = 5;

const SELECT_ENTRY: &str = "SELECT e.id, e.user_id, u.username, e.log_date, e.water_data, \
     e.fish_type, e.tank_type, e.notes, e.updated_at \
     FROM log_entries e JOIN users u ON u.id = e.user_id";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not query log entries")]
    Query(#[source] sqlx::Error),

    #[error("Could not insert log entry")]
    Insert(#[source] sqlx::Error),

    #[error("Could not update log entry")]
    Update(#[source] sqlx::Error),

    #[error("Could not delete log entry")]
    Delete(#[source] sqlx::Error),

    #[error("Could not encode water data")]
    Encode(#[source] serde_json::Error),

    #[error("Log entry {id} has malformed water data")]
    DecodeWaterData {
        id: i64,
        source: serde_json::Error,
    },

    #[error("Log entry {id} has an invalid tank type")]
    DecodeTankType { id: i64, source: UnknownTankType },

    #[error("Log entry {0} vanished after it was written")]
    Vanished(i64),
}

#[derive(Debug, sqlx::FromRow)]
struct LogEntryRow {
    id: i64,
    user_id: i64,
    username: String,
    log_date: NaiveDate,
    water_data: String,
    fish_type: Option<String>,
    tank_type: String,
    notes: Option<String>,
    updated_at: NaiveDateTime,
}

impl TryFrom<LogEntryRow> for LogEntry {
    type Error = Error;

    fn try_from(row: LogEntryRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let water_data: WaterData = serde_json::from_str(&row.water_data)
            .map_err(|source| Error::DecodeWaterData { id, source })?;
        let tank_type = row
            .tank_type
            .parse()
            .map_err(|source| Error::DecodeTankType { id, source })?;

        Ok(Self {
            id,
            user: row.user_id,
            user_username: row.username,
            log_date: row.log_date,
            water_data,
            fish_type: row.fish_type,
            tank_type,
            notes: row.notes,
            updated_at: row.updated_at,
        })
    }
}

fn into_entries(rows: Vec<LogEntryRow>) -> Result<Vec<LogEntry>, Error> {
    rows.into_iter().map(LogEntry::try_from).collect()
}

/// All of `user_id`'s entries, newest date first, ties broken by newest id.
pub async fn list_for_user(pool: &SqlitePool, user_id: i64) -> Result<Vec<LogEntry>, Error> {
    let rows = sqlx::query_as::<_, LogEntryRow>(&format!(
        "{SELECT_ENTRY} WHERE e.user_id = ? ORDER BY e.log_date DESC, e.id DESC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(Error::Query)?;

    into_entries(rows)
}

/// The `limit` most recent entries of `user_id`, in listing order.
pub async fn recent_for_user(
    pool: &SqlitePool,
    user_id: i64,
    limit: i64,
) -> Result<Vec<LogEntry>, Error> {
    let rows = sqlx::query_as::<_, LogEntryRow>(&format!(
        "{SELECT_ENTRY} WHERE e.user_id = ? ORDER BY e.log_date DESC, e.id DESC LIMIT ?"
    ))
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Error::Query)?;

    into_entries(rows)
}

pub async fn get_for_user(
    pool: &SqlitePool,
    user_id: i64,
    id: i64,
) -> Result<Option<LogEntry>, Error> {
    sqlx::query_as::<_, LogEntryRow>(&format!(
        "{SELECT_ENTRY} WHERE e.id = ? AND e.user_id = ?"
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(Error::Query)?
    .map(LogEntry::try_from)
    .transpose()
}

/// Inserts a new entry owned by `user_id`, dated `now`'s calendar day.
pub async fn create(
    pool: &SqlitePool,
    user_id: i64,
    input: &LogEntryInput,
    now: NaiveDateTime,
) -> Result<LogEntry, Error> {
    let water_data = serde_json::to_string(&input.water_data).map_err(Error::Encode)?;

    let id = sqlx::query(
        "INSERT INTO log_entries (user_id, log_date, water_data, fish_type, tank_type, notes, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(now.date())
    .bind(water_data)
    .bind(&input.fish_type)
    .bind(input.tank_type.as_str())
    .bind(&input.notes)
    .bind(now)
    .execute(pool)
    .await
    .map_err(Error::Insert)?
    .last_insert_rowid();

    get_for_user(pool, user_id, id)
        .await?
        .ok_or(Error::Vanished(id))
}

/// Replaces the writable fields of an entry. `log_date` never changes.
///
/// Returns `None` when `user_id` has no entry `id`.
pub async fn update_for_user(
    pool: &SqlitePool,
    user_id: i64,
    id: i64,
    input: &LogEntryInput,
    now: NaiveDateTime,
) -> Result<Option<LogEntry>, Error> {
    let water_data = serde_json::to_string(&input.water_data).map_err(Error::Encode)?;

    let updated = sqlx::query(
        "UPDATE log_entries SET water_data = ?, fish_type = ?, tank_type = ?, notes = ?, updated_at = ? \
         WHERE id = ? AND user_id = ?",
    )
    .bind(water_data)
    .bind(&input.fish_type)
    .bind(input.tank_type.as_str())
    .bind(&input.notes)
    .bind(now)
    .bind(id)
    .bind(user_id)
    .execute(pool)
    .await
    .map_err(Error::Update)?
    .rows_affected();

    if updated == 0 {
        return Ok(None);
    }

    get_for_user(pool, user_id, id).await
}

/// Returns whether an entry was deleted.
pub async fn delete_for_user(pool: &SqlitePool, user_id: i64, id: i64) -> Result<bool, Error> {
    let deleted = sqlx::query("DELETE FROM log_entries WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(Error::Delete)?
        .rows_affected();

    Ok(deleted > 0)
}
