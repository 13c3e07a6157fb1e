//! SQLite persistence for items, schedule records and the review log.

use crate::error::{EngineError, EngineResult};
use crate::models::{
    CardKey, DrillType, DueCounts, Grade, Item, ItemId, ReviewLog, ScheduleRecord, SessionItem,
};
use crate::selector::{DueQuery, DueSource};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Narrow read/write access to schedule records.
pub trait ScheduleStore: Send + Sync {
    fn load_record(&self, key: CardKey) -> EngineResult<Option<ScheduleRecord>>;

    /// Last write wins.
    fn save_record(&self, record: &ScheduleRecord) -> EngineResult<()>;

    fn log_review(&self, log: &ReviewLog) -> EngineResult<()>;
}

/// Run store work on the blocking pool so SQLite calls never hold a runtime worker.
pub async fn blocking<T, F>(work: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    fn conn(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| EngineError::Poisoned)
    }

    fn init(&self) -> EngineResult<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                learner_id TEXT NOT NULL,
                prompt TEXT NOT NULL,
                answer TEXT NOT NULL,
                language TEXT NOT NULL,
                flagged INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schedules (
                item_id TEXT NOT NULL REFERENCES items(id),
                drill TEXT NOT NULL,
                difficulty REAL NOT NULL,
                stability REAL NOT NULL,
                repetitions INTEGER NOT NULL DEFAULT 0,
                lapses INTEGER NOT NULL DEFAULT 0,
                first_review_at INTEGER NOT NULL DEFAULT 0,
                last_review_at INTEGER NOT NULL DEFAULT 0,
                next_review_at INTEGER NOT NULL,
                suspended INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (item_id, drill)
            );

            CREATE TABLE IF NOT EXISTS reviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id TEXT NOT NULL REFERENCES items(id),
                drill TEXT NOT NULL,
                grade TEXT NOT NULL,
                elapsed_days REAL NOT NULL,
                interval_days REAL NOT NULL,
                reviewed_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(next_review_at);
            CREATE INDEX IF NOT EXISTS idx_items_learner ON items(learner_id);
            CREATE INDEX IF NOT EXISTS idx_reviews_card ON reviews(item_id, drill);
            "#,
        )?;
        Ok(())
    }

    // Item operations

    /// Insert an item with one fresh schedule record per drill, all due at `now`.
    pub fn insert_item(&self, item: &Item, drills: &[DrillType], now: DateTime<Utc>) -> EngineResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        insert_item_rows(&tx, item, drills, now)?;
        tx.commit()?;
        debug!(item = %item.id, drills = drills.len(), "inserted item");
        Ok(())
    }

    /// Insert a batch of items in one transaction. Either every item lands or none does.
    pub fn insert_items(&self, items: &[(Item, Vec<DrillType>)], now: DateTime<Utc>) -> EngineResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (item, drills) in items {
            insert_item_rows(&tx, item, drills, now)?;
        }
        tx.commit()?;
        debug!(items = items.len(), "inserted item batch");
        Ok(items.len())
    }

    pub fn get_item(&self, id: ItemId) -> EngineResult<Option<Item>> {
        let conn = self.conn()?;
        let item = conn
            .query_row("SELECT * FROM items WHERE id = ?1", params![id.to_string()], parse_item_row)
            .optional()?;
        Ok(item)
    }

    pub fn list_items(&self, learner_id: &str) -> EngineResult<Vec<Item>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM items WHERE learner_id = ?1 ORDER BY created_at")?;
        let items = stmt
            .query_map(params![learner_id], parse_item_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(items)
    }

    /// Flagged items are left out of every selection.
    pub fn set_flagged(&self, id: ItemId, flagged: bool) -> EngineResult<()> {
        let changed = self.conn()?.execute(
            "UPDATE items SET flagged = ?2 WHERE id = ?1",
            params![id.to_string(), flagged],
        )?;
        if changed == 0 {
            return Err(EngineError::ItemNotFound(id));
        }
        Ok(())
    }

    pub fn set_suspended(&self, key: CardKey, suspended: bool) -> EngineResult<()> {
        let changed = self.conn()?.execute(
            "UPDATE schedules SET suspended = ?3 WHERE item_id = ?1 AND drill = ?2",
            params![key.item_id.to_string(), key.drill.as_str(), suspended],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(key));
        }
        Ok(())
    }

    // Review log

    pub fn review_history(&self, key: CardKey) -> EngineResult<Vec<ReviewLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT item_id, drill, grade, elapsed_days, interval_days, reviewed_at FROM reviews
             WHERE item_id = ?1 AND drill = ?2 ORDER BY id",
        )?;
        let logs = stmt
            .query_map(params![key.item_id.to_string(), key.drill.as_str()], |row| {
                let grade: String = row.get("grade")?;
                Ok(ReviewLog {
                    key: parse_key(row, 0, 1)?,
                    grade: grade.parse::<Grade>().map_err(|e| conversion_error(2, e))?,
                    elapsed_days: row.get("elapsed_days")?,
                    interval_days: row.get("interval_days")?,
                    reviewed_at: parse_time(row, 5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(logs)
    }
}

impl ScheduleStore for Database {
    fn load_record(&self, key: CardKey) -> EngineResult<Option<ScheduleRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT item_id, drill, difficulty, stability, repetitions, lapses,
                        first_review_at, last_review_at, next_review_at, suspended
                 FROM schedules WHERE item_id = ?1 AND drill = ?2",
                params![key.item_id.to_string(), key.drill.as_str()],
                parse_record_row,
            )
            .optional()?;
        Ok(record)
    }

    fn save_record(&self, record: &ScheduleRecord) -> EngineResult<()> {
        let conn = self.conn()?;
        upsert_record(&conn, record)?;
        Ok(())
    }

    fn log_review(&self, log: &ReviewLog) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT INTO reviews (item_id, drill, grade, elapsed_days, interval_days, reviewed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                log.key.item_id.to_string(),
                log.key.drill.as_str(),
                log.grade.as_str(),
                log.elapsed_days,
                log.interval_days,
                log.reviewed_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }
}

impl DueSource for Database {
    fn select_due(&self, query: &DueQuery) -> EngineResult<Vec<SessionItem>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.item_id, s.drill, s.repetitions, s.lapses, i.prompt, i.answer, i.language
             FROM schedules s
             JOIN items i ON i.id = s.item_id
             WHERE i.learner_id = ?1 AND i.flagged = 0 AND s.suspended = 0 AND s.next_review_at <= ?2
             ORDER BY s.repetitions DESC, s.next_review_at ASC, s.item_id, s.drill",
        )?;

        // Exclusions are applied while walking the ordered rows so the limit counts eligible cards only.
        let mut items = Vec::new();
        let rows = stmt.query_map(params![query.learner_id, query.now.timestamp_millis()], |row| {
            Ok(SessionItem {
                key: parse_key(row, 0, 1)?,
                repetitions: row.get("repetitions")?,
                lapses: row.get("lapses")?,
                prompt: row.get("prompt")?,
                reference_answer: row.get("answer")?,
                language: row.get("language")?,
            })
        })?;
        for row in rows {
            let item = row?;
            if query.exclude.contains(&item.key) {
                continue;
            }
            items.push(item);
            if items.len() >= query.limit {
                break;
            }
        }
        Ok(items)
    }

    fn count_due(&self, learner_id: &str, now: DateTime<Utc>) -> EngineResult<DueCounts> {
        let conn = self.conn()?;
        let counts = conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN s.next_review_at <= ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN s.repetitions = 0 THEN 1 ELSE 0 END), 0)
             FROM schedules s
             JOIN items i ON i.id = s.item_id
             WHERE i.learner_id = ?1 AND i.flagged = 0 AND s.suspended = 0",
            params![learner_id, now.timestamp_millis()],
            |row| {
                Ok(DueCounts {
                    total: row.get::<_, i64>(0)? as usize,
                    due_now: row.get::<_, i64>(1)? as usize,
                    new: row.get::<_, i64>(2)? as usize,
                })
            },
        )?;
        Ok(counts)
    }
}

fn insert_item_rows(conn: &Connection, item: &Item, drills: &[DrillType], now: DateTime<Utc>) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO items (id, learner_id, prompt, answer, language, flagged, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            item.id.to_string(),
            item.learner_id,
            item.prompt,
            item.answer,
            item.language,
            item.flagged,
            item.created_at.timestamp_millis(),
        ],
    )?;
    for drill in drills {
        upsert_record(conn, &ScheduleRecord::new(CardKey::new(item.id, *drill), now))?;
    }
    Ok(())
}

fn upsert_record(conn: &Connection, record: &ScheduleRecord) -> SqlResult<usize> {
    conn.execute(
        "INSERT INTO schedules (item_id, drill, difficulty, stability, repetitions, lapses,
                                first_review_at, last_review_at, next_review_at, suspended)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(item_id, drill) DO UPDATE SET
            difficulty = excluded.difficulty, stability = excluded.stability,
            repetitions = excluded.repetitions, lapses = excluded.lapses,
            first_review_at = excluded.first_review_at, last_review_at = excluded.last_review_at,
            next_review_at = excluded.next_review_at, suspended = excluded.suspended",
        params![
            record.key().item_id.to_string(),
            record.key().drill.as_str(),
            record.difficulty(),
            record.stability(),
            record.repetitions(),
            record.lapses(),
            record.first_review_at().map_or(0, |t| t.timestamp_millis()),
            record.last_review_at().map_or(0, |t| t.timestamp_millis()),
            record.next_review_at().timestamp_millis(),
            record.is_suspended(),
        ],
    )
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_key(row: &Row, id_idx: usize, drill_idx: usize) -> SqlResult<CardKey> {
    let id_str: String = row.get(id_idx)?;
    let drill_str: String = row.get(drill_idx)?;
    Ok(CardKey {
        item_id: Uuid::parse_str(&id_str).map_err(|e| conversion_error(id_idx, e))?,
        drill: drill_str.parse::<DrillType>().map_err(|e| conversion_error(drill_idx, e))?,
    })
}

fn parse_time(row: &Row, idx: usize) -> SqlResult<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

/// 0 means unset.
fn parse_optional_time(row: &Row, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let millis: i64 = row.get(idx)?;
    if millis == 0 {
        return Ok(None);
    }
    parse_time(row, idx).map(Some)
}

fn parse_item_row(row: &Row) -> SqlResult<Item> {
    let id_str: String = row.get("id")?;
    let created: i64 = row.get("created_at")?;

    Ok(Item {
        id: Uuid::parse_str(&id_str).map_err(|e| conversion_error(0, e))?,
        learner_id: row.get("learner_id")?,
        prompt: row.get("prompt")?,
        answer: row.get("answer")?,
        language: row.get("language")?,
        flagged: row.get("flagged")?,
        created_at: DateTime::from_timestamp_millis(created)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(6, created))?,
    })
}

fn parse_record_row(row: &Row) -> SqlResult<ScheduleRecord> {
    Ok(ScheduleRecord::from_parts(
        parse_key(row, 0, 1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        parse_optional_time(row, 6)?,
        parse_optional_time(row, 7)?,
        parse_time(row, 8)?,
        row.get(9)?,
    ))
}
