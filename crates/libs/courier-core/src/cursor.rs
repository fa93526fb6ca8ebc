use crate::error::StoreError;
use crate::types::Cursor;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Durable home of the delivery cursor.
///
/// The sequential processor is the only writer. `save` must persist both
/// fields atomically and must refuse to move `last_processed_id` backwards.
/// `clear` is the account-reset hook and the only way the id may decrease.
pub trait CursorStore: Send + Sync {
    fn load(&self) -> Result<Cursor, StoreError>;

    fn save(&self, cursor: &Cursor) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;
}

impl<T: CursorStore + ?Sized> CursorStore for Arc<T> {
    fn load(&self) -> Result<Cursor, StoreError> {
        (**self).load()
    }

    fn save(&self, cursor: &Cursor) -> Result<(), StoreError> {
        (**self).save(cursor)
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
}

fn regression_error(current: i64, requested: i64) -> StoreError {
    StoreError::Corrupt(format!(
        "last_processed_id may not move backwards ({current} -> {requested})"
    ))
}

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursor: Mutex<Cursor>,
    saves: Mutex<u64>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursor(cursor: Cursor) -> Self {
        Self { cursor: Mutex::new(cursor), saves: Mutex::new(0) }
    }

    /// Number of successful `save` calls.
    pub fn saves(&self) -> u64 {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> Result<Cursor, StoreError> {
        Ok(*self.cursor.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn save(&self, cursor: &Cursor) -> Result<(), StoreError> {
        let mut guard = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if cursor.last_processed_id < guard.last_processed_id {
            return Err(regression_error(guard.last_processed_id, cursor.last_processed_id));
        }
        *guard = *cursor;
        drop(guard);
        let mut saves = self.saves.lock().unwrap_or_else(PoisonError::into_inner);
        *saves = saves.saturating_add(1);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = Cursor::default();
        Ok(())
    }
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS delivery_cursor (
    slot INTEGER PRIMARY KEY CHECK (slot = 0),
    last_processed_id INTEGER NOT NULL,
    processing_failures INTEGER NOT NULL
)";

/// SQLite-backed cursor holding a single row.
#[derive(Debug)]
pub struct SqliteCursorStore {
    conn: Mutex<Connection>,
}

impl SqliteCursorStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Io(err.to_string()))?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(SCHEMA, [])?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl CursorStore for SqliteCursorStore {
    fn load(&self) -> Result<Cursor, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let row = conn
            .query_row(
                "SELECT last_processed_id, processing_failures FROM delivery_cursor WHERE slot = 0",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        let Some((last_processed_id, failures)) = row else {
            return Ok(Cursor::default());
        };
        let processing_failures = u64::try_from(failures).map_err(|_| {
            StoreError::Corrupt(format!("negative processing_failures {failures}"))
        })?;
        Ok(Cursor { last_processed_id, processing_failures })
    }

    fn save(&self, cursor: &Cursor) -> Result<(), StoreError> {
        let failures = i64::try_from(cursor.processing_failures).unwrap_or(i64::MAX);
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = conn.execute(
            "INSERT INTO delivery_cursor (slot, last_processed_id, processing_failures)
             VALUES (0, ?1, ?2)
             ON CONFLICT(slot) DO UPDATE SET
                last_processed_id = excluded.last_processed_id,
                processing_failures = excluded.processing_failures
             WHERE excluded.last_processed_id >= delivery_cursor.last_processed_id",
            params![cursor.last_processed_id, failures],
        )?;
        if changed == 0 {
            let current: i64 = conn.query_row(
                "SELECT last_processed_id FROM delivery_cursor WHERE slot = 0",
                [],
                |row| row.get(0),
            )?;
            return Err(regression_error(current, cursor.last_processed_id));
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute("DELETE FROM delivery_cursor", [])?;
        log::info!(target: "courier::cursor", "delivery cursor cleared");
        Ok(())
    }
}
