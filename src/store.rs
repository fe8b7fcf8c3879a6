//! Table persistence
//!
//! The full last-price table is written on every snapshot cycle and read back
//! once at startup. SQLite keeps instruments, column labels and prices in three
//! tables; column order is kept by an explicit `position`.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::aggregator::table::{LastPriceTable, TableError, TableRow};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("persisted table is malformed: {0}")]
    Malformed(#[from] TableError),
    #[error("persistence task failed: {0}")]
    Task(String),
}

/// Persistence collaborator for the last-price table.
pub trait TableStore: Send + Sync {
    /// Previously persisted table, or `None` when nothing has been saved yet.
    fn load_table(&self) -> Result<Option<LastPriceTable>, PersistenceError>;

    /// Replace the persisted table with `table`.
    fn save_table(&self, table: &LastPriceTable) -> Result<(), PersistenceError>;
}

// =============================================================================
// SQLITE
// =============================================================================

/// SQLite-backed table store
pub struct SqliteTableStore {
    db_path: String,
}

impl SqliteTableStore {
    /// Open the store and create the schema if needed
    pub fn new(db_path: &str) -> Result<Self, PersistenceError> {
        let store = Self {
            db_path: db_path.to_string(),
        };
        store.init_db()?;
        info!(path = db_path, "table store ready");
        Ok(store)
    }

    fn init_db(&self) -> Result<(), PersistenceError> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS instruments (
                instrument_token INTEGER PRIMARY KEY,
                company TEXT NOT NULL,
                row_position INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS snapshot_columns (
                position INTEGER PRIMARY KEY,
                label TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS prices (
                instrument_token INTEGER NOT NULL,
                position INTEGER NOT NULL,
                price INTEGER NOT NULL,
                PRIMARY KEY (instrument_token, position)
            );",
        )?;
        Ok(())
    }
}

impl TableStore for SqliteTableStore {
    fn load_table(&self) -> Result<Option<LastPriceTable>, PersistenceError> {
        let conn = Connection::open(&self.db_path)?;

        let mut stmt = conn.prepare(
            "SELECT instrument_token, company FROM instruments ORDER BY row_position",
        )?;
        let mut rows: Vec<TableRow> = stmt
            .query_map([], |row| {
                Ok(TableRow {
                    instrument_token: row.get(0)?,
                    company: row.get(1)?,
                    prices: Vec::new(),
                })
            })?
            .collect::<Result<_, _>>()?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut stmt = conn.prepare("SELECT label FROM snapshot_columns ORDER BY position")?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut stmt =
            conn.prepare("SELECT price FROM prices WHERE instrument_token = ?1 ORDER BY position")?;
        for row in &mut rows {
            row.prices = stmt
                .query_map(params![row.instrument_token], |r| r.get(0))?
                .collect::<Result<_, _>>()?;
        }

        let table = LastPriceTable::from_parts(columns, rows)?;
        debug!(
            rows = table.row_count(),
            columns = table.column_count(),
            "loaded persisted table"
        );
        Ok(Some(table))
    }

    fn save_table(&self, table: &LastPriceTable) -> Result<(), PersistenceError> {
        let mut conn = Connection::open(&self.db_path)?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM prices", [])?;
        tx.execute("DELETE FROM snapshot_columns", [])?;
        tx.execute("DELETE FROM instruments", [])?;

        {
            let mut insert_col =
                tx.prepare("INSERT INTO snapshot_columns (position, label) VALUES (?1, ?2)")?;
            for (position, label) in table.columns().iter().enumerate() {
                insert_col.execute(params![position as i64, label])?;
            }

            let mut insert_row = tx.prepare(
                "INSERT INTO instruments (instrument_token, company, row_position) VALUES (?1, ?2, ?3)",
            )?;
            let mut insert_price = tx.prepare(
                "INSERT INTO prices (instrument_token, position, price) VALUES (?1, ?2, ?3)",
            )?;
            for (row_position, row) in table.rows().iter().enumerate() {
                insert_row.execute(params![row.instrument_token, row.company, row_position as i64])?;
                for (position, price) in row.prices.iter().enumerate() {
                    insert_price.execute(params![row.instrument_token, position as i64, price])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// Keeps the last saved table in memory.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    table: Mutex<Option<LastPriceTable>>,
    saves: Mutex<u64>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Option<LastPriceTable> {
        self.table.lock().clone()
    }

    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

impl TableStore for MemoryTableStore {
    fn load_table(&self) -> Result<Option<LastPriceTable>, PersistenceError> {
        Ok(self.table.lock().clone())
    }

    fn save_table(&self, table: &LastPriceTable) -> Result<(), PersistenceError> {
        *self.table.lock() = Some(table.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}
