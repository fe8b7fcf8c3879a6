//! Last-price table: one row per instrument, one price column per snapshot cycle.
//!
//! Rows are never removed and columns are only appended (or overwritten when a
//! cycle reuses an existing label), so every row always has a value for every column.

use std::collections::HashMap;

use serde::Serialize;

use crate::registry::SubscriptionRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRow {
    pub instrument_token: u32,
    pub company: String,
    /// One entry per column, in column order.
    pub prices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("row for token {token} has {found} prices, expected {expected}")]
    RaggedRow {
        token: u32,
        expected: usize,
        found: usize,
    },
    #[error("token {0} appears in more than one row")]
    DuplicateToken(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LastPriceTable {
    columns: Vec<String>,
    rows: Vec<TableRow>,
    #[serde(skip)]
    index: HashMap<u32, usize>,
}

impl LastPriceTable {
    /// Zero-column table with one row per registered instrument.
    pub fn from_registry(registry: &SubscriptionRegistry) -> Self {
        let mut table = Self::default();
        table.ensure_registered(registry);
        table
    }

    /// Rebuild a table from persisted columns and rows.
    pub fn from_parts(columns: Vec<String>, rows: Vec<TableRow>) -> Result<Self, TableError> {
        let mut index = HashMap::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if row.prices.len() != columns.len() {
                return Err(TableError::RaggedRow {
                    token: row.instrument_token,
                    expected: columns.len(),
                    found: row.prices.len(),
                });
            }
            if index.insert(row.instrument_token, i).is_some() {
                return Err(TableError::DuplicateToken(row.instrument_token));
            }
        }

        Ok(Self {
            columns,
            rows,
            index,
        })
    }

    /// Add a zero-filled row for every registered instrument that has none.
    /// Returns the number of rows added.
    pub fn ensure_registered(&mut self, registry: &SubscriptionRegistry) -> usize {
        let mut added = 0;
        for meta in registry.iter() {
            if self.index.contains_key(&meta.instrument_token) {
                continue;
            }
            self.index.insert(meta.instrument_token, self.rows.len());
            self.rows.push(TableRow {
                instrument_token: meta.instrument_token,
                company: meta.company_name.clone(),
                prices: vec![0; self.columns.len()],
            });
            added += 1;
        }
        added
    }

    /// Write one column. Every row takes its price from `prices`, or zero when
    /// absent. A label that already exists is overwritten in place.
    pub fn append_column(&mut self, label: String, prices: &HashMap<u32, u32>) {
        let existing = self.columns.iter().position(|c| *c == label);

        for row in &mut self.rows {
            let price = prices.get(&row.instrument_token).copied().unwrap_or(0);
            match existing {
                Some(col) => row.prices[col] = price,
                None => row.prices.push(price),
            }
        }

        if existing.is_none() {
            self.columns.push(label);
        }
    }

    /// Token -> price from the most recent column (zero for every row when
    /// there are no columns yet).
    pub fn latest_prices(&self) -> HashMap<u32, u32> {
        self.rows
            .iter()
            .map(|row| (row.instrument_token, row.prices.last().copied().unwrap_or(0)))
            .collect()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn row(&self, token: u32) -> Option<&TableRow> {
        self.index.get(&token).map(|&i| &self.rows[i])
    }

    pub fn contains(&self, token: u32) -> bool {
        self.index.contains_key(&token)
    }

    pub fn price(&self, token: u32, column: &str) -> Option<u32> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.row(token).map(|row| row.prices[col])
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}
