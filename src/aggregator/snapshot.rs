//! Periodic snapshot task
//!
//! Every interval: drain the pending buffer, fold the batch (last arrival wins
//! per token), merge into the last-price map, append one time-labelled column
//! to the table and persist the whole table. A column is appended even when
//! the batch is empty.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::Aggregator;
use crate::feed::wire::Tick;
use crate::store::{PersistenceError, TableStore};

/// Column label format, e.g. `2024-03-05 09:15:20`
pub const COLUMN_LABEL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Token -> price for one drained batch, folded in arrival order.
///
/// Arrival order decides, not the embedded trade time.
pub fn fold_batch(batch: &[Tick]) -> HashMap<u32, u32> {
    let mut updates = HashMap::with_capacity(batch.len());
    for tick in batch {
        updates.insert(tick.instrument_token, tick.last_traded_price);
    }
    updates
}

pub fn column_label(at: DateTime<Local>) -> String {
    at.format(COLUMN_LABEL_FORMAT).to_string()
}

/// Outcome of one snapshot cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub label: String,
    pub batch_len: usize,
    pub updated_tokens: usize,
    /// Updated tokens that have no table row
    pub unregistered_tokens: usize,
}

pub struct Snapshotter {
    aggregator: Arc<Aggregator>,
    store: Arc<dyn TableStore>,
    period: Duration,
}

impl Snapshotter {
    pub fn new(aggregator: Arc<Aggregator>, store: Arc<dyn TableStore>, period: Duration) -> Self {
        Self {
            aggregator,
            store,
            period,
        }
    }

    /// Drain, merge and append one column labelled `label`. Does not persist.
    pub fn apply_cycle(&self, label: String) -> CycleReport {
        let batch = self.aggregator.buffer().drain();
        let updates = fold_batch(&batch);

        let mut unregistered_tokens = 0;
        {
            let table = self.aggregator.table().read();
            for token in updates.keys().filter(|t| !table.contains(**t)) {
                unregistered_tokens += 1;
                debug!(token, "update for token without a table row");
            }
        }

        let mut last_prices = self.aggregator.last_prices().lock();
        last_prices.extend(updates.iter().map(|(&token, &price)| (token, price)));
        self.aggregator
            .table()
            .write()
            .append_column(label.clone(), &last_prices);
        drop(last_prices);

        self.aggregator
            .stats()
            .snapshot_cycles
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        CycleReport {
            label,
            batch_len: batch.len(),
            updated_tokens: updates.len(),
            unregistered_tokens,
        }
    }

    /// Persist the current table. Runs the blocking store call off the runtime.
    pub async fn persist(&self) -> Result<(), PersistenceError> {
        let table = self.aggregator.table_snapshot();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_table(&table))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))?
    }

    /// One full cycle labelled with the current wall-clock time.
    ///
    /// A failed save is logged and counted; the next cycle writes the full
    /// table again.
    pub async fn run_cycle(&self) -> CycleReport {
        let report = self.apply_cycle(column_label(Local::now()));

        info!(
            column = %report.label,
            batch = report.batch_len,
            updated = report.updated_tokens,
            "snapshot column appended"
        );

        if let Err(e) = self.persist().await {
            self.aggregator
                .stats()
                .persistence_failures
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            error!(error = %e, column = %report.label, "failed to persist snapshot table");
        }

        report
    }

    /// Run forever, one cycle per period. The first cycle runs one period
    /// after start.
    pub async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(period_secs = self.period.as_secs_f64(), "snapshot task started");
        loop {
            ticker.tick().await;
            debug!(pending = self.aggregator.pending(), "snapshot cycle starting");
            self.run_cycle().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InstrumentMeta, SubscriptionRegistry};
    use crate::store::MemoryTableStore;
    use chrono::TimeZone;

    struct FailingStore;

    impl TableStore for FailingStore {
        fn load_table(&self) -> Result<Option<crate::aggregator::LastPriceTable>, PersistenceError> {
            Ok(None)
        }

        fn save_table(&self, _: &crate::aggregator::LastPriceTable) -> Result<(), PersistenceError> {
            Err(PersistenceError::Task("disk full".into()))
        }
    }

    fn tick(token: u32, price: u32, time: u32) -> Tick {
        Tick {
            mode: 1,
            exchange_code: 1,
            instrument_token: token,
            last_traded_price: price,
            last_traded_time: time,
            last_traded_qty: 1,
        }
    }

    fn setup(store: Arc<dyn TableStore>) -> (Arc<Aggregator>, Snapshotter) {
        let registry = Arc::new(SubscriptionRegistry::new(vec![
            InstrumentMeta::new(1, 1, "A"),
            InstrumentMeta::new(2, 1, "B"),
            InstrumentMeta::new(3, 1, "C"),
        ]));
        let aggregator = Aggregator::new(registry, None, 1024);
        let snapshotter = Snapshotter::new(aggregator.clone(), store, Duration::from_secs(20));
        (aggregator, snapshotter)
    }

    #[test]
    fn test_fold_last_arrival_wins() {
        // Embedded trade time goes backwards; arrival order still decides
        let batch = [tick(1, 10, 300), tick(2, 20, 200), tick(1, 30, 100)];
        let updates = fold_batch(&batch);

        assert_eq!(updates, HashMap::from([(1, 30), (2, 20)]));
    }

    #[test]
    fn test_column_label_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 5, 9, 15, 20).unwrap();
        assert_eq!(column_label(at), "2024-03-05 09:15:20");
    }

    #[test]
    fn test_cycle_merges_and_keeps_untouched_prices() {
        let (aggregator, snapshotter) = setup(Arc::new(MemoryTableStore::new()));

        aggregator.append(tick(1, 10, 0)).unwrap();
        aggregator.append(tick(2, 20, 0)).unwrap();
        snapshotter.apply_cycle("t0".into());

        aggregator.append(tick(1, 11, 0)).unwrap();
        let report = snapshotter.apply_cycle("t1".into());

        assert_eq!(report.batch_len, 1);
        assert_eq!(report.updated_tokens, 1);

        let table = aggregator.table_snapshot();
        assert_eq!(table.row(1).unwrap().prices, vec![10, 11]);
        assert_eq!(table.row(2).unwrap().prices, vec![20, 20]);
        assert_eq!(table.row(3).unwrap().prices, vec![0, 0]);
    }

    #[test]
    fn test_empty_batch_repeats_previous_column() {
        let (aggregator, snapshotter) = setup(Arc::new(MemoryTableStore::new()));

        aggregator.append(tick(3, 77, 0)).unwrap();
        snapshotter.apply_cycle("t0".into());
        let report = snapshotter.apply_cycle("t1".into());

        assert_eq!(report.batch_len, 0);
        let table = aggregator.table_snapshot();
        for row in table.rows() {
            assert_eq!(row.prices[0], row.prices[1]);
        }
        assert_eq!(table.price(3, "t1"), Some(77));
    }

    #[test]
    fn test_unregistered_token_tracked_without_row() {
        let (aggregator, snapshotter) = setup(Arc::new(MemoryTableStore::new()));

        aggregator.append(tick(42, 5, 0)).unwrap();
        let report = snapshotter.apply_cycle("t0".into());

        assert_eq!(report.unregistered_tokens, 1);
        assert_eq!(aggregator.last_price(42), Some(5));
        assert!(!aggregator.table_snapshot().contains(42));
    }

    #[test]
    fn test_persisted_only_token_counts_as_tracked() {
        let registry = Arc::new(SubscriptionRegistry::new(vec![InstrumentMeta::new(1, 1, "A")]));
        let seed = crate::aggregator::LastPriceTable::from_parts(
            vec!["t0".into()],
            vec![crate::aggregator::TableRow {
                instrument_token: 77,
                company: "Delisted".into(),
                prices: vec![40],
            }],
        )
        .unwrap();
        let aggregator = Aggregator::new(registry, Some(seed), 16);
        let snapshotter = Snapshotter::new(
            aggregator.clone(),
            Arc::new(MemoryTableStore::new()),
            Duration::from_secs(20),
        );

        aggregator.append(tick(77, 41, 0)).unwrap();
        let report = snapshotter.apply_cycle("t1".into());

        assert_eq!(report.unregistered_tokens, 0);
        assert_eq!(aggregator.table_snapshot().price(77, "t1"), Some(41));
    }

    #[tokio::test]
    async fn test_run_cycle_persists_full_table() {
        let store = Arc::new(MemoryTableStore::new());
        let (aggregator, snapshotter) = setup(store.clone());

        aggregator.append(tick(2, 99, 0)).unwrap();
        let report = snapshotter.run_cycle().await;

        let saved = store.saved().unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(saved.columns(), [report.label.clone()]);
        assert_eq!(saved.price(2, &report.label), Some(99));
        assert_eq!(aggregator.stats().snapshot().snapshot_cycles, 1);
    }

    #[tokio::test]
    async fn test_persist_failure_is_counted_and_column_kept() {
        let (aggregator, snapshotter) = setup(Arc::new(FailingStore));

        snapshotter.run_cycle().await;

        assert_eq!(aggregator.stats().snapshot().persistence_failures, 1);
        assert_eq!(aggregator.table_snapshot().column_count(), 1);
    }
}
