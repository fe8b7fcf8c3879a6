//! Tick aggregation
//!
//! The [`Aggregator`] is the one piece of shared state between the feed task
//! (sole writer of the pending buffer) and the snapshot task (sole drainer of
//! the buffer and sole writer of the table).

pub mod buffer;
pub mod snapshot;
pub mod table;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::feed::connection::{FrameHandler, FrameOutcome};
use crate::feed::wire::{self, Tick};
use crate::registry::SubscriptionRegistry;

pub use buffer::{BufferFull, PendingBuffer};
pub use snapshot::{fold_batch, CycleReport, Snapshotter};
pub use table::{LastPriceTable, TableRow};

/// Aggregator counters
#[derive(Debug, Default)]
pub struct AggregatorStats {
    pub frames_received: AtomicU64,
    pub ticks_buffered: AtomicU64,
    pub decode_errors: AtomicU64,
    pub backpressure_rejections: AtomicU64,
    pub snapshot_cycles: AtomicU64,
    pub persistence_failures: AtomicU64,
}

impl AggregatorStats {
    pub fn snapshot(&self) -> AggregatorStatsSnapshot {
        AggregatorStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            ticks_buffered: self.ticks_buffered.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
            snapshot_cycles: self.snapshot_cycles.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatorStatsSnapshot {
    pub frames_received: u64,
    pub ticks_buffered: u64,
    pub decode_errors: u64,
    pub backpressure_rejections: u64,
    pub snapshot_cycles: u64,
    pub persistence_failures: u64,
}

pub struct Aggregator {
    buffer: PendingBuffer,
    /// Last known price per token, including tokens without a table row.
    last_prices: Mutex<HashMap<u32, u32>>,
    table: RwLock<LastPriceTable>,
    stats: AggregatorStats,
}

impl Aggregator {
    /// Build from the registry and, when present, the persisted table.
    ///
    /// Registered tokens missing from `seed` get zero-filled rows; the
    /// last-price map starts from the seed's most recent column.
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        seed: Option<LastPriceTable>,
        buffer_capacity: usize,
    ) -> Arc<Self> {
        let mut table = seed.unwrap_or_default();
        let added = table.ensure_registered(&registry);
        if added > 0 && table.column_count() > 0 {
            debug!(added, "registered instruments added to persisted table");
        }
        let last_prices = table.latest_prices();

        Arc::new(Self {
            buffer: PendingBuffer::new(buffer_capacity),
            last_prices: Mutex::new(last_prices),
            table: RwLock::new(table),
            stats: AggregatorStats::default(),
        })
    }

    /// Buffer a decoded tick, counting backpressure rejections.
    pub fn append(&self, tick: Tick) -> Result<(), BufferFull> {
        match self.buffer.append(tick) {
            Ok(()) => {
                self.stats.ticks_buffered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(full) => {
                self.stats
                    .backpressure_rejections
                    .fetch_add(1, Ordering::Relaxed);
                Err(full)
            }
        }
    }

    /// Copy of the table for readers other than the snapshot task.
    pub fn table_snapshot(&self) -> LastPriceTable {
        self.table.read().clone()
    }

    /// Current last-known price for a token.
    pub fn last_price(&self, token: u32) -> Option<u32> {
        self.last_prices.lock().get(&token).copied()
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    pub(crate) fn buffer(&self) -> &PendingBuffer {
        &self.buffer
    }

    pub(crate) fn last_prices(&self) -> &Mutex<HashMap<u32, u32>> {
        &self.last_prices
    }

    pub(crate) fn table(&self) -> &RwLock<LastPriceTable> {
        &self.table
    }
}

impl FrameHandler for Aggregator {
    fn on_frame(&self, frame: &[u8]) -> FrameOutcome {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let tick = match wire::decode(frame) {
            Ok(tick) => tick,
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = frame.len(), "dropping undecodable frame");
                return FrameOutcome::Dropped(e);
            }
        };

        debug!(
            token = tick.instrument_token,
            price = tick.last_traded_price,
            "tick received"
        );

        match self.append(tick) {
            Ok(()) => FrameOutcome::Buffered,
            Err(full) => FrameOutcome::Backpressure(full),
        }
    }
}
