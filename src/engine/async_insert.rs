use std::{
    collections::BTreeMap,
    mem,
    sync::{Arc, Weak, mpsc},
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::{block::Block, statement::ParsedQuery};

use super::{AsyncInsertQueue, EngineError, ExecutionContext, MemoryEngine, PushResult, QueryEngine};

const FLUSH_TICK: Duration = Duration::from_millis(10);

type Waiter = mpsc::Sender<Result<(), EngineError>>;

struct Batch {
    entries: Vec<(Block, Waiter)>,
    rows: usize,
    deadline: Instant,
}

struct Inner {
    engine: Arc<MemoryEngine>,
    max_rows: usize,
    batches: Mutex<BTreeMap<String, Batch>>,
}

/// Buffers asynchronous inserts per table and writes them to a [`MemoryEngine`] in
/// batches, either once a batch holds `max_rows` rows or once its busy timeout,
/// counted from the first buffered insert, has passed.
pub struct MemoryAsyncInsertQueue {
    inner: Arc<Inner>,
}

impl MemoryAsyncInsertQueue {
    pub fn new(engine: Arc<MemoryEngine>, max_rows: usize) -> Self {
        let inner = Arc::new(Inner {
            engine,
            max_rows: max_rows.max(1),
            batches: Mutex::new(BTreeMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        let spawned = thread::Builder::new()
            .name("async-insert-flush".to_string())
            .spawn(move || flush_loop(weak));
        if let Err(e) = spawned {
            error!("failed to start async insert flush thread: {e}");
        }

        Self { inner }
    }

    /// Flushes every buffered batch regardless of its deadline.
    pub fn flush_all(&self) {
        let batches = mem::take(&mut *self.inner.batches.lock());
        for (table, batch) in batches {
            if let Err(e) = self.inner.flush(&table, batch) {
                warn!("async insert into {table} failed: {e}");
            }
        }
    }
}

impl Drop for MemoryAsyncInsertQueue {
    fn drop(&mut self) {
        self.flush_all();
    }
}

impl Inner {
    /// Writes a batch and reports to each waiter. Returns the result of the last entry.
    fn flush(&self, table: &str, batch: Batch) -> Result<(), EngineError> {
        debug!(
            "flushing {} async inserts ({} rows) into {table}",
            batch.entries.len(),
            batch.rows
        );
        let mut last = Ok(());
        for (block, waiter) in batch.entries {
            last = self.engine.insert_block(table, &block);
            // The waiter may have stopped waiting.
            let _ = waiter.send(last.clone());
        }
        last
    }

    fn flush_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(String, Batch)> = {
            let mut batches = self.batches.lock();
            let tables: Vec<String> = batches
                .iter()
                .filter(|(_, batch)| batch.deadline <= now)
                .map(|(table, _)| table.clone())
                .collect();
            tables
                .into_iter()
                .filter_map(|table| batches.remove(&table).map(|batch| (table, batch)))
                .collect()
        };

        for (table, batch) in expired {
            if let Err(e) = self.flush(&table, batch) {
                warn!("async insert into {table} failed: {e}");
            }
        }
    }
}

fn flush_loop(inner: Weak<Inner>) {
    loop {
        thread::sleep(FLUSH_TICK);
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.flush_expired();
    }
}

impl AsyncInsertQueue for MemoryAsyncInsertQueue {
    fn push(&self, query: &ParsedQuery, data: Block, ctx: &ExecutionContext) -> PushResult {
        let Some(table) = query.insert_table() else {
            return PushResult::Failed(EngineError::Unsupported(format!(
                "async insert of a non-INSERT query: {}",
                query.text
            )));
        };

        let header = match self.inner.engine.insert_header(query, ctx) {
            Ok(header) => header,
            Err(e) => return PushResult::Failed(e),
        };
        if let Err(e) = data.check_header(&header) {
            return PushResult::Failed(e.into());
        }

        let rows = data.rows();
        let (tx, rx) = mpsc::channel();
        let mut batches = self.inner.batches.lock();
        let batch = batches.entry(table.to_string()).or_insert_with(|| Batch {
            entries: Vec::new(),
            rows: 0,
            deadline: Instant::now() + ctx.settings.async_insert_busy_timeout,
        });
        batch.entries.push((data, tx));
        batch.rows += rows;

        if batch.rows < self.inner.max_rows {
            return PushResult::Queued(rx);
        }

        let Some(batch) = batches.remove(table) else {
            return PushResult::Queued(rx);
        };
        drop(batches);
        match self.inner.flush(table, batch) {
            Ok(()) => PushResult::Flushed,
            Err(e) => PushResult::Failed(e),
        }
    }
}
