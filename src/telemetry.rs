//! Query telemetry: progress, internal logs and profile events.
//!
//! Pipeline threads report into the shared structures here; the connection's control
//! thread drains them and turns them into Progress, Log and ProfileEvents packets.
use std::{
    cell::Cell,
    collections::{BTreeMap, VecDeque},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use bincode::{Decode, Encode};
use parking_lot::Mutex;

use crate::block::{Block, BlockError, Column};

pub mod events {
    pub const SELECTED_ROWS: &str = "SelectedRows";
    pub const SELECTED_BYTES: &str = "SelectedBytes";
    pub const INSERTED_ROWS: &str = "InsertedRows";
    pub const INSERTED_BYTES: &str = "InsertedBytes";
    pub const READ_TASK_REQUESTS: &str = "ReadTaskRequestsSent";
    pub const MERGE_TREE_READ_TASK_REQUESTS: &str = "MergeTreeReadTaskRequestsSent";
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Small stable identifier of the calling thread, used to key logs and counters.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

fn unix_now() -> (u64, u64) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs(), now.as_micros() as u64)
}

/// Amount of work done. Sent as a delta since the previous Progress packet.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct Progress {
    pub read_rows: u64,
    pub read_bytes: u64,
    pub total_rows_to_read: u64,
    pub written_rows: u64,
    pub written_bytes: u64,
    pub elapsed_ns: u64,
}

impl Progress {
    pub fn read(rows: u64, bytes: u64) -> Self {
        Self {
            read_rows: rows,
            read_bytes: bytes,
            ..Self::default()
        }
    }

    pub fn written(rows: u64, bytes: u64) -> Self {
        Self {
            written_rows: rows,
            written_bytes: bytes,
            ..Self::default()
        }
    }

    /// True when no work is recorded. Elapsed time alone does not count.
    pub fn is_empty(&self) -> bool {
        self.read_rows == 0
            && self.read_bytes == 0
            && self.total_rows_to_read == 0
            && self.written_rows == 0
            && self.written_bytes == 0
    }

    pub fn add(&mut self, other: &Progress) {
        self.read_rows += other.read_rows;
        self.read_bytes += other.read_bytes;
        self.total_rows_to_read += other.total_rows_to_read;
        self.written_rows += other.written_rows;
        self.written_bytes += other.written_bytes;
        self.elapsed_ns += other.elapsed_ns;
    }
}

/// Progress accumulated since the last [`ProgressCounter::take`]. Safe to increment
/// from any thread.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    read_rows: AtomicU64,
    read_bytes: AtomicU64,
    total_rows_to_read: AtomicU64,
    written_rows: AtomicU64,
    written_bytes: AtomicU64,
}

impl ProgressCounter {
    pub fn increment(&self, delta: &Progress) {
        self.read_rows.fetch_add(delta.read_rows, Ordering::Relaxed);
        self.read_bytes.fetch_add(delta.read_bytes, Ordering::Relaxed);
        self.total_rows_to_read
            .fetch_add(delta.total_rows_to_read, Ordering::Relaxed);
        self.written_rows
            .fetch_add(delta.written_rows, Ordering::Relaxed);
        self.written_bytes
            .fetch_add(delta.written_bytes, Ordering::Relaxed);
    }

    /// Returns everything accumulated so far and resets the counter to zero. Each
    /// increment is observed by exactly one `take`.
    pub fn take(&self) -> Progress {
        Progress {
            read_rows: self.read_rows.swap(0, Ordering::Relaxed),
            read_bytes: self.read_bytes.swap(0, Ordering::Relaxed),
            total_rows_to_read: self.total_rows_to_read.swap(0, Ordering::Relaxed),
            written_rows: self.written_rows.swap(0, Ordering::Relaxed),
            written_bytes: self.written_bytes.swap(0, Ordering::Relaxed),
            elapsed_ns: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Fatal = 1,
    Error = 3,
    Warning = 4,
    Information = 6,
    Debug = 7,
    Trace = 8,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fatal" => Ok(LogLevel::Fatal),
            "error" => Ok(LogLevel::Error),
            "warning" => Ok(LogLevel::Warning),
            "information" => Ok(LogLevel::Information),
            "debug" => Ok(LogLevel::Debug),
            "trace" | "test" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub time: u64,
    pub time_us: u64,
    pub thread_id: u64,
    pub level: LogLevel,
    pub source: String,
    pub text: String,
}

/// Queue of log lines destined for the client. Lines above the configured level
/// are dropped on push; with no level configured, nothing is kept.
#[derive(Debug, Clone, Default)]
pub struct LogQueue {
    records: Arc<Mutex<VecDeque<LogRecord>>>,
    max_level: Option<LogLevel>,
}

impl LogQueue {
    pub fn new(max_level: Option<LogLevel>) -> Self {
        Self {
            records: Arc::default(),
            max_level,
        }
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        self.max_level.is_some_and(|max| level <= max)
    }

    pub fn push(&self, level: LogLevel, source: &str, text: impl Into<String>) {
        if !self.enabled(level) {
            return;
        }
        let (time, time_us) = unix_now();
        self.records.lock().push_back(LogRecord {
            time,
            time_us,
            thread_id: current_thread_id(),
            level,
            source: source.to_string(),
            text: text.into(),
        });
    }

    pub fn drain(&self) -> Vec<LogRecord> {
        self.records.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Formats log records as the block carried by a Log packet.
pub fn logs_block(records: &[LogRecord], host: &str, query_id: &str) -> Result<Block, BlockError> {
    Block::new()
        .with_column(
            "event_time",
            Column::UInt64(records.iter().map(|r| r.time).collect()),
        )?
        .with_column(
            "event_time_microseconds",
            Column::UInt64(records.iter().map(|r| r.time_us).collect()),
        )?
        .with_column(
            "host_name",
            Column::String(vec![host.to_string(); records.len()]),
        )?
        .with_column(
            "query_id",
            Column::String(vec![query_id.to_string(); records.len()]),
        )?
        .with_column(
            "thread_id",
            Column::UInt64(records.iter().map(|r| r.thread_id).collect()),
        )?
        .with_column(
            "priority",
            Column::Int64(records.iter().map(|r| r.level as i64).collect()),
        )?
        .with_column(
            "source",
            Column::String(records.iter().map(|r| r.source.clone()).collect()),
        )?
        .with_column(
            "text",
            Column::String(records.iter().map(|r| r.text.clone()).collect()),
        )
}

/// Counter values per thread.
pub type CountersSnapshot = BTreeMap<u64, BTreeMap<String, u64>>;

/// Monotonic event counters incremented by pipeline threads.
#[derive(Debug, Default)]
pub struct ProfileCounters {
    per_thread: Mutex<CountersSnapshot>,
}

impl ProfileCounters {
    pub fn increment(&self, event: &str, value: u64) {
        let thread = current_thread_id();
        let mut counters = self.per_thread.lock();
        *counters
            .entry(thread)
            .or_default()
            .entry(event.to_string())
            .or_default() += value;
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        self.per_thread.lock().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileEventDelta {
    pub thread_id: u64,
    pub name: String,
    pub value: u64,
}

/// Turns counter snapshots into increments relative to what was already sent.
#[derive(Debug, Default, Clone)]
pub struct ProfileEventsTracker {
    last_sent_snapshots: CountersSnapshot,
}

impl ProfileEventsTracker {
    /// Returns the non-zero increments of `current` over the last sent snapshot and
    /// records `current` as sent.
    pub fn diff(&mut self, current: CountersSnapshot) -> Vec<ProfileEventDelta> {
        let mut out = Vec::new();
        for (thread_id, counters) in &current {
            let previous = self.last_sent_snapshots.get(thread_id);
            for (name, value) in counters {
                let sent = previous.and_then(|p| p.get(name)).copied().unwrap_or(0);
                let delta = value.saturating_sub(sent);
                if delta > 0 {
                    out.push(ProfileEventDelta {
                        thread_id: *thread_id,
                        name: name.clone(),
                        value: delta,
                    });
                }
            }
        }
        self.last_sent_snapshots = current;
        out
    }
}

/// Type tag of profile event rows: counters are sent as increments.
const PROFILE_EVENT_INCREMENT: i64 = 1;

/// Formats profile event increments as the block carried by a ProfileEvents packet.
pub fn profile_events_block(deltas: &[ProfileEventDelta], host: &str) -> Result<Block, BlockError> {
    let (now, _) = unix_now();
    Block::new()
        .with_column(
            "host_name",
            Column::String(vec![host.to_string(); deltas.len()]),
        )?
        .with_column("current_time", Column::UInt64(vec![now; deltas.len()]))?
        .with_column(
            "thread_id",
            Column::UInt64(deltas.iter().map(|d| d.thread_id).collect()),
        )?
        .with_column(
            "type",
            Column::Int64(vec![PROFILE_EVENT_INCREMENT; deltas.len()]),
        )?
        .with_column(
            "name",
            Column::String(deltas.iter().map(|d| d.name.clone()).collect()),
        )?
        .with_column(
            "value",
            Column::UInt64(deltas.iter().map(|d| d.value).collect()),
        )
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn progress_deltas_sum_to_total() {
        let counter = Arc::new(ProgressCounter::default());
        let mut sent = Progress::default();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..250 {
                        counter.increment(&Progress::read(1, 8));
                    }
                })
            })
            .collect();

        for _ in 0..10 {
            sent.add(&counter.take());
        }
        for worker in workers {
            worker.join().unwrap();
        }
        sent.add(&counter.take());

        assert_eq!(sent.read_rows, 1000);
        assert_eq!(sent.read_bytes, 8000);
        assert!(counter.take().is_empty());
    }

    #[test]
    fn log_queue_filters_by_level() {
        let queue = LogQueue::new(Some(LogLevel::Information));
        queue.push(LogLevel::Debug, "executor", "dropped");
        queue.push(LogLevel::Warning, "executor", "kept");

        let records = queue.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "kept");
        assert!(queue.is_empty());
    }

    #[test]
    fn disabled_log_queue_keeps_nothing() {
        let queue = LogQueue::default();
        queue.push(LogLevel::Fatal, "executor", "dropped");

        assert!(queue.is_empty());
    }

    #[test]
    fn profile_events_are_incremental() {
        let counters = ProfileCounters::default();
        let mut tracker = ProfileEventsTracker::default();

        counters.increment(events::SELECTED_ROWS, 10);
        let first = tracker.diff(counters.snapshot());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].value, 10);

        assert!(tracker.diff(counters.snapshot()).is_empty());

        counters.increment(events::SELECTED_ROWS, 5);
        let third = tracker.diff(counters.snapshot());
        assert_eq!(third[0].value, 5);
    }

    #[test]
    fn profile_events_block_shape() {
        let deltas = vec![ProfileEventDelta {
            thread_id: 7,
            name: events::INSERTED_ROWS.to_string(),
            value: 3,
        }];
        let block = profile_events_block(&deltas, "host").unwrap();

        assert_eq!(block.rows(), 1);
        assert_eq!(block.column("value"), Some(&Column::UInt64(vec![3])));
    }

    #[test]
    fn log_level_parsing() {
        assert_eq!("Warning".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
