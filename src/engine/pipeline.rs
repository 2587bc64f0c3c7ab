use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
    },
    thread,
    time::Duration,
};

use log::debug;

use crate::{
    block::{Block, Column, NamedColumn},
    telemetry::{Progress, events},
};

use super::{EngineError, ExecutionContext, Pipeline, PipelineEvent};

/// Blocks buffered between the producing thread and the connection.
const PIPELINE_BUFFER: usize = 4;

/// Handle given to the thread running a [`ThreadedPipeline`].
pub struct Producer {
    tx: SyncSender<Result<Block, EngineError>>,
    read_cancelled: Arc<AtomicBool>,
    ctx: ExecutionContext,
}

impl Producer {
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn is_cancelled(&self) -> bool {
        self.read_cancelled.load(Ordering::Acquire)
    }

    /// Sends a block downstream and accounts it as read. Returns false once the
    /// consumer stopped reading; the producer should then return.
    pub fn emit(&self, block: Block) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let rows = block.rows() as u64;
        let bytes = block.byte_size() as u64;
        self.ctx.progress.increment(&Progress::read(rows, bytes));
        self.ctx.profile.increment(events::SELECTED_ROWS, rows);
        self.ctx.profile.increment(events::SELECTED_BYTES, bytes);
        self.tx.send(Ok(block)).is_ok()
    }
}

/// Pipeline whose blocks are produced by a dedicated thread.
pub struct ThreadedPipeline {
    header: Block,
    rx: Option<Receiver<Result<Block, EngineError>>>,
    read_cancelled: Arc<AtomicBool>,
    extremes: Option<Block>,
    track_extremes: bool,
}

impl ThreadedPipeline {
    pub fn spawn<F>(header: Block, ctx: ExecutionContext, work: F) -> Result<Self, EngineError>
    where
        F: FnOnce(&Producer) -> Result<(), EngineError> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(PIPELINE_BUFFER);
        let read_cancelled = Arc::new(AtomicBool::new(false));
        let track_extremes = ctx.settings.extremes;
        let name = format!("query-{}", ctx.query_id);
        let producer = Producer {
            tx,
            read_cancelled: Arc::clone(&read_cancelled),
            ctx,
        };

        thread::Builder::new()
            .name(name)
            .spawn(move || {
                if let Err(e) = work(&producer) {
                    debug!("pipeline failed: {e}");
                    let _ = producer.tx.send(Err(e));
                }
            })
            .map_err(|e| EngineError::Execution(format!("failed to start pipeline: {e}")))?;

        Ok(Self {
            header,
            rx: Some(rx),
            read_cancelled,
            extremes: None,
            track_extremes,
        })
    }

    fn update_extremes(&mut self, block: &Block) {
        let mut candidates = self.extremes.take().unwrap_or_default();
        if candidates.append(block).is_ok() {
            self.extremes = extremes_of(&candidates);
        }
    }
}

impl Pipeline for ThreadedPipeline {
    fn header(&self) -> Block {
        self.header.clone()
    }

    fn poll(&mut self, timeout: Duration) -> Result<PipelineEvent, EngineError> {
        let Some(rx) = &self.rx else {
            return Ok(PipelineEvent::Finished);
        };

        match rx.recv_timeout(timeout) {
            Ok(Ok(block)) => {
                if self.track_extremes && !block.is_empty() {
                    self.update_extremes(&block);
                }
                Ok(PipelineEvent::Block(block))
            }
            Ok(Err(e)) => {
                self.rx = None;
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => Ok(PipelineEvent::Pending),
            Err(RecvTimeoutError::Disconnected) => {
                self.rx = None;
                Ok(PipelineEvent::Finished)
            }
        }
    }

    fn cancel_reading(&mut self) {
        self.read_cancelled.store(true, Ordering::Release);
    }

    fn cancel(&mut self) {
        self.read_cancelled.store(true, Ordering::Release);
        // Dropping the receiver unblocks a producer waiting on a full buffer.
        self.rx = None;
    }

    fn extremes(&mut self) -> Option<Block> {
        self.extremes.take()
    }
}

impl Drop for ThreadedPipeline {
    fn drop(&mut self) {
        self.read_cancelled.store(true, Ordering::Release);
    }
}

/// Two-row block holding the minimum and maximum of every column.
fn extremes_of(block: &Block) -> Option<Block> {
    if block.is_empty() {
        return None;
    }
    let columns = block
        .columns()
        .iter()
        .map(|c| NamedColumn {
            name: c.name.clone(),
            column: min_max(&c.column),
        })
        .collect();
    Block::from_columns(columns).ok()
}

fn min_max(column: &Column) -> Column {
    match column {
        Column::UInt64(v) => Column::UInt64(vec![
            v.iter().copied().min().unwrap_or_default(),
            v.iter().copied().max().unwrap_or_default(),
        ]),
        Column::Int64(v) => Column::Int64(vec![
            v.iter().copied().min().unwrap_or_default(),
            v.iter().copied().max().unwrap_or_default(),
        ]),
        Column::Float64(v) => Column::Float64(vec![
            v.iter().copied().fold(f64::INFINITY, f64::min),
            v.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        ]),
        Column::String(v) => Column::String(vec![
            v.iter().min().cloned().unwrap_or_default(),
            v.iter().max().cloned().unwrap_or_default(),
        ]),
    }
}
