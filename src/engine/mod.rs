//! Interfaces the connection consumes from the rest of the server.
//!
//! The connection does not plan or run queries. It hands a [`ParsedQuery`] and an
//! [`ExecutionContext`] to a [`QueryEngine`] and receives either an [`InsertSink`]
//! to feed, or a [`Pipeline`] to pull result blocks from. Pipelines run on their own
//! threads and report progress, logs and profile counters through the shared handles
//! in the context; when this server reads on behalf of a distributed-read initiator,
//! they also ask for work through [`ReadTaskSource`].
//!
//! [`MemoryEngine`] is a small in-memory implementation used by the server binary
//! and the tests.
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, sync::mpsc, time::Duration};

use thiserror::Error;
use uuid::Uuid;

use crate::{
    block::{Block, BlockError},
    protocol::{
        InitialRangesAnnouncement, ParallelReadRequest, ParallelReadResponse,
        QualifiedTableName, QueryStage, Setting, TableStatus,
    },
    settings::QuerySettings,
    statement::ParsedQuery,
    telemetry::{LogQueue, ProfileCounters, ProgressCounter},
};

mod async_insert;
mod auth;
mod memory;
mod pipeline;

pub use async_insert::MemoryAsyncInsertQueue;
pub use auth::{AuthError, StaticUsers};
pub use memory::MemoryEngine;
pub use pipeline::{Producer, ThreadedPipeline};

/// Faults raised while executing a query.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("table {0} doesn't exist")]
    UnknownTable(String),

    #[error("table {0} already exists")]
    TableAlreadyExists(String),

    #[error("unsupported query: {0}")]
    Unsupported(String),

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("{0}")]
    Execution(String),

    #[error("block structure mismatch: {0}")]
    Structure(String),

    #[error("read task exchange failed: {0}")]
    ReadTask(String),

    #[error("timeout exceeded: {0}")]
    Timeout(String),
}

impl EngineError {
    pub fn code(&self) -> i32 {
        match self {
            EngineError::UnknownTable(_) => 60,
            EngineError::TableAlreadyExists(_) => 57,
            EngineError::Unsupported(_) => 48,
            EngineError::Syntax(_) => 62,
            EngineError::Execution(_) => 395,
            EngineError::Structure(_) => 49,
            EngineError::ReadTask(_) => 210,
            EngineError::Timeout(_) => 159,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineError::UnknownTable(_) => "UNKNOWN_TABLE",
            EngineError::TableAlreadyExists(_) => "TABLE_ALREADY_EXISTS",
            EngineError::Unsupported(_) => "NOT_IMPLEMENTED",
            EngineError::Syntax(_) => "SYNTAX_ERROR",
            EngineError::Execution(_) => "FUNCTION_THROW_IF_VALUE_IS_NON_ZERO",
            EngineError::Structure(_) => "LOGICAL_ERROR",
            EngineError::ReadTask(_) => "NETWORK_ERROR",
            EngineError::Timeout(_) => "TIMEOUT_EXCEEDED",
        }
    }
}

impl From<BlockError> for EngineError {
    fn from(value: BlockError) -> Self {
        EngineError::Structure(value.to_string())
    }
}

/// Source of distributed read work, served by the initiator over this connection.
/// Called from pipeline threads.
pub trait ReadTaskSource: Send + Sync {
    /// Next task, or `None` once the initiator has no more work.
    fn next_task(&self) -> Result<Option<String>, EngineError>;

    fn announce_ranges(&self, announcement: InitialRangesAnnouncement) -> Result<(), EngineError>;

    /// Next batch of mark ranges, or `None` when the query was cancelled meanwhile.
    fn request_ranges(
        &self,
        request: ParallelReadRequest,
    ) -> Result<Option<ParallelReadResponse>, EngineError>;
}

/// Everything a query needs from the connection besides its text.
#[derive(Clone)]
pub struct ExecutionContext {
    pub query_id: String,
    pub user: String,
    pub database: String,
    pub stage: QueryStage,
    pub settings: QuerySettings,
    pub parameters: Vec<Setting>,
    pub scalars: BTreeMap<String, Block>,
    pub external_tables: BTreeMap<String, Block>,
    pub part_uuids_to_ignore: Option<Vec<Uuid>>,
    pub progress: Arc<ProgressCounter>,
    pub logs: LogQueue,
    pub profile: Arc<ProfileCounters>,
    pub read_tasks: Option<Arc<dyn ReadTaskSource>>,
}

impl ExecutionContext {
    pub fn new(query_id: &str) -> Self {
        Self {
            query_id: query_id.to_string(),
            user: "default".to_string(),
            database: "default".to_string(),
            stage: QueryStage::Complete,
            settings: QuerySettings::default(),
            parameters: Vec::new(),
            scalars: BTreeMap::new(),
            external_tables: BTreeMap::new(),
            part_uuids_to_ignore: None,
            progress: Arc::default(),
            logs: LogQueue::default(),
            profile: Arc::default(),
            read_tasks: None,
        }
    }
}

pub enum PipelineEvent {
    Block(Block),
    /// Nothing new within the poll timeout.
    Pending,
    Finished,
}

/// A running query producing result blocks.
pub trait Pipeline: Send {
    /// Structure of the result.
    fn header(&self) -> Block;

    /// Waits up to `timeout` for the next event.
    fn poll(&mut self, timeout: Duration) -> Result<PipelineEvent, EngineError>;

    /// Stop reading new input; output already produced is still delivered.
    fn cancel_reading(&mut self);

    /// Abort the query, discarding pending output.
    fn cancel(&mut self);

    fn totals(&mut self) -> Option<Block> {
        None
    }

    fn extremes(&mut self) -> Option<Block> {
        None
    }

    fn rows_before_limit(&self) -> Option<u64> {
        None
    }

    /// UUIDs of the data parts the query read, for deduplication by the initiator.
    fn part_uuids(&self) -> Vec<Uuid> {
        Vec::new()
    }
}

/// Destination of the blocks of an INSERT.
pub trait InsertSink: Send {
    fn header(&self) -> &Block;

    fn write(&mut self, block: Block) -> Result<(), EngineError>;

    fn finish(self: Box<Self>) -> Result<(), EngineError>;
}

pub trait QueryEngine: Send + Sync {
    /// Structure the client must send for an INSERT.
    fn insert_header(&self, query: &ParsedQuery, ctx: &ExecutionContext) -> Result<Block, EngineError>;

    fn start_insert(
        &self,
        query: &ParsedQuery,
        ctx: &ExecutionContext,
    ) -> Result<Box<dyn InsertSink>, EngineError>;

    fn execute(&self, query: &ParsedQuery, ctx: ExecutionContext) -> Result<Box<dyn Pipeline>, EngineError>;

    fn tables_status(&self, tables: &[QualifiedTableName]) -> Vec<(QualifiedTableName, TableStatus)>;
}

/// Outcome of handing an insert to the asynchronous insert queue.
pub enum PushResult {
    /// Buffered; the receiver resolves when the batch holding the data is flushed.
    Queued(mpsc::Receiver<Result<(), EngineError>>),
    /// The data was flushed as part of the push.
    Flushed,
    Failed(EngineError),
}

pub trait AsyncInsertQueue: Send + Sync {
    fn push(&self, query: &ParsedQuery, data: Block, ctx: &ExecutionContext) -> PushResult;
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, user: &str, password: &str, peer: SocketAddr) -> Result<(), AuthError>;

    /// Whether `user` exists; inter-server queries run as their initial user without
    /// a password.
    fn user_exists(&self, user: &str) -> bool;
}
