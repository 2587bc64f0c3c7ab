//! Per-query state and packet legality.
//!
//! A connection holds exactly one [`QueryState`]. It starts out pristine, is filled
//! in while a query is received and executed, and is replaced by a fresh value once
//! the query's final packet (EndOfStream or Exception) has been sent. Everything
//! that must outlive a query lives on the connection instead.
use std::{collections::BTreeMap, sync::Arc, time::Instant};

use uuid::Uuid;

use crate::{
    block::{Block, Compression},
    engine::{ExecutionContext, InsertSink, Pipeline},
    protocol::{PacketKind, ProfileInfo, QueryStage},
    settings::{ConnectionSettings, QuerySettings},
    statement::ParsedQuery,
    telemetry::{Progress, ProfileEventsTracker},
};

use super::{error::UnexpectedPacket, tasks::QueryControl};

/// How far a query has been cancelled. Only ever increases within a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancellationStatus {
    #[default]
    NotCancelled,
    /// Stop reading input; output already produced is still sent.
    ReadCancelled,
    /// Stop everything, including output.
    FullyCancelled,
}

/// Parameters of the last data block received, kept across queries so that a
/// stray block arriving after an exception can still be decoded and dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastBlockInputParameters {
    pub compression: Compression,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryPhase {
    #[default]
    Idle,
    /// Query accepted; scalars and external tables are being received.
    ReceivingQuery,
    /// Insert data is being received.
    ReceivingData,
    Executing,
    SendingResults,
    Terminating,
}

impl QueryPhase {
    /// The violation committed by sending a `kind` packet in this phase, or `None`
    /// when the packet is allowed.
    pub fn violation(self, kind: PacketKind) -> Option<UnexpectedPacket> {
        use PacketKind as K;

        match (self, kind) {
            (_, K::Hello) => Some(UnexpectedPacket::Hello),
            (_, K::Addendum) => Some(UnexpectedPacket::Addendum),
            (_, K::Ping | K::Cancel) => None,

            (QueryPhase::Idle, K::Query | K::TablesStatusRequest | K::IgnoredPartUUIDs) => None,
            (QueryPhase::Idle, K::Data | K::ScalarData | K::ExternalTableData) => {
                Some(UnexpectedPacket::InputWhileIdle(kind))
            }
            (QueryPhase::Idle, K::ReadTaskResponse | K::MergeTreeReadTaskResponse) => {
                Some(UnexpectedPacket::UnsolicitedReadTaskResponse(kind))
            }

            (_, K::Query) => Some(UnexpectedPacket::QueryWhileExecuting),
            (_, K::TablesStatusRequest) => Some(UnexpectedPacket::TablesStatusRequest),
            (_, K::IgnoredPartUUIDs) => Some(UnexpectedPacket::IgnoredPartUUIDs),

            (QueryPhase::ReceivingQuery, K::Data | K::ScalarData | K::ExternalTableData) => None,
            (QueryPhase::ReceivingQuery, _) => {
                Some(UnexpectedPacket::UnsolicitedReadTaskResponse(kind))
            }

            (QueryPhase::ReceivingData, K::Data) => None,
            (QueryPhase::ReceivingData, _) => Some(UnexpectedPacket::InsertInterrupted(kind)),

            (_, K::ReadTaskResponse | K::MergeTreeReadTaskResponse) => None,
            (_, K::Data | K::ScalarData | K::ExternalTableData) => {
                Some(UnexpectedPacket::DuringExecution(kind))
            }
        }
    }

    pub fn is_legal(self, kind: PacketKind) -> bool {
        self.violation(kind).is_none()
    }
}

/// Where received insert blocks go.
pub enum InsertTarget {
    /// Written to the table as they arrive.
    Sink(Box<dyn InsertSink>),
    /// Collected for the asynchronous insert queue.
    Buffer(Block),
}

/// The in-flight query of a connection.
pub struct QueryState {
    pub query_id: String,
    pub query: Option<ParsedQuery>,
    pub stage: QueryStage,
    pub compression: Compression,
    pub phase: QueryPhase,
    /// Connection settings with this query's overrides applied.
    pub settings: Option<ConnectionSettings>,
    pub query_settings: QuerySettings,

    /// No result block has been sent yet.
    pub is_empty: bool,
    pub sent_all_data: bool,
    /// No more input is expected from the client for this query.
    pub read_all_data: bool,
    pub need_receive_data_for_insert: bool,
    /// Input is being discarded after a fault.
    pub skipping_data: bool,

    pub part_uuids_to_ignore: Option<Vec<Uuid>>,
    pub scalars: BTreeMap<String, Block>,
    pub external_tables: BTreeMap<String, Block>,
    pub insert_header: Option<Block>,

    /// Sum of all Progress packets sent so far.
    pub progress: Progress,
    pub watch: Option<Instant>,
    pub after_send_progress: Option<Instant>,
    pub profile_events: ProfileEventsTracker,
    pub profile_info: ProfileInfo,

    pub context: Option<ExecutionContext>,
    pub control: Option<Arc<QueryControl>>,
    pub insert: Option<InsertTarget>,
    pub pipeline: Option<Box<dyn Pipeline>>,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            query_id: String::new(),
            query: None,
            stage: QueryStage::default(),
            compression: Compression::default(),
            phase: QueryPhase::default(),
            settings: None,
            query_settings: QuerySettings::default(),
            is_empty: true,
            sent_all_data: false,
            read_all_data: true,
            need_receive_data_for_insert: false,
            skipping_data: false,
            part_uuids_to_ignore: None,
            scalars: BTreeMap::new(),
            external_tables: BTreeMap::new(),
            insert_header: None,
            progress: Progress::default(),
            watch: None,
            after_send_progress: None,
            profile_events: ProfileEventsTracker::default(),
            profile_info: ProfileInfo::default(),
            context: None,
            control: None,
            insert: None,
            pipeline: None,
        }
    }
}

impl QueryState {
    pub fn cancellation(&self) -> CancellationStatus {
        self.control
            .as_ref()
            .map(|control| control.status())
            .unwrap_or_default()
    }

    /// Stops whatever is still running for the query and starts over with a fresh
    /// state. Safe to call at any point, any number of times.
    pub fn reset(&mut self) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.cancel();
        }
        if let Some(control) = &self.control {
            control.close();
        }
        *self = Self::default();
    }
}
