use std::fmt;

use bincode::{Decode, Encode};

use crate::block::Compression;

/// Packets sent by the client.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Request {
    Hello(ClientHello),
    Query(QueryPacket),
    /// Insert data. An empty block ends the stream.
    Data {
        payload: Vec<u8>,
    },
    Cancel,
    Ping,
    TablesStatusRequest(TablesStatusRequest),
    /// Named single-row input bound before execution. An empty block ends the stream.
    ScalarData {
        name: String,
        payload: Vec<u8>,
    },
    /// Block of a temporary table shipped with the query. An empty block ends the stream.
    ExternalTableData {
        name: String,
        payload: Vec<u8>,
    },
    /// Part UUIDs to exclude from the next query's reads.
    IgnoredPartUUIDs(Vec<[u8; 16]>),
    ReadTaskResponse(ReadTaskResponse),
    MergeTreeReadTaskResponse(ParallelReadResponse),
    Addendum(Addendum),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Hello,
    Query,
    Data,
    Cancel,
    Ping,
    TablesStatusRequest,
    ScalarData,
    ExternalTableData,
    IgnoredPartUUIDs,
    ReadTaskResponse,
    MergeTreeReadTaskResponse,
    Addendum,
}

impl PacketKind {
    pub const ALL: [PacketKind; 12] = [
        PacketKind::Hello,
        PacketKind::Query,
        PacketKind::Data,
        PacketKind::Cancel,
        PacketKind::Ping,
        PacketKind::TablesStatusRequest,
        PacketKind::ScalarData,
        PacketKind::ExternalTableData,
        PacketKind::IgnoredPartUUIDs,
        PacketKind::ReadTaskResponse,
        PacketKind::MergeTreeReadTaskResponse,
        PacketKind::Addendum,
    ];
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Request {
    pub fn kind(&self) -> PacketKind {
        match self {
            Request::Hello(_) => PacketKind::Hello,
            Request::Query(_) => PacketKind::Query,
            Request::Data { .. } => PacketKind::Data,
            Request::Cancel => PacketKind::Cancel,
            Request::Ping => PacketKind::Ping,
            Request::TablesStatusRequest(_) => PacketKind::TablesStatusRequest,
            Request::ScalarData { .. } => PacketKind::ScalarData,
            Request::ExternalTableData { .. } => PacketKind::ExternalTableData,
            Request::IgnoredPartUUIDs(_) => PacketKind::IgnoredPartUUIDs,
            Request::ReadTaskResponse(_) => PacketKind::ReadTaskResponse,
            Request::MergeTreeReadTaskResponse(_) => PacketKind::MergeTreeReadTaskResponse,
            Request::Addendum(_) => PacketKind::Addendum,
        }
    }
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct ClientHello {
    pub client_name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Chunked framing capability for client→server packets.
    pub proto_send_chunked: String,
    /// Chunked framing capability for server→client packets.
    pub proto_recv_chunked: String,
    /// Present only when `user` is the inter-server marker.
    pub interserver: Option<InterserverHello>,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct InterserverHello {
    pub cluster: String,
    pub salt: String,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct Addendum {
    pub quota_key: String,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub enum QueryStage {
    /// Only resolve the result structure.
    FetchColumns,
    WithMergeableState,
    #[default]
    Complete,
    WithMergeableStateAfterAggregation,
    WithMergeableStateAfterAggregationAndLimit,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub enum QueryKind {
    #[default]
    Initial,
    /// Sub-query issued by another server as part of distributed execution.
    Secondary,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct ClientInfo {
    pub query_kind: QueryKind,
    pub initial_user: String,
    pub initial_query_id: String,
    /// Set when this server reads a share of a table on behalf of an initiator.
    pub collaborate_with_initiator: bool,
    pub count_participating_replicas: u64,
    pub number_of_current_replica: u64,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Setting {
    pub name: String,
    pub value: String,
}

impl Setting {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct QueryPacket {
    pub query_id: String,
    pub client_info: ClientInfo,
    pub settings: Vec<Setting>,
    /// Inter-server query signature, see the handshake module.
    pub interserver_hash: Option<Vec<u8>>,
    pub stage: QueryStage,
    pub compression: Compression,
    pub query: String,
    pub parameters: Vec<Setting>,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedTableName {
    pub database: String,
    pub table: String,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct TablesStatusRequest {
    pub tables: Vec<QualifiedTableName>,
}

/// Answer to a `ReadTaskRequest`; `None` means there is no more work.
#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct ReadTaskResponse {
    pub task: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub enum CoordinationMode {
    #[default]
    Default,
    WithOrder,
    ReverseOrder,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub struct MarkRange {
    pub begin: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct RangesInPart {
    pub part_name: String,
    pub ranges: Vec<MarkRange>,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct ParallelReadResponse {
    pub finish: bool,
    pub description: Vec<RangesInPart>,
}
