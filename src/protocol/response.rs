use bincode::{Decode, Encode};

use crate::telemetry::Progress;

use super::request::{CoordinationMode, QualifiedTableName, RangesInPart};

/// Packets sent by the server.
#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub enum Response {
    Hello(ServerHello),
    Data { table: String, payload: Vec<u8> },
    Exception(ExceptionPacket),
    Progress(Progress),
    Pong,
    EndOfStream,
    ProfileInfo(ProfileInfo),
    Totals { payload: Vec<u8> },
    Extremes { payload: Vec<u8> },
    TablesStatusResponse(TablesStatusResponse),
    /// Internal server log lines for the running query; never compressed.
    Log { payload: Vec<u8> },
    TableColumns { table: String, description: String },
    PartUUIDs(Vec<[u8; 16]>),
    ReadTaskRequest,
    /// Profile counter increments since the previous send; never compressed.
    ProfileEvents { payload: Vec<u8> },
    MergeTreeAllRangesAnnouncement(InitialRangesAnnouncement),
    MergeTreeReadTaskRequest(ParallelReadRequest),
    TimezoneUpdate(String),
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Hello(_) => "Hello",
            Response::Data { .. } => "Data",
            Response::Exception(_) => "Exception",
            Response::Progress(_) => "Progress",
            Response::Pong => "Pong",
            Response::EndOfStream => "EndOfStream",
            Response::ProfileInfo(_) => "ProfileInfo",
            Response::Totals { .. } => "Totals",
            Response::Extremes { .. } => "Extremes",
            Response::TablesStatusResponse(_) => "TablesStatusResponse",
            Response::Log { .. } => "Log",
            Response::TableColumns { .. } => "TableColumns",
            Response::PartUUIDs(_) => "PartUUIDs",
            Response::ReadTaskRequest => "ReadTaskRequest",
            Response::ProfileEvents { .. } => "ProfileEvents",
            Response::MergeTreeAllRangesAnnouncement(_) => "MergeTreeAllRangesAnnouncement",
            Response::MergeTreeReadTaskRequest(_) => "MergeTreeReadTaskRequest",
            Response::TimezoneUpdate(_) => "TimezoneUpdate",
        }
    }
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct ServerHello {
    pub name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub revision: u64,
    pub timezone: Option<String>,
    pub display_name: Option<String>,
    pub version_patch: Option<u64>,
    pub proto_send_chunked: Option<String>,
    pub proto_recv_chunked: Option<String>,
    /// Inter-server nonce mixed into every query signature.
    pub nonce: Option<u64>,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct ExceptionPacket {
    pub code: i32,
    pub name: String,
    pub message: String,
    pub stack_trace: String,
    pub nested: Option<Box<ExceptionPacket>>,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
    pub calculated_rows_before_limit: bool,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct TableStatus {
    pub is_replicated: bool,
    pub absolute_delay: u32,
}

#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct TablesStatusResponse {
    pub tables: Vec<(QualifiedTableName, TableStatus)>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct InitialRangesAnnouncement {
    pub replica_num: u64,
    pub mode: CoordinationMode,
    pub description: Vec<RangesInPart>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ParallelReadRequest {
    pub replica_num: u64,
    pub mode: CoordinationMode,
    pub min_number_of_marks: u64,
    pub description: Vec<RangesInPart>,
}
