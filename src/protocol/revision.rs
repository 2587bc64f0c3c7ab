//! Protocol revisions.
//!
//! Client and server each advertise a revision in their hello packets; the connection
//! then speaks `min(client, server)`. Later packet kinds and optional fields are only
//! exchanged when the negotiated revision reaches the threshold below.

pub const SERVER_REVISION: u64 = 54_472;

/// Oldest client revision accepted at all.
pub const MIN_CLIENT_REVISION: u64 = 54_058;

pub const MIN_REVISION_WITH_SERVER_TIMEZONE: u64 = 54_058;
pub const MIN_REVISION_WITH_SERVER_DISPLAY_NAME: u64 = 54_372;
pub const MIN_REVISION_WITH_VERSION_PATCH: u64 = 54_401;
pub const MIN_REVISION_WITH_TABLE_COLUMNS: u64 = 54_410;
pub const MIN_REVISION_WITH_SCALARS: u64 = 54_429;
pub const MIN_REVISION_WITH_INTERSERVER_SECRET: u64 = 54_441;
pub const MIN_REVISION_WITH_PROFILE_EVENTS: u64 = 54_451;
pub const MIN_REVISION_WITH_PARALLEL_REPLICAS: u64 = 54_453;
pub const MIN_REVISION_WITH_ADDENDUM: u64 = 54_458;
pub const MIN_REVISION_WITH_PROGRESS_ELAPSED: u64 = 54_460;
pub const MIN_REVISION_WITH_INTERSERVER_SECRET_V2: u64 = 54_462;
pub const MIN_REVISION_WITH_TIMEZONE_UPDATES: u64 = 54_464;
pub const MIN_REVISION_WITH_CHUNKED_PACKETS: u64 = 54_470;

/// Revision spoken on a connection.
pub fn negotiate(client: u64) -> u64 {
    client.min(SERVER_REVISION)
}
