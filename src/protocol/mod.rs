//! Native client-server protocol.
//!
//! This module defines the packets exchanged between clients and the server, the
//! protocol revisions that gate them, and the transport used to move them over a
//! TCP stream. It also contains the listener that accepts connections and hands
//! each of them to a [`Connection`](crate::connection::Connection) on a worker
//! thread.
//!
//! # Overview
//!
//! A connection is one long-lived, ordered stream of packets in each direction.
//! Client packets are [`Request`]s, server packets are [`Response`]s. Each packet
//! kind has a fixed direction, and the server only accepts a given kind in some
//! phases of a query; see [`connection::state`](crate::connection::state).
//!
//! # Binary Format
//!
//! Packets are bincode-encoded enums (big-endian, fixed-width integers, see
//! [`wire_config`]). Blocks inside packets are opaque payloads produced by the
//! block codec, LZ4-compressed when the query enabled compression.
//!
//! When both sides agree on chunked framing during the handshake, every packet in
//! that direction is split into `u32` little-endian length-prefixed chunks and
//! terminated by an empty chunk:
//!
//! ```text
//! +------------+-----------+------------+-----------+-----+------------+
//! | len (u32)  | bytes ... | len (u32)  | bytes ... | ... | 0 (u32)    |
//! +------------+-----------+------------+-----------+-----+------------+
//! ```
//!
//! # Versioning
//!
//! Both sides announce a protocol revision in their Hello packets and use the
//! smaller of the two. Packets and fields introduced after that revision are
//! neither sent nor expected; the thresholds live in [`revision`].
mod request;
mod response;
pub mod revision;
mod server;
mod thread;
mod transport;

use thread::ThreadPool;

pub use crate::block::Compression;
pub use request::{
    Addendum, ClientHello, ClientInfo, CoordinationMode, InterserverHello, MarkRange, PacketKind,
    ParallelReadResponse, QualifiedTableName, QueryKind, QueryPacket, QueryStage, RangesInPart,
    ReadTaskResponse, Request, Setting, TablesStatusRequest,
};
pub use response::{
    ExceptionPacket, InitialRangesAnnouncement, ParallelReadRequest, ProfileInfo, Response,
    ServerHello, TableStatus, TablesStatusResponse,
};
pub use server::{Server, install_shutdown_handler};
pub use transport::{
    Framing, MAX_PACKET_SIZE, PacketReader, ProtocolTransport, TransportError,
    limited_wire_config, read_packet, wire_config, write_packet,
};
