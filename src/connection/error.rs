use std::{error::Error as _, fmt, time::Duration};

use thiserror::Error;

use crate::{
    block::BlockError,
    engine::EngineError,
    protocol::{ExceptionPacket, PacketKind, TransportError},
    settings::SettingsError,
    statement::StatementError,
};

use super::handshake::HandshakeError;

const UNEXPECTED_PACKET_FROM_CLIENT: i32 = 102;

/// A packet the client was not allowed to send at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnexpectedPacket {
    /// Hello after the handshake.
    Hello,
    /// Addendum after the handshake.
    Addendum,
    /// TablesStatusRequest while a query is in flight.
    TablesStatusRequest,
    /// IgnoredPartUUIDs while a query is in flight.
    IgnoredPartUUIDs,
    QueryWhileExecuting,
    /// Query input with no query to feed.
    InputWhileIdle(PacketKind),
    /// Something other than Data while insert data was expected.
    InsertInterrupted(PacketKind),
    /// Anything but Cancel, Ping or a read task answer while a query runs.
    DuringExecution(PacketKind),
    /// A read task answer nobody asked for.
    UnsolicitedReadTaskResponse(PacketKind),
}

impl UnexpectedPacket {
    /// Violations after which the connection is closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UnexpectedPacket::Hello
                | UnexpectedPacket::Addendum
                | UnexpectedPacket::TablesStatusRequest
                | UnexpectedPacket::IgnoredPartUUIDs
                | UnexpectedPacket::QueryWhileExecuting
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            UnexpectedPacket::Hello => "UNEXPECTED_PACKET_HELLO",
            UnexpectedPacket::Addendum => "UNEXPECTED_PACKET_ADDENDUM",
            UnexpectedPacket::TablesStatusRequest => "UNEXPECTED_PACKET_TABLES_STATUS_REQUEST",
            UnexpectedPacket::IgnoredPartUUIDs => "UNEXPECTED_PACKET_IGNORED_PART_UUIDS",
            UnexpectedPacket::QueryWhileExecuting => "UNEXPECTED_PACKET_QUERY",
            UnexpectedPacket::InputWhileIdle(_) => "UNEXPECTED_PACKET_INPUT_WHILE_IDLE",
            UnexpectedPacket::InsertInterrupted(_) => "UNEXPECTED_PACKET_DURING_INSERT",
            UnexpectedPacket::DuringExecution(_) => "UNEXPECTED_PACKET_DURING_EXECUTION",
            UnexpectedPacket::UnsolicitedReadTaskResponse(_) => {
                "UNEXPECTED_PACKET_READ_TASK_RESPONSE"
            }
        }
    }
}

impl fmt::Display for UnexpectedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnexpectedPacket::Hello => write!(f, "unexpected packet Hello received from client"),
            UnexpectedPacket::Addendum => {
                write!(f, "unexpected packet Addendum received from client")
            }
            UnexpectedPacket::TablesStatusRequest => write!(
                f,
                "unexpected packet TablesStatusRequest received from client while a query is running"
            ),
            UnexpectedPacket::IgnoredPartUUIDs => write!(
                f,
                "unexpected packet IgnoredPartUUIDs received from client while a query is running"
            ),
            UnexpectedPacket::QueryWhileExecuting => write!(
                f,
                "unexpected packet Query received from client while a query is running"
            ),
            UnexpectedPacket::InputWhileIdle(kind) => {
                write!(f, "unexpected packet {kind} received from client: no query is running")
            }
            UnexpectedPacket::InsertInterrupted(kind) => {
                write!(f, "unexpected packet {kind} received from client, expected Data")
            }
            UnexpectedPacket::DuringExecution(kind) => {
                write!(f, "unexpected packet {kind} received from client, expected Cancel")
            }
            UnexpectedPacket::UnsolicitedReadTaskResponse(kind) => {
                write!(f, "unexpected packet {kind} received from client: no read task was requested")
            }
        }
    }
}

/// Everything that can end a query or a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("{0}")]
    Unexpected(UnexpectedPacket),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Statement(#[from] StatementError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error("timeout exceeded while receiving data from client ({0:?})")]
    ReceiveTimeout(Duration),

    #[error("client has gone away")]
    Disconnected,
}

impl From<UnexpectedPacket> for ConnectionError {
    fn from(value: UnexpectedPacket) -> Self {
        ConnectionError::Unexpected(value)
    }
}

impl ConnectionError {
    /// Maps read failures caused by the peer leaving to [`ConnectionError::Disconnected`].
    pub fn from_read(e: TransportError) -> Self {
        if e.is_disconnect() {
            ConnectionError::Disconnected
        } else {
            ConnectionError::Transport(e)
        }
    }

    /// Fatal errors close the connection; the others only end the current query.
    pub fn is_fatal(&self) -> bool {
        match self {
            ConnectionError::Handshake(_)
            | ConnectionError::Transport(_)
            | ConnectionError::ReceiveTimeout(_)
            | ConnectionError::Disconnected => true,
            ConnectionError::Unexpected(kind) => kind.is_fatal(),
            ConnectionError::InvalidPacket(_)
            | ConnectionError::Engine(_)
            | ConnectionError::Statement(_)
            | ConnectionError::Settings(_)
            | ConnectionError::Block(_) => false,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ConnectionError::Handshake(e) => e.code(),
            ConnectionError::Unexpected(_) => UNEXPECTED_PACKET_FROM_CLIENT,
            ConnectionError::InvalidPacket(_) => 117,
            ConnectionError::Transport(e) if e.is_malformed() => 101,
            ConnectionError::Transport(_) | ConnectionError::Disconnected => 210,
            ConnectionError::Engine(e) => e.code(),
            ConnectionError::Statement(StatementError::Unsupported(_)) => 48,
            ConnectionError::Statement(_) => 62,
            ConnectionError::Settings(SettingsError::Unknown(_)) => 115,
            ConnectionError::Settings(_) => 36,
            ConnectionError::Block(_) => 117,
            ConnectionError::ReceiveTimeout(_) => 209,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionError::Handshake(e) => e.name(),
            ConnectionError::Unexpected(kind) => kind.name(),
            ConnectionError::InvalidPacket(_) | ConnectionError::Block(_) => "INCORRECT_DATA",
            ConnectionError::Transport(e) if e.is_malformed() => "UNKNOWN_PACKET_FROM_CLIENT",
            ConnectionError::Transport(_) | ConnectionError::Disconnected => "NETWORK_ERROR",
            ConnectionError::Engine(e) => e.name(),
            ConnectionError::Statement(StatementError::Unsupported(_)) => "NOT_IMPLEMENTED",
            ConnectionError::Statement(_) => "SYNTAX_ERROR",
            ConnectionError::Settings(SettingsError::Unknown(_)) => "UNKNOWN_SETTING",
            ConnectionError::Settings(_) => "BAD_ARGUMENTS",
            ConnectionError::ReceiveTimeout(_) => "SOCKET_TIMEOUT",
        }
    }

    /// Builds the Exception packet for this error. The trace is the chain of
    /// underlying causes, one per line.
    pub fn to_exception(&self, with_stack_trace: bool) -> ExceptionPacket {
        let stack_trace = if with_stack_trace {
            let mut trace = format!("{self:?}");
            let mut source = self.source();
            while let Some(cause) = source {
                trace.push_str(&format!("\ncaused by: {cause}"));
                source = cause.source();
            }
            trace
        } else {
            String::new()
        };

        ExceptionPacket {
            code: self.code(),
            name: self.name().to_string(),
            message: self.to_string(),
            stack_trace,
            nested: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_violations_are_fatal() {
        for kind in [
            UnexpectedPacket::Hello,
            UnexpectedPacket::TablesStatusRequest,
            UnexpectedPacket::IgnoredPartUUIDs,
            UnexpectedPacket::QueryWhileExecuting,
        ] {
            assert!(ConnectionError::from(kind).is_fatal(), "{kind:?}");
        }
        assert!(!ConnectionError::from(UnexpectedPacket::InputWhileIdle(PacketKind::Data)).is_fatal());
    }

    #[test]
    fn violations_are_distinguishable() {
        let names: Vec<_> = [
            UnexpectedPacket::Hello,
            UnexpectedPacket::Addendum,
            UnexpectedPacket::TablesStatusRequest,
            UnexpectedPacket::IgnoredPartUUIDs,
            UnexpectedPacket::QueryWhileExecuting,
        ]
        .iter()
        .map(UnexpectedPacket::name)
        .collect();

        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn stack_trace_follows_policy() {
        let err = ConnectionError::Engine(EngineError::Execution("boom".to_string()));

        let with = err.to_exception(true);
        let without = err.to_exception(false);

        assert_eq!(with.message, "boom");
        assert_eq!(with.code, 395);
        assert!(!with.stack_trace.is_empty());
        assert!(without.stack_trace.is_empty());
    }

    #[test]
    fn disconnects_are_recognised_on_read() {
        let eof = TransportError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));

        assert!(matches!(
            ConnectionError::from_read(eof),
            ConnectionError::Disconnected
        ));
    }
}
