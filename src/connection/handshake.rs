//! Session establishment.
//!
//! The handshake runs once per connection, before any query:
//!
//! 1. an optional PROXY protocol v1 line carrying the original client address,
//! 2. the client Hello (identity, revision, credentials or inter-server salt),
//! 3. the server Hello, with fields gated by the negotiated revision,
//! 4. the client Addendum (quota key) on revisions that have it.
//!
//! Chunked framing, when negotiated, applies to everything after the Addendum.
//! Any failure here closes the connection.
use std::{
    io::{BufRead, BufWriter, Read, Write},
    net::{IpAddr, SocketAddr, TcpStream},
};

use log::{debug, info};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    engine::AuthError,
    protocol::{
        ClientHello, Framing, PacketKind, PacketReader, QueryPacket, Request, Response,
        ServerHello, TransportError,
        revision::{self, *},
        write_packet,
    },
    settings::ConnectionSettings,
};

use super::{ConnectionError, ServerContext};

/// User name that marks an inter-server hello.
pub const INTERSERVER_USER: &str = " INTERSERVER SECRET ";

pub const SERVER_NAME: &str = "nativewire";

/// Longest PROXY v1 header line, terminator included.
const MAX_PROXY_HEADER: u64 = 107;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unexpected packet {0} from client, expected Hello")]
    ExpectedHello(PacketKind),

    #[error("unexpected packet {0} from client, expected Addendum")]
    ExpectedAddendum(PacketKind),

    #[error("client revision {0} is older than the oldest supported revision")]
    ClientTooOld(u64),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("inter-server hello without cluster and salt")]
    MissingInterserverHello,

    #[error("inter-server secret is not supported by client revision {0}")]
    InterserverUnsupported(u64),

    #[error("no inter-server secret configured for cluster '{0}'")]
    UnknownCluster(String),

    #[error("inter-server query hash does not match")]
    InterserverHashMismatch,

    #[error("initial user '{0}' of an inter-server query does not exist")]
    UnknownInitialUser(String),

    #[error(transparent)]
    Framing(TransportError),

    #[error("invalid PROXY protocol header: {0}")]
    ProxyHeader(String),
}

impl HandshakeError {
    pub fn code(&self) -> i32 {
        match self {
            HandshakeError::ExpectedHello(_) => 101,
            HandshakeError::ExpectedAddendum(_) => 101,
            HandshakeError::ClientTooOld(_) => 217,
            HandshakeError::Auth(_)
            | HandshakeError::InterserverHashMismatch
            | HandshakeError::UnknownInitialUser(_) => 516,
            HandshakeError::MissingInterserverHello
            | HandshakeError::InterserverUnsupported(_)
            | HandshakeError::UnknownCluster(_) => 516,
            HandshakeError::Framing(_) => 102,
            HandshakeError::ProxyHeader(_) => 27,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HandshakeError::ExpectedHello(_) | HandshakeError::ExpectedAddendum(_) => {
                "UNEXPECTED_PACKET_FROM_CLIENT"
            }
            HandshakeError::ClientTooOld(_) => "CLIENT_HAS_CONNECTED_TO_WRONG_PORT",
            HandshakeError::Framing(_) => "UNEXPECTED_PACKET_FROM_CLIENT",
            HandshakeError::ProxyHeader(_) => "CANNOT_PARSE_INPUT_ASSERTION_FAILED",
            _ => "AUTHENTICATION_FAILED",
        }
    }
}

/// Secret exchange of an inter-server link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterserverSession {
    pub cluster: String,
    pub salt: String,
    pub nonce: Option<u64>,
    secret: String,
}

/// An established connection: who is talking, and how.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_name: String,
    pub client_version: (u64, u64),
    pub client_revision: u64,
    /// Negotiated protocol revision.
    pub revision: u64,
    pub user: String,
    pub database: String,
    pub quota_key: String,
    pub peer: SocketAddr,
    /// Address reported by a PROXY header. Only used for auditing.
    pub forwarded_for: Option<String>,
    pub interserver: Option<InterserverSession>,
    pub send_framing: Framing,
    pub recv_framing: Framing,
    pub settings: ConnectionSettings,
    pub timezone: String,
    pub display_name: String,
}

impl Session {
    pub fn supports(&self, min_revision: u64) -> bool {
        self.revision >= min_revision
    }

    /// Checks the signature of an inter-server query and returns the user the query
    /// runs as. Ordinary sessions run queries as their own user.
    pub fn query_user(
        &self,
        query: &QueryPacket,
        server: &ServerContext,
    ) -> Result<String, HandshakeError> {
        let Some(link) = &self.interserver else {
            return Ok(self.user.clone());
        };

        let expected = interserver_hash(
            &link.salt,
            link.nonce,
            &link.secret,
            &query.query,
            &query.query_id,
            &query.client_info.initial_user,
        );
        if query.interserver_hash.as_deref() != Some(expected.as_slice()) {
            return Err(HandshakeError::InterserverHashMismatch);
        }

        let user = &query.client_info.initial_user;
        if !server.authenticator.user_exists(user) {
            return Err(HandshakeError::UnknownInitialUser(user.clone()));
        }
        Ok(user.clone())
    }
}

/// Signature of an inter-server query.
pub fn interserver_hash(
    salt: &str,
    nonce: Option<u64>,
    secret: &str,
    query: &str,
    query_id: &str,
    initial_user: &str,
) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    if let Some(nonce) = nonce {
        hasher.update(nonce.to_string().as_bytes());
    }
    hasher.update(secret.as_bytes());
    hasher.update(query.as_bytes());
    hasher.update(query_id.as_bytes());
    hasher.update(initial_user.as_bytes());
    hasher.finalize().to_vec()
}

/// Parses a PROXY v1 line. Returns the source address, or `None` for
/// `PROXY UNKNOWN`.
pub fn parse_proxy_header(line: &str) -> Result<Option<String>, HandshakeError> {
    let bad = |reason: &str| HandshakeError::ProxyHeader(reason.to_string());
    let line = line
        .strip_suffix("\r\n")
        .ok_or_else(|| bad("missing CRLF terminator"))?;
    let mut fields = line.split(' ');

    if fields.next() != Some("PROXY") {
        return Err(bad("missing PROXY signature"));
    }
    match fields.next() {
        Some("UNKNOWN") => Ok(None),
        Some("TCP4") | Some("TCP6") => {
            let (Some(src), Some(dst), Some(sport), Some(dport), None) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                return Err(bad("expected source, destination and ports"));
            };
            if src.parse::<IpAddr>().is_err() || dst.parse::<IpAddr>().is_err() {
                return Err(bad("invalid address"));
            }
            if sport.parse::<u16>().is_err() || dport.parse::<u16>().is_err() {
                return Err(bad("invalid port"));
            }
            Ok(Some(src.to_string()))
        }
        _ => Err(bad("unknown protocol family")),
    }
}

fn read_proxy_header(reader: &mut PacketReader) -> Result<Option<String>, ConnectionError> {
    let mut line = Vec::new();
    reader
        .raw()
        .take(MAX_PROXY_HEADER)
        .read_until(b'\n', &mut line)
        .map_err(|e| ConnectionError::from_read(e.into()))?;
    let line = String::from_utf8(line)
        .map_err(|_| HandshakeError::ProxyHeader("not ASCII".to_string()))?;
    Ok(parse_proxy_header(&line)?)
}

fn send_plain(writer: &mut TcpStream, packet: &Response) -> Result<(), ConnectionError> {
    let mut out = BufWriter::new(writer);
    write_packet(&mut out, packet, Framing::Plain)?;
    out.flush().map_err(TransportError::from)?;
    Ok(())
}

fn version_part(part: &str) -> u64 {
    part.parse().unwrap_or_default()
}

/// Runs the handshake. On error the caller reports it to the client, whose
/// packets are still plain-framed at that point.
pub fn handshake(
    reader: &mut PacketReader,
    writer: &mut TcpStream,
    server: &ServerContext,
    peer: SocketAddr,
) -> Result<Session, ConnectionError> {
    let settings = &server.settings;
    let connection_settings = ConnectionSettings::from(settings);
    reader.set_read_timeout(connection_settings.receive_timeout)?;

    let forwarded_for = if settings.proxy_protocol {
        read_proxy_header(reader)?
    } else {
        None
    };

    let hello: ClientHello = match reader.read_request().map_err(ConnectionError::from_read)? {
        Request::Hello(hello) => hello,
        other => return Err(HandshakeError::ExpectedHello(other.kind()).into()),
    };
    if hello.revision < MIN_CLIENT_REVISION {
        return Err(HandshakeError::ClientTooOld(hello.revision).into());
    }
    let revision = revision::negotiate(hello.revision);

    let interserver = if hello.user == INTERSERVER_USER {
        if revision < MIN_REVISION_WITH_INTERSERVER_SECRET {
            return Err(HandshakeError::InterserverUnsupported(revision).into());
        }
        let link = hello
            .interserver
            .as_ref()
            .ok_or(HandshakeError::MissingInterserverHello)?;
        let secret = settings
            .cluster_secret(&link.cluster)
            .ok_or_else(|| HandshakeError::UnknownCluster(link.cluster.clone()))?;
        Some(InterserverSession {
            cluster: link.cluster.clone(),
            salt: link.salt.clone(),
            nonce: (revision >= MIN_REVISION_WITH_INTERSERVER_SECRET_V2).then(rand::random),
            secret: secret.to_string(),
        })
    } else {
        server
            .authenticator
            .authenticate(&hello.user, &hello.password, peer)
            .map_err(HandshakeError::from)?;
        None
    };

    let (send_framing, recv_framing) = if revision >= MIN_REVISION_WITH_CHUNKED_PACKETS {
        (
            Framing::negotiate(&settings.proto_caps_send, &hello.proto_recv_chunked)
                .map_err(HandshakeError::Framing)?,
            Framing::negotiate(&settings.proto_caps_recv, &hello.proto_send_chunked)
                .map_err(HandshakeError::Framing)?,
        )
    } else {
        (Framing::Plain, Framing::Plain)
    };

    let display_name = settings
        .display_name
        .clone()
        .unwrap_or_else(|| SERVER_NAME.to_string());
    let gated = |min: u64| revision >= min;
    let server_hello = ServerHello {
        name: SERVER_NAME.to_string(),
        version_major: version_part(env!("CARGO_PKG_VERSION_MAJOR")),
        version_minor: version_part(env!("CARGO_PKG_VERSION_MINOR")),
        revision: revision::SERVER_REVISION,
        timezone: gated(MIN_REVISION_WITH_SERVER_TIMEZONE).then(|| settings.timezone.clone()),
        display_name: gated(MIN_REVISION_WITH_SERVER_DISPLAY_NAME).then(|| display_name.clone()),
        version_patch: gated(MIN_REVISION_WITH_VERSION_PATCH)
            .then(|| version_part(env!("CARGO_PKG_VERSION_PATCH"))),
        proto_send_chunked: gated(MIN_REVISION_WITH_CHUNKED_PACKETS)
            .then(|| settings.proto_caps_send.clone()),
        proto_recv_chunked: gated(MIN_REVISION_WITH_CHUNKED_PACKETS)
            .then(|| settings.proto_caps_recv.clone()),
        nonce: interserver.as_ref().and_then(|link| link.nonce),
    };
    send_plain(writer, &Response::Hello(server_hello))?;

    let mut quota_key = String::new();
    if revision >= MIN_REVISION_WITH_ADDENDUM {
        match reader.read_request().map_err(ConnectionError::from_read)? {
            Request::Addendum(addendum) => quota_key = addendum.quota_key,
            other => return Err(HandshakeError::ExpectedAddendum(other.kind()).into()),
        }
    }
    reader.set_framing(recv_framing);

    let user = if interserver.is_some() {
        String::new()
    } else {
        hello.user.clone()
    };
    info!(
        "connected {} {}.{}, revision {} (negotiated {revision}), user '{}' from {peer}{}",
        hello.client_name,
        hello.version_major,
        hello.version_minor,
        hello.revision,
        if interserver.is_some() { INTERSERVER_USER.trim() } else { user.as_str() },
        forwarded_for
            .as_deref()
            .map(|addr| format!(" (forwarded for {addr})"))
            .unwrap_or_default(),
    );
    debug!("framing: send {send_framing:?}, receive {recv_framing:?}");

    Ok(Session {
        client_name: hello.client_name,
        client_version: (hello.version_major, hello.version_minor),
        client_revision: hello.revision,
        revision,
        user,
        database: if hello.database.is_empty() {
            "default".to_string()
        } else {
            hello.database
        },
        quota_key,
        peer,
        forwarded_for,
        interserver,
        send_framing,
        recv_framing,
        settings: connection_settings,
        timezone: settings.timezone.clone(),
        display_name,
    })
}

/// Reports a handshake failure. Best effort: the connection closes either way.
pub fn reject(writer: &mut TcpStream, error: &ConnectionError, with_stack_trace: bool) {
    if matches!(error, ConnectionError::Disconnected) {
        return;
    }
    let packet = Response::Exception(error.to_exception(with_stack_trace));
    if let Err(e) = send_plain(writer, &packet) {
        debug!("could not report handshake failure: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_header_tcp4() {
        let addr = parse_proxy_header("PROXY TCP4 192.168.0.1 10.0.0.1 56324 9000\r\n").unwrap();

        assert_eq!(addr.as_deref(), Some("192.168.0.1"));
    }

    #[test]
    fn proxy_header_unknown() {
        assert_eq!(parse_proxy_header("PROXY UNKNOWN\r\n").unwrap(), None);
    }

    #[test]
    #[should_panic(expected = "ProxyHeader")]
    fn proxy_header_requires_crlf() {
        parse_proxy_header("PROXY TCP4 1.1.1.1 2.2.2.2 1 2\n").unwrap();
    }

    #[test]
    fn proxy_header_rejects_bad_ports() {
        assert!(parse_proxy_header("PROXY TCP6 ::1 ::1 70000 9000\r\n").is_err());
    }

    #[test]
    fn interserver_hash_depends_on_every_input() {
        let base = interserver_hash("salt", Some(7), "secret", "SELECT 1", "q", "alice");

        assert_eq!(base.len(), 32);
        assert_ne!(base, interserver_hash("salt", Some(8), "secret", "SELECT 1", "q", "alice"));
        assert_ne!(base, interserver_hash("salt", Some(7), "other", "SELECT 1", "q", "alice"));
        assert_ne!(base, interserver_hash("salt", Some(7), "secret", "SELECT 2", "q", "alice"));
        assert_ne!(base, interserver_hash("salt", None, "secret", "SELECT 1", "q", "alice"));
    }
}
