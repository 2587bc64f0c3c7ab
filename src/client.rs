//! Blocking client for the native protocol.
//!
//! Used by the command line client and the tests. It speaks the same packets as
//! the server and can act as an ordinary user, or as another server of a cluster
//! using the inter-server secret.
use std::{
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::debug;
use thiserror::Error;

use crate::{
    block::{Block, BlockError, Compression, decode_block, encode_block},
    connection::{handshake::INTERSERVER_USER, interserver_hash},
    protocol::{
        Addendum, ClientHello, ClientInfo, ExceptionPacket, Framing, InterserverHello,
        ProfileInfo, ProtocolTransport, QualifiedTableName, QueryPacket, QueryStage, Request,
        Response, ServerHello, Setting, TableStatus, TablesStatusRequest, TransportError,
        revision::{MIN_REVISION_WITH_ADDENDUM, MIN_REVISION_WITH_CHUNKED_PACKETS, SERVER_REVISION},
    },
    telemetry::Progress,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error("server error {}: {}", .0.code, .0.message)]
    Server(ExceptionPacket),

    #[error("unexpected {0} packet from server")]
    UnexpectedResponse(&'static str),
}

impl From<std::io::Error> for ClientError {
    fn from(value: std::io::Error) -> Self {
        ClientError::Transport(value.into())
    }
}

/// Credentials of a server acting on behalf of another one.
#[derive(Debug, Clone)]
pub struct InterserverOptions {
    pub cluster: String,
    pub secret: String,
    pub salt: String,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user: String,
    pub password: String,
    pub database: String,
    pub client_name: String,
    /// Revision announced to the server.
    pub revision: u64,
    pub proto_send_chunked: String,
    pub proto_recv_chunked: String,
    pub quota_key: String,
    pub interserver: Option<InterserverOptions>,
    /// Raw PROXY protocol line sent before the hello.
    pub proxy_header: Option<String>,
    pub compression: Compression,
    pub read_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user: "default".to_string(),
            password: String::new(),
            database: String::new(),
            client_name: "nativewire-client".to_string(),
            revision: SERVER_REVISION,
            proto_send_chunked: "notchunked_optional".to_string(),
            proto_recv_chunked: "notchunked_optional".to_string(),
            quota_key: String::new(),
            interserver: None,
            proxy_header: None,
            compression: Compression::Disable,
            read_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Everything the server sent for one query.
#[derive(Debug, Default)]
pub struct QueryResult {
    /// Decoded Data packets, including header-only blocks.
    pub blocks: Vec<Block>,
    pub progress: Progress,
    pub logs: Vec<Block>,
    pub profile_events: Vec<Block>,
    pub profile_info: Option<ProfileInfo>,
    pub totals: Option<Block>,
    pub extremes: Option<Block>,
    /// Names of all packets received, in order.
    pub packets: Vec<&'static str>,
}

impl QueryResult {
    pub fn rows(&self) -> usize {
        self.blocks.iter().map(Block::rows).sum()
    }
}

pub struct Client {
    transport: ProtocolTransport<TcpStream>,
    server: ServerHello,
    revision: u64,
    compression: Compression,
    interserver: Option<InterserverOptions>,
    user: String,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(address: A, options: ClientOptions) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(options.read_timeout)?;
        let mut transport = ProtocolTransport::new(stream);

        if let Some(header) = &options.proxy_header {
            transport.write_raw(header.as_bytes())?;
        }

        let user = match &options.interserver {
            Some(_) => INTERSERVER_USER.to_string(),
            None => options.user.clone(),
        };
        transport.write_request(&Request::Hello(ClientHello {
            client_name: options.client_name.clone(),
            version_major: 1,
            version_minor: 0,
            revision: options.revision,
            database: options.database.clone(),
            user,
            password: options.password.clone(),
            proto_send_chunked: options.proto_send_chunked.clone(),
            proto_recv_chunked: options.proto_recv_chunked.clone(),
            interserver: options.interserver.as_ref().map(|link| InterserverHello {
                cluster: link.cluster.clone(),
                salt: link.salt.clone(),
            }),
        }))?;

        let server = match transport.read_response()? {
            Response::Hello(hello) => hello,
            Response::Exception(e) => return Err(ClientError::Server(e)),
            other => return Err(ClientError::UnexpectedResponse(other.name())),
        };
        let revision = options.revision.min(server.revision);
        debug!("connected to {} revision {}", server.name, server.revision);

        if revision >= MIN_REVISION_WITH_ADDENDUM {
            transport.write_request(&Request::Addendum(Addendum {
                quota_key: options.quota_key.clone(),
            }))?;
        }
        if revision >= MIN_REVISION_WITH_CHUNKED_PACKETS {
            let label = |label: &Option<String>| {
                label.clone().unwrap_or_else(|| "notchunked".to_string())
            };
            let send = Framing::negotiate(&label(&server.proto_recv_chunked), &options.proto_send_chunked)?;
            let recv = Framing::negotiate(&label(&server.proto_send_chunked), &options.proto_recv_chunked)?;
            transport.set_framing(send, recv);
        }

        Ok(Self {
            transport,
            server,
            revision,
            compression: options.compression,
            interserver: options.interserver,
            user: options.user,
        })
    }

    pub fn server_hello(&self) -> &ServerHello {
        &self.server
    }

    /// Negotiated protocol revision.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn stream(&self) -> &TcpStream {
        self.transport.get_ref()
    }

    pub fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        Ok(self.transport.write_request(request)?)
    }

    pub fn receive(&mut self) -> Result<Response, ClientError> {
        Ok(self.transport.read_response()?)
    }

    /// Builds the Query packet for `query`, signed when this is an inter-server link.
    pub fn query_packet(&self, query_id: &str, query: &str, settings: &[(&str, &str)]) -> QueryPacket {
        let client_info = ClientInfo {
            initial_user: self.user.clone(),
            initial_query_id: query_id.to_string(),
            ..ClientInfo::default()
        };
        let interserver_hash = self.interserver.as_ref().map(|link| {
            interserver_hash(
                &link.salt,
                self.server.nonce,
                &link.secret,
                query,
                query_id,
                &client_info.initial_user,
            )
        });

        QueryPacket {
            query_id: query_id.to_string(),
            client_info,
            settings: settings
                .iter()
                .map(|(name, value)| Setting::new(name, value))
                .collect(),
            interserver_hash,
            stage: QueryStage::Complete,
            compression: self.compression,
            query: query.to_string(),
            parameters: Vec::new(),
        }
    }

    /// Sends a Query packet followed by the empty block that ends its inputs.
    pub fn send_query_packet(&mut self, packet: QueryPacket) -> Result<(), ClientError> {
        self.send(&Request::Query(packet))?;
        self.send_data(&Block::new())
    }

    pub fn send_query(&mut self, query: &str, settings: &[(&str, &str)]) -> Result<(), ClientError> {
        let packet = self.query_packet("", query, settings);
        self.send_query_packet(packet)
    }

    pub fn send_data(&mut self, block: &Block) -> Result<(), ClientError> {
        let payload = encode_block(block, self.compression)?;
        self.send(&Request::Data { payload })
    }

    pub fn cancel(&mut self) -> Result<(), ClientError> {
        self.send(&Request::Cancel)
    }

    /// Reads packets until EndOfStream. An Exception ends the query with an error.
    pub fn receive_result(&mut self) -> Result<QueryResult, ClientError> {
        let mut result = QueryResult::default();
        loop {
            let packet = self.receive()?;
            result.packets.push(packet.name());
            match packet {
                Response::Data { payload, .. } => {
                    result.blocks.push(decode_block(&payload, self.compression)?);
                }
                Response::Progress(progress) => result.progress.add(&progress),
                Response::Log { payload } => {
                    result.logs.push(decode_block(&payload, Compression::Disable)?);
                }
                Response::ProfileEvents { payload } => {
                    result
                        .profile_events
                        .push(decode_block(&payload, Compression::Disable)?);
                }
                Response::ProfileInfo(info) => result.profile_info = Some(info),
                Response::Totals { payload } => {
                    result.totals = Some(decode_block(&payload, self.compression)?);
                }
                Response::Extremes { payload } => {
                    result.extremes = Some(decode_block(&payload, self.compression)?);
                }
                Response::TableColumns { .. }
                | Response::TimezoneUpdate(_)
                | Response::PartUUIDs(_) => {}
                Response::EndOfStream => return Ok(result),
                Response::Exception(e) => return Err(ClientError::Server(e)),
                other => return Err(ClientError::UnexpectedResponse(other.name())),
            }
        }
    }

    pub fn query(&mut self, query: &str) -> Result<QueryResult, ClientError> {
        self.query_with_settings(query, &[])
    }

    pub fn query_with_settings(
        &mut self,
        query: &str,
        settings: &[(&str, &str)],
    ) -> Result<QueryResult, ClientError> {
        self.send_query(query, settings)?;
        self.receive_result()
    }

    /// Reads packets up to the Data packet carrying the insert structure.
    pub fn receive_insert_header(&mut self) -> Result<Block, ClientError> {
        loop {
            match self.receive()? {
                Response::Data { payload, .. } => return Ok(decode_block(&payload, self.compression)?),
                Response::TableColumns { .. }
                | Response::TimezoneUpdate(_)
                | Response::Progress(_)
                | Response::Log { .. }
                | Response::ProfileEvents { .. } => {}
                Response::Exception(e) => return Err(ClientError::Server(e)),
                other => return Err(ClientError::UnexpectedResponse(other.name())),
            }
        }
    }

    /// Runs a bare INSERT, streaming `blocks` after the server announced the structure.
    pub fn insert(&mut self, query: &str, blocks: &[Block]) -> Result<QueryResult, ClientError> {
        self.insert_with_settings(query, blocks, &[])
    }

    pub fn insert_with_settings(
        &mut self,
        query: &str,
        blocks: &[Block],
        settings: &[(&str, &str)],
    ) -> Result<QueryResult, ClientError> {
        self.send_query(query, settings)?;
        self.receive_insert_header()?;
        for block in blocks {
            self.send_data(block)?;
        }
        self.send_data(&Block::new())?;
        self.receive_result()
    }

    pub fn ping(&mut self) -> Result<(), ClientError> {
        self.send(&Request::Ping)?;
        match self.receive()? {
            Response::Pong => Ok(()),
            Response::Exception(e) => Err(ClientError::Server(e)),
            other => Err(ClientError::UnexpectedResponse(other.name())),
        }
    }

    pub fn tables_status(
        &mut self,
        tables: Vec<QualifiedTableName>,
    ) -> Result<Vec<(QualifiedTableName, TableStatus)>, ClientError> {
        self.send(&Request::TablesStatusRequest(TablesStatusRequest { tables }))?;
        match self.receive()? {
            Response::TablesStatusResponse(response) => Ok(response.tables),
            Response::Exception(e) => Err(ClientError::Server(e)),
            other => Err(ClientError::UnexpectedResponse(other.name())),
        }
    }
}
