//! Server side of one client connection.
//!
//! [`serve`] runs on a pool thread for the whole life of a connection: it performs
//! the handshake, then alternates between waiting for the next request and running
//! a query. The connection thread is the only reader of the socket. Writes go
//! through a [`PacketSender`] so pipeline threads can send read task requests while
//! the connection thread streams results.
use std::{
    net::{SocketAddr, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::{
    block::decode_block,
    engine::{AsyncInsertQueue, Authenticator, QueryEngine},
    protocol::{
        PacketReader, Request, Response, TablesStatusRequest, TablesStatusResponse,
        TransportError,
    },
    settings::{ConnectionSettings, ServerSettings},
};

mod error;
pub mod handshake;
mod query;
pub mod state;
mod streaming;
mod tasks;
#[cfg(test)]
mod tests;

pub use error::{ConnectionError, UnexpectedPacket};
pub use handshake::{HandshakeError, Session, interserver_hash};
pub use state::{CancellationStatus, QueryPhase, QueryState};
pub use streaming::PacketSender;
pub use tasks::QueryControl;

use state::LastBlockInputParameters;

/// Shortest wait between two checks of the socket.
const MIN_POLL: Duration = Duration::from_millis(1);

/// Everything connections share.
pub struct ServerContext {
    pub settings: ServerSettings,
    pub authenticator: Arc<dyn Authenticator>,
    pub engine: Arc<dyn QueryEngine>,
    /// Queue for inserts run with `async_insert`. Without one, such inserts are
    /// written synchronously.
    pub async_inserts: Option<Arc<dyn AsyncInsertQueue>>,
    pub shutdown: Arc<AtomicBool>,
}

impl ServerContext {
    pub fn new(
        settings: ServerSettings,
        authenticator: Arc<dyn Authenticator>,
        engine: Arc<dyn QueryEngine>,
    ) -> Self {
        Self {
            settings,
            authenticator,
            engine,
            async_inserts: None,
            shutdown: Arc::default(),
        }
    }

    pub fn with_async_inserts(mut self, queue: Arc<dyn AsyncInsertQueue>) -> Self {
        self.async_inserts = Some(queue);
        self
    }
}

/// Serves one accepted connection until it closes.
pub fn serve(stream: TcpStream, peer: SocketAddr, server: Arc<ServerContext>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not disable Nagle's algorithm for {peer}: {e}");
    }
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            warn!("dropping connection from {peer}: {e}");
            return;
        }
    };
    let mut reader = PacketReader::new(stream);

    let session = match handshake::handshake(&mut reader, &mut writer, &server, peer) {
        Ok(session) => session,
        Err(e) => {
            warn!("handshake with {peer} failed: {e}");
            handshake::reject(&mut writer, &e, !server.settings.hide_stack_trace);
            return;
        }
    };

    let sender = match PacketSender::spawn(writer, session.send_framing, session.settings.send_timeout)
    {
        Ok(sender) => sender,
        Err(e) => {
            warn!("dropping connection from {peer}: {e}");
            return;
        }
    };

    let mut connection = Connection::new(server, session, reader, sender);
    match connection.run() {
        Ok(()) | Err(ConnectionError::Disconnected) => info!("connection from {peer} closed"),
        Err(e) => warn!("connection from {peer} closed: {e}"),
    }
}

pub struct Connection {
    server: Arc<ServerContext>,
    session: Session,
    reader: PacketReader,
    sender: PacketSender,
    state: QueryState,
    last_block_in: LastBlockInputParameters,
    /// Parts to skip, received ahead of the query they apply to.
    pending_part_uuids: Option<Vec<Uuid>>,
    /// Set after a failed insert: data blocks still in flight from the client are
    /// dropped without an error until the next query.
    discard_stray_data: bool,
}

impl Connection {
    fn new(
        server: Arc<ServerContext>,
        session: Session,
        reader: PacketReader,
        sender: PacketSender,
    ) -> Self {
        Self {
            server,
            session,
            reader,
            sender,
            state: QueryState::default(),
            last_block_in: LastBlockInputParameters::default(),
            pending_part_uuids: None,
            discard_stray_data: false,
        }
    }

    /// Settings in effect: the running query's, or the session's between queries.
    fn settings(&self) -> &ConnectionSettings {
        self.state.settings.as_ref().unwrap_or(&self.session.settings)
    }

    /// Serves requests until the client leaves, the connection idles out, the
    /// server shuts down, or a fatal error occurs. Fatal errors are reported to the
    /// client before returning.
    pub fn run(&mut self) -> Result<(), ConnectionError> {
        let result = self.serve_requests();

        if let Err(e) = &result {
            if !matches!(e, ConnectionError::Disconnected) {
                if let Err(send) = self.send_exception(e).and_then(|_| self.sender.flush()) {
                    debug!("could not report fatal error: {send}");
                }
            }
        }
        self.state.reset();
        result
    }

    fn serve_requests(&mut self) -> Result<(), ConnectionError> {
        loop {
            let (send, receive) = (
                self.session.settings.send_timeout,
                self.session.settings.receive_timeout,
            );
            self.set_socket_timeouts(send, receive)?;
            if !self.wait_for_request()? {
                return Ok(());
            }
            let request = self.reader.read_request().map_err(ConnectionError::from_read)?;
            self.handle_idle(request)?;
        }
    }

    /// Bounds blocking reads and writes on the socket. Zero means no limit. The
    /// writer thread shares the socket, so `send` also bounds its writes.
    fn set_socket_timeouts(
        &mut self,
        send: Duration,
        receive: Duration,
    ) -> Result<(), ConnectionError> {
        self.reader.set_read_timeout(receive)?;
        self.reader
            .stream()
            .set_write_timeout(Some(send).filter(|t| !t.is_zero()))
            .map_err(TransportError::from)?;
        Ok(())
    }

    /// Waits for the next request in `poll_interval` slices. Returns false when the
    /// connection should close instead. A zero `idle_connection_timeout` never
    /// closes the connection.
    fn wait_for_request(&mut self) -> Result<bool, ConnectionError> {
        let idle_since = Instant::now();
        loop {
            if self.server.shutdown.load(Ordering::Acquire) {
                info!("closing idle connection: server is shutting down");
                return Ok(false);
            }

            let mut slice = self.session.settings.poll_interval;
            let timeout = self.session.settings.idle_connection_timeout;
            if !timeout.is_zero() {
                let idle = idle_since.elapsed();
                if idle >= timeout {
                    info!("closing connection idle for {idle:?}");
                    return Ok(false);
                }
                slice = slice.min(timeout - idle);
            }

            let slice = slice.max(MIN_POLL);
            if self.reader.poll(slice).map_err(ConnectionError::from_read)? {
                return Ok(true);
            }
        }
    }

    fn handle_idle(&mut self, request: Request) -> Result<(), ConnectionError> {
        match request {
            Request::Ping => self.sender.send(Response::Pong),
            Request::Cancel => {
                debug!("ignoring Cancel: no query is running");
                Ok(())
            }
            Request::TablesStatusRequest(request) => self.send_tables_status(request),
            Request::IgnoredPartUUIDs(uuids) => {
                debug!("{} parts will be skipped by the next query", uuids.len());
                self.pending_part_uuids = Some(uuids.into_iter().map(Uuid::from_bytes).collect());
                Ok(())
            }
            Request::Query(packet) => {
                self.discard_stray_data = false;
                self.process_query(packet)
            }
            Request::Data { payload } if self.discard_stray_data => {
                match decode_block(&payload, self.last_block_in.compression) {
                    Ok(block) => debug!("discarding {} rows of a failed insert", block.rows()),
                    Err(e) => debug!("discarding undecodable data of a failed insert: {e}"),
                }
                Ok(())
            }
            other => {
                let error = self.unexpected(QueryPhase::Idle, &other);
                if error.is_fatal() {
                    return Err(error);
                }
                warn!("{error}");
                self.send_exception(&error)
            }
        }
    }

    fn send_tables_status(&mut self, request: TablesStatusRequest) -> Result<(), ConnectionError> {
        let tables = self.server.engine.tables_status(&request.tables);
        self.sender
            .send(Response::TablesStatusResponse(TablesStatusResponse { tables }))
    }

    /// The error for receiving `request` in `phase`.
    fn unexpected(&self, phase: QueryPhase, request: &Request) -> ConnectionError {
        let kind = request.kind();
        match phase.violation(kind) {
            Some(violation) => violation.into(),
            None => ConnectionError::InvalidPacket(format!("{kind} cannot be handled here")),
        }
    }
}
