//! Outbound packets.
//!
//! Every packet to the client goes through one [`PacketSender`]. Senders are cheap
//! clones of a bounded queue drained by a single writer thread, so packets produced
//! by the connection thread and by pipeline threads never interleave on the socket.
//! A client that reads slowly fills the queue, and producers then wait for it.
//! Result packets still queued when a query is fully cancelled are dropped.
use std::{
    io::{BufWriter, Write},
    net::{Shutdown, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, TryRecvError},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    block::{Block, Compression, encode_block},
    protocol::{
        ExceptionPacket, Framing, ProfileInfo, Response, TransportError,
        revision::{
            MIN_REVISION_WITH_PROFILE_EVENTS, MIN_REVISION_WITH_PROGRESS_ELAPSED,
            MIN_REVISION_WITH_TABLE_COLUMNS, MIN_REVISION_WITH_TIMEZONE_UPDATES,
        },
        write_packet,
    },
    telemetry::{logs_block, profile_events_block},
};

use super::{Connection, ConnectionError};

/// Packets queued ahead of the writer before senders have to wait.
pub const SEND_QUEUE_LEN: usize = 16;

enum Outbound {
    /// A packet and the discard generation it was queued in.
    Packet(Response, u64),
    Flush(mpsc::Sender<()>),
}

/// Handle to the writer thread of a connection.
#[derive(Clone)]
pub struct PacketSender {
    tx: mpsc::SyncSender<Outbound>,
    closed: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl PacketSender {
    /// Starts the writer thread for `stream`. Writes block for at most the socket's
    /// write timeout, initially `send_timeout`; a write that fails closes the socket.
    pub fn spawn(
        stream: TcpStream,
        framing: Framing,
        send_timeout: Duration,
    ) -> Result<Self, TransportError> {
        stream.set_write_timeout(Some(send_timeout).filter(|t| !t.is_zero()))?;
        let socket = stream.try_clone()?;
        Self::with_writer(stream, framing, move || {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                debug!("socket shutdown failed: {e}");
            }
        })
    }

    /// Starts a writer thread for any byte sink. `on_failure` runs once if writing
    /// fails.
    pub fn with_writer<W, F>(out: W, framing: Framing, on_failure: F) -> Result<Self, TransportError>
    where
        W: Write + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(SEND_QUEUE_LEN);
        let closed = Arc::new(AtomicBool::new(false));
        let generation = Arc::new(AtomicU64::new(0));
        let flag = Arc::clone(&closed);
        let current = Arc::clone(&generation);

        thread::Builder::new()
            .name("packet-writer".to_string())
            .spawn(move || {
                if let Err(e) = write_loop(out, framing, &rx, &current) {
                    warn!("failed to send to client: {e}");
                    flag.store(true, Ordering::Release);
                    on_failure();
                }
            })?;

        Ok(Self {
            tx,
            closed,
            generation,
        })
    }

    /// Queues a packet, waiting while the queue is full. Fails once the writer has
    /// given up on the client.
    pub fn send(&self, packet: Response) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Disconnected);
        }
        let generation = self.generation.load(Ordering::Acquire);
        self.tx
            .send(Outbound::Packet(packet, generation))
            .map_err(|_| ConnectionError::Disconnected)
    }

    /// Drops the Data, Totals and Extremes packets queued so far instead of writing
    /// them. Everything else, and anything sent afterwards, is still written.
    pub fn discard_queued_results(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Waits until everything queued so far has been written to the socket.
    pub fn flush(&self) -> Result<(), ConnectionError> {
        let (ack, done) = mpsc::channel();
        self.tx
            .send(Outbound::Flush(ack))
            .map_err(|_| ConnectionError::Disconnected)?;
        done.recv().map_err(|_| ConnectionError::Disconnected)
    }
}

fn is_result(packet: &Response) -> bool {
    matches!(
        packet,
        Response::Data { .. } | Response::Totals { .. } | Response::Extremes { .. }
    )
}

fn write_loop<W: Write>(
    out: W,
    framing: Framing,
    rx: &mpsc::Receiver<Outbound>,
    generation: &AtomicU64,
) -> Result<(), TransportError> {
    let mut out = BufWriter::new(out);
    let mut discarded = 0usize;

    loop {
        let next = match rx.try_recv() {
            Ok(next) => next,
            Err(TryRecvError::Empty) => {
                out.flush()?;
                match rx.recv() {
                    Ok(next) => next,
                    Err(_) => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };

        match next {
            Outbound::Packet(packet, queued_in)
                if queued_in < generation.load(Ordering::Acquire) && is_result(&packet) =>
            {
                discarded += 1;
            }
            Outbound::Packet(packet, _) => {
                if discarded > 0 {
                    debug!("dropped {discarded} result packets of a cancelled query");
                    discarded = 0;
                }
                write_packet(&mut out, &packet, framing)?;
            }
            Outbound::Flush(ack) => {
                out.flush()?;
                // The requester may have stopped waiting.
                let _ = ack.send(());
            }
        }
    }

    out.flush()?;
    Ok(())
}

impl Connection {
    fn encode(&self, block: &Block, compression: Compression) -> Result<Vec<u8>, ConnectionError> {
        Ok(encode_block(block, compression)?)
    }

    pub(super) fn send_data(&mut self, block: &Block) -> Result<(), ConnectionError> {
        let payload = self.encode(block, self.state.compression)?;
        self.sender.send(Response::Data {
            table: String::new(),
            payload,
        })
    }

    pub(super) fn send_totals(&mut self, block: &Block) -> Result<(), ConnectionError> {
        let payload = self.encode(block, self.state.compression)?;
        self.sender.send(Response::Totals { payload })
    }

    pub(super) fn send_extremes(&mut self, block: &Block) -> Result<(), ConnectionError> {
        let payload = self.encode(block, self.state.compression)?;
        self.sender.send(Response::Extremes { payload })
    }

    pub(super) fn send_profile_info(&mut self, info: ProfileInfo) -> Result<(), ConnectionError> {
        self.sender.send(Response::ProfileInfo(info))
    }

    pub(super) fn send_part_uuids(&mut self, uuids: Vec<[u8; 16]>) -> Result<(), ConnectionError> {
        if uuids.is_empty() {
            return Ok(());
        }
        self.sender.send(Response::PartUUIDs(uuids))
    }

    pub(super) fn send_table_columns(&mut self, table: &str, header: &Block) -> Result<(), ConnectionError> {
        if !self.session.supports(MIN_REVISION_WITH_TABLE_COLUMNS) {
            return Ok(());
        }
        self.sender.send(Response::TableColumns {
            table: table.to_string(),
            description: header.describe_columns(),
        })
    }

    pub(super) fn send_timezone(&mut self, timezone: &str) -> Result<(), ConnectionError> {
        if !self.session.supports(MIN_REVISION_WITH_TIMEZONE_UPDATES) {
            return Ok(());
        }
        self.sender
            .send(Response::TimezoneUpdate(timezone.to_string()))
    }

    /// Sends the progress accumulated since the previous Progress packet, if any.
    pub(super) fn send_progress(&mut self) -> Result<(), ConnectionError> {
        let Some(ctx) = &self.state.context else {
            return Ok(());
        };
        let mut delta = ctx.progress.take();
        if delta.is_empty() {
            return Ok(());
        }

        let elapsed = self
            .state
            .watch
            .map_or(0, |watch| watch.elapsed().as_nanos() as u64);
        delta.elapsed_ns = if self.session.supports(MIN_REVISION_WITH_PROGRESS_ELAPSED) {
            elapsed
        } else {
            0
        };
        self.state.progress.add(&delta);
        self.state.progress.elapsed_ns = elapsed;
        self.sender.send(Response::Progress(delta))
    }

    pub(super) fn send_profile_events(&mut self) -> Result<(), ConnectionError> {
        if !self.session.supports(MIN_REVISION_WITH_PROFILE_EVENTS) {
            return Ok(());
        }
        let Some(ctx) = &self.state.context else {
            return Ok(());
        };
        let deltas = self.state.profile_events.diff(ctx.profile.snapshot());
        if deltas.is_empty() {
            return Ok(());
        }
        let block = profile_events_block(&deltas, &self.session.display_name)?;
        let payload = self.encode(&block, Compression::Disable)?;
        self.sender.send(Response::ProfileEvents { payload })
    }

    pub(super) fn send_logs(&mut self) -> Result<(), ConnectionError> {
        let Some(ctx) = &self.state.context else {
            return Ok(());
        };
        let records = ctx.logs.drain();
        if records.is_empty() {
            return Ok(());
        }
        let block = logs_block(&records, &self.session.display_name, &self.state.query_id)?;
        let payload = self.encode(&block, Compression::Disable)?;
        self.sender.send(Response::Log { payload })
    }

    /// Progress, profile events and logs, at most once per interactive delay.
    pub(super) fn send_telemetry_if_due(&mut self) -> Result<(), ConnectionError> {
        let delay = self.settings().interactive_delay;
        if self
            .state
            .after_send_progress
            .is_some_and(|at| at.elapsed() < delay)
        {
            return Ok(());
        }
        self.state.after_send_progress = Some(Instant::now());
        self.send_telemetry()
    }

    pub(super) fn send_telemetry(&mut self) -> Result<(), ConnectionError> {
        self.send_progress()?;
        self.send_profile_events()?;
        self.send_logs()
    }

    pub(super) fn exception_packet(&self, error: &ConnectionError) -> ExceptionPacket {
        error.to_exception(self.settings().send_exception_with_stack_trace)
    }

    pub(super) fn send_exception(&mut self, error: &ConnectionError) -> Result<(), ConnectionError> {
        let packet = self.exception_packet(error);
        self.sender.send(Response::Exception(packet))
    }

    pub(super) fn send_end_of_stream(&mut self) -> Result<(), ConnectionError> {
        self.state.sent_all_data = true;
        self.sender.send(Response::EndOfStream)
    }
}
