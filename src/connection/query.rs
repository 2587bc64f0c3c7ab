//! Running one query: receiving its inputs, executing it, streaming its results,
//! and cleaning up after it fails.
use std::{
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::{
    block::{Block, decode_block},
    engine::{
        AsyncInsertQueue, EngineError, ExecutionContext, PipelineEvent, PushResult, ReadTaskSource,
    },
    protocol::{QueryPacket, Request, Response, revision::MIN_REVISION_WITH_PARALLEL_REPLICAS},
    settings::apply_query_settings,
    statement::ParsedQuery,
    telemetry::{LogQueue, ProfileCounters, Progress},
};

use super::{
    Connection, ConnectionError, MIN_POLL,
    state::{CancellationStatus, InsertTarget, QueryPhase},
    tasks::QueryControl,
};

impl Connection {
    /// Runs a query to its end. Only fatal errors are returned; any other failure
    /// is reported to the client and the connection stays usable.
    pub(super) fn process_query(&mut self, packet: QueryPacket) -> Result<(), ConnectionError> {
        let outcome = match self.run_query(packet) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => self.recover(e),
        };
        self.state.reset();
        outcome
    }

    fn run_query(&mut self, packet: QueryPacket) -> Result<(), ConnectionError> {
        self.state.phase = QueryPhase::ReceivingQuery;
        self.state.read_all_data = false;
        self.state.watch = Some(Instant::now());
        self.state.query_id = if packet.query_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            packet.query_id.clone()
        };
        self.state.stage = packet.stage;
        self.state.compression = packet.compression;
        self.state.part_uuids_to_ignore = self.pending_part_uuids.take();

        let user = self.session.query_user(&packet, &self.server)?;
        let (settings, query_settings) =
            apply_query_settings(&self.session.settings, &packet.settings)?;
        self.set_socket_timeouts(settings.send_timeout, settings.receive_timeout)?;
        self.state.settings = Some(settings);
        self.state.query_settings = query_settings.clone();
        info!(
            "query {} from user '{user}': {}",
            self.state.query_id, packet.query
        );

        if let Some(timezone) = &query_settings.session_timezone {
            self.send_timezone(timezone)?;
        }

        if !self.receive_query_inputs()? {
            info!("query {} cancelled before it started", self.state.query_id);
            return self.send_end_of_stream();
        }
        let query = ParsedQuery::parse(&packet.query)?;

        let profile = Arc::new(ProfileCounters::default());
        let control = Arc::new(QueryControl::new(
            self.sender.clone(),
            self.session.supports(MIN_REVISION_WITH_PARALLEL_REPLICAS),
            Arc::clone(&profile),
        ));
        let read_tasks = packet
            .client_info
            .collaborate_with_initiator
            .then(|| Arc::clone(&control) as Arc<dyn ReadTaskSource>);
        let ctx = ExecutionContext {
            query_id: self.state.query_id.clone(),
            user,
            database: self.session.database.clone(),
            stage: packet.stage,
            settings: query_settings.clone(),
            parameters: packet.parameters,
            scalars: self.state.scalars.clone(),
            external_tables: self.state.external_tables.clone(),
            part_uuids_to_ignore: self.state.part_uuids_to_ignore.clone(),
            progress: Arc::default(),
            logs: LogQueue::new(query_settings.send_logs_level),
            profile,
            read_tasks,
        };
        self.state.control = Some(control);
        self.state.context = Some(ctx.clone());
        self.state.query = Some(query.clone());

        if query.needs_client_data() {
            self.process_insert(&query, ctx)?;
        } else {
            self.process_ordinary(&query, ctx)?;
        }

        self.state.phase = QueryPhase::Terminating;
        if let Some(control) = &self.state.control {
            control.close();
        }
        self.send_telemetry()?;
        self.send_end_of_stream()
    }

    /// Next request of the running query. Telemetry keeps flowing while waiting,
    /// and the wait is bounded by `receive_timeout`.
    fn receive(&mut self) -> Result<Request, ConnectionError> {
        let timeout = self.settings().receive_timeout;
        let slice = self.settings().query_wait().max(MIN_POLL);
        let started = Instant::now();

        while !self.reader.poll(slice).map_err(ConnectionError::from_read)? {
            if !timeout.is_zero() && started.elapsed() >= timeout {
                return Err(ConnectionError::ReceiveTimeout(timeout));
            }
            self.send_telemetry_if_due()?;
        }

        self.reader.read_request().map_err(|e| {
            if e.is_timeout() {
                ConnectionError::ReceiveTimeout(timeout)
            } else {
                ConnectionError::from_read(e)
            }
        })
    }

    fn decode_data(&mut self, payload: &[u8]) -> Result<Block, ConnectionError> {
        let block = decode_block(payload, self.state.compression)?;
        self.last_block_in.compression = self.state.compression;
        Ok(block)
    }

    fn decode_named(&mut self, name: &str, payload: &[u8]) -> Result<Block, ConnectionError> {
        if name.is_empty() {
            return Err(ConnectionError::InvalidPacket(
                "scalar or external table without a name".to_string(),
            ));
        }
        self.decode_data(payload)
    }

    /// Receives scalars and external tables up to the empty data block that ends
    /// them. Returns false when the client cancelled instead.
    fn receive_query_inputs(&mut self) -> Result<bool, ConnectionError> {
        loop {
            match self.receive()? {
                Request::ScalarData { name, payload } => {
                    let block = self.decode_named(&name, &payload)?;
                    debug!("received scalar {name} ({} rows)", block.rows());
                    self.state.scalars.insert(name, block);
                }
                Request::ExternalTableData { name, payload } => {
                    let block = self.decode_named(&name, &payload)?;
                    debug!("received external table {name} ({} rows)", block.rows());
                    self.state.external_tables.insert(name, block);
                }
                Request::Data { payload } => {
                    let block = self.decode_data(&payload)?;
                    if !block.columns().is_empty() {
                        return Err(ConnectionError::InvalidPacket(
                            "data block received before the query asked for data".to_string(),
                        ));
                    }
                    self.state.read_all_data = true;
                    return Ok(true);
                }
                Request::Cancel => {
                    self.state.read_all_data = true;
                    return Ok(false);
                }
                Request::Ping => self.sender.send(Response::Pong)?,
                other => return Err(self.unexpected(QueryPhase::ReceivingQuery, &other)),
            }
        }
    }

    fn process_insert(
        &mut self,
        query: &ParsedQuery,
        ctx: ExecutionContext,
    ) -> Result<(), ConnectionError> {
        let header = self.server.engine.insert_header(query, &ctx)?;
        let queue = if ctx.settings.async_insert {
            self.server.async_inserts.clone()
        } else {
            None
        };
        self.state.insert = Some(match &queue {
            Some(_) => InsertTarget::Buffer(Block::new()),
            None => InsertTarget::Sink(self.server.engine.start_insert(query, &ctx)?),
        });

        self.send_table_columns(query.insert_table().unwrap_or_default(), &header)?;
        self.send_data(&header)?;
        self.state.insert_header = Some(header.clone());
        self.state.phase = QueryPhase::ReceivingData;
        self.state.need_receive_data_for_insert = true;
        self.state.read_all_data = false;

        if !self.receive_insert_data(&header)? {
            info!("insert {} cancelled by client", self.state.query_id);
            self.state.insert = None;
            return Ok(());
        }

        self.state.phase = QueryPhase::Executing;
        match self.state.insert.take() {
            Some(InsertTarget::Sink(sink)) => sink.finish()?,
            Some(InsertTarget::Buffer(data)) => {
                if let Some(queue) = &queue {
                    self.push_async_insert(queue.as_ref(), query, data, &ctx)?;
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Receives insert blocks up to the empty block that ends them. Returns false
    /// when the client cancelled instead.
    fn receive_insert_data(&mut self, header: &Block) -> Result<bool, ConnectionError> {
        loop {
            match self.receive()? {
                Request::Data { payload } => {
                    let block = self.decode_data(&payload)?;
                    if block.columns().is_empty() {
                        self.state.read_all_data = true;
                        return Ok(true);
                    }
                    block.check_header(header)?;
                    match self.state.insert.as_mut() {
                        Some(InsertTarget::Sink(sink)) => sink.write(block)?,
                        Some(InsertTarget::Buffer(buffer)) => buffer.append(&block)?,
                        None => {}
                    }
                }
                Request::Cancel => {
                    self.state.read_all_data = true;
                    return Ok(false);
                }
                Request::Ping => self.sender.send(Response::Pong)?,
                other => return Err(self.unexpected(QueryPhase::ReceivingData, &other)),
            }
        }
    }

    fn push_async_insert(
        &mut self,
        queue: &dyn AsyncInsertQueue,
        query: &ParsedQuery,
        data: Block,
        ctx: &ExecutionContext,
    ) -> Result<(), ConnectionError> {
        if data.columns().is_empty() {
            debug!("async insert {} carried no data", self.state.query_id);
            return Ok(());
        }
        let written = Progress::written(data.rows() as u64, data.byte_size() as u64);

        match queue.push(query, data, ctx) {
            PushResult::Flushed => debug!("async insert {} flushed", self.state.query_id),
            PushResult::Failed(e) => return Err(e.into()),
            PushResult::Queued(done) => {
                if ctx.settings.wait_for_async_insert {
                    if !self.wait_for_async_flush(done)? {
                        return Ok(());
                    }
                } else {
                    debug!("async insert {} queued", self.state.query_id);
                }
            }
        }
        ctx.progress.increment(&written);
        Ok(())
    }

    /// Waits for the batch holding an async insert to be written. Returns false if
    /// the client cancelled the wait.
    fn wait_for_async_flush(
        &mut self,
        done: mpsc::Receiver<Result<(), EngineError>>,
    ) -> Result<bool, ConnectionError> {
        let slice = self.settings().query_wait().max(MIN_POLL);
        loop {
            match done.recv_timeout(slice) {
                Ok(result) => {
                    result?;
                    return Ok(true);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.receive_packets_expect_cancel()?;
                    if self.state.cancellation() != CancellationStatus::NotCancelled {
                        info!(
                            "stopped waiting for async insert {}: cancelled by client",
                            self.state.query_id
                        );
                        return Ok(false);
                    }
                    self.send_telemetry_if_due()?;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Execution(
                        "async insert was dropped before it was flushed".to_string(),
                    )
                    .into());
                }
            }
        }
    }

    fn process_ordinary(
        &mut self,
        query: &ParsedQuery,
        ctx: ExecutionContext,
    ) -> Result<(), ConnectionError> {
        let extremes = ctx.settings.extremes;
        self.state.phase = QueryPhase::Executing;
        let pipeline = self.server.engine.execute(query, ctx)?;
        let header = pipeline.header();
        self.state.pipeline = Some(pipeline);
        self.state.phase = QueryPhase::SendingResults;

        let policy = self.settings().cancel_policy;
        let delay = self.settings().query_wait().max(MIN_POLL);
        let mut reading_cancelled = false;

        loop {
            self.receive_packets_expect_cancel()?;
            let status = self
                .state
                .control
                .as_ref()
                .map(|control| control.check_grace(&policy))
                .unwrap_or_default();

            let Some(pipeline) = self.state.pipeline.as_mut() else {
                break;
            };
            match status {
                CancellationStatus::FullyCancelled => {
                    pipeline.cancel();
                    self.sender.discard_queued_results();
                    break;
                }
                CancellationStatus::ReadCancelled if !reading_cancelled => {
                    pipeline.cancel_reading();
                    reading_cancelled = true;
                }
                _ => {}
            }

            match pipeline.poll(delay)? {
                PipelineEvent::Block(block) => {
                    if !block.is_empty() {
                        self.state.profile_info.rows += block.rows() as u64;
                        self.state.profile_info.blocks += 1;
                        self.state.profile_info.bytes += block.byte_size() as u64;
                        self.send_data(&block)?;
                        self.state.is_empty = false;
                    }
                }
                PipelineEvent::Pending => {}
                PipelineEvent::Finished => break,
            }
            self.send_telemetry_if_due()?;
        }

        if self.state.cancellation() == CancellationStatus::FullyCancelled {
            info!("query {} cancelled by client", self.state.query_id);
            return Ok(());
        }
        self.send_trailer(&header, extremes)
    }

    /// Everything that follows the data blocks of a finished query.
    fn send_trailer(&mut self, header: &Block, extremes: bool) -> Result<(), ConnectionError> {
        if self.state.is_empty && !header.columns().is_empty() {
            self.send_data(header)?;
        }

        let Some(pipeline) = self.state.pipeline.as_mut() else {
            return Ok(());
        };
        let totals = pipeline.totals();
        let extremes = if extremes { pipeline.extremes() } else { None };
        let rows_before_limit = pipeline.rows_before_limit();
        let part_uuids: Vec<[u8; 16]> = pipeline
            .part_uuids()
            .into_iter()
            .map(Uuid::into_bytes)
            .collect();

        if let Some(totals) = totals {
            self.send_totals(&totals)?;
        }
        if let Some(extremes) = extremes {
            self.send_extremes(&extremes)?;
        }
        if !header.columns().is_empty() {
            let mut info = self.state.profile_info.clone();
            info.applied_limit = rows_before_limit.is_some();
            info.calculated_rows_before_limit = rows_before_limit.is_some();
            info.rows_before_limit = rows_before_limit.unwrap_or_default();
            self.send_profile_info(info)?;
        }
        self.send_part_uuids(part_uuids)
    }

    /// Handles whatever the client sent while the query runs, without waiting for
    /// more.
    pub(super) fn receive_packets_expect_cancel(&mut self) -> Result<(), ConnectionError> {
        let Some(control) = self.state.control.clone() else {
            return Ok(());
        };

        while self
            .reader
            .poll(Duration::ZERO)
            .map_err(ConnectionError::from_read)?
        {
            let request = match self.reader.read_request() {
                Ok(request) => request,
                Err(e) => {
                    let error = ConnectionError::from_read(e);
                    if matches!(error, ConnectionError::Disconnected) {
                        warn!(
                            "client went away, cancelling query {}",
                            self.state.query_id
                        );
                        control.escalate_fully();
                    }
                    return Err(error);
                }
            };

            match request {
                Request::Cancel => {
                    let status = control.cancel();
                    info!("query {}: cancel requested, now {status:?}", self.state.query_id);
                }
                Request::Ping => self.sender.send(Response::Pong)?,
                request @ (Request::ReadTaskResponse(_) | Request::MergeTreeReadTaskResponse(_)) => {
                    control.deliver(request)?;
                }
                other => return Err(self.unexpected(self.state.phase, &other)),
            }
        }
        Ok(())
    }

    /// Ends a failed query without breaking the connection: the rest of its input
    /// is read and dropped, then the client gets the exception.
    fn recover(&mut self, error: ConnectionError) -> Result<(), ConnectionError> {
        warn!("query {} failed: {error}", self.state.query_id);
        let was_insert = self.state.need_receive_data_for_insert;

        if let Some(pipeline) = self.state.pipeline.as_mut() {
            pipeline.cancel();
        }
        if let Some(control) = &self.state.control {
            control.close();
        }
        self.state.insert = None;

        if !self.state.read_all_data {
            self.skip_remaining_data()?;
        }
        self.send_logs()?;
        self.send_exception(&error)?;
        self.discard_stray_data = was_insert;
        Ok(())
    }

    /// Reads and drops query input up to its terminating empty block.
    fn skip_remaining_data(&mut self) -> Result<(), ConnectionError> {
        self.state.skipping_data = true;
        let compression = self.state.compression;

        loop {
            match self.receive()? {
                Request::Data { payload } => match decode_block(&payload, compression) {
                    Ok(block) if block.columns().is_empty() => break,
                    Ok(block) => debug!("skipping {} rows", block.rows()),
                    Err(e) => debug!("skipping undecodable block: {e}"),
                },
                Request::ScalarData { .. }
                | Request::ExternalTableData { .. }
                | Request::ReadTaskResponse(_)
                | Request::MergeTreeReadTaskResponse(_) => {}
                Request::Cancel => break,
                Request::Ping => self.sender.send(Response::Pong)?,
                other => return Err(self.unexpected(QueryPhase::ReceivingData, &other)),
            }
        }

        self.state.skipping_data = false;
        self.state.read_all_data = true;
        Ok(())
    }
}
