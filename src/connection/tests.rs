//! End-to-end tests: a real [`Server`] on an ephemeral port, driven by [`Client`].
use std::{
    io::Write,
    net::{SocketAddr, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    block::{Block, Column, Compression, decode_block, encode_block},
    client::{Client, ClientError, ClientOptions, InterserverOptions, QueryResult},
    engine::{MemoryAsyncInsertQueue, MemoryEngine, QueryEngine, StaticUsers},
    protocol::{
        ClientHello, ExceptionPacket, Framing, MarkRange, ParallelReadResponse, QualifiedTableName,
        RangesInPart, ReadTaskResponse, Request, Response, Server, TablesStatusRequest,
        TransportError, read_packet, revision::SERVER_REVISION, write_packet,
    },
    settings::ServerSettings,
};

use super::{ServerContext, handshake::SERVER_NAME};

fn settings() -> ServerSettings {
    ServerSettings {
        max_connections: 4,
        poll_interval_ms: 50,
        interactive_delay_ms: 10,
        ..ServerSettings::default()
    }
}

struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    engine: Arc<MemoryEngine>,
    listener: Option<JoinHandle<Result<(), TransportError>>>,
}

impl TestServer {
    fn start(settings: ServerSettings) -> Self {
        Self::build(settings, None)
    }

    fn with_async_inserts(settings: ServerSettings, max_rows: usize) -> Self {
        Self::build(settings, Some(max_rows))
    }

    fn build(settings: ServerSettings, async_insert_rows: Option<usize>) -> Self {
        let engine = Arc::new(MemoryEngine::new());
        let users = Arc::new(StaticUsers::new(&settings.users));
        let mut context = ServerContext::new(
            settings,
            users,
            Arc::clone(&engine) as Arc<dyn QueryEngine>,
        );
        if let Some(max_rows) = async_insert_rows {
            context = context.with_async_inserts(Arc::new(MemoryAsyncInsertQueue::new(
                Arc::clone(&engine),
                max_rows,
            )));
        }

        let server = Server::bind("127.0.0.1:0".parse().unwrap(), context).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let listener = thread::spawn(move || server.listen());

        Self {
            addr,
            shutdown,
            engine,
            listener: Some(listener),
        }
    }

    fn connect(&self) -> Client {
        self.connect_with(ClientOptions::default()).unwrap()
    }

    fn connect_with(&self, options: ClientOptions) -> Result<Client, ClientError> {
        Client::connect(self.addr, options)
    }

    fn create_table(&self, name: &str) {
        let header = Block::new()
            .with_column("id", Column::UInt64(Vec::new()))
            .unwrap()
            .with_column("name", Column::String(Vec::new()))
            .unwrap();
        self.engine.create_table(name, header).unwrap();
    }

    /// Requests shutdown and waits for the accept loop and every connection to end.
    fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(listener) = self.listener.take() {
            listener.join().unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn rows(ids: &[u64], names: &[&str]) -> Block {
    Block::new()
        .with_column("id", Column::UInt64(ids.to_vec()))
        .unwrap()
        .with_column(
            "name",
            Column::String(names.iter().map(|n| n.to_string()).collect()),
        )
        .unwrap()
}

fn server_error(result: Result<QueryResult, ClientError>) -> ExceptionPacket {
    match result {
        Err(ClientError::Server(e)) => e,
        Err(e) => panic!("expected a server exception, got {e}"),
        Ok(result) => panic!("expected a server exception, got {:?}", result.packets),
    }
}

/// Reads packets until an Exception arrives.
fn receive_exception(client: &mut Client) -> ExceptionPacket {
    loop {
        match client.receive().unwrap() {
            Response::Exception(e) => return e,
            Response::EndOfStream => panic!("query ended without an exception"),
            _ => {}
        }
    }
}

fn assert_closed(client: &mut Client) {
    assert!(client.receive().is_err(), "connection is still open");
}

#[test]
fn handshake_reports_server_identity() {
    let server = TestServer::start(settings());
    let client = server.connect();

    let hello = client.server_hello();
    assert_eq!(hello.name, SERVER_NAME);
    assert_eq!(hello.revision, SERVER_REVISION);
    assert_eq!(hello.timezone.as_deref(), Some("UTC"));
    assert_eq!(hello.nonce, None);
    assert_eq!(client.revision(), SERVER_REVISION);
}

#[test]
fn select_one_sends_a_single_data_packet() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    let result = client.query("SELECT 1").unwrap();

    let data = result.packets.iter().filter(|p| **p == "Data").count();
    assert_eq!(data, 1, "{:?}", result.packets);
    assert!(!result.packets.contains(&"Totals"));
    assert!(!result.packets.contains(&"Extremes"));
    assert_eq!(result.packets.last(), Some(&"EndOfStream"));
    assert_eq!(result.blocks[0].column("1"), Some(&Column::UInt64(vec![1])));
}

#[test]
fn progress_deltas_add_up_to_rows_read() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    let result = client
        .query_with_settings("SELECT * FROM numbers(1000)", &[("max_block_size", "100")])
        .unwrap();

    assert_eq!(result.rows(), 1000);
    assert_eq!(result.progress.read_rows, 1000);
    assert_eq!(result.progress.total_rows_to_read, 1000);
    let info = result.profile_info.unwrap();
    assert_eq!(info.rows, 1000);
    assert_eq!(info.blocks, 10);
    assert!(result.packets.contains(&"ProfileEvents"));
}

#[test]
fn empty_result_sends_its_header() {
    let server = TestServer::start(settings());
    server.create_table("t");
    let mut client = server.connect();

    let result = client.query("SELECT * FROM t").unwrap();

    assert_eq!(result.rows(), 0);
    assert_eq!(result.blocks.len(), 1);
    assert_eq!(result.blocks[0].columns().len(), 2);
}

#[test]
fn extremes_are_sent_when_requested() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    let result = client
        .query_with_settings("SELECT * FROM numbers(10)", &[("extremes", "1")])
        .unwrap();

    let extremes = result.extremes.unwrap();
    assert_eq!(extremes.column("number"), Some(&Column::UInt64(vec![0, 9])));
}

#[test]
fn compressed_query() {
    let server = TestServer::start(settings());
    let mut client = server
        .connect_with(ClientOptions {
            compression: Compression::Enable,
            ..ClientOptions::default()
        })
        .unwrap();

    let result = client.query("SELECT * FROM numbers(5)").unwrap();

    assert_eq!(result.rows(), 5);
}

#[test]
fn insert_stores_all_blocks() {
    let server = TestServer::start(settings());
    server.create_table("t");
    let mut client = server.connect();

    let result = client
        .insert(
            "INSERT INTO t FORMAT Native",
            &[rows(&[1, 2], &["a", "b"]), rows(&[3], &["c"])],
        )
        .unwrap();

    assert_eq!(result.progress.written_rows, 3);
    let table = server.engine.table("t").unwrap();
    assert_eq!(table, rows(&[1, 2, 3], &["a", "b", "c"]));
}

#[test]
fn failed_insert_skips_its_data_and_discards_stray_blocks() {
    let server = TestServer::start(settings());
    server.create_table("t");
    let mut client = server.connect();

    client.send_query("INSERT INTO t FORMAT Native", &[]).unwrap();
    let header = client.receive_insert_header().unwrap();
    assert_eq!(header.columns().len(), 2);

    let wrong = Block::new()
        .with_column("id", Column::String(vec!["1".to_string()]))
        .unwrap();
    client.send_data(&wrong).unwrap();
    client.send_data(&rows(&[1], &["a"])).unwrap();
    client.send_data(&Block::new()).unwrap();
    let e = server_error(client.receive_result());
    assert_eq!(e.name, "INCORRECT_DATA");

    // Still in flight from the client's point of view.
    client.send_data(&rows(&[2], &["b"])).unwrap();

    let result = client.query("SELECT * FROM t").unwrap();
    assert_eq!(result.rows(), 0);
    assert_eq!(server.engine.table("t").unwrap().rows(), 0);
}

#[test]
fn cancelled_insert_writes_nothing() {
    let server = TestServer::start(settings());
    server.create_table("t");
    let mut client = server.connect();

    client.send_query("INSERT INTO t FORMAT Native", &[]).unwrap();
    client.receive_insert_header().unwrap();
    client.send_data(&rows(&[1], &["a"])).unwrap();
    client.cancel().unwrap();
    client.receive_result().unwrap();

    assert_eq!(server.engine.table("t").unwrap().rows(), 0);
    client.ping().unwrap();
}

#[test]
fn cancel_stops_an_endless_query() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    client
        .send_query("SELECT * FROM system.numbers", &[("max_block_size", "10")])
        .unwrap();
    let mut data = 0;
    while data < 3 {
        if let Response::Data { .. } = client.receive().unwrap() {
            data += 1;
        }
    }

    client.cancel().unwrap();
    let mut packets = Vec::new();
    loop {
        let packet = client.receive().unwrap();
        assert!(!matches!(packet, Response::Exception(_)), "{packet:?}");
        packets.push(packet.name());
        if matches!(packet, Response::EndOfStream) {
            break;
        }
    }

    assert!(packets.contains(&"ProfileInfo"));
    client.ping().unwrap();
}

#[test]
fn second_cancel_abandons_the_output() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    client
        .send_query("SELECT * FROM system.numbers", &[("max_block_size", "10")])
        .unwrap();
    loop {
        if let Response::Data { .. } = client.receive().unwrap() {
            break;
        }
    }

    let mut both = Vec::new();
    write_packet(&mut both, &Request::Cancel, Framing::Plain).unwrap();
    write_packet(&mut both, &Request::Cancel, Framing::Plain).unwrap();
    let mut stream = client.stream();
    stream.write_all(&both).unwrap();

    let mut packets = Vec::new();
    loop {
        let packet = client.receive().unwrap();
        packets.push(packet.name());
        if matches!(packet, Response::EndOfStream) {
            break;
        }
    }

    assert!(!packets.contains(&"ProfileInfo"), "{packets:?}");
    assert!(!packets.contains(&"Exception"), "{packets:?}");
    assert_eq!(client.query("SELECT 1").unwrap().rows(), 1);
}

#[test]
fn second_cancel_drops_output_queued_for_a_slow_client() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    client
        .send_query("SELECT * FROM system.numbers", &[("max_block_size", "65536")])
        .unwrap();
    // Let the server run ahead until everything between it and the client is full.
    thread::sleep(Duration::from_secs(1));

    let mut both = Vec::new();
    write_packet(&mut both, &Request::Cancel, Framing::Plain).unwrap();
    write_packet(&mut both, &Request::Cancel, Framing::Plain).unwrap();
    let mut stream = client.stream();
    stream.write_all(&both).unwrap();

    let mut data = 0;
    loop {
        match client.receive().unwrap() {
            Response::Data { .. } => data += 1,
            Response::EndOfStream => break,
            Response::Exception(e) => panic!("query failed: {e:?}"),
            _ => {}
        }
    }

    assert!(data < 100, "{data} blocks delivered after the query was cancelled");
    assert_eq!(client.query("SELECT 1").unwrap().rows(), 1);
}

#[test]
fn query_send_timeout_drops_a_stalled_client() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    client
        .send_query(
            "SELECT * FROM system.numbers",
            &[("max_block_size", "65536"), ("send_timeout", "1")],
        )
        .unwrap();
    thread::sleep(Duration::from_secs(3));

    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        assert!(Instant::now() < deadline, "server kept streaming to a stalled client");
        match client.receive() {
            Ok(Response::EndOfStream) => panic!("query finished instead of timing out"),
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

#[test]
fn query_poll_interval_bounds_the_wait_for_input() {
    let server = TestServer::start(settings());
    server.create_table("t");
    let mut client = server.connect();

    client
        .send_query(
            "INSERT INTO t FORMAT Native",
            &[
                ("receive_timeout", "1"),
                ("poll_interval", "1"),
                ("interactive_delay", "10000000"),
            ],
        )
        .unwrap();
    client.receive_insert_header().unwrap();

    let started = Instant::now();
    let e = receive_exception(&mut client);
    assert_eq!(e.code, 209);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_closed(&mut client);
}

#[test]
fn cancel_before_the_query_starts() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    let packet = client.query_packet("", "SELECT * FROM system.numbers", &[]);
    client.send(&Request::Query(packet)).unwrap();
    client.cancel().unwrap();

    let result = client.receive_result().unwrap();
    assert_eq!(result.packets, vec!["EndOfStream"]);
}

#[test]
fn engine_error_keeps_the_connection() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    let e = server_error(client.query("SELECT throw('boom')"));
    assert_eq!(e.message, "boom");
    assert!(!e.stack_trace.is_empty());

    let e = server_error(client.query("SELECT * FROM missing"));
    assert_eq!(e.name, "UNKNOWN_TABLE");

    let e = server_error(client.query_with_settings("SELECT 1", &[("turbo", "1")]));
    assert_eq!(e.name, "UNKNOWN_SETTING");

    assert_eq!(client.query("SELECT 1").unwrap().rows(), 1);
}

#[test]
fn stack_trace_can_be_hidden() {
    let server = TestServer::start(ServerSettings {
        hide_stack_trace: true,
        ..settings()
    });
    let mut client = server.connect();

    let e = server_error(client.query("SELECT throw('boom')"));
    assert!(e.stack_trace.is_empty());
}

#[test]
fn data_while_idle_is_rejected_but_not_fatal() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    client.send_data(&rows(&[1], &["a"])).unwrap();
    let e = receive_exception(&mut client);
    assert_eq!(e.name, "UNEXPECTED_PACKET_INPUT_WHILE_IDLE");

    client.ping().unwrap();
    assert_eq!(client.query("SELECT 1").unwrap().rows(), 1);
}

#[test]
fn unsolicited_read_task_response_is_rejected() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    client
        .send(&Request::ReadTaskResponse(ReadTaskResponse::default()))
        .unwrap();
    let e = receive_exception(&mut client);
    assert_eq!(e.name, "UNEXPECTED_PACKET_READ_TASK_RESPONSE");

    client.ping().unwrap();
}

#[test]
fn data_during_execution_fails_only_the_query() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    client.send_query("SELECT sleep(1000)", &[]).unwrap();
    client.send_data(&Block::new()).unwrap();

    let e = receive_exception(&mut client);
    assert_eq!(e.name, "UNEXPECTED_PACKET_DURING_EXECUTION");
    assert_eq!(client.query("SELECT 1").unwrap().rows(), 1);
}

#[test]
fn second_hello_closes_the_connection() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    client
        .send(&Request::Hello(ClientHello {
            client_name: "again".to_string(),
            version_major: 1,
            version_minor: 0,
            revision: SERVER_REVISION,
            database: String::new(),
            user: "default".to_string(),
            password: String::new(),
            proto_send_chunked: "notchunked".to_string(),
            proto_recv_chunked: "notchunked".to_string(),
            interserver: None,
        }))
        .unwrap();

    let e = receive_exception(&mut client);
    assert_eq!(e.name, "UNEXPECTED_PACKET_HELLO");
    assert_closed(&mut client);
}

#[test]
fn tables_status_during_a_query_closes_the_connection() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    client.send_query("SELECT sleep(1000)", &[]).unwrap();
    client
        .send(&Request::TablesStatusRequest(TablesStatusRequest { tables: Vec::new() }))
        .unwrap();

    let e = receive_exception(&mut client);
    assert_eq!(e.name, "UNEXPECTED_PACKET_TABLES_STATUS_REQUEST");
    assert_closed(&mut client);
}

#[test]
fn ping_and_tables_status_while_idle() {
    let server = TestServer::start(settings());
    server.create_table("t");
    let mut client = server.connect();

    client.ping().unwrap();
    let status = client
        .tables_status(vec![
            QualifiedTableName {
                database: "default".to_string(),
                table: "t".to_string(),
            },
            QualifiedTableName {
                database: "default".to_string(),
                table: "missing".to_string(),
            },
        ])
        .unwrap();

    assert_eq!(status.len(), 1);
    assert_eq!(status[0].0.table, "t");
}

#[test]
fn external_tables_are_visible_to_the_query() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    let packet = client.query_packet("", "SELECT x FROM ext", &[]);
    client.send(&Request::Query(packet)).unwrap();
    let ext = Block::new()
        .with_column("x", Column::Int64(vec![-1, 5]))
        .unwrap();
    client
        .send(&Request::ExternalTableData {
            name: "ext".to_string(),
            payload: encode_block(&ext, Compression::Disable).unwrap(),
        })
        .unwrap();
    client.send_data(&Block::new()).unwrap();

    let result = client.receive_result().unwrap();
    assert_eq!(result.blocks[0].column("x"), Some(&Column::Int64(vec![-1, 5])));
}

#[test]
fn logs_and_timezone_follow_query_settings() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    let result = client
        .query_with_settings(
            "SELECT 1",
            &[
                ("send_logs_level", "debug"),
                ("session_timezone", "Europe/Berlin"),
            ],
        )
        .unwrap();

    assert!(!result.logs.is_empty());
    assert_eq!(result.packets.first(), Some(&"TimezoneUpdate"));

    let quiet = client.query("SELECT 1").unwrap();
    assert!(quiet.logs.is_empty());
}

#[test]
fn read_tasks_are_served_by_the_client() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    let mut packet = client.query_packet("", "SELECT * FROM read_tasks()", &[]);
    packet.client_info.collaborate_with_initiator = true;
    client.send_query_packet(packet).unwrap();

    let mut tasks = ["a", "b"].into_iter();
    let mut received = Vec::new();
    loop {
        match client.receive().unwrap() {
            Response::ReadTaskRequest => {
                let task = tasks.next().map(str::to_string);
                client
                    .send(&Request::ReadTaskResponse(ReadTaskResponse { task }))
                    .unwrap();
            }
            Response::Data { payload, .. } => {
                let block = decode_block(&payload, Compression::Disable).unwrap();
                if let Some(Column::String(values)) = block.column("task") {
                    received.extend(values.iter().cloned());
                }
            }
            Response::EndOfStream => break,
            Response::Exception(e) => panic!("{e:?}"),
            _ => {}
        }
    }

    assert_eq!(received, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn parallel_replicas_ranges_are_coordinated() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    let mut packet = client.query_packet("", "SELECT * FROM parallel_read('p1', 'p2')", &[]);
    packet.client_info.collaborate_with_initiator = true;
    client.send_query_packet(packet).unwrap();

    let mut announced = Vec::new();
    let mut parts = Vec::new();
    loop {
        match client.receive().unwrap() {
            Response::MergeTreeAllRangesAnnouncement(announcement) => {
                announced = announcement
                    .description
                    .into_iter()
                    .map(|r| r.part_name)
                    .collect();
            }
            Response::MergeTreeReadTaskRequest(_) => {
                client
                    .send(&Request::MergeTreeReadTaskResponse(ParallelReadResponse {
                        finish: true,
                        description: vec![RangesInPart {
                            part_name: "p1".to_string(),
                            ranges: vec![MarkRange { begin: 0, end: 4 }],
                        }],
                    }))
                    .unwrap();
            }
            Response::Data { payload, .. } => {
                let block = decode_block(&payload, Compression::Disable).unwrap();
                if let Some(Column::String(values)) = block.column("part") {
                    parts.extend(values.iter().cloned());
                }
            }
            Response::EndOfStream => break,
            Response::Exception(e) => panic!("{e:?}"),
            _ => {}
        }
    }

    assert_eq!(announced, vec!["p1".to_string(), "p2".to_string()]);
    assert_eq!(parts, vec!["p1".to_string()]);
}

#[test]
fn async_insert_waits_for_the_flush() {
    let server = TestServer::with_async_inserts(settings(), 1000);
    server.create_table("t");
    let mut client = server.connect();

    let result = client
        .insert_with_settings(
            "INSERT INTO t FORMAT Native",
            &[rows(&[1, 2], &["a", "b"]), rows(&[3], &["c"])],
            &[("async_insert", "1"), ("async_insert_busy_timeout_ms", "20")],
        )
        .unwrap();

    assert_eq!(result.progress.written_rows, 3);
    assert_eq!(server.engine.table("t").unwrap().rows(), 3);
}

#[test]
fn async_insert_without_waiting() {
    let server = TestServer::with_async_inserts(settings(), 1000);
    server.create_table("t");
    let mut client = server.connect();

    client
        .insert_with_settings(
            "INSERT INTO t FORMAT Native",
            &[rows(&[1], &["a"])],
            &[
                ("async_insert", "1"),
                ("wait_for_async_insert", "0"),
                ("async_insert_busy_timeout_ms", "20"),
            ],
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.engine.table("t").unwrap().rows() == 0 {
        assert!(Instant::now() < deadline, "async insert was never flushed");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn async_insert_with_wrong_structure_fails() {
    let server = TestServer::with_async_inserts(settings(), 1);
    server.create_table("t");
    let mut client = server.connect();

    let wrong = Block::new()
        .with_column("id", Column::String(vec!["x".to_string()]))
        .unwrap();
    let e = server_error(client.insert_with_settings(
        "INSERT INTO t FORMAT Native",
        &[wrong],
        &[("async_insert", "1")],
    ));

    assert_eq!(e.name, "INCORRECT_DATA");
    client.ping().unwrap();
}

#[test]
fn chunked_framing() {
    let server = TestServer::start(settings());
    let mut client = server
        .connect_with(ClientOptions {
            proto_send_chunked: "chunked".to_string(),
            proto_recv_chunked: "chunked".to_string(),
            ..ClientOptions::default()
        })
        .unwrap();

    assert_eq!(client.query("SELECT * FROM numbers(100)").unwrap().rows(), 100);
    client.ping().unwrap();
}

#[test]
fn irreconcilable_framing_is_rejected() {
    let server = TestServer::start(ServerSettings {
        proto_caps_send: "chunked".to_string(),
        ..settings()
    });

    let err = server
        .connect_with(ClientOptions {
            proto_recv_chunked: "notchunked".to_string(),
            ..ClientOptions::default()
        })
        .err()
        .unwrap();

    assert!(matches!(err, ClientError::Server(e) if e.code == 102));
}

#[test]
fn oversized_length_claim_closes_only_its_connection() {
    let server = TestServer::start(settings());
    let mut client = server.connect();

    // Data packet whose payload claims a terabyte.
    let mut hostile = vec![0u8, 0, 0, 2];
    hostile.extend_from_slice(&(1u64 << 40).to_be_bytes());
    let mut stream = client.stream();
    stream.write_all(&hostile).unwrap();

    let e = receive_exception(&mut client);
    assert_eq!(e.code, 101);
    assert_closed(&mut client);

    let mut other = server.connect();
    assert_eq!(other.query("SELECT 1").unwrap().rows(), 1);
}

#[test]
fn oversized_hello_is_rejected_before_authentication() {
    let server = TestServer::start(settings());
    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    // Hello whose client name claims a terabyte.
    let mut hostile = vec![0u8, 0, 0, 0];
    hostile.extend_from_slice(&(1u64 << 40).to_be_bytes());
    stream.write_all(&hostile).unwrap();

    let response: Response = read_packet(&mut stream, Framing::Plain).unwrap();
    assert!(matches!(response, Response::Exception(_)), "{response:?}");

    let mut client = server.connect();
    assert_eq!(client.query("SELECT 1").unwrap().rows(), 1);
}

#[test]
fn wrong_password_is_rejected() {
    let server = TestServer::start(ServerSettings {
        users: vec![("alice".to_string(), "secret".to_string())],
        ..settings()
    });
    let options = |password: &str| ClientOptions {
        user: "alice".to_string(),
        password: password.to_string(),
        ..ClientOptions::default()
    };

    let err = server.connect_with(options("guess")).err().unwrap();
    assert!(matches!(err, ClientError::Server(e) if e.code == 516));

    let mut client = server.connect_with(options("secret")).unwrap();
    client.ping().unwrap();
}

#[test]
fn too_old_client_is_rejected() {
    let server = TestServer::start(settings());

    let err = server
        .connect_with(ClientOptions {
            revision: 50_000,
            ..ClientOptions::default()
        })
        .err()
        .unwrap();

    assert!(matches!(err, ClientError::Server(e) if e.code == 217));
}

#[test]
fn interserver_queries_are_signed() {
    let server = TestServer::start(ServerSettings {
        cluster_secrets: vec![("main".to_string(), "s3cret".to_string())],
        ..settings()
    });
    let options = |secret: &str| ClientOptions {
        interserver: Some(InterserverOptions {
            cluster: "main".to_string(),
            secret: secret.to_string(),
            salt: "salt".to_string(),
        }),
        ..ClientOptions::default()
    };

    let mut client = server.connect_with(options("s3cret")).unwrap();
    assert!(client.server_hello().nonce.is_some());
    assert_eq!(client.query("SELECT 1").unwrap().rows(), 1);

    let mut forged = server.connect_with(options("guess")).unwrap();
    let e = server_error(forged.query("SELECT 1"));
    assert_eq!(e.code, 516);
    assert_closed(&mut forged);
}

#[test]
fn idle_connections_are_closed() {
    let server = TestServer::start(ServerSettings {
        idle_connection_timeout_secs: 1,
        ..settings()
    });
    let mut client = server.connect();

    let started = Instant::now();
    assert_closed(&mut client);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn zero_idle_timeout_never_closes() {
    let server = TestServer::start(ServerSettings {
        idle_connection_timeout_secs: 0,
        ..settings()
    });
    let mut client = server.connect();

    thread::sleep(Duration::from_millis(300));
    client.ping().unwrap();
    assert_eq!(client.query("SELECT 1").unwrap().rows(), 1);
}

#[test]
fn shutdown_closes_idle_connections() {
    let server = TestServer::start(settings());
    let mut client = server.connect();
    client.ping().unwrap();

    server.stop();

    assert_closed(&mut client);
}
