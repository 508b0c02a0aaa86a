//! Tests against scripted in-process servers.
//!
//! Each [`MockNode`] listens on an ephemeral port, decodes requests with
//! `Command::parse` and answers through a handler closure, logging every
//! command it receives. No external server is needed.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use resp_client::{
    ClusterConfig, ClusterConnection, Connection, ConnectionParameters, ConnectionState, Error,
    NodeConnection, Pipeline, RedirectLimits, Transaction, TransactionState,
};
use resp_proto::{Command, RedirectKind, Value, hash_slot};

// ── Mock server ─────────────────────────────────────────────────────────

/// What the handler wants done with a request.
enum Reply {
    Bytes(Vec<u8>),
    Close,
}

type Handler = dyn Fn(&Command) -> Reply + Send + Sync;

struct MockNode {
    endpoint: String,
    port: u16,
    log: Arc<Mutex<Vec<Command>>>,
}

impl MockNode {
    fn start<F>(handler: F) -> Self
    where
        F: Fn(&Command) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let accept_log = Arc::clone(&log);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let log = Arc::clone(&accept_log);
                let handler = Arc::clone(&handler);
                thread::spawn(move || serve(stream, &*handler, &log));
            }
        });

        Self {
            endpoint: format!("127.0.0.1:{port}"),
            port,
            log,
        }
    }

    fn params(&self) -> ConnectionParameters {
        ConnectionParameters::tcp("127.0.0.1", self.port)
    }

    /// Upper-cased names of every command received so far.
    fn names(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(Command::name).collect()
    }

    fn count(&self, name: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|c| c.is(name)).count()
    }
}

fn serve(mut stream: TcpStream, handler: &Handler, log: &Mutex<Vec<Command>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        let mut out = Vec::new();
        loop {
            match Command::parse(&buf) {
                Ok((command, consumed)) => {
                    buf.drain(..consumed);
                    log.lock().unwrap().push(command.clone());
                    match handler(&command) {
                        Reply::Bytes(bytes) => out.extend_from_slice(&bytes),
                        Reply::Close => {
                            let _ = stream.write_all(&out);
                            return;
                        }
                    }
                }
                Err(e) if e.is_incomplete() => break,
                Err(_) => return,
            }
        }
        if stream.write_all(&out).is_err() {
            return;
        }
    }
}

fn ok() -> Reply {
    Reply::Bytes(Value::OK.to_vec())
}

fn value(v: Value) -> Reply {
    Reply::Bytes(v.to_vec())
}

fn arg(command: &Command, i: usize) -> Vec<u8> {
    command.arguments()[i].to_vec()
}

/// Bulk reply of `prefix` followed by the command's first argument.
fn tagged(prefix: &[u8], command: &Command) -> Reply {
    value(Value::bulk_string(&[prefix, arg(command, 0).as_slice()].concat()))
}

/// A small in-memory server covering the commands used below.
fn memory_server() -> MockNode {
    let lists: Mutex<HashMap<Vec<u8>, Vec<Vec<u8>>>> = Mutex::new(HashMap::new());
    MockNode::start(move |cmd| match cmd.name().as_str() {
        "PING" => value(Value::simple_string(b"PONG")),
        "ECHO" => value(Value::bulk_string(&arg(cmd, 0))),
        "AUTH" | "SELECT" | "FLUSHDB" | "CLIENT" => ok(),
        "GET" => value(Value::Null),
        "RPUSH" => {
            let mut lists = lists.lock().unwrap();
            let list = lists.entry(arg(cmd, 0)).or_default();
            list.extend(cmd.arguments()[1..].iter().map(|a| a.to_vec()));
            value(Value::Integer(list.len() as i64))
        }
        "LRANGE" => {
            let lists = lists.lock().unwrap();
            let items = lists.get(&arg(cmd, 0)).cloned().unwrap_or_default();
            value(Value::Array(
                items.iter().map(|i| Value::bulk_string(i)).collect(),
            ))
        }
        _ => value(Value::error(b"ERR unknown command")),
    })
}

// ── Node connection ─────────────────────────────────────────────────────

#[test]
fn end_to_end_commands() {
    let server = memory_server();
    let mut conn = NodeConnection::new(server.params()).unwrap();

    let reply = conn.execute_command(&Command::ping()).unwrap();
    assert_eq!(reply, Value::simple_string(b"PONG"));

    let reply = conn.execute_command(&Command::new("ECHO").arg("echoed")).unwrap();
    assert_eq!(reply, Value::bulk_string(b"echoed"));

    let reply = conn.execute_command(&Command::new("GET").key("foobar")).unwrap();
    assert_eq!(reply, Value::Null);

    let reply = conn
        .execute_command(&Command::new("RPUSH").key("metavars").args(["foo", "hoge", "lol"]))
        .unwrap();
    assert_eq!(reply, Value::Integer(3));

    let reply = conn
        .execute_command(&Command::new("LRANGE").key("metavars").arg("0").arg("-1")).unwrap();
    assert_eq!(
        reply,
        Value::Array(vec![
            Value::bulk_string(b"foo"),
            Value::bulk_string(b"hoge"),
            Value::bulk_string(b"lol"),
        ])
    );
}

#[test]
fn connects_lazily_on_first_write() {
    let server = memory_server();
    let mut conn = NodeConnection::new(server.params()).unwrap();
    assert!(!conn.is_connected());
    assert!(server.names().is_empty());

    conn.write_request(&Command::ping()).unwrap();
    assert!(conn.is_connected());
    assert_eq!(conn.read().unwrap(), Value::simple_string(b"PONG"));
}

#[test]
fn explicit_connect_is_idempotent() {
    let server = memory_server();
    let mut conn = NodeConnection::new(server.params().database(1)).unwrap();
    conn.connect().unwrap();
    conn.connect().unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.execute_command(&Command::ping()).unwrap();
    assert_eq!(server.count("SELECT"), 1);
}

#[test]
fn tcp_nodelay_either_way() {
    let server = memory_server();
    for nodelay in [true, false] {
        let mut conn = NodeConnection::new(server.params().tcp_nodelay(nodelay)).unwrap();
        conn.connect().unwrap();
        assert!(conn.is_connected());
        conn.disconnect();
        assert!(!conn.is_connected());
    }
}

#[test]
fn error_reply_is_data() {
    let server = memory_server();
    let mut conn = NodeConnection::new(server.params()).unwrap();
    let reply = conn.execute_command(&Command::new("NOPE")).unwrap();
    assert_eq!(reply.error_code(), Some("ERR"));
    assert!(conn.is_connected());
    assert!(matches!(
        conn.execute_checked(&Command::new("NOPE")),
        Err(Error::Redis(msg)) if msg == "ERR unknown command"
    ));
}

#[test]
fn connect_commands_replayed_in_order_after_reconnect() {
    let server = memory_server();
    let params = server.params().credentials(None, "secret").database(15);
    let mut conn = NodeConnection::new(params).unwrap();
    conn.add_connect_command(Command::new("FLUSHDB"));

    conn.execute_command(&Command::ping()).unwrap();
    conn.disconnect();
    conn.execute_command(&Command::ping()).unwrap();

    assert_eq!(
        server.names(),
        vec!["AUTH", "SELECT", "FLUSHDB", "PING", "AUTH", "SELECT", "FLUSHDB", "PING"]
    );
    let log = server.log.lock().unwrap();
    assert_eq!(log[1].arguments()[0].as_ref(), b"15");
    assert_eq!(log[0].arguments()[0].as_ref(), b"secret");
}

#[test]
fn rejected_connect_command_aborts_connect() {
    let server = MockNode::start(|cmd| {
        if cmd.is("AUTH") {
            value(Value::error(b"WRONGPASS invalid username-password pair"))
        } else {
            ok()
        }
    });
    let mut conn = NodeConnection::new(server.params().credentials(None, "bad")).unwrap();
    let err = conn.execute_command(&Command::ping()).unwrap_err();
    match err {
        Error::ConnectCommand {
            endpoint,
            command,
            message,
        } => {
            assert_eq!(endpoint, server.endpoint);
            assert_eq!(command, "AUTH");
            assert!(message.starts_with("WRONGPASS"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!conn.is_connected());
    assert_eq!(server.count("PING"), 0);
}

#[test]
fn desynchronized_stream_is_fatal() {
    // Replies without the type byte, as if one byte had already been consumed.
    let server = MockNode::start(|_| Reply::Bytes(b"PONG\r\n".to_vec()));
    let mut conn = NodeConnection::new(server.params()).unwrap();

    let err = conn.execute_command(&Command::ping()).unwrap_err();
    assert!(matches!(
        &err,
        Error::Protocol { source, .. }
            if source.to_string() == "Protocol error, got 'P' as reply type byte"
    ));
    assert!(err.to_string().contains(&server.endpoint));
    assert!(!conn.is_connected());
}

#[test]
fn peer_close_marks_disconnected() {
    let server = MockNode::start(|cmd| if cmd.is("QUIT") { Reply::Close } else { ok() });
    let mut conn = NodeConnection::new(server.params()).unwrap();
    let err = conn.execute_command(&Command::new("QUIT")).unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed { .. }));
    assert!(!conn.is_connected());

    // The next command reconnects transparently.
    assert!(conn.execute_command(&Command::ping()).unwrap().is_status("OK"));
    assert!(conn.is_connected());
}

#[test]
fn unsupported_scheme_fails_before_io() {
    let params = ConnectionParameters::default().scheme_name("udp");
    let err = NodeConnection::new(params).unwrap_err();
    assert!(matches!(&err, Error::InvalidArgument(msg) if msg == "Invalid scheme: 'udp'."));
}

#[test]
fn deserialized_connection_reconnects_lazily() {
    let server = memory_server();
    let mut original = NodeConnection::new(server.params().database(2)).unwrap();
    original.add_connect_command(Command::new("CLIENT").arg("SETNAME").arg("restored"));
    original.connect().unwrap();

    let json = serde_json::to_string(&original).unwrap();
    let mut restored: NodeConnection = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.parameters(), original.parameters());
    assert_eq!(restored.state(), ConnectionState::Disconnected);

    restored.execute_command(&Command::ping()).unwrap();
    assert_eq!(
        server.names(),
        vec!["SELECT", "CLIENT", "SELECT", "CLIENT", "PING"]
    );
}

#[test]
fn read_timeout_disconnects() {
    // BLPOP is never answered.
    let server = MockNode::start(|cmd| {
        if cmd.is("PING") {
            value(Value::simple_string(b"PONG"))
        } else {
            Reply::Bytes(Vec::new())
        }
    });
    let params = server.params().read_write_timeout(Duration::from_millis(100));
    let mut conn = NodeConnection::new(params).unwrap();

    let err = conn
        .execute_command(&Command::new("BLPOP").key("queue").arg("0"))
        .unwrap_err();
    assert!(matches!(
        &err,
        Error::Connection { endpoint, source }
            if *endpoint == server.endpoint
                && matches!(source.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
    ));
    assert!(!conn.is_connected());
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    // The old socket is discarded and PING opens a new one.
    assert!(conn.execute_command(&Command::ping()).unwrap().is_status("PONG"));
}

// ── Pipelines ───────────────────────────────────────────────────────────

#[test]
fn pipeline_replies_in_submission_order() {
    let server = memory_server();
    let mut conn = NodeConnection::new(server.params()).unwrap();
    let mut pipeline = Pipeline::new(&mut conn);
    let first = pipeline.queue(Command::new("ECHO").arg("one"));
    let second = pipeline.queue(Command::new("RPUSH").key("l").arg("x"));
    let third = pipeline.queue(Command::new("ECHO").arg("three"));

    let replies = pipeline.flush().unwrap();
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[first], Value::bulk_string(b"one"));
    assert_eq!(replies[second], Value::Integer(1));
    assert_eq!(replies[third], Value::bulk_string(b"three"));
}

#[test]
fn pipeline_keeps_server_errors_in_place() {
    let server = memory_server();
    let mut conn = NodeConnection::new(server.params()).unwrap();
    let mut pipeline = Pipeline::new(&mut conn);
    pipeline.queue(Command::ping());
    pipeline.queue(Command::new("NOPE"));
    pipeline.queue(Command::ping());
    let replies = pipeline.flush().unwrap();
    assert!(replies[0].is_status("PONG"));
    assert!(replies[1].is_error());
    assert!(replies[2].is_status("PONG"));
}

#[test]
fn interleaved_writes_and_reads_stay_ordered() {
    let server = memory_server();
    let mut conn = NodeConnection::new(server.params()).unwrap();
    conn.write_request(&Command::new("ECHO").arg("a")).unwrap();
    conn.write_request(&Command::new("ECHO").arg("b")).unwrap();
    assert_eq!(conn.read().unwrap(), Value::bulk_string(b"a"));
    conn.write_request(&Command::new("ECHO").arg("c")).unwrap();
    assert_eq!(conn.read().unwrap(), Value::bulk_string(b"b"));
    assert_eq!(conn.read().unwrap(), Value::bulk_string(b"c"));
}

// ── Transactions ────────────────────────────────────────────────────────

fn transaction_server(exec_reply: &'static [u8]) -> MockNode {
    MockNode::start(move |cmd| match cmd.name().as_str() {
        "WATCH" | "UNWATCH" | "MULTI" | "DISCARD" => ok(),
        "EXEC" => Reply::Bytes(exec_reply.to_vec()),
        "BAD" => value(Value::error(b"ERR wrong number of arguments for 'bad' command")),
        _ => Reply::Bytes(Value::QUEUED.to_vec()),
    })
}

#[test]
fn transaction_exec_returns_queued_replies() {
    let server = transaction_server(b"*2\r\n:1\r\n+OK\r\n");
    let mut conn = NodeConnection::new(server.params()).unwrap();
    let mut tx = Transaction::new(&mut conn);

    tx.watch(["balance"]).unwrap();
    assert_eq!(tx.state(), TransactionState::Watching);
    tx.multi().unwrap();
    let queued = tx.queue(Command::new("INCR").key("balance")).unwrap();
    assert!(queued.is_status("QUEUED"));
    tx.queue(Command::new("SET").key("flag").arg("1")).unwrap();
    assert_eq!(tx.queued().len(), 2);

    let replies = tx.exec().unwrap();
    assert_eq!(replies, vec![Value::Integer(1), Value::simple_string(b"OK")]);
    assert_eq!(tx.state(), TransactionState::Executed);
    drop(tx);
    assert_eq!(server.names(), vec!["WATCH", "MULTI", "INCR", "SET", "EXEC"]);
}

#[test]
fn transaction_nil_exec_is_abort_not_empty() {
    let server = transaction_server(b"*-1\r\n");
    let mut conn = NodeConnection::new(server.params()).unwrap();
    let mut tx = Transaction::new(&mut conn);
    tx.watch(["k"]).unwrap();
    tx.multi().unwrap();
    tx.queue(Command::new("INCR").key("k")).unwrap();
    tx.queue(Command::new("INCR").key("k")).unwrap();
    assert!(matches!(tx.exec(), Err(Error::TransactionAborted)));
    assert_eq!(tx.state(), TransactionState::Aborted);
}

#[test]
fn transaction_empty_exec_is_success() {
    let server = transaction_server(b"*0\r\n");
    let mut conn = NodeConnection::new(server.params()).unwrap();
    let mut tx = Transaction::new(&mut conn);
    tx.multi().unwrap();
    assert_eq!(tx.exec().unwrap(), Vec::<Value>::new());
}

#[test]
fn transaction_discard_and_rejected_command() {
    let server = transaction_server(b"*0\r\n");
    let mut conn = NodeConnection::new(server.params()).unwrap();
    let mut tx = Transaction::new(&mut conn);
    tx.multi().unwrap();
    assert!(matches!(tx.queue(Command::new("BAD")), Err(Error::Redis(_))));
    assert_eq!(tx.state(), TransactionState::Queuing);
    assert!(tx.queued().is_empty());
    assert!(matches!(tx.multi(), Err(Error::InvalidTransactionState { .. })));
    tx.discard().unwrap();
    assert_eq!(tx.state(), TransactionState::Idle);
    drop(tx);
    assert_eq!(server.count("EXEC"), 0);
}

// ── Cluster ─────────────────────────────────────────────────────────────

/// `CLUSTER SLOTS` reply assigning every slot to `endpoint`.
fn all_slots(endpoint: &str) -> Reply {
    let (host, port) = endpoint.rsplit_once(':').unwrap();
    value(Value::Array(vec![Value::Array(vec![
        Value::Integer(0),
        Value::Integer(16383),
        Value::Array(vec![
            Value::bulk_string(host.as_bytes()),
            Value::Integer(port.parse().unwrap()),
            Value::bulk_string(b"node-a"),
        ]),
    ])]))
}

/// Node A owns everything according to its topology, but its answer to
/// data commands is decided by `data`.
fn node_a<F>(data: F) -> MockNode
where
    F: Fn(&Command) -> Reply + Send + Sync + 'static,
{
    let self_endpoint: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let endpoint = Arc::clone(&self_endpoint);
    let node = MockNode::start(move |cmd| {
        if cmd.is("CLUSTER") {
            all_slots(&endpoint.lock().unwrap())
        } else {
            data(cmd)
        }
    });
    *self_endpoint.lock().unwrap() = node.endpoint.clone();
    node
}

fn cluster_for(seed: &MockNode) -> ClusterConnection {
    ClusterConnection::new(ClusterConfig::new([seed.endpoint.clone()])).unwrap()
}

#[test]
fn cluster_discovers_topology_on_first_command() {
    let a = node_a(|_| value(Value::bulk_string(b"from-a")));
    let mut cluster = cluster_for(&a);
    let reply = cluster.execute_command(&Command::new("GET").key("foo")).unwrap();
    assert_eq!(reply, Value::bulk_string(b"from-a"));
    assert!(cluster.slot_map().is_initialized());
    assert_eq!(a.names(), vec!["CLUSTER", "GET"]);
}

#[test]
fn cluster_moved_retries_once_and_updates_slot_map() {
    let b = MockNode::start(|_| value(Value::bulk_string(b"from-b")));
    let moved = format!("MOVED {} {}", hash_slot(b"foo"), b.endpoint);
    let a = node_a(move |_| value(Value::error(moved.as_bytes())));

    let mut cluster = cluster_for(&a);
    let get = Command::new("GET").key("foo");

    let reply = cluster.execute_command(&get).unwrap();
    assert_eq!(reply, Value::bulk_string(b"from-b"));
    assert_eq!(a.count("GET"), 1);
    assert_eq!(b.count("GET"), 1);
    assert_eq!(cluster.slot_map().lookup(hash_slot(b"foo")), Some(b.endpoint.as_str()));

    // The next command for the slot goes straight to B.
    cluster.execute_command(&get).unwrap();
    assert_eq!(a.count("GET"), 1);
    assert_eq!(b.count("GET"), 2);

    // Other slots still belong to A.
    assert_eq!(cluster.slot_map().lookup(0), Some(a.endpoint.as_str()));
}

#[test]
fn cluster_second_moved_is_surfaced() {
    // B bounces the command back to A, which bounces it to B again.
    let a_endpoint: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let back_to_a = Arc::clone(&a_endpoint);
    let slot = hash_slot(b"foo");
    let b = MockNode::start(move |_| {
        let moved = format!("MOVED {slot} {}", back_to_a.lock().unwrap());
        value(Value::error(moved.as_bytes()))
    });
    let to_b = format!("MOVED {slot} {}", b.endpoint);
    let a = node_a(move |_| value(Value::error(to_b.as_bytes())));
    *a_endpoint.lock().unwrap() = a.endpoint.clone();

    let mut cluster = cluster_for(&a);
    let get = Command::new("GET").key("foo");
    let err = cluster.execute_command(&get).unwrap_err();
    match err {
        Error::TooManyRedirects {
            kind,
            slot: err_slot,
            endpoint,
        } => {
            assert_eq!(kind, RedirectKind::Moved);
            assert_eq!(err_slot, slot);
            assert_eq!(endpoint, a.endpoint);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(a.count("GET"), 1);
    assert_eq!(b.count("GET"), 1);

    // A looser limit allows exactly one more hop.
    let limits = RedirectLimits { moved: 2, ask: 1 };
    assert!(cluster.execute_command_with_limits(&get, limits).is_err());
    assert_eq!(a.count("GET") + b.count("GET"), 5);
}

#[test]
fn cluster_ask_does_not_touch_slot_map() {
    let b = MockNode::start(|cmd| {
        if cmd.is("ASKING") {
            ok()
        } else {
            value(Value::bulk_string(b"from-b"))
        }
    });
    let ask = format!("ASK {} {}", hash_slot(b"foo"), b.endpoint);
    let a = node_a(move |_| value(Value::error(ask.as_bytes())));

    let mut cluster = cluster_for(&a);
    let get = Command::new("GET").key("foo");

    let reply = cluster.execute_command(&get).unwrap();
    assert_eq!(reply, Value::bulk_string(b"from-b"));
    assert_eq!(b.names(), vec!["ASKING", "GET"]);
    assert_eq!(cluster.slot_map().lookup(hash_slot(b"foo")), Some(a.endpoint.as_str()));

    // Still routed to A first.
    cluster.execute_command(&get).unwrap();
    assert_eq!(a.count("GET"), 2);
    assert_eq!(b.names(), vec!["ASKING", "GET", "ASKING", "GET"]);
}

#[test]
fn cluster_other_errors_returned_as_data() {
    let a = node_a(|_| value(Value::error(b"WRONGTYPE Operation against a key")));
    let mut cluster = cluster_for(&a);
    let reply = cluster.execute_command(&Command::new("LLEN").key("foo")).unwrap();
    assert_eq!(reply.error_code(), Some("WRONGTYPE"));
}

#[test]
fn cluster_rejects_keyless_and_cross_slot_before_io() {
    let a = node_a(|_| ok());
    let mut cluster = cluster_for(&a);
    assert!(matches!(
        cluster.execute_command(&Command::ping()),
        Err(Error::NoKey(_))
    ));
    assert!(matches!(
        cluster.execute_command(&Command::new("MGET").key("{a}1").key("{b}2")),
        Err(Error::CrossSlot(_))
    ));
    assert!(a.names().is_empty());
}

#[test]
fn cluster_topology_unavailable() {
    let seed = MockNode::start(|_| {
        value(Value::error(b"ERR This instance has cluster support disabled"))
    });
    let mut cluster = cluster_for(&seed);
    let err = cluster.execute_command(&Command::new("GET").key("foo")).unwrap_err();
    assert!(matches!(
        &err,
        Error::TopologyUnavailable(msg) if msg.contains("cluster support disabled")
    ));
}

#[test]
fn cluster_pipeline_reads_in_write_order() {
    // A owns everything but forwards "b"-tagged keys' slot to B via topology.
    let b = MockNode::start(|cmd| tagged(b"b:", cmd));
    let b_endpoint = b.endpoint.clone();
    let b_slot = hash_slot(b"{b}");
    let a_endpoint: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let own = Arc::clone(&a_endpoint);
    let a = MockNode::start(move |cmd| {
        if cmd.is("CLUSTER") {
            let node = |endpoint: &str| {
                let (host, port) = endpoint.rsplit_once(':').unwrap();
                Value::Array(vec![
                    Value::bulk_string(host.as_bytes()),
                    Value::Integer(port.parse().unwrap()),
                ])
            };
            let own = own.lock().unwrap().clone();
            let mut ranges = Vec::new();
            if b_slot > 0 {
                ranges.push(Value::Array(vec![
                    Value::Integer(0),
                    Value::Integer(b_slot as i64 - 1),
                    node(&own),
                ]));
            }
            ranges.push(Value::Array(vec![
                Value::Integer(b_slot as i64),
                Value::Integer(b_slot as i64),
                node(&b_endpoint),
            ]));
            if b_slot < 16383 {
                ranges.push(Value::Array(vec![
                    Value::Integer(b_slot as i64 + 1),
                    Value::Integer(16383),
                    node(&own),
                ]));
            }
            value(Value::Array(ranges))
        } else {
            tagged(b"a:", cmd)
        }
    });
    *a_endpoint.lock().unwrap() = a.endpoint.clone();

    let mut cluster = cluster_for(&a);
    cluster.connect().unwrap();
    assert_eq!(cluster.slot_map().lookup(b_slot), Some(b.endpoint.as_str()));

    let mut pipeline = Pipeline::new(&mut cluster);
    pipeline.queue(Command::new("GET").key("x{b}"));
    pipeline.queue(Command::new("GET").key("foo"));
    pipeline.queue(Command::new("GET").key("y{b}"));
    let replies = pipeline.flush().unwrap();
    assert_eq!(
        replies,
        vec![
            Value::bulk_string(b"b:x{b}"),
            Value::bulk_string(b"a:foo"),
            Value::bulk_string(b"b:y{b}"),
        ]
    );
    assert_eq!(cluster.pending(), 0);
}

#[test]
fn cluster_unroutable_command_fails_flush_before_any_write() {
    let a = node_a(|cmd| tagged(b"a:", cmd));
    let mut cluster = cluster_for(&a);
    cluster.connect().unwrap();

    let mut pipeline = Pipeline::new(&mut cluster);
    pipeline.queue(Command::new("GET").key("first"));
    pipeline.queue(Command::ping());
    assert!(matches!(pipeline.flush(), Err(Error::NoKey(_))));

    pipeline.queue(Command::new("GET").key("second"));
    let replies = pipeline.flush().unwrap();
    assert_eq!(replies, vec![Value::bulk_string(b"a:second")]);
    drop(pipeline);
    assert_eq!(cluster.pending(), 0);
    assert_eq!(a.count("GET"), 1);
}

#[test]
fn cluster_failed_read_abandons_remaining_replies() {
    // A drops the connection when it sees the "boom" key.
    let a = node_a(|cmd| {
        if cmd.arguments()[0].as_ref() == b"boom" {
            Reply::Close
        } else {
            tagged(b"a:", cmd)
        }
    });
    let mut cluster = cluster_for(&a);
    cluster.connect().unwrap();

    let mut pipeline = Pipeline::new(&mut cluster);
    pipeline.queue(Command::new("GET").key("x"));
    pipeline.queue(Command::new("GET").key("boom"));
    pipeline.queue(Command::new("GET").key("y"));
    // EOF or a reset, depending on how much A had read before closing.
    assert!(pipeline.flush().unwrap_err().is_connection_error());

    pipeline.queue(Command::new("GET").key("z"));
    let replies = pipeline.flush().unwrap();
    assert_eq!(replies, vec![Value::bulk_string(b"a:z")]);
    drop(pipeline);
    assert_eq!(cluster.pending(), 0);
}

#[test]
fn cluster_second_ask_is_surfaced() {
    let slot = hash_slot(b"foo");
    let a_endpoint: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let back_to_a = Arc::clone(&a_endpoint);
    let b = MockNode::start(move |cmd| {
        if cmd.is("ASKING") {
            ok()
        } else {
            let ask = format!("ASK {slot} {}", back_to_a.lock().unwrap());
            value(Value::error(ask.as_bytes()))
        }
    });
    let to_b = format!("ASK {slot} {}", b.endpoint);
    let a = node_a(move |_| value(Value::error(to_b.as_bytes())));
    *a_endpoint.lock().unwrap() = a.endpoint.clone();

    let mut cluster = cluster_for(&a);
    let err = cluster
        .execute_command(&Command::new("GET").key("foo"))
        .unwrap_err();
    match err {
        Error::TooManyRedirects {
            kind,
            slot: err_slot,
            endpoint,
        } => {
            assert_eq!(kind, RedirectKind::Ask);
            assert_eq!(err_slot, slot);
            assert_eq!(endpoint, a.endpoint);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(b.names(), vec!["ASKING", "GET"]);
    assert_eq!(a.count("GET"), 1);
    assert_eq!(cluster.slot_map().lookup(slot), Some(a.endpoint.as_str()));
}

#[test]
fn cluster_rejected_asking_is_an_error() {
    let b = MockNode::start(|cmd| {
        if cmd.is("ASKING") {
            value(Value::error(b"ERR ASKING not allowed"))
        } else {
            value(Value::bulk_string(b"from-b"))
        }
    });
    let ask = format!("ASK {} {}", hash_slot(b"foo"), b.endpoint);
    let a = node_a(move |_| value(Value::error(ask.as_bytes())));

    let mut cluster = cluster_for(&a);
    let get = Command::new("GET").key("foo");
    for _ in 0..2 {
        // Both replies are consumed, so the second attempt starts clean.
        assert!(matches!(
            cluster.execute_command(&get),
            Err(Error::Redis(msg)) if msg == "ERR ASKING not allowed"
        ));
    }
    assert_eq!(b.names(), vec!["ASKING", "GET", "ASKING", "GET"]);
    assert_eq!(cluster.slot_map().lookup(hash_slot(b"foo")), Some(a.endpoint.as_str()));
}
