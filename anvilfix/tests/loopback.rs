//! End-to-end session scenarios over loopback TCP.

use anvilfix::fix::encode::{formatted_time, MessageBuilder};
use anvilfix::fix::fields::{ExecType, MsgType, OrdStatus, OrdType, Side, Tags};
use anvilfix::fix::mem::MsgBuf;
use anvilfix::fix::store::Direction;
use anvilfix::{
    ApplicationError, ChannelHandler, EngineSettings, FixEngine, FixInitiator, RecvHandler,
    SessionRef, SessionSettings,
};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

fn scratch(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("anvilfix-e2e-{}-{}", name, std::process::id()))
}

fn start_engine(name: &str, handler: Arc<dyn RecvHandler>) -> FixEngine {
    let dir = scratch(name);
    let settings = EngineSettings::builder()
        .with_engine_id("Server")
        .with_socket_addr("127.0.0.1:0".parse().unwrap())
        .with_store_dir(dir.join("server-store"))
        .with_log_dir(dir.join("server-log"))
        .build()
        .unwrap();
    FixEngine::bind(settings, handler).unwrap()
}

fn client_settings(name: &str, port: u16) -> SessionSettings {
    let dir = scratch(name);
    SessionSettings::builder()
        .with_sender_comp_id("Client")
        .with_target_comp_id("Server")
        .with_socket_addr(format!("127.0.0.1:{}", port).parse().unwrap())
        .with_store_path(dir.join("client-store.fix"))
        .with_log_dir(dir.join("client-log"))
        .build()
        .unwrap()
}

/// Build a complete raw frame with correct `BodyLength(9)` and
/// `CheckSum(10)`, for driving the acceptor without a session layer.
fn raw_frame(sender: &str, target: &str, msg_type: &str, seq: u32, extra: &str) -> Vec<u8> {
    let body = format!(
        "35={}\x0134={}\x0149={}\x0152={}\x0156={}\x01{}",
        msg_type,
        seq,
        sender,
        formatted_time(),
        target,
        extra
    );
    let mut v = format!("8=FIX.4.4\x019={}\x01{}", body.len(), body).into_bytes();
    let checksum: u32 = v.iter().map(|b| *b as u32).sum::<u32>() % 256;
    v.extend_from_slice(format!("10={:03}\x01", checksum).as_bytes());
    v
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Read `n` complete frames off the socket, waiting up to five seconds.
async fn read_frames(stream: &mut TcpStream, n: usize) -> Vec<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::new();
    let mut frames: Vec<Vec<u8>> = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut chunk = [0u8; 4096];
    while frames.len() < n {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let read = tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await;
        match read {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(k)) => buf.extend_from_slice(&chunk[..k]),
            Ok(Err(_)) => break,
        }
        while let Some(pos) = find_subslice(&buf, b"\x0110=") {
            let end = pos + 1 + 7; // SOH + 10=xxx + SOH
            if buf.len() < end {
                break;
            }
            frames.push(buf.drain(..end).collect());
        }
    }
    frames
}

fn field(frame: &[u8], tag: u32) -> Option<String> {
    let prefix = format!("{}=", tag);
    for part in frame.split(|b| *b == 1) {
        if part.starts_with(prefix.as_bytes()) {
            return Some(String::from_utf8_lossy(&part[prefix.len()..]).into_owned());
        }
    }
    None
}

/// Acceptor-side handler mirroring a broker: every order is acknowledged
/// with a `New` ExecutionReport.
struct EchoHandler {
    count: AtomicU32,
}

impl EchoHandler {
    fn new() -> Arc<EchoHandler> {
        Arc::new(EchoHandler {
            count: AtomicU32::new(0),
        })
    }
}

impl RecvHandler for EchoHandler {
    fn on_message(&self, session: &SessionRef, msg: Arc<MsgBuf>) {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        let cl_ord_id = field(&msg[..], 11).unwrap_or_default();
        let builder = MessageBuilder::new(
            &session.handle().begin_string(),
            MsgType::EXECUTION_REPORT.into(),
        )
        .push(Tags::OrderID, format!("o-{}", n).as_bytes())
        .push(Tags::ClOrdID, cl_ord_id.as_bytes())
        .push(Tags::ExecID, format!("x-{}", n).as_bytes())
        .push(Tags::ExecType, ExecType::NEW.into())
        .push(Tags::OrdStatus, OrdStatus::NEW.into())
        .push(Tags::Symbol, b"IBM")
        .push(Tags::Side, Side::BUY.into())
        .push(Tags::LeavesQty, b"250")
        .push(Tags::CumQty, b"250")
        .push(Tags::AvgPx, b"0.0000");
        let _ = session.send_message(builder);
    }
}

fn order(begin_string: &str, cl_ord_id: &str) -> MessageBuilder {
    MessageBuilder::new(begin_string, MsgType::ORDER_SINGLE.into())
        .push(Tags::ClOrdID, cl_ord_id.as_bytes())
        .push(Tags::HandlInst, b"1")
        .push(Tags::Symbol, b"IBM")
        .push(Tags::Side, Side::BUY.into())
        .push(Tags::TransactTime, formatted_time().as_bytes())
        .push(Tags::OrderQty, b"250")
        .push(Tags::OrdType, OrdType::MARKET.into())
}

#[tokio::test]
async fn normal_order_flow() {
    let _ = tokio::fs::remove_dir_all(scratch("normal")).await;
    let engine = start_engine("normal", EchoHandler::new());
    let (handler, mut events) = ChannelHandler::channel();
    let client = FixInitiator::build(client_settings("normal", engine.port()), handler)
        .unwrap()
        .connect(Duration::from_secs(5))
        .await
        .unwrap();

    for cl_ord_id in ["order-123", "order-124"] {
        client
            .send_message_async(order(&client.begin_string(), cl_ord_id))
            .await
            .unwrap();
    }

    let first = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for execution report")
        .unwrap();
    let second = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for execution report")
        .unwrap();
    assert_eq!(field(&first[..], 17).as_deref(), Some("x-1"));
    assert_eq!(field(&first[..], 11).as_deref(), Some("order-123"));
    assert_eq!(field(&second[..], 17).as_deref(), Some("x-2"));
    assert_eq!(field(&second[..], 11).as_deref(), Some("order-124"));

    // the engine has learned who it is talking to by now
    assert!(engine.get_session("Client").is_some());
    assert!(engine.get_session("Nobody").is_none());

    client.end_async().await.unwrap();

    // client store holds the whole conversation, both directions
    let expectations = [
        (1, Direction::Send, "A"),
        (1, Direction::Recv, "A"),
        (2, Direction::Send, "D"),
        (3, Direction::Send, "D"),
        (2, Direction::Recv, "8"),
        (3, Direction::Recv, "8"),
        (4, Direction::Send, "5"),
        (4, Direction::Recv, "5"),
    ];
    for (seq, direction, msg_type) in expectations {
        let stored = client.get_message(seq, direction).await.unwrap();
        assert_eq!(
            field(&stored, 35).as_deref(),
            Some(msg_type),
            "seq {} {:?}",
            seq,
            direction
        );
    }
    assert_eq!(field(&client.get_message(2, Direction::Send).await.unwrap(), 11).as_deref(), Some("order-123"));
    assert!(matches!(
        client.get_message(9, Direction::Send).await,
        Err(ApplicationError::MessageNotFound(9))
    ));

    assert_eq!(client.sent_seq(), 4);
    assert_eq!(client.recv_seq(), 4);

    engine.shutdown().await.unwrap();
    let _ = tokio::fs::remove_dir_all(scratch("normal")).await;
}

async fn logon_raw(port: u16) -> TcpStream {
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    sock.write_all(&raw_frame(
        "Client",
        "Server",
        "A",
        1,
        "98=0\x01108=30\x01141=Y\x01",
    ))
    .await
    .unwrap();
    let replies = read_frames(&mut sock, 1).await;
    assert_eq!(replies.len(), 1, "no logon reply");
    assert_eq!(field(&replies[0], 35).as_deref(), Some("A"));
    sock
}

#[tokio::test]
async fn bad_sender_comp_id_is_rejected() {
    let _ = tokio::fs::remove_dir_all(scratch("bad-sender")).await;
    let engine = start_engine("bad-sender", EchoHandler::new());
    let mut sock = logon_raw(engine.port()).await;

    sock.write_all(&raw_frame(
        "Bad",
        "Server",
        "D",
        2,
        "11=order-1\x0155=IBM\x0154=1\x0138=250\x0140=1\x01",
    ))
    .await
    .unwrap();

    let replies = read_frames(&mut sock, 2).await;
    assert_eq!(replies.len(), 2, "expected reject and logout");
    let expected_text = "Expected sender of 'Client'. Received 'Bad'.";
    assert_eq!(field(&replies[0], 35).as_deref(), Some("3"));
    assert_eq!(field(&replies[0], 371).as_deref(), Some("49"));
    assert_eq!(field(&replies[0], 58).as_deref(), Some(expected_text));
    assert_eq!(field(&replies[1], 35).as_deref(), Some("5"));
    assert_eq!(field(&replies[1], 58).as_deref(), Some(expected_text));

    engine.shutdown().await.unwrap();
    let _ = tokio::fs::remove_dir_all(scratch("bad-sender")).await;
}

#[tokio::test]
async fn bad_target_comp_id_is_rejected() {
    let _ = tokio::fs::remove_dir_all(scratch("bad-target")).await;
    let engine = start_engine("bad-target", EchoHandler::new());
    let mut sock = logon_raw(engine.port()).await;

    sock.write_all(&raw_frame(
        "Client",
        "Bad",
        "D",
        2,
        "11=order-1\x0155=IBM\x0154=1\x0138=250\x0140=1\x01",
    ))
    .await
    .unwrap();

    let replies = read_frames(&mut sock, 2).await;
    assert_eq!(replies.len(), 2, "expected reject and logout");
    let expected_text = "Expected target of 'Server'. Received 'Bad'.";
    assert_eq!(field(&replies[0], 35).as_deref(), Some("3"));
    assert_eq!(field(&replies[0], 371).as_deref(), Some("56"));
    assert_eq!(field(&replies[0], 58).as_deref(), Some(expected_text));
    assert_eq!(field(&replies[1], 35).as_deref(), Some("5"));
    assert_eq!(field(&replies[1], 58).as_deref(), Some(expected_text));

    engine.shutdown().await.unwrap();
    let _ = tokio::fs::remove_dir_all(scratch("bad-target")).await;
}

#[tokio::test]
async fn unknown_msg_type_is_rejected() {
    let _ = tokio::fs::remove_dir_all(scratch("bad-type")).await;
    let engine = start_engine("bad-type", EchoHandler::new());
    let mut sock = logon_raw(engine.port()).await;

    sock.write_all(&raw_frame("Client", "Server", "BAD", 2, "58=hello\x01"))
        .await
        .unwrap();

    let replies = read_frames(&mut sock, 2).await;
    assert_eq!(replies.len(), 2, "expected reject and logout");
    let expected_text = "FIX specification for BAD in version 4.4 not found";
    assert_eq!(field(&replies[0], 35).as_deref(), Some("3"));
    assert_eq!(field(&replies[0], 58).as_deref(), Some(expected_text));
    assert_eq!(field(&replies[1], 35).as_deref(), Some("5"));
    assert_eq!(field(&replies[1], 58).as_deref(), Some(expected_text));

    engine.shutdown().await.unwrap();
    let _ = tokio::fs::remove_dir_all(scratch("bad-type")).await;
}

#[tokio::test]
async fn sequence_gap_provokes_resend_request() {
    let _ = tokio::fs::remove_dir_all(scratch("gap")).await;
    let engine = start_engine("gap", EchoHandler::new());
    let mut sock = logon_raw(engine.port()).await;

    // jump from 1 to 5
    sock.write_all(&raw_frame(
        "Client",
        "Server",
        "D",
        5,
        "11=order-9\x0155=IBM\x0154=1\x0138=250\x0140=1\x01",
    ))
    .await
    .unwrap();

    let replies = read_frames(&mut sock, 1).await;
    assert_eq!(replies.len(), 1, "expected a resend request");
    assert_eq!(field(&replies[0], 35).as_deref(), Some("2"));
    assert_eq!(field(&replies[0], 7).as_deref(), Some("2"));
    assert_eq!(field(&replies[0], 16).as_deref(), Some("0"));

    engine.shutdown().await.unwrap();
    let _ = tokio::fs::remove_dir_all(scratch("gap")).await;
}

#[tokio::test]
async fn connect_against_dead_port_fails() {
    // grab an ephemeral port, then free it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (handler, _events) = ChannelHandler::channel();
    let result = FixInitiator::build(client_settings("dead-port", port), handler)
        .unwrap()
        .connect(Duration::from_secs(2))
        .await;
    assert!(matches!(result, Err(ApplicationError::IoError(_))));
    let _ = tokio::fs::remove_dir_all(scratch("dead-port")).await;
}

#[tokio::test]
async fn logon_timeout_against_silent_peer() {
    // a listener that accepts and never speaks FIX
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let silent = tokio::spawn(async move {
        let _held = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let (handler, _events) = ChannelHandler::channel();
    let started = std::time::Instant::now();
    let result = FixInitiator::build(client_settings("silent-peer", port), handler)
        .unwrap()
        .connect(Duration::from_millis(500))
        .await;
    assert!(matches!(result, Err(ApplicationError::LogonTimedOut)));
    assert!(started.elapsed() < Duration::from_secs(5));

    silent.abort();
    let _ = tokio::fs::remove_dir_all(scratch("silent-peer")).await;
}

#[tokio::test]
async fn shutdown_drains_within_bound() {
    let _ = tokio::fs::remove_dir_all(scratch("drain")).await;
    let engine = start_engine("drain", EchoHandler::new());
    let (handler, _events) = ChannelHandler::channel();
    let client = FixInitiator::build(client_settings("drain", engine.port()), handler)
        .unwrap()
        .connect(Duration::from_secs(5))
        .await
        .unwrap();

    client.end_async().await.unwrap();
    timeout(Duration::from_secs(4), engine.shutdown())
        .await
        .expect("engine shutdown exceeded its drain windows")
        .unwrap();
    let _ = tokio::fs::remove_dir_all(scratch("drain")).await;
}

#[tokio::test]
async fn acceptor_store_file_is_created_per_session() {
    let _ = tokio::fs::remove_dir_all(scratch("store-file")).await;
    let engine = start_engine("store-file", EchoHandler::new());
    let store_dir = engine.store_dir().to_path_buf();
    let (handler, _events) = ChannelHandler::channel();
    let client = FixInitiator::build(client_settings("store-file", engine.port()), handler)
        .unwrap()
        .connect(Duration::from_secs(5))
        .await
        .unwrap();
    client.end_async().await.unwrap();
    engine.shutdown().await.unwrap();

    let mut entries = tokio::fs::read_dir(&store_dir).await.unwrap();
    let mut found = false;
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("Client-") && name.ends_with(".fix") {
            found = true;
            let contents = tokio::fs::read_to_string(entry.path()).await.unwrap();
            assert!(contents.starts_with("sender: Client\n\n"));
            assert!(contents.contains("35=A"));
            assert!(contents.contains('^'));
        }
    }
    assert!(found, "no session store file was created");
    let _ = tokio::fs::remove_dir_all(scratch("store-file")).await;
}
