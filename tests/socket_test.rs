// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures::SinkExt;
use serde_json::{json, Value};
use slog::{debug, info, o, Drain, Level, LevelFilter, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;

use jet_rpc::message::INTERNAL_ERROR;
use jet_rpc::protocol::{encode_msg, read_messages, FrameReader, JetCodec};
use jet_rpc::transport::ConnectionState;
use jet_rpc::{
    ConnectionConfig, JetConnection, JetError, JetPeer, PeerState, ResponseCallback,
    SocketJetConnection,
};

const NO_TIMEOUT: Duration = Duration::from_secs(0);
const TIMEOUT: Duration = Duration::from_secs(5);

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

/// A minimal daemon: acknowledges every request carrying an id and reports
/// each message it receives on `seen` until the peer closes the stream.
async fn run_daemon(stream: TcpStream, seen: UnboundedSender<Value>, log: Logger) {
    let (read_half, write_half) = stream.into_split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let reader_log = log.clone();
    let reader = tokio::spawn(async move {
        let mut frames = FrameReader::new();
        read_messages(read_half, &mut frames, &frames_tx, &reader_log).await
    });

    let mut sink = FramedWrite::new(write_half, JetCodec);
    while let Some(text) = frames_rx.recv().await {
        let msg: Value = serde_json::from_str(&text).unwrap();
        debug!(log, "daemon received message"; "method" => %msg["method"]);
        if let Some(id) = msg.get("id") {
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": true});
            if sink.send(reply.to_string()).await.is_err() {
                break;
            }
        }
        if seen.send(msg).is_err() {
            break;
        }
    }

    if let Ok(Err(e)) = reader.await {
        info!(log, "daemon reader failed"; "error" => %e);
    }
    info!(log, "daemon connection finished");
}

async fn connect(connection: &dyn JetConnection) -> bool {
    let (tx, rx) = oneshot::channel();
    connection
        .connect(
            Box::new(move |connected| {
                let _ = tx.send(connected);
            }),
            TIMEOUT,
        )
        .unwrap();
    timeout(TIMEOUT, rx).await.unwrap().unwrap()
}

type Order = Arc<Mutex<Vec<(String, bool)>>>;

/// A response callback that appends `label` and the outcome to `order` and
/// then wakes the returned receiver.
fn acknowledged(order: &Order, label: String) -> (ResponseCallback, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    let order = Arc::clone(order);
    let callback: ResponseCallback = Box::new(move |ok, _response| {
        order.lock().unwrap().push((label, ok));
        let _ = tx.send(());
    });
    (callback, rx)
}

async fn connect_peer(peer: &JetPeer) -> bool {
    let (tx, rx) = oneshot::channel();
    peer.connect(
        Box::new(move |connected| {
            let _ = tx.send(connected);
        }),
        TIMEOUT,
    )
    .unwrap();
    timeout(TIMEOUT, rx).await.unwrap().unwrap()
}

#[tokio::test]
async fn state_lifecycle_over_socket() {
    let log = test_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let daemon_log = log.new(o!("role" => "daemon"));
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        run_daemon(stream, seen_tx, daemon_log).await;
    });

    let config = ConnectionConfig {
        port: addr.port(),
        ..ConnectionConfig::default()
    };
    let connection: Arc<dyn JetConnection> =
        Arc::new(SocketJetConnection::from_config(&config, Some(&log)).unwrap());
    let peer = JetPeer::new(Arc::clone(&connection), Some(&log));

    let (tx, rx) = oneshot::channel();
    peer.connect(
        Box::new(move |connected| {
            let _ = tx.send(connected);
        }),
        config.connect_timeout(),
    )
    .unwrap();
    assert!(timeout(TIMEOUT, rx).await.unwrap().unwrap());
    assert!(peer.is_connected());

    let order: Order = Arc::new(Mutex::new(Vec::new()));

    let (added, rx) = acknowledged(&order, "add".to_string());
    peer.add_state("theState", json!(12), None, Some(added), TIMEOUT, NO_TIMEOUT)
        .unwrap();
    timeout(TIMEOUT, rx).await.unwrap().unwrap();

    for value in 1..10 {
        let (changed, rx) = acknowledged(&order, format!("change {}", value));
        peer.change("theState", json!(value), Some(changed), TIMEOUT)
            .unwrap();
        timeout(TIMEOUT, rx).await.unwrap().unwrap();
    }

    let (removed, rx) = acknowledged(&order, "remove".to_string());
    peer.remove_state("theState", Some(removed), TIMEOUT).unwrap();
    timeout(TIMEOUT, rx).await.unwrap().unwrap();
    peer.disconnect().unwrap();

    let mut expected = vec![("add".to_string(), true)];
    expected.extend((1..10).map(|value| (format!("change {}", value), true)));
    expected.push(("remove".to_string(), true));
    assert_eq!(*order.lock().unwrap(), expected);

    let mut seen = Vec::new();
    while let Some(msg) = timeout(TIMEOUT, seen_rx.recv()).await.unwrap() {
        seen.push(msg);
    }

    assert_eq!(seen.len(), 11);
    assert_eq!(seen[0]["method"], json!("add"));
    assert_eq!(seen[0]["params"]["value"], json!(12));
    for (i, msg) in seen[1..10].iter().enumerate() {
        assert_eq!(msg["method"], json!("change"));
        assert_eq!(msg["params"]["value"], json!(i + 1));
        assert_eq!(msg["id"], json!(i + 2));
    }
    assert_eq!(seen[10]["method"], json!("remove"));
    assert_eq!(seen[10]["params"], json!({"path": "theState"}));
    assert!(peer.registry_snapshot().is_empty());
}

#[tokio::test]
async fn remote_close_resets_the_peer() {
    let log = test_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // First connection: read the add, then hang up without answering.
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let _ = stream.read(&mut buf).await;
        drop(stream);

        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(TIMEOUT).await;
    });

    let connection: Arc<dyn JetConnection> =
        Arc::new(SocketJetConnection::new(addr, Some(&log)));
    let peer = JetPeer::new(connection, Some(&log));
    assert!(connect_peer(&peer).await);

    let (tx, rx) = oneshot::channel();
    let added: ResponseCallback = Box::new(move |ok, response| {
        let _ = tx.send((ok, response));
    });
    peer.add_state("s", json!(1), None, Some(added), TIMEOUT, NO_TIMEOUT)
        .unwrap();

    let (ok, response) = timeout(TIMEOUT, rx).await.unwrap().unwrap();
    assert!(!ok);
    assert_eq!(response["error"]["code"], json!(INTERNAL_ERROR));
    timeout(TIMEOUT, async {
        while peer.state() != PeerState::Closed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(peer.registry_snapshot().is_empty());

    assert!(connect_peer(&peer).await);
    assert_eq!(peer.state(), PeerState::Connected);
    peer.disconnect().unwrap();
}

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let log = test_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut frame = vec![0, 0, 0, 100];
        frame.extend_from_slice(&[b' '; 100]);
        stream.write_all(&frame).await.unwrap();
        // Hold the stream open so only the framing fault can close it.
        tokio::time::sleep(TIMEOUT).await;
    });

    let connection = SocketJetConnection::new(addr, Some(&log)).with_receive_buffer_size(32);
    assert!(connect(&connection).await);

    timeout(TIMEOUT, async {
        while connection.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(
        connection.send_message("{}".to_string()),
        Err(JetError::NotConnected)
    ));
}

#[tokio::test]
async fn refused_connect_reports_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connection = SocketJetConnection::new(addr, Some(&test_logger()));
    assert!(!connect(&connection).await);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(connection.disconnect(), Err(JetError::NotConnected)));
}

#[tokio::test]
async fn fragmented_stream_yields_whole_messages() {
    let first = r#"{"jsonrpc":"2.0","id":1,"result":true}"#;
    let second = r#"[{"jsonrpc":"2.0","method":3,"params":{"path":"a"}}]"#;
    let mut wire = BytesMut::new();
    encode_msg(first, &mut wire).unwrap();
    encode_msg(second, &mut wire).unwrap();

    let mock = tokio_test::io::Builder::new()
        .read(&wire[..2])
        .read(&wire[2..9])
        .read(&wire[9..first.len() + 6])
        .read(&wire[first.len() + 6..])
        .build();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut frames = FrameReader::new();
    read_messages(mock, &mut frames, &tx, &test_logger())
        .await
        .unwrap();
    drop(tx);

    assert_eq!(rx.recv().await.as_deref(), Some(first));
    assert_eq!(rx.recv().await.as_deref(), Some(second));
    assert_eq!(rx.recv().await, None);
}
