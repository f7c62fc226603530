//! Connection manager tests against scripted mock brokers.
//!
//! Each test spawns a std TcpListener on a loopback port and drives the
//! broker side of the conversation from a thread; assertions inside the
//! broker thread surface through `join().unwrap()`.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use rhodium_stomp::{
    ConnectOptions, Connection, Frame, StompError, StompVersion, SubscribeOptions,
};

fn spawn_broker<F>(script: F) -> (u16, thread::JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            script(stream);
        }
    });
    (port, handle)
}

/// Read one frame up to its NUL terminator, skipping stray LFs between
/// frames. Returns the frame text without the NUL.
fn read_frame(stream: &mut TcpStream) -> String {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == 0 {
                    break;
                }
                if bytes.is_empty() && byte[0] == b'\n' {
                    continue;
                }
                bytes.push(byte[0]);
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn options(port: u16) -> ConnectOptions {
    ConnectOptions::new("127.0.0.1")
        .port(port)
        .credentials("guest", "guest")
        .timeout(Duration::from_secs(5))
}

async fn next_message_within(conn: &Connection, secs: u64) -> rhodium_stomp::CallerMessage {
    tokio::time::timeout(Duration::from_secs(secs), conn.next_message())
        .await
        .expect("timed out waiting for message")
        .expect("connection closed")
}

// =============================================================================
// Handshake and Version Negotiation
// =============================================================================

#[tokio::test]
async fn handshake_negotiates_1_2_and_ack_quotes_ack_header() {
    let (port, broker) = spawn_broker(|mut stream| {
        let connect = read_frame(&mut stream);
        assert!(connect.starts_with("STOMP\n"), "got: {}", connect);
        assert!(connect.contains("accept-version:1.2"));
        assert!(connect.contains("host:127.0.0.1"));
        assert!(connect.contains("login:guest"));
        assert!(connect.contains("passcode:guest"));
        stream.write_all(b"CONNECTED\nversion:1.2\n\n\0").unwrap();

        let subscribe = read_frame(&mut stream);
        assert!(subscribe.starts_with("SUBSCRIBE\n"), "got: {}", subscribe);
        stream
            .write_all(
                b"MESSAGE\ndestination:/queue/a\nmessage-id:m1\nack:server-ack-1\nsubscription:1\n\nhello\0",
            )
            .unwrap();

        let ack = read_frame(&mut stream);
        assert!(ack.starts_with("ACK\n"), "got: {}", ack);
        assert!(ack.contains("id:server-ack-1"), "got: {}", ack);
        assert!(ack.contains("subscription:1"), "got: {}", ack);
        thread::sleep(Duration::from_millis(100));
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");
    conn.set_send_to_caller(true).await.unwrap();
    let id = conn
        .subscribe("/queue/a", Vec::new(), SubscribeOptions::default())
        .await
        .unwrap();
    assert_eq!(id, "1");

    let message = next_message_within(&conn, 5).await;
    assert_eq!(message.destination, "/queue/a");
    assert_eq!(message.frame.body, b"hello");

    conn.ack(&message.frame).await.unwrap();
    broker.join().unwrap();
}

#[tokio::test]
async fn connected_without_version_header_means_1_0() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"CONNECTED\n\n\0").unwrap();

        let subscribe = read_frame(&mut stream);
        assert!(subscribe.starts_with("SUBSCRIBE\n"));
        stream
            .write_all(b"MESSAGE\ndestination:/queue/a\nmessage-id:m42\n\nold school\0")
            .unwrap();

        // 1.0 session: the ACK must quote message-id, not ack/id
        let ack = read_frame(&mut stream);
        assert!(ack.starts_with("ACK\n"), "got: {}", ack);
        assert!(ack.contains("message-id:m42"), "got: {}", ack);
        thread::sleep(Duration::from_millis(100));
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");
    conn.set_send_to_caller(true).await.unwrap();
    conn.subscribe("/queue/a", Vec::new(), SubscribeOptions::default())
        .await
        .unwrap();

    let message = next_message_within(&conn, 5).await;
    conn.ack(&message.frame).await.unwrap();
    broker.join().unwrap();
}

#[tokio::test]
async fn requesting_only_1_0_uses_connect_command() {
    let (port, broker) = spawn_broker(|mut stream| {
        let connect = read_frame(&mut stream);
        assert!(connect.starts_with("CONNECT\n"), "got: {}", connect);
        assert!(connect.contains("accept-version:1.0"));
        stream.write_all(b"CONNECTED\n\n\0").unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let conn = Connection::connect(
        options(port).accept_versions(&[StompVersion::V1_0]),
    )
    .await
    .expect("connect failed");
    drop(conn);
    broker.join().unwrap();
}

#[tokio::test]
async fn error_frame_during_handshake_is_server_rejected() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _connect = read_frame(&mut stream);
        stream
            .write_all(b"ERROR\nmessage:Authentication failed\n\nInvalid credentials\0")
            .unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let result = Connection::connect(options(port)).await;
    match result {
        Err(StompError::ServerRejected(message)) => {
            assert_eq!(message, "Authentication failed");
        }
        other => panic!("expected ServerRejected, got {:?}", other.map(|_| ())),
    }
    broker.join().unwrap();
}

#[tokio::test]
async fn unexpected_handshake_frame_is_server_rejected() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"RECEIPT\nreceipt-id:1\n\n\0").unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let result = Connection::connect(options(port)).await;
    assert!(matches!(result, Err(StompError::ServerRejected(_))));
    broker.join().unwrap();
}

#[tokio::test]
async fn connect_refused_is_a_transport_error() {
    // grab a free port and release it again
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let result = Connection::connect(options(port)).await;
    assert!(matches!(result, Err(StompError::Transport(_))));
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn duplicate_subscription_is_rejected_locally() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"CONNECTED\nversion:1.2\n\n\0").unwrap();

        let subscribe = read_frame(&mut stream);
        assert!(subscribe.contains("id:sub-7"), "got: {}", subscribe);
        assert!(subscribe.contains("ack:client"), "got: {}", subscribe);

        let unsubscribe = read_frame(&mut stream);
        assert!(unsubscribe.starts_with("UNSUBSCRIBE\n"), "got: {}", unsubscribe);
        assert!(unsubscribe.contains("id:sub-7"), "got: {}", unsubscribe);
        thread::sleep(Duration::from_millis(100));
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");
    let id = conn
        .subscribe(
            "/queue/a",
            vec![
                ("id".to_string(), "sub-7".to_string()),
                ("ack".to_string(), "client".to_string()),
            ],
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(id, "sub-7");

    let err = conn
        .subscribe("/queue/a", Vec::new(), SubscribeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StompError::AlreadySubscribed(d) if d == "/queue/a"));

    let err = conn.unsubscribe("/queue/missing").await.unwrap_err();
    assert!(matches!(err, StompError::NotSubscribed(_)));

    conn.unsubscribe("/queue/a").await.unwrap();
    broker.join().unwrap();
}

#[tokio::test]
async fn destination_in_extra_headers_cannot_override_the_parameter() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"CONNECTED\nversion:1.2\n\n\0").unwrap();

        let subscribe = read_frame(&mut stream);
        assert!(
            subscribe.contains("destination:/queue/real"),
            "got: {}",
            subscribe
        );
        assert!(
            !subscribe.contains("/queue/hijacked"),
            "got: {}",
            subscribe
        );
        stream
            .write_all(b"MESSAGE\ndestination:/queue/real\nmessage-id:m1\n\nrouted\0")
            .unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");
    conn.set_send_to_caller(true).await.unwrap();
    conn.subscribe(
        "/queue/real",
        vec![("destination".to_string(), "/queue/hijacked".to_string())],
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    // the registry and the wire agree, so dispatch still matches
    let message = next_message_within(&conn, 5).await;
    assert_eq!(message.destination, "/queue/real");
    assert_eq!(message.frame.body, b"routed");
    broker.join().unwrap();
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn callbacks_run_in_registration_order() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"CONNECTED\nversion:1.2\n\n\0").unwrap();
        let _subscribe = read_frame(&mut stream);
        stream
            .write_all(b"MESSAGE\ndestination:/queue/cb\nmessage-id:m1\n\none\0")
            .unwrap();
        stream
            .write_all(b"MESSAGE\ndestination:/queue/cb\nmessage-id:m2\n\ntwo\0")
            .unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let tx1 = tx.clone();
    conn.register_callback("/queue/cb", move |frame: &Frame| {
        let _ = tx1.send(("first", frame.get_header("message-id").unwrap().to_string()));
    })
    .await
    .unwrap();
    let tx2 = tx.clone();
    conn.register_callback("/queue/cb", move |frame: &Frame| {
        let _ = tx2.send(("second", frame.get_header("message-id").unwrap().to_string()));
    })
    .await
    .unwrap();

    conn.subscribe("/queue/cb", Vec::new(), SubscribeOptions::default())
        .await
        .unwrap();

    for expected in [
        ("first", "m1"),
        ("second", "m1"),
        ("first", "m2"),
        ("second", "m2"),
    ] {
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(got, (expected.0, expected.1.to_string()));
    }
    broker.join().unwrap();
}

#[tokio::test]
async fn removed_callback_no_longer_fires() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"CONNECTED\nversion:1.2\n\n\0").unwrap();
        let _subscribe = read_frame(&mut stream);
        stream
            .write_all(b"MESSAGE\ndestination:/queue/cb\nmessage-id:m1\n\none\0")
            .unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let tx1 = tx.clone();
    let first = conn
        .register_callback("/queue/cb", move |_frame: &Frame| {
            let _ = tx1.send("first");
        })
        .await
        .unwrap();
    let tx2 = tx.clone();
    conn.register_callback("/queue/cb", move |_frame: &Frame| {
        let _ = tx2.send("second");
    })
    .await
    .unwrap();

    assert!(conn.remove_callback("/queue/cb", first).await.unwrap());
    assert!(!conn.remove_callback("/queue/cb", first).await.unwrap());

    conn.subscribe("/queue/cb", Vec::new(), SubscribeOptions::default())
        .await
        .unwrap();

    // dispatch is ordered, so if "first" had fired it would arrive first
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(got, "second");
    broker.join().unwrap();
}

#[tokio::test]
async fn heartbeats_are_discarded_and_pulling_continues() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"CONNECTED\nversion:1.2\n\n\0").unwrap();
        let _subscribe = read_frame(&mut stream);
        // two heartbeats, then a real message
        stream.write_all(b"\n\n").unwrap();
        stream
            .write_all(b"MESSAGE\ndestination:/queue/hb\nmessage-id:m1\n\nstill here\0")
            .unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");
    conn.set_send_to_caller(true).await.unwrap();
    conn.subscribe("/queue/hb", Vec::new(), SubscribeOptions::default())
        .await
        .unwrap();

    let message = next_message_within(&conn, 5).await;
    assert_eq!(message.frame.body, b"still here");
    broker.join().unwrap();
}

// =============================================================================
// Compressed Subscriptions
// =============================================================================

fn gzip(payload: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn compressed_subscription_gunzips_bodies() {
    let compressed = gzip(b"compressed payload");
    let mut frame_bytes = format!(
        "MESSAGE\ndestination:/queue/z\nmessage-id:m1\ncontent-length:{}\n\n",
        compressed.len()
    )
    .into_bytes();
    frame_bytes.extend_from_slice(&compressed);
    frame_bytes.push(0);

    let (port, broker) = spawn_broker(move |mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"CONNECTED\nversion:1.2\n\n\0").unwrap();
        let _subscribe = read_frame(&mut stream);
        stream.write_all(&frame_bytes).unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");
    conn.set_send_to_caller(true).await.unwrap();
    conn.subscribe(
        "/queue/z",
        Vec::new(),
        SubscribeOptions { compressed: true },
    )
    .await
    .unwrap();

    let message = next_message_within(&conn, 5).await;
    assert_eq!(message.frame.body, b"compressed payload");
    broker.join().unwrap();
}

#[tokio::test]
async fn undecodable_body_is_dropped_and_the_connection_survives() {
    let good = gzip(b"second message");
    let mut second = format!(
        "MESSAGE\ndestination:/queue/z\nmessage-id:m2\ncontent-length:{}\n\n",
        good.len()
    )
    .into_bytes();
    second.extend_from_slice(&good);
    second.push(0);

    let (port, broker) = spawn_broker(move |mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"CONNECTED\nversion:1.2\n\n\0").unwrap();
        let _subscribe = read_frame(&mut stream);
        // not gzip at all: dropped with a logged error
        stream
            .write_all(b"MESSAGE\ndestination:/queue/z\nmessage-id:m1\n\nnot gzip\0")
            .unwrap();
        stream.write_all(&second).unwrap();
        thread::sleep(Duration::from_millis(200));
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");
    conn.set_send_to_caller(true).await.unwrap();
    conn.subscribe(
        "/queue/z",
        Vec::new(),
        SubscribeOptions { compressed: true },
    )
    .await
    .unwrap();

    let message = next_message_within(&conn, 5).await;
    assert_eq!(message.frame.get_header("message-id"), Some("m2"));
    assert_eq!(message.frame.body, b"second message");
    broker.join().unwrap();
}

// =============================================================================
// ACK / NACK
// =============================================================================

#[tokio::test]
async fn nack_under_1_0_puts_no_bytes_on_the_wire() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"CONNECTED\n\n\0").unwrap();

        // the next frame must be the SEND; a NACK would have preceded it
        let frame = read_frame(&mut stream);
        assert!(frame.starts_with("SEND\n"), "got: {}", frame);
        assert!(frame.contains("content-length:4"));
        thread::sleep(Duration::from_millis(100));
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");

    let message = Frame::new("MESSAGE")
        .header("destination", "/queue/x")
        .header("message-id", "m1");
    conn.nack(&message).await.expect("nack must be skipped quietly");
    conn.send("/queue/x", b"ping".to_vec()).await.unwrap();
    broker.join().unwrap();
}

#[tokio::test]
async fn nack_under_1_2_goes_on_the_wire() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"CONNECTED\nversion:1.2\n\n\0").unwrap();

        let nack = read_frame(&mut stream);
        assert!(nack.starts_with("NACK\n"), "got: {}", nack);
        assert!(nack.contains("id:a1"), "got: {}", nack);
        thread::sleep(Duration::from_millis(100));
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");

    let message = Frame::new("MESSAGE")
        .header("destination", "/queue/x")
        .header("ack", "a1");
    conn.nack(&message).await.unwrap();
    broker.join().unwrap();
}

// =============================================================================
// Disconnect
// =============================================================================

#[tokio::test]
async fn disconnect_sends_frame_and_closes_cleanly() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _connect = read_frame(&mut stream);
        stream.write_all(b"CONNECTED\nversion:1.2\n\n\0").unwrap();

        let frame = read_frame(&mut stream);
        assert!(frame.starts_with("DISCONNECT\n"), "got: {}", frame);
    });

    let conn = Connection::connect(options(port)).await.expect("connect failed");
    conn.disconnect().await.unwrap();

    // the manager is gone: subsequent operations fail, messages end
    assert!(conn.send("/queue/x", b"late".to_vec()).await.is_err());
    assert!(conn.next_message().await.is_none());
    broker.join().unwrap();
}
