//! Integration tests for the relay over real WebSocket connections.
//!
//! These tests start a real server on an ephemeral port and connect real
//! clients, verifying broadcast, backlog replay and reconnect end to end.

use chat_relay::{
    MemoryMessageLog, Message, MessageLog, RelayClient, RelayServer, ServerConfig, ANONYMOUS,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};

/// Start a server over `log` on a free port, return it and its url.
async fn start_test_server(log: Arc<dyn MessageLog>) -> (Arc<RelayServer>, String) {
    start_test_server_with(ServerConfig::default(), log).await
}

async fn start_test_server_with(
    config: ServerConfig,
    log: Arc<dyn MessageLog>,
) -> (Arc<RelayServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(RelayServer::with_log(config, log).unwrap());

    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    (server, format!("ws://127.0.0.1:{port}"))
}

async fn connect(url: &str, name: &str) -> RelayClient {
    let mut client = RelayClient::new(url, name);
    client.connect().await.unwrap();
    client
}

/// Next message, failing the test after two seconds.
async fn recv(client: &mut RelayClient) -> Message {
    timeout(Duration::from_secs(2), client.next_message())
        .await
        .expect("timed out waiting for a message")
        .unwrap()
}

/// Assert nothing else arrives for a short while.
async fn assert_quiet(client: &mut RelayClient) {
    let extra = timeout(Duration::from_millis(200), client.next_message()).await;
    assert!(extra.is_err(), "unexpected extra message: {extra:?}");
}

/// Poll until `check` passes or a second elapses.
async fn wait_for(check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (server, url) = start_test_server(Arc::new(MemoryMessageLog::new())).await;
    let mut client = connect(&url, "alice").await;

    // Registration follows the upgrade; wait for it
    let registry = server.registry().clone();
    for _ in 0..100 {
        if registry.len().await == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.len().await, 1);

    client.disconnect().await.unwrap();
    for _ in 0..100 {
        if registry.is_empty().await {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(registry.is_empty().await, "session should be unregistered on close");
}

#[tokio::test]
async fn test_sender_sees_own_message_via_broadcast() {
    let (_server, url) = start_test_server(Arc::new(MemoryMessageLog::new())).await;
    let mut alice = connect(&url, "alice").await;

    alice.send("hello").await.unwrap();
    let msg = recv(&mut alice).await;
    assert_eq!(msg.id, 1);
    assert_eq!(msg.content, "hello");
    assert_eq!(msg.author, "alice");
    assert_eq!(alice.offset(), 1);
}

#[tokio::test]
async fn test_late_joiner_gets_backlog_then_live() {
    let (_server, url) = start_test_server(Arc::new(MemoryMessageLog::new())).await;

    let mut alice = connect(&url, "alice").await;
    alice.send("hello").await.unwrap();
    assert_eq!(recv(&mut alice).await.content, "hello");

    let mut bob = connect(&url, "bob").await;
    alice.send("world").await.unwrap();
    assert_eq!(recv(&mut alice).await.content, "world");

    // Whether "world" reaches bob live or in his backlog, he sees each once, in order
    let first = recv(&mut bob).await;
    assert_eq!((first.id, first.content.as_str(), first.author.as_str()), (1, "hello", "alice"));
    let second = recv(&mut bob).await;
    assert_eq!((second.id, second.content.as_str()), (2, "world"));
    assert_quiet(&mut bob).await;
}

#[tokio::test]
async fn test_resume_from_offset_replays_only_newer() {
    let log = Arc::new(MemoryMessageLog::new());
    for i in 1..=10 {
        log.append(&format!("m{i}"), "alice").unwrap();
    }
    let (_server, url) = start_test_server(log).await;

    let mut carol = RelayClient::new(&url, "carol").with_offset(5);
    carol.connect().await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(recv(&mut carol).await.id);
    }
    assert_eq!(ids, vec![6, 7, 8, 9, 10]);
    assert_quiet(&mut carol).await;
    assert_eq!(carol.offset(), 10);
}

#[tokio::test]
async fn test_concurrent_posts_observed_in_id_order() {
    let (_server, url) = start_test_server(Arc::new(MemoryMessageLog::new())).await;
    let mut alice = connect(&url, "alice").await;
    let mut bob = connect(&url, "bob").await;

    // Make sure both are admitted before posting
    alice.send("ready-a").await.unwrap();
    recv(&mut alice).await;
    recv(&mut bob).await;
    bob.send("ready-b").await.unwrap();
    recv(&mut alice).await;
    recv(&mut bob).await;

    let (ra, rb) = tokio::join!(alice.send("x"), bob.send("y"));
    ra.unwrap();
    rb.unwrap();

    let seen_by_alice = [recv(&mut alice).await, recv(&mut alice).await];
    let seen_by_bob = [recv(&mut bob).await, recv(&mut bob).await];

    assert_eq!(seen_by_alice, seen_by_bob);
    assert!(seen_by_alice[0].id < seen_by_alice[1].id);
    let mut contents: Vec<&str> = seen_by_alice.iter().map(|m| m.content.as_str()).collect();
    contents.sort_unstable();
    assert_eq!(contents, vec!["x", "y"]);

    assert_quiet(&mut alice).await;
    assert_quiet(&mut bob).await;
}

#[tokio::test]
async fn test_reconnect_recovers_missed_messages() {
    let (_server, url) = start_test_server(Arc::new(MemoryMessageLog::new())).await;

    let mut alice = connect(&url, "alice").await;
    for text in ["one", "two", "three"] {
        alice.send(text).await.unwrap();
        recv(&mut alice).await;
    }
    assert_eq!(alice.offset(), 3);
    alice.disconnect().await.unwrap();

    let mut bob = connect(&url, "bob").await;
    for _ in 0..3 {
        recv(&mut bob).await;
    }
    bob.send("four").await.unwrap();
    bob.send("five").await.unwrap();
    recv(&mut bob).await;
    recv(&mut bob).await;

    alice.reconnect().await.unwrap();
    let missed = [recv(&mut alice).await, recv(&mut alice).await];
    assert_eq!(missed[0].content, "four");
    assert_eq!(missed[1].content, "five");
    assert_eq!(missed[1].author, "bob");
    assert_quiet(&mut alice).await;
    assert_eq!(alice.offset(), 5);
}

#[tokio::test]
async fn test_missing_username_is_anonymous() {
    let (_server, url) = start_test_server(Arc::new(MemoryMessageLog::new())).await;

    let mut ghost = connect(&url, "").await;
    ghost.send("boo").await.unwrap();
    assert_eq!(recv(&mut ghost).await.author, ANONYMOUS);
}

#[tokio::test]
async fn test_failed_append_is_silent_and_not_broadcast() {
    let log = Arc::new(MemoryMessageLog::new());
    let (server, url) = start_test_server(log.clone()).await;
    let mut alice = connect(&url, "alice").await;
    let mut bob = connect(&url, "bob").await;

    log.set_available(false);
    alice.send("lost").await.unwrap();
    let stats_server = server.clone();
    wait_for(move || stats_server.stats().publish_failures == 1).await;

    log.set_available(true);
    alice.send("kept").await.unwrap();

    // The connection survived and the dropped message never shows up
    let a = recv(&mut alice).await;
    let b = recv(&mut bob).await;
    assert_eq!((a.id, a.content.as_str()), (1, "kept"));
    assert_eq!(b, a);
    assert_quiet(&mut bob).await;
}

#[tokio::test]
async fn test_malformed_frames_do_not_close_connection() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (_server, url) = start_test_server(Arc::new(MemoryMessageLog::new())).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/?username=raw"))
        .await
        .unwrap();

    ws.send(WsMessage::Text("not json".into())).await.unwrap();
    ws.send(WsMessage::Text(r#"{"event":"typing","data":true}"#.into())).await.unwrap();
    ws.send(WsMessage::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    ws.send(WsMessage::Text(r#"{"event":"chat message","data":"still alive"}"#.into()))
        .await
        .unwrap();

    let frame = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(
        frame.into_text().unwrap().as_str(),
        r#"{"event":"chat message","data":["still alive","1","raw"]}"#
    );
}

#[tokio::test]
async fn test_recovery_is_retried_after_store_outage() {
    let log = Arc::new(MemoryMessageLog::new());
    log.append("old news", "alice").unwrap();
    let config = ServerConfig {
        recovery_retry: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let (server, url) = start_test_server_with(config, log.clone()).await;

    log.set_available(false);
    let mut bob = connect(&url, "bob").await;
    let stats_server = server.clone();
    wait_for(move || stats_server.stats().recovery_failures >= 1).await;

    log.set_available(true);
    let backlog = recv(&mut bob).await;
    assert_eq!((backlog.id, backlog.content.as_str()), (1, "old news"));

    let mut alice = connect(&url, "alice").await;
    recv(&mut alice).await;
    alice.send("fresh").await.unwrap();
    assert_eq!(recv(&mut bob).await.content, "fresh");
    assert_quiet(&mut bob).await;
}

#[tokio::test]
async fn test_plain_http_gets_client_page() {
    let (_server, url) = start_test_server(Arc::new(MemoryMessageLog::new())).await;
    let addr = url.trim_start_matches("ws://");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET / HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.contains("text/html"));
    assert!(response.contains("serverOffset"));
}
