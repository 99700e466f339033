use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use wavecast_server::{AppState, ChatConfig, ChatManager, create_router};

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Spawn a test server and return its ws:// base URL plus the manager handle.
async fn spawn_test_server(config: ChatConfig) -> (String, Arc<ChatManager>) {
    let manager = ChatManager::new(config);
    let app = create_router(AppState {
        manager: manager.clone(),
    });

    // Bind to random port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Wait a moment for server to start
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    (format!("ws://{}", addr), manager)
}

async fn connect(base_url: &str, stream_key: &str) -> (WsWrite, WsRead) {
    let (ws_stream, _) = connect_async(format!("{}/api/chat?streamKey={}", base_url, stream_key))
        .await
        .expect("Failed to connect");
    ws_stream.split()
}

async fn send_frame(write: &mut WsWrite, frame: serde_json::Value) {
    write
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn join(write: &mut WsWrite, user_id: &str, username: &str) {
    send_frame(
        write,
        json!({"type": "join", "data": {"userId": user_id, "username": username}}),
    )
    .await;
}

/// Next text frame as JSON, with a deadline so a missing frame fails loudly.
async fn next_frame(read: &mut WsRead) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(tokio::time::Duration::from_secs(2), read.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Assert no frame arrives within a short grace window.
async fn expect_silence(read: &mut WsRead) {
    let outcome =
        tokio::time::timeout(tokio::time::Duration::from_millis(300), read.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = outcome {
        panic!("expected silence, received: {}", text);
    }
}

#[tokio::test]
async fn test_join_replays_history_and_roster() {
    let (base_url, _manager) = spawn_test_server(ChatConfig::default()).await;

    let (mut write_a, mut read_a) = connect(&base_url, "s1").await;
    join(&mut write_a, "a", "Ann").await;

    let history = next_frame(&mut read_a).await;
    assert_eq!(history["type"], "history");
    assert_eq!(history["data"].as_array().unwrap().len(), 0);
    assert!(history["timestamp"].as_str().is_some());

    let users = next_frame(&mut read_a).await;
    assert_eq!(users["type"], "users");
    let roster = users["data"].as_array().unwrap();
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0]["username"], "Ann");

    // no timeout frame for a clean user and no join echo: nothing further
    // until someone else shows up
    expect_silence(&mut read_a).await;

    let (mut write_b, mut read_b) = connect(&base_url, "s1").await;
    join(&mut write_b, "b", "Bob").await;

    let joined = next_frame(&mut read_a).await;
    assert_eq!(joined["type"], "user_joined");
    assert_eq!(joined["data"]["userId"], "b");
    assert_eq!(joined["data"]["username"], "Bob");

    let history = next_frame(&mut read_b).await;
    assert_eq!(history["type"], "history");
    assert_eq!(history["data"].as_array().unwrap().len(), 0);
    let users = next_frame(&mut read_b).await;
    assert_eq!(users["data"].as_array().unwrap().len(), 2);
    // the joiner never sees its own user_joined
    expect_silence(&mut read_b).await;
}

#[tokio::test]
async fn test_message_broadcast_reaches_whole_room() {
    let (base_url, _manager) = spawn_test_server(ChatConfig::default()).await;

    let (mut write_a, mut read_a) = connect(&base_url, "s1").await;
    join(&mut write_a, "a", "Ann").await;
    let (mut write_b, mut read_b) = connect(&base_url, "s1").await;
    join(&mut write_b, "b", "Bob").await;

    // drain join-time frames: history + users each, plus Bob's arrival for Ann
    for _ in 0..3 {
        next_frame(&mut read_a).await;
    }
    for _ in 0..2 {
        next_frame(&mut read_b).await;
    }

    send_frame(&mut write_a, json!({"type": "message", "data": {"message": "hi"}})).await;

    for read in [&mut read_a, &mut read_b] {
        let frame = next_frame(read).await;
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["data"]["message"], "hi");
        assert_eq!(frame["data"]["userId"], "a");
        assert_eq!(frame["data"]["username"], "Ann");
        assert!(frame["data"]["id"].as_str().is_some());
    }
}

#[tokio::test]
async fn test_fanout_stays_inside_the_room() {
    let (base_url, _manager) = spawn_test_server(ChatConfig::default()).await;

    let (mut write_a, mut read_a) = connect(&base_url, "s1").await;
    join(&mut write_a, "a", "Ann").await;
    let (mut write_c, mut read_c) = connect(&base_url, "s2").await;
    join(&mut write_c, "c", "Cara").await;

    for _ in 0..2 {
        next_frame(&mut read_a).await;
        next_frame(&mut read_c).await;
    }

    send_frame(&mut write_a, json!({"type": "message", "data": {"message": "only s1"}})).await;

    let frame = next_frame(&mut read_a).await;
    assert_eq!(frame["data"]["message"], "only s1");
    expect_silence(&mut read_c).await;
}

#[tokio::test]
async fn test_burst_rate_limit_end_to_end() {
    let (base_url, _manager) = spawn_test_server(ChatConfig::default()).await;

    let (mut write, mut read) = connect(&base_url, "s1").await;
    join(&mut write, "u", "Uma").await;
    for _ in 0..2 {
        next_frame(&mut read).await;
    }

    for _ in 0..6 {
        send_frame(&mut write, json!({"type": "message", "data": {"message": "x"}})).await;
    }

    // first five come back as broadcasts, the sixth as a denial
    for i in 0..5 {
        let frame = next_frame(&mut read).await;
        assert_eq!(frame["type"], "message", "message {} should broadcast", i);
    }
    let denial = next_frame(&mut read).await;
    assert_eq!(denial["type"], "rate_limit");
    assert_eq!(denial["error"], "RATE_LIMIT");

    // inside the penalty window every further attempt is a hard timeout
    send_frame(&mut write, json!({"type": "message", "data": {"message": "x"}})).await;
    let denial = next_frame(&mut read).await;
    assert_eq!(denial["type"], "error");
    assert_eq!(denial["error"], "TIMEOUT");
}

#[tokio::test]
async fn test_join_replays_only_buffer_tail() {
    let mut config = ChatConfig::default();
    config.max_messages_per_stream = 3;
    let (base_url, manager) = spawn_test_server(config).await;

    for i in 1..=5 {
        manager.add_message("s1", "seed", "Seeder", &format!("m{}", i));
    }

    let (mut write, mut read) = connect(&base_url, "s1").await;
    join(&mut write, "c", "Cara").await;

    let history = next_frame(&mut read).await;
    assert_eq!(history["type"], "history");
    let texts: Vec<&str> = history["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["message"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["m3", "m4", "m5"]);
}

#[tokio::test]
async fn test_typing_broadcast_excludes_sender() {
    let mut config = ChatConfig::default();
    config.enable_typing_status = true;
    let (base_url, _manager) = spawn_test_server(config).await;

    let (mut write_a, mut read_a) = connect(&base_url, "s1").await;
    join(&mut write_a, "a", "Ann").await;
    let (mut write_b, mut read_b) = connect(&base_url, "s1").await;
    join(&mut write_b, "b", "Bob").await;

    for _ in 0..3 {
        next_frame(&mut read_a).await;
    }
    for _ in 0..2 {
        next_frame(&mut read_b).await;
    }

    send_frame(&mut write_a, json!({"type": "typing", "data": {"isTyping": true}})).await;

    let frame = next_frame(&mut read_b).await;
    assert_eq!(frame["type"], "typing");
    assert_eq!(frame["data"]["userId"], "a");
    assert_eq!(frame["data"]["isTyping"], true);
    expect_silence(&mut read_a).await;
}

#[tokio::test]
async fn test_typing_ignored_when_feature_disabled() {
    let (base_url, _manager) = spawn_test_server(ChatConfig::default()).await;

    let (mut write_a, mut read_a) = connect(&base_url, "s1").await;
    join(&mut write_a, "a", "Ann").await;
    let (mut write_b, mut read_b) = connect(&base_url, "s1").await;
    join(&mut write_b, "b", "Bob").await;

    for _ in 0..3 {
        next_frame(&mut read_a).await;
    }
    for _ in 0..2 {
        next_frame(&mut read_b).await;
    }

    send_frame(&mut write_a, json!({"type": "typing", "data": {"isTyping": true}})).await;
    expect_silence(&mut read_b).await;
}

#[tokio::test]
async fn test_disconnect_broadcasts_user_left() {
    let (base_url, manager) = spawn_test_server(ChatConfig::default()).await;

    let (mut write_a, mut read_a) = connect(&base_url, "s1").await;
    join(&mut write_a, "a", "Ann").await;
    let (mut write_b, _read_b) = connect(&base_url, "s1").await;
    join(&mut write_b, "b", "Bob").await;

    for _ in 0..3 {
        next_frame(&mut read_a).await;
    }

    write_b.close().await.unwrap();

    let frame = next_frame(&mut read_a).await;
    assert_eq!(frame["type"], "user_left");
    assert_eq!(frame["data"]["userId"], "b");

    // roster and registry both forget the departed user
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    assert_eq!(manager.get_user_count("s1"), 1);
    assert_eq!(manager.session_count(), 1);
}

#[tokio::test]
async fn test_room_full_rejects_join() {
    let mut config = ChatConfig::default();
    config.max_users_per_stream = 1;
    let (base_url, _manager) = spawn_test_server(config).await;

    let (mut write_a, mut read_a) = connect(&base_url, "s1").await;
    join(&mut write_a, "a", "Ann").await;
    next_frame(&mut read_a).await;

    let (mut write_b, mut read_b) = connect(&base_url, "s1").await;
    join(&mut write_b, "b", "Bob").await;

    let frame = next_frame(&mut read_b).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["error"], "ROOM_FULL");
}

#[tokio::test]
async fn test_protocol_errors_reported_to_sender() {
    let (base_url, _manager) = spawn_test_server(ChatConfig::default()).await;
    let (mut write, mut read) = connect(&base_url, "s1").await;

    // messages before join are rejected
    send_frame(&mut write, json!({"type": "message", "data": {"message": "hi"}})).await;
    let frame = next_frame(&mut read).await;
    assert_eq!(frame["error"], "Not joined to chat");

    // unknown discriminator
    send_frame(&mut write, json!({"type": "dance"})).await;
    let frame = next_frame(&mut read).await;
    assert_eq!(frame["error"], "Unknown message type");

    // join without identity
    send_frame(&mut write, json!({"type": "join", "data": {"userId": "", "username": ""}})).await;
    let frame = next_frame(&mut read).await;
    assert_eq!(frame["error"], "Missing userId or username");

    // unparsable frame
    write
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    let frame = next_frame(&mut read).await;
    assert_eq!(frame["error"], "Invalid message type");

    // empty message body after a valid join
    join(&mut write, "a", "Ann").await;
    next_frame(&mut read).await; // history
    next_frame(&mut read).await; // users
    send_frame(&mut write, json!({"type": "message", "data": {"message": ""}})).await;
    let frame = next_frame(&mut read).await;
    assert_eq!(frame["error"], "Invalid message content");
}

#[tokio::test]
async fn test_upgrade_requires_stream_key() {
    let (base_url, _manager) = spawn_test_server(ChatConfig::default()).await;

    let result = connect_async(format!("{}/api/chat", base_url)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("expected HTTP 400 rejection, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_rejoin_with_same_user_id_replaces_session() {
    let (base_url, manager) = spawn_test_server(ChatConfig::default()).await;

    let (mut write_old, mut read_old) = connect(&base_url, "s1").await;
    join(&mut write_old, "a", "Ann").await;
    for _ in 0..2 {
        next_frame(&mut read_old).await;
    }

    let (mut write_new, mut read_new) = connect(&base_url, "s1").await;
    join(&mut write_new, "a", "Ann").await;
    for _ in 0..2 {
        next_frame(&mut read_new).await;
    }
    assert_eq!(manager.session_count(), 1);

    // fan-out now reaches only the new session
    send_frame(&mut write_new, json!({"type": "message", "data": {"message": "back"}})).await;
    let frame = next_frame(&mut read_new).await;
    assert_eq!(frame["data"]["message"], "back");
    expect_silence(&mut read_old).await;

    // the old socket closing must not tear down the live registration
    write_old.close().await.unwrap();
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    assert_eq!(manager.session_count(), 1);
    assert_eq!(manager.get_user_count("s1"), 1);
}
