//! Integration tests for the Atelier feed server
//!
//! These tests spin up a real server and connect clients to verify
//! authentication, snapshot delivery and live unread updates end to end.

use std::sync::Arc;
use std::time::Duration;

use atelier::feed::{ChatFeed, FeedSnapshot, ThreadSource};
use atelier::models::input::SendMessageInput;
use atelier::models::{SenderRole, UserKey};
use atelier::navigation::NavigationController;
use atelier::{ClientConfig, Database, FeedError, RemoteThreadSource};
use atelier_server::{serve, ServerState};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Start a test server on a random available port
async fn start_test_server(token: Option<&str>) -> (u16, tokio::task::JoinHandle<()>) {
    let (port, handle, _state) = start_test_server_with_state(token).await;
    (port, handle)
}

async fn start_test_server_with_state(
    token: Option<&str>,
) -> (u16, tokio::task::JoinHandle<()>, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let db = Arc::new(Database::open_in_memory().unwrap());
    let state = Arc::new(ServerState::new(db).with_access_token(token.map(String::from)));
    state.spawn_change_relay();

    let handle = tokio::spawn(serve(listener, state.clone()));

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, handle, state)
}

fn config(port: u16) -> ClientConfig {
    ClientConfig::default().with_server_url(format!("ws://127.0.0.1:{}", port))
}

async fn wait_for(
    rx: &mut watch::Receiver<FeedSnapshot>,
    pred: impl Fn(&FeedSnapshot) -> bool,
) -> FeedSnapshot {
    timeout(Duration::from_secs(5), async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if pred(&snapshot) {
                    return snapshot.clone();
                }
            }
            rx.changed().await.expect("feed dropped");
        }
    })
    .await
    .expect("timed out waiting for feed snapshot")
}

#[tokio::test]
async fn test_raw_client_gets_auth_and_snapshots() {
    let (port, server_handle) = start_test_server(None).await;

    let url = format!("ws://127.0.0.1:{}", port);
    let (ws_stream, _) = connect_async(&url).await.expect("Failed to connect");
    let (mut write, mut read) = ws_stream.split();

    let connect_msg = json!({ "type": "connect", "user_key": 42 });
    write
        .send(Message::Text(connect_msg.to_string().into()))
        .await
        .unwrap();

    let mut types = Vec::new();
    for _ in 0..3 {
        let frame = timeout(Duration::from_secs(5), read.next())
            .await
            .expect("Timeout waiting for frame")
            .expect("Stream closed")
            .expect("Read error");
        if let Message::Text(text) = frame {
            let msg: serde_json::Value = serde_json::from_str(&text).unwrap();
            types.push((msg["type"].as_str().unwrap().to_string(), msg["partition"].clone()));
        } else {
            panic!("Expected text message");
        }
    }

    assert_eq!(types[0].0, "auth_response");
    assert_eq!(types[1], ("snapshot".to_string(), json!("client")));
    assert_eq!(types[2], ("snapshot".to_string(), json!("artist")));

    server_handle.abort();
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let (port, server_handle) = start_test_server(Some("letmein")).await;

    let result = RemoteThreadSource::connect(&config(port).with_access_token("nope"), 1).await;
    assert!(matches!(result, Err(FeedError::Rejected(_))));

    let ok = RemoteThreadSource::connect(&config(port).with_access_token("letmein"), 1).await;
    assert!(ok.is_ok());

    server_handle.abort();
}

#[tokio::test]
async fn test_unread_badge_follows_remote_conversation() {
    let (port, server_handle) = start_test_server(None).await;

    let client = Arc::new(RemoteThreadSource::connect(&config(port), 20).await.unwrap());
    let artist = RemoteThreadSource::connect(&config(port), 10).await.unwrap();

    let mut nav = NavigationController::new();
    let mut feed = ChatFeed::new(client.clone(), nav.open_thread());
    let mut rx = feed.subscribe();
    feed.set_viewer(Some(20));

    let mut first = SendMessageInput::text("10__20", "artist-10", 20, "20", SenderRole::Client, "Hi!");
    first.artist_user_key = Some(10);
    let chat_id = client.send_message(first).await.unwrap();
    assert_eq!(chat_id, "10__20");
    wait_for(&mut rx, |s| s.threads.len() == 1 && s.signal.count == 0).await;

    artist
        .send_message(SendMessageInput::text(
            "10__20",
            "artist-10",
            20,
            "10",
            SenderRole::Artist,
            "Sketch attached",
        ))
        .await
        .unwrap();
    wait_for(&mut rx, |s| s.signal.count == 1).await;

    // Viewing the thread hides it before the read marker lands
    nav.start_chat("10__20");
    nav.set_viewed_thread(Some("10__20".to_string()));
    wait_for(&mut rx, |s| s.signal.count == 0).await;

    client.mark_read("10__20").await.unwrap();
    nav.set_viewed_thread(None);
    let snapshot = wait_for(&mut rx, |s| {
        s.threads
            .first()
            .is_some_and(|t| t.client_last_read_at >= t.last_message_at)
    })
    .await;
    assert_eq!(snapshot.signal.count, 0);

    server_handle.abort();
}

#[tokio::test]
async fn test_support_chat_is_visible_but_not_unread() {
    let (port, server_handle) = start_test_server(None).await;

    let client = Arc::new(RemoteThreadSource::connect(&config(port), 33).await.unwrap());
    let chat_id = client.support_chat().await.unwrap();
    assert_eq!(chat_id, "dev__33");

    let fetched = client.fetch_thread("dev__33").await.unwrap().unwrap();
    assert_eq!(fetched.last_message_sender_role, Some(SenderRole::System));

    let nav = NavigationController::new();
    let mut feed = ChatFeed::new(client.clone(), nav.open_thread());
    let mut rx = feed.subscribe();
    feed.set_viewer(Some(33));

    let snapshot = wait_for(&mut rx, |s| !s.threads.is_empty()).await;
    assert_eq!(snapshot.threads[0].id, "dev__33");
    assert_eq!(snapshot.signal.count, 0);

    server_handle.abort();
}

#[tokio::test]
async fn test_accept_flow_over_the_wire() {
    let (port, server_handle) = start_test_server(None).await;

    let artist = RemoteThreadSource::connect(&config(port), 10).await.unwrap();
    assert!(artist.accept_chat("10__20", "artist-10", 20).await.unwrap());
    assert!(!artist.accept_chat("10__20", "artist-10", 20).await.unwrap());

    let forged = artist.accept_chat("11__20", "artist-11", 20).await;
    assert!(matches!(forged, Err(FeedError::Rejected(_))));

    server_handle.abort();
}

#[tokio::test]
async fn test_subscription_for_other_user_is_refused() {
    let (port, server_handle) = start_test_server(None).await;

    let source = RemoteThreadSource::connect(&config(port), 5).await.unwrap();
    let mut stream = source.subscribe_client(6);
    let first = timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, Err(FeedError::Rejected(_))));

    server_handle.abort();
}

#[tokio::test]
async fn test_disconnect_clears_feed() {
    let (port, server_handle) = start_test_server(None).await;

    let client = Arc::new(RemoteThreadSource::connect(&config(port), 8).await.unwrap());
    client.support_chat().await.unwrap();

    let nav = NavigationController::new();
    let mut feed = ChatFeed::new(client.clone(), nav.open_thread());
    let mut rx = feed.subscribe();
    feed.set_viewer(Some(8));
    wait_for(&mut rx, |s| !s.threads.is_empty()).await;

    client.disconnect();
    wait_for(&mut rx, |s| s.threads.is_empty()).await;
    assert_eq!(feed.signal().count, 0);

    server_handle.abort();
}

async fn wait_online(state: &ServerState, user_key: UserKey, online: bool) {
    timeout(Duration::from_secs(2), async {
        while state.is_online(user_key) != online {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("presence did not settle");
}

#[tokio::test]
async fn test_user_goes_offline_after_last_disconnect() {
    let (port, server_handle, state) = start_test_server_with_state(None).await;

    for _ in 0..5 {
        let source = RemoteThreadSource::connect(&config(port), 77).await.unwrap();
        wait_online(&state, 77, true).await;
        source.disconnect();
        drop(source);
        wait_online(&state, 77, false).await;
    }

    assert!(state.clients.get(&77).is_none());
    assert!(state.online_users().is_empty());

    server_handle.abort();
}
