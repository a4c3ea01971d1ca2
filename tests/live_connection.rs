//! Connection task against a local websocket server.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use sessync::config::ConnectionConfig;
use sessync::connection::ConnectionManager;
use sessync::protocol::{InboundMessage, OutboundMessage};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

async fn listen() -> (TcpListener, ConnectionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ConnectionConfig {
        url: format!("ws://{addr}"),
        api_key: Some("secret".to_string()),
        ..ConnectionConfig::default()
    };
    (listener, config)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    accept_async(stream).await.unwrap()
}

async fn read_json(server: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let frame = tokio::time::timeout(WAIT, server.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn handshake_flushes_buffered_frames_and_forwards_history() {
    let (listener, config) = listen().await;
    let (handle, mut inbound, task) = ConnectionManager::spawn(&config).unwrap();
    let session_id = Uuid::new_v4();

    handle.connect(Some(session_id)).unwrap();
    handle
        .send(OutboundMessage::Subscribe {
            session_id,
            last_message_id: None,
        })
        .unwrap();

    let mut server = accept(&listener).await;
    let hello = read_json(&mut server).await;
    assert_eq!(hello["type"], "connect");
    assert_eq!(hello["api_key"], "secret");
    assert_eq!(hello["session_id"], session_id.to_string());

    server
        .send(Message::Text(r#"{"type":"connected"}"#.to_string()))
        .await
        .unwrap();

    let subscribe = read_json(&mut server).await;
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(subscribe["session_id"], session_id.to_string());

    let mut states = handle.watch();
    tokio::time::timeout(WAIT, states.wait_for(sessync::connection::ConnectionSnapshot::is_ready))
        .await
        .unwrap()
        .unwrap();

    let history = format!(
        r#"{{"type":"session_history","session_id":"{session_id}","messages":[]}}"#
    );
    server.send(Message::Text(history)).await.unwrap();

    // The handshake itself is forwarded first
    let first = tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
    assert!(matches!(first, InboundMessage::Connected { .. }));
    let second = tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
    assert!(matches!(
        second,
        InboundMessage::SessionHistory { session_id: ref id, .. } if *id == session_id.to_string()
    ));

    handle.shutdown().unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn auth_error_stops_reconnecting() {
    let (listener, config) = listen().await;
    let (handle, _inbound, task) = ConnectionManager::spawn(&config).unwrap();

    handle.connect(None).unwrap();
    let mut server = accept(&listener).await;
    read_json(&mut server).await;
    server
        .send(Message::Text(
            r#"{"type":"auth_error","message":"bad key"}"#.to_string(),
        ))
        .await
        .unwrap();

    let mut states = handle.watch();
    let state = tokio::time::timeout(WAIT, states.wait_for(|s| s.requires_reauthentication))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert!(!state.is_ready());
    assert_eq!(state.current_error.as_deref(), Some("bad key"));

    // No second connection attempt is made
    assert!(
        tokio::time::timeout(Duration::from_millis(300), listener.accept())
            .await
            .is_err()
    );

    handle.shutdown().unwrap();
    task.await.unwrap();
}
