//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a viewer server backed by an in-memory log and talks
//! to it the way a browser client would.

use futures_util::{SinkExt, StreamExt};
use place_collab::protocol::{BroadcastEvent, ClientRequest, PlacePayload};
use place_collab::server::{ServerConfig, ViewerServer, ACTOR_CREATED_HEADER, ACTOR_HEADER, PRIVILEGED_HEADER};
use place_collab::{BroadcastBus, MemoryLog, PlacementService, SnapshotCache};
use place_core::{decode, PlaceConfig, TIMESTAMP_LEN};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let place = PlaceConfig::for_testing();
    let service = Arc::new(PlacementService::new(
        place.clone(),
        Arc::new(MemoryLog::new()),
        Arc::new(SnapshotCache::new(place.dims(), place.snapshot_max_age)),
        Arc::new(BroadcastBus::new(64)),
    ));
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        activity_interval_secs: 0,
    };
    let server = ViewerServer::new(config, service);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn connect(port: u16, actor: Option<(&'static str, bool)>) -> Ws {
    let mut request = format!("ws://127.0.0.1:{port}/").into_client_request().unwrap();
    if let Some((id, privileged)) = actor {
        let headers = request.headers_mut();
        headers.insert(ACTOR_HEADER, HeaderValue::from_static(id));
        headers.insert(
            ACTOR_CREATED_HEADER,
            HeaderValue::from_static("2015-06-01T00:00:00Z"),
        );
        if privileged {
            headers.insert(PRIVILEGED_HEADER, HeaderValue::from_static("true"));
        }
    }
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    // A reply proves the server has subscribed this connection.
    send(&mut ws, &ClientRequest::Pixel { x: 0, y: 0 }).await;
    next_event(&mut ws, "reply").await;
    ws
}

async fn send(ws: &mut Ws, request: &ClientRequest) {
    let text = serde_json::to_string(request).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Next text event of `event_type`, skipping anything else.
async fn next_event(ws: &mut Ws, event_type: &str) -> BroadcastEvent {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            let event = BroadcastEvent::decode(text.as_str()).unwrap();
            if event.event_type() == event_type {
                return event;
            }
        }
    }
}

async fn next_binary(ws: &mut Ws) -> Vec<u8> {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for board")
            .expect("stream ended")
            .unwrap();
        if let Message::Binary(bytes) = msg {
            return bytes.to_vec();
        }
    }
}

fn reply_of(event: BroadcastEvent) -> (String, u16, serde_json::Value) {
    match event {
        BroadcastEvent::Reply(reply) => (reply.action, reply.status, reply.body),
        other => panic!("expected reply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_draw_is_acknowledged_and_broadcast() {
    let port = start_test_server().await;
    let mut watcher = connect(port, None).await;
    let mut artist = connect(port, Some(("t2_alice", false))).await;

    send(&mut artist, &ClientRequest::Draw { x: 3, y: 4, color: 5 }).await;
    let (action, status, body) = reply_of(next_event(&mut artist, "reply").await);
    assert_eq!(action, "draw");
    assert_eq!(status, 200);
    assert_eq!(body["wait_seconds"], 10.0);

    let event = next_event(&mut watcher, "place").await;
    assert_eq!(
        event,
        BroadcastEvent::Place(PlacePayload {
            author: Some("t2_alice".to_string()),
            x: 3,
            y: 4,
            color: 5,
        })
    );
}

#[tokio::test]
async fn test_second_draw_is_rate_limited() {
    let port = start_test_server().await;
    let mut artist = connect(port, Some(("t2_bob", false))).await;

    send(&mut artist, &ClientRequest::Draw { x: 1, y: 1, color: 1 }).await;
    let (_, status, _) = reply_of(next_event(&mut artist, "reply").await);
    assert_eq!(status, 200);

    send(&mut artist, &ClientRequest::Draw { x: 2, y: 2, color: 2 }).await;
    let (_, status, body) = reply_of(next_event(&mut artist, "reply").await);
    assert_eq!(status, 429);
    let wait = body["wait_seconds"].as_f64().unwrap();
    assert!(wait > 2.0 && wait <= 10.0, "unexpected wait {wait}");
}

#[tokio::test]
async fn test_anonymous_viewer_cannot_draw() {
    let port = start_test_server().await;
    let mut viewer = connect(port, None).await;

    send(&mut viewer, &ClientRequest::Draw { x: 1, y: 1, color: 1 }).await;
    let (action, status, _) = reply_of(next_event(&mut viewer, "reply").await);
    assert_eq!(action, "draw");
    assert_eq!(status, 401);
}

#[tokio::test]
async fn test_invalid_fields_are_reported() {
    let port = start_test_server().await;
    let mut artist = connect(port, Some(("t2_carol", false))).await;

    send(&mut artist, &ClientRequest::Draw { x: 99, y: 1, color: 16 }).await;
    let (_, status, body) = reply_of(next_event(&mut artist, "reply").await);
    assert_eq!(status, 400);
    assert_eq!(
        body,
        serde_json::json!({"fields": [
            {"field": "x", "error": "BAD_NUMBER"},
            {"field": "color", "error": "BAD_COLOR"},
        ]})
    );
}

#[tokio::test]
async fn test_board_request_returns_binary_snapshot() {
    let port = start_test_server().await;
    let mut artist = connect(port, Some(("t2_dave", false))).await;

    send(&mut artist, &ClientRequest::Draw { x: 0, y: 0, color: 7 }).await;
    next_event(&mut artist, "reply").await;

    send(&mut artist, &ClientRequest::Board).await;
    let bytes = next_binary(&mut artist).await;
    let config = PlaceConfig::for_testing();
    assert_eq!(bytes.len(), TIMESTAMP_LEN + config.dims().packed_len());

    let (_, grid) = decode(config.dims(), &bytes).unwrap();
    assert_eq!(grid.get(0, 0), Some(7));
    assert_eq!(grid.get(1, 0), Some(0));
}

#[tokio::test]
async fn test_admin_rectangle_broadcasts_one_batch() {
    let port = start_test_server().await;
    let mut watcher = connect(port, None).await;
    let mut admin = connect(port, Some(("t2_admin", true))).await;

    send(
        &mut admin,
        &ClientRequest::DrawRect { x: 14, y: 14, width: 4, height: 4, color: 0 },
    )
    .await;
    let (_, status, body) = reply_of(next_event(&mut admin, "reply").await);
    assert_eq!(status, 200);
    assert_eq!(body["cells"], 4);

    match next_event(&mut watcher, "batch-place").await {
        BroadcastEvent::BatchPlace(batch) => assert_eq!(batch.cells.len(), 4),
        other => panic!("expected batch-place, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pixel_lookup_over_socket() {
    let port = start_test_server().await;
    let mut artist = connect(port, Some(("t2_erin", false))).await;

    send(&mut artist, &ClientRequest::Draw { x: 5, y: 6, color: 3 }).await;
    next_event(&mut artist, "reply").await;

    send(&mut artist, &ClientRequest::Pixel { x: 5, y: 6 }).await;
    let (action, status, body) = reply_of(next_event(&mut artist, "reply").await);
    assert_eq!(action, "pixel");
    assert_eq!(status, 200);
    assert_eq!(body["user"], "t2_erin");
    assert_eq!(body["color"], 3);
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let port = start_test_server().await;
    let mut viewer = connect(port, None).await;

    viewer
        .send(Message::Text("{\"action\":\"explode\"}".into()))
        .await
        .unwrap();
    let (_, status, _) = reply_of(next_event(&mut viewer, "reply").await);
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_canvas_namespace_path_is_served() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}/place");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    send(&mut ws, &ClientRequest::Pixel { x: 0, y: 0 }).await;
    let (action, _, _) = reply_of(next_event(&mut ws, "reply").await);
    assert_eq!(action, "pixel");
}

#[tokio::test]
async fn test_unknown_path_is_refused() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}/typo");

    match tokio_tungstenite::connect_async(&url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 404);
        }
        Err(other) => panic!("expected 404, got {other:?}"),
        Ok(_) => panic!("unknown path should be refused"),
    }
}
