//! WebSocket viewer server.
//!
//! Architecture:
//! ```text
//! Viewer A ──┐   ws://host/place          ┌──────────────────┐
//!            ├── BroadcastGroup("/place") ◄── PlacementService │──► DurableLog
//! Viewer B ──┘          │                 └──────────────────┘──► SnapshotCache
//!                       ▼
//!             place / batch-place / activity frames
//! ```
//!
//! Viewers connect on `/` or on the canvas namespace path from
//! `PlaceConfig`; other paths are refused with 404. Requests sent
//! upstream are answered on the same connection; the actor is taken from
//! headers set by the authenticating proxy in front of this server. A
//! viewer that falls behind gets a `resync` event and should fetch the
//! board again.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use place_core::{Actor, ActorId};

use crate::activity;
use crate::api::{self, ApiBody, ApiResponse, BoardTier};
use crate::broadcast::Subscriber;
use crate::protocol::{BroadcastEvent, ClientRequest, ReplyPayload};
use crate::service::PlacementService;

/// Actor id, set by the auth proxy.
pub const ACTOR_HEADER: &str = "x-place-actor";
/// Account creation time, RFC 3339.
pub const ACTOR_CREATED_HEADER: &str = "x-place-actor-created";
pub const PRIVILEGED_HEADER: &str = "x-place-privileged";
pub const BANNED_HEADER: &str = "x-place-banned";
pub const SUSPENDED_HEADER: &str = "x-place-suspended";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Events a viewer may fall behind before it starts losing them
    pub broadcast_capacity: usize,
    /// Seconds between activity events (0 disables them)
    pub activity_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            activity_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub requests: u64,
    pub frames_forwarded: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    requests: AtomicU64,
    frames_forwarded: AtomicU64,
}

/// Identity captured during the WebSocket handshake.
#[derive(Debug, Clone, Default)]
struct Handshake {
    actor: Option<Actor>,
}

enum Outgoing {
    Text(String),
    Binary(Vec<u8>),
}

pub struct ViewerServer {
    config: ServerConfig,
    service: Arc<PlacementService>,
    stats: Arc<AtomicServerStats>,
}

impl ViewerServer {
    pub fn new(config: ServerConfig, service: Arc<PlacementService>) -> Self {
        Self {
            config,
            service,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind, start the activity task and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("viewer server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        let activity = (self.config.activity_interval_secs > 0).then(|| {
            activity::spawn(
                self.service.bus().clone(),
                self.service.config().namespace.clone(),
                Duration::from_secs(self.config.activity_interval_secs),
            )
        });

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("new TCP connection from {addr}");

            let service = self.service.clone();
            let stats = self.stats.clone();
            let namespace = self.service.config().namespace.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, service, stats, namespace).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        };

        if let Some(handle) = activity {
            handle.abort();
        }
        result
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<PlacementService>,
        stats: Arc<AtomicServerStats>,
        namespace: String,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut handshake = Handshake::default();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                let path = request.uri().path();
                if !serves_path(path, &namespace) {
                    log::debug!("refusing viewer {addr} on unknown path {path}");
                    return Err(not_found(path));
                }
                handshake.actor = actor_from_headers(request.headers());
                Ok(response)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let actor = handshake.actor;

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let bus = service.bus().clone();
        let subscriber = Subscriber::new(Some(addr));
        let subscriber_id = subscriber.id;
        let (group, mut broadcast_rx) = bus.subscribe(&namespace, subscriber).await;
        log::info!(
            "viewer {addr} joined {namespace} as {}",
            actor.as_ref().map_or("anonymous", |a| a.id.as_str())
        );

        let outcome: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                stats.requests.fetch_add(1, Ordering::Relaxed);
                                let outgoing = match ClientRequest::decode(text.as_str()) {
                                    Ok(request) => {
                                        handle_request(&service, actor.as_ref(), request, Utc::now()).await?
                                    }
                                    Err(e) => {
                                        log::warn!("bad request from {addr}: {e}");
                                        reply("unknown", &ApiResponse::json(
                                            400,
                                            serde_json::json!({ "error": 400, "message": e.to_string() }),
                                        ))?
                                    }
                                };
                                match outgoing {
                                    Outgoing::Text(text) => ws_sender.send(Message::Text(text.into())).await?,
                                    Outgoing::Binary(bytes) => ws_sender.send(Message::Binary(bytes.into())).await?,
                                }
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("viewer {addr} disconnected");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    frame = broadcast_rx.recv() => {
                        match frame {
                            Ok(frame) => {
                                ws_sender.send(Message::Text(frame.to_string().into())).await?;
                                stats.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(RecvError::Lagged(n)) => {
                                group.record_dropped(n);
                                log::warn!("viewer {addr} lagged by {n} events");
                                let notice = BroadcastEvent::resync(n).encode()?;
                                ws_sender.send(Message::Text(notice.into())).await?;
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        group.unsubscribe(&subscriber_id).await;
        drop(broadcast_rx);
        if bus.remove_if_empty(&namespace).await {
            log::debug!("namespace {namespace} removed (empty)");
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        outcome
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            requests: self.stats.requests.load(Ordering::Relaxed),
            frames_forwarded: self.stats.frames_forwarded.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn service(&self) -> &Arc<PlacementService> {
        &self.service
    }
}

async fn handle_request(
    service: &PlacementService,
    actor: Option<&Actor>,
    request: ClientRequest,
    now: DateTime<Utc>,
) -> Result<Outgoing, Box<dyn std::error::Error + Send + Sync>> {
    let action = request.action();
    if let ClientRequest::Board = request {
        let response = api::board_bitmap(service, BoardTier::Edge, now).await;
        return match response.body {
            ApiBody::Bytes(bytes) => Ok(Outgoing::Binary(bytes)),
            _ => reply(action, &response),
        };
    }
    if let ClientRequest::Pixel { x, y } = request {
        return reply(action, &api::pixel(service, x, y));
    }

    let Some(actor) = actor else {
        return reply(
            action,
            &ApiResponse::json(401, serde_json::json!({ "error": 401 })),
        );
    };
    let response = match request {
        ClientRequest::Draw { x, y, color } => api::draw(service, actor, x, y, color, now).await,
        ClientRequest::DrawRect {
            x,
            y,
            width,
            height,
            color,
        } => api::draw_rect(service, actor, x, y, width, height, color, now).await,
        ClientRequest::TimeToWait => api::time_to_wait(service, actor, now),
        ClientRequest::Board | ClientRequest::Pixel { .. } => ApiResponse::not_found(),
    };
    reply(action, &response)
}

fn reply(
    action: &str,
    response: &ApiResponse,
) -> Result<Outgoing, Box<dyn std::error::Error + Send + Sync>> {
    let event = BroadcastEvent::Reply(ReplyPayload {
        action: action.to_string(),
        status: response.status,
        body: response.json_body(),
    });
    Ok(Outgoing::Text(event.encode()?))
}

/// Only the canvas namespace is served; `/` is an alias for it.
fn serves_path(path: &str, namespace: &str) -> bool {
    matches!(path, "" | "/") || path == namespace
}

fn not_found(path: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("unknown namespace {path}")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Build the actor the auth proxy vouched for. Missing or malformed
/// identity headers leave the connection read-only.
fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let flag = |name: &str| header(name).is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

    let id = header(ACTOR_HEADER)?.trim();
    if id.is_empty() {
        return None;
    }
    let created_at = match header(ACTOR_CREATED_HEADER).map(DateTime::parse_from_rfc3339) {
        Some(Ok(created)) => created.with_timezone(&Utc),
        Some(Err(e)) => {
            log::warn!("ignoring actor {id} with unparseable creation time: {e}");
            return None;
        }
        None => {
            log::warn!("ignoring actor {id} without a creation time");
            return None;
        }
    };

    let mut actor = Actor::new(ActorId::new(id), created_at);
    actor.privileged = flag(PRIVILEGED_HEADER);
    actor.banned = flag(BANNED_HEADER);
    actor.suspended = flag(SUSPENDED_HEADER);
    Some(actor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.activity_interval_secs, 10);
    }

    #[test]
    fn test_only_canvas_namespace_is_served() {
        assert!(serves_path("/", "/place"));
        assert!(serves_path("", "/place"));
        assert!(serves_path("/place", "/place"));
        assert!(!serves_path("/typo", "/place"));
        assert!(!serves_path("/place/extra", "/place"));
        assert_eq!(not_found("/typo").status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_actor_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_HEADER, HeaderValue::from_static("t2_alice"));
        headers.insert(
            ACTOR_CREATED_HEADER,
            HeaderValue::from_static("2015-03-01T12:00:00Z"),
        );
        headers.insert(PRIVILEGED_HEADER, HeaderValue::from_static("true"));

        let actor = actor_from_headers(&headers).unwrap();
        assert_eq!(actor.id.as_str(), "t2_alice");
        assert!(actor.privileged);
        assert!(!actor.banned);
        assert_eq!(actor.created_at.to_rfc3339(), "2015-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_actor_headers_missing_or_malformed() {
        assert!(actor_from_headers(&HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_HEADER, HeaderValue::from_static("t2_alice"));
        assert!(actor_from_headers(&headers).is_none());

        headers.insert(ACTOR_CREATED_HEADER, HeaderValue::from_static("yesterday"));
        assert!(actor_from_headers(&headers).is_none());
    }

    #[test]
    fn test_reply_frame_shape() {
        let Outgoing::Text(text) =
            reply("draw", &ApiResponse::json(429, serde_json::json!({"error": 429}))).unwrap()
        else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "reply");
        assert_eq!(value["payload"]["action"], "draw");
        assert_eq!(value["payload"]["status"], 429);
    }
}
