// --- HTTP + WebSocket control surface ------------------------------------
//
// Routes:
//   GET /               embedded status page
//   GET /health         "OK"
//   GET /video/current  { success, data, message }
//   GET /video/list     { success, data: [paths] }
//   GET /ws             status frames + control requests
//
// Every connected client is subscribed to a shared `hub` channel. A ticker
// task pushes a status frame into it every `broadcast_interval_ms`; control
// acknowledgements (next/prev/quit) go through the hub as well. Queries are
// answered on the requester's private channel only.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Html, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::supervisor::Supervisor;

const INDEX_HTML: &str = include_str!("../static/index.html");
const NO_VIDEO: &str = "no video streaming";

#[derive(Clone)]
pub struct AppState {
    sup: Arc<Supervisor>,
    hub: broadcast::Sender<String>,
}

impl AppState {
    pub fn new(sup: Arc<Supervisor>) -> Self {
        let (hub, _) = broadcast::channel(64);
        Self { sup, hub }
    }
}

// --- Wire types ------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), message: None }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self { success: false, data: None, message: Some(message.into()) }
    }
}

/// Periodic snapshot pushed to every websocket client.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: i64,
    pub current_video_path: String,
    pub video_list: Vec<String>,
    pub output: String,
}

impl StatusFrame {
    pub fn capture(sup: &Supervisor) -> Self {
        Self {
            kind: "Status",
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            current_video_path: sup.current_video_path().unwrap_or_default(),
            video_list: sup.playlist_paths(),
            output: sup.recent_output(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum WsRequest {
    StreamNextVideo,
    StreamPrevVideo,
    GetCurrentVideoPath,
    GetVideoList,
    Quit,
}

impl WsRequest {
    fn label(self) -> &'static str {
        match self {
            WsRequest::StreamNextVideo => "StreamNextVideo",
            WsRequest::StreamPrevVideo => "StreamPrevVideo",
            WsRequest::GetCurrentVideoPath => "GetCurrentVideoPath",
            WsRequest::GetVideoList => "GetVideoList",
            WsRequest::Quit => "Quit",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WsReply {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every connected client.
    Broadcast,
    /// Only the client that asked.
    Requester,
}

/// Apply a websocket request to the supervisor and build the reply.
pub async fn handle_request(sup: &Supervisor, req: WsRequest) -> (WsReply, Delivery) {
    let mut reply = WsReply {
        kind: req.label(),
        success: true,
        message: None,
        data: None,
    };
    let delivery = match req {
        WsRequest::StreamNextVideo => {
            sup.next().await;
            Delivery::Broadcast
        }
        WsRequest::StreamPrevVideo => {
            sup.prev().await;
            Delivery::Broadcast
        }
        WsRequest::Quit => {
            info!("quit requested over websocket");
            sup.close().await;
            Delivery::Broadcast
        }
        WsRequest::GetCurrentVideoPath => {
            match sup.current_video_path() {
                Some(path) => reply.data = Some(serde_json::Value::String(path)),
                None => {
                    reply.success = false;
                    reply.message = Some(NO_VIDEO.to_string());
                }
            }
            Delivery::Requester
        }
        WsRequest::GetVideoList => {
            reply.data = Some(serde_json::json!(sup.playlist_paths()));
            Delivery::Requester
        }
    };
    (reply, delivery)
}

// --- Router ----------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(|| async { "OK" }))
        .route("/video/current", get(video_current))
        .route("/video/list", get(video_list))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until the supervisor is closed.
pub async fn serve(sup: Arc<Supervisor>, addr: SocketAddr, interval: Duration) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("control server listening on http://{}", listener.local_addr()?);
    serve_on(listener, sup, interval).await
}

pub async fn serve_on(listener: TcpListener, sup: Arc<Supervisor>, interval: Duration) -> anyhow::Result<()> {
    let state = AppState::new(sup.clone());
    tokio::spawn(status_ticker(sup.clone(), state.hub.clone(), interval));

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { sup.closed().await })
        .await?;
    debug!("control server stopped");
    Ok(())
}

async fn status_ticker(sup: Arc<Supervisor>, hub: broadcast::Sender<String>, every: Duration) {
    let mut tick = tokio::time::interval(every.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = sup.closed() => break,
        }
        // Nobody connected.
        if hub.receiver_count() == 0 {
            continue;
        }
        match serde_json::to_string(&StatusFrame::capture(&sup)) {
            Ok(frame) => {
                let _ = hub.send(frame);
            }
            Err(e) => warn!("status frame encode failed: {e}"),
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn video_current(State(state): State<AppState>) -> Json<ApiResponse<String>> {
    match state.sup.current_video_path() {
        Some(path) => Json(ApiResponse::ok(path)),
        None => Json(ApiResponse::fail(NO_VIDEO)),
    }
}

async fn video_list(State(state): State<AppState>) -> Json<ApiResponse<Vec<String>>> {
    Json(ApiResponse::ok(state.sup.playlist_paths()))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(32);
    let mut shared = state.hub.subscribe();
    debug!(%conn_id, "websocket connected");

    if let Ok(frame) = serde_json::to_string(&StatusFrame::capture(&state.sup)) {
        let _ = tx.send(frame).await;
    }

    // Outgoing: private replies and hub frames, in arrival order.
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                direct = rx.recv() => match direct {
                    Some(f) => f,
                    None => break,
                },
                hub = shared.recv() => match hub {
                    Ok(f) => f,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(%conn_id, "websocket client lagged, skipped {n} frames");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bin)) => match String::from_utf8(bin) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%conn_id, "websocket error: {e}");
                break;
            }
        };

        let req = match serde_json::from_str::<WsRequest>(&text) {
            Ok(req) => req,
            Err(e) => {
                debug!(%conn_id, "ignoring malformed request: {e}");
                let reply = WsReply {
                    kind: "Error",
                    success: false,
                    message: Some(format!("unrecognised request: {e}")),
                    data: None,
                };
                if let Ok(json) = serde_json::to_string(&reply) {
                    let _ = tx.send(json).await;
                }
                continue;
            }
        };

        debug!(%conn_id, request = req.label(), "websocket request");
        let (reply, delivery) = handle_request(&state.sup, req).await;
        let json = match serde_json::to_string(&reply) {
            Ok(json) => json,
            Err(e) => {
                warn!("reply encode failed: {e}");
                continue;
            }
        };
        match delivery {
            Delivery::Broadcast => {
                let _ = state.hub.send(json);
            }
            Delivery::Requester => {
                if tx.send(json).await.is_err() {
                    break;
                }
            }
        }
    }

    writer.abort();
    debug!(%conn_id, "websocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;
    use crate::process::Launcher;
    use crate::supervisor::SupervisorOptions;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::process::Command;

    struct NeverLauncher;

    impl Launcher for NeverLauncher {
        fn command(&self, _item: &Item) -> Command {
            Command::new("/nonexistent/transcoder")
        }
    }

    fn supervisor(paths: &[&str]) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(
            paths.iter().map(|p| Item::new(*p)).collect(),
            Arc::new(NeverLauncher),
            SupervisorOptions::default(),
        ))
    }

    #[test]
    fn status_frame_uses_camel_case_keys() {
        let sup = supervisor(&["a.mp4", "b.mp4"]);
        let v = serde_json::to_value(StatusFrame::capture(&sup)).unwrap();
        assert_eq!(v["type"], "Status");
        assert_eq!(v["currentVideoPath"], "a.mp4");
        assert_eq!(v["videoList"], serde_json::json!(["a.mp4", "b.mp4"]));
        assert!(v["timestamp"].as_i64().unwrap() > 0);
        assert!(v.get("output").is_some());
    }

    #[test]
    fn requests_parse_by_type_tag() {
        let req: WsRequest = serde_json::from_str(r#"{"type":"StreamNextVideo","userId":"x"}"#).unwrap();
        assert_eq!(req, WsRequest::StreamNextVideo);
        assert!(serde_json::from_str::<WsRequest>(r#"{"type":"Dance"}"#).is_err());
    }

    #[tokio::test]
    async fn control_requests_are_broadcast_and_queries_are_private() {
        let sup = supervisor(&["a.mp4", "b.mp4"]);

        let (reply, delivery) = handle_request(&sup, WsRequest::StreamNextVideo).await;
        assert_eq!(delivery, Delivery::Broadcast);
        assert!(reply.success);
        assert_eq!(sup.current_index(), 1);

        let (reply, delivery) = handle_request(&sup, WsRequest::GetCurrentVideoPath).await;
        assert_eq!(delivery, Delivery::Requester);
        assert_eq!(reply.data, Some(serde_json::json!("b.mp4")));

        let (reply, _) = handle_request(&sup, WsRequest::GetVideoList).await;
        assert_eq!(reply.data, Some(serde_json::json!(["a.mp4", "b.mp4"])));

        let (reply, delivery) = handle_request(&sup, WsRequest::Quit).await;
        assert_eq!((reply.kind, delivery), ("Quit", Delivery::Broadcast));
        assert!(sup.is_closed());
    }

    #[tokio::test]
    async fn current_video_on_empty_playlist_fails() {
        let state = AppState::new(supervisor(&[]));
        let Json(resp) = video_current(State(state.clone())).await;
        assert!(!resp.success);
        assert_eq!(resp.message.as_deref(), Some(NO_VIDEO));

        let (reply, _) = handle_request(&state.sup, WsRequest::GetCurrentVideoPath).await;
        assert!(!reply.success);
        assert_eq!(reply.message.as_deref(), Some(NO_VIDEO));
    }

    #[tokio::test]
    async fn serves_health_and_stops_on_close() {
        let sup = supervisor(&["a.mp4"]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_on(listener, sup.clone(), Duration::from_millis(50)));

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET /video/list HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        conn.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200"), "{body}");
        assert!(body.contains(r#"{"success":true,"data":["a.mp4"]}"#), "{body}");

        sup.close().await;
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
