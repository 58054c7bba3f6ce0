//! HTTP control API plus the agent WebSocket endpoint.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tabrelay_core::{Error, Result, TabId};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;

#[derive(Clone)]
struct ServerState {
    bridge: Arc<Bridge>,
}

/// Body shared by the command endpoints; each handler checks its own fields.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest {
    #[serde(default)]
    tab_id: Option<TabId>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

pub fn router(bridge: Arc<Bridge>) -> Router {
    let relay_path = bridge.config().path.clone();
    let state = ServerState { bridge };

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/state", get(handle_state))
        .route("/api/listTabs", post(handle_list_tabs))
        .route("/api/setActiveTab", post(handle_set_active_tab))
        .route("/api/navigate", post(handle_navigate))
        .route("/api/eval", post(handle_eval))
        .route("/api/post", post(handle_post))
        .route("/api/xPost", post(handle_post))
        .route(&relay_path, get(handle_relay_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn serve(
    bridge: Arc<Bridge>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", bridge.config().host, bridge.config().port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(listener, bridge, async move {
        let _ = shutdown.recv().await;
    })
    .await
}

/// Serve on an already bound listener.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    bridge: Arc<Bridge>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(
        addr = %local,
        relay = %bridge.config().path,
        "Bridge listening"
    );
    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::LinkLost | Error::RemoteError(_) | Error::Protocol(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "ok": false, "error": err.to_string() }))).into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "ok": false, "error": message })),
    )
        .into_response()
}

/// Empty bodies count as `{}`.
fn parse_body(body: &Bytes) -> std::result::Result<ApiRequest, Response> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(ApiRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(&format!("invalid JSON body: {}", e)))
}

fn required(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

async fn handle_health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "extensionConnected": state.bridge.is_connected(),
        "pending": state.bridge.pending_count(),
    }))
}

async fn handle_state(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({ "ok": true, "state": state.bridge.state() }))
}

async fn handle_list_tabs(State(state): State<ServerState>) -> Response {
    match state.bridge.list_tabs().await {
        Ok(tabs) => Json(json!({ "ok": true, "tabs": tabs })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_set_active_tab(State(state): State<ServerState>, body: Bytes) -> Response {
    let req = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let Some(tab_id) = req.tab_id else {
        return bad_request("tabId required");
    };
    match state.bridge.set_active_tab(tab_id).await {
        Ok(()) => Json(json!({ "ok": true, "tabId": tab_id })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_navigate(State(state): State<ServerState>, body: Bytes) -> Response {
    let req = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let Some(url) = required(req.url) else {
        return bad_request("url required");
    };
    match state.bridge.navigate(req.tab_id, &url).await {
        Ok(()) => {
            let tab_id = req.tab_id.or(state.bridge.state().active_tab_id);
            Json(json!({ "ok": true, "tabId": tab_id, "url": url })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn handle_eval(State(state): State<ServerState>, body: Bytes) -> Response {
    let req = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let Some(script) = required(req.script) else {
        return bad_request("script required");
    };
    match state.bridge.evaluate(req.tab_id, &script).await {
        Ok(result) => Json(json!({ "ok": true, "result": result })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_post(State(state): State<ServerState>, body: Bytes) -> Response {
    let req = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let Some(text) = required(req.text) else {
        return bad_request("text required");
    };
    match state.bridge.post(req.tab_id, &text).await {
        Ok(outcome) => Json(json!({
            "ok": true,
            "posted": outcome.posted,
            "detail": outcome.detail,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_relay_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state.bridge))
}

async fn handle_agent_socket(socket: WebSocket, bridge: Arc<Bridge>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (link_id, mut outbound) = bridge.attach_link();

    // Writer: owns the sink, drains the link's queue.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = ws_sender.send(WsMessage::Text(frame)).await {
                warn!(error = %e, "Agent socket write failed");
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => bridge.handle_frame(&text),
            Ok(WsMessage::Close(_)) => {
                debug!(link_id, "Agent sent close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(link_id, error = %e, "Agent socket read error");
                break;
            }
        }
    }

    bridge.detach_link(link_id);
    writer.abort();
}
