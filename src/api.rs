//! HTTP and WebSocket surface of the router.
//!
//! Chat clients connect to `/ws/{session}` and exchange plain text lines for
//! [`SessionEvent`] frames. Agents connect to `/agents/{name}/inbox`, receive
//! `MailboxDelivery` frames and answer with [`AgentEnvelope`] frames. The
//! REST routes expose the registry, routing preview and conversation history.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::{
    dispatcher::RouterContext,
    mailbox::LocalMailbox,
    protocol::{AgentEnvelope, SessionEvent},
    routing,
    session::run_session,
    types::{AgentName, SessionKey},
};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const LINE_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;
const INBOX_BUFFER: usize = 64;
/// Session that receives agent frames sent before any delivery told the
/// agent where to reply.
const FALLBACK_SESSION: &str = "main";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ApiState {
    ctx: RouterContext,
    mailbox: LocalMailbox,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PreviewRequest {
    text: String,
    #[serde(default)]
    locked: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// `mailbox` must be the same hub that `ctx.mailbox` delivers into.
pub fn router(ctx: RouterContext, mailbox: LocalMailbox) -> axum::Router {
    router_with_auth(ctx, mailbox, configured_api_key())
}

fn configured_api_key() -> Option<String> {
    std::env::var("CHAT_ROUTER_API_KEY")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn router_with_auth(
    ctx: RouterContext,
    mailbox: LocalMailbox,
    api_key: Option<String>,
) -> axum::Router {
    use axum::{middleware, routing, Router};

    let state = ApiState {
        ctx,
        mailbox,
        api_key: api_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
    };

    let protected = Router::new()
        .route("/ws/{session}", routing::get(chat_ws))
        .route("/agents/{name}/inbox", routing::get(agent_inbox_ws))
        .route("/api/agents", routing::get(api_agents))
        .route("/api/route/preview", routing::post(api_route_preview))
        .route("/api/sessions/{session}/history", routing::get(api_history))
        .route("/api/sessions/{session}/clear", routing::post(api_clear))
        .route(
            "/api/sessions/{session}/replies",
            routing::post(api_publish_reply),
        )
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", routing::get(health))
        .merge(protected)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn health(axum::extract::State(state): axum::extract::State<ApiState>) -> axum::Json<Value> {
    axum::Json(json!({
        "status": "ok",
        "service": "agent-chat-router",
        "version": env!("CARGO_PKG_VERSION"),
        "primary": state.ctx.primary(),
    }))
}

fn unauthorized_error_envelope() -> Value {
    json!({
        "error": {
            "code": "unauthorized",
            "message": "Missing or invalid API key",
            "retryable": false,
            "statusCode": 401,
        }
    })
}

async fn auth_middleware(
    axum::extract::State(state): axum::extract::State<ApiState>,
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<axum::response::Response, (axum::http::StatusCode, axum::Json<Value>)> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    // X-API-Key header or Authorization: Bearer <token>
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim)
                .filter(|value| !value.is_empty())
        });

    if provided != Some(expected) {
        return Err((
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(unauthorized_error_envelope()),
        ));
    }

    Ok(next.run(request).await)
}

async fn api_agents(
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> (axum::http::StatusCode, axum::Json<Value>) {
    match state.ctx.registry.list_agents().await {
        Ok(agents) => (
            axum::http::StatusCode::OK,
            axum::Json(json!({ "agents": agents })),
        ),
        Err(error) => {
            let status = if error.is_retryable() {
                axum::http::StatusCode::SERVICE_UNAVAILABLE
            } else {
                axum::http::StatusCode::BAD_GATEWAY
            };
            (
                status,
                axum::Json(json!({ "agents": [], "error": error.to_string() })),
            )
        }
    }
}

async fn api_route_preview(
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::Json(body): axum::Json<PreviewRequest>,
) -> axum::Json<Value> {
    let snapshot = state.ctx.snapshot().await;
    let locked = body
        .locked
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(AgentName::new);
    let plan = routing::plan_outbound(&body.text, &snapshot, locked.as_ref(), state.ctx.primary());
    axum::Json(json!(plan))
}

async fn api_history(
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::extract::Path(session): axum::extract::Path<String>,
) -> axum::Json<Value> {
    let session = SessionKey::new(session);
    let threads = state.ctx.history.snapshot(&session);
    let message_count: usize = threads.values().map(Vec::len).sum();
    axum::Json(json!({
        "session": session,
        "threads": threads,
        "message_count": message_count,
    }))
}

async fn api_clear(
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::extract::Path(session): axum::extract::Path<String>,
) -> axum::Json<Value> {
    let session = SessionKey::new(session);
    let removed = state.ctx.history.clear(&session);
    tracing::info!(target = "router::api", session = %session, removed = removed, "history cleared over http");
    axum::Json(json!({ "session": session, "removed": removed }))
}

/// Publishes the raw request body on the session's reply topic, exactly as
/// if an agent had sent it.
async fn api_publish_reply(
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::extract::Path(session): axum::extract::Path<String>,
    body: String,
) -> (axum::http::StatusCode, axum::Json<Value>) {
    if body.trim().is_empty() {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            axum::Json(json!({ "success": false, "error": "Empty reply body" })),
        );
    }
    let session = SessionKey::new(session);
    let listeners = state.mailbox.publish_reply(&session, body);
    (
        axum::http::StatusCode::OK,
        axum::Json(json!({ "success": true, "session": session, "listeners": listeners })),
    )
}

// ---------------------------------------------------------------------------
// Chat socket
// ---------------------------------------------------------------------------

async fn chat_ws(
    ws: axum::extract::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::extract::Path(session): axum::extract::Path<String>,
) -> impl axum::response::IntoResponse {
    let session = SessionKey::new(session);
    ws.on_upgrade(move |socket| handle_chat_ws(socket, state.ctx, session))
}

async fn handle_chat_ws(socket: WebSocket, ctx: RouterContext, session: SessionKey) {
    tracing::info!(target = "router::api", session = %session, "chat client connected");
    let (mut sink, mut stream) = socket.split();
    let (lines_tx, lines_rx) = mpsc::channel::<String>(LINE_BUFFER);
    let (events_tx, mut events_rx) = mpsc::channel::<SessionEvent>(EVENT_BUFFER);

    let session_task = tokio::spawn(run_session(ctx, session.clone(), lines_rx, events_tx));

    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    match serde_json::to_string(&event) {
                        Ok(msg) => {
                            if sink.send(Message::Text(msg.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            tracing::warn!(target = "router::api", error = %error, "failed to encode session event");
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if lines_tx.send(text.as_str().to_owned()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    drop(lines_tx);
    let _ = session_task.await;
    let _ = writer.await;
    tracing::info!(target = "router::api", session = %session, "chat client disconnected");
}

// ---------------------------------------------------------------------------
// Agent inbox socket
// ---------------------------------------------------------------------------

async fn agent_inbox_ws(
    ws: axum::extract::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::extract::Path(name): axum::extract::Path<String>,
) -> impl axum::response::IntoResponse {
    let agent = AgentName::new(name);
    ws.on_upgrade(move |socket| handle_agent_ws(socket, state.mailbox, agent))
}

async fn handle_agent_ws(socket: WebSocket, mailbox: LocalMailbox, agent: AgentName) {
    let (mut sink, mut stream) = socket.split();
    let mut inbox = mailbox.attach_inbox(&agent, INBOX_BUFFER);
    let mut reply_session = SessionKey::new(FALLBACK_SESSION);
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            delivery = inbox.recv() => {
                let Some(delivery) = delivery else { break };
                if let Some(session) = SessionKey::from_reply_topic(&delivery.reply_to) {
                    reply_session = session;
                }
                match serde_json::to_string(&delivery) {
                    Ok(msg) => {
                        if sink.send(Message::Text(msg.into())).await.is_err() {
                            tracing::warn!(
                                target = "router::api",
                                agent = %agent,
                                delivery_id = %delivery.delivery_id,
                                "agent socket closed mid-delivery"
                            );
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(target = "router::api", agent = %agent, error = %error, "failed to encode delivery");
                    }
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    publish_agent_frame(&mailbox, &agent, &reply_session, text.as_str());
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = ping_interval.tick() => {
                if sink.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }

    mailbox.detach_inbox(&agent);
}

/// Forwards one frame from an agent to the session it addresses. Envelopes
/// without a sender are attributed to the connected agent; anything that is
/// not an envelope goes to the session of the agent's latest delivery.
fn publish_agent_frame(
    mailbox: &LocalMailbox,
    agent: &AgentName,
    latest: &SessionKey,
    frame: &str,
) -> usize {
    let Ok(mut envelope) = serde_json::from_str::<AgentEnvelope>(frame) else {
        return mailbox.publish_reply(latest, frame);
    };

    let session = envelope
        .reply_to
        .as_deref()
        .and_then(SessionKey::from_reply_topic)
        .unwrap_or_else(|| latest.clone());
    if envelope.sender.as_ref().map_or(true, AgentName::is_empty) {
        envelope.sender = Some(agent.clone());
    }

    match serde_json::to_string(&envelope) {
        Ok(payload) => mailbox.publish_reply(&session, payload),
        Err(error) => {
            tracing::warn!(target = "router::api", agent = %agent, error = %error, "failed to re-encode agent frame");
            0
        }
    }
}
