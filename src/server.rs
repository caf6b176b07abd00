//! HTTP + WebSocket connection layer
//!
//! Each WebSocket connection owns exactly one [`Session`]. Client messages are
//! handled in order on the connection's reader; outbound text goes through a
//! bounded channel drained by a writer task, so a slow client applies
//! backpressure to its own loop only.

use crate::analyzer::VisionAnalyzer;
use crate::broadcast::Broadcaster;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{Session, SessionConfig, StartOutcome};
use crate::video::SourceOpener;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const ANALYSIS_WS_PATH: &str = "/ws/scanner/analysis/";

/// Queued outbound messages per connection.
const OUTBOUND_BUFFER: usize = 8;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

struct AppInner {
    session_config: SessionConfig,
    opener: Arc<dyn SourceOpener>,
    analyzer: Arc<dyn VisionAnalyzer>,
    started_at: Instant,
    active_sessions: AtomicUsize,
}

impl AppState {
    pub fn new(
        session_config: SessionConfig,
        opener: Arc<dyn SourceOpener>,
        analyzer: Arc<dyn VisionAnalyzer>,
    ) -> Self {
        Self {
            inner: Arc::new(AppInner {
                session_config,
                opener,
                analyzer,
                started_at: Instant::now(),
                active_sessions: AtomicUsize::new(0),
            }),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.active_sessions.load(Ordering::Relaxed)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(ANALYSIS_WS_PATH, get(analysis_ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "parkwatch",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_ms": state.inner.started_at.elapsed().as_millis() as u64,
        "active_sessions": state.active_sessions(),
    }))
}

async fn analysis_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let inner = &state.inner;
    let broadcaster = Broadcaster::new(tx.clone(), inner.session_config.preview);
    let mut session = Session::new(
        inner.session_config.clone(),
        Arc::clone(&inner.opener),
        Arc::clone(&inner.analyzer),
        broadcaster,
    );
    let session_id = session.id();
    inner.active_sessions.fetch_add(1, Ordering::Relaxed);
    info!(session_id = %session_id, "WebSocket client connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => handle_client_text(&mut session, &tx, text.as_str()).await,
            Ok(Message::Close(_)) => {
                debug!(session_id = %session_id, "Close frame received");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    session.cancel().await;
    // Last senders gone: the writer drains and exits
    drop(session);
    drop(tx);
    let _ = writer.await;

    inner.active_sessions.fetch_sub(1, Ordering::Relaxed);
    info!(session_id = %session_id, "WebSocket client disconnected");
}

async fn handle_client_text<S>(session: &mut Session<S>, tx: &mpsc::Sender<String>, text: &str)
where
    S: crate::broadcast::UpdateSink + 'static,
{
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::StartAnalysis { video_path }) => match session.start(&video_path).await {
            Ok(StartOutcome::Started { fps }) => ServerMessage::AnalysisStarted { video_path, fps },
            Ok(StartOutcome::AlreadyRunning) => ServerMessage::error("analysis already running"),
            Err(e) => {
                warn!(session_id = %session.id(), video_path = %video_path, error = %e, "Failed to start analysis");
                ServerMessage::error(e.to_string())
            }
        },
        Ok(ClientMessage::StopAnalysis) => {
            if session.cancel().await {
                ServerMessage::AnalysisStopped
            } else {
                ServerMessage::error("no analysis running")
            }
        }
        Err(e) => {
            debug!(session_id = %session.id(), error = %e, "Invalid client message");
            ServerMessage::error(format!("invalid message: {}", e))
        }
    };

    let text = match reply.to_json() {
        Ok(text) => text,
        Err(e) => {
            error!(session_id = %session.id(), error = %e, "Failed to serialize reply, not sending");
            return;
        }
    };
    if tx.send(text).await.is_err() {
        debug!(session_id = %session.id(), "Reply dropped, writer closed");
    }
}
