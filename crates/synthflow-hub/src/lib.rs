//! Loopback workflow event hub: accepts workflow events over HTTP, keeps a merged
//! view per workflow, serves the full-status pull and fans events out to
//! websocket subscribers.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use synthflow_core::model::{AgentUpdate, StatusSnapshot, WorkflowStatusUpdate};
use synthflow_core::reconciler::{
    ApplyOutcome, Inbound, ReconcilerConfig, StateReconciler, WorkflowView,
};
use synthflow_core::signal::NoCompletionSignal;
use synthflow_core::wire::{
    decode_frame, encode_frame, ChannelEnvelope, ChannelMsg, ClientFrame, FrameError,
    DEFAULT_MAX_FRAME_BYTES,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

pub const DEFAULT_HUB_ADDR: &str = "127.0.0.1:8787";
const BROADCAST_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub debug: bool,
    /// Forward every workflow's frames to every socket regardless of subscription.
    pub cross_post: bool,
    pub max_frame_bytes: usize,
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            debug: false,
            cross_post: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("envelope names workflow {claimed}, path names {path}")]
    WorkflowMismatch { path: String, claimed: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Clone, Debug)]
struct Published {
    workflow_id: String,
    text: String,
}

pub struct HubState {
    config: HubConfig,
    conn_counter: AtomicU64,
    active_connections: AtomicUsize,
    workflows: RwLock<HashMap<String, StateReconciler>>,
    frames: broadcast::Sender<Published>,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        let (frames, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            config,
            conn_counter: AtomicU64::new(1),
            active_connections: AtomicUsize::new(0),
            workflows: RwLock::new(HashMap::new()),
            frames,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::Relaxed);
        format!("conn-{id}")
    }

    /// Sockets currently attached to the fan-out.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub async fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Merges one event into the workflow's view and fans it out when it was
    /// accepted. A missing envelope id or timestamp is filled in.
    pub async fn ingest(
        &self,
        workflow_id: &str,
        mut envelope: ChannelEnvelope,
    ) -> Result<ApplyOutcome, IngestError> {
        match envelope.workflow_id.as_deref() {
            None => envelope.workflow_id = Some(workflow_id.to_string()),
            Some(claimed) if claimed != workflow_id => {
                return Err(IngestError::WorkflowMismatch {
                    path: workflow_id.to_string(),
                    claimed: claimed.to_string(),
                });
            }
            Some(_) => {}
        }
        let now = Utc::now();
        if envelope.timestamp.is_none() {
            envelope.timestamp = Some(now.to_rfc3339());
        }
        let text = encode_frame(&envelope, self.config.max_frame_bytes)?;
        let kind = envelope.msg.kind();

        let outcome = {
            let mut workflows = self.workflows.write().await;
            let reconciler = workflows
                .entry(workflow_id.to_string())
                .or_insert_with(|| {
                    StateReconciler::new(
                        workflow_id,
                        ReconcilerConfig::default(),
                        Arc::new(NoCompletionSignal),
                    )
                });
            reconciler.apply(Inbound::Channel(envelope), now)
        };

        match &outcome {
            ApplyOutcome::Dropped(reason) => {
                warn!(event = "event_dropped", workflow_id = workflow_id, kind = kind, reason = %reason);
            }
            ApplyOutcome::Applied(summary) => {
                info!(
                    event = "state_update",
                    workflow_id = workflow_id,
                    kind = kind,
                    changed = summary.changed
                );
                // No receivers is fine.
                let _ = self.frames.send(Published {
                    workflow_id: workflow_id.to_string(),
                    text,
                });
            }
        }
        Ok(outcome)
    }

    pub async fn view(&self, workflow_id: &str) -> Option<WorkflowView> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .map(|reconciler| reconciler.view().clone())
    }

    /// Full-status document for the pull endpoint.
    pub async fn status(&self, workflow_id: &str) -> Option<StatusSnapshot> {
        self.view(workflow_id).await.map(|view| status_snapshot(&view))
    }

    async fn catch_up_frames(&self, workflow_id: &str) -> Vec<String> {
        let Some(view) = self.view(workflow_id).await else {
            return Vec::new();
        };
        let mut frames = Vec::new();
        for envelope in catch_up_envelopes(&view) {
            match encode_frame(&envelope, self.config.max_frame_bytes) {
                Ok(text) => frames.push(text),
                Err(err) => {
                    warn!(event = "catch_up_encode", workflow_id = workflow_id, error = %err);
                }
            }
        }
        frames
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let conn_id = self.next_conn_id();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        });

        let mut published = self.frames.subscribe();
        let mut subscriptions: HashSet<String> = HashSet::new();
        let active = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        info!(event = "client_connected", conn_id = %conn_id, remote = %remote, active = active);

        loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    let msg = match incoming {
                        Some(Ok(msg)) => msg,
                        Some(Err(err)) => {
                            warn!(event = "read_error", conn_id = %conn_id, error = %err);
                            break;
                        }
                        None => break,
                    };
                    let text = match msg {
                        Message::Text(text) => text,
                        Message::Binary(bytes) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!(event = "message_invalid", conn_id = %conn_id, error = "binary frame is not utf-8");
                                continue;
                            }
                        },
                        Message::Close(_) => {
                            info!(event = "client_close", conn_id = %conn_id);
                            break;
                        }
                        Message::Ping(_) | Message::Pong(_) => continue,
                    };
                    if self.config.debug {
                        debug!(event = "message_received", conn_id = %conn_id, raw = %text);
                    }
                    match decode_frame::<ClientFrame>(&text, self.config.max_frame_bytes) {
                        Ok(ClientFrame::Subscribe { workflow_id }) => {
                            let frames = self.catch_up_frames(&workflow_id).await;
                            info!(
                                event = "subscribe",
                                conn_id = %conn_id,
                                workflow_id = %workflow_id,
                                catch_up = frames.len()
                            );
                            subscriptions.insert(workflow_id);
                            for frame in frames {
                                if tx.send(Message::Text(frame)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(ClientFrame::Unsubscribe { workflow_id }) => {
                            info!(event = "unsubscribe", conn_id = %conn_id, workflow_id = %workflow_id);
                            subscriptions.remove(&workflow_id);
                        }
                        Err(err) => {
                            warn!(event = "message_invalid", conn_id = %conn_id, error = %err);
                        }
                    }
                }
                frame = published.recv() => match frame {
                    Ok(frame) => {
                        if !self.config.cross_post && !subscriptions.contains(&frame.workflow_id) {
                            continue;
                        }
                        if tx.send(Message::Text(frame.text)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event = "subscriber_lagged", conn_id = %conn_id, skipped = skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        let active = self.active_connections.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(event = "client_disconnected", conn_id = %conn_id, active = active);
        drop(tx);
        let _ = write_task.await;
    }
}

/// Workflow fields, every agent in full, and the activity log.
pub fn status_snapshot(view: &WorkflowView) -> StatusSnapshot {
    StatusSnapshot {
        workflow_id: Some(view.workflow.id.clone()),
        state: full_status_update(view),
        agents: view
            .agents
            .values()
            .cloned()
            .map(AgentUpdate::from)
            .collect(),
        logs: view.activity_log.clone(),
    }
}

fn full_status_update(view: &WorkflowView) -> WorkflowStatusUpdate {
    let workflow = &view.workflow;
    WorkflowStatusUpdate {
        status: Some(workflow.status),
        progress: Some(workflow.progress),
        current_stage: workflow.current_stage.clone(),
        stages_completed: Some(workflow.stages_completed.clone()),
        error: workflow.error.clone(),
        cost_accrued: Some(workflow.cost_accrued),
    }
}

/// Frames a fresh subscriber needs to reach the current view.
fn catch_up_envelopes(view: &WorkflowView) -> Vec<ChannelEnvelope> {
    let id = view.workflow.id.as_str();
    let timestamp = Utc::now().to_rfc3339();
    let mut envelopes = vec![ChannelEnvelope::new(
        id,
        ChannelMsg::WorkflowStatus(full_status_update(view)),
    )];
    envelopes.extend(view.agents.values().map(|agent| {
        ChannelEnvelope::new(id, ChannelMsg::AgentUpdate(AgentUpdate::from(agent.clone())))
    }));
    for envelope in &mut envelopes {
        envelope.timestamp = Some(timestamp.clone());
    }
    envelopes
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/api/workflows/:workflow_id/status", get(status_handler))
        .route("/api/workflows/:workflow_id/events", post(events_handler))
        .with_state(hub)
}

pub async fn serve<F>(listener: TcpListener, hub: Arc<HubState>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    let max_frame_bytes = hub.config.max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| async move {
            hub.handle_socket(socket, addr).await;
        })
}

async fn status_handler(
    Path(workflow_id): Path<String>,
    State(hub): State<Arc<HubState>>,
) -> Response {
    match hub.status(&workflow_id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown workflow {workflow_id}") })),
        )
            .into_response(),
    }
}

async fn events_handler(
    Path(workflow_id): Path<String>,
    State(hub): State<Arc<HubState>>,
    Json(envelope): Json<ChannelEnvelope>,
) -> Response {
    match hub.ingest(&workflow_id, envelope).await {
        Ok(outcome) => {
            let reason = match &outcome {
                ApplyOutcome::Dropped(reason) => Some(reason.to_string()),
                ApplyOutcome::Applied(_) => None,
            };
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "applied": !outcome.is_dropped(),
                    "changed": outcome.changed(),
                    "reason": reason,
                })),
            )
                .into_response()
        }
        Err(err) => {
            let status = match &err {
                IngestError::Frame(FrameError::OversizedFrame { .. }) => {
                    StatusCode::PAYLOAD_TOO_LARGE
                }
                IngestError::Frame(FrameError::Encode(_)) => {
                    error!(event = "event_encode", workflow_id = %workflow_id, error = %err);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                _ => StatusCode::BAD_REQUEST,
            };
            (status, Json(json!({ "error": err.to_string() }))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synthflow_core::model::{AgentStatus, WorkflowStatus};

    fn status_event(progress: f64) -> ChannelEnvelope {
        ChannelEnvelope {
            workflow_id: None,
            timestamp: None,
            msg: ChannelMsg::WorkflowStatus(WorkflowStatusUpdate {
                progress: Some(progress),
                ..WorkflowStatusUpdate::default()
            }),
        }
    }

    #[tokio::test]
    async fn ingest_fills_workflow_id_and_builds_status() {
        let hub = HubState::new(HubConfig::default());
        let outcome = hub.ingest("wf_1", status_event(40.0)).await.expect("ingest");
        assert!(outcome.changed());

        let mut agent = AgentUpdate::new("synthetic_data");
        agent.status = Some(AgentStatus::Running);
        hub.ingest(
            "wf_1",
            ChannelEnvelope::new("wf_1", ChannelMsg::AgentUpdate(agent)),
        )
        .await
        .expect("ingest agent");

        let status = hub.status("wf_1").await.expect("known workflow");
        assert_eq!(status.workflow_id.as_deref(), Some("wf_1"));
        assert_eq!(status.state.status, Some(WorkflowStatus::Running));
        assert_eq!(status.state.progress, Some(40.0));
        assert_eq!(status.agents.len(), 1);
        assert_eq!(status.agents[0].agent_id, "synthetic_data");
        assert!(hub.status("wf_2").await.is_none());
        assert_eq!(hub.workflow_ids().await, vec!["wf_1".to_string()]);
    }

    #[tokio::test]
    async fn ingest_rejects_mismatched_workflow() {
        let hub = HubState::new(HubConfig::default());
        let mut envelope = status_event(10.0);
        envelope.workflow_id = Some("wf_other".to_string());
        let err = hub.ingest("wf_1", envelope).await.expect_err("mismatch");
        assert!(matches!(err, IngestError::WorkflowMismatch { .. }));
        assert!(hub.status("wf_1").await.is_none());
    }

    #[tokio::test]
    async fn accepted_events_are_published_with_timestamp() {
        let hub = HubState::new(HubConfig::default());
        let mut rx = hub.frames.subscribe();
        hub.ingest("wf_1", status_event(5.0)).await.expect("ingest");

        let published = rx.recv().await.expect("published frame");
        assert_eq!(published.workflow_id, "wf_1");
        let envelope: ChannelEnvelope =
            serde_json::from_str(&published.text).expect("decode published");
        assert_eq!(envelope.workflow_id.as_deref(), Some("wf_1"));
        assert!(envelope.timestamp.is_some());
    }

    #[tokio::test]
    async fn dropped_events_are_not_published() {
        let hub = HubState::new(HubConfig::default());
        let mut rx = hub.frames.subscribe();
        let empty = ChannelEnvelope {
            workflow_id: None,
            timestamp: None,
            msg: ChannelMsg::WorkflowStatus(WorkflowStatusUpdate::default()),
        };
        let outcome = hub.ingest("wf_1", empty).await.expect("ingest");
        assert!(outcome.is_dropped());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn catch_up_covers_workflow_and_agents() {
        let hub = HubState::new(HubConfig::default());
        hub.ingest("wf_1", status_event(60.0)).await.expect("ingest");
        for agent_id in ["synthetic_data", "privacy_guard"] {
            hub.ingest(
                "wf_1",
                ChannelEnvelope::new(
                    "wf_1",
                    ChannelMsg::AgentUpdate(AgentUpdate {
                        progress: Some(10.0),
                        ..AgentUpdate::new(agent_id)
                    }),
                ),
            )
            .await
            .expect("ingest agent");
        }

        let frames = hub.catch_up_frames("wf_1").await;
        assert_eq!(frames.len(), 3);
        let first: ChannelEnvelope = serde_json::from_str(&frames[0]).expect("decode");
        assert_eq!(first.msg.kind(), "workflow_status");
        assert!(hub.catch_up_frames("wf_missing").await.is_empty());
    }
}
