//! One observed workflow: initial pull, push channel, polling fallback and the
//! reconciler, all driven from a single task so merges never race.

use crate::channel::{ChannelConfig, ConnectionState, TelemetryChannel};
use crate::poller::{PollEvent, PollingFallback, StatusSource, DEFAULT_POLL_INTERVAL};
use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use synthflow_core::model::WorkflowStatus;
use synthflow_core::reconciler::{
    ApplyOutcome, DropReason, Inbound, ReconcilerConfig, StateReconciler, WorkflowView,
};
use synthflow_core::signal::CompletionSignal;
use synthflow_core::wire::ChannelEnvelope;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SOURCE_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `None` runs on polling alone.
    pub channel: Option<ChannelConfig>,
    pub poll_interval: Duration,
    /// Cadence while the push channel is connected; defaults to `poll_interval`.
    pub connected_poll_interval: Option<Duration>,
    pub reconciler: ReconcilerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connected_poll_interval: None,
            reconciler: ReconcilerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceHealth {
    pub channel: Option<ConnectionState>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_poll_error: Option<String>,
    pub polling: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub view: WorkflowView,
    pub sources: SourceHealth,
}

impl SessionView {
    /// Transport warning, shown only while every source is failing.
    pub fn banner(&self) -> Option<String> {
        let channel_up = self.sources.channel == Some(ConnectionState::Connected);
        match (&self.sources.last_poll_error, channel_up) {
            (Some(error), false) => Some(format!("live updates unavailable: {error}")),
            _ => None,
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        self.view.workflow.status
    }
}

pub struct WorkflowSession {
    workflow_id: String,
    view: watch::Receiver<SessionView>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WorkflowSession {
    pub async fn start(
        workflow_id: impl Into<String>,
        config: SessionConfig,
        source: Arc<dyn StatusSource>,
        signal: Arc<dyn CompletionSignal>,
    ) -> Self {
        let workflow_id = workflow_id.into();
        let mut reconciler = StateReconciler::new(workflow_id.clone(), config.reconciler, signal);
        let mut sources = SourceHealth::default();

        match source.fetch_status(&workflow_id).await {
            Ok(snapshot) => {
                sources.last_poll_at = Some(Utc::now());
                let outcome = reconciler.apply(
                    Inbound::Poll {
                        workflow_id: workflow_id.clone(),
                        ticket: None,
                        snapshot,
                    },
                    Utc::now(),
                );
                if let ApplyOutcome::Dropped(reason) = &outcome {
                    log_drop(&workflow_id, reason);
                }
            }
            Err(err) => {
                warn!(event = "initial_pull_error", workflow_id = %workflow_id, error = %err);
                sources.last_poll_error = Some(err.to_string());
            }
        }

        let status = reconciler.status();
        let mut channel = None;
        let mut listener = None;
        let mut channel_state = None;
        if let Some(channel_config) = config.channel.clone() {
            if !closes_channel(status) {
                let mut telemetry = TelemetryChannel::new(channel_config);
                telemetry.subscribe(&workflow_id);
                listener = Some(telemetry.listen());
                channel_state = Some(telemetry.watch_state());
                if let Err(err) = telemetry.connect().await {
                    warn!(event = "channel_unavailable", workflow_id = %workflow_id, error = %err);
                }
                sources.channel = Some(telemetry.state());
                channel = Some(telemetry);
            } else {
                sources.channel = Some(ConnectionState::Closed);
            }
        }

        let (tx, rx) = mpsc::channel(SOURCE_QUEUE_CAPACITY);
        let mut runtime = SessionRuntime {
            workflow_id: workflow_id.clone(),
            config,
            reconciler,
            source,
            channel,
            listener,
            channel_state,
            poller: None,
            poll_tickets: Arc::default(),
            tx,
            rx,
            sources,
            view_tx: None,
        };
        if !status.is_terminal() {
            runtime.start_polling();
        }

        let (view_tx, view_rx) = watch::channel(runtime.snapshot());
        runtime.view_tx = Some(view_tx);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(runtime.run(shutdown_rx));
        info!(event = "session_started", workflow_id = %workflow_id, status = %status);

        Self {
            workflow_id,
            view: view_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Closes the channel, stops polling and waits for the session task.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WorkflowSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Keeps at most one session alive and swaps it when the observed id changes.
/// The old session's channel is closed before the new one connects, so one
/// monitor never holds more than one push connection.
pub struct Monitor {
    config: SessionConfig,
    source: Arc<dyn StatusSource>,
    signal: Arc<dyn CompletionSignal>,
    session: Option<WorkflowSession>,
}

impl Monitor {
    pub fn new(
        config: SessionConfig,
        source: Arc<dyn StatusSource>,
        signal: Arc<dyn CompletionSignal>,
    ) -> Self {
        Self {
            config,
            source,
            signal,
            session: None,
        }
    }

    pub async fn observe(&mut self, workflow_id: &str) -> watch::Receiver<SessionView> {
        if let Some(session) = &self.session {
            if session.workflow_id() == workflow_id {
                return session.subscribe();
            }
        }
        self.release().await;
        let session = WorkflowSession::start(
            workflow_id,
            self.config.clone(),
            self.source.clone(),
            self.signal.clone(),
        )
        .await;
        let view = session.subscribe();
        self.session = Some(session);
        view
    }

    pub async fn release(&mut self) {
        if let Some(session) = self.session.take() {
            info!(event = "session_released", workflow_id = %session.workflow_id());
            session.shutdown().await;
        }
    }

    pub fn current(&self) -> Option<&WorkflowSession> {
        self.session.as_ref()
    }
}

struct SessionRuntime {
    workflow_id: String,
    config: SessionConfig,
    reconciler: StateReconciler,
    source: Arc<dyn StatusSource>,
    channel: Option<TelemetryChannel>,
    listener: Option<broadcast::Receiver<ChannelEnvelope>>,
    channel_state: Option<watch::Receiver<ConnectionState>>,
    poller: Option<PollingFallback>,
    /// Shared by every poller this session starts.
    poll_tickets: Arc<AtomicU64>,
    tx: mpsc::Sender<PollEvent>,
    rx: mpsc::Receiver<PollEvent>,
    sources: SourceHealth,
    view_tx: Option<watch::Sender<SessionView>>,
}

impl SessionRuntime {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.rx.recv() => self.handle_poll_event(event),
                received = recv_envelope(&mut self.listener) => match received {
                    Ok(envelope) => self.apply(Inbound::Channel(envelope), Utc::now()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "channel_lagged", workflow_id = %self.workflow_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.listener = None;
                    }
                },
                state = next_state(&mut self.channel_state) => match state {
                    Some(state) => self.handle_channel_state(state),
                    None => self.channel_state = None,
                },
            }
            self.publish();
        }
        self.teardown();
    }

    fn handle_poll_event(&mut self, event: PollEvent) {
        match event {
            PollEvent::Issued {
                workflow_id,
                ticket,
            } => {
                self.apply(
                    Inbound::PollIssued {
                        workflow_id,
                        ticket,
                    },
                    Utc::now(),
                );
            }
            PollEvent::Snapshot {
                workflow_id,
                ticket,
                snapshot,
                received_at,
            } => {
                self.sources.last_poll_at = Some(received_at);
                self.sources.last_poll_error = None;
                self.apply(
                    Inbound::Poll {
                        workflow_id,
                        ticket: Some(ticket),
                        snapshot,
                    },
                    received_at,
                );
                self.apply(Inbound::SignalRefresh, received_at);
            }
            PollEvent::Failed { error, .. } => {
                self.sources.last_poll_error = Some(error);
            }
        }
    }

    fn handle_channel_state(&mut self, state: ConnectionState) {
        debug!(event = "channel_state", workflow_id = %self.workflow_id, state = %state);
        self.sources.channel = Some(state);
        if let Some(poller) = &self.poller {
            poller.set_interval(self.current_poll_interval());
        }
    }

    fn apply(&mut self, inbound: Inbound, received_at: DateTime<Utc>) {
        let outcome = self.reconciler.apply(inbound, received_at);
        match &outcome {
            ApplyOutcome::Dropped(reason) => log_drop(&self.workflow_id, reason),
            ApplyOutcome::Applied(summary) => {
                if summary.stale_fields > 0 {
                    debug!(
                        event = "stale_poll_fields",
                        workflow_id = %self.workflow_id,
                        count = summary.stale_fields
                    );
                }
                if let Some(transition) = summary.transition {
                    info!(
                        event = "workflow_status_changed",
                        workflow_id = %self.workflow_id,
                        from = %transition.from,
                        to = %transition.to
                    );
                    self.on_status(transition.to);
                }
            }
        }
    }

    fn on_status(&mut self, status: WorkflowStatus) {
        if status.is_terminal() {
            if let Some(poller) = self.poller.take() {
                poller.stop();
                info!(event = "polling_stopped", workflow_id = %self.workflow_id, status = %status);
            }
            self.sources.polling = false;
            if closes_channel(status) {
                if let Some(channel) = &mut self.channel {
                    channel.disconnect();
                }
                self.listener = None;
                self.channel_state = None;
                if self.channel.is_some() {
                    self.sources.channel = Some(ConnectionState::Closed);
                }
                if let Some(error) = self.reconciler.view().latest_error() {
                    warn!(event = "workflow_failed", workflow_id = %self.workflow_id, error = error);
                }
            }
        } else if self.poller.is_none() {
            self.start_polling();
        }
    }

    fn start_polling(&mut self) {
        let interval = self.current_poll_interval();
        self.poller = Some(PollingFallback::spawn_with_tickets(
            self.source.clone(),
            self.workflow_id.clone(),
            interval,
            self.poll_tickets.clone(),
            self.tx.clone(),
        ));
        self.sources.polling = true;
        debug!(
            event = "polling_started",
            workflow_id = %self.workflow_id,
            interval_ms = interval.as_millis() as u64
        );
    }

    fn current_poll_interval(&self) -> Duration {
        match (self.sources.channel, self.config.connected_poll_interval) {
            (Some(ConnectionState::Connected), Some(interval)) => interval,
            _ => self.config.poll_interval,
        }
    }

    fn snapshot(&self) -> SessionView {
        SessionView {
            view: self.reconciler.view().clone(),
            sources: self.sources.clone(),
        }
    }

    fn publish(&self) {
        let Some(view_tx) = &self.view_tx else {
            return;
        };
        let next = self.snapshot();
        view_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn teardown(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        if let Some(channel) = &mut self.channel {
            channel.disconnect();
        }
        self.listener = None;
        self.channel_state = None;
        info!(event = "session_stopped", workflow_id = %self.workflow_id);
    }
}

/// Failed and aborted workflows release the push channel; completed ones keep
/// it so late corrections still arrive.
fn closes_channel(status: WorkflowStatus) -> bool {
    matches!(status, WorkflowStatus::Failed | WorkflowStatus::Aborted)
}

fn log_drop(workflow_id: &str, reason: &DropReason) {
    match reason {
        DropReason::ForeignWorkflow(other) => {
            debug!(event = "payload_dropped", workflow_id = %workflow_id, other = %other);
        }
        _ => warn!(event = "payload_dropped", workflow_id = %workflow_id, reason = %reason),
    }
}

async fn recv_envelope(
    listener: &mut Option<broadcast::Receiver<ChannelEnvelope>>,
) -> Result<ChannelEnvelope, broadcast::error::RecvError> {
    match listener {
        Some(listener) => listener.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_state(state: &mut Option<watch::Receiver<ConnectionState>>) -> Option<ConnectionState> {
    match state {
        Some(state) => {
            state.changed().await.ok()?;
            let current = *state.borrow_and_update();
            Some(current)
        }
        None => std::future::pending().await,
    }
}
