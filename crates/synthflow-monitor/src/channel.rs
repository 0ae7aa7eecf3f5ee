//! WebSocket push channel. One background task owns the socket, re-sends the
//! current subscription on every (re)connect and fans decoded envelopes out to
//! any number of listeners.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use synthflow_core::wire::{
    decode_frame, encode_frame, ChannelEnvelope, ClientFrame, FrameError, DEFAULT_MAX_FRAME_BYTES,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

const LISTENER_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: Url,
    /// Retry with backoff after a drop. When false a lost connection stays lost.
    pub reconnect: bool,
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl ChannelConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect: true,
            connect_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("channel is not connected")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("outbound queue full")]
    QueueFull,
}

pub struct TelemetryChannel {
    config: ChannelConfig,
    events: broadcast::Sender<ChannelEnvelope>,
    state: Arc<watch::Sender<ConnectionState>>,
    intent: watch::Sender<Option<String>>,
    outbound: Option<mpsc::Sender<String>>,
    task: Option<JoinHandle<()>>,
}

impl TelemetryChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let (events, _) = broadcast::channel(LISTENER_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (intent, _) = watch::channel(None);
        Self {
            config,
            events,
            state: Arc::new(state),
            intent,
            outbound: None,
            task: None,
        }
    }

    /// Starts the connection task unless one is already running and waits for
    /// the first attempt. With reconnect enabled a failed first attempt is
    /// still retried in the background.
    ///
    /// Each channel holds at most one socket. Separate channels hold separate
    /// sockets; a process wanting a single connection goes through
    /// [`crate::session::Monitor`].
    pub async fn connect(&mut self) -> Result<(), ChannelError> {
        if self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let ctx = LoopContext {
            config: self.config.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            intent: self.intent.subscribe(),
            outbound: outbound_rx,
        };
        self.outbound = Some(outbound_tx);
        self.task = Some(tokio::spawn(channel_loop(ctx, ready_tx)));

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Closed),
        }
    }

    /// Records the workflow to follow; sent now if connected and again after
    /// every reconnect.
    pub fn subscribe(&self, workflow_id: &str) {
        self.intent.send_replace(Some(workflow_id.to_string()));
    }

    pub fn subscription(&self) -> Option<String> {
        self.intent.borrow().clone()
    }

    pub fn listen(&self) -> broadcast::Receiver<ChannelEnvelope> {
        self.events.subscribe()
    }

    /// Fire-and-forget. Fails only when no connection task exists or the
    /// outbound queue is saturated.
    pub fn send(&self, frame: &ClientFrame) -> Result<(), ChannelError> {
        let text = encode_frame(frame, self.config.max_frame_bytes)?;
        let outbound = self.outbound.as_ref().ok_or(ChannelError::Closed)?;
        outbound.try_send(text).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ChannelError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    /// Closes the socket and drops every listener.
    pub fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.outbound = None;
        let (events, _) = broadcast::channel(LISTENER_CAPACITY);
        self.events = events;
        self.state.send_replace(ConnectionState::Closed);
        info!(event = "channel_closed", url = %self.config.url);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl Drop for TelemetryChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct LoopContext {
    config: ChannelConfig,
    events: broadcast::Sender<ChannelEnvelope>,
    state: Arc<watch::Sender<ConnectionState>>,
    intent: watch::Receiver<Option<String>>,
    outbound: mpsc::Receiver<String>,
}

enum SessionEnd {
    Dropped(&'static str),
    Released,
}

async fn channel_loop(mut ctx: LoopContext, ready: oneshot::Sender<Result<(), ChannelError>>) {
    let mut ready = Some(ready);
    let mut backoff = Duration::from_secs(1);

    loop {
        ctx.state.send_replace(ConnectionState::Connecting);
        let attempt =
            tokio::time::timeout(ctx.config.connect_timeout, connect_async(ctx.config.url.as_str()))
                .await;
        let mut ws = match attempt {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(err)) => {
                let reason = err.to_string();
                warn!(event = "channel_connect_error", url = %ctx.config.url, error = %reason);
                ctx.state.send_replace(ConnectionState::Disconnected);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(ChannelError::Connect {
                        url: ctx.config.url.to_string(),
                        reason,
                    }));
                }
                if !ctx.config.reconnect {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
            Err(_) => {
                warn!(event = "channel_connect_timeout", url = %ctx.config.url);
                ctx.state.send_replace(ConnectionState::Disconnected);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(ChannelError::Connect {
                        url: ctx.config.url.to_string(),
                        reason: "timed out".to_string(),
                    }));
                }
                if !ctx.config.reconnect {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = Duration::from_secs(1);
        ctx.state.send_replace(ConnectionState::Connected);
        info!(event = "channel_connected", url = %ctx.config.url);
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }

        let max = ctx.config.max_frame_bytes;
        let mut subscribed: Option<String> = None;
        let initial = ctx.intent.borrow_and_update().clone();
        let mut end = None;
        if let Some(workflow_id) = initial {
            if let Some(text) = subscribe_frame(&workflow_id, max) {
                if ws.send(Message::Text(text)).await.is_err() {
                    end = Some(SessionEnd::Dropped("write_error"));
                }
            }
            subscribed = Some(workflow_id);
        }

        let end = match end {
            Some(end) => end,
            None => loop {
                tokio::select! {
                    incoming = ws.next() => match incoming {
                        Some(Ok(Message::Text(text))) => deliver(&ctx, &text),
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => deliver(&ctx, &text),
                            Err(_) => warn!(event = "channel_decode_error", error = "binary frame is not utf-8"),
                        },
                        Some(Ok(Message::Close(_))) | None => break SessionEnd::Dropped("closed"),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(event = "channel_read_error", error = %err);
                            break SessionEnd::Dropped("read_error");
                        }
                    },
                    changed = ctx.intent.changed() => {
                        if changed.is_err() {
                            break SessionEnd::Released;
                        }
                        let next = ctx.intent.borrow_and_update().clone();
                        if next == subscribed {
                            continue;
                        }
                        let mut frames = Vec::new();
                        if let Some(previous) = subscribed.take() {
                            let frame = ClientFrame::Unsubscribe { workflow_id: previous };
                            frames.extend(encode_frame(&frame, max).ok());
                        }
                        if let Some(workflow_id) = &next {
                            frames.extend(subscribe_frame(workflow_id, max));
                        }
                        subscribed = next;
                        let mut failed = false;
                        for text in frames {
                            if ws.send(Message::Text(text)).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break SessionEnd::Dropped("write_error");
                        }
                    }
                    outbound = ctx.outbound.recv() => match outbound {
                        Some(text) => {
                            if ws.send(Message::Text(text)).await.is_err() {
                                break SessionEnd::Dropped("write_error");
                            }
                        }
                        None => break SessionEnd::Released,
                    },
                }
            },
        };

        let _ = ws.close(None).await;
        match end {
            SessionEnd::Released => {
                ctx.state.send_replace(ConnectionState::Closed);
                return;
            }
            SessionEnd::Dropped(reason) => {
                ctx.state.send_replace(ConnectionState::Disconnected);
                warn!(event = "channel_disconnected", url = %ctx.config.url, reason = reason);
            }
        }
        if !ctx.config.reconnect {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

fn subscribe_frame(workflow_id: &str, max_frame_bytes: usize) -> Option<String> {
    let frame = ClientFrame::Subscribe {
        workflow_id: workflow_id.to_string(),
    };
    match encode_frame(&frame, max_frame_bytes) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(event = "channel_encode_error", error = %err);
            None
        }
    }
}

fn deliver(ctx: &LoopContext, text: &str) {
    match decode_frame::<ChannelEnvelope>(text, ctx.config.max_frame_bytes) {
        Ok(envelope) => {
            debug!(
                event = "channel_frame",
                kind = envelope.msg.kind(),
                workflow_id = envelope.workflow_id.as_deref().unwrap_or("")
            );
            let _ = ctx.events.send(envelope);
        }
        Err(err) => warn!(event = "channel_decode_error", error = %err),
    }
}

pub(crate) fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > Duration::from_secs(10) {
        Duration::from_secs(10)
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn unused_ws_url() -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        Url::parse(&format!("ws://{addr}/ws")).expect("url")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..6 {
            backoff = next_backoff(backoff);
            seen.push(backoff.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 10, 10, 10]);
    }

    #[tokio::test]
    async fn failed_first_attempt_is_reported_without_reconnect() {
        let mut config = ChannelConfig::new(unused_ws_url().await);
        config.reconnect = false;
        config.connect_timeout = Duration::from_secs(2);
        let mut channel = TelemetryChannel::new(config);

        let result = channel.connect().await;
        assert!(matches!(result, Err(ChannelError::Connect { .. })));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_clears_listeners_and_rejects_sends() {
        let mut channel = TelemetryChannel::new(ChannelConfig::new(unused_ws_url().await));
        let mut listener = channel.listen();
        channel.subscribe("wf_1");
        channel.disconnect();

        assert_eq!(channel.state(), ConnectionState::Closed);
        assert!(matches!(
            listener.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(
            channel.send(&ClientFrame::Subscribe {
                workflow_id: "wf_1".to_string()
            }),
            Err(ChannelError::Closed)
        ));
        assert_eq!(channel.subscription().as_deref(), Some("wf_1"));
    }
}
