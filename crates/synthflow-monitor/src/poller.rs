use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use synthflow_core::model::StatusSnapshot;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PollError {
    #[error("api base url cannot carry a path: {0}")]
    InvalidBase(String),
    #[error("status request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status endpoint returned {status}")]
    Status { status: u16 },
    #[error("status payload decode failed: {0}")]
    Decode(String),
}

/// Full-status pull for one workflow.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, workflow_id: &str) -> Result<StatusSnapshot, PollError>;
}

pub struct HttpStatusClient {
    client: Client,
    api_base: Url,
}

impl HttpStatusClient {
    pub fn new(api_base: Url, request_timeout: Duration) -> Result<Self, PollError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, api_base })
    }

    /// `{api_base}/api/workflows/{id}/status`, with the id escaped as one segment.
    pub fn status_url(&self, workflow_id: &str) -> Result<Url, PollError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| PollError::InvalidBase(self.api_base.to_string()))?
            .pop_if_empty()
            .extend(["api", "workflows", workflow_id, "status"]);
        Ok(url)
    }
}

#[async_trait]
impl StatusSource for HttpStatusClient {
    async fn fetch_status(&self, workflow_id: &str) -> Result<StatusSnapshot, PollError> {
        let url = self.status_url(workflow_id)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status {
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| PollError::Decode(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// Sent right before the request goes out.
    Issued { workflow_id: String, ticket: u64 },
    Snapshot {
        workflow_id: String,
        ticket: u64,
        snapshot: StatusSnapshot,
        received_at: DateTime<Utc>,
    },
    Failed {
        workflow_id: String,
        ticket: u64,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollControl {
    Active(Duration),
    Stopped,
}

/// Pulls the full status on a fixed cadence until stopped or dropped.
pub struct PollingFallback {
    control: watch::Sender<PollControl>,
    task: JoinHandle<()>,
}

impl PollingFallback {
    pub fn spawn(
        source: Arc<dyn StatusSource>,
        workflow_id: impl Into<String>,
        interval: Duration,
        tx: mpsc::Sender<PollEvent>,
    ) -> Self {
        Self::spawn_with_tickets(source, workflow_id, interval, Arc::default(), tx)
    }

    /// Like [`PollingFallback::spawn`], but draws tickets from `tickets`, so
    /// pollers restarted against the same reconciler never reuse a ticket.
    pub fn spawn_with_tickets(
        source: Arc<dyn StatusSource>,
        workflow_id: impl Into<String>,
        interval: Duration,
        tickets: Arc<AtomicU64>,
        tx: mpsc::Sender<PollEvent>,
    ) -> Self {
        let (control, control_rx) = watch::channel(PollControl::Active(interval));
        let task = tokio::spawn(poll_loop(
            source,
            workflow_id.into(),
            control_rx,
            tickets,
            tx,
        ));
        Self { control, task }
    }

    /// Restarts the cadence with a new period. No-op once stopped.
    pub fn set_interval(&self, interval: Duration) {
        self.control.send_if_modified(|control| match control {
            PollControl::Active(current) if *current != interval => {
                *control = PollControl::Active(interval);
                true
            }
            _ => false,
        });
    }

    pub fn interval(&self) -> Option<Duration> {
        match *self.control.borrow() {
            PollControl::Active(interval) => Some(interval),
            PollControl::Stopped => None,
        }
    }

    /// Stops polling; an in-flight request is abandoned.
    pub fn stop(&self) {
        self.control.send_replace(PollControl::Stopped);
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished() || *self.control.borrow() == PollControl::Stopped
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop(
    source: Arc<dyn StatusSource>,
    workflow_id: String,
    mut control: watch::Receiver<PollControl>,
    tickets: Arc<AtomicU64>,
    tx: mpsc::Sender<PollEvent>,
) {
    loop {
        let period = match *control.borrow_and_update() {
            PollControl::Active(period) => period,
            PollControl::Stopped => {
                debug!(event = "poll_stopped", workflow_id = %workflow_id);
                return;
            }
        };
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ticket = tickets.fetch_add(1, Ordering::SeqCst) + 1;
                    let issued = PollEvent::Issued {
                        workflow_id: workflow_id.clone(),
                        ticket,
                    };
                    if tx.send(issued).await.is_err() {
                        return;
                    }

                    let result = tokio::select! {
                        result = source.fetch_status(&workflow_id) => Some(result),
                        changed = control.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            None
                        }
                    };
                    let Some(result) = result else {
                        break;
                    };

                    let event = match result {
                        Ok(snapshot) => PollEvent::Snapshot {
                            workflow_id: workflow_id.clone(),
                            ticket,
                            snapshot,
                            received_at: Utc::now(),
                        },
                        Err(err) => {
                            warn!(event = "poll_error", workflow_id = %workflow_id, ticket, error = %err);
                            PollEvent::Failed {
                                workflow_id: workflow_id.clone(),
                                ticket,
                                error: err.to_string(),
                            }
                        }
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                changed = control.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}
