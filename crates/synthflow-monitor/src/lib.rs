//! Client side of the workflow synchronizer: push channel, polling fallback and
//! the per-workflow session that feeds both into the reconciler.

pub mod channel;
pub mod config;
pub mod logging;
pub mod poller;
pub mod render;
pub mod session;

pub use channel::{ChannelConfig, ChannelError, ConnectionState, TelemetryChannel};
pub use poller::{HttpStatusClient, PollError, PollEvent, PollingFallback, StatusSource};
pub use session::{Monitor, SessionConfig, SessionView, SourceHealth, WorkflowSession};
