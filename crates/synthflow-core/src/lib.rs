//! Shared model, wire protocol and merge logic for the synthflow workflow
//! synchronizer. Nothing in this crate performs IO.

pub mod model;
pub mod pipeline;
pub mod reconciler;
pub mod signal;
pub mod wire;

pub use model::{
    ActivityLogEntry, AgentState, AgentStatus, AgentUpdate, LogLevel, MetricValue, StatusSnapshot,
    TransformationRecord, WorkflowState, WorkflowStatus, WorkflowStatusUpdate,
};
pub use pipeline::{derive_pipeline, EntryOrigin, PipelineEntry, PipelineStage};
pub use reconciler::{
    ApplyOutcome, DropReason, Inbound, MergeSummary, ReconcilerConfig, StateReconciler,
    TerminalPolicy, WorkflowView,
};
pub use signal::{CompletionSignal, NoCompletionSignal, StaticCompletionSignal};
pub use wire::{ChannelEnvelope, ChannelMsg, ClientFrame, FrameError};
