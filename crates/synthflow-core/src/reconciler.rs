//! Folds push events, poll snapshots and the side-channel signal into one
//! canonical [`WorkflowView`].
//!
//! Every accepted input takes the next arrival sequence number. Scalar fields
//! remember the sequence of their last write; a poll snapshot only overwrites a
//! field whose last write arrived before the poll was issued, so a slow pull
//! can never undo a newer push.

use crate::model::{
    ActivityLogEntry, AgentState, AgentUpdate, LogLevel, StatusSnapshot, TransformationRecord,
    WorkflowState, WorkflowStatus, WorkflowStatusUpdate,
};
use crate::pipeline::{derive_pipeline, PipelineEntry};
use crate::signal::CompletionSignal;
use crate::wire::{ChannelEnvelope, ChannelMsg};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_DEDUP_WINDOW: usize = 16;
const MAX_TRACKED_POLL_TICKETS: usize = 64;

/// What to do with workflow updates that arrive after a terminal status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalPolicy {
    /// Keep applying late updates (allows late correction).
    Apply,
    /// Ignore workflow scalar changes once terminal.
    Freeze,
}

impl Default for TerminalPolicy {
    fn default() -> Self {
        Self::Apply
    }
}

impl TerminalPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalPolicy::Apply => "apply",
            TerminalPolicy::Freeze => "freeze",
        }
    }
}

impl fmt::Display for TerminalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminalPolicy {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "apply" => Ok(TerminalPolicy::Apply),
            "freeze" => Ok(TerminalPolicy::Freeze),
            other => Err(format!("Unknown terminal policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub terminal_policy: TerminalPolicy,
    /// How many trailing entries a single appended entry is compared against.
    pub dedup_window: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            terminal_policy: TerminalPolicy::default(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct WorkflowView {
    pub workflow: WorkflowState,
    pub agents: BTreeMap<String, AgentState>,
    pub pipeline: Vec<PipelineEntry>,
    pub transformations: Vec<TransformationRecord>,
    pub activity_log: Vec<ActivityLogEntry>,
}

impl WorkflowView {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow: WorkflowState::new(workflow_id),
            ..Self::default()
        }
    }

    /// Newest `limit` transformations, oldest first.
    pub fn recent_transformations(&self, limit: usize) -> &[TransformationRecord] {
        let start = self.transformations.len().saturating_sub(limit);
        &self.transformations[start..]
    }

    pub fn latest_error(&self) -> Option<&str> {
        self.workflow.error.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Channel(ChannelEnvelope),
    /// Marks the arrival position at which a pull request was sent.
    PollIssued { workflow_id: String, ticket: u64 },
    Poll {
        workflow_id: String,
        ticket: Option<u64>,
        snapshot: StatusSnapshot,
    },
    /// Re-read the side-channel signal and re-derive the pipeline.
    SignalRefresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    MissingWorkflowId,
    ForeignWorkflow(String),
    Empty { kind: &'static str },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::MissingWorkflowId => f.write_str("payload has no workflow id"),
            DropReason::ForeignWorkflow(id) => write!(f, "payload belongs to workflow {id}"),
            DropReason::Empty { kind } => write!(f, "{kind} payload has no mergeable field"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub changed: bool,
    pub pipeline_changed: bool,
    pub transition: Option<StatusTransition>,
    /// Poll values skipped because a newer write already landed.
    pub stale_fields: usize,
    /// Workflow values ignored under [`TerminalPolicy::Freeze`].
    pub frozen_fields: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(MergeSummary),
    Dropped(DropReason),
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(summary) if summary.changed)
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, ApplyOutcome::Dropped(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FieldKey {
    Workflow(&'static str),
    Agent(String, &'static str),
    Metric(String, String),
}

pub struct StateReconciler {
    config: ReconcilerConfig,
    view: WorkflowView,
    seq: u64,
    stamps: HashMap<FieldKey, u64>,
    poll_tickets: BTreeMap<u64, u64>,
    /// Error entry added locally on the last transition into `failed`, until
    /// the backend's own entry for the same failure shows up.
    synthesized_failure: Option<ActivityLogEntry>,
    signal: Arc<dyn CompletionSignal>,
}

impl StateReconciler {
    pub fn new(
        workflow_id: impl Into<String>,
        config: ReconcilerConfig,
        signal: Arc<dyn CompletionSignal>,
    ) -> Self {
        let config = ReconcilerConfig {
            dedup_window: config.dedup_window.max(1),
            ..config
        };
        let mut reconciler = Self {
            config,
            view: WorkflowView::new(workflow_id),
            seq: 0,
            stamps: HashMap::new(),
            poll_tickets: BTreeMap::new(),
            synthesized_failure: None,
            signal,
        };
        reconciler.rederive_pipeline();
        reconciler
    }

    pub fn workflow_id(&self) -> &str {
        &self.view.workflow.id
    }

    pub fn status(&self) -> WorkflowStatus {
        self.view.workflow.status
    }

    pub fn view(&self) -> &WorkflowView {
        &self.view
    }

    pub fn into_view(self) -> WorkflowView {
        self.view
    }

    pub fn config(&self) -> ReconcilerConfig {
        self.config
    }

    pub fn apply(&mut self, inbound: Inbound, received_at: DateTime<Utc>) -> ApplyOutcome {
        match inbound {
            Inbound::Channel(envelope) => self.apply_envelope(envelope, received_at),
            Inbound::PollIssued {
                workflow_id,
                ticket,
            } => {
                if let Err(reason) = self.filter(Some(&workflow_id)) {
                    return ApplyOutcome::Dropped(reason);
                }
                let now = self.advance();
                self.poll_tickets.entry(ticket).or_insert(now);
                while self.poll_tickets.len() > MAX_TRACKED_POLL_TICKETS {
                    self.poll_tickets.pop_first();
                }
                ApplyOutcome::Applied(MergeSummary::default())
            }
            Inbound::Poll {
                workflow_id,
                ticket,
                snapshot,
            } => {
                if let Err(reason) = self
                    .filter(Some(&workflow_id))
                    .and_then(|_| match snapshot.workflow_id.as_deref() {
                        Some(claimed) => self.filter(Some(claimed)),
                        None => Ok(()),
                    })
                {
                    return ApplyOutcome::Dropped(reason);
                }
                if snapshot.is_empty() {
                    return ApplyOutcome::Dropped(DropReason::Empty {
                        kind: "status_snapshot",
                    });
                }
                let now = self.advance();
                let floor = ticket
                    .and_then(|ticket| self.poll_tickets.get(&ticket).copied())
                    .unwrap_or(now);
                ApplyOutcome::Applied(self.merge_snapshot(&snapshot, floor, now, received_at))
            }
            Inbound::SignalRefresh => {
                self.advance();
                let mut summary = MergeSummary::default();
                self.finish(&mut summary, true);
                ApplyOutcome::Applied(summary)
            }
        }
    }

    fn apply_envelope(&mut self, envelope: ChannelEnvelope, received_at: DateTime<Utc>) -> ApplyOutcome {
        if let Err(reason) = self.filter(envelope.workflow_id.as_deref()) {
            return ApplyOutcome::Dropped(reason);
        }
        let window = self.config.dedup_window;
        let mut summary = MergeSummary::default();
        match envelope.msg {
            ChannelMsg::WorkflowStatus(update) => {
                if update.is_empty() {
                    return ApplyOutcome::Dropped(DropReason::Empty {
                        kind: "workflow_status",
                    });
                }
                let now = self.advance();
                let stages_changed = self.merge_workflow(&update, now, now, received_at, &mut summary);
                self.finish(&mut summary, stages_changed);
            }
            ChannelMsg::AgentUpdate(update) => {
                if update.agent_id.trim().is_empty() || update.is_empty() {
                    return ApplyOutcome::Dropped(DropReason::Empty {
                        kind: "agent_update",
                    });
                }
                let now = self.advance();
                self.merge_agent(&update, now, now, &mut summary);
                self.finish(&mut summary, true);
            }
            ChannelMsg::DataTransformation(record) => {
                if record.is_empty() {
                    return ApplyOutcome::Dropped(DropReason::Empty {
                        kind: "data_transformation",
                    });
                }
                self.advance();
                let added = append_deduplicated(
                    &mut self.view.transformations,
                    std::slice::from_ref(&record),
                    window,
                );
                summary.changed = added > 0;
            }
            ChannelMsg::AgentLog(entry) => {
                if entry.message.trim().is_empty() {
                    return ApplyOutcome::Dropped(DropReason::Empty { kind: "agent_log" });
                }
                self.advance();
                summary.changed = self.merge_activity(std::slice::from_ref(&entry)) > 0;
            }
        }
        ApplyOutcome::Applied(summary)
    }

    fn merge_snapshot(
        &mut self,
        snapshot: &StatusSnapshot,
        floor: u64,
        now: u64,
        received_at: DateTime<Utc>,
    ) -> MergeSummary {
        let mut summary = MergeSummary::default();
        // Persisted entries go first so a failure the backend already logged
        // is not logged again locally.
        if self.merge_activity(&snapshot.logs) > 0 {
            summary.changed = true;
        }
        let stages_changed = self.merge_workflow(&snapshot.state, floor, now, received_at, &mut summary);
        let mut agents_touched = false;
        for agent in &snapshot.agents {
            if agent.agent_id.trim().is_empty() {
                continue;
            }
            self.merge_agent(agent, floor, now, &mut summary);
            agents_touched = true;
        }
        self.finish(&mut summary, stages_changed || agents_touched);
        summary
    }

    /// Returns true when `stages_completed` grew.
    fn merge_workflow(
        &mut self,
        update: &WorkflowStatusUpdate,
        floor: u64,
        now: u64,
        received_at: DateTime<Utc>,
        summary: &mut MergeSummary,
    ) -> bool {
        let previous = self.view.workflow.status;
        let frozen =
            self.config.terminal_policy == TerminalPolicy::Freeze && previous.is_terminal();
        let workflow = &mut self.view.workflow;

        {
            let mut writer = ScalarWriter {
                stamps: &mut self.stamps,
                floor,
                now,
                frozen,
                summary: &mut *summary,
            };
            if let Some(status) = update.status {
                writer.write(FieldKey::Workflow("status"), &mut workflow.status, status);
            }
            if let Some(progress) = update.progress {
                writer.write(
                    FieldKey::Workflow("progress"),
                    &mut workflow.progress,
                    clamp_progress(progress),
                );
            }
            if let Some(stage) = &update.current_stage {
                writer.write(
                    FieldKey::Workflow("current_stage"),
                    &mut workflow.current_stage,
                    Some(stage.clone()),
                );
            }
            if let Some(error) = &update.error {
                writer.write(
                    FieldKey::Workflow("error"),
                    &mut workflow.error,
                    Some(error.clone()),
                );
            }
        }

        if let Some(cost) = update.cost_accrued {
            if cost.is_finite() && cost > workflow.cost_accrued {
                if frozen {
                    summary.frozen_fields += 1;
                } else {
                    workflow.cost_accrued = cost;
                    summary.changed = true;
                }
            }
        }

        let mut stages_changed = false;
        if let Some(stages) = &update.stages_completed {
            for stage in stages {
                let stage = stage.trim();
                if stage.is_empty() || workflow.has_completed(stage) {
                    continue;
                }
                workflow.stages_completed.push(stage.to_string());
                stages_changed = true;
            }
        }
        if stages_changed {
            summary.changed = true;
        }

        if workflow.status != previous {
            summary.transition = Some(StatusTransition {
                from: previous,
                to: workflow.status,
            });
            if workflow.status == WorkflowStatus::Failed {
                let message = workflow
                    .error
                    .clone()
                    .unwrap_or_else(|| "workflow failed".to_string());
                let log = &mut self.view.activity_log;
                let start = log.len().saturating_sub(self.config.dedup_window);
                let already_logged = log[start..]
                    .iter()
                    .any(|entry| entry.level == LogLevel::Error && entry.message == message);
                if !already_logged {
                    let entry =
                        ActivityLogEntry::new(received_at.to_rfc3339(), LogLevel::Error, message);
                    log.push(entry.clone());
                    self.synthesized_failure = Some(entry);
                }
            }
        }

        stages_changed
    }

    fn merge_agent(
        &mut self,
        update: &AgentUpdate,
        floor: u64,
        now: u64,
        summary: &mut MergeSummary,
    ) {
        let window = self.config.dedup_window;
        let agent_id = update.agent_id.as_str();
        if !self.view.agents.contains_key(agent_id) {
            self.view
                .agents
                .insert(agent_id.to_string(), AgentState::new(agent_id));
            summary.changed = true;
        }
        let Some(agent) = self.view.agents.get_mut(agent_id) else {
            return;
        };

        {
            let mut writer = ScalarWriter {
                stamps: &mut self.stamps,
                floor,
                now,
                frozen: false,
                summary: &mut *summary,
            };
            if let Some(agent_type) = &update.agent_type {
                writer.write(
                    FieldKey::Agent(agent_id.to_string(), "type"),
                    &mut agent.agent_type,
                    agent_type.clone(),
                );
            }
            if let Some(status) = update.status {
                writer.write(
                    FieldKey::Agent(agent_id.to_string(), "status"),
                    &mut agent.status,
                    status,
                );
            }
            if let Some(progress) = update.progress {
                writer.write(
                    FieldKey::Agent(agent_id.to_string(), "progress"),
                    &mut agent.progress,
                    clamp_progress(progress),
                );
            }
            if let Some(operation) = &update.current_operation {
                writer.write(
                    FieldKey::Agent(agent_id.to_string(), "current_operation"),
                    &mut agent.current_operation,
                    Some(operation.clone()),
                );
            }
            if let Some(message) = &update.message {
                writer.write(
                    FieldKey::Agent(agent_id.to_string(), "message"),
                    &mut agent.message,
                    Some(message.clone()),
                );
            }
            for (name, value) in &update.metrics {
                let key = FieldKey::Metric(agent_id.to_string(), name.clone());
                if !agent.metrics.contains_key(name) {
                    writer.stamp(key);
                    agent.metrics.insert(name.clone(), value.clone());
                    writer.summary.changed = true;
                } else if let Some(slot) = agent.metrics.get_mut(name) {
                    writer.write(key, slot, value.clone());
                }
            }
        }

        let added = append_deduplicated(&mut agent.logs, &update.logs, window)
            + append_deduplicated(&mut agent.decisions, &update.decisions, window);
        if added > 0 {
            summary.changed = true;
        }
    }

    /// Appends activity entries. A backend error entry repeating the locally
    /// added failure entry takes that entry's place instead of being appended.
    fn merge_activity(&mut self, incoming: &[ActivityLogEntry]) -> usize {
        let window = self.config.dedup_window;
        let Some(local) = self.synthesized_failure.take() else {
            return append_deduplicated(&mut self.view.activity_log, incoming, window);
        };
        let echo = incoming
            .iter()
            .position(|entry| entry.level == LogLevel::Error && entry.message == local.message);
        let slot = self
            .view
            .activity_log
            .iter()
            .rposition(|entry| *entry == local);
        match (echo, slot) {
            (Some(echo), Some(slot)) => {
                let mut rest = incoming.to_vec();
                let backend_entry = rest.remove(echo);
                let replaced = usize::from(self.view.activity_log[slot] != backend_entry);
                self.view.activity_log[slot] = backend_entry;
                replaced + append_deduplicated(&mut self.view.activity_log, &rest, window)
            }
            (None, Some(_)) => {
                self.synthesized_failure = Some(local);
                append_deduplicated(&mut self.view.activity_log, incoming, window)
            }
            (_, None) => append_deduplicated(&mut self.view.activity_log, incoming, window),
        }
    }

    fn finish(&mut self, summary: &mut MergeSummary, rederive: bool) {
        if rederive && self.rederive_pipeline() {
            summary.pipeline_changed = true;
            summary.changed = true;
        }
    }

    fn rederive_pipeline(&mut self) -> bool {
        let flag = self
            .signal
            .has_external_completion_signal(&self.view.workflow.id);
        let derivation = derive_pipeline(
            &self.view.workflow.stages_completed,
            &self.view.agents,
            flag,
        );

        let mut changed = false;
        for stage in derivation.inferred_completions {
            if !self.view.workflow.has_completed(stage.as_str()) {
                self.view
                    .workflow
                    .stages_completed
                    .push(stage.as_str().to_string());
                changed = true;
            }
        }
        if derivation.entries != self.view.pipeline {
            self.view.pipeline = derivation.entries;
            changed = true;
        }
        changed
    }

    fn filter(&self, workflow_id: Option<&str>) -> Result<(), DropReason> {
        match workflow_id.map(str::trim) {
            None | Some("") => Err(DropReason::MissingWorkflowId),
            Some(id) if id == self.view.workflow.id => Ok(()),
            Some(id) => Err(DropReason::ForeignWorkflow(id.to_string())),
        }
    }

    fn advance(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

struct ScalarWriter<'a> {
    stamps: &'a mut HashMap<FieldKey, u64>,
    floor: u64,
    now: u64,
    frozen: bool,
    summary: &'a mut MergeSummary,
}

impl ScalarWriter<'_> {
    fn write<T: PartialEq>(&mut self, key: FieldKey, slot: &mut T, value: T) {
        if *slot == value {
            if !self.frozen && !self.is_stale(&key) {
                self.stamp(key);
            }
            return;
        }
        if self.frozen {
            self.summary.frozen_fields += 1;
            return;
        }
        if self.is_stale(&key) {
            self.summary.stale_fields += 1;
            return;
        }
        self.stamp(key);
        *slot = value;
        self.summary.changed = true;
    }

    fn stamp(&mut self, key: FieldKey) {
        self.stamps.insert(key, self.now);
    }

    fn is_stale(&self, key: &FieldKey) -> bool {
        self.stamps
            .get(key)
            .is_some_and(|stamp| *stamp > self.floor)
    }
}

fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Appends `incoming` to `existing`, skipping redelivered entries.
///
/// A single entry is compared against the last `window` entries only. A batch
/// (a persisted log array, an agent's full log) is aligned against the whole
/// sequence as a multiset, so the same batch delivered twice appends nothing.
pub fn append_deduplicated<T: PartialEq + Clone>(
    existing: &mut Vec<T>,
    incoming: &[T],
    window: usize,
) -> usize {
    match incoming {
        [] => 0,
        [single] => {
            let start = existing.len().saturating_sub(window.max(1));
            if existing[start..].contains(single) {
                0
            } else {
                existing.push(single.clone());
                1
            }
        }
        batch => {
            let mut consumed = vec![false; existing.len()];
            let mut fresh = Vec::new();
            for item in batch {
                let matched = existing
                    .iter()
                    .enumerate()
                    .position(|(idx, current)| !consumed[idx] && current == item);
                match matched {
                    Some(idx) => consumed[idx] = true,
                    None => fresh.push(item.clone()),
                }
            }
            let added = fresh.len();
            existing.extend(fresh);
            added
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentStatus, MetricValue};
    use crate::pipeline::{EntryOrigin, PipelineStage};
    use crate::signal::{NoCompletionSignal, StaticCompletionSignal};
    use chrono::TimeZone;

    const TARGET: &str = "wf_target";

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_792_224_000 + offset_secs, 0)
            .single()
            .expect("valid timestamp")
    }

    fn reconciler() -> StateReconciler {
        StateReconciler::new(TARGET, ReconcilerConfig::default(), Arc::new(NoCompletionSignal))
    }

    fn push(msg: ChannelMsg) -> Inbound {
        Inbound::Channel(ChannelEnvelope::new(TARGET, msg))
    }

    fn agent_status(agent_id: &str, status: AgentStatus) -> Inbound {
        push(ChannelMsg::AgentUpdate(AgentUpdate {
            status: Some(status),
            ..AgentUpdate::new(agent_id)
        }))
    }

    fn workflow_status(status: WorkflowStatus, error: Option<&str>) -> Inbound {
        push(ChannelMsg::WorkflowStatus(WorkflowStatusUpdate {
            status: Some(status),
            error: error.map(str::to_string),
            ..WorkflowStatusUpdate::default()
        }))
    }

    fn poll(ticket: Option<u64>, snapshot: StatusSnapshot) -> Inbound {
        Inbound::Poll {
            workflow_id: TARGET.to_string(),
            ticket,
            snapshot,
        }
    }

    #[test]
    fn stale_poll_does_not_regress_pushed_agent_status() {
        let mut rec = reconciler();
        rec.apply(
            Inbound::PollIssued {
                workflow_id: TARGET.to_string(),
                ticket: 1,
            },
            ts(0),
        );
        rec.apply(agent_status("synthetic_data", AgentStatus::Completed), ts(1));
        let stale = StatusSnapshot {
            agents: vec![AgentUpdate {
                status: Some(AgentStatus::Running),
                ..AgentUpdate::new("synthetic_data")
            }],
            ..StatusSnapshot::default()
        };
        let outcome = rec.apply(poll(Some(1), stale), ts(2));

        assert_eq!(
            rec.view().agents["synthetic_data"].status,
            AgentStatus::Completed
        );
        match outcome {
            ApplyOutcome::Applied(summary) => assert_eq!(summary.stale_fields, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn poll_issued_after_push_wins_by_arrival_order() {
        let mut rec = reconciler();
        rec.apply(agent_status("synthetic_data", AgentStatus::Completed), ts(0));
        rec.apply(
            Inbound::PollIssued {
                workflow_id: TARGET.to_string(),
                ticket: 4,
            },
            ts(1),
        );
        let newer = StatusSnapshot {
            agents: vec![AgentUpdate {
                status: Some(AgentStatus::Running),
                ..AgentUpdate::new("synthetic_data")
            }],
            ..StatusSnapshot::default()
        };
        rec.apply(poll(Some(4), newer), ts(2));
        assert_eq!(
            rec.view().agents["synthetic_data"].status,
            AgentStatus::Running
        );
    }

    #[test]
    fn older_poll_response_loses_to_newer_poll() {
        let mut rec = reconciler();
        for ticket in [1, 2] {
            rec.apply(
                Inbound::PollIssued {
                    workflow_id: TARGET.to_string(),
                    ticket,
                },
                ts(0),
            );
        }
        let progress = |value: f64| StatusSnapshot {
            state: WorkflowStatusUpdate {
                progress: Some(value),
                ..WorkflowStatusUpdate::default()
            },
            ..StatusSnapshot::default()
        };
        rec.apply(poll(Some(2), progress(60.0)), ts(1));
        rec.apply(poll(Some(1), progress(40.0)), ts(2));
        assert_eq!(rec.view().workflow.progress, 60.0);
    }

    #[test]
    fn foreign_workflow_payload_changes_nothing() {
        let mut rec = reconciler();
        rec.apply(workflow_status(WorkflowStatus::Running, None), ts(0));
        let before = rec.view().clone();

        let foreign = Inbound::Channel(ChannelEnvelope::new(
            "wf_other",
            ChannelMsg::WorkflowStatus(WorkflowStatusUpdate {
                status: Some(WorkflowStatus::Completed),
                stages_completed: Some(vec!["data_processing".to_string()]),
                ..WorkflowStatusUpdate::default()
            }),
        ));
        let outcome = rec.apply(foreign, ts(1));

        assert_eq!(
            outcome,
            ApplyOutcome::Dropped(DropReason::ForeignWorkflow("wf_other".to_string()))
        );
        assert_eq!(rec.view(), &before);
    }

    #[test]
    fn snapshot_claiming_other_workflow_is_dropped() {
        let mut rec = reconciler();
        let snapshot = StatusSnapshot {
            workflow_id: Some("wf_other".to_string()),
            state: WorkflowStatusUpdate {
                progress: Some(90.0),
                ..WorkflowStatusUpdate::default()
            },
            ..StatusSnapshot::default()
        };
        assert!(rec.apply(poll(None, snapshot), ts(0)).is_dropped());
        assert_eq!(rec.view().workflow.progress, 0.0);
    }

    #[test]
    fn missing_workflow_id_and_empty_payloads_are_dropped() {
        let mut rec = reconciler();
        let anonymous = Inbound::Channel(ChannelEnvelope {
            workflow_id: None,
            timestamp: None,
            msg: ChannelMsg::AgentLog(ActivityLogEntry::new("", LogLevel::Info, "hi")),
        });
        assert_eq!(
            rec.apply(anonymous, ts(0)),
            ApplyOutcome::Dropped(DropReason::MissingWorkflowId)
        );

        let empty = push(ChannelMsg::WorkflowStatus(WorkflowStatusUpdate::default()));
        assert_eq!(
            rec.apply(empty, ts(1)),
            ApplyOutcome::Dropped(DropReason::Empty {
                kind: "workflow_status"
            })
        );
        let bare_agent = push(ChannelMsg::AgentUpdate(AgentUpdate::new("synthetic_data")));
        assert!(rec.apply(bare_agent, ts(2)).is_dropped());
        assert!(rec.view().agents.is_empty());
    }

    #[test]
    fn failed_status_surfaces_error_in_activity_log_once() {
        let mut rec = reconciler();
        let failed = workflow_status(WorkflowStatus::Failed, Some("generator crashed"));
        let outcome = rec.apply(failed.clone(), ts(0));
        rec.apply(failed, ts(1));

        match outcome {
            ApplyOutcome::Applied(summary) => assert_eq!(
                summary.transition,
                Some(StatusTransition {
                    from: WorkflowStatus::Running,
                    to: WorkflowStatus::Failed,
                })
            ),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(rec.view().latest_error(), Some("generator crashed"));
        let errors: Vec<_> = rec
            .view()
            .activity_log
            .iter()
            .filter(|entry| entry.level == LogLevel::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "generator crashed");
    }

    #[test]
    fn failed_snapshot_with_persisted_error_logs_failure_once() {
        let mut rec = reconciler();
        let backend_entry =
            ActivityLogEntry::new("2026-10-17T10:00:00.421274Z", LogLevel::Error, "generator crashed");
        let snapshot = StatusSnapshot {
            state: WorkflowStatusUpdate {
                status: Some(WorkflowStatus::Failed),
                error: Some("generator crashed".to_string()),
                ..WorkflowStatusUpdate::default()
            },
            logs: vec![backend_entry.clone()],
            ..StatusSnapshot::default()
        };
        rec.apply(poll(None, snapshot.clone()), ts(0));
        rec.apply(poll(None, snapshot), ts(1));

        assert_eq!(rec.status(), WorkflowStatus::Failed);
        assert_eq!(rec.view().activity_log, vec![backend_entry]);
    }

    #[test]
    fn backend_error_entry_replaces_locally_added_failure_entry() {
        let mut rec = reconciler();
        rec.apply(
            push(ChannelMsg::AgentLog(ActivityLogEntry::new(
                "2026-10-17T09:59:00Z",
                LogLevel::Info,
                "batch 3 done",
            ))),
            ts(0),
        );
        rec.apply(
            workflow_status(WorkflowStatus::Failed, Some("generator crashed")),
            ts(1),
        );
        assert_eq!(rec.view().activity_log.len(), 2);

        let backend_entry =
            ActivityLogEntry::new("2026-10-17T10:00:00.421274Z", LogLevel::Error, "generator crashed");
        let snapshot = StatusSnapshot {
            state: WorkflowStatusUpdate {
                status: Some(WorkflowStatus::Failed),
                ..WorkflowStatusUpdate::default()
            },
            logs: vec![
                ActivityLogEntry::new("2026-10-17T09:59:00Z", LogLevel::Info, "batch 3 done"),
                backend_entry.clone(),
            ],
            ..StatusSnapshot::default()
        };
        let outcome = rec.apply(poll(None, snapshot.clone()), ts(2));
        assert!(outcome.changed());
        let settled = rec.view().clone();
        let again = rec.apply(poll(None, snapshot), ts(3));

        assert!(!again.changed());
        assert_eq!(rec.view(), &settled);
        let errors: Vec<_> = settled
            .activity_log
            .iter()
            .filter(|entry| entry.level == LogLevel::Error)
            .collect();
        assert_eq!(errors, vec![&backend_entry]);
        assert_eq!(settled.activity_log.len(), 2);
    }

    #[test]
    fn late_update_after_terminal_is_applied_by_default() {
        let mut rec = reconciler();
        rec.apply(workflow_status(WorkflowStatus::Completed, None), ts(0));
        rec.apply(workflow_status(WorkflowStatus::Running, None), ts(1));
        assert_eq!(rec.status(), WorkflowStatus::Running);
    }

    #[test]
    fn freeze_policy_ignores_workflow_scalars_after_terminal() {
        let config = ReconcilerConfig {
            terminal_policy: TerminalPolicy::Freeze,
            ..ReconcilerConfig::default()
        };
        let mut rec = StateReconciler::new(TARGET, config, Arc::new(NoCompletionSignal));
        rec.apply(workflow_status(WorkflowStatus::Aborted, None), ts(0));

        let late = push(ChannelMsg::WorkflowStatus(WorkflowStatusUpdate {
            status: Some(WorkflowStatus::Running),
            progress: Some(55.0),
            stages_completed: Some(vec!["data_processing".to_string()]),
            ..WorkflowStatusUpdate::default()
        }));
        let outcome = rec.apply(late, ts(1));

        assert_eq!(rec.status(), WorkflowStatus::Aborted);
        assert_eq!(rec.view().workflow.progress, 0.0);
        assert_eq!(rec.view().workflow.stages_completed, vec!["data_processing"]);
        match outcome {
            ApplyOutcome::Applied(summary) => assert_eq!(summary.frozen_fields, 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn stages_are_unioned_and_never_shrink() {
        let mut rec = reconciler();
        let stages = |labels: &[&str]| {
            push(ChannelMsg::WorkflowStatus(WorkflowStatusUpdate {
                stages_completed: Some(labels.iter().map(|s| s.to_string()).collect()),
                ..WorkflowStatusUpdate::default()
            }))
        };
        rec.apply(stages(&["data_processing", "synthetic_generation"]), ts(0));
        rec.apply(stages(&["data_processing"]), ts(1));
        rec.apply(stages(&["test_case", "synthetic_generation"]), ts(2));

        assert_eq!(
            rec.view().workflow.stages_completed,
            vec!["data_processing", "synthetic_generation", "test_case"]
        );
    }

    #[test]
    fn cost_never_decreases() {
        let mut rec = reconciler();
        let cost = |value: f64| {
            push(ChannelMsg::WorkflowStatus(WorkflowStatusUpdate {
                cost_accrued: Some(value),
                ..WorkflowStatusUpdate::default()
            }))
        };
        rec.apply(cost(2.5), ts(0));
        rec.apply(cost(1.0), ts(1));
        assert_eq!(rec.view().workflow.cost_accrued, 2.5);
        rec.apply(cost(3.0), ts(2));
        assert_eq!(rec.view().workflow.cost_accrued, 3.0);
    }

    #[test]
    fn progress_is_clamped() {
        let mut rec = reconciler();
        rec.apply(
            push(ChannelMsg::WorkflowStatus(WorkflowStatusUpdate {
                progress: Some(140.0),
                ..WorkflowStatusUpdate::default()
            })),
            ts(0),
        );
        assert_eq!(rec.view().workflow.progress, 100.0);
    }

    #[test]
    fn side_channel_signal_infers_distribution_once() {
        let signal = Arc::new(StaticCompletionSignal::new([TARGET]));
        let mut rec = StateReconciler::new(TARGET, ReconcilerConfig::default(), signal);
        let update = push(ChannelMsg::WorkflowStatus(WorkflowStatusUpdate {
            stages_completed: Some(vec![
                "data_processing".to_string(),
                "synthetic_generation".to_string(),
            ]),
            ..WorkflowStatusUpdate::default()
        }));
        rec.apply(update.clone(), ts(0));
        let first = rec.view().clone();
        rec.apply(update, ts(1));
        rec.apply(Inbound::SignalRefresh, ts(2));

        assert_eq!(rec.view(), &first);
        assert_eq!(first.pipeline.len(), 3);
        assert_eq!(first.pipeline[2].stage, PipelineStage::Distribution);
        assert_eq!(first.pipeline[2].origin, EntryOrigin::Inferred);
        let distribution = first
            .workflow
            .stages_completed
            .iter()
            .filter(|stage| stage.as_str() == "distribution")
            .count();
        assert_eq!(distribution, 1);
    }

    #[test]
    fn reported_agent_replaces_inferred_entry() {
        let signal = Arc::new(StaticCompletionSignal::new([TARGET]));
        let mut rec = StateReconciler::new(TARGET, ReconcilerConfig::default(), signal);
        assert!(rec.view().pipeline[0].is_inferred());

        rec.apply(agent_status("distribution", AgentStatus::Completed), ts(0));
        let entry = &rec.view().pipeline[0];
        assert_eq!(entry.origin, EntryOrigin::Reported);
        assert_eq!(entry.agent_id.as_deref(), Some("distribution"));
    }

    #[test]
    fn redelivered_agent_update_is_idempotent() {
        let mut rec = reconciler();
        let update = push(ChannelMsg::AgentUpdate(AgentUpdate {
            status: Some(AgentStatus::Running),
            logs: vec!["fitting".to_string(), "sampling".to_string()],
            metrics: BTreeMap::from([("rows".to_string(), MetricValue::Number(10.0))]),
            ..AgentUpdate::new("synthetic_data")
        }));
        rec.apply(update.clone(), ts(0));
        let once = rec.view().clone();
        let outcome = rec.apply(update, ts(1));

        assert_eq!(rec.view(), &once);
        assert!(!outcome.changed());
    }

    #[test]
    fn polled_log_batches_align_with_pushed_entries() {
        let mut rec = reconciler();
        let entry = |msg: &str| ActivityLogEntry::new("2026-10-17T10:00:00Z", LogLevel::Info, msg);
        rec.apply(push(ChannelMsg::AgentLog(entry("b"))), ts(0));

        let snapshot = StatusSnapshot {
            logs: vec![entry("a"), entry("b"), entry("c")],
            ..StatusSnapshot::default()
        };
        rec.apply(poll(None, snapshot.clone()), ts(1));
        rec.apply(poll(None, snapshot), ts(2));

        let messages: Vec<&str> = rec
            .view()
            .activity_log
            .iter()
            .map(|entry| entry.message.as_str())
            .collect();
        assert_eq!(messages, vec!["b", "a", "c"]);
    }

    #[test]
    fn single_entry_dedup_only_looks_at_recent_window() {
        let mut log = vec![1, 2, 3, 4];
        assert_eq!(append_deduplicated(&mut log, &[4], 2), 0);
        assert_eq!(append_deduplicated(&mut log, &[1], 2), 1);
        assert_eq!(log, vec![1, 2, 3, 4, 1]);
        assert_eq!(append_deduplicated(&mut log, &[1, 1, 5], 2), 1);
        assert_eq!(log, vec![1, 2, 3, 4, 1, 5]);
    }

    #[test]
    fn metrics_are_last_write_wins_per_key() {
        let mut rec = reconciler();
        let metrics = |pairs: &[(&str, MetricValue)]| {
            push(ChannelMsg::AgentUpdate(AgentUpdate {
                metrics: pairs
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.clone()))
                    .collect(),
                ..AgentUpdate::new("test_executor")
            }))
        };
        rec.apply(
            metrics(&[
                ("passed", MetricValue::Number(3.0)),
                ("suite", MetricValue::Text("smoke".to_string())),
            ]),
            ts(0),
        );
        rec.apply(metrics(&[("passed", MetricValue::Number(7.0))]), ts(1));

        let agent = &rec.view().agents["test_executor"];
        assert_eq!(agent.metrics["passed"], MetricValue::Number(7.0));
        assert_eq!(agent.metrics["suite"], MetricValue::Text("smoke".to_string()));
    }

    #[test]
    fn transformations_append_and_truncate_for_display() {
        let mut rec = reconciler();
        for idx in 0..5 {
            let record = TransformationRecord {
                transformation_type: format!("step-{idx}"),
                ..TransformationRecord::default()
            };
            rec.apply(push(ChannelMsg::DataTransformation(record)), ts(idx));
        }
        let recent = rec.view().recent_transformations(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].transformation_type, "step-3");
        assert_eq!(rec.view().transformations.len(), 5);
    }

    #[test]
    fn terminal_policy_parses_from_config_strings() {
        assert_eq!("Freeze".parse::<TerminalPolicy>(), Ok(TerminalPolicy::Freeze));
        assert_eq!(" apply ".parse::<TerminalPolicy>(), Ok(TerminalPolicy::Apply));
        assert!("lock".parse::<TerminalPolicy>().is_err());
    }
}
