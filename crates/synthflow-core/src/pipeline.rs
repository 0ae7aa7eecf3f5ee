//! Pipeline ordering policy.
//!
//! Rebuilds the rendering-ordered stage list from scratch on every call, so the
//! inferred distribution entry can never be spliced in twice.

use crate::model::AgentState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    DataProcessing,
    SyntheticGeneration,
    Distribution,
    TestCase,
    TestExecution,
}

/// Canonical execution order.
pub const CANONICAL_STAGES: [PipelineStage; 5] = [
    PipelineStage::DataProcessing,
    PipelineStage::SyntheticGeneration,
    PipelineStage::Distribution,
    PipelineStage::TestCase,
    PipelineStage::TestExecution,
];

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::DataProcessing => "data_processing",
            PipelineStage::SyntheticGeneration => "synthetic_generation",
            PipelineStage::Distribution => "distribution",
            PipelineStage::TestCase => "test_case",
            PipelineStage::TestExecution => "test_execution",
        }
    }

    pub fn position(&self) -> usize {
        CANONICAL_STAGES
            .iter()
            .position(|stage| stage == self)
            .unwrap_or(CANONICAL_STAGES.len())
    }

    /// Resolve a `stages_completed` label.
    pub fn from_label(label: &str) -> Option<Self> {
        match normalize_label(label).as_str() {
            "data_processing" | "data_processor" => Some(PipelineStage::DataProcessing),
            "synthetic_generation" | "synthetic_data" => Some(PipelineStage::SyntheticGeneration),
            "distribution" | "distribution_analysis" => Some(PipelineStage::Distribution),
            "test_case" | "test_cases" | "test_case_generation" => Some(PipelineStage::TestCase),
            "test_execution" | "test_executor" => Some(PipelineStage::TestExecution),
            _ => None,
        }
    }

    /// Resolve the stage an agent reports for, by id first and then by type.
    pub fn from_agent(agent_id: &str, agent_type: &str) -> Option<Self> {
        Self::from_agent_key(agent_id).or_else(|| Self::from_agent_key(agent_type))
    }

    fn from_agent_key(key: &str) -> Option<Self> {
        match normalize_label(key).as_str() {
            "data_processor" | "data_processing" => Some(PipelineStage::DataProcessing),
            "synthetic_data" | "synthetic_generator" | "synthetic_generation" | "sdv" => {
                Some(PipelineStage::SyntheticGeneration)
            }
            "distribution" | "distribution_analyzer" => Some(PipelineStage::Distribution),
            "test_case_generator" | "test_case" | "test_cases" => Some(PipelineStage::TestCase),
            "test_executor" | "test_execution" => Some(PipelineStage::TestExecution),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::from_label(input).ok_or_else(|| format!("Unknown pipeline stage: {input}"))
    }
}

fn normalize_label(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|ch| match ch {
            '-' | ' ' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrigin {
    /// Backed by an agent report or a backend-confirmed stage completion.
    Reported,
    /// Derived from the side-channel signal.
    Inferred,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineEntry {
    pub stage: PipelineStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub origin: EntryOrigin,
}

impl PipelineEntry {
    pub fn is_inferred(&self) -> bool {
        self.origin == EntryOrigin::Inferred
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineDerivation {
    pub entries: Vec<PipelineEntry>,
    /// Stages the caller must add to `stages_completed`.
    pub inferred_completions: Vec<PipelineStage>,
}

pub fn derive_pipeline(
    stages_completed: &[String],
    agents: &BTreeMap<String, AgentState>,
    side_channel_flag: bool,
) -> PipelineDerivation {
    let completed: BTreeSet<PipelineStage> = stages_completed
        .iter()
        .filter_map(|label| PipelineStage::from_label(label))
        .collect();

    let mut reporters: BTreeMap<PipelineStage, &str> = BTreeMap::new();
    for agent in agents.values() {
        if let Some(stage) = PipelineStage::from_agent(&agent.id, &agent.agent_type) {
            reporters.entry(stage).or_insert(agent.id.as_str());
        }
    }

    let mut derivation = PipelineDerivation::default();
    for stage in CANONICAL_STAGES {
        if let Some(agent_id) = reporters.get(&stage) {
            derivation.entries.push(PipelineEntry {
                stage,
                agent_id: Some((*agent_id).to_string()),
                origin: EntryOrigin::Reported,
            });
            continue;
        }

        if stage == PipelineStage::Distribution {
            if side_channel_flag || completed.contains(&stage) {
                derivation.entries.push(PipelineEntry {
                    stage,
                    agent_id: None,
                    origin: EntryOrigin::Inferred,
                });
                if !completed.contains(&stage) {
                    derivation.inferred_completions.push(stage);
                }
            }
            continue;
        }

        if completed.contains(&stage) {
            derivation.entries.push(PipelineEntry {
                stage,
                agent_id: None,
                origin: EntryOrigin::Reported,
            });
        }
    }

    derivation
}
