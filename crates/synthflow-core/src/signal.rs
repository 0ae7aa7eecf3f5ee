use std::collections::BTreeSet;

/// Side-channel key holding the ids of workflows whose distribution step was
/// completed from the distribution UI.
pub const COMPLETED_DISTRIBUTIONS_KEY: &str = "completed_distributions";

/// Out-of-band completion signal consulted by the pipeline ordering policy.
pub trait CompletionSignal: Send + Sync {
    fn has_external_completion_signal(&self, workflow_id: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompletionSignal;

impl CompletionSignal for NoCompletionSignal {
    fn has_external_completion_signal(&self, _workflow_id: &str) -> bool {
        false
    }
}

/// Fixed set of signalled workflow ids.
#[derive(Debug, Clone, Default)]
pub struct StaticCompletionSignal {
    workflow_ids: BTreeSet<String>,
}

impl StaticCompletionSignal {
    pub fn new<I, S>(workflow_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            workflow_ids: workflow_ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl CompletionSignal for StaticCompletionSignal {
    fn has_external_completion_signal(&self, workflow_id: &str) -> bool {
        self.workflow_ids.contains(workflow_id)
    }
}
