//! The closed set of step variants a workflow is made of.

use crate::workflow::Workflow;
use hataori_core::{
    ActionRef, AnchorName, BranchRef, ContextKey, Merge, StepConfig, StepInfo, StepKind,
    StepName,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Context key a batch writes the current item to unless told otherwise.
pub const DEFAULT_BATCH_KEY: &str = "__batch_item";

/// Branch key used when the router's result matches no branch.
pub const DEFAULT_BRANCH: &str = "default";

/// One instruction of a workflow.
#[non_exhaustive]
pub enum Step {
    /// A leaf unit of work.
    Function {
        /// Optional label.
        name: Option<StepName>,
        /// The body.
        action: ActionRef,
        /// Retry, delay, and timeout.
        config: StepConfig,
    },
    /// Runs the branch selected by the router's result.
    Branch {
        /// Optional label.
        name: Option<StepName>,
        /// Returns the key of the branch to run.
        router: ActionRef<String>,
        /// Branch bodies by key.
        branches: HashMap<String, ActionRef>,
        /// Applies to the router and to the selected branch.
        config: StepConfig,
    },
    /// Runs `body` while `condition` holds.
    Loop {
        /// Optional label.
        name: Option<StepName>,
        /// Evaluated before every iteration.
        condition: ActionRef<bool>,
        /// The repeated workflow.
        body: Arc<Workflow>,
    },
    /// Runs `body` once per produced item.
    Batch {
        /// Optional label.
        name: Option<StepName>,
        /// Produces the items, evaluated once.
        items: ActionRef<Vec<Value>>,
        /// The per-item workflow.
        body: Arc<Workflow>,
        /// Where the current item is written.
        key: ContextKey,
    },
    /// Runs every branch concurrently and joins them.
    Parallel {
        /// Optional label.
        name: Option<StepName>,
        /// The branches.
        actions: Vec<BranchRef>,
        /// Applies to each branch independently.
        config: StepConfig,
        /// When set, branches work on private drafts folded back by the merge.
        merge: Option<Arc<dyn Merge>>,
    },
    /// A jump target. Skipped by the dispatch loop.
    Anchor(AnchorName),
}

impl Step {
    /// The variant of this step.
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Function { .. } => StepKind::Function,
            Step::Branch { .. } => StepKind::Branch,
            Step::Loop { .. } => StepKind::Loop,
            Step::Batch { .. } => StepKind::Batch,
            Step::Parallel { .. } => StepKind::Parallel,
            Step::Anchor(_) => StepKind::Anchor,
        }
    }

    /// The step's label. Anchors are labelled with their own name.
    pub fn name(&self) -> Option<StepName> {
        match self {
            Step::Function { name, .. }
            | Step::Branch { name, .. }
            | Step::Loop { name, .. }
            | Step::Batch { name, .. }
            | Step::Parallel { name, .. } => name.clone(),
            Step::Anchor(anchor) => Some(StepName::new(anchor.as_str())),
        }
    }

    /// Identity of this step at `index`.
    pub fn info(&self, index: usize) -> StepInfo {
        StepInfo {
            index,
            kind: self.kind(),
            name: self.name(),
        }
    }

    /// Retry settings, for the variants that have them.
    pub fn config(&self) -> Option<&StepConfig> {
        match self {
            Step::Function { config, .. }
            | Step::Branch { config, .. }
            | Step::Parallel { config, .. } => Some(config),
            Step::Loop { .. } | Step::Batch { .. } | Step::Anchor(_) => None,
        }
    }

    pub(crate) fn set_name(&mut self, label: StepName) {
        match self {
            Step::Function { name, .. }
            | Step::Branch { name, .. }
            | Step::Loop { name, .. }
            | Step::Batch { name, .. }
            | Step::Parallel { name, .. } => *name = Some(label),
            Step::Anchor(_) => {}
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Function { name, config, .. } => f
                .debug_struct("Function")
                .field("name", name)
                .field("config", config)
                .finish(),
            Step::Branch {
                name,
                branches,
                config,
                ..
            } => {
                let mut keys: Vec<&String> = branches.keys().collect();
                keys.sort();
                f.debug_struct("Branch")
                    .field("name", name)
                    .field("branches", &keys)
                    .field("config", config)
                    .finish()
            }
            Step::Loop { name, body, .. } => f
                .debug_struct("Loop")
                .field("name", name)
                .field("body", body)
                .finish(),
            Step::Batch { name, body, key, .. } => f
                .debug_struct("Batch")
                .field("name", name)
                .field("key", key)
                .field("body", body)
                .finish(),
            Step::Parallel {
                name,
                actions,
                config,
                merge,
            } => f
                .debug_struct("Parallel")
                .field("name", name)
                .field("branches", &actions.len())
                .field("isolated", &merge.is_some())
                .field("config", config)
                .finish(),
            Step::Anchor(name) => f.debug_tuple("Anchor").field(name).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hataori_core::{action_fn, shared, StepOutput};

    fn noop() -> ActionRef {
        shared(action_fn(|_, _| Ok(StepOutput::Next)))
    }

    #[test]
    fn test_info_carries_kind_and_name() {
        let step = Step::Function {
            name: Some(StepName::new("fetch")),
            action: noop(),
            config: StepConfig::default(),
        };
        assert_eq!(
            step.info(3),
            StepInfo::new(3, StepKind::Function).with_name("fetch")
        );
        assert!(step.config().is_some());
    }

    #[test]
    fn test_anchor_is_labelled_with_its_name() {
        let step = Step::Anchor(AnchorName::new("top"));
        assert_eq!(step.kind(), StepKind::Anchor);
        assert_eq!(step.name(), Some(StepName::new("top")));
        assert!(step.config().is_none());
    }

    #[test]
    fn test_set_name_ignores_anchor() {
        let mut step = Step::Anchor(AnchorName::new("top"));
        step.set_name(StepName::new("other"));
        assert_eq!(step.name(), Some(StepName::new("top")));

        let mut step = Step::Parallel {
            name: None,
            actions: Vec::new(),
            config: StepConfig::default(),
            merge: None,
        };
        step.set_name(StepName::new("fan"));
        assert_eq!(step.name(), Some(StepName::new("fan")));
    }
}
