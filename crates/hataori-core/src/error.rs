//! Workflow and graph error types.

use crate::context::Context;
use crate::step::{AnchorName, StepInfo, StepName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by application code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Suspension request raised by a step, carrying the state needed to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    /// Why the run was suspended.
    pub reason: String,
    /// Context contents at the moment of suspension.
    pub snapshot: Value,
}

/// One failed branch of a parallel step.
#[derive(Debug)]
pub struct BranchFailure {
    /// Position of the branch in the step's action list.
    pub branch: usize,
    /// The branch's final error.
    pub error: WorkflowError,
}

/// Errors that can occur during workflow execution.
///
/// Application failures surface wrapped exactly once in [`WorkflowError::Step`],
/// which records where the failure happened. [`WorkflowError::Interrupted`]
/// and [`WorkflowError::Cancelled`] are control signals and are never wrapped.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A step failed; `source` is the original cause.
    #[error("Step {step} failed: {source}")]
    Step {
        /// The failing step.
        step: StepInfo,
        /// The original failure.
        #[source]
        source: Box<WorkflowError>,
    },

    /// An action returned an error.
    #[error("{0}")]
    Action(#[from] BoxError),

    /// An action failed with a plain message.
    #[error("{0}")]
    Failed(String),

    /// The retried attempt sequence exceeded the step timeout.
    #[error("Step timed out after {0:?}")]
    Timeout(Duration),

    /// A step requested a jump to an anchor that does not exist.
    #[error("Unknown anchor: {0}")]
    UnknownAnchor(AnchorName),

    /// A step suspended the run.
    #[error("Workflow interrupted: {}", .0.reason)]
    Interrupted(Interrupt),

    /// The cancellation token fired before the next step started.
    #[error("Workflow cancelled")]
    Cancelled,

    /// One or more branches of a parallel step failed.
    #[error("{} of {total} parallel branches failed", .failures.len())]
    Parallel {
        /// Number of branches in the step.
        total: usize,
        /// Every failed branch, in branch order.
        failures: Vec<BranchFailure>,
    },

    /// The workflow configuration is invalid.
    #[error("Invalid workflow configuration: {0}")]
    Configuration(String),
}

impl WorkflowError {
    /// Creates a failure from any error type.
    pub fn action(error: impl Into<BoxError>) -> Self {
        WorkflowError::Action(error.into())
    }

    /// Creates a failure from a message.
    pub fn failed(details: impl Into<String>) -> Self {
        WorkflowError::Failed(details.into())
    }

    /// Creates an interrupt carrying a snapshot of `ctx`.
    pub fn interrupt(reason: impl Into<String>, ctx: &Context) -> Self {
        WorkflowError::Interrupted(Interrupt {
            reason: reason.into(),
            snapshot: ctx.snapshot(),
        })
    }

    /// Returns `true` for signals that bypass wrapping, retries, and error hooks.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            WorkflowError::Interrupted(_) | WorkflowError::Cancelled
        )
    }

    /// Returns `true` if the error already carries a step envelope.
    pub fn is_wrapped(&self) -> bool {
        matches!(self, WorkflowError::Step { .. })
    }

    /// Wraps the error with the failing step, unless it is a control signal
    /// or already wrapped.
    pub fn at_step(self, step: StepInfo) -> Self {
        if self.is_control() || self.is_wrapped() {
            return self;
        }
        WorkflowError::Step {
            step,
            source: Box::new(self),
        }
    }

    /// Strips step envelopes, returning the original cause.
    pub fn into_cause(self) -> Self {
        match self {
            WorkflowError::Step { source, .. } => source.into_cause(),
            other => other,
        }
    }

    /// Returns the original cause without consuming the error.
    pub fn cause(&self) -> &WorkflowError {
        match self {
            WorkflowError::Step { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Returns the step recorded in the envelope, if any.
    pub fn step(&self) -> Option<&StepInfo> {
        match self {
            WorkflowError::Step { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Returns the interrupt if this error is one.
    pub fn as_interrupt(&self) -> Option<&Interrupt> {
        match self {
            WorkflowError::Interrupted(interrupt) => Some(interrupt),
            _ => None,
        }
    }
}

/// Errors detected while compiling a graph, before anything runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// Two nodes share a name.
    #[error("Duplicate graph node: {0}")]
    DuplicateNode(StepName),

    /// An edge references a node that was never added.
    #[error("Edge {from} -> {to} references unknown node '{missing}'")]
    UnknownNode {
        /// Edge source.
        from: StepName,
        /// Edge target.
        to: StepName,
        /// The endpoint that does not exist.
        missing: StepName,
    },

    /// Unconditional edges form a cycle.
    #[error("Cycle detected among unconditional edges involving: {}", join_names(.nodes))]
    Cycle {
        /// Every node left unordered by the topological sort.
        nodes: Vec<StepName>,
    },
}

fn join_names(nodes: &[StepName]) -> String {
    nodes
        .iter()
        .map(StepName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
