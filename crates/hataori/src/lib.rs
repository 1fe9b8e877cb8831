//! A step-sequence workflow interpreter for Rust.
//!
//! A [`Workflow`] is a linear program of steps (functions, branches, loops,
//! batches, parallel fan-out, and anchors) run over one shared [`Context`].
//! Steps can jump back or forward to anchors, middleware attaches through
//! [`HookSet`]s, runs can be observed as a [`FlowEvent`] stream, and a
//! [`Graph`] of nodes and edges compiles down to the same step sequence.
//!
//! # Example
//!
//! ```rust
//! use hataori::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WorkflowError> {
//!     let workflow = Workflow::builder()
//!         .add_step(
//!             "fetch",
//!             action_fn(|ctx, _| {
//!                 ctx.insert("result", "hello");
//!                 Ok(StepOutput::Next)
//!             }),
//!             StepConfig::default()
//!                 .retries(3)
//!                 .timeout(Duration::from_secs(5)),
//!         )
//!         .with(HookSet::new().after_step(|step, _ctx, _params| {
//!             println!("finished {step}");
//!             Ok(())
//!         }))
//!         .build()?;
//!
//!     let mut ctx = Context::new();
//!     workflow.run(&mut ctx, &Params::new()).await?;
//!     assert_eq!(ctx.get_as::<String>("result").as_deref(), Some("hello"));
//!     Ok(())
//! }
//! ```

mod dispatch;
mod graph;
mod step;
mod stream;
mod workflow;

// Re-export core types
pub use hataori_core::*;

pub use graph::Graph;
pub use step::{Step, DEFAULT_BATCH_KEY, DEFAULT_BRANCH};
pub use stream::FlowEvent;
pub use workflow::{Workflow, WorkflowBuilder};

/// Re-export of the cancellation token accepted by [`Workflow::run_with_cancel`].
pub use tokio_util::sync::CancellationToken;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        action_fn, async_fn, branch, branch_async_fn, branch_fn, merge_fn, shared, Action,
        ActionRef, AnchorName, BranchAction, BranchContext, BranchNext, BranchRef,
        CancellationToken, Context, Dynamic, FlowEvent, Graph, GraphError, HookSet, Merge,
        Middleware, Next, Params, Step, StepConfig, StepInfo, StepKind, StepName, StepOutput, Workflow, WorkflowBuilder,
        WorkflowError, WrapFanout, WrapStep, DEFAULT_BATCH_KEY, DEFAULT_BRANCH,
    };
}
