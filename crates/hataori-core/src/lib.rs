//! Core contracts for the hataori workflow interpreter.
//!
//! This crate holds the runtime-free vocabulary shared by the interpreter and
//! by middleware authors: the execution context, the step model, the action
//! contract, errors, and hook sets. Middleware crates should depend on this
//! crate only.
//!
//! # Core Types
//!
//! - [`Context`] / [`Params`] - Shared mutable state and read-only parameters
//! - [`Action`] - The callable contract every step variant is built from
//! - [`BranchAction`] / [`BranchContext`] - Parallel branches and their context handle
//! - [`StepOutput`] - Continue or jump to an anchor
//! - [`StepConfig`] - Retries, delay, and timeout, literal or [`Dynamic`]
//! - [`WorkflowError`] / [`GraphError`] - Error types
//!
//! # Extension Points
//!
//! - [`HookSet`] - Partial callback bundle contributed by middleware
//! - [`WrapStep`] / [`WrapFanout`] - Wrapping middleware driven through [`Next`] / [`BranchNext`]
//! - [`HookRegistry`] - Registration-ordered store with a flattened view

#[macro_use]
mod name;

mod action;
mod context;
mod error;
mod fanout;
mod hooks;
mod registry;
mod step;

pub use action::{
    action_fn, async_fn, merge_fn, shared, Action, ActionRef, AsyncFnAction, FnAction, FnMerge,
    Merge,
};
pub use context::{Context, ContextKey, Emitter, Params};
pub use error::{BoxError, BranchFailure, GraphError, Interrupt, WorkflowError};
pub use fanout::{
    branch, branch_async_fn, branch_fn, AsyncFnBranch, BranchAction, BranchContext, BranchRef,
    ContextGuard, FnBranch,
};
pub use hooks::{
    BranchNext, ErrorHook, HookPhase, HookSet, Invoke, InvokeBranch, Middleware, Next, RunHook,
    StepHook, WrapFanout, WrapStep,
};
pub use registry::{FlatHooks, HookRegistry};
pub use step::{AnchorName, Dynamic, StepConfig, StepInfo, StepKind, StepName, StepOutput, StepPolicy};
