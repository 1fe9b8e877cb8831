//! The callable contract shared by every step variant.

use crate::context::{Context, Params};
use crate::error::WorkflowError;
use crate::step::StepOutput;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// A unit of work invoked with the shared context and the run parameters.
///
/// The output type depends on where the action is used: step bodies return
/// [`StepOutput`], routers return the branch key, loop conditions return
/// `bool`, and batch producers return the items to iterate. Parallel
/// branches use [`BranchAction`](crate::BranchAction) instead.
///
/// # Examples
///
/// ```
/// use hataori_core::{Action, Context, Params, StepOutput, WorkflowError};
/// use async_trait::async_trait;
///
/// struct Increment;
///
/// #[async_trait]
/// impl Action for Increment {
///     async fn call(&self, ctx: &mut Context, _params: &Params) -> Result<StepOutput, WorkflowError> {
///         let count = ctx.get_as::<i64>("count").unwrap_or(0);
///         ctx.insert("count", count + 1);
///         Ok(StepOutput::Next)
///     }
/// }
/// ```
#[async_trait]
pub trait Action<O = StepOutput>: Send + Sync {
    /// Runs the action.
    async fn call(&self, ctx: &mut Context, params: &Params) -> Result<O, WorkflowError>;
}

/// Shared handle to an action.
pub type ActionRef<O = StepOutput> = Arc<dyn Action<O>>;

#[async_trait]
impl<O, A> Action<O> for Arc<A>
where
    A: Action<O> + ?Sized,
    O: Send + 'static,
{
    async fn call(&self, ctx: &mut Context, params: &Params) -> Result<O, WorkflowError> {
        (**self).call(ctx, params).await
    }
}

/// Wraps an action into an [`ActionRef`].
pub fn shared<O, A>(action: A) -> ActionRef<O>
where
    A: Action<O> + 'static,
{
    Arc::new(action)
}

/// Action backed by a synchronous closure. See [`action_fn`].
pub struct FnAction<F>(F);

/// Turns a synchronous closure into an [`Action`].
///
/// ```
/// use hataori_core::{action_fn, StepOutput};
///
/// let step = action_fn(|ctx, _params| {
///     ctx.insert("done", true);
///     Ok(StepOutput::Next)
/// });
/// ```
pub fn action_fn<F, O>(f: F) -> FnAction<F>
where
    F: Fn(&mut Context, &Params) -> Result<O, WorkflowError> + Send + Sync,
{
    FnAction(f)
}

#[async_trait]
impl<F, O> Action<O> for FnAction<F>
where
    F: Fn(&mut Context, &Params) -> Result<O, WorkflowError> + Send + Sync,
    O: Send + 'static,
{
    async fn call(&self, ctx: &mut Context, params: &Params) -> Result<O, WorkflowError> {
        (self.0)(ctx, params)
    }
}

/// Action backed by a closure returning a boxed future. See [`async_fn`].
pub struct AsyncFnAction<F>(F);

/// Turns a closure returning a boxed future into an [`Action`].
///
/// ```
/// use hataori_core::{async_fn, StepOutput};
/// use std::time::Duration;
///
/// let step = async_fn(|ctx, _params| {
///     Box::pin(async move {
///         tokio::time::sleep(Duration::from_millis(1)).await;
///         ctx.insert("slept", true);
///         Ok(StepOutput::Next)
///     })
/// });
/// ```
pub fn async_fn<F, O>(f: F) -> AsyncFnAction<F>
where
    F: for<'a> Fn(&'a mut Context, &'a Params) -> BoxFuture<'a, Result<O, WorkflowError>>
        + Send
        + Sync,
{
    AsyncFnAction(f)
}

#[async_trait]
impl<F, O> Action<O> for AsyncFnAction<F>
where
    F: for<'a> Fn(&'a mut Context, &'a Params) -> BoxFuture<'a, Result<O, WorkflowError>>
        + Send
        + Sync,
    O: Send + 'static,
{
    async fn call(&self, ctx: &mut Context, params: &Params) -> Result<O, WorkflowError> {
        (self.0)(ctx, params).await
    }
}

/// Folds isolated parallel drafts back into the canonical context.
///
/// Runs once, after every branch finished successfully, with exclusive access
/// to the context. `drafts` holds one context per branch, in branch order.
#[async_trait]
pub trait Merge: Send + Sync {
    /// Reconciles the drafts into `ctx`.
    async fn merge(
        &self,
        ctx: &mut Context,
        drafts: Vec<Context>,
        params: &Params,
    ) -> Result<(), WorkflowError>;
}

/// Merge backed by a synchronous closure. See [`merge_fn`].
pub struct FnMerge<F>(F);

/// Turns a synchronous closure into a [`Merge`].
pub fn merge_fn<F>(f: F) -> FnMerge<F>
where
    F: Fn(&mut Context, Vec<Context>, &Params) -> Result<(), WorkflowError> + Send + Sync,
{
    FnMerge(f)
}

#[async_trait]
impl<F> Merge for FnMerge<F>
where
    F: Fn(&mut Context, Vec<Context>, &Params) -> Result<(), WorkflowError> + Send + Sync,
{
    async fn merge(
        &self,
        ctx: &mut Context,
        drafts: Vec<Context>,
        params: &Params,
    ) -> Result<(), WorkflowError> {
        (self.0)(ctx, drafts, params)
    }
}
