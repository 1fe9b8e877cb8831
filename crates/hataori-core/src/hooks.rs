//! Hook sets: the extension points middleware attaches to.

use crate::context::{Context, Params};
use crate::error::WorkflowError;
use crate::fanout::BranchContext;
use crate::step::{StepInfo, StepOutput};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Callback run once before or after a whole run.
pub type RunHook = Arc<dyn Fn(&mut Context, &Params) -> Result<(), WorkflowError> + Send + Sync>;

/// Callback run before or after each dispatched step.
pub type StepHook =
    Arc<dyn Fn(&StepInfo, &mut Context, &Params) -> Result<(), WorkflowError> + Send + Sync>;

/// Observer for step failures. Cannot suppress the error.
pub type ErrorHook = Arc<dyn Fn(&StepInfo, &WorkflowError, &mut Context, &Params) + Send + Sync>;

/// The slot a callback occupies in a [`HookSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    /// Before the first step of a run.
    BeforeRun,
    /// Before each step.
    BeforeStep,
    /// Around each step body.
    WrapStep,
    /// After each step.
    AfterStep,
    /// Around each parallel branch.
    WrapFanout,
    /// When a step fails.
    OnError,
    /// After the last step of a successful run.
    AfterRun,
}

impl HookPhase {
    /// Every phase, in the order the interpreter reaches them.
    pub const ALL: [HookPhase; 7] = [
        HookPhase::BeforeRun,
        HookPhase::BeforeStep,
        HookPhase::WrapStep,
        HookPhase::AfterStep,
        HookPhase::WrapFanout,
        HookPhase::OnError,
        HookPhase::AfterRun,
    ];
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HookPhase::BeforeRun => "before_run",
            HookPhase::BeforeStep => "before_step",
            HookPhase::WrapStep => "wrap_step",
            HookPhase::AfterStep => "after_step",
            HookPhase::WrapFanout => "wrap_fanout",
            HookPhase::OnError => "on_error",
            HookPhase::AfterRun => "after_run",
        };
        f.write_str(label)
    }
}

/// A type-erased, possibly wrapped step body.
///
/// Implemented by the interpreter for the innermost body and for every
/// middleware layer composed around it.
pub trait Invoke<O>: Send + Sync {
    /// Runs the body against `ctx`.
    fn invoke<'c>(&'c self, ctx: &'c mut Context) -> BoxFuture<'c, Result<O, WorkflowError>>;
}

/// The remainder of a middleware chain.
///
/// Calling [`Next::run`] invokes the next wrapper, or the body itself when
/// no wrapper is left. Not calling it skips the body entirely.
pub struct Next<'a, O> {
    inner: &'a dyn Invoke<O>,
}

impl<'a, O> Next<'a, O> {
    /// Creates a handle to the given body or layer.
    pub fn new(inner: &'a dyn Invoke<O>) -> Self {
        Self { inner }
    }

    /// Continues down the chain.
    pub async fn run(self, ctx: &mut Context) -> Result<O, WorkflowError> {
        self.inner.invoke(ctx).await
    }
}

impl<O> Clone for Next<'_, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for Next<'_, O> {}

impl<O> fmt::Debug for Next<'_, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Next(..)")
    }
}

/// A type-erased, possibly wrapped parallel branch.
pub trait InvokeBranch: Send + Sync {
    /// Runs the branch against `ctx`.
    fn invoke<'c>(&'c self, ctx: &'c mut BranchContext<'_>) -> BoxFuture<'c, Result<(), WorkflowError>>;
}

/// The remainder of a fan-out middleware chain. See [`Next`].
#[derive(Clone, Copy)]
pub struct BranchNext<'a> {
    inner: &'a dyn InvokeBranch,
}

impl<'a> BranchNext<'a> {
    /// Creates a handle to the given branch or layer.
    pub fn new(inner: &'a dyn InvokeBranch) -> Self {
        Self { inner }
    }

    /// Continues down the chain.
    pub async fn run(self, ctx: &mut BranchContext<'_>) -> Result<(), WorkflowError> {
        self.inner.invoke(ctx).await
    }
}

impl fmt::Debug for BranchNext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BranchNext(..)")
    }
}

/// Middleware around a whole step dispatch.
///
/// # Examples
///
/// A dry-run wrapper that never executes function bodies:
///
/// ```
/// use hataori_core::{Context, Next, Params, StepInfo, StepKind, StepOutput, WorkflowError, WrapStep};
/// use async_trait::async_trait;
///
/// struct DryRun;
///
/// #[async_trait]
/// impl WrapStep for DryRun {
///     async fn wrap_step(
///         &self,
///         step: &StepInfo,
///         ctx: &mut Context,
///         _params: &Params,
///         next: Next<'_, StepOutput>,
///     ) -> Result<StepOutput, WorkflowError> {
///         if step.kind == StepKind::Function {
///             return Ok(StepOutput::Next);
///         }
///         next.run(ctx).await
///     }
/// }
/// ```
#[async_trait]
pub trait WrapStep: Send + Sync {
    /// Wraps one step dispatch.
    async fn wrap_step(
        &self,
        step: &StepInfo,
        ctx: &mut Context,
        params: &Params,
        next: Next<'_, StepOutput>,
    ) -> Result<StepOutput, WorkflowError>;
}

/// Middleware around each individual branch of a parallel step.
///
/// Sibling branches run concurrently. In direct mode `ctx` is shared with
/// them, so lock it only for the reads and writes the wrapper needs.
#[async_trait]
pub trait WrapFanout: Send + Sync {
    /// Wraps the invocation of branch `branch` of `step`.
    async fn wrap_fanout(
        &self,
        step: &StepInfo,
        branch: usize,
        ctx: &mut BranchContext<'_>,
        params: &Params,
        next: BranchNext<'_>,
    ) -> Result<(), WorkflowError>;
}

/// A partial bundle of callbacks contributed by one middleware.
///
/// # Examples
///
/// ```
/// use hataori_core::{HookPhase, HookSet};
///
/// let hooks = HookSet::new()
///     .before_step(|step, _ctx, _params| {
///         println!("starting {step}");
///         Ok(())
///     })
///     .on_error(|step, error, _ctx, _params| {
///         eprintln!("{step} failed: {error}");
///     });
///
/// assert!(hooks.has(HookPhase::BeforeStep));
/// assert!(!hooks.has(HookPhase::AfterRun));
/// ```
#[derive(Clone, Default)]
pub struct HookSet {
    pub(crate) before_run: Option<RunHook>,
    pub(crate) before_step: Option<StepHook>,
    pub(crate) wrap_step: Option<Arc<dyn WrapStep>>,
    pub(crate) after_step: Option<StepHook>,
    pub(crate) wrap_fanout: Option<Arc<dyn WrapFanout>>,
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) after_run: Option<RunHook>,
}

impl HookSet {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the before-run callback.
    pub fn before_run<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Context, &Params) -> Result<(), WorkflowError> + Send + Sync + 'static,
    {
        self.before_run = Some(Arc::new(f));
        self
    }

    /// Sets the before-step callback.
    pub fn before_step<F>(mut self, f: F) -> Self
    where
        F: Fn(&StepInfo, &mut Context, &Params) -> Result<(), WorkflowError>
            + Send
            + Sync
            + 'static,
    {
        self.before_step = Some(Arc::new(f));
        self
    }

    /// Sets the step wrapper.
    pub fn wrap_step(mut self, wrapper: impl WrapStep + 'static) -> Self {
        self.wrap_step = Some(Arc::new(wrapper));
        self
    }

    /// Sets the after-step callback.
    pub fn after_step<F>(mut self, f: F) -> Self
    where
        F: Fn(&StepInfo, &mut Context, &Params) -> Result<(), WorkflowError>
            + Send
            + Sync
            + 'static,
    {
        self.after_step = Some(Arc::new(f));
        self
    }

    /// Sets the parallel-branch wrapper.
    pub fn wrap_fanout(mut self, wrapper: impl WrapFanout + 'static) -> Self {
        self.wrap_fanout = Some(Arc::new(wrapper));
        self
    }

    /// Sets the error observer.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&StepInfo, &WorkflowError, &mut Context, &Params) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Sets the after-run callback.
    pub fn after_run<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Context, &Params) -> Result<(), WorkflowError> + Send + Sync + 'static,
    {
        self.after_run = Some(Arc::new(f));
        self
    }

    /// Returns `true` if the slot for `phase` is filled.
    pub fn has(&self, phase: HookPhase) -> bool {
        match phase {
            HookPhase::BeforeRun => self.before_run.is_some(),
            HookPhase::BeforeStep => self.before_step.is_some(),
            HookPhase::WrapStep => self.wrap_step.is_some(),
            HookPhase::AfterStep => self.after_step.is_some(),
            HookPhase::WrapFanout => self.wrap_fanout.is_some(),
            HookPhase::OnError => self.on_error.is_some(),
            HookPhase::AfterRun => self.after_run.is_some(),
        }
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let filled: Vec<HookPhase> = HookPhase::ALL
            .into_iter()
            .filter(|phase| self.has(*phase))
            .collect();
        f.debug_struct("HookSet").field("filled", &filled).finish()
    }
}

/// Anything that contributes behavior to a workflow through a [`HookSet`].
///
/// Implement this for middleware types so they can be passed straight to
/// the builder's `with` method.
pub trait Middleware {
    /// Produces the hooks to register.
    fn into_hooks(self) -> HookSet;
}

impl Middleware for HookSet {
    fn into_hooks(self) -> HookSet {
        self
    }
}
