//! Workflow engine for executing step sequences.

use crate::dispatch::{self, Scope};
use crate::step::{Step, DEFAULT_BATCH_KEY};
use futures::future::BoxFuture;
use hataori_core::{
    Action, ActionRef, AnchorName, BranchRef, Context, ContextKey, FlatHooks, HookRegistry, Merge,
    Middleware, Params, StepConfig, StepInfo, StepName, StepOutput, WorkflowError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An ordered sequence of steps run over one shared [`Context`].
///
/// Steps run in order unless a step returns [`StepOutput::Jump`], in which
/// case execution continues from the named anchor.
///
/// # Examples
///
/// ```
/// use hataori::prelude::*;
///
/// # tokio_test::block_on(async {
/// let workflow = Workflow::builder()
///     .then(action_fn(|ctx, _| {
///         ctx.insert("count", 0);
///         Ok(StepOutput::Next)
///     }))
///     .anchor("loop")
///     .then(action_fn(|ctx, _| {
///         let count = ctx.get_as::<i64>("count").unwrap_or(0) + 1;
///         ctx.insert("count", count);
///         Ok(if count < 3 { StepOutput::jump("loop") } else { StepOutput::Next })
///     }))
///     .build()?;
///
/// let mut ctx = Context::new();
/// workflow.run(&mut ctx, &Params::new()).await?;
/// assert_eq!(ctx.get_as::<i64>("count"), Some(3));
/// # Ok::<(), WorkflowError>(())
/// # }).expect("example runs");
/// ```
pub struct Workflow {
    steps: Vec<Step>,
    anchors: Option<HashMap<AnchorName, usize>>,
    hooks: HookRegistry,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("steps", &self.steps)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl Workflow {
    /// Creates a new workflow builder.
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    /// Registers middleware after the workflow was built.
    pub fn register(&mut self, middleware: impl Middleware) {
        self.hooks.register(middleware.into_hooks());
    }

    /// Returns the number of steps, anchors included.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the identity of every step, in sequence order.
    pub fn steps(&self) -> impl Iterator<Item = StepInfo> + '_ {
        self.steps
            .iter()
            .enumerate()
            .map(|(index, step)| step.info(index))
    }

    /// Returns the names of every anchor.
    pub fn anchors(&self) -> impl Iterator<Item = &AnchorName> {
        self.anchors.iter().flat_map(|anchors| anchors.keys())
    }

    /// Returns the position of the named anchor.
    pub fn anchor_index(&self, name: &str) -> Option<usize> {
        self.anchors.as_ref()?.get(name).copied()
    }

    /// Runs the workflow to completion.
    pub async fn run(&self, ctx: &mut Context, params: &Params) -> Result<(), WorkflowError> {
        self.run_with_cancel(ctx, params, &CancellationToken::new())
            .await
    }

    /// Runs the workflow, stopping with [`WorkflowError::Cancelled`] at the
    /// first step boundary after `cancel` fires.
    ///
    /// A step already in flight is not interrupted.
    pub async fn run_with_cancel(
        &self,
        ctx: &mut Context,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<(), WorkflowError> {
        self.run_with_hooks(ctx, params, cancel, self.hooks.flattened())
            .await
    }

    pub(crate) fn flattened_hooks(&self) -> &FlatHooks {
        self.hooks.flattened()
    }

    pub(crate) async fn run_with_hooks(
        &self,
        ctx: &mut Context,
        params: &Params,
        cancel: &CancellationToken,
        hooks: &FlatHooks,
    ) -> Result<(), WorkflowError> {
        for hook in &hooks.before_run {
            hook(ctx, params)?;
        }

        self.execute(ctx, params, cancel, hooks).await?;

        for hook in &hooks.after_run {
            hook(ctx, params)?;
        }
        info!(steps = self.steps.len(), "Workflow completed");
        Ok(())
    }

    /// Runs this workflow as the body of a loop or batch step.
    ///
    /// Only step-level hooks apply.
    pub(crate) fn run_nested<'a>(
        &'a self,
        ctx: &'a mut Context,
        params: &'a Params,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), WorkflowError>> {
        Box::pin(self.execute(ctx, params, cancel, self.hooks.flattened()))
    }

    async fn execute(
        &self,
        ctx: &mut Context,
        params: &Params,
        cancel: &CancellationToken,
        hooks: &FlatHooks,
    ) -> Result<(), WorkflowError> {
        let mut index = 0;

        while let Some(step) = self.steps.get(index) {
            if let Step::Anchor(name) = step {
                debug!(index, anchor = %name, "Passing anchor");
                index += 1;
                continue;
            }

            if cancel.is_cancelled() {
                warn!(index, "Workflow cancelled before step");
                return Err(WorkflowError::Cancelled);
            }

            let info = step.info(index);
            let scope = Scope {
                info: &info,
                params,
                cancel,
                hooks,
            };

            match self.dispatch(step, ctx, scope).await {
                Ok(next) => index = next,
                Err(error) if error.is_control() => return Err(error),
                Err(error) => {
                    for hook in &hooks.on_error {
                        hook(&info, &error, ctx, params);
                    }
                    warn!(index, kind = %info.kind, error = %error, "Step failed");
                    return Err(error.at_step(info));
                }
            }
        }

        Ok(())
    }

    /// Runs one step with its hooks and returns the index to continue from.
    async fn dispatch(
        &self,
        step: &Step,
        ctx: &mut Context,
        scope: Scope<'_>,
    ) -> Result<usize, WorkflowError> {
        let info = scope.info;
        for hook in &scope.hooks.before_step {
            hook(info, ctx, scope.params)?;
        }

        let output = dispatch::run_wrapped(step, ctx, scope).await?;

        for hook in &scope.hooks.after_step {
            hook(info, ctx, scope.params)?;
        }
        info!(index = info.index, kind = %info.kind, "Step completed");

        match output {
            StepOutput::Next => Ok(info.index + 1),
            StepOutput::Jump(anchor) => match self.anchor_index(anchor.as_str()) {
                Some(target) => {
                    debug!(from = info.index, to = target, anchor = %anchor, "Jumping to anchor");
                    Ok(target)
                }
                None => Err(WorkflowError::UnknownAnchor(anchor)),
            },
        }
    }
}

/// Builder for constructing [`Workflow`] instances.
#[derive(Default)]
pub struct WorkflowBuilder {
    steps: Vec<Step>,
    hooks: HookRegistry,
}

impl fmt::Debug for WorkflowBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowBuilder")
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl WorkflowBuilder {
    /// Creates a new empty workflow builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a function step with the default config.
    pub fn then<A: Action + 'static>(self, action: A) -> Self {
        self.then_with(action, StepConfig::default())
    }

    /// Appends a function step with a custom config.
    pub fn then_with<A: Action + 'static>(self, action: A, config: StepConfig) -> Self {
        self.step(Step::Function {
            name: None,
            action: Arc::new(action),
            config,
        })
    }

    /// Appends a named function step.
    pub fn add_step<A: Action + 'static>(
        self,
        name: impl Into<StepName>,
        action: A,
        config: StepConfig,
    ) -> Self {
        self.step(Step::Function {
            name: Some(name.into()),
            action: Arc::new(action),
            config,
        })
    }

    /// Appends a branch step. The router's result selects a branch by key,
    /// falling back to `"default"`.
    pub fn branch<R, I, K>(self, router: R, branches: I) -> Self
    where
        R: Action<String> + 'static,
        I: IntoIterator<Item = (K, ActionRef)>,
        K: Into<String>,
    {
        self.branch_with(router, branches, StepConfig::default())
    }

    /// Appends a branch step with a custom config.
    pub fn branch_with<R, I, K>(self, router: R, branches: I, config: StepConfig) -> Self
    where
        R: Action<String> + 'static,
        I: IntoIterator<Item = (K, ActionRef)>,
        K: Into<String>,
    {
        self.step(Step::Branch {
            name: None,
            router: Arc::new(router),
            branches: branches
                .into_iter()
                .map(|(key, action)| (key.into(), action))
                .collect(),
            config,
        })
    }

    /// Appends a loop running `body` while `condition` returns `true`.
    pub fn loop_while<C>(self, condition: C, body: impl Into<Arc<Workflow>>) -> Self
    where
        C: Action<bool> + 'static,
    {
        self.step(Step::Loop {
            name: None,
            condition: Arc::new(condition),
            body: body.into(),
        })
    }

    /// Appends a batch writing each item to `"__batch_item"`.
    pub fn batch<P>(self, items: P, body: impl Into<Arc<Workflow>>) -> Self
    where
        P: Action<Vec<Value>> + 'static,
    {
        self.batch_into(items, DEFAULT_BATCH_KEY, body)
    }

    /// Appends a batch writing each item to `key`.
    pub fn batch_into<P>(
        self,
        items: P,
        key: impl Into<ContextKey>,
        body: impl Into<Arc<Workflow>>,
    ) -> Self
    where
        P: Action<Vec<Value>> + 'static,
    {
        self.step(Step::Batch {
            name: None,
            items: Arc::new(items),
            body: body.into(),
            key: key.into(),
        })
    }

    /// Appends a parallel step whose branches share the context.
    ///
    /// Branches run concurrently and interleave at their await points. Each
    /// locks the context through its
    /// [`BranchContext`](hataori_core::BranchContext) only while touching it;
    /// keeping writes from conflicting is up to the branches.
    pub fn parallel(self, actions: Vec<BranchRef>) -> Self {
        self.parallel_with(actions, StepConfig::default())
    }

    /// Appends a shared-context parallel step with a custom config.
    pub fn parallel_with(self, actions: Vec<BranchRef>, config: StepConfig) -> Self {
        self.step(Step::Parallel {
            name: None,
            actions,
            config,
            merge: None,
        })
    }

    /// Appends a parallel step whose branches work on private drafts,
    /// folded back into the context by `merge`.
    pub fn parallel_isolated<M: Merge + 'static>(
        self,
        actions: Vec<BranchRef>,
        merge: M,
        config: StepConfig,
    ) -> Self {
        self.step(Step::Parallel {
            name: None,
            actions,
            config,
            merge: Some(Arc::new(merge)),
        })
    }

    /// Appends an anchor.
    pub fn anchor(self, name: impl Into<AnchorName>) -> Self {
        self.step(Step::Anchor(name.into()))
    }

    /// Appends a prebuilt step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Labels the most recently added step.
    pub fn named(mut self, name: impl Into<StepName>) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.set_name(name.into());
        }
        self
    }

    /// Registers middleware.
    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.hooks.register(middleware.into_hooks());
        self
    }

    /// Builds the workflow.
    ///
    /// Fails with [`WorkflowError::Configuration`] if two anchors share a name.
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let mut seen = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            if let Step::Anchor(name) = step {
                if let Some(first) = seen.insert(name.clone(), index) {
                    return Err(WorkflowError::Configuration(format!(
                        "Anchor '{name}' defined at both #{first} and #{index}"
                    )));
                }
            }
        }
        Ok(self.finish())
    }

    /// Builds without validation. Callers guarantee unique anchors.
    pub(crate) fn finish(self) -> Workflow {
        let anchors: HashMap<AnchorName, usize> = self
            .steps
            .iter()
            .enumerate()
            .filter_map(|(index, step)| match step {
                Step::Anchor(name) => Some((name.clone(), index)),
                _ => None,
            })
            .collect();

        Workflow {
            steps: self.steps,
            anchors: (!anchors.is_empty()).then_some(anchors),
            hooks: self.hooks,
        }
    }
}
