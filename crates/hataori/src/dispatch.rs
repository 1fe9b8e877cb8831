//! Per-variant step execution: retries, timeouts, middleware, and fan-out.

use crate::step::{Step, DEFAULT_BRANCH};
use crate::workflow::Workflow;
use futures::future::{join_all, BoxFuture};
use futures::lock::Mutex;
use hataori_core::{
    Action, ActionRef, BranchAction, BranchContext, BranchFailure, BranchNext, BranchRef, Context,
    ContextKey, FlatHooks, Invoke, InvokeBranch, Merge, Next, Params, StepInfo, StepOutput,
    StepPolicy, WorkflowError, WrapFanout, WrapStep,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a step needs besides the context.
#[derive(Clone, Copy)]
pub(crate) struct Scope<'a> {
    pub(crate) info: &'a StepInfo,
    pub(crate) params: &'a Params,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) hooks: &'a FlatHooks,
}

/// Runs `step` through the wrap-step chain.
pub(crate) async fn run_wrapped(
    step: &Step,
    ctx: &mut Context,
    scope: Scope<'_>,
) -> Result<StepOutput, WorkflowError> {
    let chain = compose_step(StepBody { step, scope }, &scope.hooks.wrap_step, scope);
    chain.invoke(ctx).await
}

struct StepBody<'a> {
    step: &'a Step,
    scope: Scope<'a>,
}

impl Invoke<StepOutput> for StepBody<'_> {
    fn invoke<'c>(&'c self, ctx: &'c mut Context) -> BoxFuture<'c, Result<StepOutput, WorkflowError>> {
        Box::pin(execute_step(self.step, ctx, self.scope))
    }
}

struct StepLayer<'a> {
    wrapper: &'a dyn WrapStep,
    scope: Scope<'a>,
    next: Box<dyn Invoke<StepOutput> + 'a>,
}

impl Invoke<StepOutput> for StepLayer<'_> {
    fn invoke<'c>(&'c self, ctx: &'c mut Context) -> BoxFuture<'c, Result<StepOutput, WorkflowError>> {
        self.wrapper.wrap_step(
            self.scope.info,
            ctx,
            self.scope.params,
            Next::new(self.next.as_ref()),
        )
    }
}

// Folded from the back so the last registered wrapper sits next to the body.
fn compose_step<'a>(
    body: StepBody<'a>,
    wrappers: &'a [Arc<dyn WrapStep>],
    scope: Scope<'a>,
) -> Box<dyn Invoke<StepOutput> + 'a> {
    wrappers.iter().rev().fold(
        Box::new(body) as Box<dyn Invoke<StepOutput> + 'a>,
        |next, wrapper| {
            Box::new(StepLayer {
                wrapper: wrapper.as_ref(),
                scope,
                next,
            }) as Box<dyn Invoke<StepOutput> + 'a>
        },
    )
}

/// Resolves the step policy and runs the variant under its timeout.
async fn execute_step(
    step: &Step,
    ctx: &mut Context,
    scope: Scope<'_>,
) -> Result<StepOutput, WorkflowError> {
    let policy = step
        .config()
        .map(|config| config.resolve(ctx, scope.params))
        .unwrap_or_default();

    let run = execute_variant(step, ctx, &policy, scope);
    match policy.timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    index = scope.info.index,
                    kind = %scope.info.kind,
                    timeout = ?limit,
                    "Step timed out"
                );
                Err(WorkflowError::Timeout(limit))
            }
        },
        None => run.await,
    }
}

async fn execute_variant(
    step: &Step,
    ctx: &mut Context,
    policy: &StepPolicy,
    scope: Scope<'_>,
) -> Result<StepOutput, WorkflowError> {
    match step {
        Step::Function { action, .. } => {
            call_with_retries(action.as_ref(), ctx, policy, scope).await
        }
        Step::Branch {
            router, branches, ..
        } => run_branch(router, branches, ctx, policy, scope).await,
        Step::Loop {
            condition, body, ..
        } => run_loop(condition, body, ctx, scope).await,
        Step::Batch {
            items, body, key, ..
        } => run_batch(items, body, key, ctx, scope).await,
        Step::Parallel {
            actions, merge, ..
        } => run_parallel(actions, merge.as_deref(), ctx, policy, scope).await,
        Step::Anchor(_) => Ok(StepOutput::Next),
    }
}

/// Calls `action` up to `policy.retries` times, surfacing the last error.
///
/// Control signals are returned immediately.
async fn call_with_retries<O: Send>(
    action: &dyn Action<O>,
    ctx: &mut Context,
    policy: &StepPolicy,
    scope: Scope<'_>,
) -> Result<O, WorkflowError> {
    let mut attempt = 1;
    loop {
        match action.call(ctx, scope.params).await {
            Ok(output) => return Ok(output),
            Err(error) if error.is_control() || attempt >= policy.retries => return Err(error),
            Err(error) => {
                backoff(&error, attempt, policy, scope).await;
                attempt += 1;
            }
        }
    }
}

async fn backoff(error: &WorkflowError, attempt: u32, policy: &StepPolicy, scope: Scope<'_>) {
    warn!(
        index = scope.info.index,
        kind = %scope.info.kind,
        attempt,
        retries = policy.retries,
        error = %error,
        "Step attempt failed, retrying"
    );
    if !policy.delay.is_zero() {
        tokio::time::sleep(policy.delay).await;
    }
}

async fn run_branch(
    router: &ActionRef<String>,
    branches: &HashMap<String, ActionRef>,
    ctx: &mut Context,
    policy: &StepPolicy,
    scope: Scope<'_>,
) -> Result<StepOutput, WorkflowError> {
    let key = call_with_retries(router.as_ref(), ctx, policy, scope).await?;
    let selected = branches
        .get(&key)
        .or_else(|| branches.get(DEFAULT_BRANCH));

    match selected {
        Some(action) => {
            debug!(index = scope.info.index, branch = %key, "Running selected branch");
            call_with_retries(action.as_ref(), ctx, policy, scope).await
        }
        None => {
            debug!(index = scope.info.index, branch = %key, "No branch matched");
            Ok(StepOutput::Next)
        }
    }
}

async fn run_loop(
    condition: &ActionRef<bool>,
    body: &Workflow,
    ctx: &mut Context,
    scope: Scope<'_>,
) -> Result<StepOutput, WorkflowError> {
    let mut iterations = 0usize;
    while condition.as_ref().call(ctx, scope.params).await? {
        body.run_nested(ctx, scope.params, scope.cancel)
            .await
            .map_err(WorkflowError::into_cause)?;
        iterations += 1;
    }
    debug!(index = scope.info.index, iterations, "Loop finished");
    Ok(StepOutput::Next)
}

async fn run_batch(
    items: &ActionRef<Vec<Value>>,
    body: &Workflow,
    key: &ContextKey,
    ctx: &mut Context,
    scope: Scope<'_>,
) -> Result<StepOutput, WorkflowError> {
    let items = items.as_ref().call(ctx, scope.params).await?;
    let previous = ctx.get(key.as_str()).cloned();
    let total = items.len();

    let mut outcome = Ok(());
    for (position, item) in items.into_iter().enumerate() {
        debug!(index = scope.info.index, item = position, total, "Running batch item");
        ctx.insert(key.clone(), item);
        if let Err(error) = body.run_nested(ctx, scope.params, scope.cancel).await {
            outcome = Err(error.into_cause());
            break;
        }
    }

    if total > 0 {
        match previous {
            Some(value) => {
                ctx.insert(key.clone(), value);
            }
            None => {
                ctx.remove(key.as_str());
            }
        }
    }
    outcome.map(|()| StepOutput::Next)
}

struct BranchBody<'a> {
    action: &'a dyn BranchAction,
    policy: &'a StepPolicy,
    scope: Scope<'a>,
}

impl InvokeBranch for BranchBody<'_> {
    fn invoke<'c>(
        &'c self,
        ctx: &'c mut BranchContext<'_>,
    ) -> BoxFuture<'c, Result<(), WorkflowError>> {
        Box::pin(async move {
            let mut attempt = 1;
            loop {
                match self.action.call(ctx, self.scope.params).await {
                    Ok(()) => return Ok(()),
                    Err(error) if error.is_control() || attempt >= self.policy.retries => {
                        return Err(error)
                    }
                    Err(error) => {
                        backoff(&error, attempt, self.policy, self.scope).await;
                        attempt += 1;
                    }
                }
            }
        })
    }
}

struct FanoutLayer<'a> {
    wrapper: &'a dyn WrapFanout,
    branch: usize,
    scope: Scope<'a>,
    next: Box<dyn InvokeBranch + 'a>,
}

impl InvokeBranch for FanoutLayer<'_> {
    fn invoke<'c>(
        &'c self,
        ctx: &'c mut BranchContext<'_>,
    ) -> BoxFuture<'c, Result<(), WorkflowError>> {
        self.wrapper.wrap_fanout(
            self.scope.info,
            self.branch,
            ctx,
            self.scope.params,
            BranchNext::new(self.next.as_ref()),
        )
    }
}

fn compose_fanout<'a>(
    body: BranchBody<'a>,
    branch: usize,
    wrappers: &'a [Arc<dyn WrapFanout>],
    scope: Scope<'a>,
) -> Box<dyn InvokeBranch + 'a> {
    wrappers.iter().rev().fold(
        Box::new(body) as Box<dyn InvokeBranch + 'a>,
        |next, wrapper| {
            Box::new(FanoutLayer {
                wrapper: wrapper.as_ref(),
                branch,
                scope,
                next,
            }) as Box<dyn InvokeBranch + 'a>
        },
    )
}

/// Moves the canonical context behind a lock for direct-mode branches and
/// puts it back on drop, including when a timeout drops the step.
struct Lent<'a> {
    home: &'a mut Context,
    shared: Mutex<Context>,
}

impl<'a> Lent<'a> {
    fn new(home: &'a mut Context) -> Self {
        let shared = Mutex::new(std::mem::take(home));
        Self { home, shared }
    }
}

impl Drop for Lent<'_> {
    fn drop(&mut self) {
        *self.home = std::mem::take(self.shared.get_mut());
    }
}

async fn run_parallel(
    actions: &[BranchRef],
    merge: Option<&dyn Merge>,
    ctx: &mut Context,
    policy: &StepPolicy,
    scope: Scope<'_>,
) -> Result<StepOutput, WorkflowError> {
    let chains: Vec<Box<dyn InvokeBranch + '_>> = actions
        .iter()
        .enumerate()
        .map(|(branch, action)| {
            let body = BranchBody {
                action: action.as_ref(),
                policy,
                scope,
            };
            compose_fanout(body, branch, &scope.hooks.wrap_fanout, scope)
        })
        .collect();

    match merge {
        None => {
            let lent = Lent::new(ctx);
            let results = join_all(chains.iter().map(|chain| {
                let shared = &lent.shared;
                async move {
                    let mut branch_ctx = BranchContext::shared(shared);
                    chain.invoke(&mut branch_ctx).await
                }
            }))
            .await;
            drop(lent);
            join_outcome(results, scope)?;
        }
        Some(merge) => {
            let mut drafts: Vec<Context> = actions.iter().map(|_| ctx.clone()).collect();
            let results = join_all(chains.iter().zip(drafts.iter_mut()).map(
                |(chain, draft)| async move {
                    let mut branch_ctx = BranchContext::draft(draft);
                    chain.invoke(&mut branch_ctx).await
                },
            ))
            .await;
            join_outcome(results, scope)?;
            merge.merge(ctx, drafts, scope.params).await?;
        }
    }
    Ok(StepOutput::Next)
}

/// Collapses branch results: control signals first, then every failure.
fn join_outcome(
    results: Vec<Result<(), WorkflowError>>,
    scope: Scope<'_>,
) -> Result<(), WorkflowError> {
    let total = results.len();
    let mut failures = Vec::new();
    for (branch, result) in results.into_iter().enumerate() {
        match result {
            Ok(()) => {}
            Err(error) if error.is_control() => return Err(error),
            Err(error) => failures.push(BranchFailure { branch, error }),
        }
    }

    debug!(
        index = scope.info.index,
        total,
        failed = failures.len(),
        "Parallel branches joined"
    );
    if failures.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::Parallel { total, failures })
    }
}
