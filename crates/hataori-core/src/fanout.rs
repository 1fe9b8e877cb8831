//! Context access for parallel branches.

use crate::context::{Context, Params};
use crate::error::WorkflowError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::lock::{Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A parallel branch's view of the context.
///
/// In direct mode every branch holds a handle to the same context and
/// [`lock`](Self::lock) waits until no sibling holds the guard. In isolated
/// mode the handle wraps the branch's private draft and locking never waits.
///
/// Branches run concurrently, so keep the guard only while reading or
/// writing. A branch that awaits a sibling while holding it deadlocks.
pub struct BranchContext<'a> {
    inner: Access<'a>,
}

enum Access<'a> {
    Draft(&'a mut Context),
    Shared(&'a Mutex<Context>),
}

impl<'a> BranchContext<'a> {
    /// Wraps a private draft.
    pub fn draft(ctx: &'a mut Context) -> Self {
        Self {
            inner: Access::Draft(ctx),
        }
    }

    /// Wraps a context shared with sibling branches.
    pub fn shared(ctx: &'a Mutex<Context>) -> Self {
        Self {
            inner: Access::Shared(ctx),
        }
    }

    /// Returns `true` if sibling branches see this branch's writes.
    pub fn is_shared(&self) -> bool {
        matches!(self.inner, Access::Shared(_))
    }

    /// Waits for exclusive access to the context.
    pub async fn lock(&mut self) -> ContextGuard<'_> {
        match &mut self.inner {
            Access::Draft(ctx) => ContextGuard {
                inner: Held::Draft(&mut **ctx),
            },
            Access::Shared(ctx) => ContextGuard {
                inner: Held::Shared(ctx.lock().await),
            },
        }
    }
}

impl fmt::Debug for BranchContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchContext")
            .field("shared", &self.is_shared())
            .finish()
    }
}

/// Exclusive access to a branch's context, released on drop.
pub struct ContextGuard<'a> {
    inner: Held<'a>,
}

enum Held<'a> {
    Draft(&'a mut Context),
    Shared(MutexGuard<'a, Context>),
}

impl Deref for ContextGuard<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        match &self.inner {
            Held::Draft(ctx) => &**ctx,
            Held::Shared(guard) => &**guard,
        }
    }
}

impl DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        match &mut self.inner {
            Held::Draft(ctx) => &mut **ctx,
            Held::Shared(guard) => &mut **guard,
        }
    }
}

/// One branch of a parallel step.
///
/// # Examples
///
/// ```
/// use hataori_core::{BranchAction, BranchContext, Params, WorkflowError};
/// use async_trait::async_trait;
///
/// struct Tally;
///
/// #[async_trait]
/// impl BranchAction for Tally {
///     async fn call(&self, ctx: &mut BranchContext<'_>, _params: &Params) -> Result<(), WorkflowError> {
///         let mut ctx = ctx.lock().await;
///         let hits = ctx.get_as::<u64>("hits").unwrap_or(0);
///         ctx.insert("hits", hits + 1);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait BranchAction: Send + Sync {
    /// Runs the branch.
    async fn call(&self, ctx: &mut BranchContext<'_>, params: &Params) -> Result<(), WorkflowError>;
}

/// Shared handle to a branch.
pub type BranchRef = Arc<dyn BranchAction>;

/// Wraps a branch into a [`BranchRef`].
pub fn branch<B: BranchAction + 'static>(action: B) -> BranchRef {
    Arc::new(action)
}

/// Branch backed by a synchronous closure. See [`branch_fn`].
pub struct FnBranch<F>(F);

/// Turns a synchronous closure into a [`BranchAction`].
///
/// The closure runs while holding the context, so it never interleaves with
/// siblings mid-call.
pub fn branch_fn<F>(f: F) -> FnBranch<F>
where
    F: Fn(&mut Context, &Params) -> Result<(), WorkflowError> + Send + Sync,
{
    FnBranch(f)
}

#[async_trait]
impl<F> BranchAction for FnBranch<F>
where
    F: Fn(&mut Context, &Params) -> Result<(), WorkflowError> + Send + Sync,
{
    async fn call(&self, ctx: &mut BranchContext<'_>, params: &Params) -> Result<(), WorkflowError> {
        let mut guard = ctx.lock().await;
        (self.0)(&mut *guard, params)
    }
}

/// Branch backed by a closure returning a boxed future. See [`branch_async_fn`].
pub struct AsyncFnBranch<F>(F);

/// Turns a closure returning a boxed future into a [`BranchAction`].
///
/// ```
/// use hataori_core::{branch_async_fn, BranchContext, Params};
/// use std::time::Duration;
///
/// let fetch = branch_async_fn(|ctx: &mut BranchContext<'_>, _params: &Params| {
///     Box::pin(async move {
///         tokio::time::sleep(Duration::from_millis(1)).await;
///         ctx.lock().await.insert("fetched", true);
///         Ok(())
///     })
/// });
/// ```
pub fn branch_async_fn<F>(f: F) -> AsyncFnBranch<F>
where
    F: for<'a, 'b> Fn(&'a mut BranchContext<'b>, &'a Params) -> BoxFuture<'a, Result<(), WorkflowError>>
        + Send
        + Sync,
{
    AsyncFnBranch(f)
}

#[async_trait]
impl<F> BranchAction for AsyncFnBranch<F>
where
    F: for<'a, 'b> Fn(&'a mut BranchContext<'b>, &'a Params) -> BoxFuture<'a, Result<(), WorkflowError>>
        + Send
        + Sync,
{
    async fn call(&self, ctx: &mut BranchContext<'_>, params: &Params) -> Result<(), WorkflowError> {
        (self.0)(ctx, params).await
    }
}
