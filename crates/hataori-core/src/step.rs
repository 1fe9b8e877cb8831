//! Step model: names, kinds, outputs, and per-step execution settings.

use crate::context::{Context, Params};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

string_name! {
    /// Label attached to a step for logs and error reports.
    StepName
}

string_name! {
    /// Name of an anchor step, the only valid jump target.
    AnchorName
}

/// The control-flow primitive a step represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// A leaf unit of work.
    Function,
    /// A router selecting one named branch.
    Branch,
    /// A nested workflow repeated while a condition holds.
    Loop,
    /// A nested workflow run once per produced item.
    Batch,
    /// Concurrent fan-out joined before continuing.
    Parallel,
    /// A jump target. Never dispatched.
    Anchor,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepKind::Function => "function",
            StepKind::Branch => "branch",
            StepKind::Loop => "loop",
            StepKind::Batch => "batch",
            StepKind::Parallel => "parallel",
            StepKind::Anchor => "anchor",
        };
        f.write_str(label)
    }
}

/// Position and identity of a step inside its sequence.
///
/// Passed to every hook and carried by the [`WorkflowError::Step`](crate::WorkflowError::Step)
/// envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Zero-based index in the step sequence.
    pub index: usize,
    /// Variant of the step.
    pub kind: StepKind,
    /// Optional label given when the step was added.
    pub name: Option<StepName>,
}

impl StepInfo {
    /// Creates step info without a name.
    pub fn new(index: usize, kind: StepKind) -> Self {
        Self {
            index,
            kind,
            name: None,
        }
    }

    /// Attaches a name.
    pub fn with_name(mut self, name: impl Into<StepName>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for StepInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "#{} ({} '{}')", self.index, self.kind, name),
            None => write!(f, "#{} ({})", self.index, self.kind),
        }
    }
}

/// What the interpreter should do after a step body returns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StepOutput {
    /// Advance to the next step in sequence order.
    #[default]
    Next,
    /// Continue from the named anchor.
    Jump(AnchorName),
}

impl StepOutput {
    /// Creates a Next output.
    pub fn next() -> Self {
        Self::Next
    }

    /// Creates a Jump output to the given anchor.
    pub fn jump(anchor: impl Into<AnchorName>) -> Self {
        Self::Jump(anchor.into())
    }
}

/// A setting that is either a literal or computed from the context and
/// parameters each time the step is dispatched.
///
/// # Examples
///
/// ```
/// use hataori_core::{Context, Dynamic, Params};
///
/// let fixed: Dynamic<u32> = 3.into();
/// let computed = Dynamic::from_fn(|ctx: &Context, _: &Params| {
///     ctx.get_as::<u32>("attempts").unwrap_or(1)
/// });
///
/// let mut ctx = Context::new();
/// ctx.insert("attempts", 5);
/// assert_eq!(fixed.resolve(&ctx, &Params::new()), 3);
/// assert_eq!(computed.resolve(&ctx, &Params::new()), 5);
/// ```
pub enum Dynamic<T> {
    /// A literal value.
    Fixed(T),
    /// A value computed at dispatch time.
    Computed(Arc<dyn Fn(&Context, &Params) -> T + Send + Sync>),
}

impl<T> Dynamic<T> {
    /// Creates a computed setting.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Context, &Params) -> T + Send + Sync + 'static,
    {
        Dynamic::Computed(Arc::new(f))
    }
}

impl<T: Clone> Dynamic<T> {
    /// Resolves the setting against the current context.
    pub fn resolve(&self, ctx: &Context, params: &Params) -> T {
        match self {
            Dynamic::Fixed(value) => value.clone(),
            Dynamic::Computed(f) => f(ctx, params),
        }
    }
}

impl<T> From<T> for Dynamic<T> {
    fn from(value: T) -> Self {
        Dynamic::Fixed(value)
    }
}

impl<T: Clone> Clone for Dynamic<T> {
    fn clone(&self) -> Self {
        match self {
            Dynamic::Fixed(value) => Dynamic::Fixed(value.clone()),
            Dynamic::Computed(f) => Dynamic::Computed(Arc::clone(f)),
        }
    }
}

impl<T: Debug> Debug for Dynamic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dynamic::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Dynamic::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Retry, delay, and timeout configuration for a step.
///
/// `retries` counts attempts, so the default of 1 means "no retry". A zero
/// delay or timeout disables that mechanism.
///
/// # Examples
///
/// ```
/// use hataori_core::StepConfig;
/// use std::time::Duration;
///
/// let config = StepConfig::default()
///     .retries(3)
///     .delay(Duration::from_millis(50))
///     .timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct StepConfig {
    /// Total attempts. Values below 1 are treated as 1.
    pub retries: Dynamic<u32>,
    /// Pause between attempts.
    pub delay: Dynamic<Duration>,
    /// Bound on the whole retried attempt sequence.
    pub timeout: Dynamic<Duration>,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            retries: Dynamic::Fixed(1),
            delay: Dynamic::Fixed(Duration::ZERO),
            timeout: Dynamic::Fixed(Duration::ZERO),
        }
    }
}

impl StepConfig {
    /// Sets the attempt count.
    pub fn retries(mut self, retries: impl Into<Dynamic<u32>>) -> Self {
        self.retries = retries.into();
        self
    }

    /// Sets the pause between attempts.
    pub fn delay(mut self, delay: impl Into<Dynamic<Duration>>) -> Self {
        self.delay = delay.into();
        self
    }

    /// Sets the timeout.
    pub fn timeout(mut self, timeout: impl Into<Dynamic<Duration>>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Resolves every setting for one dispatch.
    pub fn resolve(&self, ctx: &Context, params: &Params) -> StepPolicy {
        let timeout = self.timeout.resolve(ctx, params);
        StepPolicy {
            retries: self.retries.resolve(ctx, params).max(1),
            delay: self.delay.resolve(ctx, params),
            timeout: (!timeout.is_zero()).then_some(timeout),
        }
    }
}

/// A [`StepConfig`] resolved for a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    /// Total attempts, always at least 1.
    pub retries: u32,
    /// Pause between attempts.
    pub delay: Duration,
    /// `None` when disabled.
    pub timeout: Option<Duration>,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            delay: Duration::ZERO,
            timeout: None,
        }
    }
}
