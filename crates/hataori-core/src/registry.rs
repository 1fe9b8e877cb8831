//! Accumulates hook sets and flattens them into per-phase lists.

use crate::hooks::{ErrorHook, HookPhase, HookSet, RunHook, StepHook, WrapFanout, WrapStep};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Every registered callback, grouped by phase in registration order.
#[derive(Clone, Default)]
pub struct FlatHooks {
    /// Before-run callbacks.
    pub before_run: Vec<RunHook>,
    /// Before-step callbacks.
    pub before_step: Vec<StepHook>,
    /// Step wrappers, outermost first.
    pub wrap_step: Vec<Arc<dyn WrapStep>>,
    /// After-step callbacks.
    pub after_step: Vec<StepHook>,
    /// Parallel-branch wrappers, outermost first.
    pub wrap_fanout: Vec<Arc<dyn WrapFanout>>,
    /// Error observers.
    pub on_error: Vec<ErrorHook>,
    /// After-run callbacks.
    pub after_run: Vec<RunHook>,
}

impl FlatHooks {
    /// Appends the filled slots of `set`.
    pub fn extend(&mut self, set: &HookSet) {
        self.before_run.extend(set.before_run.clone());
        self.before_step.extend(set.before_step.clone());
        self.wrap_step.extend(set.wrap_step.clone());
        self.after_step.extend(set.after_step.clone());
        self.wrap_fanout.extend(set.wrap_fanout.clone());
        self.on_error.extend(set.on_error.clone());
        self.after_run.extend(set.after_run.clone());
    }

    /// Number of callbacks registered for `phase`.
    pub fn count(&self, phase: HookPhase) -> usize {
        match phase {
            HookPhase::BeforeRun => self.before_run.len(),
            HookPhase::BeforeStep => self.before_step.len(),
            HookPhase::WrapStep => self.wrap_step.len(),
            HookPhase::AfterStep => self.after_step.len(),
            HookPhase::WrapFanout => self.wrap_fanout.len(),
            HookPhase::OnError => self.on_error.len(),
            HookPhase::AfterRun => self.after_run.len(),
        }
    }
}

impl fmt::Debug for FlatHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for phase in HookPhase::ALL {
            map.entry(&phase.to_string(), &self.count(phase));
        }
        map.finish()
    }
}

/// Append-only list of hook sets with a lazily flattened view.
///
/// Registration is expected while a workflow is being assembled; each
/// registration drops the cached view, which is rebuilt on the next run.
#[derive(Clone, Default)]
pub struct HookRegistry {
    sets: Vec<HookSet>,
    flat: OnceLock<FlatHooks>,
}

impl HookRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook set and invalidates the flattened view.
    pub fn register(&mut self, set: HookSet) {
        self.sets.push(set);
        self.flat = OnceLock::new();
    }

    /// Returns the flattened view, building it if needed.
    pub fn flattened(&self) -> &FlatHooks {
        self.flat.get_or_init(|| {
            let mut flat = FlatHooks::default();
            for set in &self.sets {
                flat.extend(set);
            }
            flat
        })
    }

    /// Number of registered hook sets.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Returns `true` if nothing was registered.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("sets", &self.sets.len())
            .field("cached", &self.flat.get().is_some())
            .finish()
    }
}
