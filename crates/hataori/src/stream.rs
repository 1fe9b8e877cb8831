//! Pull-based event stream over a running workflow.

use crate::workflow::Workflow;
use async_stream::stream;
use futures::future::Either;
use futures::Stream;
use hataori_core::{Context, Emitter, Params, StepInfo, StepKind, WorkflowError};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One observation delivered by [`Workflow::stream`].
#[derive(Debug)]
#[non_exhaustive]
pub enum FlowEvent {
    /// A top-level step is about to run.
    StepStarted {
        /// Position of the step.
        index: usize,
        /// Variant of the step.
        kind: StepKind,
    },
    /// A top-level step finished successfully.
    StepFinished {
        /// Position of the step.
        index: usize,
        /// Variant of the step.
        kind: StepKind,
    },
    /// A value pushed by a step through [`Context::emit`].
    Chunk(Value),
    /// The run failed.
    Error(WorkflowError),
    /// The run ended. Always the last event.
    Done,
}

impl FlowEvent {
    /// Returns `true` for [`FlowEvent::Done`].
    pub fn is_done(&self) -> bool {
        matches!(self, FlowEvent::Done)
    }
}

impl Workflow {
    /// Runs the workflow, yielding step boundaries and emitted values as
    /// they happen.
    ///
    /// Nothing runs until the stream is polled. A failure is delivered as
    /// [`FlowEvent::Error`]; [`FlowEvent::Done`] always ends the stream.
    /// Dropping the stream early abandons the run at its current await point
    /// and puts the context's previous emitter back.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::StreamExt;
    /// use hataori::prelude::*;
    ///
    /// # tokio_test::block_on(async {
    /// let workflow = Workflow::builder()
    ///     .then(action_fn(|ctx, _| {
    ///         ctx.emit("hello");
    ///         Ok(StepOutput::Next)
    ///     }))
    ///     .build()
    ///     .expect("valid workflow");
    ///
    /// let mut ctx = Context::new();
    /// let params = Params::new();
    /// let events: Vec<FlowEvent> = workflow.stream(&mut ctx, &params).collect().await;
    /// assert_eq!(events.len(), 4);
    /// assert!(events[3].is_done());
    /// # });
    /// ```
    pub fn stream<'a>(
        &'a self,
        ctx: &'a mut Context,
        params: &'a Params,
    ) -> impl Stream<Item = FlowEvent> + Send + 'a {
        self.stream_with_cancel(ctx, params, CancellationToken::new())
    }

    /// Like [`stream`](Self::stream), stopping at the next step boundary
    /// once `cancel` fires.
    pub fn stream_with_cancel<'a>(
        &'a self,
        ctx: &'a mut Context,
        params: &'a Params,
        cancel: CancellationToken,
    ) -> impl Stream<Item = FlowEvent> + Send + 'a {
        stream! {
            let (tx, mut rx) = mpsc::unbounded_channel();

            let mut hooks = self.flattened_hooks().clone();
            let started = tx.clone();
            hooks.before_step.push(Arc::new(
                move |step: &StepInfo, _: &mut Context, _: &Params| -> Result<(), WorkflowError> {
                    let _ = started.send(FlowEvent::StepStarted {
                        index: step.index,
                        kind: step.kind,
                    });
                    Ok(())
                },
            ));
            let finished = tx.clone();
            hooks.after_step.push(Arc::new(
                move |step: &StepInfo, _: &mut Context, _: &Params| -> Result<(), WorkflowError> {
                    let _ = finished.send(FlowEvent::StepFinished {
                        index: step.index,
                        kind: step.kind,
                    });
                    Ok(())
                },
            ));
            let mut scope = EmitterScope::install(ctx, Emitter::new(move |value| {
                let _ = tx.send(FlowEvent::Chunk(value));
            }));

            let outcome = {
                let run = self.run_with_hooks(&mut *scope.ctx, params, &cancel, &hooks);
                tokio::pin!(run);
                loop {
                    let next = tokio::select! {
                        biased;
                        Some(event) = rx.recv() => Either::Left(event),
                        outcome = &mut run => Either::Right(outcome),
                    };
                    match next {
                        Either::Left(event) => yield event,
                        Either::Right(outcome) => break outcome,
                    }
                }
            };

            drop(scope);
            drop(hooks);
            while let Ok(event) = rx.try_recv() {
                yield event;
            }
            if let Err(error) = outcome {
                debug!(error = %error, "Streamed run failed");
                yield FlowEvent::Error(error);
            }
            yield FlowEvent::Done;
        }
    }
}

/// Keeps the stream's emitter on the context for one run. The previous
/// emitter comes back on drop, also when the consumer drops the stream early.
struct EmitterScope<'a> {
    ctx: &'a mut Context,
    previous: Option<Emitter>,
}

impl<'a> EmitterScope<'a> {
    fn install(ctx: &'a mut Context, emitter: Emitter) -> Self {
        let previous = ctx.set_emitter(Some(emitter));
        Self { ctx, previous }
    }
}

impl Drop for EmitterScope<'_> {
    fn drop(&mut self) {
        self.ctx.set_emitter(self.previous.take());
    }
}
