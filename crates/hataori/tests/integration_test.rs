use futures::StreamExt;
use hataori::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn push(ctx: &mut Context, key: &str, entry: impl Into<String>) {
    let mut list = ctx.get_as::<Vec<String>>(key).unwrap_or_default();
    list.push(entry.into());
    ctx.insert(key, list);
}

fn list(ctx: &Context, key: &str) -> Vec<String> {
    ctx.get_as(key).unwrap_or_default()
}

fn record(tag: &'static str) -> impl Action {
    action_fn(move |ctx, _| {
        push(ctx, "visited", tag);
        Ok(StepOutput::Next)
    })
}

#[tokio::test]
async fn test_count_to_three_with_jump() {
    init_tracing();
    let workflow = Workflow::builder()
        .add_step(
            "set_count",
            action_fn(|ctx, _| {
                ctx.insert("count", 0);
                Ok(StepOutput::Next)
            }),
            StepConfig::default(),
        )
        .anchor("loop")
        .add_step(
            "increment",
            action_fn(|ctx, _| {
                push(ctx, "visited", "increment");
                let count = ctx.get_as::<i64>("count").unwrap_or(0) + 1;
                ctx.insert("count", count);
                if count < 3 {
                    Ok(StepOutput::jump("loop"))
                } else {
                    Ok(StepOutput::Next)
                }
            }),
            StepConfig::default(),
        )
        .then(record("finish"))
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    ctx.insert("count", 0);
    assert_ok!(workflow.run(&mut ctx, &Params::new()).await);

    assert_eq!(ctx.get_as::<i64>("count"), Some(3));
    assert_eq!(
        list(&ctx, "visited"),
        vec!["increment", "increment", "increment", "finish"]
    );
}

#[tokio::test]
async fn test_retries_invoke_action_exactly_n_times() {
    init_tracing();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let workflow = Workflow::builder()
        .then_with(
            action_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<StepOutput, _>(WorkflowError::failed("still broken"))
            }),
            StepConfig::default()
                .retries(4)
                .delay(Duration::from_millis(1)),
        )
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    let error = assert_err!(workflow.run(&mut ctx, &Params::new()).await);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(error.to_string(), "Step #0 (function) failed: still broken");
}

#[tokio::test]
async fn test_dynamic_retries_read_params() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let workflow = Workflow::builder()
        .then_with(
            action_fn(move |_, _| {
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 3 {
                    Err(WorkflowError::failed("flaky"))
                } else {
                    Ok(StepOutput::Next)
                }
            }),
            StepConfig::default().retries(Dynamic::from_fn(|_: &Context, params: &Params| {
                params
                    .get("attempts")
                    .and_then(Value::as_u64)
                    .map_or(1, |n| n as u32)
            })),
        )
        .build()
        .expect("valid workflow");

    let mut params = Params::new();
    params.insert("attempts".to_string(), json!(3));
    let mut ctx = Context::new();
    assert_ok!(workflow.run(&mut ctx, &params).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_bounds_whole_retry_sequence() {
    init_tracing();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let workflow = Workflow::builder()
        .then_with(
            async_fn(move |_, _| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err::<StepOutput, _>(WorkflowError::failed("slow failure"))
                })
            }),
            StepConfig::default()
                .retries(10)
                .timeout(Duration::from_millis(120)),
        )
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    let error = assert_err!(workflow.run(&mut ctx, &Params::new()).await);
    assert!(matches!(
        error.cause(),
        WorkflowError::Timeout(limit) if *limit == Duration::from_millis(120)
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_isolated_fanout_merges_drafts() {
    init_tracing();
    let branches: Vec<BranchRef> = (0..3)
        .map(|i| {
            branch(branch_fn(move |ctx, _| {
                let base = ctx.get_as::<i64>("base").unwrap_or(0);
                ctx.insert(format!("branch_{i}"), base + i);
                Ok(())
            }))
        })
        .collect();

    let workflow = Workflow::builder()
        .parallel_isolated(
            branches,
            merge_fn(|ctx, drafts, _| {
                ctx.insert("untouched_before_merge", !ctx.contains_key("branch_0"));
                let keys: Vec<usize> = drafts.iter().map(Context::len).collect();
                ctx.insert("draft_sizes", json!(keys));
                let mut total = 0;
                for (i, draft) in drafts.iter().enumerate() {
                    total += draft.get_as::<i64>(&format!("branch_{i}")).unwrap_or(0);
                }
                ctx.insert("total", total);
                Ok(())
            }),
            StepConfig::default(),
        )
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    ctx.insert("base", 10);
    assert_ok!(workflow.run(&mut ctx, &Params::new()).await);

    assert_eq!(ctx.get_as::<bool>("untouched_before_merge"), Some(true));
    // each draft holds "base" plus its own branch key only
    assert_eq!(ctx.get_as::<Vec<usize>>("draft_sizes"), Some(vec![2, 2, 2]));
    assert_eq!(ctx.get_as::<i64>("total"), Some(33));
    assert!(!ctx.contains_key("branch_1"));
}

#[tokio::test]
async fn test_direct_fanout_shares_context() {
    let branches: Vec<BranchRef> = (0..4)
        .map(|_| {
            branch(branch_async_fn(|ctx: &mut BranchContext<'_>, _: &Params| {
                Box::pin(async move {
                    tokio::task::yield_now().await;
                    let mut ctx = ctx.lock().await;
                    let hits = ctx.get_as::<i64>("hits").unwrap_or(0);
                    ctx.insert("hits", hits + 1);
                    Ok(())
                })
            }))
        })
        .collect();

    let workflow = Workflow::builder()
        .parallel(branches)
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    assert_ok!(workflow.run(&mut ctx, &Params::new()).await);
    assert_eq!(ctx.get_as::<i64>("hits"), Some(4));
}

#[tokio::test(start_paused = true)]
async fn test_direct_fanout_runs_branches_concurrently() {
    let branches: Vec<BranchRef> = (0..3)
        .map(|i| {
            branch(branch_async_fn(move |ctx: &mut BranchContext<'_>, _: &Params| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    ctx.lock().await.insert(format!("done_{i}"), true);
                    Ok(())
                })
            }))
        })
        .collect();

    let workflow = Workflow::builder()
        .parallel(branches)
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    let started = tokio::time::Instant::now();
    assert_ok!(workflow.run(&mut ctx, &Params::new()).await);
    // sequential branches would need 300ms
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(ctx.len(), 3);
}

#[tokio::test]
async fn test_direct_branches_can_wait_on_each_other() {
    let ready = Arc::new(tokio::sync::Notify::new());
    let waiter = Arc::clone(&ready);
    let signaller = Arc::clone(&ready);

    let branches: Vec<BranchRef> = vec![
        branch(branch_async_fn(move |ctx: &mut BranchContext<'_>, _: &Params| {
            let waiter = Arc::clone(&waiter);
            Box::pin(async move {
                waiter.notified().await;
                let mut ctx = ctx.lock().await;
                push(&mut ctx, "order", "waiter");
                Ok(())
            })
        })),
        branch(branch_async_fn(move |ctx: &mut BranchContext<'_>, _: &Params| {
            let signaller = Arc::clone(&signaller);
            Box::pin(async move {
                push(&mut *ctx.lock().await, "order", "signaller");
                signaller.notify_one();
                Ok(())
            })
        })),
    ];

    let workflow = Workflow::builder()
        .parallel_with(branches, StepConfig::default().timeout(Duration::from_secs(5)))
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    assert_ok!(workflow.run(&mut ctx, &Params::new()).await);
    assert_eq!(list(&ctx, "order"), vec!["signaller", "waiter"]);
}

#[tokio::test(start_paused = true)]
async fn test_direct_fanout_timeout_keeps_context() {
    let branches: Vec<BranchRef> = vec![branch(branch_async_fn(
        |ctx: &mut BranchContext<'_>, _: &Params| {
            Box::pin(async move {
                ctx.lock().await.insert("partial", true);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
        },
    ))];

    let workflow = Workflow::builder()
        .parallel_with(branches, StepConfig::default().timeout(Duration::from_millis(50)))
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    ctx.insert("kept", 1);
    let error = assert_err!(workflow.run(&mut ctx, &Params::new()).await);
    assert!(matches!(error.cause(), WorkflowError::Timeout(_)));
    assert_eq!(ctx.get_as::<i64>("kept"), Some(1));
    assert_eq!(ctx.get_as::<bool>("partial"), Some(true));
}

#[tokio::test]
async fn test_fanout_failures_are_aggregated_and_merge_skipped() {
    let branches: Vec<BranchRef> = vec![
        branch(branch_fn(|_, _| Ok(()))),
        branch(branch_fn(|_, _| Err(WorkflowError::failed("left broke")))),
        branch(branch_fn(|_, _| Err(WorkflowError::failed("right broke")))),
    ];
    let workflow = Workflow::builder()
        .then(record("before"))
        .parallel_isolated(
            branches,
            merge_fn(|ctx, _, _| {
                ctx.insert("merged", true);
                Ok(())
            }),
            StepConfig::default(),
        )
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    let error = assert_err!(workflow.run(&mut ctx, &Params::new()).await);
    assert_eq!(error.step().map(|s| s.index), Some(1));
    match error.cause() {
        WorkflowError::Parallel { total, failures } => {
            assert_eq!(*total, 3);
            let failed: Vec<usize> = failures.iter().map(|f| f.branch).collect();
            assert_eq!(failed, vec![1, 2]);
        }
        other => unreachable!("unexpected error: {other}"),
    }
    assert!(!ctx.contains_key("merged"));
}

#[tokio::test]
async fn test_batch_over_empty_items_never_runs_body() {
    let body = Workflow::builder()
        .then(record("body"))
        .build()
        .expect("valid body");
    let workflow = Workflow::builder()
        .batch(action_fn(|_, _| Ok(Vec::<Value>::new())), body)
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    ctx.insert(DEFAULT_BATCH_KEY, "prior");
    assert_ok!(workflow.run(&mut ctx, &Params::new()).await);
    assert!(list(&ctx, "visited").is_empty());
    assert_eq!(
        ctx.get_as::<String>(DEFAULT_BATCH_KEY).as_deref(),
        Some("prior")
    );
}

#[tokio::test]
async fn test_batch_body_sees_each_item() {
    let body = Workflow::builder()
        .then(action_fn(|ctx, _| {
            let item = ctx.get_as::<String>(DEFAULT_BATCH_KEY).unwrap_or_default();
            push(ctx, "visited", item);
            Ok(StepOutput::Next)
        }))
        .build()
        .expect("valid body");
    let workflow = Workflow::builder()
        .batch(
            action_fn(|_, _| Ok(vec![json!("x"), json!("y")])),
            body,
        )
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    assert_ok!(workflow.run(&mut ctx, &Params::new()).await);
    assert_eq!(list(&ctx, "visited"), vec!["x", "y"]);
    assert!(!ctx.contains_key(DEFAULT_BATCH_KEY));
}

#[tokio::test]
async fn test_interrupt_bypasses_error_hooks_and_resumes() {
    init_tracing();
    let workflow = Workflow::builder()
        .then(record("draft"))
        .then(action_fn(|ctx, _| {
            if ctx.get_as::<bool>("approved").unwrap_or(false) {
                Ok(StepOutput::Next)
            } else {
                Err(WorkflowError::interrupt("needs approval", ctx))
            }
        }))
        .then(record("publish"))
        .with(HookSet::new().on_error(|_, _, ctx, _| {
            ctx.insert("on_error_fired", true);
        }))
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    let error = assert_err!(workflow.run(&mut ctx, &Params::new()).await);
    assert!(!ctx.contains_key("on_error_fired"));
    assert!(error.step().is_none());

    let interrupt = error.as_interrupt().cloned().expect("interrupt");
    assert_eq!(interrupt.reason, "needs approval");

    let mut resumed = Context::from_snapshot(interrupt.snapshot);
    assert_eq!(list(&resumed, "visited"), vec!["draft"]);
    resumed.insert("approved", true);
    assert_ok!(workflow.run(&mut resumed, &Params::new()).await);
    assert_eq!(
        list(&resumed, "visited"),
        vec!["draft", "draft", "publish"]
    );
}

#[tokio::test]
async fn test_cancellation_prevents_next_step() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let workflow = Workflow::builder()
        .then(action_fn(move |ctx, _| {
            push(ctx, "visited", "first");
            trigger.cancel();
            Ok(StepOutput::Next)
        }))
        .then(record("second"))
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    let result = workflow
        .run_with_cancel(&mut ctx, &Params::new(), &cancel)
        .await;
    assert!(matches!(result, Err(WorkflowError::Cancelled)));
    assert_eq!(list(&ctx, "visited"), vec!["first"]);
}

#[tokio::test]
async fn test_stream_ends_with_single_done() {
    init_tracing();
    let workflow = Workflow::builder()
        .then(action_fn(|ctx, _| {
            for i in 0..3 {
                ctx.emit(i);
            }
            Ok(StepOutput::Next)
        }))
        .then(action_fn(|_, _| Ok(StepOutput::jump("missing"))))
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    let params = Params::new();
    let events: Vec<FlowEvent> = workflow.stream(&mut ctx, &params).collect().await;

    let chunks: Vec<&Value> = events
        .iter()
        .filter_map(|event| match event {
            FlowEvent::Chunk(value) => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![&json!(0), &json!(1), &json!(2)]);
    assert_eq!(events.iter().filter(|event| event.is_done()).count(), 1);
    assert!(events.last().is_some_and(FlowEvent::is_done));
    assert!(matches!(
        &events[events.len() - 2],
        FlowEvent::Error(error) if matches!(error.cause(), WorkflowError::UnknownAnchor(_))
    ));
}

#[tokio::test]
async fn test_stream_with_cancel_reports_cancellation() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let workflow = Workflow::builder()
        .then(record("never"))
        .build()
        .expect("valid workflow");

    let mut ctx = Context::new();
    let params = Params::new();
    let events: Vec<FlowEvent> = workflow
        .stream_with_cancel(&mut ctx, &params, cancel)
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], FlowEvent::Error(WorkflowError::Cancelled)));
    assert!(events[1].is_done());
}

#[tokio::test]
async fn test_graph_scenarios() {
    init_tracing();
    let graph = || {
        Graph::new()
            .add_node("A", record("A"))
            .add_node("B", record("B"))
            .add_node("C", record("C"))
            .add_edge("A", "B")
            .add_edge("B", "C")
            .add_conditional_edge(
                "A",
                "C",
                action_fn(|ctx, _| Ok(ctx.get_as::<bool>("skip").unwrap_or(false))),
            )
            .compile()
            .expect("acyclic graph")
    };

    let mut ctx = Context::new();
    ctx.insert("skip", true);
    assert_ok!(graph().run(&mut ctx, &Params::new()).await);
    assert_eq!(list(&ctx, "visited"), vec!["A", "C"]);

    let mut ctx = Context::new();
    ctx.insert("skip", false);
    assert_ok!(graph().run(&mut ctx, &Params::new()).await);
    assert_eq!(list(&ctx, "visited"), vec!["A", "B", "C"]);

    let cycle = Graph::new()
        .add_node("A", record("A"))
        .add_node("B", record("B"))
        .add_edge("A", "B")
        .add_edge("B", "A")
        .compile();
    let error = assert_err!(cycle);
    let message = error.to_string();
    assert!(message.contains('A') && message.contains('B'));
}
