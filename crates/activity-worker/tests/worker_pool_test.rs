//! Integration tests for WorkerPool driven by InMemoryTaskSource
//!
//! Run with: cargo test -p activity-worker --test worker_pool_test

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use activity_worker::source::TaskStatus;
use activity_worker::task::MAX_ERROR_LEN;
use activity_worker::worker::{ReportKind, SlotState};
use activity_worker::{
    Heartbeat, InMemoryTaskSource, SourceError, TaskError, TaskHandler, WorkerConfig, WorkerError,
    WorkerEvent, WorkerPool,
};

const EVENT_WAIT: Duration = Duration::from_secs(30);

/// Receive the next event, failing the test if none arrives in time
async fn next_event(events: &mut broadcast::Receiver<WorkerEvent>) -> WorkerEvent {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("timed out waiting for worker event")
        .expect("event channel closed")
}

/// Receive events up to and including the first one matching `done`
async fn collect_until<F>(events: &mut broadcast::Receiver<WorkerEvent>, mut done: F) -> Vec<WorkerEvent>
where
    F: FnMut(&WorkerEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

/// Receive events until `count` events of the given kind have been seen
async fn collect_kind(
    events: &mut broadcast::Receiver<WorkerEvent>,
    kind: &'static str,
    count: usize,
) -> Vec<WorkerEvent> {
    let mut remaining = count;
    collect_until(events, move |event| {
        if event.kind() == kind {
            remaining -= 1;
        }
        remaining == 0
    })
    .await
}

fn kinds(events: &[WorkerEvent]) -> Vec<&'static str> {
    events.iter().map(WorkerEvent::kind).collect()
}

fn config() -> WorkerConfig {
    WorkerConfig::new("test-activity")
}

/// Handler that waits until the gate opens
fn gated(gate: watch::Receiver<bool>) -> impl TaskHandler {
    move |input: Value, _heartbeat: Heartbeat| {
        let mut gate = gate.clone();
        async move {
            let _ = gate.wait_for(|open| *open).await;
            Ok::<_, TaskError>(input)
        }
    }
}

fn sleeping(delay: Duration) -> impl TaskHandler {
    move |input: Value, _heartbeat: Heartbeat| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, TaskError>(input)
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_sequential_tasks_report_matching_tokens() {
    let source = Arc::new(InMemoryTaskSource::new());
    let pool = WorkerPool::new(
        config(),
        source.clone(),
        |input: Value, _heartbeat: Heartbeat| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(input, json!({"foo": "bar"}));
            Ok::<_, TaskError>(json!({"foo2": "bar2"}))
        },
    )
    .unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();

    let first = source.submit(&json!({"foo": "bar"}));
    let mut seen = collect_kind(&mut events, "success", 1).await;
    let second = source.submit(&json!({"foo": "bar"}));
    seen.extend(collect_kind(&mut events, "success", 1).await);

    let flow: Vec<_> = seen
        .iter()
        .filter(|e| matches!(e, WorkerEvent::Task(_) | WorkerEvent::Success(_)))
        .map(|e| (e.kind(), e.token().unwrap_or_default().to_string()))
        .collect();
    assert_eq!(
        flow,
        vec![
            ("task", first.clone()),
            ("success", first.clone()),
            ("task", second.clone()),
            ("success", second.clone()),
        ]
    );
    for event in &seen {
        if let WorkerEvent::Success(success) = event {
            assert_eq!(success.output, json!({"foo2": "bar2"}));
        }
    }
    assert_eq!(source.output(&first).as_deref(), Some(r#"{"foo2":"bar2"}"#));
    assert_eq!(source.status(&second), Some(TaskStatus::Succeeded));

    collect_kind(&mut events, "empty", 1).await;
    pool.stop().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_parallel_tasks_use_distinct_slots() {
    let delay = Duration::from_secs(1);
    let source = Arc::new(InMemoryTaskSource::new());
    let tokens: Vec<_> = (0..3).map(|n| source.submit(&json!({"n": n}))).collect();
    let pool = WorkerPool::new(
        config().with_worker_name("parallel").with_poll_concurrency(3),
        source.clone(),
        sleeping(delay),
    )
    .unwrap();
    let mut events = pool.subscribe();

    let started = Instant::now();
    pool.start().unwrap();
    let seen = collect_kind(&mut events, "success", 3).await;
    let elapsed = started.elapsed();

    let names: HashSet<_> = seen
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::Task(task) => Some(task.worker_name.clone()),
            _ => None,
        })
        .collect();
    let expected: HashSet<_> = ["parallel-0", "parallel-1", "parallel-2"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(names, expected);

    assert!(elapsed >= delay);
    assert!(elapsed < delay * 2, "tasks ran serially: {elapsed:?}");
    for token in &tokens {
        assert_eq!(source.status(token), Some(TaskStatus::Succeeded));
    }

    pool.stop().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_task_concurrency_one_runs_tasks_sequentially() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = {
        let running = running.clone();
        let peak = peak.clone();
        move |input: Value, _heartbeat: Heartbeat| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TaskError>(input)
            }
        }
    };

    let source = Arc::new(InMemoryTaskSource::new());
    for n in 0..3 {
        source.submit(&json!({"n": n}));
    }
    let pool = WorkerPool::new(
        config().with_poll_concurrency(3).with_task_concurrency(1),
        source.clone(),
        handler,
    )
    .unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();
    assert_eq!(pool.slot_count(), 1);

    let mut seen = collect_kind(&mut events, "success", 3).await;
    seen.extend(collect_kind(&mut events, "empty", 1).await);

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let load: Vec<_> = kinds(&seen)
        .into_iter()
        .filter(|k| matches!(*k, "task" | "success" | "full" | "empty"))
        .collect();
    assert_eq!(
        load,
        vec![
            "task", "full", "success", "empty", //
            "task", "full", "success", "empty", //
            "task", "full", "success", "empty",
        ]
    );
    assert_eq!(source.pending_task_count(), 0);

    pool.stop().await.unwrap();
}

struct Exploding;

#[async_trait::async_trait]
impl TaskHandler for Exploding {
    async fn handle(&self, _input: Value, _heartbeat: Heartbeat) -> Result<Value, TaskError> {
        panic!("custom error");
    }
}

#[test_log::test(tokio::test)]
async fn test_panicking_handler_reports_failure() {
    let source = Arc::new(InMemoryTaskSource::new());
    let token = source.submit(&json!({}));
    let pool = WorkerPool::new(config(), source.clone(), Exploding).unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();

    let seen = collect_kind(&mut events, "failure", 1).await;
    match seen.last() {
        Some(WorkerEvent::Failure(failure)) => {
            assert_eq!(failure.token, token);
            assert_eq!(failure.error.message, "custom error");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(source.status(&token), Some(TaskStatus::Failed));
    let payload: Value = serde_json::from_str(&source.error(&token).unwrap()).unwrap();
    assert_eq!(payload["message"], "custom error");

    collect_kind(&mut events, "empty", 1).await;
    assert!(pool.is_running());
    pool.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_stop_with_task_ongoing() {
    let (open, gate) = watch::channel(false);
    let source = Arc::new(InMemoryTaskSource::new());
    let token = source.submit(&json!({"slow": true}));
    let pool = WorkerPool::new(config(), source.clone(), gated(gate)).unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();

    collect_kind(&mut events, "task", 1).await;

    match pool.stop().await {
        Err(WorkerError::TasksOngoing { count }) => assert_eq!(count, 1),
        other => panic!("unexpected stop result: {other:?}"),
    }
    assert_eq!(pool.slot_count(), 0);
    assert!(!pool.is_running());

    open.send_replace(true);
    collect_kind(&mut events, "empty", 1).await;

    assert_eq!(source.status(&token), Some(TaskStatus::Succeeded));
    pool.stop().await.unwrap();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_concurrent_stops_and_restart() {
    let source = Arc::new(InMemoryTaskSource::new());
    let pool = WorkerPool::new(
        config().with_poll_concurrency(3),
        source.clone(),
        sleeping(Duration::from_millis(1)),
    )
    .unwrap();
    let mut events = pool.subscribe();

    pool.start().unwrap();
    pool.start().unwrap();
    assert_eq!(pool.slot_count(), 3);

    let (first, second) = tokio::join!(pool.stop(), pool.stop());
    first.unwrap();
    second.unwrap();
    assert_eq!(pool.slot_count(), 0);
    assert_eq!(pool.poll_concurrency(), 0);

    pool.start().unwrap();
    pool.restart().await.unwrap();
    assert_eq!(pool.slot_count(), 3);
    assert_eq!(pool.poll_concurrency(), 3);
    assert!(pool.is_running());

    let ready = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, WorkerEvent::Ready))
        .count();
    assert_eq!(ready, 3);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_refuses_while_tasks_ongoing() {
    let (open, gate) = watch::channel(false);
    let source = Arc::new(InMemoryTaskSource::new());
    source.submit(&json!({}));
    let pool = WorkerPool::new(config(), source.clone(), gated(gate)).unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();
    collect_kind(&mut events, "task", 1).await;

    assert!(matches!(
        pool.restart().await,
        Err(WorkerError::TasksOngoing { count: 1 })
    ));
    assert!(!pool.is_running());

    open.send_replace(true);
    collect_kind(&mut events, "empty", 1).await;
    pool.restart().await.unwrap();
    assert_eq!(pool.slot_count(), 1);
    pool.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slots_bounded_by_task_concurrency() {
    let (open, gate) = watch::channel(false);
    let source = Arc::new(InMemoryTaskSource::new());
    for n in 0..5 {
        source.submit(&json!({"n": n}));
    }
    let pool = WorkerPool::new(
        config().with_poll_concurrency(2).with_task_concurrency(3),
        source.clone(),
        gated(gate),
    )
    .unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();

    collect_kind(&mut events, "full", 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(pool.active_tasks(), 3);
    assert_eq!(pool.slot_count(), 0);
    assert_eq!(source.pending_task_count(), 2);

    let report = pool.report();
    assert!(report.slots.is_empty());
    assert_eq!(report.tasks.len(), 3);

    open.send_replace(true);
    collect_kind(&mut events, "success", 5).await;
    collect_kind(&mut events, "empty", 1).await;
    assert_eq!(source.pending_task_count(), 0);

    pool.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shrinking_poll_concurrency_retires_slots() {
    let source = Arc::new(InMemoryTaskSource::with_long_poll_timeout(
        Duration::from_millis(10),
    ));
    let pool = WorkerPool::new(
        config().with_poll_concurrency(3),
        source.clone(),
        sleeping(Duration::ZERO),
    )
    .unwrap();
    pool.start().unwrap();
    assert_eq!(pool.slot_count(), 3);

    pool.set_poll_concurrency(1).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pool.slot_count(), 1);
    let report = pool.report();
    assert!(report.slots[0].worker_name.starts_with("worker-"));
    assert_ne!(report.slots[0].state, SlotState::Stopped);

    pool.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_tasks() {
    let source = Arc::new(InMemoryTaskSource::new());
    let token = source.submit(&json!({}));
    let pool = WorkerPool::new(config(), source.clone(), sleeping(Duration::from_secs(2))).unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();
    collect_kind(&mut events, "task", 1).await;

    pool.shutdown().await.unwrap();

    assert_eq!(pool.active_tasks(), 0);
    assert_eq!(source.status(&token), Some(TaskStatus::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout() {
    let source = Arc::new(InMemoryTaskSource::new());
    source.submit(&json!({}));
    let pool = WorkerPool::new(
        config().with_shutdown_timeout(Duration::from_secs(1)),
        source.clone(),
        sleeping(Duration::from_secs(60)),
    )
    .unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();
    collect_kind(&mut events, "task", 1).await;

    assert!(matches!(
        pool.shutdown().await,
        Err(WorkerError::ShutdownTimeout)
    ));
    assert_eq!(pool.active_tasks(), 1);
}

// =============================================================================
// Reporting
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_single_terminal_report_with_late_heartbeat() {
    let kept: Arc<Mutex<Option<Heartbeat>>> = Arc::new(Mutex::new(None));
    let handler = {
        let kept = kept.clone();
        move |_input: Value, heartbeat: Heartbeat| {
            let kept = kept.clone();
            async move {
                heartbeat.beat().await;
                heartbeat.beat_with(json!({"progress": 50})).await;
                *kept.lock() = Some(heartbeat);
                Ok::<_, TaskError>(json!("done"))
            }
        }
    };

    let source = Arc::new(InMemoryTaskSource::new());
    let token = source.submit(&json!({}));
    let pool = WorkerPool::new(config(), source.clone(), handler).unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();

    let seen = collect_kind(&mut events, "empty", 1).await;
    assert_eq!(
        kinds(&seen),
        vec!["ready", "task", "heartbeat", "heartbeat", "success", "empty"]
    );

    let heartbeat = kept.lock().take().unwrap();
    assert!(heartbeat.is_finished());
    heartbeat.beat().await;

    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(source.terminal_report_count(&token), 1);
    assert_eq!(source.heartbeat_count(&token), 2);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_report_error_escalates_with_input() {
    let source = Arc::new(InMemoryTaskSource::new());
    let token = source.submit(&json!({"foo": "bar"}));
    source.fail_next_report(SourceError::Transport("connection reset".into()));
    let pool = WorkerPool::new(config(), source.clone(), sleeping(Duration::ZERO)).unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();

    let seen = collect_kind(&mut events, "error", 1).await;
    match seen.last() {
        Some(WorkerEvent::Error(WorkerError::Report {
            kind,
            token: reported,
            input,
            source: cause,
        })) => {
            assert_eq!(*kind, ReportKind::Success);
            assert_eq!(reported, &token);
            assert_eq!(input, &json!({"foo": "bar"}));
            assert_eq!(cause, &SourceError::Transport("connection reset".into()));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    collect_kind(&mut events, "empty", 1).await;
    assert!(pool.is_running());
    assert_eq!(pool.slot_count(), 1);
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_acquire_error_retires_slot() {
    let source = Arc::new(InMemoryTaskSource::new());
    source.fail_next_acquire(SourceError::Transport("unreachable".into()));
    let pool = WorkerPool::new(config(), source.clone(), sleeping(Duration::ZERO)).unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();

    let seen = collect_kind(&mut events, "error", 1).await;
    match seen.last() {
        Some(WorkerEvent::Error(WorkerError::Acquire { worker_name, .. })) => {
            assert_eq!(worker_name, "worker-0");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    tokio::task::yield_now().await;
    assert_eq!(pool.slot_count(), 0);

    pool.restart().await.unwrap();
    assert_eq!(pool.slot_count(), 1);
    let token = source.submit(&json!({}));
    collect_kind(&mut events, "success", 1).await;
    assert_eq!(source.status(&token), Some(TaskStatus::Succeeded));

    pool.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_empty_and_placeholder_responses_are_skipped() {
    let source = Arc::new(InMemoryTaskSource::with_long_poll_timeout(
        Duration::from_millis(10),
    ));
    source.submit_placeholder();
    let pool = WorkerPool::new(config(), source.clone(), sleeping(Duration::ZERO)).unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();

    tokio::time::sleep(Duration::from_millis(35)).await;
    let token = source.submit(&json!({"real": true}));

    let seen = collect_kind(&mut events, "success", 1).await;
    let tasks: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::Task(task) => Some(task.token.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tasks, vec![token]);
    assert!(source.acquire_requests().len() >= 3);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_long_failure_is_truncated() {
    let source = Arc::new(InMemoryTaskSource::new());
    let token = source.submit(&json!({}));
    let pool = WorkerPool::new(
        config(),
        source.clone(),
        |_input: Value, _heartbeat: Heartbeat| async move {
            Err::<Value, _>(TaskError::named("ValidationError", "y".repeat(300)))
        },
    )
    .unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();

    let seen = collect_kind(&mut events, "failure", 1).await;
    match seen.last() {
        Some(WorkerEvent::Failure(failure)) => {
            assert_eq!(failure.error.name, "ValidationError");
            assert_eq!(failure.error.message.len(), 300);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let stored = source.error(&token).unwrap();
    assert_eq!(stored.chars().count(), MAX_ERROR_LEN);
    assert!(stored.starts_with(r#"{"name":"ValidationError","message":"yyy"#));
    assert!(stored.ends_with("..."));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_input_fails_task() {
    let source = Arc::new(InMemoryTaskSource::new());
    let token = source.submit_raw("{not json");
    let pool = WorkerPool::new(config(), source.clone(), sleeping(Duration::ZERO)).unwrap();
    let mut events = pool.subscribe();
    pool.start().unwrap();

    let seen = collect_kind(&mut events, "failure", 1).await;
    match (&seen[1], seen.last()) {
        (WorkerEvent::Task(task), Some(WorkerEvent::Failure(failure))) => {
            assert_eq!(task.input, Value::String("{not json".into()));
            assert_eq!(failure.error.name, "InputDecodeError");
        }
        other => panic!("unexpected events: {other:?}"),
    }
    assert_eq!(source.status(&token), Some(TaskStatus::Failed));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_drop_stops_polling() {
    let source = Arc::new(InMemoryTaskSource::new());
    let pool = WorkerPool::new(
        config().with_poll_concurrency(2),
        source.clone(),
        sleeping(Duration::ZERO),
    )
    .unwrap();
    pool.start().unwrap();
    tokio::task::yield_now().await;
    let requests = source.acquire_requests().len();
    drop(pool);

    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    let token = source.submit(&json!({}));
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    assert_eq!(source.status(&token), Some(TaskStatus::Pending));
    assert_eq!(source.acquire_requests().len(), requests);
}
