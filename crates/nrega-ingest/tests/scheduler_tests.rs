//! Scheduler state machine tests
//!
//! Runs use real time with millisecond backoff so retries resolve quickly.
//! The cadence is set an hour out unless a test exercises it.

mod common;

use common::{
    entry, init_tracing, payload, pipeline, BlockingSource, PanickingSource, ScriptedSource, StaticSource,
};
use nrega_ingest::{
    BackoffPolicy, Cadence, FetchError, IngestPipeline, MemoryRecordStore, PayloadSource, RunEvent,
    RunOutcome, RunTrigger, Scheduler, SchedulerConfig, SchedulerHandle, SchedulerState, TriggerResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast_backoff(max_retries: u32) -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(40), Duration::from_millis(200), max_retries)
}

fn quiet_config() -> SchedulerConfig {
    SchedulerConfig::new(Cadence::Every(Duration::from_secs(3600))).with_backoff(fast_backoff(2))
}

fn build(source: Arc<dyn PayloadSource>) -> Arc<IngestPipeline> {
    Arc::new(pipeline(source, Arc::new(MemoryRecordStore::new())))
}

fn start(source: Arc<dyn PayloadSource>, config: SchedulerConfig) -> (SchedulerHandle, broadcast::Receiver<RunEvent>) {
    let handle = Scheduler::new(build(source), config).start();
    let events = handle.subscribe();
    (handle, events)
}

async fn next_event(events: &mut broadcast::Receiver<RunEvent>) -> RunEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for run event")
        .expect("event channel closed")
}

fn good_payload() -> String {
    payload(&[entry("Patna", 3), entry("Gaya", 4)])
}

#[tokio::test]
async fn test_trigger_while_running_is_coalesced() {
    init_tracing();
    let source = BlockingSource::new(good_payload());
    let (mut handle, mut events) = start(source.clone(), quiet_config());

    assert_eq!(handle.trigger(), TriggerResult::Accepted);
    timeout(WAIT, source.wait_started()).await.unwrap();

    assert_eq!(handle.trigger(), TriggerResult::Coalesced);
    assert_eq!(handle.trigger(), TriggerResult::Coalesced);
    assert_eq!(handle.state(), SchedulerState::Running { attempt: 1 });

    source.release();
    let event = next_event(&mut events).await;
    assert_eq!(event.outcome, RunOutcome::Success);
    assert_eq!(event.records_total, 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(source.fetch_count(), 1);
    assert_eq!(handle.state(), SchedulerState::Idle);

    handle.stop().await;
}

#[tokio::test]
async fn test_failures_back_off_then_abandon_cycle() {
    init_tracing();
    let source = ScriptedSource::failing(FetchError::HttpStatus(503));
    let (mut handle, mut events) = start(source.clone(), quiet_config());

    assert_eq!(handle.trigger(), TriggerResult::Accepted);

    let first = next_event(&mut events).await;
    assert_eq!((first.trigger, first.attempt), (RunTrigger::Manual, 1));
    assert!(first.outcome.is_failure());

    let second = next_event(&mut events).await;
    assert_eq!((second.trigger, second.attempt), (RunTrigger::Retry, 2));
    assert!(second.outcome.is_failure());

    let third = next_event(&mut events).await;
    assert_eq!((third.trigger, third.attempt), (RunTrigger::Retry, 3));
    assert_eq!(handle.state(), SchedulerState::Idle);

    // abandoned: nothing else runs before the next cadence tick
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(source.fetch_count(), 3);
    assert!(events.try_recv().is_err());

    handle.stop().await;
}

#[tokio::test]
async fn test_backoff_state_reports_growing_delay() {
    init_tracing();
    let source = ScriptedSource::failing(FetchError::Timeout(Duration::from_secs(30)));
    let config = SchedulerConfig::new(Cadence::Every(Duration::from_secs(3600))).with_backoff(
        BackoffPolicy::new(Duration::from_millis(200), Duration::from_millis(1000), 3),
    );
    let (mut handle, mut events) = start(source, config);
    let mut states = handle.watch_state();

    handle.trigger();
    let mut delays = Vec::new();
    for _ in 0..3 {
        next_event(&mut events).await;
        let state = timeout(WAIT, states.wait_for(|s| matches!(s, SchedulerState::Backoff { .. })))
            .await
            .unwrap()
            .unwrap()
            .clone();
        if let SchedulerState::Backoff { retry_in, .. } = state {
            delays.push(retry_in);
        }
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800)
        ]
    );

    handle.stop().await;
}

#[tokio::test]
async fn test_success_after_retry_resets_attempts() {
    init_tracing();
    let source = ScriptedSource::new(
        vec![Err(FetchError::Network("connection reset".into()))],
        Ok(good_payload()),
    );
    let (mut handle, mut events) = start(source, quiet_config());

    handle.trigger();
    let failed = next_event(&mut events).await;
    assert!(failed.outcome.is_failure());

    let retried = next_event(&mut events).await;
    assert_eq!((retried.trigger, retried.attempt), (RunTrigger::Retry, 2));
    assert_eq!(retried.outcome, RunOutcome::Success);
    assert_eq!(handle.state(), SchedulerState::Idle);

    assert_eq!(handle.trigger(), TriggerResult::Accepted);
    let fresh = next_event(&mut events).await;
    assert_eq!((fresh.trigger, fresh.attempt), (RunTrigger::Manual, 1));

    handle.stop().await;
}

#[tokio::test]
async fn test_manual_trigger_during_backoff_consumes_retry() {
    init_tracing();
    let source = ScriptedSource::new(vec![Err(FetchError::HttpStatus(500))], Ok(good_payload()));
    let config = SchedulerConfig::new(Cadence::Every(Duration::from_secs(3600))).with_backoff(BackoffPolicy::new(
        Duration::from_secs(600),
        Duration::from_secs(3600),
        3,
    ));
    let (mut handle, mut events) = start(source.clone(), config);

    handle.trigger();
    next_event(&mut events).await;
    assert_eq!(
        handle.state(),
        SchedulerState::Backoff {
            next_attempt: 2,
            retry_in: Duration::from_secs(600)
        }
    );

    assert_eq!(handle.trigger(), TriggerResult::Accepted);
    let event = next_event(&mut events).await;
    assert_eq!((event.trigger, event.attempt), (RunTrigger::Manual, 2));
    assert_eq!(event.outcome, RunOutcome::Success);
    assert_eq!(handle.state(), SchedulerState::Idle);
    assert_eq!(source.fetch_count(), 2);

    handle.stop().await;
}

#[tokio::test]
async fn test_partial_run_is_not_retried() {
    init_tracing();
    let body = payload(&[entry("Patna", 1), serde_json::json!({ "state": "Bihar" })]);
    let source = StaticSource::new(body);
    let (mut handle, mut events) = start(source.clone(), quiet_config());

    handle.trigger();
    let event = next_event(&mut events).await;
    assert_eq!(event.outcome, RunOutcome::Partial { failed: 1, total: 2 });
    assert_eq!(handle.state(), SchedulerState::Idle);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(source.fetch_count(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_cadence_starts_runs() {
    init_tracing();
    let source = StaticSource::new(good_payload());
    let config = SchedulerConfig::new(Cadence::Every(Duration::from_millis(100)));
    let (mut handle, mut events) = start(source, config);

    let first = next_event(&mut events).await;
    assert_eq!((first.trigger, first.attempt), (RunTrigger::Scheduled, 1));
    let second = next_event(&mut events).await;
    assert_eq!(second.trigger, RunTrigger::Scheduled);

    handle.stop().await;
}

#[tokio::test]
async fn test_run_on_startup() {
    init_tracing();
    let source = StaticSource::new(good_payload());
    let mut handle = Scheduler::new(build(source.clone()), quiet_config().with_run_on_startup(true)).start();
    let mut states = handle.watch_state();

    timeout(
        WAIT,
        states.wait_for(|s| *s == SchedulerState::Idle && source.fetch_count() == 1),
    )
    .await
    .unwrap()
    .unwrap();

    handle.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_in_flight_run() {
    init_tracing();
    let source = BlockingSource::new(good_payload());
    let (mut handle, mut events) = start(source.clone(), quiet_config());

    handle.trigger();
    timeout(WAIT, source.wait_started()).await.unwrap();

    timeout(WAIT, handle.stop()).await.expect("stop must not wait for the fetch");

    let event = next_event(&mut events).await;
    assert_eq!(event.outcome, RunOutcome::Cancelled);
    assert_eq!(handle.state(), SchedulerState::Stopped);
    assert_eq!(handle.trigger(), TriggerResult::Stopped);
}

#[tokio::test]
async fn test_panicking_run_is_a_failure() {
    init_tracing();
    let config = SchedulerConfig::new(Cadence::Every(Duration::from_secs(3600))).with_backoff(
        BackoffPolicy::new(Duration::from_secs(600), Duration::from_secs(3600), 3),
    );
    let (mut handle, mut events) = start(Arc::new(PanickingSource), config);

    handle.trigger();
    let event = next_event(&mut events).await;
    assert!(event.outcome.is_failure());
    assert!(matches!(handle.state(), SchedulerState::Backoff { next_attempt: 2, .. }));

    handle.stop().await;
}
