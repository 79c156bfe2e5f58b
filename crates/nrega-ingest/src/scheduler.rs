//! Run scheduling and retry supervision
//!
//! A single supervisor task owns the cadence timer, the pending retry and
//! the published [`SchedulerState`]. Callers interact through
//! [`SchedulerHandle`], whose only mutators are `trigger` and `stop`.
//!
//! ```text
//! Idle --(cadence | trigger)--> Running --success/partial--> Idle
//!                                  |
//!                                  +--failure--> Backoff --(retry | trigger)--> Running
//!                                  |                |
//!                                  |                +--(retries exhausted)--> Idle
//!                                  +--cancelled--> Stopped
//! ```
//!
//! At most one run executes at a time. The [`RunGate`] is claimed atomically
//! by whoever starts a run and released by the supervisor once the outcome
//! is recorded; triggers that lose the claim are coalesced, never queued.

use chrono::Utc;
use cron::Schedule;
use nrega_common::{NregaError, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::models::{IngestionRun, RunEvent, RunOutcome, RunReport, RunStage, RunTrigger};
use crate::pipeline::IngestPipeline;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// When scheduled runs fire
#[derive(Debug, Clone)]
pub enum Cadence {
    Cron(Schedule),
    Every(Duration),
}

impl Cadence {
    /// Parse a cron expression or `@every <secs>s`
    ///
    /// Five-field cron (`min hour dom month dow`) runs at second 0 and takes
    /// POSIX weekday numbers (0 or 7 is Sunday). Six and seven field
    /// expressions are passed to the `cron` crate as-is, where 1 is Sunday.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();

        if let Some(rest) = expr.strip_prefix("@every") {
            let rest = rest.trim();
            let secs: u64 = rest
                .strip_suffix('s')
                .unwrap_or(rest)
                .trim()
                .parse()
                .map_err(|_| NregaError::config(format!("invalid interval '{}'", expr)))?;
            if secs == 0 {
                return Err(NregaError::config("interval must be at least one second"));
            }
            return Ok(Cadence::Every(Duration::from_secs(secs)));
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => format!(
                "0 {} {} {} {} {}",
                fields[0],
                fields[1],
                fields[2],
                fields[3],
                posix_weekdays(fields[4])?
            ),
            6 | 7 => expr.to_string(),
            n => {
                return Err(NregaError::config(format!(
                    "cron expression '{}' has {} fields, expected 5 to 7",
                    expr, n
                )))
            },
        };

        Schedule::from_str(&normalized)
            .map(Cadence::Cron)
            .map_err(|e| NregaError::config(format!("invalid cron expression '{}': {}", expr, e)))
    }

    /// Time until the next tick, `None` if the schedule never fires again
    pub fn next_delay(&self) -> Option<Duration> {
        match self {
            Cadence::Every(interval) => Some(*interval),
            Cadence::Cron(schedule) => {
                let now = Utc::now();
                let next = schedule.after(&now).next()?;
                Some((next - now).to_std().unwrap_or(Duration::ZERO))
            },
        }
    }
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a POSIX day-of-week field as a list of day names
fn posix_weekdays(field: &str) -> Result<String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let invalid = || NregaError::config(format!("invalid day-of-week field '{}'", field));
    let mut days = [false; 7];

    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: usize = step.parse().ok().filter(|s| *s > 0).ok_or_else(invalid)?;
                (base, step)
            },
            None => (item, 1),
        };
        let (first, last) = if base == "*" {
            (0, 6)
        } else if let Some((from, to)) = base.split_once('-') {
            (weekday(from).ok_or_else(invalid)?, weekday(to).ok_or_else(invalid)?)
        } else {
            // `n/step` runs from n to the end of the week
            let day = weekday(base).ok_or_else(invalid)?;
            (day, if item.contains('/') { 6 } else { day })
        };
        if first > last {
            return Err(invalid());
        }
        for day in (first..=last).step_by(step) {
            days[day % 7] = true;
        }
    }

    Ok(WEEKDAYS
        .iter()
        .zip(days)
        .filter_map(|(name, on)| on.then_some(*name))
        .collect::<Vec<_>>()
        .join(","))
}

/// 0-7 or a three-letter name
fn weekday(token: &str) -> Option<usize> {
    match token.parse::<usize>() {
        Ok(n) => (n <= 7).then_some(n),
        Err(_) => {
            let upper = token.to_ascii_uppercase();
            WEEKDAYS.iter().position(|name| *name == upper)
        },
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Cron(schedule) => write!(f, "{}", schedule),
            Cadence::Every(interval) => write!(f, "@every {}s", interval.as_secs()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cadence: Cadence,
    pub backoff: BackoffPolicy,
    /// Run once immediately when the scheduler starts
    pub run_on_startup: bool,
}

impl SchedulerConfig {
    pub fn new(cadence: Cadence) -> Self {
        Self {
            cadence,
            backoff: BackoffPolicy::default(),
            run_on_startup: false,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_run_on_startup(mut self, run_on_startup: bool) -> Self {
        self.run_on_startup = run_on_startup;
        self
    }
}

/// Observable scheduler state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running { attempt: u32 },
    Backoff { next_attempt: u32, retry_in: Duration },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResult {
    Accepted,
    /// A run is already in progress or about to start
    Coalesced,
    Stopped,
}

/// Exclusive "run in progress" flag
#[derive(Debug, Default)]
pub struct RunGate(AtomicBool);

impl RunGate {
    /// True if the caller now owns the gate
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct Scheduler {
    pipeline: Arc<IngestPipeline>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(pipeline: Arc<IngestPipeline>, config: SchedulerConfig) -> Self {
        Self { pipeline, config }
    }

    /// Spawn the supervisor task
    pub fn start(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let gate = Arc::new(RunGate::default());
        let (manual_tx, manual_rx) = mpsc::channel(1);
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        let state = Arc::new(state_tx);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            cadence = %self.config.cadence,
            max_retries = self.config.backoff.max_retries,
            "Scheduler started"
        );

        let supervisor = Supervisor {
            pipeline: self.pipeline,
            config: self.config,
            cancel: cancel.clone(),
            gate: gate.clone(),
            state: state.clone(),
            events: events.clone(),
            manual_rx,
        };
        let task = tokio::spawn(supervisor.run());

        SchedulerHandle {
            cancel,
            gate,
            manual_tx,
            state,
            events,
            task: Some(task),
        }
    }
}

pub struct SchedulerHandle {
    cancel: CancellationToken,
    gate: Arc<RunGate>,
    manual_tx: mpsc::Sender<()>,
    state: Arc<watch::Sender<SchedulerState>>,
    events: broadcast::Sender<RunEvent>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Request an immediate run
    ///
    /// A pending retry is consumed by the manual run, keeping its attempt
    /// number.
    pub fn trigger(&self) -> TriggerResult {
        if self.cancel.is_cancelled() {
            return TriggerResult::Stopped;
        }
        if !self.gate.try_claim() {
            debug!("Run already in progress, trigger coalesced");
            return TriggerResult::Coalesced;
        }

        match self.manual_tx.try_send(()) {
            Ok(()) => TriggerResult::Accepted,
            Err(mpsc::error::TrySendError::Full(())) => {
                self.gate.release();
                TriggerResult::Coalesced
            },
            Err(mpsc::error::TrySendError::Closed(())) => {
                self.gate.release();
                TriggerResult::Stopped
            },
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Events of runs finishing after this call
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Cancel any in-flight run and wait for the supervisor to exit
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler task terminated abnormally");
                self.state.send_replace(SchedulerState::Stopped);
            }
        }
        info!("Scheduler stopped");
    }
}

enum Wake {
    Manual,
    Retry,
    Cadence,
}

struct Supervisor {
    pipeline: Arc<IngestPipeline>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    gate: Arc<RunGate>,
    state: Arc<watch::Sender<SchedulerState>>,
    events: broadcast::Sender<RunEvent>,
    manual_rx: mpsc::Receiver<()>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut next_cadence = self.next_tick();
        // (when, attempt number of the retry)
        let mut pending_retry: Option<(Instant, u32)> = None;

        if self.config.run_on_startup && self.gate.try_claim() {
            pending_retry = self.run_once(RunTrigger::Scheduled, 1).await;
        }

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let retry_at = pending_retry.map(|(at, _)| at);
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                msg = self.manual_rx.recv() => match msg {
                    Some(()) => Wake::Manual,
                    None => break,
                },
                _ = sleep_until_opt(retry_at) => Wake::Retry,
                _ = sleep_until_opt(next_cadence) => Wake::Cadence,
            };

            let (trigger, attempt) = match wake {
                // gate already claimed by `trigger()`
                Wake::Manual => {
                    let attempt = pending_retry.take().map_or(1, |(_, attempt)| attempt);
                    (RunTrigger::Manual, attempt)
                },
                Wake::Retry => {
                    if !self.gate.try_claim() {
                        // a manual trigger is about to consume this retry
                        tokio::task::yield_now().await;
                        continue;
                    }
                    let attempt = pending_retry.take().map_or(1, |(_, attempt)| attempt);
                    (RunTrigger::Retry, attempt)
                },
                Wake::Cadence => {
                    next_cadence = self.next_tick();
                    if !self.gate.try_claim() {
                        debug!("Scheduled tick skipped, run already pending");
                        continue;
                    }
                    if pending_retry.take().is_some() {
                        info!("Scheduled run supersedes pending retry");
                    }
                    (RunTrigger::Scheduled, 1)
                },
            };

            pending_retry = self.run_once(trigger, attempt).await;

            // ticks that fell inside the run are coalesced into one
            if next_cadence.is_some_and(|at| at <= Instant::now()) {
                next_cadence = self.next_tick();
            }
        }

        self.state.send_replace(SchedulerState::Stopped);
    }

    fn next_tick(&self) -> Option<Instant> {
        let delay = self.config.cadence.next_delay();
        if delay.is_none() {
            warn!(cadence = %self.config.cadence, "Schedule has no upcoming ticks");
        }
        delay.map(|d| Instant::now() + d)
    }

    /// Execute one run while holding the gate; returns the retry to schedule
    async fn run_once(&self, trigger: RunTrigger, attempt: u32) -> Option<(Instant, u32)> {
        self.state.send_replace(SchedulerState::Running { attempt });

        let run = IngestionRun::new(trigger, attempt);
        let fallback = run.clone();
        let pipeline = self.pipeline.clone();
        let cancel = self.cancel.child_token();

        let (run, report) = match tokio::spawn(async move { pipeline.execute(run, cancel).await }).await {
            Ok(finished) => finished,
            Err(e) => {
                error!(run_id = %fallback.run_id, error = %e, "Ingestion run panicked");
                let mut run = fallback;
                run.stage = RunStage::Finished;
                run.outcome = Some(RunOutcome::failure(format!("run task aborted: {}", e)));
                (run, RunReport::default())
            },
        };

        let outcome = run.outcome.clone().unwrap_or(RunOutcome::Cancelled);
        let retry = match &outcome {
            RunOutcome::Success | RunOutcome::Partial { .. } => {
                self.state.send_replace(SchedulerState::Idle);
                None
            },
            RunOutcome::Failure { .. } => match self.config.backoff.retry_delay(attempt) {
                Some(delay) => {
                    self.state.send_replace(SchedulerState::Backoff {
                        next_attempt: attempt + 1,
                        retry_in: delay,
                    });
                    Some((Instant::now() + delay, attempt + 1))
                },
                None => {
                    error!(
                        alert = true,
                        run_id = %run.run_id,
                        attempts = attempt,
                        "Ingestion retries exhausted, abandoned until next scheduled run"
                    );
                    self.state.send_replace(SchedulerState::Idle);
                    None
                },
            },
            RunOutcome::Cancelled => None,
        };

        self.gate.release();

        let event = RunEvent::from_run(&run, &report);
        info!(
            run_id = %event.run_id,
            trigger = event.trigger.as_str(),
            attempt = event.attempt,
            outcome = event.outcome.as_str(),
            records_total = event.records_total,
            records_failed = event.records_failed,
            retry_in_secs = retry.map(|(at, _)| at.saturating_duration_since(Instant::now()).as_secs()),
            "Run outcome"
        );
        // no subscribers is fine
        let _ = self.events.send(event);

        retry
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
