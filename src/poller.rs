//! Snapshot poller.
//!
//! Polls a [`Fetcher`] on a fixed interval and publishes every result as an
//! immutable [`Snapshot`] on a watch channel. A failed fetch produces a
//! `success = false` snapshot and polling carries on; only [`PollerHandle::stop`]
//! (or dropping the handle) ends the loop.
//!
//! Ticks are strictly serialized: if a fetch is still in flight when the next
//! tick fires, that tick is skipped. Pausing keeps the interval running and
//! only suppresses fetches, so resuming never produces an extra tick.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::model::{Entity, IdentityKey, Snapshot};
use crate::source::Fetcher;

type FetchFuture = Pin<Box<dyn Future<Output = Result<Vec<Value>, SyncError>> + Send>>;

/// tokio intervals cannot be zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// What a failed poll shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep the last successfully fetched entities visible.
    #[default]
    KeepLast,
    /// Publish an empty entity list.
    ShowEmpty,
}

/// Configuration of a single poller instance.
#[derive(Debug, Clone)]
pub struct PollerOptions {
    /// Stream name used in logs.
    pub name: String,
    pub interval: Duration,
    pub on_failure: FailurePolicy,
    pub identity: IdentityKey,
}

impl PollerOptions {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            on_failure: FailurePolicy::default(),
            identity: IdentityKey::default(),
        }
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn identity(mut self, key: IdentityKey) -> Self {
        self.identity = key;
        self
    }
}

// ---------------------------------------------------------------------------
// Refresh triggers
// ---------------------------------------------------------------------------

/// Why an out-of-cycle poll was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    Manual,
    WriteConfirmed,
    Push,
}

/// Cloneable handle that requests an out-of-cycle poll.
///
/// Requests coalesce: while one is pending, further requests are absorbed.
#[derive(Debug, Clone)]
pub struct RefreshTrigger {
    stream: Arc<str>,
    tx: mpsc::Sender<RefreshReason>,
}

impl RefreshTrigger {
    /// Request a refresh. Returns `false` once the poller has stopped.
    pub fn request(&self, reason: RefreshReason) -> bool {
        match self.tx.try_send(reason) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PollCounters {
    polls: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    skipped_ticks: AtomicU64,
}

/// Counters for a staleness indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollStats {
    /// Completed fetches, successful or not.
    pub polls: u64,
    pub failures: u64,
    /// Failures where the backend answered but refused or garbled the reply.
    pub rejections: u64,
    /// Ticks or refresh requests dropped because a fetch was in flight.
    pub skipped_ticks: u64,
}

// ---------------------------------------------------------------------------
// SnapshotPoller
// ---------------------------------------------------------------------------

/// Starts polling loops.
pub struct SnapshotPoller;

impl SnapshotPoller {
    /// Start polling `fetcher` every `options.interval`.
    ///
    /// The first poll happens immediately. Must be called from within a
    /// tokio runtime.
    pub fn start(options: PollerOptions, fetcher: Arc<dyn Fetcher>) -> PollerHandle {
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let paused = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(PollCounters::default());
        let stream: Arc<str> = Arc::from(options.name.as_str());

        info!(
            stream = %stream,
            interval_ms = options.interval.as_millis() as u64,
            on_failure = ?options.on_failure,
            "starting snapshot poller"
        );

        let poll_loop = PollLoop {
            options,
            fetcher,
            cancel: cancel.clone(),
            paused: paused.clone(),
            counters: counters.clone(),
            snapshot_tx,
            sequence: 0,
            last_good: None,
        };
        let task = tokio::spawn(poll_loop.run(refresh_rx));

        PollerHandle {
            refresh: RefreshTrigger {
                stream,
                tx: refresh_tx,
            },
            cancel,
            paused,
            counters,
            snapshots: snapshot_rx,
            task: Some(task),
        }
    }
}

struct PollLoop {
    options: PollerOptions,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    counters: Arc<PollCounters>,
    snapshot_tx: watch::Sender<Option<Arc<Snapshot>>>,
    sequence: u64,
    last_good: Option<Arc<Snapshot>>,
}

impl PollLoop {
    async fn run(mut self, mut refresh_rx: mpsc::Receiver<RefreshReason>) {
        let mut ticker = tokio::time::interval(self.options.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<FetchFuture> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,
                result = wait_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    self.apply(result);
                }
                _ = ticker.tick() => self.begin(&mut in_flight, None),
                Some(reason) = refresh_rx.recv() => self.begin(&mut in_flight, Some(reason)),
            }
        }

        info!(stream = %self.options.name, polls = self.sequence, "snapshot poller stopped");
    }

    fn begin(&mut self, in_flight: &mut Option<FetchFuture>, reason: Option<RefreshReason>) {
        if self.paused.load(Ordering::Acquire) {
            debug!(stream = %self.options.name, ?reason, "poller paused, not fetching");
            return;
        }
        if in_flight.is_some() {
            self.counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            debug!(stream = %self.options.name, ?reason, "previous fetch still in flight, skipping");
            return;
        }

        let fetcher = self.fetcher.clone();
        *in_flight = Some(Box::pin(async move { fetcher.fetch().await }));
    }

    fn apply(&mut self, result: Result<Vec<Value>, SyncError>) {
        // A result that lands after stop() must not reach subscribers.
        if self.cancel.is_cancelled() {
            return;
        }

        self.sequence += 1;
        self.counters.polls.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();

        let built = result.and_then(|records| {
            Snapshot::from_records(
                self.sequence,
                records,
                &self.options.identity,
                self.last_good.as_deref(),
                now,
            )
        });

        let snapshot = match built {
            Ok(snapshot) => {
                debug!(
                    stream = %self.options.name,
                    sequence = snapshot.sequence,
                    entities = snapshot.len(),
                    "poll succeeded"
                );
                let snapshot = Arc::new(snapshot);
                self.last_good = Some(snapshot.clone());
                snapshot
            }
            Err(error) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                if error.is_rejection() {
                    self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        stream = %self.options.name,
                        sequence = self.sequence,
                        error = %error,
                        "poll rejected by backend"
                    );
                } else {
                    warn!(stream = %self.options.name, sequence = self.sequence, error = %error, "poll failed");
                }
                Arc::new(Snapshot::failed(self.sequence, error, self.retained(), now))
            }
        };

        self.snapshot_tx.send_replace(Some(snapshot));
    }

    fn retained(&self) -> Arc<Vec<Entity>> {
        match self.options.on_failure {
            FailurePolicy::KeepLast => self
                .last_good
                .as_ref()
                .map(|s| s.entities.clone())
                .unwrap_or_default(),
            FailurePolicy::ShowEmpty => Arc::default(),
        }
    }
}

async fn wait_in_flight(in_flight: &mut Option<FetchFuture>) -> Result<Vec<Value>, SyncError> {
    match in_flight.as_mut() {
        Some(fetch) => fetch.await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// PollerHandle
// ---------------------------------------------------------------------------

/// Owner handle of a running poller. Dropping it stops the poller.
pub struct PollerHandle {
    refresh: RefreshTrigger,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    counters: Arc<PollCounters>,
    snapshots: watch::Receiver<Option<Arc<Snapshot>>>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Suppress fetches without touching the interval schedule.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!(stream = %self.refresh.stream, "poller paused");
        }
    }

    /// Resume fetching at the next regularly scheduled tick.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!(stream = %self.refresh.stream, "poller resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Request an immediate out-of-cycle poll.
    pub fn refresh(&self) -> bool {
        self.refresh.request(RefreshReason::Manual)
    }

    /// A cloneable trigger for collaborators (write coordinator, push channel).
    pub fn trigger(&self) -> RefreshTrigger {
        self.refresh.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.snapshots.borrow().clone()
    }

    pub fn stats(&self) -> PollStats {
        PollStats {
            polls: self.counters.polls.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            skipped_ticks: self.counters.skipped_ticks.load(Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        self.refresh.stream()
    }

    /// Cancel the timer and any in-flight fetch. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop and wait for the polling task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(stream = %self.refresh.stream, error = %e, "poller task ended abnormally");
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
