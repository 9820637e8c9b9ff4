//! Live feed: one stream's poller, novelty detection and highlight window
//! composed behind a single handle.
//!
//! Novelty is always computed against the last *successful* snapshot, so a
//! failed poll in between neither flashes the retained rows as new nor hides
//! rows that arrived across the outage.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{Identity, Snapshot};
use crate::novelty::{self, HighlightTracker, NoveltySet};
use crate::poller::{PollerHandle, PollerOptions, SnapshotPoller};
use crate::projection::{Projection, Projector, ViewState};
use crate::source::Fetcher;

#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub poller: PollerOptions,
    pub highlight_window: Duration,
    /// Fields covered by free-text search.
    pub searchable: Vec<String>,
}

impl FeedOptions {
    pub fn new(poller: PollerOptions) -> Self {
        Self {
            poller,
            highlight_window: Duration::from_secs(3),
            searchable: Vec::new(),
        }
    }

    pub fn highlight_window(mut self, window: Duration) -> Self {
        self.highlight_window = window;
        self
    }

    pub fn searchable(mut self, fields: Vec<String>) -> Self {
        self.searchable = fields;
        self
    }
}

/// What a view of the stream renders from.
#[derive(Debug, Clone, Default)]
pub struct FeedState {
    /// Latest snapshot, successful or not. `None` before the first poll.
    pub snapshot: Option<Arc<Snapshot>>,
    /// Identities inside their highlight window.
    pub highlighted: NoveltySet,
}

impl FeedState {
    /// The displayed collection comes from a failed poll.
    pub fn is_stale(&self) -> bool {
        self.snapshot.as_ref().is_some_and(|s| !s.success)
    }

    pub fn is_highlighted(&self, identity: &Identity) -> bool {
        self.highlighted.contains(identity)
    }
}

/// A running stream. Dropping it stops polling.
pub struct LiveFeed {
    poller: PollerHandle,
    projector: Projector,
    state: watch::Receiver<FeedState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LiveFeed {
    /// Start polling `fetcher`. Must be called from within a tokio runtime.
    pub fn start(options: FeedOptions, fetcher: Arc<dyn Fetcher>) -> Self {
        let poller = SnapshotPoller::start(options.poller, fetcher);
        let (state_tx, state_rx) = watch::channel(FeedState::default());
        let cancel = CancellationToken::new();

        let tracker = FeedTracker {
            stream: poller.name().to_string(),
            snapshots: poller.subscribe(),
            highlights: HighlightTracker::new(options.highlight_window),
            last_good: None,
            current: None,
            state_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(tracker.run());

        Self {
            poller,
            projector: Projector::new(options.searchable),
            state: state_rx,
            cancel,
            task: Some(task),
        }
    }

    /// Pause, resume, refresh and triggers live on the poller.
    pub fn poller(&self) -> &PollerHandle {
        &self.poller
    }

    pub fn name(&self) -> &str {
        self.poller.name()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    pub fn state(&self) -> FeedState {
        self.state.borrow().clone()
    }

    /// Project the latest snapshot. `None` before the first poll completes.
    pub fn project(&self, view: &ViewState) -> Option<Projection> {
        let state = self.state.borrow();
        state
            .snapshot
            .as_deref()
            .map(|snapshot| self.projector.project(snapshot, view))
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.poller.stop();
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.poller.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(stream = %self.poller.name(), error = %e, "feed task ended abnormally");
            }
        }
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct FeedTracker {
    stream: String,
    snapshots: watch::Receiver<Option<Arc<Snapshot>>>,
    highlights: HighlightTracker,
    last_good: Option<Arc<Snapshot>>,
    current: Option<Arc<Snapshot>>,
    state_tx: watch::Sender<FeedState>,
    cancel: CancellationToken,
}

impl FeedTracker {
    async fn run(mut self) {
        loop {
            let deadline = self.highlights.deadline();
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,
                changed = self.snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let latest = self.snapshots.borrow_and_update().clone();
                    if let Some(snapshot) = latest {
                        self.observe(snapshot);
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.highlights.expire(Instant::now()) {
                        self.publish();
                    }
                }
            }
        }
        debug!(stream = %self.stream, "feed tracker stopped");
    }

    fn observe(&mut self, snapshot: Arc<Snapshot>) {
        if snapshot.success {
            let novelty = novelty::diff(self.last_good.as_deref(), &snapshot);
            if !novelty.is_empty() {
                debug!(
                    stream = %self.stream,
                    sequence = snapshot.sequence,
                    new = novelty.len(),
                    "new entities arrived"
                );
            }
            self.highlights.record(novelty, Instant::now());
            self.last_good = Some(snapshot.clone());
        }
        self.current = Some(snapshot);
        self.publish();
    }

    fn publish(&self) {
        let highlighted = self
            .highlights
            .active(Instant::now())
            .cloned()
            .unwrap_or_default();
        self.state_tx.send_replace(FeedState {
            snapshot: self.current.clone(),
            highlighted,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Script {
        calls: AtomicUsize,
        steps: Vec<Result<Vec<Value>, SyncError>>,
    }

    #[async_trait::async_trait]
    impl Fetcher for Script {
        async fn fetch(&self) -> Result<Vec<Value>, SyncError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.steps[n.min(self.steps.len() - 1)].clone()
        }
    }

    fn script(steps: Vec<Result<Vec<Value>, SyncError>>) -> Arc<Script> {
        Arc::new(Script {
            calls: AtomicUsize::new(0),
            steps,
        })
    }

    fn events(ids: &[u64]) -> Result<Vec<Value>, SyncError> {
        Ok(ids
            .iter()
            .map(|id| json!({"id": id, "threat_type": if id % 2 == 0 { "ransomware" } else { "trojan" }}))
            .collect())
    }

    fn feed(fetcher: Arc<Script>) -> LiveFeed {
        let options = FeedOptions::new(PollerOptions::new("live-feed", Duration::from_secs(5)))
            .highlight_window(Duration::from_secs(3))
            .searchable(vec!["threat_type".into()]);
        LiveFeed::start(options, fetcher)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_entity_highlighted_for_window() {
        let feed = feed(script(vec![events(&[1, 2, 3]), events(&[2, 3, 4])]));

        advance(10).await;
        let state = feed.state();
        assert_eq!(state.snapshot.as_ref().unwrap().len(), 3);
        assert!(state.highlighted.is_empty(), "first page is never flashed");

        advance(5_000).await; // second poll at 5000
        let state = feed.state();
        assert!(state.is_highlighted(&Identity::from(4u64)));
        assert_eq!(state.highlighted.len(), 1);

        advance(3_000).await; // window closed at 8000
        assert!(feed.state().highlighted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_novelty_spans_failed_poll() {
        let down = Err(SyncError::NetworkFailure("timeout".into()));
        let feed = feed(script(vec![events(&[1, 2]), down, events(&[1, 2, 3])]));

        advance(5_010).await;
        let state = feed.state();
        assert!(state.is_stale());
        assert_eq!(state.snapshot.as_ref().unwrap().len(), 2);
        assert!(state.highlighted.is_empty());

        advance(5_000).await;
        let state = feed.state();
        assert!(!state.is_stale());
        let highlighted: Vec<_> = state.highlighted.iter().cloned().collect();
        assert_eq!(highlighted, vec![Identity::from(3u64)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_project_latest_snapshot() {
        let feed = feed(script(vec![events(&[1, 2, 3, 4])]));
        assert!(feed.project(&ViewState::default()).is_none());

        advance(10).await;
        let view = ViewState {
            search: "RANSOM".into(),
            ..ViewState::default()
        };
        let projection = feed.project(&view).unwrap();
        assert_eq!(projection.matched, 2);
        assert_eq!(projection.total, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_polling() {
        let fetcher = script(vec![events(&[1])]);
        let feed = feed(fetcher.clone());

        advance(10).await;
        feed.shutdown().await;
        advance(60_000).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
