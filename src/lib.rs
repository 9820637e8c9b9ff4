//! guardsync -- client-side state synchronization for a security dashboard.
//!
//! Keeps local views of remote collections fresh by polling, flags entities
//! that appeared since the previous poll, projects collections through
//! search/filter/sort/paginate, and applies settings edits optimistically
//! with debouncing and rollback to the last confirmed value.

pub mod config;
pub mod error;
pub mod feed;
pub mod model;
pub mod novelty;
pub mod poller;
pub mod projection;
pub mod push;
pub mod source;
pub mod writes;

use std::sync::Arc;

use anyhow::{bail, Result};

pub use config::GuardsyncConfig;
pub use error::SyncError;
pub use feed::{FeedOptions, FeedState, LiveFeed};
pub use model::{Entity, FieldGroup, Identity, IdentityKey, Snapshot};
pub use poller::{PollerHandle, PollerOptions, SnapshotPoller};
pub use projection::{Projection, Projector, ViewState};
pub use writes::{WriteCoordinator, WriteOptions};

use config::StreamConfig;
use push::{PushHandle, PushListener, PushOptions, PushRouter};
use source::http::{build_client, HttpFetcher, HttpWriteEndpoint};

/// Running feeds, write coordinator and push channel for one backend.
pub struct Session {
    feeds: Vec<LiveFeed>,
    writes: WriteCoordinator,
    push: Option<PushHandle>,
}

impl Session {
    /// Start the named streams (all configured streams if `streams` is empty).
    ///
    /// Every feed is refreshed after a confirmed write, and on push frames
    /// matching its topics when the push channel is enabled.
    pub fn start(config: &GuardsyncConfig, streams: &[String]) -> Result<Self> {
        let selected: Vec<&StreamConfig> = if streams.is_empty() {
            config.streams.iter().collect()
        } else {
            let mut selected = Vec::with_capacity(streams.len());
            for name in streams {
                match config.stream(name) {
                    Some(stream) => selected.push(stream),
                    None => bail!("unknown stream '{name}'"),
                }
            }
            selected
        };

        let client = build_client(&config.backend)?;
        let endpoint =
            HttpWriteEndpoint::from_config(client.clone(), &config.backend, &config.field_groups);
        let writes = WriteCoordinator::new(Arc::new(endpoint), config.write_options());

        let mut router = PushRouter::new();
        let mut feeds = Vec::with_capacity(selected.len());
        for stream in selected {
            let fetcher = HttpFetcher::for_stream(client.clone(), &config.backend, stream);
            let options = FeedOptions::new(config.poller_options(stream))
                .highlight_window(config.highlight_window())
                .searchable(stream.searchable.clone());
            let feed = LiveFeed::start(options, Arc::new(fetcher));

            writes.attach(feed.poller().trigger());
            router = router.route(stream.topics.iter().cloned(), feed.poller().trigger());
            feeds.push(feed);
        }

        let push = if config.push.enabled && !router.is_empty() {
            Some(PushListener::start(PushOptions::from(&config.push), router))
        } else {
            None
        };

        tracing::info!(
            backend = %config.backend.base_url,
            streams = feeds.len(),
            push = push.is_some(),
            "session started"
        );
        Ok(Self {
            feeds,
            writes,
            push,
        })
    }

    pub fn feed(&self, name: &str) -> Option<&LiveFeed> {
        self.feeds.iter().find(|f| f.name() == name)
    }

    pub fn feeds(&self) -> &[LiveFeed] {
        &self.feeds
    }

    pub fn writes(&self) -> &WriteCoordinator {
        &self.writes
    }

    pub fn push(&self) -> Option<&PushHandle> {
        self.push.as_ref()
    }

    /// Stop every feed, pending write and the push channel.
    pub async fn shutdown(self) {
        self.writes.shutdown();
        if let Some(push) = self.push {
            push.shutdown().await;
        }
        for feed in self.feeds {
            feed.shutdown().await;
        }
        tracing::info!("session stopped");
    }
}
