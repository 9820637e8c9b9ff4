//! Optional real-time push channel.
//!
//! The backend announces changes as line-delimited JSON frames
//! `{"type": ..., "data": ..., "timestamp": ...}` over TCP. A frame never
//! carries state itself: its `type` is matched against stream topics and
//! the matching pollers are asked to refresh. Polling keeps running whether
//! or not the channel is up.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PushConfig;
use crate::poller::{RefreshReason, RefreshTrigger};

/// Longest accepted frame: 64 KiB.
const MAX_LINE_LENGTH: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Newline-delimited JSON codec for [`PushMessage`].
///
/// Blank lines are skipped; lines that are not a valid message are logged
/// and dropped without closing the stream.
pub struct PushCodec {
    inner: LinesCodec,
}

impl PushCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }

    fn parse(line: &str) -> Option<PushMessage> {
        if line.trim().is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "dropping malformed push frame");
                None
            }
        }
    }
}

impl Default for PushCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<PushMessage> for PushCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: PushMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item).context("failed to serialize push frame")?;
        self.inner.encode(line, dst).map_err(|e| anyhow::anyhow!(e))
    }
}

impl Decoder for PushCodec {
    type Item = PushMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode(src).map_err(|e| anyhow::anyhow!(e))? {
            if let Some(message) = Self::parse(&line) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode_eof(src).map_err(|e| anyhow::anyhow!(e))? {
            if let Some(message) = Self::parse(&line) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Maps message types to the pollers they refresh.
#[derive(Debug, Clone, Default)]
pub struct PushRouter {
    routes: Vec<(HashSet<String>, RefreshTrigger)>,
}

impl PushRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh `trigger`'s stream on any of `topics`.
    pub fn route<I, S>(mut self, topics: I, trigger: RefreshTrigger) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: HashSet<String> = topics.into_iter().map(Into::into).collect();
        if !topics.is_empty() {
            self.routes.push((topics, trigger));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Trigger every stream subscribed to the message type.
    /// Returns how many streams were asked to refresh.
    pub fn dispatch(&self, message: &PushMessage) -> usize {
        let mut triggered = 0;
        for (topics, trigger) in &self.routes {
            if topics.contains(&message.kind) && trigger.request(RefreshReason::Push) {
                triggered += 1;
            }
        }
        debug!(kind = %message.kind, triggered, "push frame dispatched");
        triggered
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PushOptions {
    pub address: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl From<&PushConfig> for PushOptions {
    fn from(config: &PushConfig) -> Self {
        Self {
            address: config.address.clone(),
            reconnect_min: Duration::from_millis(config.reconnect_min_ms),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms),
        }
    }
}

/// Exponential reconnect delay with jitter.
#[derive(Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    /// Next delay, somewhere in the upper half of the current step.
    fn next_delay(&mut self) -> Duration {
        let step = self.current;
        self.current = (self.current * 2).min(self.max);
        step.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Connects to the push endpoint and keeps reconnecting until stopped.
pub struct PushListener {
    options: PushOptions,
    router: PushRouter,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl PushListener {
    /// Spawn the listener. Must be called from within a tokio runtime.
    pub fn start(options: PushOptions, router: PushRouter) -> PushHandle {
        let cancel = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(false));
        let listener = Self {
            options,
            router,
            connected: connected.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(listener.run());
        PushHandle {
            connected,
            cancel,
            task: Some(task),
        }
    }

    async fn run(self) {
        let mut backoff = Backoff::new(self.options.reconnect_min, self.options.reconnect_max);
        let address = self.options.address.as_str();

        loop {
            let connect = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = TcpStream::connect(address) => result,
            };

            match connect {
                Ok(stream) => {
                    info!(%address, "push channel connected");
                    backoff.reset();
                    self.connected.store(true, Ordering::Release);
                    self.read(stream).await;
                    self.connected.store(false, Ordering::Release);
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    warn!(%address, "push channel disconnected");
                }
                Err(e) => {
                    warn!(%address, error = %e, "push channel connect failed");
                }
            }

            let delay = backoff.next_delay();
            debug!(%address, delay_ms = delay.as_millis() as u64, "reconnecting push channel");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(%address, "push listener stopped");
    }

    async fn read(&self, stream: TcpStream) {
        let mut frames = FramedRead::new(stream, PushCodec::new());
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(message)) => {
                    self.router.dispatch(&message);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "push channel read failed");
                    return;
                }
                None => return,
            }
        }
    }
}

/// Owner handle of a running listener. Dropping it stops the listener.
pub struct PushHandle {
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PushHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "push listener ended abnormally");
            }
        }
    }
}

impl Drop for PushHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
