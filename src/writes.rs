//! Optimistic write coordinator.
//!
//! Each field-group moves through `Idle -> Queued -> InFlight -> Idle`. Edits
//! are debounced; a newer edit supersedes a queued one (their fields are
//! merged, later keys win) and restarts the timer. At most one write per
//! group is in flight; an edit that becomes due while another write is in
//! flight is sent as soon as that write settles.
//!
//! The displayed value of a group is always the last known good value with
//! any pending edits laid over it. Reads that arrive without a value, or that
//! were issued before the last confirmation, never replace it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::FieldGroup;
use crate::poller::{RefreshReason, RefreshTrigger};
use crate::source::{WriteEndpoint, WriteRequest};

/// Capacity of the write event channel.
const EVENT_CAPACITY: usize = 64;
/// Oldest undismissed notices are dropped beyond this.
const MAX_NOTICES: usize = EVENT_CAPACITY;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub debounce: Duration,
    /// Re-read the group after every confirmed write.
    pub follow_up_read: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            follow_up_read: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteState {
    Queued,
    InFlight,
    Confirmed,
    Failed,
}

/// A local mutation intent for one field-group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingWrite {
    /// Correlation id, sent with the request.
    pub id: Uuid,
    pub group: FieldGroup,
    pub fields: Value,
    pub issued_at: DateTime<Utc>,
    pub state: WriteState,
}

/// Most recent server-confirmed value of a group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastKnownGood {
    pub value: Value,
    pub confirmed_at: DateTime<Utc>,
}

/// Where a field-group is in its write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPhase {
    Idle,
    Queued,
    InFlight,
}

/// A user-facing, dismissible write failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteNotice {
    pub id: Uuid,
    pub group: FieldGroup,
    pub write_id: Uuid,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Lifecycle events, for observers that render write progress.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteEvent {
    Queued { group: FieldGroup, write_id: Uuid },
    Sent { group: FieldGroup, write_id: Uuid },
    Confirmed { group: FieldGroup, write_id: Uuid, value: Value },
    Failed { group: FieldGroup, notice: WriteNotice },
    /// A write's result arrived after a newer local edit and was not surfaced.
    Superseded { group: FieldGroup, error: SyncError },
    /// Last known good changed because of a server read.
    Resynced { group: FieldGroup, value: Value },
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct GroupSlot {
    last_known_good: Option<LastKnownGood>,
    queued: Option<PendingWrite>,
    in_flight: Option<PendingWrite>,
    /// The queued write's debounce elapsed while another write was in flight.
    ready: bool,
    debounce: Option<CancellationToken>,
}

impl GroupSlot {
    fn phase(&self) -> GroupPhase {
        if self.in_flight.is_some() {
            GroupPhase::InFlight
        } else if self.queued.is_some() {
            GroupPhase::Queued
        } else {
            GroupPhase::Idle
        }
    }

    fn displayed(&self) -> Option<Value> {
        let layers = [
            self.in_flight.as_ref().map(|w| &w.fields),
            self.queued.as_ref().map(|w| &w.fields),
        ];
        layers
            .into_iter()
            .flatten()
            .fold(self.last_known_good.as_ref().map(|l| l.value.clone()), |acc, fields| {
                Some(match acc {
                    Some(base) => merge_fields(&base, fields),
                    None => fields.clone(),
                })
            })
    }

    /// Move the queued write in flight and build its request.
    fn launch(&mut self) -> Option<WriteRequest> {
        let mut pending = self.queued.take()?;
        pending.state = WriteState::InFlight;
        self.ready = false;
        let request = WriteRequest {
            id: pending.id,
            group: pending.group.clone(),
            fields: pending.fields.clone(),
            issued_at: pending.issued_at,
        };
        self.in_flight = Some(pending);
        Some(request)
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    groups: HashMap<FieldGroup, GroupSlot>,
    notices: Vec<WriteNotice>,
}

struct Shared {
    endpoint: Arc<dyn WriteEndpoint>,
    options: WriteOptions,
    state: Mutex<CoordinatorState>,
    triggers: std::sync::RwLock<Vec<RefreshTrigger>>,
    events: broadcast::Sender<WriteEvent>,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// WriteCoordinator
// ---------------------------------------------------------------------------

/// Coordinates optimistic writes for any number of field-groups.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WriteCoordinator {
    shared: Arc<Shared>,
}

impl WriteCoordinator {
    pub fn new(endpoint: Arc<dyn WriteEndpoint>, options: WriteOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                endpoint,
                options,
                state: Mutex::new(CoordinatorState::default()),
                triggers: std::sync::RwLock::new(Vec::new()),
                events,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Refresh this poller whenever a write is confirmed.
    pub fn attach(&self, trigger: RefreshTrigger) {
        let mut triggers = self
            .shared
            .triggers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        triggers.push(trigger);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WriteEvent> {
        self.shared.events.subscribe()
    }

    /// Read a group from the backend and record it as last known good.
    pub async fn load(&self, group: &FieldGroup) -> Result<Option<Value>, SyncError> {
        let issued_at = Utc::now();
        let value = self.shared.endpoint.read(group).await?;
        self.observe(group, value, issued_at).await;
        Ok(self.displayed(group).await)
    }

    /// Record a server-read value of `group` observed at `observed_at`.
    ///
    /// `None` (the read did not include the group) and reads older than the
    /// current last known good are ignored. Returns whether it was applied.
    pub async fn observe(
        &self,
        group: &FieldGroup,
        value: Option<Value>,
        observed_at: DateTime<Utc>,
    ) -> bool {
        let Some(value) = value else {
            debug!(%group, "read carried no value, keeping last known good");
            return false;
        };

        let mut state = self.shared.state.lock().await;
        let slot = state.groups.entry(group.clone()).or_default();

        if let Some(current) = &slot.last_known_good {
            if observed_at < current.confirmed_at {
                debug!(%group, "ignoring read older than the last confirmation");
                return false;
            }
            if current.value == value {
                return false;
            }
        }

        slot.last_known_good = Some(LastKnownGood {
            value: value.clone(),
            confirmed_at: observed_at,
        });
        self.emit(WriteEvent::Resynced {
            group: group.clone(),
            value,
        });
        true
    }

    /// Queue a partial update for `group` and (re)arm its debounce timer.
    ///
    /// Returns the id of the pending write that now carries the edit.
    pub async fn edit(&self, group: &FieldGroup, fields: Value) -> Uuid {
        let id = Uuid::new_v4();
        let token = self.shared.cancel.child_token();

        {
            let mut state = self.shared.state.lock().await;
            let slot = state.groups.entry(group.clone()).or_default();

            if let Some(previous) = slot.debounce.take() {
                previous.cancel();
            }
            let fields = match slot.queued.take() {
                Some(previous) => {
                    debug!(%group, superseded = %previous.id, write_id = %id, "edit supersedes queued write");
                    merge_fields(&previous.fields, &fields)
                }
                None => fields,
            };

            slot.queued = Some(PendingWrite {
                id,
                group: group.clone(),
                fields,
                issued_at: Utc::now(),
                state: WriteState::Queued,
            });
            slot.ready = false;
            slot.debounce = Some(token.clone());
        }

        self.emit(WriteEvent::Queued {
            group: group.clone(),
            write_id: id,
        });

        let coordinator = self.clone();
        let group = group.clone();
        let debounce = self.shared.options.debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(debounce) => coordinator.fire(&group, id).await,
            }
        });

        id
    }

    /// Edit a path-list field from free text (`a; b; c`).
    ///
    /// Returns `None` without touching any state if the text holds no
    /// usable path.
    pub async fn edit_path_list(&self, group: &FieldGroup, field: &str, raw: &str) -> Option<Uuid> {
        let paths = parse_path_list(raw);
        if paths.is_empty() {
            warn!(%group, field, "no valid paths in input, not saving");
            return None;
        }
        let mut fields = Map::new();
        fields.insert(field.to_string(), Value::from(paths));
        Some(self.edit(group, Value::Object(fields)).await)
    }

    /// Value to show for `group`: last known good with pending edits applied.
    pub async fn displayed(&self, group: &FieldGroup) -> Option<Value> {
        let state = self.shared.state.lock().await;
        state.groups.get(group).and_then(GroupSlot::displayed)
    }

    pub async fn last_known_good(&self, group: &FieldGroup) -> Option<LastKnownGood> {
        let state = self.shared.state.lock().await;
        state.groups.get(group).and_then(|s| s.last_known_good.clone())
    }

    pub async fn phase(&self, group: &FieldGroup) -> GroupPhase {
        let state = self.shared.state.lock().await;
        state.groups.get(group).map_or(GroupPhase::Idle, GroupSlot::phase)
    }

    /// In-flight then queued writes for `group`.
    pub async fn pending(&self, group: &FieldGroup) -> Vec<PendingWrite> {
        let state = self.shared.state.lock().await;
        state
            .groups
            .get(group)
            .map(|s| s.in_flight.iter().chain(s.queued.iter()).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn notices(&self) -> Vec<WriteNotice> {
        self.shared.state.lock().await.notices.clone()
    }

    /// Dismiss a notice. Returns false if it was already gone.
    pub async fn dismiss(&self, notice_id: Uuid) -> bool {
        let mut state = self.shared.state.lock().await;
        let before = state.notices.len();
        state.notices.retain(|n| n.id != notice_id);
        state.notices.len() != before
    }

    /// Cancel every debounce timer and stop applying write results.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    // -- internals ----------------------------------------------------------

    async fn fire(&self, group: &FieldGroup, id: Uuid) {
        let request = {
            let mut state = self.shared.state.lock().await;
            let Some(slot) = state.groups.get_mut(group) else {
                return;
            };
            if slot.queued.as_ref().map(|q| q.id) != Some(id) {
                return;
            }
            slot.debounce = None;
            if slot.in_flight.is_some() {
                debug!(%group, write_id = %id, "debounce elapsed, waiting for in-flight write");
                slot.ready = true;
                return;
            }
            slot.launch()
        };

        if let Some(request) = request {
            self.send(request).await;
        }
    }

    async fn send(&self, first: WriteRequest) {
        let mut next = Some(first);
        while let Some(request) = next.take() {
            debug!(group = %request.group, write_id = %request.id, "write in flight");
            self.emit(WriteEvent::Sent {
                group: request.group.clone(),
                write_id: request.id,
            });

            let result = tokio::select! {
                _ = self.shared.cancel.cancelled() => return,
                result = self.shared.endpoint.write(&request) => result,
            };
            next = self.complete(&request, result).await;
        }
    }

    /// Settle an in-flight write. Returns the next write to send, if one was
    /// waiting on this one.
    async fn complete(
        &self,
        request: &WriteRequest,
        result: Result<Value, SyncError>,
    ) -> Option<WriteRequest> {
        if self.shared.cancel.is_cancelled() {
            return None;
        }
        let group = &request.group;

        let (confirmed, next) = {
            let mut state = self.shared.state.lock().await;
            let CoordinatorState { groups, notices } = &mut *state;
            let slot = groups.entry(group.clone()).or_default();
            slot.in_flight = None;
            let superseded = slot.queued.is_some();

            let confirmed = match result {
                Ok(value) => {
                    info!(%group, write_id = %request.id, "write confirmed");
                    slot.last_known_good = Some(LastKnownGood {
                        value: value.clone(),
                        confirmed_at: Utc::now(),
                    });
                    self.emit(WriteEvent::Confirmed {
                        group: group.clone(),
                        write_id: request.id,
                        value,
                    });
                    if superseded {
                        self.emit_superseded(group, request.id);
                    }
                    true
                }
                Err(error) if superseded => {
                    debug!(%group, write_id = %request.id, %error, "superseded write failed, folding into queued write");
                    // Fields the newer edit did not touch ride along with it.
                    if let Some(queued) = slot.queued.as_mut() {
                        queued.fields = merge_fields(&request.fields, &queued.fields);
                    }
                    self.emit_superseded(group, request.id);
                    false
                }
                Err(error) => {
                    warn!(%group, write_id = %request.id, %error, "write failed, reverting to last known good");
                    let notice = WriteNotice {
                        id: Uuid::new_v4(),
                        group: group.clone(),
                        write_id: request.id,
                        message: format!("Could not save {group}: {error}"),
                        raised_at: Utc::now(),
                    };
                    if notices.len() >= MAX_NOTICES {
                        notices.remove(0);
                    }
                    notices.push(notice.clone());
                    self.emit(WriteEvent::Failed {
                        group: group.clone(),
                        notice,
                    });
                    false
                }
            };

            let next = if slot.ready { slot.launch() } else { None };
            (confirmed, next)
        };

        if confirmed {
            self.refresh_readers();
            if self.shared.options.follow_up_read {
                let coordinator = self.clone();
                let group = group.clone();
                tokio::spawn(async move { coordinator.resync(&group).await });
            }
        }
        next
    }

    async fn resync(&self, group: &FieldGroup) {
        let issued_at = Utc::now();
        let read = tokio::select! {
            _ = self.shared.cancel.cancelled() => return,
            read = self.shared.endpoint.read(group) => read,
        };
        match read {
            Ok(value) => {
                self.observe(group, value, issued_at).await;
            }
            Err(error) => {
                warn!(%group, %error, "follow-up read failed, keeping last known good");
            }
        }
    }

    fn refresh_readers(&self) {
        let triggers = self
            .shared
            .triggers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for trigger in triggers.iter() {
            if !trigger.request(RefreshReason::WriteConfirmed) {
                debug!(stream = trigger.stream(), "attached poller has stopped");
            }
        }
    }

    fn emit_superseded(&self, group: &FieldGroup, write_id: Uuid) {
        self.emit(WriteEvent::Superseded {
            group: group.clone(),
            error: SyncError::StaleWriteSuperseded { write_id },
        });
    }

    fn emit(&self, event: WriteEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }
}

/// Overlay `overlay` on `base`: object keys are replaced one level deep,
/// anything else is replaced wholesale.
pub fn merge_fields(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// Split a `;`-separated path list, trimming entries and dropping any of
/// two characters or fewer.
pub fn parse_path_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|p| p.chars().count() > 2)
        .map(str::to_string)
        .collect()
}
