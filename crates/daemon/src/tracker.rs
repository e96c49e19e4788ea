//! Detection lifecycle tracking.
//!
//! Turns a stream of repeated sightings into clean presence transitions.
//! Each label on a camera is either absent (no entry) or present (entry with
//! a running expiry timer). A new sighting replaces the entry and restarts
//! its timer; an uncontested timer removes the entry and publishes
//! `expired`.
//!
//! All reads and writes of the label map, including timer cancellation,
//! happen under one mutex. Every entry carries a generation number and an
//! expiry callback only acts when the entry it finds still has the
//! generation it was scheduled for. A callback that was already running when
//! its timer got cancelled therefore does nothing, so for any label an
//! `expired` event is never published after the `detected` event that
//! replaced it.

use crate::detection::{Attributes, BoundingBox, DetectedIdentity, Domain};
use crate::entity::{EntityRegistry, PresenceEntity};
use crate::events::{Event, EventDispatcher, PresenceEvent, PresenceKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("expiry window must be positive, got {0:?}")]
    NonPositiveExpiry(Duration),

    #[error("no tokio runtime available to schedule expiry timers")]
    NoRuntime,
}

struct Entry {
    identity: DetectedIdentity,
    generation: u64,
    timer: JoinHandle<()>,
    entity: Arc<PresenceEntity>,
}

#[derive(Default)]
struct TrackerState {
    entries: HashMap<String, Entry>,
    next_generation: u64,
    stopped: bool,
}

struct TrackerInner {
    camera_identifier: String,
    domain: Domain,
    expire_after: Duration,
    dispatcher: Arc<EventDispatcher>,
    registry: Arc<EntityRegistry>,
    runtime: Handle,
    state: Mutex<TrackerState>,
}

/// Presence state for one camera and recognition domain.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<TrackerInner>,
}

impl PresenceTracker {
    /// Create a tracker that schedules its timers on the current tokio runtime.
    pub fn new(
        camera_identifier: &str,
        domain: Domain,
        expire_after: Duration,
        dispatcher: Arc<EventDispatcher>,
        registry: Arc<EntityRegistry>,
    ) -> Result<Self, TrackerError> {
        let runtime = Handle::try_current().map_err(|_| TrackerError::NoRuntime)?;
        Self::with_runtime(camera_identifier, domain, expire_after, dispatcher, registry, runtime)
    }

    pub fn with_runtime(
        camera_identifier: &str,
        domain: Domain,
        expire_after: Duration,
        dispatcher: Arc<EventDispatcher>,
        registry: Arc<EntityRegistry>,
        runtime: Handle,
    ) -> Result<Self, TrackerError> {
        if expire_after.is_zero() {
            return Err(TrackerError::NonPositiveExpiry(expire_after));
        }

        Ok(Self {
            inner: Arc::new(TrackerInner {
                camera_identifier: camera_identifier.to_string(),
                domain,
                expire_after,
                dispatcher,
                registry,
                runtime,
                state: Mutex::new(TrackerState::default()),
            }),
        })
    }

    pub fn camera_identifier(&self) -> &str {
        &self.inner.camera_identifier
    }

    pub fn domain(&self) -> Domain {
        self.inner.domain
    }

    pub fn expire_after(&self) -> Duration {
        self.inner.expire_after
    }

    /// Record a sighting of `label`.
    ///
    /// Cancels any pending expiry for the label, registers the label's
    /// entity on first sighting, stores the new snapshot with a fresh timer
    /// and publishes `detected`.
    pub fn observe(
        &self,
        label: &str,
        coordinates: BoundingBox,
        confidence: Option<f32>,
        extra_attributes: Option<Attributes>,
    ) -> DetectedIdentity {
        let identity = DetectedIdentity::new(label, coordinates, confidence, extra_attributes);
        let inner = &self.inner;

        let mut state = inner.lock_state();
        if state.stopped {
            debug!(camera = %inner.camera_identifier, label, "Tracker stopped, sighting ignored");
            return identity;
        }

        if let Some(previous) = state.entries.remove(label) {
            previous.timer.abort();
        }

        let (entity, _) = inner
            .registry
            .register(&inner.camera_identifier, inner.domain, label);

        state.next_generation += 1;
        let generation = state.next_generation;
        let timer = self.spawn_expiry(label.to_string(), generation);

        entity.mark_detected(&identity);
        inner.dispatcher.publish(Event::presence(PresenceEvent {
            kind: PresenceKind::Detected,
            camera_identifier: inner.camera_identifier.clone(),
            domain: inner.domain,
            identity: identity.clone(),
        }));

        state.entries.insert(
            label.to_string(),
            Entry {
                identity: identity.clone(),
                generation,
                timer,
                entity,
            },
        );
        identity
    }

    fn spawn_expiry(&self, label: String, generation: u64) -> JoinHandle<()> {
        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        let expire_after = self.inner.expire_after;
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(expire_after).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&label, generation);
            }
        })
    }

    pub fn is_present(&self, label: &str) -> bool {
        self.inner.lock_state().entries.contains_key(label)
    }

    /// Snapshots of every identity currently present, sorted by label.
    pub fn present(&self) -> Vec<DetectedIdentity> {
        let state = self.inner.lock_state();
        let mut identities: Vec<_> = state.entries.values().map(|e| e.identity.clone()).collect();
        identities.sort_by(|a, b| a.label.cmp(&b.label));
        identities
    }

    /// Cancel every pending timer and drop all entries without publishing
    /// expiry events. Later sightings are ignored.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock_state();
        state.stopped = true;
        for (_, entry) in state.entries.drain() {
            entry.timer.abort();
        }
        debug!(camera = %self.inner.camera_identifier, domain = %self.inner.domain, "Tracker stopped");
    }
}

impl TrackerInner {
    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expiry callback. Removes the entry only if it is still the one this
    /// timer was scheduled for.
    fn expire(&self, label: &str, generation: u64) {
        let mut state = self.lock_state();
        let current = state.entries.get(label).map(|entry| entry.generation);
        if current != Some(generation) {
            debug!(
                camera = %self.camera_identifier,
                label,
                generation,
                ?current,
                "Stale expiry ignored"
            );
            return;
        }

        let Some(entry) = state.entries.remove(label) else {
            return;
        };
        debug!(camera = %self.camera_identifier, domain = %self.domain, label, "Expiring identity");

        entry.entity.mark_expired();
        self.dispatcher.publish(Event::presence(PresenceEvent {
            kind: PresenceKind::Expired,
            camera_identifier: self.camera_identifier.clone(),
            domain: self.domain,
            identity: entry.identity,
        }));
    }
}
