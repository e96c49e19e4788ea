//! Topic-keyed event dispatcher.
//!
//! Publishers hand an [`Event`] to [`EventDispatcher::publish`], which never
//! blocks: each subscription owns an unbounded queue, so a subscriber that
//! falls behind delays only itself and still receives every event. Its
//! growing backlog is logged. Events published in order reach every
//! subscription in that order.
//!
//! Topics are `/`-separated. Subscription filters may use `*` to match one
//! segment and a trailing `#` to match any remainder. Topic segments built
//! from labels have `/`, `*` and `#` replaced by `_`.

use crate::detection::{DetectedIdentity, Domain};
use crate::entity::EntityInfo;
use serde::Serialize;
use std::fmt;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Presence transition carried by a [`PresenceEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    Detected,
    Expired,
}

impl PresenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceKind::Detected => "detected",
            PresenceKind::Expired => "expired",
        }
    }
}

impl fmt::Display for PresenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An identity appeared (or was re-affirmed) or expired on a camera.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEvent {
    pub kind: PresenceKind,
    pub camera_identifier: String,
    pub domain: Domain,
    pub identity: DetectedIdentity,
}

impl PresenceEvent {
    pub fn topic(&self) -> String {
        presence_topic(&self.camera_identifier, self.domain, self.kind, &self.identity.label)
    }
}

/// Make `value` usable as a single topic segment.
pub fn topic_segment(value: &str) -> Cow<'_, str> {
    if value.contains(['/', '*', '#']) {
        Cow::Owned(value.replace(['/', '*', '#'], "_"))
    } else {
        Cow::Borrowed(value)
    }
}

/// `<camera>/<domain>/<detected|expired>/<label>`
pub fn presence_topic(camera: &str, domain: Domain, kind: PresenceKind, label: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        topic_segment(camera),
        domain,
        kind,
        topic_segment(label)
    )
}

/// `entity/added/<entity_id>`
pub fn entity_added_topic(entity_id: &str) -> String {
    format!("entity/added/{}", entity_id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Presence(PresenceEvent),
    EntityAdded(EntityInfo),
}

/// A published event and the topic it was published on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub topic: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn presence(event: PresenceEvent) -> Self {
        Self {
            topic: event.topic(),
            payload: EventPayload::Presence(event),
        }
    }

    pub fn entity_added(info: EntityInfo) -> Self {
        Self {
            topic: entity_added_topic(&info.entity_id),
            payload: EventPayload::EntityAdded(info),
        }
    }

    pub fn as_presence(&self) -> Option<&PresenceEvent> {
        match &self.payload {
            EventPayload::Presence(event) => Some(event),
            EventPayload::EntityAdded(_) => None,
        }
    }
}

/// A parsed subscription filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    segments: Vec<String>,
}

impl TopicFilter {
    pub fn new(filter: &str) -> Self {
        Self {
            segments: filter.split('/').map(str::to_string).collect(),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_segments = topic.split('/');
        for (i, segment) in self.segments.iter().enumerate() {
            if segment == "#" && i == self.segments.len() - 1 {
                return true;
            }
            match topic_segments.next() {
                Some(part) if segment == "*" || segment == part => {}
                _ => return false,
            }
        }
        topic_segments.next().is_none()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

struct Slot {
    id: u64,
    filter: TopicFilter,
    tx: mpsc::UnboundedSender<Arc<Event>>,
    backlog: Arc<AtomicUsize>,
}

/// Receiving side of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Arc<Event>>,
    backlog: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Events published to this subscription and not yet received.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    fn received(&self, event: Arc<Event>) -> Arc<Event> {
        self.backlog.fetch_sub(1, Ordering::AcqRel);
        event
    }

    /// Wait for the next event. Returns `None` once the dispatcher has shut
    /// down and every buffered event has been received.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        let event = self.rx.recv().await?;
        Some(self.received(event))
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        let event = self.rx.try_recv().ok()?;
        Some(self.received(event))
    }

    /// Drain every buffered event.
    pub fn drain(&mut self) -> Vec<Arc<Event>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Process-wide publish/subscribe bus.
///
/// Construct once at startup, share behind an `Arc` and call
/// [`shutdown`](Self::shutdown) when stopping.
pub struct EventDispatcher {
    backlog_warning: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
    slots: RwLock<Vec<Slot>>,
}

impl EventDispatcher {
    /// Create a dispatcher that warns each time a subscription's backlog
    /// grows by another `backlog_warning` events.
    pub fn new(backlog_warning: usize) -> Self {
        Self {
            backlog_warning: backlog_warning.max(1),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            slots: RwLock::new(Vec::new()),
        }
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, Vec<Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, Vec<Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to every topic matching `filter`.
    ///
    /// After shutdown the returned subscription is already closed.
    pub fn subscribe(&self, filter: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));

        // Checked under the write lock so shutdown cannot miss this slot
        let mut slots = self.write_slots();
        if !self.closed.load(Ordering::Acquire) {
            slots.push(Slot {
                id,
                filter: TopicFilter::new(filter),
                tx,
                backlog: backlog.clone(),
            });
            debug!(subscription = id, filter, "Subscribed");
        }

        Subscription { id, rx, backlog }
    }

    /// Remove a subscription. Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.write_slots().retain(|slot| slot.id != subscription.id);
    }

    /// Deliver `event` to every matching subscription.
    ///
    /// Never blocks and never drops an event for a live subscription.
    /// Returns the number of subscriptions that received it.
    pub fn publish(&self, event: Event) -> usize {
        if self.closed.load(Ordering::Acquire) {
            debug!(topic = %event.topic, "Dispatcher closed, event discarded");
            return 0;
        }

        let event = Arc::new(event);
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let slots = self.read_slots();
            for slot in slots.iter().filter(|s| s.filter.matches(&event.topic)) {
                let backlog = slot.backlog.fetch_add(1, Ordering::AcqRel) + 1;
                if slot.tx.send(event.clone()).is_err() {
                    dead.push(slot.id);
                    continue;
                }
                delivered += 1;
                if backlog % self.backlog_warning == 0 {
                    warn!(subscription = slot.id, backlog, "Subscriber falling behind");
                }
            }
        }

        if !dead.is_empty() {
            self.write_slots().retain(|slot| !dead.contains(&slot.id));
        }

        debug!(topic = %event.topic, delivered, "Event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.read_slots()
            .iter()
            .filter(|slot| !slot.tx.is_closed())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting events and close every subscription. Subscribers
    /// still receive what was buffered before the call.
    pub fn shutdown(&self) {
        let mut slots = self.write_slots();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let closed = std::mem::take(&mut *slots);
        debug!(subscriptions = closed.len(), "Event dispatcher shut down");
    }
}
