//! Registry of addressable presence entities.
//!
//! One entity exists per (camera, domain, label). It exposes whether that
//! identity is currently present and the last snapshot seen.

use crate::detection::{current_timestamp_ms, DetectedIdentity, Domain};
use crate::events::{Event, EventDispatcher};
use nvr_presence_config::slugify;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntityKey {
    camera: String,
    domain: Domain,
    label: String,
}

/// Serializable view of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub entity_id: String,
    pub camera_identifier: String,
    pub domain: Domain,
    pub label: String,
    pub present: bool,
    pub last_identity: Option<DetectedIdentity>,
    /// Unix timestamp (milliseconds) of the last state change
    pub last_changed: i64,
}

#[derive(Debug, Default)]
struct EntityState {
    present: bool,
    last_identity: Option<DetectedIdentity>,
    last_changed: i64,
}

/// "Is this identity currently present" for one camera and domain.
#[derive(Debug)]
pub struct PresenceEntity {
    entity_id: String,
    camera_identifier: String,
    domain: Domain,
    label: String,
    state: Mutex<EntityState>,
}

impl PresenceEntity {
    fn new(camera: &str, domain: Domain, label: &str) -> Self {
        Self {
            entity_id: entity_id(camera, domain, label),
            camera_identifier: camera.to_string(),
            domain,
            label: label.to_string(),
            state: Mutex::new(EntityState {
                last_changed: current_timestamp_ms(),
                ..Default::default()
            }),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_present(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).present
    }

    pub(crate) fn mark_detected(&self, identity: &DetectedIdentity) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.present {
            state.last_changed = current_timestamp_ms();
        }
        state.present = true;
        state.last_identity = Some(identity.clone());
    }

    pub(crate) fn mark_expired(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.present {
            state.present = false;
            state.last_changed = current_timestamp_ms();
        }
    }

    pub fn info(&self) -> EntityInfo {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        EntityInfo {
            entity_id: self.entity_id.clone(),
            camera_identifier: self.camera_identifier.clone(),
            domain: self.domain,
            label: self.label.clone(),
            present: state.present,
            last_identity: state.last_identity.clone(),
            last_changed: state.last_changed,
        }
    }
}

/// `binary_sensor.<camera>_<domain>_<label>`
pub fn entity_id(camera: &str, domain: Domain, label: &str) -> String {
    format!(
        "binary_sensor.{}_{}_{}",
        slugify(camera),
        domain,
        slugify(label)
    )
}

/// Registration is idempotent per (camera, domain, label).
pub struct EntityRegistry {
    entities: RwLock<HashMap<EntityKey, Arc<PresenceEntity>>>,
    registrations: AtomicU64,
    dispatcher: Option<Arc<EventDispatcher>>,
}

impl EntityRegistry {
    /// Registry that announces new entities on `dispatcher`.
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            registrations: AtomicU64::new(0),
            dispatcher: Some(dispatcher),
        }
    }

    /// Registry that does not publish registration events.
    pub fn detached() -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            registrations: AtomicU64::new(0),
            dispatcher: None,
        }
    }

    /// Register the entity for `label`, or return the existing one.
    ///
    /// The boolean is `true` when the entity was created by this call.
    pub fn register(&self, camera: &str, domain: Domain, label: &str) -> (Arc<PresenceEntity>, bool) {
        let key = EntityKey {
            camera: camera.to_string(),
            domain,
            label: label.to_string(),
        };

        if let Some(existing) = self
            .entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return (existing.clone(), false);
        }

        let entity = {
            let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = entities.get(&key) {
                return (existing.clone(), false);
            }
            let entity = Arc::new(PresenceEntity::new(camera, domain, label));
            entities.insert(key, entity.clone());
            entity
        };
        self.registrations.fetch_add(1, Ordering::Relaxed);

        info!(entity_id = %entity.entity_id(), camera, %domain, label, "Entity registered");
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.publish(Event::entity_added(entity.info()));
        }
        (entity, true)
    }

    pub fn get(&self, camera: &str, domain: Domain, label: &str) -> Option<Arc<PresenceEntity>> {
        let key = EntityKey {
            camera: camera.to_string(),
            domain,
            label: label.to_string(),
        };
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Number of entities created since startup.
    pub fn registration_count(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entities.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entity, sorted by entity id.
    pub fn snapshot(&self) -> Vec<EntityInfo> {
        let mut infos: Vec<EntityInfo> = self
            .entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.info())
            .collect();
        infos.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        infos
    }

    /// Snapshot of one camera's entities, sorted by entity id.
    pub fn snapshot_camera(&self, camera: &str) -> Vec<EntityInfo> {
        self.snapshot()
            .into_iter()
            .filter(|info| info.camera_identifier == camera)
            .collect()
    }
}
