//! Capability contract for recognition backends.
//!
//! A backend (face recognition, object detection, ...) implements
//! [`PostProcessor`]. It owns a [`PostProcessorContext`] that holds the
//! camera, the presence tracker and the optional capture store. The
//! provided methods route confirmed identities to the tracker and unknown
//! frames to the capture store, so backends differ only in how they set up
//! and how they interpret inference results.

use crate::capture::{CaptureStore, ImageWriter};
use crate::detection::{Attributes, BoundingBox, DetectedIdentity, DetectionBatch, Domain, Frame};
use crate::entity::EntityRegistry;
use crate::events::EventDispatcher;
use crate::tracker::{PresenceTracker, TrackerError};
use nvr_presence_config::CameraConfig;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A backend could not be set up for a camera. Only that backend on that
/// camera is affected.
#[derive(Debug, Error)]
pub enum BackendInitError {
    #[error("camera '{camera}': cannot read reference directory {}: {source}", .path.display())]
    ReferenceDirUnreadable {
        camera: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("camera '{camera}': cannot create capture directory {}: {source}", .path.display())]
    CaptureDirUnavailable {
        camera: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("camera '{camera}': {source}")]
    Tracker {
        camera: String,
        #[source]
        source: TrackerError,
    },
}

/// Process-wide collaborators handed to every backend.
#[derive(Clone)]
pub struct SharedServices {
    pub dispatcher: Arc<EventDispatcher>,
    pub registry: Arc<EntityRegistry>,
    pub image_writer: Arc<dyn ImageWriter>,
}

/// Per-camera state shared by every backend implementation.
pub struct PostProcessorContext {
    camera: CameraConfig,
    domain: Domain,
    tracker: PresenceTracker,
    registry: Arc<EntityRegistry>,
    captures: Option<CaptureStore>,
}

impl PostProcessorContext {
    /// Build the context for `camera`. `capture_dir` enables unknown
    /// captures into that directory.
    pub fn new(
        camera: CameraConfig,
        domain: Domain,
        expire_after: Duration,
        capture_dir: Option<PathBuf>,
        services: &SharedServices,
    ) -> Result<Self, BackendInitError> {
        let tracker = PresenceTracker::new(
            camera.identifier(),
            domain,
            expire_after,
            services.dispatcher.clone(),
            services.registry.clone(),
        )
        .map_err(|source| BackendInitError::Tracker {
            camera: camera.identifier().to_string(),
            source,
        })?;

        let captures = capture_dir
            .map(|dir| CaptureStore::new(dir, domain, services.image_writer.clone()));

        Ok(Self {
            camera,
            domain,
            tracker,
            registry: services.registry.clone(),
            captures,
        })
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    pub fn captures(&self) -> Option<&CaptureStore> {
        self.captures.as_ref()
    }

    /// Register the entity for a label discovered during initialization.
    pub fn register_known(&self, label: &str) -> bool {
        self.registry
            .register(self.camera.identifier(), self.domain, label)
            .1
    }
}

/// Operations every recognition backend supports.
pub trait PostProcessor: Send + Sync {
    fn context(&self) -> &PostProcessorContext;

    /// One-time setup for the backend's camera. Returns the labels
    /// discovered and pre-registered.
    fn initialize(&self) -> Result<Vec<String>, BackendInitError>;

    /// Interpret one batch of inference results for this camera.
    fn process(&self, batch: &DetectionBatch);

    fn domain(&self) -> Domain {
        self.context().domain()
    }

    fn camera(&self) -> &CameraConfig {
        self.context().camera()
    }

    /// A known identity was matched.
    fn on_identity_confirmed(
        &self,
        label: &str,
        coordinates: BoundingBox,
        confidence: Option<f32>,
        extra_attributes: Option<Attributes>,
    ) -> DetectedIdentity {
        self.context()
            .tracker()
            .observe(label, coordinates, confidence, extra_attributes)
    }

    /// An unmatched detection should be kept. Returns where it was saved.
    fn on_unknown_captured(&self, frame: &Frame) -> Option<PathBuf> {
        self.context().captures().and_then(|store| store.save(frame))
    }

    /// Identities currently present for this backend.
    fn present(&self) -> Vec<DetectedIdentity> {
        self.context().tracker().present()
    }

    /// Stop tracking and cancel pending expiries.
    fn shutdown(&self) {
        self.context().tracker().shutdown();
    }
}
