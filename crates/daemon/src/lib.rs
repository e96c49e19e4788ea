//! NVR Presence
//!
//! Tracks who and what is visible on each camera. Recognition backends feed
//! per-camera presence trackers, which publish detected/expired events and
//! keep one presence entity per label.

pub mod capture;
pub mod daemon;
pub mod detection;
pub mod entity;
pub mod events;
pub mod face_recognition;
pub mod object_detector;
pub mod post_processor;
pub mod status_server;
pub mod tracker;

pub use nvr_presence_config as config;
pub use nvr_presence_config::Config;
pub use capture::{capture_file_name, CaptureStore, FsImageWriter, ImageWriter, PersistenceError};
pub use daemon::{Daemon, DaemonError};
pub use detection::{
    Attributes, BoundingBox, DetectedIdentity, DetectionBatch, Domain, Frame, Recognition, Source,
    UNKNOWN_LABEL,
};
pub use entity::{entity_id, EntityInfo, EntityRegistry, PresenceEntity};
pub use events::{
    Event, EventDispatcher, EventPayload, PresenceEvent, PresenceKind, Subscription, TopicFilter,
};
pub use face_recognition::{scan_known_faces, FaceRecognition};
pub use object_detector::ObjectDetector;
pub use post_processor::{BackendInitError, PostProcessor, PostProcessorContext, SharedServices};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use tracker::{PresenceTracker, TrackerError};
