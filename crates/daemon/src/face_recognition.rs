//! Face recognition backend.
//!
//! Known faces live in `face_recognition_path`, one sub-directory per
//! person. Each directory name is pre-registered as an entity when the
//! backend initializes. Matched faces feed the presence tracker and frames
//! with unmatched faces are optionally saved to `unknown_faces_path`.

use crate::detection::{DetectionBatch, Domain, Source, UNKNOWN_LABEL};
use crate::post_processor::{BackendInitError, PostProcessor, PostProcessorContext, SharedServices};
use nvr_presence_config::{CameraConfig, FaceRecognitionConfig};
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// List the known-face directories under `root`.
///
/// Hidden entries and the `unknown` directory are skipped. The result is
/// sorted.
pub fn scan_known_faces(root: &Path) -> io::Result<Vec<String>> {
    let mut faces = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name.starts_with('.') || name == UNKNOWN_LABEL {
            continue;
        }
        faces.push(name.to_string());
    }

    faces.sort();
    Ok(faces)
}

pub struct FaceRecognition {
    config: FaceRecognitionConfig,
    context: PostProcessorContext,
}

impl FaceRecognition {
    pub fn new(
        camera: CameraConfig,
        config: FaceRecognitionConfig,
        services: &SharedServices,
    ) -> Result<Self, BackendInitError> {
        let capture_dir = config
            .save_unknown_faces
            .then(|| config.unknown_faces_path.clone());
        let context = PostProcessorContext::new(
            camera,
            Domain::FaceRecognition,
            config.base.expiry_window(),
            capture_dir,
            services,
        )?;
        Ok(Self { config, context })
    }

    pub fn config(&self) -> &FaceRecognitionConfig {
        &self.config
    }
}

impl PostProcessor for FaceRecognition {
    fn context(&self) -> &PostProcessorContext {
        &self.context
    }

    fn initialize(&self) -> Result<Vec<String>, BackendInitError> {
        let camera = self.camera().identifier().to_string();

        if let Some(store) = self.context.captures() {
            store
                .prepare()
                .map_err(|source| BackendInitError::CaptureDirUnavailable {
                    camera: camera.clone(),
                    path: store.directory().to_path_buf(),
                    source,
                })?;
        }

        let root = &self.config.face_recognition_path;
        if !root.is_dir() {
            warn!(
                camera = %camera,
                path = %root.display(),
                "Face recognition path is not a directory, no known faces registered"
            );
            return Ok(Vec::new());
        }

        let faces = scan_known_faces(root).map_err(|source| BackendInitError::ReferenceDirUnreadable {
            camera: camera.clone(),
            path: root.clone(),
            source,
        })?;
        for face in &faces {
            self.context.register_known(face);
        }

        info!(camera = %camera, faces = faces.len(), "Face recognition initialized");
        Ok(faces)
    }

    fn process(&self, batch: &DetectionBatch) {
        if batch.source == Source::Remote && !self.config.detect_remote_faces {
            debug!(camera = %batch.camera, "Remote face results ignored, detect_remote_faces is off");
            return;
        }

        let mut unknown_found = false;
        for recognition in &batch.recognitions {
            match recognition.known_label() {
                Some(label) => {
                    self.on_identity_confirmed(
                        label,
                        recognition.coordinates,
                        recognition.confidence,
                        recognition.extra_attributes.clone(),
                    );
                }
                None => unknown_found = true,
            }
        }

        // One capture per frame, however many unknown faces it holds
        if unknown_found && self.config.save_unknown_faces {
            match &batch.frame {
                Some(frame) => {
                    self.on_unknown_captured(frame);
                }
                None => debug!(camera = %batch.camera, "Unknown face without frame, nothing saved"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FsImageWriter;
    use crate::detection::{BoundingBox, Frame, Recognition};
    use crate::entity::EntityRegistry;
    use crate::events::{EventDispatcher, PresenceKind};
    use nvr_presence_config::{EnvCapabilities, RawCameraConfig};
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn camera() -> CameraConfig {
        let raw = RawCameraConfig {
            name: Some("Front Door".to_string()),
            host: Some("10.0.0.5".to_string()),
            port: Some(554),
            path: Some("/stream".to_string()),
            ..Default::default()
        };
        CameraConfig::from_raw(&raw, 0, &EnvCapabilities::default()).unwrap()
    }

    fn services() -> SharedServices {
        let dispatcher = Arc::new(EventDispatcher::new(64));
        SharedServices {
            registry: Arc::new(EntityRegistry::new(dispatcher.clone())),
            dispatcher,
            image_writer: Arc::new(FsImageWriter),
        }
    }

    fn face_config(root: &Path) -> FaceRecognitionConfig {
        let mut config = FaceRecognitionConfig {
            face_recognition_path: root.join("faces"),
            unknown_faces_path: root.join("faces").join("unknown"),
            ..Default::default()
        };
        config.base.expire_after = 5.0;
        config
    }

    fn recognition(label: Option<&str>) -> Recognition {
        Recognition {
            label: label.map(str::to_string),
            coordinates: BoundingBox::new(1, 2, 3, 4),
            confidence: Some(0.9),
            extra_attributes: None,
        }
    }

    fn batch(source: Source, recognitions: Vec<Recognition>) -> DetectionBatch {
        DetectionBatch {
            camera: "front_door".to_string(),
            domain: Domain::FaceRecognition,
            source,
            recognitions,
            frame: Some(Frame {
                width: 1,
                height: 1,
                data: vec![1, 2, 3],
            }),
        }
    }

    #[test]
    fn test_scan_known_faces() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for dir in ["bob", "alice", "unknown", ".cache"] {
            fs::create_dir(root.join(dir)).unwrap();
        }
        fs::write(root.join("notes.txt"), "x").unwrap();
        fs::create_dir(root.join("alice").join("nested")).unwrap();

        let faces = scan_known_faces(root).unwrap();
        assert_eq!(faces, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn test_initialize_registers_known_faces() {
        let temp_dir = TempDir::new().unwrap();
        let config = face_config(temp_dir.path());
        fs::create_dir_all(config.face_recognition_path.join("alice")).unwrap();
        fs::create_dir_all(config.face_recognition_path.join("bob")).unwrap();

        let services = services();
        let backend = FaceRecognition::new(camera(), config.clone(), &services).unwrap();
        let faces = backend.initialize().unwrap();

        assert_eq!(faces, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(services.registry.registration_count(), 2);
        assert!(config.unknown_faces_path.is_dir());
        // "unknown" was created by initialize but is not a known face
        assert!(services
            .registry
            .get("front_door", Domain::FaceRecognition, UNKNOWN_LABEL)
            .is_none());
    }

    #[tokio::test]
    async fn test_initialize_without_reference_dir() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = face_config(temp_dir.path());
        config.save_unknown_faces = false;

        let services = services();
        let backend = FaceRecognition::new(camera(), config, &services).unwrap();
        assert!(backend.initialize().unwrap().is_empty());
        assert!(services.registry.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_fails_when_capture_dir_blocked() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = face_config(temp_dir.path());
        // A regular file where the capture directory should go
        fs::write(temp_dir.path().join("blocked"), "x").unwrap();
        config.unknown_faces_path = temp_dir.path().join("blocked").join("unknown");

        let backend = FaceRecognition::new(camera(), config, &services()).unwrap();
        assert!(matches!(
            backend.initialize(),
            Err(BackendInitError::CaptureDirUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_process_confirms_known_and_saves_unknown() {
        let temp_dir = TempDir::new().unwrap();
        let config = face_config(temp_dir.path());
        let services = services();
        let mut events = services.dispatcher.subscribe("front_door/face_recognition/#");
        let backend = FaceRecognition::new(camera(), config.clone(), &services).unwrap();
        backend.initialize().unwrap();

        backend.process(&batch(
            Source::Local,
            vec![recognition(Some("alice")), recognition(None), recognition(Some("unknown"))],
        ));

        let detected: Vec<_> = events
            .drain()
            .iter()
            .filter_map(|e| e.as_presence().cloned())
            .collect();
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].kind, PresenceKind::Detected);
        assert_eq!(detected[0].identity.label, "alice");
        assert_eq!(backend.present().len(), 1);
        assert_eq!(backend.context().tracker().expire_after(), Duration::from_secs(5));

        let saved = fs::read_dir(&config.unknown_faces_path).unwrap().count();
        assert_eq!(saved, 1);
    }

    #[tokio::test]
    async fn test_json_batch_with_frame_saves_unknown() {
        let temp_dir = TempDir::new().unwrap();
        let config = face_config(temp_dir.path());
        let services = services();
        let backend = FaceRecognition::new(camera(), config.clone(), &services).unwrap();
        backend.initialize().unwrap();

        let line = r#"{"camera":"front_door","domain":"face_recognition","recognitions":[{"label":"unknown","coordinates":{"left":1,"top":2,"right":3,"bottom":4}}],"frame":{"width":1,"height":1,"data":"/9j/"}}"#;
        let batch: DetectionBatch = serde_json::from_str(line).unwrap();
        backend.process(&batch);

        let saved: Vec<_> = fs::read_dir(&config.unknown_faces_path)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(saved.len(), 1);
        assert_eq!(fs::read(&saved[0]).unwrap(), vec![0xff, 0xd8, 0xff]);
        assert!(backend.present().is_empty());
    }

    #[tokio::test]
    async fn test_remote_results_gated_by_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = face_config(temp_dir.path());
        config.save_unknown_faces = false;
        let services = services();

        let backend = FaceRecognition::new(camera(), config.clone(), &services).unwrap();
        backend.process(&batch(Source::Remote, vec![recognition(Some("carol"))]));
        assert!(backend.present().is_empty());
        assert!(services.registry.is_empty());

        config.detect_remote_faces = true;
        let backend = FaceRecognition::new(camera(), config, &services).unwrap();
        backend.process(&batch(Source::Remote, vec![recognition(Some("carol"))]));
        assert_eq!(backend.present().len(), 1);
        assert_eq!(services.registry.registration_count(), 1);
    }
}
