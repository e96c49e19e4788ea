//! Recognition backend configuration.
//!
//! Both backends share [`RecognitionConfig`] (camera selection and expiry
//! window) and extend it with their own fields.

use crate::camera::{CameraConfig, ValidationError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_EXPIRE_AFTER: f64 = 5.0;
pub const DEFAULT_FACE_RECOGNITION_PATH: &str = "/config/face_recognition/faces";
pub const DEFAULT_UNKNOWN_FACES_PATH: &str = "/config/face_recognition/faces/unknown";
pub const DEFAULT_LABEL_CONFIDENCE: f32 = 0.8;

fn default_expire_after() -> f64 {
    DEFAULT_EXPIRE_AFTER
}

fn default_true() -> bool {
    true
}

fn default_face_recognition_path() -> PathBuf {
    PathBuf::from(DEFAULT_FACE_RECOGNITION_PATH)
}

fn default_unknown_faces_path() -> PathBuf {
    PathBuf::from(DEFAULT_UNKNOWN_FACES_PATH)
}

fn default_label_confidence() -> f32 {
    DEFAULT_LABEL_CONFIDENCE
}

/// Fields shared by every recognition backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecognitionConfig {
    /// Camera aliases the backend runs on. Empty means all cameras.
    #[serde(default)]
    pub cameras: Vec<String>,
    /// Seconds an identity stays present without a new sighting
    #[serde(default = "default_expire_after")]
    pub expire_after: f64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            expire_after: DEFAULT_EXPIRE_AFTER,
        }
    }
}

impl RecognitionConfig {
    /// `expire_after` as a non-zero `Duration`, or `None` when it is not
    /// positive, overflows `Duration` or rounds down to zero.
    pub fn try_expiry_window(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.expire_after)
            .ok()
            .filter(|window| !window.is_zero())
    }

    /// Validated expiry window. Unrepresentable values yield
    /// `Duration::ZERO`, which trackers reject.
    pub fn expiry_window(&self) -> Duration {
        self.try_expiry_window().unwrap_or(Duration::ZERO)
    }

    /// Whether the backend should run on `camera`.
    pub fn applies_to(&self, camera: &CameraConfig) -> bool {
        self.cameras.is_empty() || self.cameras.iter().any(|c| c == camera.identifier())
    }

    fn validate(&self, section: &str, cameras: &[CameraConfig]) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.try_expiry_window().is_none() {
            errors.push(ValidationError::new(
                section,
                "expire_after",
                format!(
                    "must be a positive duration in seconds (at least 1ns), got {}",
                    self.expire_after
                ),
            ));
        }
        for alias in &self.cameras {
            if !cameras.iter().any(|c| c.identifier() == alias) {
                errors.push(ValidationError::new(
                    section,
                    "cameras",
                    format!("references unknown camera '{}'", alias),
                ));
            }
        }
        errors
    }
}

/// `[face_recognition]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaceRecognitionConfig {
    #[serde(flatten)]
    pub base: RecognitionConfig,
    /// Directory holding one sub-directory per known face
    #[serde(default = "default_face_recognition_path")]
    pub face_recognition_path: PathBuf,
    #[serde(default = "default_true")]
    pub save_unknown_faces: bool,
    #[serde(default = "default_unknown_faces_path")]
    pub unknown_faces_path: PathBuf,
    /// Also accept matches reported by a remote recognition service
    #[serde(default)]
    pub detect_remote_faces: bool,
}

impl Default for FaceRecognitionConfig {
    fn default() -> Self {
        Self {
            base: RecognitionConfig::default(),
            face_recognition_path: default_face_recognition_path(),
            save_unknown_faces: true,
            unknown_faces_path: default_unknown_faces_path(),
            detect_remote_faces: false,
        }
    }
}

impl FaceRecognitionConfig {
    pub fn validate(&self, cameras: &[CameraConfig]) -> Vec<ValidationError> {
        self.base.validate("face_recognition", cameras)
    }
}

/// A label tracked by the object detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelConfig {
    pub label: String,
    /// Minimum confidence for a detection to count
    #[serde(default = "default_label_confidence")]
    pub confidence: f32,
}

/// `[object_detector]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectDetectorConfig {
    #[serde(flatten)]
    pub base: RecognitionConfig,
    /// Labels to track. Empty tracks every label.
    #[serde(default)]
    pub labels: Vec<LabelConfig>,
}

impl ObjectDetectorConfig {
    pub fn validate(&self, cameras: &[CameraConfig]) -> Vec<ValidationError> {
        let mut errors = self.base.validate("object_detector", cameras);
        for label in &self.labels {
            if label.label.is_empty() {
                errors.push(ValidationError::new("object_detector", "labels", "label must not be empty"));
            }
            if !(0.0..=1.0).contains(&label.confidence) {
                errors.push(ValidationError::new(
                    "object_detector",
                    "labels",
                    format!(
                        "confidence for '{}' must be within 0..=1, got {}",
                        label.label, label.confidence
                    ),
                ));
            }
        }
        errors
    }

    /// Confidence threshold for `label`, or `None` when it is not tracked.
    pub fn threshold_for(&self, label: &str) -> Option<f32> {
        if self.labels.is_empty() {
            return Some(0.0);
        }
        self.labels
            .iter()
            .find(|l| l.label == label)
            .map(|l| l.confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_defaults() {
        let config: FaceRecognitionConfig = toml::from_str("").unwrap();
        assert_eq!(config, FaceRecognitionConfig::default());
        assert_eq!(config.base.expiry_window(), Duration::from_secs(5));
        assert!(config.save_unknown_faces);
        assert!(!config.detect_remote_faces);
    }

    #[test]
    fn test_face_flattened_base() {
        let config: FaceRecognitionConfig = toml::from_str(
            r#"
cameras = ["front_door"]
expire_after = 2.5
save_unknown_faces = false
"#,
        )
        .unwrap();
        assert_eq!(config.base.cameras, vec!["front_door".to_string()]);
        assert_eq!(config.base.expiry_window(), Duration::from_millis(2500));
        assert!(!config.save_unknown_faces);
    }

    #[test]
    fn test_non_positive_expiry_rejected() {
        let mut config = FaceRecognitionConfig::default();
        config.base.expire_after = 0.0;
        let errors = config.validate(&[]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "expire_after");
        assert_eq!(errors[0].section, "face_recognition");
    }

    #[test]
    fn test_unrepresentable_expiry_rejected() {
        for value in [1e20, 1e-12, f64::NAN, f64::INFINITY, -1.0] {
            let mut config = ObjectDetectorConfig::default();
            config.base.expire_after = value;
            let errors = config.validate(&[]);
            assert_eq!(errors.len(), 1, "expire_after = {}", value);
            assert_eq!(errors[0].field, "expire_after");
            assert_eq!(config.base.try_expiry_window(), None);
            assert_eq!(config.base.expiry_window(), Duration::ZERO);
        }
    }

    #[test]
    fn test_small_expiry_accepted() {
        let mut config = ObjectDetectorConfig::default();
        config.base.expire_after = 0.001;
        assert!(config.validate(&[]).is_empty());
        assert_eq!(config.base.expiry_window(), Duration::from_millis(1));
    }

    #[test]
    fn test_unknown_camera_reference_rejected() {
        let mut config = ObjectDetectorConfig::default();
        config.base.cameras = vec!["attic".to_string()];
        let errors = config.validate(&[]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "cameras");
    }

    #[test]
    fn test_label_thresholds() {
        let config: ObjectDetectorConfig = toml::from_str(
            r#"
[[labels]]
label = "person"

[[labels]]
label = "car"
confidence = 0.5
"#,
        )
        .unwrap();
        assert_eq!(config.threshold_for("person"), Some(DEFAULT_LABEL_CONFIDENCE));
        assert_eq!(config.threshold_for("car"), Some(0.5));
        assert_eq!(config.threshold_for("dog"), None);
        assert!(config.validate(&[]).is_empty());
    }

    #[test]
    fn test_empty_labels_track_everything() {
        let config = ObjectDetectorConfig::default();
        assert_eq!(config.threshold_for("anything"), Some(0.0));
    }

    #[test]
    fn test_confidence_out_of_range_rejected() {
        let config = ObjectDetectorConfig {
            labels: vec![LabelConfig {
                label: "person".to_string(),
                confidence: 1.5,
            }],
            ..Default::default()
        };
        assert_eq!(config.validate(&[]).len(), 1);
    }
}
