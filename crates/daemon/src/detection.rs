//! Detection data shared by the backends, the tracker and event consumers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Label used by recognizers for an unmatched detection.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Free-form attributes a recognizer may attach to a detection.
pub type Attributes = HashMap<String, serde_json::Value>;

/// Recognition domain a backend belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    FaceRecognition,
    ObjectDetector,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::FaceRecognition => "face_recognition",
            Domain::ObjectDetector => "object_detector",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel bounding box: left, top, right, bottom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl BoundingBox {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

impl From<(i32, i32, i32, i32)> for BoundingBox {
    fn from((left, top, right, bottom): (i32, i32, i32, i32)) -> Self {
        Self::new(left, top, right, bottom)
    }
}

/// An encoded still image taken from a camera stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// JPEG-encoded image bytes, base64 in JSON
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(data: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Where a recognition result came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Matched against local reference data
    #[default]
    Local,
    /// Reported by a remote recognition service
    Remote,
}

/// One result of running inference on a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    /// Matched identity; `None` or `"unknown"` for an unmatched detection
    #[serde(default)]
    pub label: Option<String>,
    pub coordinates: BoundingBox,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub extra_attributes: Option<Attributes>,
}

impl Recognition {
    /// The matched label, or `None` when the detection is unknown.
    pub fn known_label(&self) -> Option<&str> {
        self.label
            .as_deref()
            .filter(|label| !label.is_empty() && *label != UNKNOWN_LABEL)
    }
}

/// Inference output for one frame of one camera, routed to the backends
/// of that camera and domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch {
    pub camera: String,
    pub domain: Domain,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub recognitions: Vec<Recognition>,
    /// Frame the recognitions were produced from, needed for unknown captures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<Frame>,
}

/// An identity currently considered present on a camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedIdentity {
    pub label: String,
    pub coordinates: BoundingBox,
    pub confidence: Option<f32>,
    pub extra_attributes: Option<Attributes>,
    /// Unix timestamp (milliseconds) of the sighting
    pub detected_at: i64,
}

impl DetectedIdentity {
    pub fn new(
        label: &str,
        coordinates: BoundingBox,
        confidence: Option<f32>,
        extra_attributes: Option<Attributes>,
    ) -> Self {
        Self {
            label: label.to_string(),
            coordinates,
            confidence,
            extra_attributes,
            detected_at: current_timestamp_ms(),
        }
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
