//! Top-level configuration structures and loading logic

use crate::camera::{resolve_cameras, CameraConfig, EnvCapabilities, RawCameraConfig, ValidationError};
use crate::recognition::{FaceRecognitionConfig, ObjectDetectorConfig};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

pub const ENV_STATUS_BIND: &str = "NVR_STATUS_BIND";
pub const ENV_EVENT_BUFFER: &str = "NVR_EVENT_BUFFER";

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// One or more fields failed validation
    #[error("Invalid configuration: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Status HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Whether to start the status server
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    /// Listen address
    #[serde(default = "default_server_bind")]
    pub bind: String,
}

fn default_server_enabled() -> bool {
    true
}

fn default_server_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            bind: default_server_bind(),
        }
    }
}

/// Event dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsConfig {
    /// Subscription backlog step at which a slow subscriber is logged.
    /// Events are never dropped.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

fn default_buffer_capacity() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

/// The configuration file as written, before validation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawConfig {
    #[serde(default)]
    pub cameras: Vec<RawCameraConfig>,
    pub face_recognition: Option<FaceRecognitionConfig>,
    pub object_detector: Option<ObjectDetectorConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

/// Main configuration structure, fully validated
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub cameras: Vec<CameraConfig>,
    pub face_recognition: Option<FaceRecognitionConfig>,
    pub object_detector: Option<ObjectDetectorConfig>,
    pub server: ServerConfig,
    pub events: EventsConfig,
    /// Capability flags the camera decode paths were resolved against
    pub capabilities: EnvCapabilities,
}

impl Config {
    /// Load configuration from a TOML file, probing the environment for
    /// hardware decode capabilities
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string using capability flags from the environment
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        Self::parse_toml_with(content, EnvCapabilities::from_env())
    }

    /// Parse configuration from a TOML string against explicit capability flags
    pub fn parse_toml_with(content: &str, caps: EnvCapabilities) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        Self::validate(raw, caps)
    }

    /// Validate a raw configuration
    ///
    /// Every camera and backend section is checked; all problems are
    /// reported together.
    pub fn validate(raw: RawConfig, caps: EnvCapabilities) -> Result<Self, ConfigError> {
        if caps.count() > 1 {
            warn!(
                cuda = caps.cuda,
                opencl = caps.opencl,
                raspberry_pi3 = caps.raspberry_pi3,
                "Multiple hardware decode capabilities advertised, first match wins"
            );
        }

        let (cameras, mut errors) = match resolve_cameras(&raw.cameras, &caps) {
            Ok(cameras) => (cameras, Vec::new()),
            Err(errors) => (Vec::new(), errors),
        };

        // Backend camera references can only be checked against a valid camera list
        if errors.is_empty() {
            if let Some(face) = &raw.face_recognition {
                errors.extend(face.validate(&cameras));
            }
            if let Some(object) = &raw.object_detector {
                errors.extend(object.validate(&cameras));
            }
        }

        if raw.events.buffer_capacity == 0 {
            errors.push(ValidationError::new(
                "events",
                "buffer_capacity",
                "must be at least 1",
            ));
        }

        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        for camera in &cameras {
            debug!(
                camera = %camera.identifier(),
                hwaccel = %camera.hwaccel(),
                "Resolved camera"
            );
        }

        Ok(Self {
            cameras,
            face_recognition: raw.face_recognition,
            object_detector: raw.object_detector,
            server: raw.server,
            events: raw.events,
            capabilities: caps,
        })
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - NVR_STATUS_BIND -> server.bind
    /// - NVR_EVENT_BUFFER -> events.buffer_capacity
    pub fn apply_env_overrides(&mut self) {
        // NVR_STATUS_BIND
        if let Ok(val) = env::var(ENV_STATUS_BIND) {
            if !val.trim().is_empty() {
                self.server.bind = val.trim().to_string();
            }
        }

        // NVR_EVENT_BUFFER
        if let Ok(val) = env::var(ENV_EVENT_BUFFER) {
            match val.parse::<usize>() {
                Ok(capacity) if capacity > 0 => self.events.buffer_capacity = capacity,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Look up a camera by identifier
    pub fn camera(&self, identifier: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.identifier() == identifier)
    }
}
