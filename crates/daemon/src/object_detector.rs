//! Object detection backend.
//!
//! Tracks presence of object labels (person, car, ...). A detection counts
//! when its label is configured and its confidence reaches the label's
//! threshold. Unlabelled detections are dropped.

use crate::detection::{DetectionBatch, Domain};
use crate::post_processor::{BackendInitError, PostProcessor, PostProcessorContext, SharedServices};
use nvr_presence_config::{CameraConfig, ObjectDetectorConfig};
use tracing::{debug, info};

pub struct ObjectDetector {
    config: ObjectDetectorConfig,
    context: PostProcessorContext,
}

impl ObjectDetector {
    pub fn new(
        camera: CameraConfig,
        config: ObjectDetectorConfig,
        services: &SharedServices,
    ) -> Result<Self, BackendInitError> {
        let context = PostProcessorContext::new(
            camera,
            Domain::ObjectDetector,
            config.base.expiry_window(),
            None,
            services,
        )?;
        Ok(Self { config, context })
    }
}

impl PostProcessor for ObjectDetector {
    fn context(&self) -> &PostProcessorContext {
        &self.context
    }

    /// No reference data; entities appear on first detection.
    fn initialize(&self) -> Result<Vec<String>, BackendInitError> {
        let labels: Vec<&str> = self.config.labels.iter().map(|l| l.label.as_str()).collect();
        info!(camera = %self.camera().identifier(), ?labels, "Object detector initialized");
        Ok(Vec::new())
    }

    fn process(&self, batch: &DetectionBatch) {
        for recognition in &batch.recognitions {
            let Some(label) = recognition.known_label() else {
                continue;
            };
            let Some(threshold) = self.config.threshold_for(label) else {
                continue;
            };
            let confidence = recognition.confidence.unwrap_or(1.0);
            if confidence < threshold {
                debug!(camera = %batch.camera, label, confidence, threshold, "Below confidence threshold");
                continue;
            }

            self.on_identity_confirmed(
                label,
                recognition.coordinates,
                recognition.confidence,
                recognition.extra_attributes.clone(),
            );
        }
    }
}
