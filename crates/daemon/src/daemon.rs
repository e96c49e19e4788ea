//! Daemon startup and main loop
//!
//! Wires the dispatcher, entity registry and recognition backends together
//! and routes incoming detection batches to one worker per camera.

use crate::capture::{FsImageWriter, ImageWriter};
use crate::config::{Config, ConfigError};
use crate::detection::{DetectedIdentity, DetectionBatch, Domain};
use crate::entity::EntityRegistry;
use crate::events::{EventDispatcher, EventPayload};
use crate::face_recognition::FaceRecognition;
use crate::object_detector::ObjectDetector;
use crate::post_processor::{BackendInitError, PostProcessor, SharedServices};
use crate::status_server::{run_status_server, ServerError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Queue depth of the ingest channel and of each camera worker
const BATCH_QUEUE_CAPACITY: usize = 100;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Batch addressed to a camera that is not configured
    #[error("Unknown camera '{0}'")]
    UnknownCamera(String),

    /// The daemon has shut down or its main loop is already running
    #[error("Daemon is not accepting work: {0}")]
    Closed(String),
}

type Processors = Arc<Vec<Arc<dyn PostProcessor>>>;

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Validated configuration
    pub config: Config,
    /// Process-wide event bus
    pub dispatcher: Arc<EventDispatcher>,
    /// Presence entities
    pub registry: Arc<EntityRegistry>,
    /// Initialized backends per camera identifier
    processors: HashMap<String, Processors>,
    /// Backends that failed to initialize
    init_failures: usize,
    batch_tx: mpsc::Sender<DetectionBatch>,
    batch_rx: Mutex<Option<mpsc::Receiver<DetectionBatch>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Daemon {
    /// Initialize the daemon from a configuration file
    ///
    /// Loads the file, applies environment overrides and builds the daemon.
    pub async fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Ok(Self::new(config).await)
    }

    /// Initialize the daemon with an existing configuration
    pub async fn new(config: Config) -> Self {
        Self::with_image_writer(config, Arc::new(FsImageWriter)).await
    }

    /// Initialize the daemon with a custom writer for unknown captures
    ///
    /// This performs the startup sequence:
    /// 1. Create the event dispatcher and entity registry
    /// 2. Build the configured backends for every camera
    /// 3. Initialize each backend; a failure disables only that backend on that camera
    pub async fn with_image_writer(config: Config, image_writer: Arc<dyn ImageWriter>) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new(config.events.buffer_capacity));
        let registry = Arc::new(EntityRegistry::new(dispatcher.clone()));
        let services = SharedServices {
            dispatcher: dispatcher.clone(),
            registry: registry.clone(),
            image_writer,
        };

        let mut processors = HashMap::new();
        let mut init_failures = 0;

        for camera in &config.cameras {
            let mut backends: Vec<Arc<dyn PostProcessor>> = Vec::new();

            if let Some(face) = config.face_recognition.as_ref().filter(|f| f.base.applies_to(camera)) {
                let backend = FaceRecognition::new(camera.clone(), face.clone(), &services)
                    .map(|b| Arc::new(b) as Arc<dyn PostProcessor>);
                match initialize(backend) {
                    Ok(backend) => backends.push(backend),
                    Err(e) => {
                        error!(camera = %camera.identifier(), error = %e, "Face recognition disabled");
                        init_failures += 1;
                    }
                }
            }

            if let Some(object) = config.object_detector.as_ref().filter(|o| o.base.applies_to(camera)) {
                let backend = ObjectDetector::new(camera.clone(), object.clone(), &services)
                    .map(|b| Arc::new(b) as Arc<dyn PostProcessor>);
                match initialize(backend) {
                    Ok(backend) => backends.push(backend),
                    Err(e) => {
                        error!(camera = %camera.identifier(), error = %e, "Object detection disabled");
                        init_failures += 1;
                    }
                }
            }

            info!(
                camera = %camera.identifier(),
                hwaccel = %camera.hwaccel(),
                backends = backends.len(),
                "Camera ready"
            );
            processors.insert(camera.identifier().to_string(), Arc::new(backends));
        }

        let (batch_tx, batch_rx) = mpsc::channel(BATCH_QUEUE_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            dispatcher,
            registry,
            processors,
            init_failures,
            batch_tx,
            batch_rx: Mutex::new(Some(batch_rx)),
            shutdown_tx,
        }
    }

    /// Backends running for `camera`
    pub fn processors(&self, camera: &str) -> &[Arc<dyn PostProcessor>] {
        self.processors
            .get(camera)
            .map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    /// Number of backends that failed to initialize
    pub fn init_failures(&self) -> usize {
        self.init_failures
    }

    /// Identities currently present on `camera`, per domain
    pub fn present(&self, camera: &str) -> Vec<(Domain, DetectedIdentity)> {
        self.processors(camera)
            .iter()
            .flat_map(|p| {
                let domain = p.domain();
                p.present().into_iter().map(move |identity| (domain, identity))
            })
            .collect()
    }

    /// Submit a detection batch to the queue
    pub async fn submit(&self, batch: DetectionBatch) -> Result<(), DaemonError> {
        if !self.processors.contains_key(&batch.camera) {
            return Err(DaemonError::UnknownCamera(batch.camera));
        }
        self.batch_tx
            .send(batch)
            .await
            .map_err(|e| DaemonError::Closed(format!("Failed to submit batch: {}", e)))
    }

    /// Get a clone of the batch sender for external producers
    pub fn batch_sender(&self) -> mpsc::Sender<DetectionBatch> {
        self.batch_tx.clone()
    }

    /// Start the event log task
    ///
    /// Logs every published event until the dispatcher shuts down.
    pub fn start_event_logger(&self) -> JoinHandle<()> {
        let mut events = self.dispatcher.subscribe("#");
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &event.payload {
                    EventPayload::Presence(presence) => info!(
                        topic = %event.topic,
                        camera = %presence.camera_identifier,
                        label = %presence.identity.label,
                        kind = %presence.kind,
                        "Presence event"
                    ),
                    EventPayload::EntityAdded(entity) => {
                        debug!(topic = %event.topic, entity_id = %entity.entity_id, "Entity added")
                    }
                }
            }
        })
    }

    /// Start the status HTTP server as a background task, if enabled
    pub fn start_status_server(&self) -> Option<JoinHandle<()>> {
        if !self.config.server.enabled {
            return None;
        }
        let registry = self.registry.clone();
        let bind = self.config.server.bind.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_status_server(registry, &bind).await {
                error!(error = %e, "Status server error");
            }
        }))
    }

    fn spawn_camera_worker(
        camera: String,
        processors: Processors,
    ) -> (mpsc::Sender<DetectionBatch>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DetectionBatch>(BATCH_QUEUE_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let processors = processors.clone();
                // Backends do filesystem work for unknown captures
                let result = tokio::task::spawn_blocking(move || {
                    for processor in processors.iter().filter(|p| p.domain() == batch.domain) {
                        processor.process(&batch);
                    }
                })
                .await;
                if let Err(e) = result {
                    error!(camera = %camera, error = %e, "Batch processing panicked");
                }
            }
            debug!(camera = %camera, "Camera worker stopped");
        });
        (tx, handle)
    }

    /// Run the daemon main loop
    ///
    /// Routes batches to per-camera workers until [`shutdown`](Self::shutdown)
    /// is called. Returns once every worker has drained its queue.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let mut rx = self
            .batch_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| DaemonError::Closed("main loop already started".to_string()))?;
        let mut shutdown = self.shutdown_tx.subscribe();

        let mut workers = HashMap::new();
        let mut handles = Vec::new();
        for (camera, processors) in &self.processors {
            let (tx, handle) = Self::spawn_camera_worker(camera.clone(), processors.clone());
            workers.insert(camera.clone(), tx);
            handles.push(handle);
        }

        loop {
            tokio::select! {
                batch = rx.recv() => {
                    let Some(batch) = batch else { break };
                    match workers.get(&batch.camera) {
                        Some(worker) => {
                            if worker.send(batch).await.is_err() {
                                warn!("Camera worker gone, batch dropped");
                            }
                        }
                        None => warn!(camera = %batch.camera, "Batch for unknown camera dropped"),
                    }
                }
                _ = async {
                    // The returned `Ref` must not outlive this branch
                    let _ = shutdown.wait_for(|stopped| *stopped).await;
                } => break,
            }
        }

        drop(workers);
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Run the daemon with all background tasks
    ///
    /// Starts the event logger, the status server and the main loop.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        let _logger_handle = self.start_event_logger();
        let _server_handle = self.start_status_server();
        self.run().await
    }

    /// Stop the main loop, cancel pending expiries without publishing them
    /// and drain the dispatcher
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        for processors in self.processors.values() {
            for processor in processors.iter() {
                processor.shutdown();
            }
        }
        self.dispatcher.shutdown();
        info!("Daemon shut down");
    }
}

fn initialize(
    backend: Result<Arc<dyn PostProcessor>, BackendInitError>,
) -> Result<Arc<dyn PostProcessor>, BackendInitError> {
    let backend = backend?;
    backend.initialize()?;
    Ok(backend)
}
