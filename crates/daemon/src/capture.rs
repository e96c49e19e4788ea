//! Persistence of unmatched detections.
//!
//! Frames with an unknown detection are written to disk for later labelling.
//! A failed write is logged and otherwise ignored; it never affects presence
//! state.

use crate::detection::{Domain, Frame};
use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write capture {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("frame has no image data")]
    EmptyFrame,
}

/// Writes an encoded frame to a path.
pub trait ImageWriter: Send + Sync {
    fn write(&self, path: &Path, frame: &Frame) -> Result<(), PersistenceError>;
}

/// Writes the frame's encoded bytes verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsImageWriter;

impl ImageWriter for FsImageWriter {
    fn write(&self, path: &Path, frame: &Frame) -> Result<(), PersistenceError> {
        if frame.data.is_empty() {
            return Err(PersistenceError::EmptyFrame);
        }
        fs::write(path, &frame.data).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `<YYYY-mm-dd-HH:MM:SS>-<domain>-<uuid>.jpg`
pub fn capture_file_name(domain: Domain) -> String {
    format!(
        "{}-{}-{}.jpg",
        Local::now().format("%Y-%m-%d-%H:%M:%S"),
        domain,
        Uuid::new_v4()
    )
}

/// Saves unknown captures for one backend into a directory.
#[derive(Clone)]
pub struct CaptureStore {
    directory: PathBuf,
    domain: Domain,
    writer: Arc<dyn ImageWriter>,
}

impl CaptureStore {
    pub fn new(directory: PathBuf, domain: Domain, writer: Arc<dyn ImageWriter>) -> Self {
        Self {
            directory,
            domain,
            writer,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Create the capture directory if it is missing.
    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.directory)
    }

    /// Write `frame` under a fresh unique name. Failures are logged and
    /// returned as `None`.
    pub fn save(&self, frame: &Frame) -> Option<PathBuf> {
        let path = self.directory.join(capture_file_name(self.domain));
        debug!(path = %path.display(), "Unknown detection, saving capture");

        match self.writer.write(&path, frame) {
            Ok(()) => Some(path),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed saving unknown capture to disk");
                None
            }
        }
    }
}
