//! Configuration for the presence daemon
//!
//! Loads cameras and recognition backends from TOML, validates them and
//! resolves each camera's stream URL and decode path.

pub mod camera;
pub mod config;
pub mod recognition;

pub use camera::*;
pub use config::*;
pub use recognition::*;
