//! Module for Constants and Paths Definitions
//!
//! This module defines various constants and paths used throughout the application.

/// System Constants
pub mod system {
    /// Name of the system
    pub const NAME: &str = "carewatch";
}

/// File Paths
pub mod path {

    // Persistent Data Directory
    pub const PERSISTENT_DIR: &str = "/data/";

    // Fallback Data Directory (relative to the working directory)
    pub const LOCAL_DIR: &str = "./";

    // Snapshot Image Directory
    pub const IMG_DIR: &str = "img";

    // Replayed Frames Directory
    pub const FRAME_DIR: &str = "frames";

    // Log Directory
    pub const LOG_DIR: &str = "log";

    // Model Directory
    pub const MODEL_DIR: &str = "model";

    // Configuration File
    pub const CONF_FILE: &str = "conf.toml";

    // Known Identities
    pub const IDENTITY_FILE: &str = "known_faces.json";
}

/// Labels shared between the pipeline and its sinks.
pub mod label {
    /// Identity label for faces without a match.
    pub const UNKNOWN_IDENTITY: &str = "Unknown";

    /// Emotion sentinel for undersized crops or a missing classifier.
    pub const UNKNOWN_EMOTION: &str = "unknown";

    /// Emotion sentinel for a failed classification.
    pub const ERROR_EMOTION: &str = "error";
}
