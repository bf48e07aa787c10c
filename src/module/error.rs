//! Error types.
//!
//! Each concern of the pipeline owns one enum. Only [`CaptureError::Exhausted`]
//! and startup failures ([`PipelineError`]) end a run; everything else is
//! handled inside the tick.

use thiserror::Error;

/// Frame acquisition errors.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The stream ended. The pipeline stops cleanly.
    #[error("capture source exhausted")]
    Exhausted,

    /// Transient failure. The tick is skipped.
    #[error("capture failed: {0}")]
    Failure(String),

    #[error("captured frame is empty")]
    EmptyFrame,

    #[error("capture io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame decode failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Face detection, embedding and emotion classification errors.
#[derive(Debug, Error)]
pub enum VisionError {
    /// The model could not be loaded or stopped working. The signal is
    /// disabled for the rest of the run.
    #[error("classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("face crop too small: {width}x{height}")]
    InvalidCrop { width: u32, height: u32 },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[cfg(feature = "onnx")]
    #[error("onnx runtime error: {0}")]
    Onnx(#[from] ort::OrtError),
}

/// Identity storage errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("identity storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("identity storage format error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors that prevent a pipeline run from starting.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("unsupported frame source: {0}")]
    UnsupportedSource(String),
}
