//! Config Handler.

use serde::{Deserialize, Serialize};

/// Provides TOML config file handling.
pub mod toml {

    use crate::module::define;
    use crate::module::error::ConfigError;
    use std::fs::File;
    use std::io::prelude::*;
    use std::path::Path;

    /// Loads a configuration file from the given directory.
    /// If not found, generates a default config file.
    ///
    /// # Arguments
    ///
    /// * `dir` - The directory where the configuration file is located or should be created.
    ///
    pub fn load(dir: &str) -> Result<super::Config, ConfigError> {
        // Check if the config file exists
        let path = Path::new(dir).join(define::path::CONF_FILE);

        if !path.is_file() {
            // Create the default config if it doesn't exist
            save(dir, &super::default_config()?)?;
            log::info!("Default config written to {}", path.display());
        }

        // Load the config
        let conf_str: String = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&conf_str)?)
    }

    /// Saves a configuration file to the given directory.
    ///
    /// # Arguments
    ///
    /// * `dir` - The directory where the configuration file should be saved.
    /// * `conf` - The configuration data to be saved.
    ///
    pub fn save(dir: &str, conf: &super::Config) -> Result<(), ConfigError> {
        let toml_str = toml::to_string(conf)?;
        let path = crate::module::util::path::join(&[dir, define::path::CONF_FILE]);
        let mut file = File::create(path)?;
        file.write_all(toml_str.as_bytes())?;
        Ok(())
    }
}

/// Represents the configuration data structure.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub system: System,
    pub camera: Camera,
    pub motion: Motion,
    pub fall: Fall,
    pub emotion: Emotion,
    pub identity: Identity,
    pub vision: Vision,
    pub notification: Notification,
    pub pipeline: Pipeline,
}

impl Default for Config {
    fn default() -> Self {
        default_config().expect("embedded default config is valid")
    }
}

/// Frame source of a fresh config. The camera needs the `v4l2` feature.
pub const DEFAULT_SOURCE: &str = if cfg!(feature = "v4l2") {
    "v4l2"
} else {
    "directory"
};

/// Parse the embedded default config for this build.
fn default_config() -> Result<Config, crate::module::error::ConfigError> {
    let mut config: Config = ::toml::from_str(DEFAULT_CONFIG)?;
    config.camera.source = DEFAULT_SOURCE.to_string();
    Ok(config)
}

/// Represents system-related configuration parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct System {
    pub log_level: String,
    pub log_console: bool,
}

/// Represents camera-related configuration parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Camera {
    pub source: String,
    pub device: String,
    pub directory: String,
    pub grab_times: u8,
    pub fps: u32,
    pub width: u16,
    pub height: u16,
}

/// Represents frame differencing parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Motion {
    pub threshold_area: f64,
    pub blur_kernel: u32,
    pub diff_threshold: u8,
    pub dilate_iterations: u32,
}

/// Represents fall debouncing parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Fall {
    pub ratio_threshold: f32,
    pub frames_threshold: u32,
}

/// Represents emotion cache parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Emotion {
    pub enabled: bool,
    pub policy: String,
    pub refresh_ticks: u64,
    pub min_interval_ms: u64,
    pub min_crop: u32,
    pub slot_tracking: String,
    pub iou_threshold: f32,
}

/// Represents identity matching parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Identity {
    pub enabled: bool,
    pub tolerance: f32,
}

/// Represents model-related configuration parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Vision {
    pub detector_model: String,
    pub fallback_detector_model: String,
    pub embedder_model: String,
    pub emotion_model: String,
    pub detect_threshold: f32,
    pub intra_threads: i16,
}

/// Represents notification-related configuration parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Notification {
    pub endpoint: String,
    pub token: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

/// Represents tick loop parameters.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Pipeline {
    pub pacing_ms: u64,
    pub stats_interval: u64,
    pub max_capture_failures: u32,
}

// Default configuration data in TOML format
const DEFAULT_CONFIG: &str = r#"
[system]
  log_level = 'INFO' # Log level ('ERROR', 'WARN', 'INFO', 'DEBUG', 'TRACE')
  log_console = true # Mirror the log file on stdout

[camera]
  source = 'v4l2' # Frame source ('v4l2', 'directory'), 'directory' without the v4l2 feature
  device = '/dev/video0' # V4L2 device
  directory = '' # Image directory replayed when source = 'directory', empty for <data>/frames
  grab_times = 2 # Frames grabbed per capture, the last one is kept
  fps = 30 # Capture rate
  width = 640 # Image width
  height = 480 # Image height

[motion]
  threshold_area = 500.0 # Minimum region area in px^2
  blur_kernel = 21 # Gaussian kernel size
  diff_threshold = 25 # Intensity cutoff (0-255)
  dilate_iterations = 2 # Dilation passes over the motion mask

[fall]
  ratio_threshold = 1.8 # Width / height ratio of a prone subject
  frames_threshold = 15 # Consecutive ticks before a fall is confirmed

[emotion]
  enabled = true # Run the emotion classifier
  policy = 'ticks' # Refresh policy ('ticks', 'interval')
  refresh_ticks = 10 # Ticks between refreshes of one slot
  min_interval_ms = 2000 # Milliseconds between refreshes when policy = 'interval'
  min_crop = 30 # Minimum crop side in px
  slot_tracking = 'index' # Slot keys ('index', 'iou')
  iou_threshold = 0.3 # Minimum overlap to keep a slot when slot_tracking = 'iou'

[identity]
  enabled = true # Match faces against known identities
  tolerance = 0.6 # Maximum embedding distance of a match

[vision]
  detector_model = 'yolov8n_face_640.onnx' # Face detector, relative to the model dir
  fallback_detector_model = 'scrfd_500m_640.onnx' # SCRFD detector used when detector_model is missing
  embedder_model = 'arcface_112.onnx' # Face embedder, relative to the model dir
  emotion_model = 'emotion_ferplus_64.onnx' # Emotion classifier, relative to the model dir
  detect_threshold = 0.5 # Minimum face confidence
  intra_threads = 4 # ONNX Runtime threads

[notification]
  endpoint = '' # Event endpoint (e.g. 'http://localhost:5000/events'), empty disables
  token = '' # Bearer token
  interval_ms = 60000 # Minimum interval between two events of the same type
  timeout_ms = 5000 # Request timeout

[pipeline]
  pacing_ms = 0 # Sleep between ticks
  stats_interval = 30 # Ticks between statistics log lines
  max_capture_failures = 30 # Consecutive capture failures ending the run
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_load() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().to_str().unwrap();
        let res = toml::load(dir).unwrap();
        assert_eq!(res.motion.threshold_area, 500.0);
        assert_eq!(res.fall.frames_threshold, 15);
        assert_eq!(res.emotion.refresh_ticks, 10);
        assert_eq!(res.identity.tolerance, 0.6);
        assert_eq!(res.camera.source, DEFAULT_SOURCE);
        // The default file now exists and loads the same way.
        assert_eq!(toml::load(dir).unwrap(), res);
    }

    #[test]
    fn run_save() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().to_str().unwrap();
        let mut conf = Config::default();
        conf.fall.frames_threshold = 20;
        toml::save(dir, &conf).unwrap();
        assert_eq!(toml::load(dir).unwrap().fall.frames_threshold, 20);
    }

    #[test]
    fn broken_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("conf.toml"), "[fall]\nratio_threshold = 'x'").unwrap();
        assert!(toml::load(dir.path().to_str().unwrap()).is_err());
    }
}
