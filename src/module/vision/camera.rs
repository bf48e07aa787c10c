//! Camera Functions
//!
//! Frame sources yield one decoded RGB frame per call.

use std::fs;
use std::path::PathBuf;

use super::Frame;
use crate::module::error::{CaptureError, PipelineError};
use crate::module::util::init::CarewatchProperty;

/// Anything the pipeline can pull frames from.
pub trait FrameSource {
    /// Next frame. [`CaptureError::Exhausted`] ends the run, any other
    /// error skips the tick.
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Stop the device. Called once when the run ends.
    fn release(&mut self) {}
}

/// Replays the image files of a directory in file name order.
pub struct ImageDirSource {
    files: Vec<PathBuf>,
    next: usize,
}

impl ImageDirSource {
    const EXTENSIONS: [&'static str; 4] = ["jpg", "jpeg", "png", "bmp"];

    pub fn new(dir: &str) -> Result<Self, CaptureError> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| Self::EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        if files.is_empty() {
            log::warn!("No frames found in {}", dir);
        } else {
            log::info!("Replaying {} frames from {}", files.len(), dir);
        }
        Ok(Self { files, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let path = self.files.get(self.next).ok_or(CaptureError::Exhausted)?;
        let index = self.next as u64;
        self.next += 1;
        let image = image::open(path)?.to_rgb8();
        let frame = Frame::new(index, image);
        if frame.is_empty() {
            return Err(CaptureError::EmptyFrame);
        }
        Ok(frame)
    }
}

#[cfg(feature = "v4l2")]
pub use self::v4l2::V4l2Camera;

#[cfg(feature = "v4l2")]
mod v4l2 {
    use rscam::{Camera, Config};

    use super::FrameSource;
    use crate::module::error::CaptureError;
    use crate::module::util::conf;
    use crate::module::vision::Frame;

    /// Represents a V4L2 camera configuration and capture functionality.
    ///
    pub struct V4l2Camera {
        cap: Camera,
        grab_times: u8, // frames read per capture, only the last one is kept
        index: u64,
    }

    impl V4l2Camera {
        /// Opens the device and starts streaming MJPG.
        pub fn new(conf: &conf::Camera) -> Result<Self, CaptureError> {
            let mut cap =
                Camera::new(&conf.device).map_err(|e| CaptureError::Failure(e.to_string()))?;
            cap.start(&Config {
                interval: (1, conf.fps.max(1)),
                resolution: (conf.width as u32, conf.height as u32),
                format: b"MJPG",
                nbuffers: 1,
                ..Default::default()
            })
            .map_err(|e| CaptureError::Failure(e.to_string()))?;
            log::info!(
                "Camera {} started at {}x{}",
                conf.device,
                conf.width,
                conf.height
            );
            Ok(Self {
                cap,
                grab_times: conf.grab_times.max(1),
                index: 0,
            })
        }
    }

    impl FrameSource for V4l2Camera {
        fn capture(&mut self) -> Result<Frame, CaptureError> {
            // Grab frames to reduce delay.
            for _ in 1..self.grab_times {
                let _ = self.cap.capture();
            }
            let raw = self.cap.capture()?;
            if raw.is_empty() {
                return Err(CaptureError::EmptyFrame);
            }
            let image = image::load_from_memory(&raw[..])?.to_rgb8();
            let frame = Frame::new(self.index, image);
            self.index += 1;
            Ok(frame)
        }

        fn release(&mut self) {
            if let Err(e) = self.cap.stop() {
                log::warn!("Failed to stop camera: {}", e);
            }
        }
    }
}

/// Open the frame source named by `camera.source`.
pub fn open(property: &CarewatchProperty) -> Result<Box<dyn FrameSource>, PipelineError> {
    let conf = &property.conf.camera;
    match conf.source.as_str() {
        "directory" => {
            let dir = match conf.directory.as_str() {
                "" => property.path.dir.frames.as_str(),
                dir => dir,
            };
            Ok(Box::new(ImageDirSource::new(dir)?))
        }
        #[cfg(feature = "v4l2")]
        "v4l2" => Ok(Box::new(V4l2Camera::new(conf)?)),
        other => Err(PipelineError::UnsupportedSource(other.to_string())),
    }
}
