//! Provide Face Detection, Embedding and Emotion Classification
//!
//! The pipeline only sees the traits below. The `onnx` feature provides
//! implementations backed by ONNX Runtime.

use image::RgbImage;
use std::path::{Path, PathBuf};

use super::{BoundingBox, Embedding, Emotion, Frame};
use crate::module::error::VisionError;
use crate::module::util::conf::Vision;

/// Finds faces in a frame.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, VisionError>;
}

/// Turns a face into an identity embedding.
pub trait FaceEmbedder: Send {
    fn embed(&mut self, frame: &Frame, bbox: &BoundingBox) -> Result<Embedding, VisionError>;
}

/// Labels the emotion of a face crop.
pub trait EmotionClassifier: Send {
    fn classify(&mut self, crop: &RgbImage) -> Result<Emotion, VisionError>;
}

/// Face backend, chosen once at startup by what it can do.
pub enum FaceBackend {
    /// Detection and embedding. Identities can be matched and enrolled.
    Recognition {
        detector: Box<dyn FaceDetector>,
        embedder: Box<dyn FaceEmbedder>,
    },
    /// Detection only. Every face is labelled unknown.
    DetectionOnly { detector: Box<dyn FaceDetector> },
}

impl FaceBackend {
    pub fn supports_identity(&self) -> bool {
        matches!(self, Self::Recognition { .. })
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, VisionError> {
        match self {
            Self::Recognition { detector, .. } => detector.detect(frame),
            Self::DetectionOnly { detector } => detector.detect(frame),
        }
    }

    /// Drop the embedder and keep detecting.
    pub fn into_detection_only(self) -> Self {
        match self {
            Self::Recognition { detector, .. } => Self::DetectionOnly { detector },
            backend => backend,
        }
    }

    /// `None` when the backend cannot embed.
    pub fn embed(
        &mut self,
        frame: &Frame,
        bbox: &BoundingBox,
    ) -> Option<Result<Embedding, VisionError>> {
        match self {
            Self::Recognition { embedder, .. } => Some(embedder.embed(frame, bbox)),
            Self::DetectionOnly { .. } => None,
        }
    }
}

pub mod sort {
    //! Detections sort methods
    //!

    use super::BoundingBox;

    /// Index of the largest box, first one on ties.
    pub fn largest(boxes: &[BoundingBox]) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (i, bbox) in boxes.iter().enumerate() {
            if best.map_or(true, |(_, area)| bbox.area() > area) {
                best = Some((i, bbox.area()));
            }
        }
        best.map(|(i, _)| i)
    }
}

/// Drops boxes overlapping a higher-scored box by `iou_threshold` or more.
///
/// `scored` must be sorted by descending score.
pub fn suppress(scored: Vec<(BoundingBox, f32)>, iou_threshold: f32) -> Vec<(BoundingBox, f32)> {
    let mut kept: Vec<(BoundingBox, f32)> = Vec::new();
    for (bbox, score) in scored {
        if kept.iter().all(|(k, _)| k.iou(&bbox) < iou_threshold) {
            kept.push((bbox, score));
        }
    }
    kept
}

/// Face detector architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Yolo,
    Scrfd,
}

/// Detector models present in `model_dir`, primary first.
pub fn detector_candidates(model_dir: &Path, conf: &Vision) -> Vec<(DetectorKind, PathBuf)> {
    [
        (DetectorKind::Yolo, &conf.detector_model),
        (DetectorKind::Scrfd, &conf.fallback_detector_model),
    ]
    .into_iter()
    .filter(|(_, name)| !name.is_empty())
    .map(|(kind, name)| (kind, model_dir.join(name)))
    .filter(|(_, path)| path.is_file())
    .collect()
}

pub mod scrfd {
    //! SCRFD anchor decoding
    //!
    //! Nine outputs: scores, box distances and keypoints for each stride.

    use ndarray::{Array2, ArrayView2, Axis};

    use super::BoundingBox;

    pub const INPUT_SIZE: u32 = 640;
    pub const STRIDES: [u32; 3] = [8, 16, 32];
    pub const NUM_ANCHORS: usize = 2;
    pub const NUM_OUTPUTS: usize = 9;

    /// Size of the frame resized into a `size` square keeping its ratio, and
    /// the factor mapping model coordinates back to the frame.
    pub fn letterbox(width: u32, height: u32, size: u32) -> (u32, u32, f32) {
        let ratio = height as f32 / width as f32;
        let (nwidth, nheight) = if ratio > 1.0 {
            ((size as f32 / ratio).floor().max(1.0) as u32, size)
        } else {
            (size, (size as f32 * ratio).floor().max(1.0) as u32)
        };
        (nwidth, nheight, height as f32 / nheight as f32)
    }

    /// Anchor centers of one stride in row-major order, each repeated
    /// `num_anchors` times.
    pub fn anchor_centers(stride: u32, size: u32, num_anchors: usize) -> Array2<f32> {
        let cells = (size / stride) as usize;
        Array2::from_shape_fn((cells * cells * num_anchors, 2), |(i, c)| {
            let cell = i / num_anchors;
            let v = if c == 0 { cell % cells } else { cell / cells };
            (v as u32 * stride) as f32
        })
    }

    /// Boxes of one stride scoring at least `threshold`, in frame coordinates.
    ///
    /// `distances` rows are `left, top, right, bottom` in stride units.
    pub fn decode(
        scores: &[f32],
        distances: ArrayView2<f32>,
        anchors: &Array2<f32>,
        stride: u32,
        threshold: f32,
        scale: f32,
        bounds: (u32, u32),
    ) -> Vec<(BoundingBox, f32)> {
        let s = stride as f32;
        let to_frame = |v: f32, max: u32| ((v * scale).max(0.0) as u32).min(max);
        scores
            .iter()
            .zip(distances.axis_iter(Axis(0)))
            .zip(anchors.axis_iter(Axis(0)))
            .filter(|((score, _), _)| **score >= threshold)
            .filter_map(|((score, d), center)| {
                let x1 = to_frame(center[0] - d[0] * s, bounds.0);
                let y1 = to_frame(center[1] - d[1] * s, bounds.1);
                let x2 = to_frame(center[0] + d[2] * s, bounds.0);
                let y2 = to_frame(center[1] + d[3] * s, bounds.1);
                (x2 > x1 && y2 > y1).then(|| (BoundingBox::from_corners(x1, y1, x2, y2), *score))
            })
            .collect()
    }
}

#[cfg(feature = "onnx")]
pub mod onnx {
    //! ONNX Runtime backed models.

    use image::{imageops, imageops::FilterType, Pixel, RgbImage};
    use ndarray::{s, Array, Axis, CowArray, Ix2, IxDyn};
    use ort::{
        environment::Environment, value::Value, ExecutionProvider, GraphOptimizationLevel,
        LoggingLevel, Session, SessionBuilder,
    };
    use std::path::Path;

    use super::{scrfd, suppress, EmotionClassifier, FaceDetector, FaceEmbedder};
    use crate::module::define::label;
    use crate::module::error::VisionError;
    use crate::module::util::conf::Vision;
    use crate::module::vision::{BoundingBox, Embedding, Emotion, Frame};

    /// FER+ output classes, in model order.
    const FERPLUS_LABELS: [&str; 8] = [
        "neutral", "happy", "surprise", "sad", "angry", "disgust", "fear", "contempt",
    ];

    /// get session
    ///
    pub fn get_session(name: &str, model_path: &Path, intra_threads: i16) -> Result<Session, VisionError> {
        if !model_path.is_file() {
            return Err(VisionError::ClassifierUnavailable(format!(
                "model not found: {}",
                model_path.display()
            )));
        }
        let environment = Environment::builder()
            .with_name(name)
            .with_log_level(LoggingLevel::Warning)
            .with_execution_providers([ExecutionProvider::CPU(Default::default())])
            .build()?
            .into_arc();
        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_intra_threads(intra_threads)?
            .with_model_from_file(model_path)?;
        Ok(session)
    }

    /// Run a single-input session and return all of its outputs.
    fn run_all(
        session: &Session,
        input: Array<f32, IxDyn>,
    ) -> Result<Vec<Array<f32, IxDyn>>, VisionError> {
        let array = CowArray::from(input);
        let tensor = vec![Value::from_array(session.allocator(), &array)?];
        let outs = session.run(tensor)?;
        outs.iter()
            .map(|out| -> Result<_, VisionError> { Ok(out.try_extract::<f32>()?.view().to_owned()) })
            .collect()
    }

    /// Run a single-input session and return its first output.
    fn run(session: &Session, input: Array<f32, IxDyn>) -> Result<Array<f32, IxDyn>, VisionError> {
        run_all(session, input)?
            .into_iter()
            .next()
            .ok_or_else(|| VisionError::Inference("model returned no output".into()))
    }

    /// YOLOv8-face detector.
    ///
    /// Output rows are `xc, yc, w, h, score, landmarks...` in model input
    /// coordinates.
    pub struct YoloFace {
        session: Session,
        imgsz: u32,
        threshold: f32,
    }

    impl YoloFace {
        pub fn new(model_path: &Path, conf: &Vision) -> Result<Self, VisionError> {
            Ok(Self {
                session: get_session("face_detector", model_path, conf.intra_threads)?,
                imgsz: 640,
                threshold: conf.detect_threshold,
            })
        }
    }

    impl FaceDetector for YoloFace {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, VisionError> {
            let sz = self.imgsz;
            let img = imageops::resize(&frame.image, sz, sz, FilterType::Nearest);
            let input = Array::from_shape_fn((1, 3, sz as usize, sz as usize), |(_, c, j, i)| {
                let pixel = img.get_pixel(i as u32, j as u32);
                // range [0, 255] -> range [0, 1]
                (pixel.channels()[c] as f32) / 255.0
            })
            .into_dyn();
            let out = run(&self.session, input)?;
            // [1, attrs, anchors] -> [anchors, attrs]
            let out = out
                .slice(s![0, .., ..])
                .into_dimensionality::<Ix2>()
                .map_err(|e| VisionError::Inference(e.to_string()))?
                .t()
                .to_owned();

            let sx = frame.width() as f32 / sz as f32;
            let sy = frame.height() as f32 / sz as f32;
            let mut scored = vec![];
            for row in out.axis_iter(Axis(0)) {
                if row.len() < 5 || row[4] < self.threshold {
                    continue;
                }
                let (xc, yc, w, h) = (row[0] * sx, row[1] * sy, row[2] * sx, row[3] * sy);
                let x1 = (xc - w / 2.0).max(0.0) as u32;
                let y1 = (yc - h / 2.0).max(0.0) as u32;
                let x2 = ((xc + w / 2.0).max(0.0) as u32).min(frame.width());
                let y2 = ((yc + h / 2.0).max(0.0) as u32).min(frame.height());
                if x2 > x1 && y2 > y1 {
                    scored.push((BoundingBox::from_corners(x1, y1, x2, y2), row[4]));
                }
            }
            scored.sort_by(|a, b| b.1.total_cmp(&a.1));
            Ok(suppress(scored, 0.45).into_iter().map(|(bbox, _)| bbox).collect())
        }
    }

    /// SCRFD detector, letterboxed into a 640x640 input.
    pub struct Scrfd {
        session: Session,
        threshold: f32,
    }

    impl Scrfd {
        pub fn new(model_path: &Path, conf: &Vision) -> Result<Self, VisionError> {
            Ok(Self {
                session: get_session("face_detector_scrfd", model_path, conf.intra_threads)?,
                threshold: conf.detect_threshold,
            })
        }
    }

    impl FaceDetector for Scrfd {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, VisionError> {
            let sz = scrfd::INPUT_SIZE;
            let (nwidth, nheight, scale) = scrfd::letterbox(frame.width(), frame.height(), sz);
            let mut img = RgbImage::new(sz, sz);
            let top = imageops::resize(&frame.image, nwidth, nheight, FilterType::Nearest);
            imageops::overlay(&mut img, &top, 0, 0);
            let input = Array::from_shape_fn((1, 3, sz as usize, sz as usize), |(_, c, j, i)| {
                let pixel = img.get_pixel(i as u32, j as u32);
                (pixel.channels()[c] as f32 - 127.5) / 128.0
            })
            .into_dyn();
            let outs = run_all(&self.session, input)?;
            if outs.len() != scrfd::NUM_OUTPUTS {
                return Err(VisionError::Inference(format!(
                    "expected {} outputs, got {}",
                    scrfd::NUM_OUTPUTS,
                    outs.len()
                )));
            }

            let fmc = scrfd::STRIDES.len();
            let bounds = (frame.width(), frame.height());
            let mut scored = vec![];
            for (idx, &stride) in scrfd::STRIDES.iter().enumerate() {
                let anchors = scrfd::anchor_centers(stride, sz, scrfd::NUM_ANCHORS);
                let n = anchors.nrows();
                let scores: Vec<f32> = outs[idx].iter().copied().collect();
                if scores.len() != n {
                    return Err(VisionError::Inference(format!(
                        "stride {}: expected {} scores, got {}",
                        stride,
                        n,
                        scores.len()
                    )));
                }
                let distances = outs[idx + fmc]
                    .view()
                    .into_shape((n, 4))
                    .map_err(|e| VisionError::Inference(e.to_string()))?;
                scored.extend(scrfd::decode(
                    &scores,
                    distances,
                    &anchors,
                    stride,
                    self.threshold,
                    scale,
                    bounds,
                ));
            }
            scored.sort_by(|a, b| b.1.total_cmp(&a.1));
            Ok(suppress(scored, 0.5).into_iter().map(|(bbox, _)| bbox).collect())
        }
    }

    /// ArcFace-style embedder with a 112x112 input.
    pub struct ArcFace {
        session: Session,
    }

    impl ArcFace {
        pub fn new(model_path: &Path, conf: &Vision) -> Result<Self, VisionError> {
            Ok(Self {
                session: get_session("face_embedder", model_path, conf.intra_threads)?,
            })
        }
    }

    impl FaceEmbedder for ArcFace {
        fn embed(&mut self, frame: &Frame, bbox: &BoundingBox) -> Result<Embedding, VisionError> {
            let crop = frame.crop(bbox).ok_or(VisionError::InvalidCrop {
                width: bbox.width,
                height: bbox.height,
            })?;
            let img = imageops::resize(&crop, 112, 112, FilterType::Triangle);
            let input = Array::from_shape_fn((1, 3, 112, 112), |(_, c, j, i)| {
                let pixel = img.get_pixel(i as u32, j as u32);
                // range [0, 255] -> range [-1, 1]
                (pixel.channels()[c] as f32 - 127.5) / 127.5
            })
            .into_dyn();
            let out = run(&self.session, input)?;
            let embedding: Vec<f32> = out.iter().copied().collect();
            let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm == 0.0 {
                return Err(VisionError::Inference("zero embedding".into()));
            }
            Ok(embedding.into_iter().map(|v| v / norm).collect())
        }
    }

    /// FER+ emotion classifier with a 64x64 grayscale input.
    pub struct FerPlus {
        session: Session,
    }

    impl FerPlus {
        pub fn new(model_path: &Path, conf: &Vision) -> Result<Self, VisionError> {
            Ok(Self {
                session: get_session("emotion_classifier", model_path, conf.intra_threads)?,
            })
        }
    }

    impl EmotionClassifier for FerPlus {
        fn classify(&mut self, crop: &RgbImage) -> Result<Emotion, VisionError> {
            let gray = imageops::grayscale(crop);
            let img = imageops::resize(&gray, 64, 64, FilterType::Triangle);
            let input = Array::from_shape_fn((1, 1, 64, 64), |(_, _, j, i)| {
                img.get_pixel(i as u32, j as u32).0[0] as f32
            })
            .into_dyn();
            let out = run(&self.session, input)?;
            let scores: Vec<f32> = out.iter().copied().collect();
            if scores.len() != FERPLUS_LABELS.len() {
                return Err(VisionError::Inference(format!(
                    "expected {} scores, got {}",
                    FERPLUS_LABELS.len(),
                    scores.len()
                )));
            }
            // softmax
            let max = scores.iter().copied().fold(f32::MIN, f32::max);
            let exp: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
            let sum: f32 = exp.iter().sum();
            let (index, prob) = exp
                .iter()
                .map(|e| e / sum)
                .enumerate()
                .reduce(|accum, item| if item.1 > accum.1 { item } else { accum })
                .unwrap_or((0, 0.0));
            let name = FERPLUS_LABELS.get(index).copied().unwrap_or(label::UNKNOWN_EMOTION);
            Ok(Emotion::new(name, prob * 100.0))
        }
    }
}

/// Build the face backend and the emotion classifier from the model directory.
///
/// A missing model disables the matching signal with a warning. Without
/// the `onnx` feature nothing is built.
#[cfg(feature = "onnx")]
pub fn build(
    property: &crate::module::util::init::CarewatchProperty,
) -> (Option<FaceBackend>, Option<Box<dyn EmotionClassifier>>) {
    let conf = &property.conf.vision;
    let model_dir = Path::new(&property.path.dir.model);
    let model = |name: &str| model_dir.join(name);

    let backend = load_detector(model_dir, conf).map(|detector| {
        match onnx::ArcFace::new(&model(&conf.embedder_model), conf) {
            Ok(embedder) if property.conf.identity.enabled => FaceBackend::Recognition {
                detector,
                embedder: Box::new(embedder),
            },
            Ok(_) => FaceBackend::DetectionOnly { detector },
            Err(e) => {
                log::warn!("Face embedder disabled: {}", e);
                FaceBackend::DetectionOnly { detector }
            }
        }
    });

    let classifier: Option<Box<dyn EmotionClassifier>> = if property.conf.emotion.enabled {
        match onnx::FerPlus::new(&model(&conf.emotion_model), conf) {
            Ok(classifier) => Some(Box::new(classifier)),
            Err(e) => {
                log::warn!("Emotion classifier disabled: {}", e);
                None
            }
        }
    } else {
        None
    };
    (backend, classifier)
}

/// First detector model that loads, falling back from YOLO to SCRFD.
#[cfg(feature = "onnx")]
fn load_detector(model_dir: &Path, conf: &Vision) -> Option<Box<dyn FaceDetector>> {
    for (kind, path) in detector_candidates(model_dir, conf) {
        let loaded: Result<Box<dyn FaceDetector>, VisionError> = match kind {
            DetectorKind::Yolo => {
                onnx::YoloFace::new(&path, conf).map(|d| Box::new(d) as Box<dyn FaceDetector>)
            }
            DetectorKind::Scrfd => {
                onnx::Scrfd::new(&path, conf).map(|d| Box::new(d) as Box<dyn FaceDetector>)
            }
        };
        match loaded {
            Ok(detector) => {
                log::info!("Face detector {:?} loaded from {}", kind, path.display());
                return Some(detector);
            }
            Err(e) => log::warn!("Failed to load {}: {}", path.display(), e),
        }
    }
    log::warn!("Face detector disabled: no usable model in {}", model_dir.display());
    None
}

/// Build the face backend and the emotion classifier from the model directory.
#[cfg(not(feature = "onnx"))]
pub fn build(
    _property: &crate::module::util::init::CarewatchProperty,
) -> (Option<FaceBackend>, Option<Box<dyn EmotionClassifier>>) {
    log::warn!("Built without the onnx feature. Face and emotion signals are disabled.");
    (None, None)
}
