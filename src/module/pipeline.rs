//! Provide Loop for Detection.
//!
//! One tick turns one frame into a [`DetectionSnapshot`] plus the events it
//! raised. The loop runs on its own thread and drains commands between ticks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::thread;
use std::time::{Duration, Instant};

use crate::module::com::{
    DetectionEvent, DetectionSink, EventType, HttpSink, LogSink, PipelineCommand,
};
use crate::module::define::label;
use crate::module::error::{CaptureError, PipelineError, VisionError};
use crate::module::monitor::emotion::{EmotionCache, Moment, Outcome, SlotKey};
use crate::module::monitor::fall::{FallStateMachine, FallStatus};
use crate::module::monitor::identity::{IdentityStore, JsonFileStorage};
use crate::module::monitor::tracker::{SlotTracker, SlotTracking};
use crate::module::util::init::CarewatchProperty;
use crate::module::util::path;
use crate::module::vision::camera::{self, FrameSource};
use crate::module::vision::detector::{self, sort, EmotionClassifier, FaceBackend};
use crate::module::vision::motion::{FrameDifferencer, MotionReport};
use crate::module::vision::{BoundingBox, Frame};

/// One face of a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceObservation {
    pub slot: SlotKey,
    pub bbox: BoundingBox,
    pub identity: String,
    /// `None` while emotion classification is off.
    pub emotion: Option<String>,
    pub confidence: Option<f32>,
}

/// Everything observed in one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSnapshot {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub motion: MotionReport,
    pub faces: Vec<FaceObservation>,
    pub fall: FallStatus,
    /// Consecutive elongated ticks of the largest face.
    pub fall_frames: u32,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A stop command was received.
    Stopped,
    /// The source ran dry or kept failing.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub capture_failures: u64,
    pub reason: StopReason,
}

/// Counters for the periodic statistics line.
struct Stats {
    window_start: Instant,
    window_ticks: u64,
    faces: usize,
    motion_ticks: u64,
}

impl Stats {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_ticks: 0,
            faces: 0,
            motion_ticks: 0,
        }
    }
}

pub struct DetectionPipeline {
    motion: FrameDifferencer,
    fall: FallStateMachine,
    emotions: EmotionCache,
    tracker: Option<SlotTracker>,
    backend: Option<FaceBackend>,
    classifier: Option<Box<dyn EmotionClassifier>>,
    identities: Arc<IdentityStore>,
    identity_enabled: bool,
    sink: Box<dyn DetectionSink>,
    img_dir: String,
    pacing: Duration,
    stats_interval: u64,
    max_capture_failures: u32,
    tick: u64,
    was_motion: bool,
    stats: Stats,
}

impl DetectionPipeline {
    /// Pipeline without face signals. Add them with [`Self::with_backend`]
    /// and [`Self::with_classifier`].
    pub fn new(
        property: &CarewatchProperty,
        identities: Arc<IdentityStore>,
        sink: Box<dyn DetectionSink>,
    ) -> Self {
        let conf = &property.conf;
        let tracker = match SlotTracking::from_conf(&conf.emotion) {
            SlotTracking::Iou(threshold) => Some(SlotTracker::new(threshold)),
            SlotTracking::Index => None,
        };
        Self {
            motion: FrameDifferencer::new(conf.motion.clone()),
            fall: FallStateMachine::new(&conf.fall),
            emotions: EmotionCache::from_conf(&conf.emotion),
            tracker,
            backend: None,
            classifier: None,
            identities,
            identity_enabled: conf.identity.enabled,
            sink,
            img_dir: property.path.dir.img.clone(),
            pacing: Duration::from_millis(conf.pipeline.pacing_ms),
            stats_interval: conf.pipeline.stats_interval,
            max_capture_failures: conf.pipeline.max_capture_failures.max(1),
            tick: 0,
            was_motion: false,
            stats: Stats::new(),
        }
    }

    pub fn with_backend(mut self, backend: Option<FaceBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_classifier(mut self, classifier: Option<Box<dyn EmotionClassifier>>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Process one frame and hand the result to the sink.
    ///
    /// `pending` holds the commands that act on this frame.
    pub fn tick(&mut self, frame: &Frame, pending: Vec<PipelineCommand>) -> DetectionSnapshot {
        self.tick += 1;
        let now = Moment::now(self.tick);

        let motion = self.motion.update(frame).unwrap_or_else(|e| {
            log::warn!("Motion detection skipped: {}", e);
            MotionReport::default()
        });

        let faces = match self.backend.as_mut().map(|backend| backend.detect(frame)) {
            Some(Ok(faces)) => faces,
            Some(Err(VisionError::ClassifierUnavailable(e))) => {
                log::warn!("Face detection disabled for the rest of the run: {}", e);
                self.backend = None;
                vec![]
            }
            Some(Err(e)) => {
                log::debug!("Face detection failed: {}", e);
                vec![]
            }
            None => vec![],
        };
        let largest = sort::largest(&faces);
        let fall = self.fall.update(largest.map(|i| &faces[i]));

        let slots: Vec<SlotKey> = match self.tracker.as_mut() {
            Some(tracker) => tracker.assign(&faces),
            None => (0..faces.len() as SlotKey).collect(),
        };
        let observations = self.observe(frame, &faces, &slots, now);
        if self.tracker.is_some() {
            self.emotions.retain(&slots);
        }

        let mut events = vec![];
        if motion.detected && !self.was_motion {
            events.push(DetectionEvent::new(EventType::MotionStarted, frame.timestamp));
        }
        self.was_motion = motion.detected;
        if fall == FallStatus::Confirmed {
            let mut event = DetectionEvent::new(EventType::FallConfirmed, frame.timestamp);
            if let Some(face) = largest.map(|i| &observations[i]) {
                event = event.with_face(
                    &face.identity,
                    face.emotion.as_deref().zip(face.confidence),
                );
            }
            events.push(event);
        }

        let mut frame_path = None;
        for command in pending {
            match command {
                PipelineCommand::SaveSnapshot => frame_path = self.save_frame(frame),
                PipelineCommand::Enroll(name) => {
                    if let Some(event) = self.enroll_largest(frame, &faces, largest, &name) {
                        events.push(event);
                    }
                }
                PipelineCommand::Stop => (),
            }
        }
        for mut event in events {
            event.frame_path = frame_path.clone();
            self.sink.on_event(&event);
        }

        let snapshot = DetectionSnapshot {
            tick: self.tick,
            timestamp: frame.timestamp,
            motion,
            faces: observations,
            fall,
            fall_frames: self.fall.state().consecutive_frames,
        };
        self.sink.on_snapshot(&snapshot);
        self.log_stats(&snapshot);
        snapshot
    }

    /// Pull frames from `source` until it is exhausted or a stop command
    /// arrives, then release it.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        commands: &Receiver<PipelineCommand>,
    ) -> RunSummary {
        let mut pending = vec![];
        let mut ticks = 0;
        let mut capture_failures = 0;
        let mut consecutive_failures = 0;
        log::info!("Detection Loop Started");
        let reason = loop {
            let mut stop = false;
            for command in commands.try_iter() {
                match command {
                    PipelineCommand::Stop => stop = true,
                    command => pending.push(command),
                }
            }
            if stop {
                break StopReason::Stopped;
            }

            match source.capture() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    self.tick(&frame, std::mem::take(&mut pending));
                    ticks += 1;
                }
                Err(CaptureError::Exhausted) => {
                    log::info!("Frame source exhausted.");
                    break StopReason::Exhausted;
                }
                Err(e) => {
                    capture_failures += 1;
                    consecutive_failures += 1;
                    log::warn!("Capture failed ({}): {}", consecutive_failures, e);
                    if consecutive_failures >= self.max_capture_failures {
                        log::error!("Too many consecutive capture failures. Giving up.");
                        break StopReason::Exhausted;
                    }
                }
            }

            if !self.pacing.is_zero() {
                thread::sleep(self.pacing);
            }
        };
        source.release();

        if self.identities.is_dirty() {
            if let Err(e) = self.identities.persist() {
                log::warn!("Known faces are not saved: {}", e);
            }
        }
        log::info!("Detection Loop Exit: {:?} after {} ticks", reason, ticks);
        RunSummary {
            ticks,
            capture_failures,
            reason,
        }
    }

    fn observe(
        &mut self,
        frame: &Frame,
        faces: &[BoundingBox],
        slots: &[SlotKey],
        now: Moment,
    ) -> Vec<FaceObservation> {
        let match_identity = self.identity_enabled
            && self.backend.as_ref().map_or(false, FaceBackend::supports_identity)
            && !self.identities.is_empty();
        let mut embedder_lost = false;
        let mut classifier_lost = false;

        let mut observations = Vec::with_capacity(faces.len());
        for (bbox, slot) in faces.iter().zip(slots.iter().copied()) {
            let mut identity = label::UNKNOWN_IDENTITY.to_string();
            if match_identity && !embedder_lost {
                match self.backend.as_mut().and_then(|b| b.embed(frame, bbox)) {
                    Some(Ok(embedding)) => identity = self.identities.match_embedding(&embedding),
                    Some(Err(VisionError::ClassifierUnavailable(e))) => {
                        log::warn!("Face embedder lost: {}", e);
                        embedder_lost = true;
                    }
                    Some(Err(e)) => log::debug!("Face embedding failed: {}", e),
                    None => (),
                }
            }

            let (emotion, confidence) = match self.classifier.as_mut() {
                Some(classifier) => {
                    let crop = frame.crop(bbox);
                    let (emotion, outcome) = self.emotions.get_or_refresh(
                        slot,
                        crop.as_ref(),
                        |crop| classifier.classify(crop),
                        now,
                    );
                    classifier_lost |= outcome == Outcome::Unavailable;
                    (Some(emotion.label), Some(emotion.confidence))
                }
                None => (None, None),
            };

            observations.push(FaceObservation {
                slot,
                bbox: *bbox,
                identity,
                emotion,
                confidence,
            });
        }

        if embedder_lost {
            self.drop_embedder();
        }
        if classifier_lost {
            log::warn!("Emotion classification disabled for the rest of the run.");
            self.classifier = None;
        }
        observations
    }

    /// Keep detecting faces without identifying them.
    fn drop_embedder(&mut self) {
        log::warn!("Face identification disabled for the rest of the run.");
        self.backend = self.backend.take().map(FaceBackend::into_detection_only);
    }

    /// Write the frame as a timestamped JPEG in the image directory.
    fn save_frame(&self, frame: &Frame) -> Option<String> {
        let name = frame
            .timestamp
            .format("detection_%Y%m%d_%H%M%S.jpg")
            .to_string();
        let file = path::join(&[&self.img_dir, &name]);
        match frame.image.save(&file) {
            Ok(()) => {
                log::info!("Snapshot saved: {}", file);
                Some(file)
            }
            Err(e) => {
                log::warn!("Failed to save snapshot {}: {}", file, e);
                None
            }
        }
    }

    fn enroll_largest(
        &mut self,
        frame: &Frame,
        faces: &[BoundingBox],
        largest: Option<usize>,
        name: &str,
    ) -> Option<DetectionEvent> {
        let backend = match self.backend.as_mut() {
            Some(backend) if backend.supports_identity() => backend,
            _ => {
                log::warn!("Cannot enroll {}: face recognition is unavailable.", name);
                return None;
            }
        };
        let Some(bbox) = largest.map(|i| &faces[i]) else {
            log::warn!("Cannot enroll {}: no face in frame.", name);
            return None;
        };
        let embedding = match backend.embed(frame, bbox)? {
            Ok(embedding) => embedding,
            Err(VisionError::ClassifierUnavailable(e)) => {
                log::warn!("Cannot enroll {}: face embedder lost: {}", name, e);
                self.drop_embedder();
                return None;
            }
            Err(e) => {
                log::warn!("Cannot enroll {}: {}", name, e);
                return None;
            }
        };
        // A failed save keeps the enrollment in memory.
        match self.identities.enroll(name, embedding) {
            Ok(enrollment) => log::info!(
                "Enrolled {} ({}), {} known faces",
                enrollment.name,
                if enrollment.replaced { "updated" } else { "new" },
                enrollment.total
            ),
            Err(e) => log::warn!("Enrolled {} but could not save known faces: {}", name, e),
        }
        Some(DetectionEvent::new(EventType::IdentityEnrolled, frame.timestamp).with_face(name, None))
    }

    fn log_stats(&mut self, snapshot: &DetectionSnapshot) {
        if self.stats_interval == 0 {
            return;
        }
        self.stats.window_ticks += 1;
        self.stats.faces += snapshot.faces.len();
        self.stats.motion_ticks += snapshot.motion.detected as u64;
        if self.stats.window_ticks < self.stats_interval {
            return;
        }
        let elapsed = self.stats.window_start.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            self.stats.window_ticks as f64 / elapsed
        } else {
            0.0
        };
        log::info!(
            "Tick {}: {:.1} fps, {:.1} faces/tick, motion {}/{}, fall {:?} ({} frames), {} known faces",
            snapshot.tick,
            fps,
            self.stats.faces as f64 / self.stats.window_ticks as f64,
            self.stats.motion_ticks,
            self.stats.window_ticks,
            snapshot.fall,
            snapshot.fall_frames,
            self.identities.len()
        );
        self.stats = Stats::new();
    }
}

/// Start detection thread
///
/// Collaborators are built on the new thread; startup errors end it.
pub fn run(
    property: CarewatchProperty,
    commands: Receiver<PipelineCommand>,
) -> JoinHandle<Result<RunSummary, PipelineError>> {
    thread::spawn(move || {
        let storage = JsonFileStorage::new(&property.path.file.identities);
        let identities = Arc::new(IdentityStore::open(
            Box::new(storage),
            property.conf.identity.tolerance,
        )?);

        let mut sinks: Vec<Box<dyn DetectionSink>> = vec![Box::new(LogSink)];
        if let Some(http) = HttpSink::from_conf(&property.conf.notification) {
            sinks.push(Box::new(http));
        }

        let (backend, classifier) = detector::build(&property);
        let mut source = camera::open(&property)?;
        let mut pipeline = DetectionPipeline::new(&property, identities, Box::new(sinks))
            .with_backend(backend)
            .with_classifier(classifier);

        let started = Instant::now();
        let summary = pipeline.run(source.as_mut(), &commands);
        log::info!(
            "Processed {} frames in {:.1}s",
            summary.ticks,
            started.elapsed().as_secs_f64()
        );
        Ok(summary)
    })
}
