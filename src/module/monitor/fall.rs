//! Fall detection from the shape of the tracked subject's bounding box.
//!
//! A box much wider than tall stands in for a prone body. The condition must
//! hold for a number of consecutive ticks before a fall is confirmed, and the
//! confirmation fires once per continuous fall.

use serde::Serialize;

use crate::module::util::conf::Fall;
use crate::module::vision::BoundingBox;

/// Fall signal for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallStatus {
    /// Upright, absent, or not elongated long enough yet.
    Normal,
    /// A confirmed fall is still in progress.
    Possible,
    /// The tick on which the fall was confirmed.
    Confirmed,
}

/// Debounce counters of one subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallState {
    pub consecutive_frames: u32,
    pub active: bool,
}

pub struct FallStateMachine {
    ratio_threshold: f32,
    frames_threshold: u32,
    state: FallState,
}

impl FallStateMachine {
    pub fn new(conf: &Fall) -> Self {
        Self {
            ratio_threshold: conf.ratio_threshold,
            frames_threshold: conf.frames_threshold,
            state: FallState::default(),
        }
    }

    pub fn state(&self) -> FallState {
        self.state
    }

    /// Feed the subject's box for this tick, `None` when nobody is visible.
    pub fn update(&mut self, bbox: Option<&BoundingBox>) -> FallStatus {
        let Some(bbox) = bbox else {
            self.state = FallState::default();
            return FallStatus::Normal;
        };

        if bbox.aspect_ratio() <= self.ratio_threshold {
            if self.state.active {
                log::info!("Posture back to normal after fall.");
            }
            self.state = FallState::default();
            return FallStatus::Normal;
        }

        self.state.consecutive_frames = self.state.consecutive_frames.saturating_add(1);
        if self.state.active {
            return FallStatus::Possible;
        }
        if self.state.consecutive_frames >= self.frames_threshold {
            self.state.active = true;
            log::warn!(
                "Fall confirmed after {} frames.",
                self.state.consecutive_frames
            );
            return FallStatus::Confirmed;
        }
        FallStatus::Normal
    }
}
