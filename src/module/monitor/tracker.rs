//! Slot assignment across ticks.
//!
//! By default a face's slot is its index in the detector output, which moves
//! when the detection order changes. `SlotTracker` instead carries a slot over
//! to the box of the next tick that overlaps it most.

use super::emotion::SlotKey;
use crate::module::vision::BoundingBox;

/// How face slots are keyed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotTracking {
    /// Position in the current detection list.
    Index,
    /// Greedy IoU matching against the previous tick.
    Iou(f32),
}

impl SlotTracking {
    pub fn from_conf(conf: &crate::module::util::conf::Emotion) -> Self {
        match conf.slot_tracking.as_str() {
            "iou" => Self::Iou(conf.iou_threshold),
            "index" => Self::Index,
            other => {
                log::warn!("Unknown slot tracking '{}'. Using index.", other);
                Self::Index
            }
        }
    }
}

pub struct SlotTracker {
    iou_threshold: f32,
    next_slot: SlotKey,
    tracks: Vec<(SlotKey, BoundingBox)>,
}

impl SlotTracker {
    pub fn new(iou_threshold: f32) -> Self {
        Self {
            iou_threshold,
            next_slot: 0,
            tracks: vec![],
        }
    }

    /// Slot of every face, in the order of `faces`.
    ///
    /// Tracks without a face this tick are dropped.
    pub fn assign(&mut self, faces: &[BoundingBox]) -> Vec<SlotKey> {
        let mut pairs = vec![];
        for (i, face) in faces.iter().enumerate() {
            for (j, (_, track)) in self.tracks.iter().enumerate() {
                let iou = face.iou(track);
                if iou >= self.iou_threshold && iou > 0.0 {
                    pairs.push((iou, i, j));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut slots: Vec<Option<SlotKey>> = vec![None; faces.len()];
        let mut used = vec![false; self.tracks.len()];
        for (_, i, j) in pairs {
            if slots[i].is_none() && !used[j] {
                slots[i] = Some(self.tracks[j].0);
                used[j] = true;
            }
        }

        let slots: Vec<SlotKey> = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    let slot = self.next_slot;
                    self.next_slot += 1;
                    slot
                })
            })
            .collect();
        self.tracks = slots.iter().copied().zip(faces.iter().copied()).collect();
        slots
    }
}
