//! Throttled emotion labels per face slot.
//!
//! Classification is expensive, so a slot is only re-classified when it has
//! no entry yet or when the refresh policy says its entry is due.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use image::RgbImage;

use crate::module::define::label;
use crate::module::error::VisionError;
use crate::module::util::conf;
use crate::module::vision::Emotion;

/// Key of a face within the current tick.
pub type SlotKey = u64;

/// Point in the run, counted in ticks and in wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moment {
    pub tick: u64,
    pub at: Instant,
}

impl Moment {
    pub fn now(tick: u64) -> Self {
        Self {
            tick,
            at: Instant::now(),
        }
    }
}

/// When a cached label is due for a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// After this many ticks since the slot's last refresh.
    EveryTicks(u64),
    /// After this much time since the slot's last refresh.
    MinInterval(Duration),
}

impl RefreshPolicy {
    pub fn from_conf(conf: &conf::Emotion) -> Self {
        match conf.policy.as_str() {
            "interval" => Self::MinInterval(Duration::from_millis(conf.min_interval_ms)),
            "ticks" => Self::EveryTicks(conf.refresh_ticks.max(1)),
            other => {
                log::warn!("Unknown emotion refresh policy '{}'. Using ticks.", other);
                Self::EveryTicks(conf.refresh_ticks.max(1))
            }
        }
    }

    fn is_due(&self, last: &Moment, now: &Moment) -> bool {
        match self {
            Self::EveryTicks(n) => now.tick.saturating_sub(last.tick) >= *n,
            Self::MinInterval(interval) => now.at.saturating_duration_since(last.at) >= *interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmotionCacheEntry {
    pub emotion: Emotion,
    /// Last time the classifier ran on this slot, successful or not.
    pub last_updated: Moment,
    /// The last attempt had no usable crop. Due again on the next lookup.
    pub retry: bool,
}

/// What a lookup did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Served from the cache without classifying.
    Cached,
    /// The classifier produced a new label.
    Refreshed,
    /// The crop was missing or too small to classify.
    InvalidCrop,
    /// The classifier failed on this crop.
    Failed,
    /// The classifier is gone for good.
    Unavailable,
}

pub struct EmotionCache {
    policy: RefreshPolicy,
    min_crop: u32,
    entries: HashMap<SlotKey, EmotionCacheEntry>,
}

impl EmotionCache {
    pub fn new(policy: RefreshPolicy, min_crop: u32) -> Self {
        Self {
            policy,
            min_crop,
            entries: HashMap::new(),
        }
    }

    pub fn from_conf(conf: &conf::Emotion) -> Self {
        Self::new(RefreshPolicy::from_conf(conf), conf.min_crop)
    }

    pub fn get(&self, slot: SlotKey) -> Option<&EmotionCacheEntry> {
        self.entries.get(&slot)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the label of `slot`, classifying `crop` first if the slot is due.
    ///
    /// Failures never propagate: an existing label is kept, otherwise a
    /// sentinel label with confidence 0 is stored.
    pub fn get_or_refresh<F>(
        &mut self,
        slot: SlotKey,
        crop: Option<&RgbImage>,
        classify: F,
        now: Moment,
    ) -> (Emotion, Outcome)
    where
        F: FnOnce(&RgbImage) -> Result<Emotion, VisionError>,
    {
        if let Some(entry) = self.entries.get(&slot) {
            if !entry.retry && !self.policy.is_due(&entry.last_updated, &now) {
                return (entry.emotion.clone(), Outcome::Cached);
            }
        }

        let (fresh, outcome) = match crop {
            Some(crop) if crop.width() >= self.min_crop && crop.height() >= self.min_crop => {
                match classify(crop) {
                    Ok(emotion) => (Some(emotion), Outcome::Refreshed),
                    Err(VisionError::ClassifierUnavailable(msg)) => {
                        log::error!("Emotion classifier unavailable: {}", msg);
                        (None, Outcome::Unavailable)
                    }
                    Err(e) => {
                        log::debug!("Emotion classification failed for slot {}: {}", slot, e);
                        (None, Outcome::Failed)
                    }
                }
            }
            _ => (None, Outcome::InvalidCrop),
        };

        let entry = match fresh {
            Some(emotion) => {
                let entry = EmotionCacheEntry {
                    emotion,
                    last_updated: now,
                    retry: false,
                };
                self.entries.insert(slot, entry.clone());
                entry
            }
            None => {
                let sentinel = match outcome {
                    Outcome::Failed => label::ERROR_EMOTION,
                    _ => label::UNKNOWN_EMOTION,
                };
                // A skipped crop leaves the refresh time alone.
                let retry = outcome == Outcome::InvalidCrop;
                let entry = self
                    .entries
                    .entry(slot)
                    .and_modify(|e| {
                        if !retry {
                            e.last_updated = now;
                        }
                        e.retry = retry;
                    })
                    .or_insert_with(|| EmotionCacheEntry {
                        emotion: Emotion::new(sentinel, 0.0),
                        last_updated: now,
                        retry,
                    });
                entry.clone()
            }
        };
        (entry.emotion, outcome)
    }

    /// Drop every slot not in `slots`.
    pub fn retain(&mut self, slots: &[SlotKey]) {
        self.entries.retain(|slot, _| slots.contains(slot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn crop(side: u32) -> RgbImage {
        RgbImage::new(side, side)
    }

    fn happy(calls: &Cell<u32>) -> impl FnOnce(&RgbImage) -> Result<Emotion, VisionError> + '_ {
        move |_| {
            calls.set(calls.get() + 1);
            Ok(Emotion::new("happy", 87.5))
        }
    }

    #[test]
    fn cached_within_tick_window() {
        let calls = Cell::new(0);
        let mut cache = EmotionCache::new(RefreshPolicy::EveryTicks(10), 30);
        let start = Instant::now();
        let at = |tick| Moment { tick, at: start };

        let (first, outcome) = cache.get_or_refresh(0, Some(&crop(64)), happy(&calls), at(1));
        assert_eq!(outcome, Outcome::Refreshed);
        let (second, outcome) = cache.get_or_refresh(0, Some(&crop(64)), happy(&calls), at(5));
        assert_eq!(outcome, Outcome::Cached);
        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);

        let (_, outcome) = cache.get_or_refresh(0, Some(&crop(64)), happy(&calls), at(11));
        assert_eq!(outcome, Outcome::Refreshed);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn cached_within_interval() {
        let calls = Cell::new(0);
        let mut cache =
            EmotionCache::new(RefreshPolicy::MinInterval(Duration::from_secs(2)), 30);
        let start = Instant::now();

        let first = Moment { tick: 1, at: start };
        cache.get_or_refresh(3, Some(&crop(64)), happy(&calls), first);
        let soon = Moment {
            tick: 50,
            at: start + Duration::from_millis(1500),
        };
        assert_eq!(
            cache.get_or_refresh(3, Some(&crop(64)), happy(&calls), soon).1,
            Outcome::Cached
        );
        let later = Moment {
            tick: 51,
            at: start + Duration::from_secs(2),
        };
        assert_eq!(
            cache.get_or_refresh(3, Some(&crop(64)), happy(&calls), later).1,
            Outcome::Refreshed
        );
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn small_crop_stores_sentinel_without_classifying() {
        let calls = Cell::new(0);
        let mut cache = EmotionCache::new(RefreshPolicy::EveryTicks(10), 30);
        let (emotion, outcome) =
            cache.get_or_refresh(0, Some(&crop(12)), happy(&calls), Moment::now(1));
        assert_eq!(outcome, Outcome::InvalidCrop);
        assert_eq!(emotion, Emotion::new("unknown", 0.0));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn small_crop_does_not_delay_next_refresh() {
        let calls = Cell::new(0);
        let mut cache = EmotionCache::new(RefreshPolicy::EveryTicks(10), 30);
        let start = Instant::now();
        let at = |tick| Moment { tick, at: start };

        cache.get_or_refresh(0, Some(&crop(12)), happy(&calls), at(1));
        let (emotion, outcome) = cache.get_or_refresh(0, Some(&crop(64)), happy(&calls), at(2));
        assert_eq!(outcome, Outcome::Refreshed);
        assert_eq!(emotion.label, "happy");
        assert_eq!(calls.get(), 1);

        // A label that is not due survives a small crop and its refresh tick
        // is kept.
        let (_, outcome) = cache.get_or_refresh(0, Some(&crop(12)), happy(&calls), at(3));
        assert_eq!(outcome, Outcome::Cached);
        let (emotion, outcome) = cache.get_or_refresh(0, None, happy(&calls), at(12));
        assert_eq!(outcome, Outcome::InvalidCrop);
        assert_eq!(emotion.label, "happy");
        assert_eq!(cache.get(0).unwrap().last_updated.tick, 2);
        let (_, outcome) = cache.get_or_refresh(0, Some(&crop(64)), happy(&calls), at(13));
        assert_eq!(outcome, Outcome::Refreshed);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn failure_keeps_previous_label() {
        let calls = Cell::new(0);
        let mut cache = EmotionCache::new(RefreshPolicy::EveryTicks(1), 30);
        let start = Instant::now();
        cache.get_or_refresh(0, Some(&crop(64)), happy(&calls), Moment { tick: 1, at: start });

        let (emotion, outcome) = cache.get_or_refresh(
            0,
            Some(&crop(64)),
            |_| Err(VisionError::Inference("bad tensor".into())),
            Moment { tick: 2, at: start },
        );
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(emotion, Emotion::new("happy", 87.5));
        assert_eq!(cache.get(0).unwrap().last_updated.tick, 2);

        let (emotion, _) = cache.get_or_refresh(0, None, happy(&calls), Moment { tick: 3, at: start });
        assert_eq!(emotion.label, "happy");
    }

    #[test]
    fn failure_without_previous_label_is_error_sentinel() {
        let mut cache = EmotionCache::new(RefreshPolicy::EveryTicks(10), 30);
        let (emotion, outcome) = cache.get_or_refresh(
            4,
            Some(&crop(64)),
            |_| Err(VisionError::Inference("bad tensor".into())),
            Moment::now(1),
        );
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(emotion, Emotion::new("error", 0.0));

        let (emotion, outcome) = cache.get_or_refresh(
            5,
            Some(&crop(64)),
            |_| Err(VisionError::ClassifierUnavailable("model missing".into())),
            Moment::now(1),
        );
        assert_eq!(outcome, Outcome::Unavailable);
        assert_eq!(emotion, Emotion::new("unknown", 0.0));
    }

    #[test]
    fn slots_are_independent_and_retained() {
        let calls = Cell::new(0);
        let mut cache = EmotionCache::new(RefreshPolicy::EveryTicks(10), 30);
        let now = Moment::now(1);
        cache.get_or_refresh(0, Some(&crop(64)), happy(&calls), now);
        cache.get_or_refresh(1, Some(&crop(64)), happy(&calls), now);
        assert_eq!(calls.get(), 2);
        assert_eq!(cache.len(), 2);
        cache.retain(&[1]);
        assert!(cache.get(0).is_none());
        assert!(cache.get(1).is_some());
    }

    #[test]
    fn policy_from_conf() {
        let mut conf = crate::module::util::conf::Config::default().emotion;
        assert_eq!(RefreshPolicy::from_conf(&conf), RefreshPolicy::EveryTicks(10));
        conf.policy = "interval".into();
        assert_eq!(
            RefreshPolicy::from_conf(&conf),
            RefreshPolicy::MinInterval(Duration::from_millis(2000))
        );
    }
}
