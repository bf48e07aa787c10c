//! Stateful signals built on top of per-frame vision results.

pub mod emotion; // Throttled emotion labels per face slot
pub mod fall; // Fall debouncing
pub mod identity; // Known identities and matching
pub mod tracker; // Slot assignment across ticks
