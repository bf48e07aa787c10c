//! This module contains all the sub-modules of the project.

pub mod com; // Communication module: Commands in, detection events out.
pub mod define; // Definition module: Contains definitions and constants used throughout the project.
pub mod error; // Error module: Error types of every concern.
pub mod monitor; // Monitor module: Fall, emotion and identity state across ticks.
pub mod pipeline; // Pipeline module: Handles the detection thread.
pub mod util; // Utility module: Provides various utility functions and helpers.
pub mod vision; // Vision module: Handles frame capture, motion and face detection.
