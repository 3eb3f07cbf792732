//! Color detection over the centered region of decoded frames.
//!
//! Each sampled frame is reduced to one mean color, which the engine compares
//! against its reference color(s) with a per-channel tolerance. Transition
//! mode fires on the from→to edge only; presence mode fires on every match.

mod color;
mod engine;
mod result;

pub use color::{center_mean, region_mean, Region};
pub use engine::{
    DetectionEngine, DetectionMode, DetectionState, DetectorConfig, DEFAULT_DETECTION_SIZE,
    DEFAULT_FROM_COLOR, DEFAULT_TARGET_COLOR, DEFAULT_TOLERANCE, DEFAULT_TO_COLOR,
    MAX_DETECTION_SIZE,
};
pub use result::{Classification, DetectionOutcome};
