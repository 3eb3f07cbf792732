use anyhow::{anyhow, Result};

use crate::frame::{DecodedFrame, Rgb};

use super::color::center_mean;
use super::result::{Classification, DetectionOutcome};

pub const DEFAULT_TOLERANCE: u8 = 30;
pub const DEFAULT_DETECTION_SIZE: u32 = 10;
pub const MAX_DETECTION_SIZE: u32 = 1000;

pub const DEFAULT_FROM_COLOR: Rgb = Rgb::new(206, 38, 54);
pub const DEFAULT_TO_COLOR: Rgb = Rgb::new(75, 219, 106);
pub const DEFAULT_TARGET_COLOR: Rgb = Rgb::new(206, 38, 54);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionMode {
    /// Fire on the edge from `from` to `to`.
    Transition { from: Rgb, to: Rgb },
    /// Fire on every frame whose mean matches `target`.
    Presence { target: Rgb },
}

impl DetectionMode {
    pub fn name(&self) -> &'static str {
        match self {
            DetectionMode::Transition { .. } => "transition",
            DetectionMode::Presence { .. } => "presence",
        }
    }

    fn initial_state(&self) -> DetectionState {
        match self {
            DetectionMode::Transition { .. } => DetectionState::Idle,
            DetectionMode::Presence { .. } => DetectionState::Absent,
        }
    }
}

impl Default for DetectionMode {
    fn default() -> Self {
        DetectionMode::Transition {
            from: DEFAULT_FROM_COLOR,
            to: DEFAULT_TO_COLOR,
        }
    }
}

/// Classification retained from the previous frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionState {
    Idle,
    MatchedFrom,
    MatchedTo,
    Absent,
    Present,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectorConfig {
    pub mode: DetectionMode,
    /// Maximum per-channel absolute difference for a match.
    pub tolerance: u8,
    /// Side of the centered sampling square, in pixels.
    pub detection_size: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::default(),
            tolerance: DEFAULT_TOLERANCE,
            detection_size: DEFAULT_DETECTION_SIZE,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_DETECTION_SIZE).contains(&self.detection_size) {
            return Err(anyhow!(
                "detection_size must be between 1 and {} (got {})",
                MAX_DETECTION_SIZE,
                self.detection_size
            ));
        }
        Ok(())
    }
}

/// Color-sampling state machine.
///
/// Starts disabled. A disabled engine samples nothing and never triggers.
pub struct DetectionEngine {
    config: DetectorConfig,
    state: DetectionState,
    enabled: bool,
}

impl DetectionEngine {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: config.mode.initial_state(),
            config,
            enabled: false,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Replace the whole configuration. Invalid input keeps the current one.
    /// A mode change resets the retained state.
    pub fn set_config(&mut self, config: DetectorConfig) -> Result<()> {
        config.validate()?;
        let mode_changed = config.mode != self.config.mode;
        self.config = config;
        if mode_changed {
            self.state = self.config.mode.initial_state();
        }
        Ok(())
    }

    pub fn set_mode(&mut self, mode: DetectionMode) {
        self.config.mode = mode;
        self.state = mode.initial_state();
        log::info!("detection mode set to {}", mode.name());
    }

    /// Forget the previous classification without touching `enabled`.
    pub fn clear_state(&mut self) {
        self.state = self.config.mode.initial_state();
    }

    /// Clear the retained state and disable.
    pub fn reset(&mut self) {
        self.clear_state();
        self.enabled = false;
        log::debug!("detector reset");
    }

    pub fn sample(&mut self, frame: &DecodedFrame) -> DetectionOutcome {
        if !self.enabled {
            return DetectionOutcome::default();
        }
        let Some(mean) = center_mean(frame, self.config.detection_size) else {
            return DetectionOutcome::default();
        };
        self.classify(mean)
    }

    /// Advance the state machine with an already-sampled mean color.
    pub fn classify(&mut self, mean: Rgb) -> DetectionOutcome {
        if !self.enabled {
            return DetectionOutcome::default();
        }
        let tolerance = self.config.tolerance;

        match self.config.mode {
            DetectionMode::Transition { from, to } => {
                let is_from = mean.matches(from, tolerance);
                let is_to = mean.matches(to, tolerance);
                let (classification, next) = if is_from {
                    (Classification::From, DetectionState::MatchedFrom)
                } else if is_to {
                    (Classification::To, DetectionState::MatchedTo)
                } else {
                    (Classification::Neither, DetectionState::Idle)
                };

                let triggered =
                    self.state == DetectionState::MatchedFrom && next == DetectionState::MatchedTo;
                if triggered {
                    log::debug!("color transition {} -> {} (mean {})", from, to, mean);
                }
                self.state = next;

                DetectionOutcome {
                    triggered,
                    color_present: is_to,
                    classification,
                    mean: Some(mean),
                }
            }
            DetectionMode::Presence { target } => {
                let present = mean.matches(target, tolerance);
                self.state = if present {
                    DetectionState::Present
                } else {
                    DetectionState::Absent
                };
                if present {
                    log::debug!("target color detected: {}", mean);
                }
                DetectionOutcome {
                    triggered: present,
                    color_present: present,
                    classification: if present {
                        Classification::Target
                    } else {
                        Classification::Neither
                    },
                    mean: Some(mean),
                }
            }
        }
    }
}
