use serde::Serialize;

use crate::frame::Rgb;

/// Which reference color the sampled mean matched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Classification {
    #[default]
    Neither,
    /// Transition mode: matched the starting color.
    From,
    /// Transition mode: matched the destination color.
    To,
    /// Presence mode: matched the target color.
    Target,
}

/// Result of sampling one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DetectionOutcome {
    /// The trigger controller should be asked to fire.
    pub triggered: bool,
    /// The to-color (transition) or target (presence) is currently visible.
    pub color_present: bool,
    pub classification: Classification,
    /// Mean color of the sampled region; `None` when the engine is disabled.
    pub mean: Option<Rgb>,
}
