//! Post-decode sanity checks.

use crate::frame::RGB_CHANNELS;

use super::{DecodeConfig, DecodeRejection};

/// Reject zero-area images and sides outside `[min_dimension, max_dimension]`.
pub fn check_dimensions(width: u32, height: u32, config: &DecodeConfig) -> Result<(), DecodeRejection> {
    let range = config.min_dimension..=config.max_dimension;
    if width == 0 || height == 0 || !range.contains(&width) || !range.contains(&height) {
        return Err(DecodeRejection::Dimensions { width, height });
    }
    Ok(())
}

/// O(1) corruption heuristic over five samples: the four corners and the center.
///
/// A frame is flagged when all five samples are the same color (which covers
/// the all-black case). Uniform scenes are therefore flagged too: a solid-color
/// frame is indistinguishable from a decoder that filled the buffer with a
/// constant.
pub fn looks_corrupted(pixels: &[u8], width: u32, height: u32) -> bool {
    if width == 0 || height == 0 {
        return true;
    }
    let (w, h) = (width as usize, height as usize);
    let points = [
        (0, 0),
        (w - 1, 0),
        (0, h - 1),
        (w - 1, h - 1),
        (w / 2, h / 2),
    ];

    let mut samples = [[0u8; RGB_CHANNELS]; 5];
    for (sample, &(x, y)) in samples.iter_mut().zip(points.iter()) {
        let idx = (y * w + x) * RGB_CHANNELS;
        match pixels.get(idx..idx + RGB_CHANNELS) {
            Some(px) => sample.copy_from_slice(px),
            None => return true,
        }
    }

    let uniform = samples.iter().all(|s| *s == samples[0]);
    let all_zero = samples.iter().all(|s| s.iter().all(|&c| c == 0));
    uniform || all_zero
}
