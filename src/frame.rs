//! Decoded frames and the freshest-frame hand-off.
//!
//! - `DecodedFrame`: owned RGB8 pixels plus the capture instant of the chunk that
//!   completed the JPEG.
//! - `FrameMailbox`: single-slot cell holding the most recently decoded frame.
//!
//! The mailbox never queues. A `put` replaces the occupant and drops it; a `get`
//! hands out an independent copy. The lock is held only for the pointer swap or
//! the pointer clone, never while a reader works on the frame.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

pub const RGB_CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Rgb
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// True when every channel differs from `reference` by at most `tolerance`.
    pub fn matches(self, reference: Rgb, tolerance: u8) -> bool {
        self.r.abs_diff(reference.r) <= tolerance
            && self.g.abs_diff(reference.g) <= tolerance
            && self.b.abs_diff(reference.b) <= tolerance
    }
}

impl From<[u8; 3]> for Rgb {
    fn from(value: [u8; 3]) -> Self {
        Self::new(value[0], value[1], value[2])
    }
}

impl std::fmt::Display for Rgb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RGB({}, {}, {})", self.r, self.g, self.b)
    }
}

// ----------------------------------------------------------------------------
// DecodedFrame
// ----------------------------------------------------------------------------

/// Decoded image. Pixels are tightly packed RGB8, row-major.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    captured_at: Instant,
    decoded_at: Instant,
}

impl DecodedFrame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, captured_at: Instant) -> Result<Self> {
        let expected = width as usize * height as usize * RGB_CHANNELS;
        if pixels.len() != expected {
            return Err(anyhow!(
                "pixel buffer of {} bytes does not match {}x{} rgb ({} bytes)",
                pixels.len(),
                width,
                height,
                expected
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at,
            decoded_at: Instant::now(),
        })
    }

    /// Frame filled with one color.
    pub fn solid(width: u32, height: u32, color: Rgb) -> Self {
        let pixels = [color.r, color.g, color.b].repeat(width as usize * height as usize);
        let now = Instant::now();
        Self {
            pixels,
            width,
            height,
            captured_at: now,
            decoded_at: now,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn decoded_at(&self) -> Instant {
        self.decoded_at
    }

    /// Receive-to-decode latency.
    pub fn decode_latency(&self) -> std::time::Duration {
        self.decoded_at.saturating_duration_since(self.captured_at)
    }

    /// Pixel at (x, y). Panics when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> Rgb {
        let idx = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        Rgb::new(self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: Rgb) {
        let idx = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        self.pixels[idx..idx + RGB_CHANNELS].copy_from_slice(&[color.r, color.g, color.b]);
    }
}

// ----------------------------------------------------------------------------
// FrameMailbox: single-slot freshest-frame cell
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Slot {
    frame: Option<Arc<DecodedFrame>>,
    version: u64,
}

/// Holds at most one decoded frame, always the most recently `put`.
///
/// `version` increases by one per `put`, letting pollers skip frames they have
/// already sampled.
#[derive(Default)]
pub struct FrameMailbox {
    slot: Mutex<Slot>,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the occupant. Returns the new version.
    pub fn put(&self, frame: DecodedFrame) -> u64 {
        self.put_shared(Arc::new(frame))
    }

    /// `put` for a frame that is already shared (e.g. also sent as an event).
    pub fn put_shared(&self, frame: Arc<DecodedFrame>) -> u64 {
        let previous = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            slot.version += 1;
            let version = slot.version;
            (slot.frame.replace(frame), version)
        };
        // Old frame is released outside the lock.
        drop(previous.0);
        previous.1
    }

    /// Independent copy of the current occupant.
    pub fn get(&self) -> Option<DecodedFrame> {
        self.latest().map(|frame| frame.as_ref().clone())
    }

    /// Shared handle to the current occupant (no pixel copy).
    pub fn latest(&self) -> Option<Arc<DecodedFrame>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frame
            .clone()
    }

    /// Current occupant if it is newer than `seen`.
    pub fn latest_after(&self, seen: u64) -> Option<(u64, Arc<DecodedFrame>)> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.version <= seen {
            return None;
        }
        slot.frame.clone().map(|frame| (slot.version, frame))
    }

    pub fn version(&self) -> u64 {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frame
            .is_none()
    }

    /// Empty the slot. The version keeps counting.
    pub fn clear(&self) {
        let previous = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frame
            .take();
        drop(previous);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
