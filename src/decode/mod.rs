//! Concurrent JPEG decoding.
//!
//! Extracted frames are submitted to a bounded queue drained by a fixed set of
//! worker threads. Each worker runs the backend chain (fast JPEG path first,
//! format-sniffing fallback second), validates the result and publishes the
//! decoded frame on a completion channel.
//!
//! Submission never blocks: when the queue is full the newest frame is shed.
//! A failed decode is counted and forgotten; it never stops a worker.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Instant;

mod backend;
mod backends;
mod check;
mod pool;

pub use backend::{DecoderBackend, RawImage};
pub use backends::{GenericBackend, JpegFastBackend};
pub use check::{check_dimensions, looks_corrupted};
pub use pool::{DecodeStats, DecodeSubmitter, DecodeWorkerPool};

use crate::frame::DecodedFrame;
use crate::ingest::mjpeg::has_jpeg_markers;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const MAX_WORKERS: usize = 16;
pub const DEFAULT_MIN_DIMENSION: u32 = 10;
pub const DEFAULT_MAX_DIMENSION: u32 = 10_000;

/// `min(8, available_parallelism + 4)`.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores + 4).min(8)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub min_dimension: u32,
    pub max_dimension: u32,
    /// Run the five-sample corruption heuristic on every decoded frame.
    pub corruption_check: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            min_dimension: DEFAULT_MIN_DIMENSION,
            max_dimension: DEFAULT_MAX_DIMENSION,
            corruption_check: true,
        }
    }
}

impl DecodeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_WORKERS).contains(&self.workers) {
            return Err(anyhow!(
                "decode workers must be between 1 and {} (got {})",
                MAX_WORKERS,
                self.workers
            ));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("decode queue capacity must be > 0"));
        }
        if self.min_dimension == 0 {
            return Err(anyhow!("min_dimension must be > 0"));
        }
        if self.min_dimension > self.max_dimension {
            return Err(anyhow!(
                "min_dimension {} exceeds max_dimension {}",
                self.min_dimension,
                self.max_dimension
            ));
        }
        Ok(())
    }
}

/// Why a frame produced no decoded output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeRejection {
    MissingMarkers,
    Undecodable,
    Dimensions { width: u32, height: u32 },
    Corrupted,
}

impl std::fmt::Display for DecodeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeRejection::MissingMarkers => write!(f, "missing SOI/EOI markers"),
            DecodeRejection::Undecodable => write!(f, "no backend could decode the frame"),
            DecodeRejection::Dimensions { width, height } => {
                write!(f, "dimensions {}x{} out of range", width, height)
            }
            DecodeRejection::Corrupted => write!(f, "frame failed corruption check"),
        }
    }
}

impl std::error::Error for DecodeRejection {}

/// Decode one extracted JPEG through `backends` in order and validate it.
pub fn decode_frame(
    bytes: &[u8],
    captured_at: Instant,
    backends: &[Arc<dyn DecoderBackend>],
    config: &DecodeConfig,
) -> std::result::Result<DecodedFrame, DecodeRejection> {
    if !has_jpeg_markers(bytes) {
        return Err(DecodeRejection::MissingMarkers);
    }

    let image = backends
        .iter()
        .find_map(|backend| match backend.decode(bytes) {
            Ok(image) => Some(image),
            Err(err) => {
                log::trace!("decoder {} failed: {:#}", backend.name(), err);
                None
            }
        })
        .ok_or(DecodeRejection::Undecodable)?;

    check_dimensions(image.width, image.height, config)?;
    if config.corruption_check && looks_corrupted(&image.pixels, image.width, image.height) {
        return Err(DecodeRejection::Corrupted);
    }

    DecodedFrame::new(image.pixels, image.width, image.height, captured_at)
        .map_err(|_| DecodeRejection::Undecodable)
}

/// The default backend chain: fast JPEG path, then the generic decoder.
pub fn default_backends() -> Vec<Arc<dyn DecoderBackend>> {
    vec![Arc::new(JpegFastBackend), Arc::new(GenericBackend)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::ExtendedColorType;

    fn gradient_jpeg(width: u32, height: u32) -> Vec<u8> {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[(x * 255 / width) as u8, (y * 255 / height) as u8, 90]);
            }
        }
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .encode(&pixels, width, height, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn default_workers_within_bounds() {
        let workers = default_worker_count();
        assert!((1..=8).contains(&workers));
        assert!(DecodeConfig::default().validate().is_ok());
    }

    #[test]
    fn worker_count_is_validated() {
        let mut config = DecodeConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());
        config.workers = 17;
        assert!(config.validate().is_err());
        config.workers = 16;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn decodes_well_formed_jpeg() {
        let jpeg = gradient_jpeg(64, 48);
        let frame = decode_frame(&jpeg, Instant::now(), &default_backends(), &DecodeConfig::default())
            .unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));
    }

    #[test]
    fn truncated_jpeg_is_rejected_without_panic() {
        let mut jpeg = gradient_jpeg(64, 48);
        jpeg.truncate(jpeg.len() / 2);
        let result = decode_frame(&jpeg, Instant::now(), &default_backends(), &DecodeConfig::default());
        assert_eq!(result.unwrap_err(), DecodeRejection::MissingMarkers);
    }

    #[test]
    fn corrupted_body_is_rejected() {
        let mut bytes = vec![0xFF, 0xD8];
        bytes.extend(std::iter::repeat(0x42).take(500));
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        let result = decode_frame(&bytes, Instant::now(), &default_backends(), &DecodeConfig::default());
        assert_eq!(result.unwrap_err(), DecodeRejection::Undecodable);
    }

    #[test]
    fn small_image_fails_dimension_check() {
        let jpeg = gradient_jpeg(8, 8);
        let result = decode_frame(&jpeg, Instant::now(), &default_backends(), &DecodeConfig::default());
        assert_eq!(
            result.unwrap_err(),
            DecodeRejection::Dimensions { width: 8, height: 8 }
        );
    }

    #[test]
    fn fallback_backend_used_when_fast_path_fails() {
        struct Failing;
        impl DecoderBackend for Failing {
            fn name(&self) -> &'static str {
                "failing"
            }
            fn decode(&self, _bytes: &[u8]) -> Result<RawImage> {
                Err(anyhow!("nope"))
            }
        }

        let backends: Vec<Arc<dyn DecoderBackend>> = vec![Arc::new(Failing), Arc::new(GenericBackend)];
        let jpeg = gradient_jpeg(32, 32);
        let frame = decode_frame(&jpeg, Instant::now(), &backends, &DecodeConfig::default()).unwrap();
        assert_eq!(frame.width(), 32);
    }
}
