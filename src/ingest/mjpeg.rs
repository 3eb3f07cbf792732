//! MJPEG byte-stream framer.
//!
//! `FrameExtractor` turns an append-only byte stream into whole JPEG images.
//! The stream carries concatenated JPEGs with no container header, so each image
//! is delimited solely by its own SOI (`FF D8`) and EOI (`FF D9`) markers.
//!
//! The extractor is responsible for:
//! - Bounding the accumulation buffer (full clear on overflow)
//! - Resynchronizing on the next SOI when garbage precedes it
//! - Dropping frames outside the configured size window
//! - Capping the number of extractions per pushed chunk
//!
//! The extractor MUST NOT:
//! - Fail past its own boundary (malformed input means "no frames")
//! - Keep a partially extracted frame after an overflow

use anyhow::{anyhow, Result};
use std::time::Instant;

pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Bytes retained while no SOI is present, so a marker split across chunks survives.
pub const RESYNC_KEEP_BYTES: usize = 1024;

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_MIN_VALID_FRAME_SIZE: usize = 100;
pub const DEFAULT_MAX_VALID_FRAME_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_FRAMES_PER_CHUNK: usize = 5;

/// Configuration for a `FrameExtractor`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramerConfig {
    /// Hard cap on buffered bytes. Exceeding it clears the buffer.
    pub max_buffer_size: usize,
    /// Frames shorter than this are dropped.
    pub min_valid_frame_size: usize,
    /// Frames longer than this are dropped.
    pub max_valid_frame_size: usize,
    /// Upper bound on extractions per `push` call.
    pub max_frames_per_chunk: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            min_valid_frame_size: DEFAULT_MIN_VALID_FRAME_SIZE,
            max_valid_frame_size: DEFAULT_MAX_VALID_FRAME_SIZE,
            max_frames_per_chunk: DEFAULT_MAX_FRAMES_PER_CHUNK,
        }
    }
}

impl FramerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size <= RESYNC_KEEP_BYTES {
            return Err(anyhow!(
                "max_buffer_size must be larger than {} bytes",
                RESYNC_KEEP_BYTES
            ));
        }
        if self.min_valid_frame_size < JPEG_SOI.len() + JPEG_EOI.len() {
            return Err(anyhow!("min_valid_frame_size must be at least 4 bytes"));
        }
        if self.min_valid_frame_size > self.max_valid_frame_size {
            return Err(anyhow!(
                "min_valid_frame_size ({}) exceeds max_valid_frame_size ({})",
                self.min_valid_frame_size,
                self.max_valid_frame_size
            ));
        }
        if self.max_frames_per_chunk == 0 {
            return Err(anyhow!("max_frames_per_chunk must be >= 1"));
        }
        Ok(())
    }
}

/// One complete JPEG image cut from the stream.
///
/// Always starts with SOI and ends with EOI.
#[derive(Clone, Debug)]
pub struct ExtractedFrame {
    bytes: Vec<u8>,
    /// Arrival time of the chunk that completed this frame.
    pub captured_at: Instant,
}

impl ExtractedFrame {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Wrap bytes that are already known to be a frame (tests, replays).
    pub fn from_bytes(bytes: Vec<u8>, captured_at: Instant) -> Self {
        Self { bytes, captured_at }
    }
}

/// Cumulative extractor counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractorStats {
    pub bytes_received: u64,
    pub frames_extracted: u64,
    pub undersized_dropped: u64,
    pub oversized_dropped: u64,
    pub buffer_clears: u64,
    pub resyncs: u64,
}

/// Stateful MJPEG framer. Owns the only copy of the accumulation buffer.
pub struct FrameExtractor {
    config: FramerConfig,
    buffer: Vec<u8>,
    stats: ExtractorStats,
}

impl FrameExtractor {
    pub fn new(config: FramerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            buffer: Vec::with_capacity(64 * 1024),
            config,
            stats: ExtractorStats::default(),
        })
    }

    pub fn config(&self) -> &FramerConfig {
        &self.config
    }

    /// Append a chunk and return every frame it completed (bounded per call).
    pub fn push(&mut self, chunk: &[u8], captured_at: Instant) -> Vec<ExtractedFrame> {
        self.stats.bytes_received += chunk.len() as u64;

        if self.buffer.len() + chunk.len() > self.config.max_buffer_size {
            log::debug!(
                "mjpeg buffer would reach {} bytes (cap {}), clearing",
                self.buffer.len() + chunk.len(),
                self.config.max_buffer_size
            );
            self.clear_after_overflow();
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        match self.extract(captured_at) {
            Ok(frames) => frames,
            Err(err) => {
                log::warn!("mjpeg framer reset after internal error: {}", err);
                self.buffer.clear();
                self.stats.buffer_clears += 1;
                Vec::new()
            }
        }
    }

    /// Bytes currently held (a partial frame or resync tail).
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> ExtractorStats {
        self.stats
    }

    /// Drop everything buffered, e.g. when the connection changes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn clear_after_overflow(&mut self) {
        self.buffer.clear();
        self.stats.buffer_clears += 1;
    }

    fn extract(&mut self, captured_at: Instant) -> Result<Vec<ExtractedFrame>> {
        let mut frames = Vec::new();
        let mut attempts = 0;

        while attempts < self.config.max_frames_per_chunk {
            let Some(start) = find_marker(&self.buffer, JPEG_SOI, 0) else {
                if self.buffer.len() > RESYNC_KEEP_BYTES {
                    let drain_len = self.buffer.len() - RESYNC_KEEP_BYTES;
                    self.buffer.drain(..drain_len);
                    self.stats.resyncs += 1;
                }
                break;
            };

            if start > 0 {
                self.buffer.drain(..start);
            }

            let Some(eoi) = find_marker(&self.buffer, JPEG_EOI, JPEG_SOI.len()) else {
                break;
            };
            let end = eoi + JPEG_EOI.len();
            attempts += 1;

            let frame_bytes: Vec<u8> = self
                .buffer
                .get(..end)
                .ok_or_else(|| anyhow!("frame end {} past buffer of {}", end, self.buffer.len()))?
                .to_vec();
            self.buffer.drain(..end);

            if frame_bytes.len() < self.config.min_valid_frame_size {
                self.stats.undersized_dropped += 1;
                continue;
            }
            if frame_bytes.len() > self.config.max_valid_frame_size {
                log::debug!("jpeg frame too large: {} bytes, skipping", frame_bytes.len());
                self.stats.oversized_dropped += 1;
                continue;
            }

            self.stats.frames_extracted += 1;
            frames.push(ExtractedFrame {
                bytes: frame_bytes,
                captured_at,
            });
        }

        Ok(frames)
    }
}

/// Position of the first `marker` at or after `from`.
pub fn find_marker(buffer: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|pair| pair == marker)
        .map(|pos| pos + from)
}

/// True when `bytes` begins with SOI and ends with EOI.
pub fn has_jpeg_markers(bytes: &[u8]) -> bool {
    bytes.len() >= JPEG_SOI.len() + JPEG_EOI.len()
        && bytes.starts_with(&JPEG_SOI)
        && bytes.ends_with(&JPEG_EOI)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg(body_len: usize, fill: u8) -> Vec<u8> {
        let mut bytes = JPEG_SOI.to_vec();
        bytes.extend(std::iter::repeat(fill).take(body_len));
        bytes.extend_from_slice(&JPEG_EOI);
        bytes
    }

    fn extractor() -> FrameExtractor {
        FrameExtractor::new(FramerConfig::default()).unwrap()
    }

    #[test]
    fn extracts_single_frame_in_one_chunk() {
        let mut ex = extractor();
        let jpeg = fake_jpeg(200, 0x11);
        let frames = ex.push(&jpeg, Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes(), jpeg.as_slice());
        assert_eq!(ex.buffered_len(), 0);
    }

    #[test]
    fn reassembles_frame_split_across_datagrams() {
        let mut ex = extractor();
        let jpeg = fake_jpeg(5000, 0x22);
        let mut out = Vec::new();
        for chunk in jpeg.chunks(1316) {
            out.extend(ex.push(chunk, Instant::now()));
        }
        assert_eq!(out.len(), 1);
        assert!(has_jpeg_markers(out[0].bytes()));
        assert_eq!(out[0].len(), jpeg.len());
    }

    #[test]
    fn discards_garbage_before_start_marker() {
        let mut ex = extractor();
        let mut stream = vec![0x00, 0x13, 0x37, 0xFF, 0x00];
        let jpeg = fake_jpeg(150, 0x33);
        stream.extend_from_slice(&jpeg);
        let frames = ex.push(&stream, Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes(), jpeg.as_slice());
    }

    #[test]
    fn marker_split_between_chunks_is_found() {
        let mut ex = extractor();
        let jpeg = fake_jpeg(150, 0x44);
        assert!(ex.push(&jpeg[..1], Instant::now()).is_empty());
        let frames = ex.push(&jpeg[1..], Instant::now());
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn undersized_frames_are_dropped_without_losing_following_frame() {
        let mut ex = extractor();
        let mut stream = fake_jpeg(10, 0x01);
        let good = fake_jpeg(300, 0x02);
        stream.extend_from_slice(&good);
        let frames = ex.push(&stream, Instant::now());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes(), good.as_slice());
        assert_eq!(ex.stats().undersized_dropped, 1);
    }

    #[test]
    fn oversized_frames_are_dropped() {
        let mut ex = FrameExtractor::new(FramerConfig {
            max_valid_frame_size: 500,
            ..FramerConfig::default()
        })
        .unwrap();
        let frames = ex.push(&fake_jpeg(1000, 0x05), Instant::now());
        assert!(frames.is_empty());
        assert_eq!(ex.stats().oversized_dropped, 1);
        assert_eq!(ex.buffered_len(), 0);
    }

    #[test]
    fn caps_extractions_per_push_and_keeps_the_rest() {
        let mut ex = extractor();
        let mut stream = Vec::new();
        for i in 0..8u8 {
            stream.extend_from_slice(&fake_jpeg(120, i));
        }
        let first = ex.push(&stream, Instant::now());
        assert_eq!(first.len(), DEFAULT_MAX_FRAMES_PER_CHUNK);
        let second = ex.push(&[], Instant::now());
        assert_eq!(second.len(), 3);
    }

    #[test]
    fn trims_to_tail_when_no_start_marker() {
        let mut ex = extractor();
        let garbage = vec![0x42u8; 8 * 1024];
        assert!(ex.push(&garbage, Instant::now()).is_empty());
        assert_eq!(ex.buffered_len(), RESYNC_KEEP_BYTES);
        assert_eq!(ex.stats().resyncs, 1);
    }

    #[test]
    fn partial_frame_waits_for_end_marker() {
        let mut ex = extractor();
        let jpeg = fake_jpeg(400, 0x66);
        assert!(ex.push(&jpeg[..200], Instant::now()).is_empty());
        assert_eq!(ex.buffered_len(), 200);
        assert_eq!(ex.push(&jpeg[200..], Instant::now()).len(), 1);
    }

    #[test]
    fn overflow_clears_entire_buffer() {
        let mut ex = FrameExtractor::new(FramerConfig {
            max_buffer_size: 4096,
            ..FramerConfig::default()
        })
        .unwrap();
        let mut open = JPEG_SOI.to_vec();
        open.extend(std::iter::repeat(0x10).take(3000));
        assert!(ex.push(&open, Instant::now()).is_empty());
        assert_eq!(ex.buffered_len(), 3002);

        assert!(ex.push(&[0x10; 2000], Instant::now()).is_empty());
        assert_eq!(ex.buffered_len(), 0);
        assert_eq!(ex.stats().buffer_clears, 1);
    }

    #[test]
    fn rejects_inverted_size_window() {
        let cfg = FramerConfig {
            min_valid_frame_size: 2000,
            max_valid_frame_size: 1000,
            ..FramerConfig::default()
        };
        assert!(FrameExtractor::new(cfg).is_err());
    }

    #[test]
    fn find_marker_respects_offset() {
        let buf = [0xFF, 0xD8, 0xFF, 0xD9, 0xFF, 0xD9];
        assert_eq!(find_marker(&buf, JPEG_EOI, 0), Some(2));
        assert_eq!(find_marker(&buf, JPEG_EOI, 3), Some(4));
        assert_eq!(find_marker(&buf, JPEG_EOI, 10), None);
    }
}
