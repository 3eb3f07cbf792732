//! Pipeline performance counters.
//!
//! Rates are measured over rolling one-second windows; everything else is a
//! plain atomic gauge or cumulative counter written by the pipeline threads.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::decode::DecodeStats;
use crate::ingest::mjpeg::ExtractorStats;

const RATE_WINDOW: Duration = Duration::from_secs(1);
const RECEIVING_GRACE: Duration = Duration::from_secs(1);

struct RateWindow {
    started: Instant,
    count: u64,
    last_rate: f64,
}

impl RateWindow {
    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= RATE_WINDOW {
            self.last_rate = self.count as f64 / elapsed.as_secs_f64();
            self.count = 0;
            self.started = now;
        }
    }
}

/// Events per second over the most recently completed window.
pub struct RateCounter {
    window: Mutex<RateWindow>,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self {
            window: Mutex::new(RateWindow {
                started: Instant::now(),
                count: 0,
                last_rate: 0.0,
            }),
        }
    }
}

impl RateCounter {
    pub fn record(&self, n: u64) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.roll(Instant::now());
        window.count += n;
    }

    pub fn per_second(&self) -> f64 {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.roll(Instant::now());
        window.last_rate
    }
}

/// Shared counters written by the ingestion and dispatch threads.
#[derive(Default)]
pub struct PipelineStats {
    pub(crate) received: RateCounter,
    pub(crate) decoded: RateCounter,
    pub(crate) processed: RateCounter,
    pub(crate) buffer_bytes: AtomicUsize,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) frames_extracted: AtomicU64,
    pub(crate) undersized_dropped: AtomicU64,
    pub(crate) oversized_dropped: AtomicU64,
    pub(crate) buffer_clears: AtomicU64,
    pub(crate) resyncs: AtomicU64,
    pub(crate) events_dropped: AtomicU64,
    pub(crate) receive_to_decode_us: AtomicU64,
    pub(crate) processing_us: AtomicU64,
    pub(crate) connected: AtomicBool,
    last_chunk_at: Mutex<Option<Instant>>,
}

impl PipelineStats {
    pub(crate) fn record_chunk(&self, len: usize, at: Instant) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        *self
            .last_chunk_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    /// Mirror the extractor's cumulative counters.
    pub(crate) fn record_extractor(&self, stats: &ExtractorStats, buffered: usize) {
        self.buffer_bytes.store(buffered, Ordering::Relaxed);
        self.frames_extracted
            .store(stats.frames_extracted, Ordering::Relaxed);
        self.undersized_dropped
            .store(stats.undersized_dropped, Ordering::Relaxed);
        self.oversized_dropped
            .store(stats.oversized_dropped, Ordering::Relaxed);
        self.buffer_clears
            .store(stats.buffer_clears, Ordering::Relaxed);
        self.resyncs.store(stats.resyncs, Ordering::Relaxed);
    }

    fn receiving(&self) -> bool {
        self.last_chunk_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() < RECEIVING_GRACE)
    }

    pub(crate) fn snapshot(
        &self,
        decode: DecodeStats,
        queue_depth: usize,
        workers: usize,
    ) -> PerformanceSnapshot {
        PerformanceSnapshot {
            received_fps: self.received.per_second(),
            decoded_fps: self.decoded.per_second(),
            processed_fps: self.processed.per_second(),
            buffer_bytes: self.buffer_bytes.load(Ordering::Relaxed),
            queue_depth,
            workers,
            receive_to_decode_ms: self.receive_to_decode_us.load(Ordering::Relaxed) as f64
                / 1000.0,
            processing_ms: self.processing_us.load(Ordering::Relaxed) as f64 / 1000.0,
            connected: self.connected.load(Ordering::Relaxed),
            receiving: self.receiving(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_extracted: self.frames_extracted.load(Ordering::Relaxed),
            undersized_dropped: self.undersized_dropped.load(Ordering::Relaxed),
            oversized_dropped: self.oversized_dropped.load(Ordering::Relaxed),
            buffer_clears: self.buffer_clears.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            decode,
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the pipeline, suitable for logs and JSON output.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PerformanceSnapshot {
    /// Frames extracted from the byte stream per second.
    pub received_fps: f64,
    pub decoded_fps: f64,
    /// Frames accepted into the mailbox per second.
    pub processed_fps: f64,
    pub buffer_bytes: usize,
    pub queue_depth: usize,
    pub workers: usize,
    /// Receive-to-decode latency of the most recent frame.
    pub receive_to_decode_ms: f64,
    /// Decode-to-mailbox latency of the most recent frame.
    pub processing_ms: f64,
    pub connected: bool,
    pub receiving: bool,
    pub bytes_received: u64,
    pub frames_extracted: u64,
    pub undersized_dropped: u64,
    pub oversized_dropped: u64,
    pub buffer_clears: u64,
    pub resyncs: u64,
    pub decode: DecodeStats,
    pub events_dropped: u64,
}
