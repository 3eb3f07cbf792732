//! chroma-trigger
//!
//! This crate turns a Motion-JPEG byte stream into timed actuator actions.
//!
//! # Architecture
//!
//! Frames flow through five stages, each replaceable on its own:
//!
//! 1. **Framing** (`ingest::mjpeg`): an append-only byte stream is cut into whole
//!    JPEG images using only the SOI/EOI markers. The buffer is hard-bounded.
//! 2. **Decoding** (`decode`): a fixed pool of workers decodes JPEG bytes into RGB
//!    pixels. The submission queue is bounded and sheds the newest job when full.
//! 3. **Hand-off** (`frame`): a single-slot mailbox always holds the most recently
//!    decoded frame. Readers get an independent copy.
//! 4. **Detection** (`detect`): the mean color of a small centered region is
//!    classified against reference colors, edge-triggered or level-triggered.
//! 5. **Triggering** (`trigger`): a cooldown-limited controller runs a jittered
//!    press/release action, at most one in flight at a time.
//!
//! # Module Structure
//!
//! - `ingest`: byte sources (UDP, TCP, readers) and the MJPEG frame extractor
//! - `decode`: decoder backends, frame checks and the worker pool
//! - `frame`: decoded frames and the freshest-frame mailbox
//! - `detect`: color sampling and the detection state machine
//! - `trigger`: actuators and the trigger controller
//! - `pipeline`: the ingestion/decode/dispatch composition for one connection
//! - `session`: detection workers that drive the trigger controller
//! - `config`: the validated daemon configuration

pub mod config;
pub mod decode;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod session;
pub mod trigger;

pub use config::TriggerdConfig;
pub use decode::{DecodeConfig, DecodeRejection, DecodeWorkerPool, DecoderBackend};
pub use detect::{
    Classification, DetectionEngine, DetectionMode, DetectionOutcome, DetectionState,
    DetectorConfig,
};
pub use frame::{DecodedFrame, FrameMailbox, Rgb};
pub use ingest::mjpeg::{ExtractedFrame, ExtractorStats, FrameExtractor, FramerConfig};
pub use ingest::{open_source, ByteSource, RawChunk};
pub use pipeline::{PerformanceSnapshot, PipelineConfig, PipelineEvent, StreamPipeline};
pub use session::{DetectionSession, SessionConfig, SessionEvent};
pub use trigger::{
    Actuator, DelayRange, LineActuator, LogActuator, TriggerAttempt, TriggerController,
    TriggerPhase, TriggerStats, TriggerTiming,
};
