//! Byte source → framer → decode pool → mailbox, as one reusable unit.
//!
//! A started pipeline runs three kinds of threads:
//! - one ingestion thread that reads the `ByteSource`, feeds the framer and
//!   submits frames to the decode pool
//! - the decode pool's workers
//! - one dispatcher that moves decoded frames into the `FrameMailbox` and
//!   publishes a `PipelineEvent::FrameAvailable` per accepted frame
//!
//! Every loop checks the shared stop flag. Sources use read timeouts and the
//! dispatcher uses a receive timeout, so `stop()` returns promptly.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

mod stats;

pub use stats::{PerformanceSnapshot, PipelineStats, RateCounter};

use crate::decode::{DecodeConfig, DecodeSubmitter, DecodeWorkerPool};
use crate::frame::{DecodedFrame, FrameMailbox};
use crate::ingest::mjpeg::{FrameExtractor, FramerConfig};
use crate::ingest::ByteSource;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;
const DISPATCH_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub framer: FramerConfig,
    pub decode: DecodeConfig,
    /// Capacity of the event queue. Events beyond it are dropped and counted.
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            framer: FramerConfig::default(),
            decode: DecodeConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.framer.validate()?;
        self.decode.validate()?;
        if self.event_capacity == 0 {
            return Err(anyhow!("event_capacity must be > 0"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum PipelineEvent {
    Connected {
        source: String,
    },
    /// A frame was accepted into the mailbox under `version`.
    FrameAvailable {
        version: u64,
        frame: Arc<DecodedFrame>,
    },
    /// The source failed or ended. Ingestion has stopped; already queued
    /// frames are still dispatched.
    Disconnected {
        source: String,
        reason: String,
    },
}

struct Running {
    pool: DecodeWorkerPool,
    ingest: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

pub struct StreamPipeline {
    config: PipelineConfig,
    mailbox: Arc<FrameMailbox>,
    stats: Arc<PipelineStats>,
    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,
    stop: Arc<AtomicBool>,
    running: Option<Running>,
}

impl StreamPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_mailbox(config, Arc::new(FrameMailbox::new()))
    }

    /// Build a pipeline that publishes into an existing mailbox.
    pub fn with_mailbox(config: PipelineConfig, mailbox: Arc<FrameMailbox>) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = bounded(config.event_capacity);
        Ok(Self {
            config,
            mailbox,
            stats: Arc::new(PipelineStats::default()),
            events_tx,
            events_rx,
            stop: Arc::new(AtomicBool::new(false)),
            running: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn mailbox(&self) -> Arc<FrameMailbox> {
        self.mailbox.clone()
    }

    /// Subscribe to pipeline events. Every receiver clone competes for the
    /// same events.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Whether the source is currently connected.
    pub fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::Relaxed)
    }

    /// Connect `source` and start the pipeline threads.
    pub fn start(&mut self, source: Box<dyn ByteSource>) -> Result<()> {
        if self.running.is_some() {
            return Err(anyhow!("pipeline already running; stop it first"));
        }
        self.stop.store(false, Ordering::SeqCst);

        let extractor = FrameExtractor::new(self.config.framer.clone())?;
        let pool = DecodeWorkerPool::spawn(self.config.decode.clone())?;
        let submitter = pool
            .submitter()
            .ok_or_else(|| anyhow!("decode pool refused a submitter"))?;
        let completions = pool.completions();

        let ingest = {
            let ingestion = Ingestion {
                source,
                extractor,
                submitter,
                stop: self.stop.clone(),
                stats: self.stats.clone(),
                events: self.events_tx.clone(),
            };
            std::thread::Builder::new()
                .name("mjpeg-ingest".into())
                .spawn(move || ingestion.run())
                .map_err(|e| anyhow!("spawn ingestion thread: {}", e))?
        };

        let dispatcher = {
            let dispatch = Dispatcher {
                completions,
                mailbox: self.mailbox.clone(),
                stop: self.stop.clone(),
                stats: self.stats.clone(),
                events: self.events_tx.clone(),
            };
            let spawned = std::thread::Builder::new()
                .name("frame-dispatch".into())
                .spawn(move || dispatch.run());
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    self.stop.store(true, Ordering::SeqCst);
                    let _ = ingest.join();
                    return Err(anyhow!("spawn dispatcher thread: {}", err));
                }
            }
        };

        self.running = Some(Running {
            pool,
            ingest,
            dispatcher,
        });
        Ok(())
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        match &self.running {
            Some(running) => self.stats.snapshot(
                running.pool.stats(),
                running.pool.queue_depth(),
                running.pool.worker_count(),
            ),
            None => self.stats.snapshot(Default::default(), 0, 0),
        }
    }

    /// Signal every thread to stop and join them.
    pub fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        let ingest = running.ingest.join();
        let dispatch = running.dispatcher.join();
        running.pool.shutdown()?;
        ingest.map_err(|_| anyhow!("ingestion thread panicked"))?;
        dispatch.map_err(|_| anyhow!("dispatcher thread panicked"))?;
        self.stats.connected.store(false, Ordering::Relaxed);
        log::debug!("pipeline stopped");
        Ok(())
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("StreamPipeline: {}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Ingestion thread
// ----------------------------------------------------------------------------

struct Ingestion {
    source: Box<dyn ByteSource>,
    extractor: FrameExtractor,
    submitter: DecodeSubmitter,
    stop: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    events: Sender<PipelineEvent>,
}

impl Ingestion {
    fn run(mut self) {
        let name = self.source.describe();
        if let Err(err) = self.source.connect() {
            log::warn!("source {} failed to connect: {:#}", name, err);
            self.publish(PipelineEvent::Disconnected {
                source: name,
                reason: format!("{:#}", err),
            });
            return;
        }
        self.stats.connected.store(true, Ordering::Relaxed);
        log::info!("source {} connected", name);
        self.publish(PipelineEvent::Connected {
            source: name.clone(),
        });

        let mut reason = None;
        while !self.stop.load(Ordering::SeqCst) {
            match self.source.next_chunk() {
                Ok(Some(chunk)) => {
                    self.stats.record_chunk(chunk.data.len(), chunk.received_at);
                    let frames = self.extractor.push(&chunk.data, chunk.received_at);
                    self.stats
                        .record_extractor(&self.extractor.stats(), self.extractor.buffered_len());
                    if !frames.is_empty() {
                        self.stats.received.record(frames.len() as u64);
                    }
                    for frame in frames {
                        self.submitter.submit(frame);
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    reason = Some(format!("{:#}", err));
                    break;
                }
            }
        }

        self.source.close();
        self.extractor.clear();
        self.stats.buffer_bytes.store(0, Ordering::Relaxed);
        self.stats.connected.store(false, Ordering::Relaxed);

        if let Some(reason) = reason {
            log::warn!("source {} disconnected: {}", name, reason);
            self.publish(PipelineEvent::Disconnected {
                source: name,
                reason,
            });
        }
    }

    fn publish(&self, event: PipelineEvent) {
        if self.events.try_send(event).is_err() {
            self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatcher thread
// ----------------------------------------------------------------------------

struct Dispatcher {
    completions: Receiver<DecodedFrame>,
    mailbox: Arc<FrameMailbox>,
    stop: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    events: Sender<PipelineEvent>,
}

impl Dispatcher {
    fn run(self) {
        while !self.stop.load(Ordering::SeqCst) {
            match self.completions.recv_timeout(DISPATCH_POLL) {
                Ok(frame) => self.dispatch(frame),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Publish a completion. Workers finish out of capture order and the
    /// mailbox follows completion order.
    fn dispatch(&self, frame: DecodedFrame) {
        self.stats.decoded.record(1);
        self.stats.receive_to_decode_us.store(
            frame.decode_latency().as_micros() as u64,
            Ordering::Relaxed,
        );

        let frame = Arc::new(frame);
        let version = self.mailbox.put_shared(frame.clone());
        self.stats.processed.record(1);
        self.stats.processing_us.store(
            frame.decoded_at().elapsed().as_micros() as u64,
            Ordering::Relaxed,
        );

        match self.events.try_send(PipelineEvent::FrameAvailable { version, frame }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Rgb;
    use crate::ingest::reader::ReaderSource;
    use crate::ingest::MemorySource;
    use std::io::Read;
    use std::time::Instant;

    fn config() -> PipelineConfig {
        PipelineConfig {
            decode: DecodeConfig {
                workers: 1,
                ..DecodeConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let mut bad = config();
        bad.event_capacity = 0;
        assert!(StreamPipeline::new(bad).is_err());
    }

    #[test]
    fn exhausted_source_reports_disconnect() {
        let mut pipeline = StreamPipeline::new(config()).unwrap();
        let events = pipeline.events();
        pipeline
            .start(Box::new(MemorySource::new(vec![0u8; 4096], 1024)))
            .unwrap();

        let mut saw_connected = false;
        let mut saw_disconnected = false;
        while let Ok(event) = events.recv_timeout(Duration::from_secs(5)) {
            match event {
                PipelineEvent::Connected { .. } => saw_connected = true,
                PipelineEvent::Disconnected { reason, .. } => {
                    assert!(reason.contains("exhausted"));
                    saw_disconnected = true;
                    break;
                }
                PipelineEvent::FrameAvailable { .. } => panic!("no frames expected"),
            }
        }
        assert!(saw_connected && saw_disconnected);
        pipeline.stop().unwrap();
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.snapshot().bytes_received, 4096);
    }

    #[test]
    fn double_start_is_refused() {
        let mut pipeline = StreamPipeline::new(config()).unwrap();
        pipeline
            .start(Box::new(MemorySource::new(vec![1u8; 16], 16)))
            .unwrap();
        assert!(pipeline
            .start(Box::new(MemorySource::new(vec![1u8; 16], 16)))
            .is_err());
        pipeline.stop().unwrap();
    }

    fn frame_captured_at(color: Rgb, captured_at: Instant) -> DecodedFrame {
        DecodedFrame::new(vec![color.r, color.g, color.b].repeat(4), 2, 2, captured_at).unwrap()
    }

    #[test]
    fn mailbox_follows_completion_order() {
        let (_completions_tx, completions) = bounded(4);
        let (events_tx, events) = bounded(4);
        let mailbox = Arc::new(FrameMailbox::new());
        let dispatcher = Dispatcher {
            completions,
            mailbox: mailbox.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PipelineStats::default()),
            events: events_tx,
        };

        let earlier = Instant::now();
        let later = earlier + Duration::from_millis(5);
        dispatcher.dispatch(frame_captured_at(Rgb::new(9, 9, 9), later));
        dispatcher.dispatch(frame_captured_at(Rgb::new(1, 1, 1), earlier));

        assert_eq!(mailbox.version(), 2);
        let held = mailbox.get().unwrap();
        assert_eq!(held.pixel(0, 0), Rgb::new(1, 1, 1));
        assert_eq!(held.captured_at(), earlier);

        let versions: Vec<u64> = events
            .try_iter()
            .map(|event| match event {
                PipelineEvent::FrameAvailable { version, .. } => version,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    struct Stalled;

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_secs(3600));
            Ok(0)
        }
    }

    #[test]
    fn stop_returns_while_reader_is_blocked() {
        let mut pipeline = StreamPipeline::new(config()).unwrap();
        pipeline
            .start(Box::new(ReaderSource::new("stalled", Box::new(Stalled), 64)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        pipeline.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!pipeline.is_running());
    }

    #[test]
    fn stop_without_start_is_noop() {
        let mut pipeline = StreamPipeline::new(config()).unwrap();
        assert!(pipeline.stop().is_ok());
    }
}
