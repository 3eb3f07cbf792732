use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::DecodedFrame;
use crate::ingest::mjpeg::ExtractedFrame;

use super::{decode_frame, default_backends, DecodeConfig, DecodeRejection, DecoderBackend};

const WORKER_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    shed: AtomicU64,
    decoded: AtomicU64,
    undecodable: AtomicU64,
    rejected: AtomicU64,
    completions_dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    pub submitted: u64,
    /// Submissions dropped because the queue was full.
    pub shed: u64,
    pub decoded: u64,
    /// Frames no backend could decode (including marker failures).
    pub undecodable: u64,
    /// Frames rejected by the dimension or corruption checks.
    pub rejected: u64,
    pub completions_dropped: u64,
}

/// Cloneable submission handle for the producer side.
#[derive(Clone)]
pub struct DecodeSubmitter {
    tx: Sender<ExtractedFrame>,
    counters: Arc<PoolCounters>,
}

impl DecodeSubmitter {
    /// Enqueue a frame without blocking. Returns false when the frame was shed.
    pub fn submit(&self, frame: ExtractedFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.shed.fetch_add(1, Ordering::Relaxed);
                log::debug!("decode queue full, shedding newest frame");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.len()
    }
}

/// Fixed-size pool of decode threads fed by a bounded queue.
pub struct DecodeWorkerPool {
    submitter: Option<DecodeSubmitter>,
    completions: Receiver<DecodedFrame>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
    config: DecodeConfig,
}

impl DecodeWorkerPool {
    /// Spawn with the default backend chain.
    pub fn spawn(config: DecodeConfig) -> Result<Self> {
        Self::with_backends(config, default_backends())
    }

    pub fn with_backends(config: DecodeConfig, backends: Vec<Arc<dyn DecoderBackend>>) -> Result<Self> {
        config.validate()?;
        if backends.is_empty() {
            return Err(anyhow!("decode pool needs at least one backend"));
        }

        let (job_tx, job_rx) = bounded::<ExtractedFrame>(config.queue_capacity);
        let (done_tx, done_rx) = bounded::<DecodedFrame>(config.queue_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(PoolCounters::default());
        let backends: Arc<[Arc<dyn DecoderBackend>]> = backends.into();

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let worker = Worker {
                jobs: job_rx.clone(),
                done: done_tx.clone(),
                stop: stop.clone(),
                counters: counters.clone(),
                backends: backends.clone(),
                config: config.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("decode-{}", index))
                .spawn(move || worker.run())
                .map_err(|e| anyhow!("spawn decode worker {}: {}", index, e))?;
            workers.push(handle);
        }
        log::debug!(
            "DecodeWorkerPool: {} workers, queue capacity {}",
            config.workers,
            config.queue_capacity
        );

        Ok(Self {
            submitter: Some(DecodeSubmitter {
                tx: job_tx,
                counters: counters.clone(),
            }),
            completions: done_rx,
            workers,
            stop,
            counters,
            config,
        })
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    /// Enqueue a frame. Returns false when shed or after shutdown.
    pub fn submit(&self, frame: ExtractedFrame) -> bool {
        self.submitter
            .as_ref()
            .map(|s| s.submit(frame))
            .unwrap_or(false)
    }

    /// Producer handle, for moving submission onto another thread.
    pub fn submitter(&self) -> Option<DecodeSubmitter> {
        self.submitter.clone()
    }

    /// Decoded frames in completion order (not capture order).
    pub fn completions(&self) -> Receiver<DecodedFrame> {
        self.completions.clone()
    }

    pub fn queue_depth(&self) -> usize {
        self.submitter.as_ref().map(|s| s.queue_depth()).unwrap_or(0)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> DecodeStats {
        let c = &self.counters;
        DecodeStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            shed: c.shed.load(Ordering::Relaxed),
            decoded: c.decoded.load(Ordering::Relaxed),
            undecodable: c.undecodable.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            completions_dropped: c.completions_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and join the workers. In-flight decodes finish;
    /// queued jobs are abandoned.
    pub fn shutdown(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.submitter = None;
        let mut panicked = 0;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(anyhow!("{} decode worker thread(s) panicked", panicked));
        }
        Ok(())
    }
}

impl Drop for DecodeWorkerPool {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("DecodeWorkerPool: {}", err);
        }
    }
}

struct Worker {
    jobs: Receiver<ExtractedFrame>,
    done: Sender<DecodedFrame>,
    stop: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
    backends: Arc<[Arc<dyn DecoderBackend>]>,
    config: DecodeConfig,
}

impl Worker {
    fn run(self) {
        while !self.stop.load(Ordering::SeqCst) {
            let job = match self.jobs.recv_timeout(WORKER_POLL) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            self.process(job);
        }
    }

    fn process(&self, job: ExtractedFrame) {
        match decode_frame(job.bytes(), job.captured_at, &self.backends, &self.config) {
            Ok(frame) => {
                self.counters.decoded.fetch_add(1, Ordering::Relaxed);
                if self.done.try_send(frame).is_err() {
                    self.counters
                        .completions_dropped
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(rejection) => {
                match rejection {
                    DecodeRejection::MissingMarkers | DecodeRejection::Undecodable => {
                        self.counters.undecodable.fetch_add(1, Ordering::Relaxed)
                    }
                    DecodeRejection::Dimensions { .. } | DecodeRejection::Corrupted => {
                        self.counters.rejected.fetch_add(1, Ordering::Relaxed)
                    }
                };
                log::debug!("dropping frame ({} bytes): {}", job.len(), rejection);
            }
        }
    }
}
