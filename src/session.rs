//! Detection session: mailbox polling, color sampling and trigger dispatch.
//!
//! A session owns its detection workers. Each worker polls the mailbox for a
//! version it has not sampled yet, runs the `DetectionEngine` and hands
//! eligible outcomes to the shared `TriggerController`. Engine and "last
//! sampled version" sit under one lock, so frames are sampled at most once
//! and never out of order, whatever the worker count.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::detect::{Classification, DetectionEngine, DetectionState, DetectorConfig};
use crate::frame::{DecodedFrame, FrameMailbox, Rgb};
use crate::trigger::{Actuator, TriggerAttempt, TriggerController, TriggerTiming};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const MAX_SESSION_WORKERS: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub workers: usize,
    /// Sleep between mailbox polls when no new frame is available.
    pub poll_interval: Duration,
    /// Run actions on their own thread instead of the detection worker.
    pub detached_actions: bool,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            detached_actions: true,
            event_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_SESSION_WORKERS).contains(&self.workers) {
            return Err(anyhow!(
                "session workers must be between 1 and {} (got {})",
                MAX_SESSION_WORKERS,
                self.workers
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll_interval must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(anyhow!("event_capacity must be > 0"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// An action was started (detached) or completed (inline).
    Triggered {
        version: u64,
        classification: Classification,
        mean: Option<Rgb>,
    },
    ActionFailed {
        version: u64,
        attempt: TriggerAttempt,
    },
    Disconnected {
        source: String,
        reason: String,
    },
}

struct Detector {
    engine: DetectionEngine,
    last_version: u64,
}

struct Shared {
    detector: Mutex<Detector>,
    controller: Arc<TriggerController>,
    actuator: Arc<dyn Actuator>,
    mailbox: Arc<FrameMailbox>,
    events: Sender<SessionEvent>,
    stop: AtomicBool,
    detached: bool,
}

impl Shared {
    fn detector(&self) -> MutexGuard<'_, Detector> {
        self.detector.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: SessionEvent) {
        if self.events.try_send(event).is_err() {
            log::debug!("session event queue full, dropping event");
        }
    }

    /// Sample one frame and fire if eligible. Returns false when `version`
    /// was already sampled.
    fn evaluate(self: &Arc<Self>, version: u64, frame: &DecodedFrame) -> bool {
        let outcome = {
            let mut detector = self.detector();
            if version <= detector.last_version {
                return false;
            }
            detector.last_version = version;
            detector.engine.sample(frame)
        };
        if !outcome.triggered {
            return true;
        }

        let attempt = if self.detached {
            match self
                .controller
                .try_trigger_detached(self.actuator.clone())
            {
                Ok(_) => TriggerAttempt::Completed,
                Err(refused) => refused,
            }
        } else {
            self.controller.attempt(self.actuator.as_ref())
        };

        match attempt {
            TriggerAttempt::Completed => {
                log::info!(
                    "triggered on frame {} ({:?}, mean {})",
                    version,
                    outcome.classification,
                    outcome.mean.map(|m| m.to_string()).unwrap_or_default()
                );
                self.publish(SessionEvent::Triggered {
                    version,
                    classification: outcome.classification,
                    mean: outcome.mean,
                });
            }
            TriggerAttempt::Failed | TriggerAttempt::Unavailable => {
                self.publish(SessionEvent::ActionFailed { version, attempt });
            }
            TriggerAttempt::CoolingDown => {}
        }
        true
    }
}

pub struct DetectionSession {
    config: SessionConfig,
    shared: Arc<Shared>,
    events_rx: Receiver<SessionEvent>,
    workers: Vec<JoinHandle<()>>,
}

impl DetectionSession {
    pub fn new(
        config: SessionConfig,
        detector: DetectorConfig,
        controller: Arc<TriggerController>,
        actuator: Arc<dyn Actuator>,
        mailbox: Arc<FrameMailbox>,
    ) -> Result<Self> {
        config.validate()?;
        let engine = DetectionEngine::new(detector)?;
        let (events_tx, events_rx) = bounded(config.event_capacity);
        Ok(Self {
            shared: Arc::new(Shared {
                detector: Mutex::new(Detector {
                    engine,
                    last_version: 0,
                }),
                controller,
                actuator,
                mailbox,
                events: events_tx,
                stop: AtomicBool::new(false),
                detached: config.detached_actions,
            }),
            config,
            events_rx,
            workers: Vec::new(),
        })
    }

    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    pub fn controller(&self) -> Arc<TriggerController> {
        self.shared.controller.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn detector_config(&self) -> DetectorConfig {
        *self.shared.detector().engine.config()
    }

    pub fn detection_state(&self) -> DetectionState {
        self.shared.detector().engine.state()
    }

    /// Enable detection and spawn the workers. Frames already in the mailbox
    /// are skipped.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(anyhow!("detection session already running"));
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        {
            let mut detector = self.shared.detector();
            detector.engine.clear_state();
            detector.engine.set_enabled(true);
            detector.last_version = self.shared.mailbox.version();
        }

        for index in 0..self.config.workers {
            let shared = self.shared.clone();
            let poll = self.config.poll_interval;
            let spawned = std::thread::Builder::new()
                .name(format!("detect-{}", index))
                .spawn(move || detection_loop(shared, poll));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(err) => {
                    self.stop()?;
                    return Err(anyhow!("spawn detection worker {}: {}", index, err));
                }
            }
        }
        log::info!(
            "detection session started ({} worker(s), mode {})",
            self.config.workers,
            self.detector_config().mode.name()
        );
        Ok(())
    }

    /// Join the workers, then reset detection state and the trigger window.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.stop.store(true, Ordering::SeqCst);
        let mut panicked = 0;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        self.shared.detector().engine.reset();
        self.shared.controller.reset();
        if panicked > 0 {
            return Err(anyhow!("{} detection worker(s) panicked", panicked));
        }
        Ok(())
    }

    /// Sample a frame on the calling thread (no workers needed). Returns false
    /// when `version` was already sampled.
    pub fn evaluate(&self, version: u64, frame: &DecodedFrame) -> bool {
        self.shared.evaluate(version, frame)
    }

    /// Enable or disable sampling without stopping the session.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.detector().engine.set_enabled(enabled);
    }

    /// Invalid configuration is rejected; the current one stays active.
    pub fn update_detector(&self, config: DetectorConfig) -> Result<()> {
        self.shared.detector().engine.set_config(config)
    }

    /// Invalid timing is rejected; the current one stays active.
    pub fn update_timing(&self, timing: TriggerTiming) -> Result<()> {
        self.shared.controller.update_timing(timing)
    }

    /// React to a lost source: drop the stale frame, forget the previous
    /// classification and tell subscribers.
    pub fn handle_disconnect(&self, source: &str, reason: &str) {
        self.shared.mailbox.clear();
        self.shared.detector().engine.clear_state();
        self.shared.publish(SessionEvent::Disconnected {
            source: source.to_string(),
            reason: reason.to_string(),
        });
    }
}

impl Drop for DetectionSession {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("DetectionSession: {}", err);
        }
    }
}

fn detection_loop(shared: Arc<Shared>, poll: Duration) {
    let mut seen = 0;
    while !shared.stop.load(Ordering::SeqCst) {
        match shared.mailbox.latest_after(seen) {
            Some((version, frame)) => {
                seen = version;
                shared.evaluate(version, &frame);
            }
            None => std::thread::sleep(poll),
        }
    }
}
