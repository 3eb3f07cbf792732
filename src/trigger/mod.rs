//! Rate-limited, jittered execution of the press/release action.
//!
//! The controller is `Idle` until a trigger is accepted, then `Cooling` until
//! `cooldown.min_ms` has elapsed since that acceptance. Eligibility check and
//! timestamp update happen under one lock, so concurrent callers can never
//! both pass the check. Execution itself is serialized by a second lock: at
//! most one action is in flight at any time.

use anyhow::{anyhow, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

mod actuator;

pub use actuator::{
    Actuator, LineActuator, LogActuator, DEFAULT_PRESS_COMMAND, DEFAULT_RELEASE_COMMAND,
};

/// Upper bound for any configured delay or cooldown.
pub const MAX_DELAY_MS: u64 = 60_000;

// ----------------------------------------------------------------------------
// Timing
// ----------------------------------------------------------------------------

/// Inclusive millisecond range sampled uniformly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub fn new(min_ms: u64, max_ms: u64) -> Result<Self> {
        let range = Self { min_ms, max_ms };
        range.validate()?;
        Ok(range)
    }

    pub const fn fixed(ms: u64) -> Self {
        Self { min_ms: ms, max_ms: ms }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_ms > self.max_ms {
            return Err(anyhow!(
                "delay range min {}ms exceeds max {}ms",
                self.min_ms,
                self.max_ms
            ));
        }
        if self.max_ms > MAX_DELAY_MS {
            return Err(anyhow!(
                "delay {}ms exceeds the {}ms limit",
                self.max_ms,
                MAX_DELAY_MS
            ));
        }
        Ok(())
    }

    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    pub fn sample(&self) -> Duration {
        if self.min_ms >= self.max_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }
}

impl std::fmt::Display for DelayRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.min_ms == self.max_ms {
            write!(f, "{}ms", self.min_ms)
        } else {
            write!(f, "{}~{}ms", self.min_ms, self.max_ms)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerTiming {
    /// Wait before pressing.
    pub press: DelayRange,
    /// Hold time between press and release.
    pub release: DelayRange,
    pub cooldown: DelayRange,
}

impl Default for TriggerTiming {
    fn default() -> Self {
        Self {
            press: DelayRange::fixed(0),
            release: DelayRange::fixed(50),
            cooldown: DelayRange::fixed(100),
        }
    }
}

impl TriggerTiming {
    pub fn validate(&self) -> Result<()> {
        self.press
            .validate()
            .map_err(|e| anyhow!("press delay: {}", e))?;
        self.release
            .validate()
            .map_err(|e| anyhow!("release delay: {}", e))?;
        self.cooldown
            .validate()
            .map_err(|e| anyhow!("cooldown: {}", e))?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TriggerPhase {
    Idle,
    Cooling,
}

/// Result of asking the controller to fire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TriggerAttempt {
    /// The action ran to completion.
    Completed,
    /// The action was accepted but the actuator reported an error.
    Failed,
    /// Refused: the cooldown has not elapsed.
    CoolingDown,
    /// Refused: the actuator is not available. Counted as a failure.
    Unavailable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct TriggerStats {
    pub total: u64,
    pub failed: u64,
    /// Percentage of successful actions, 0 to 100.
    pub success_rate: f64,
    pub cooldown_remaining_ms: u64,
}

struct TriggerWindow {
    last_trigger: Option<Instant>,
    timing: TriggerTiming,
}

impl TriggerWindow {
    fn remaining(&self, now: Instant) -> Duration {
        match self.last_trigger {
            Some(at) => self
                .timing
                .cooldown
                .min()
                .saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }
}

pub struct TriggerController {
    window: Mutex<TriggerWindow>,
    exec_lock: Mutex<()>,
    total: AtomicU64,
    failed: AtomicU64,
}

impl TriggerController {
    pub fn new(timing: TriggerTiming) -> Result<Self> {
        timing.validate()?;
        log::info!(
            "TriggerController: press {}, release {}, cooldown {}",
            timing.press,
            timing.release,
            timing.cooldown
        );
        Ok(Self {
            window: Mutex::new(TriggerWindow {
                last_trigger: None,
                timing,
            }),
            exec_lock: Mutex::new(()),
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    fn window(&self) -> std::sync::MutexGuard<'_, TriggerWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn timing(&self) -> TriggerTiming {
        self.window().timing
    }

    /// Replace the timing. Invalid input keeps the current timing.
    pub fn update_timing(&self, timing: TriggerTiming) -> Result<()> {
        timing.validate()?;
        self.window().timing = timing;
        log::info!(
            "trigger timing updated: press {}, release {}, cooldown {}",
            timing.press,
            timing.release,
            timing.cooldown
        );
        Ok(())
    }

    pub fn phase(&self) -> TriggerPhase {
        if self.can_trigger() {
            TriggerPhase::Idle
        } else {
            TriggerPhase::Cooling
        }
    }

    pub fn can_trigger(&self) -> bool {
        self.window().remaining(Instant::now()).is_zero()
    }

    pub fn cooldown_remaining(&self) -> Duration {
        self.window().remaining(Instant::now())
    }

    /// Random cooldown drawn from the configured range. Informational only:
    /// eligibility is always measured against the range minimum.
    pub fn sample_cooldown(&self) -> Duration {
        self.window().timing.cooldown.sample()
    }

    /// Check eligibility and stamp the window in one critical section.
    fn claim(&self, actuator: &dyn Actuator) -> std::result::Result<TriggerTiming, TriggerAttempt> {
        let mut window = self.window();
        let remaining = window.remaining(Instant::now());
        if !remaining.is_zero() {
            log::debug!("trigger blocked by cooldown ({}ms remaining)", remaining.as_millis());
            return Err(TriggerAttempt::CoolingDown);
        }
        if !actuator.is_available() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("trigger skipped: actuator {} not available", actuator.name());
            return Err(TriggerAttempt::Unavailable);
        }
        window.last_trigger = Some(Instant::now());
        Ok(window.timing)
    }

    /// Run the action on the calling thread if the cooldown allows.
    pub fn attempt(&self, actuator: &dyn Actuator) -> TriggerAttempt {
        match self.claim(actuator) {
            Ok(timing) if self.perform(actuator, &timing) => TriggerAttempt::Completed,
            Ok(_) => TriggerAttempt::Failed,
            Err(refused) => refused,
        }
    }

    /// `attempt`, reduced to whether an action ran to completion.
    pub fn try_trigger(&self, actuator: &dyn Actuator) -> bool {
        self.attempt(actuator) == TriggerAttempt::Completed
    }

    /// Same eligibility rules as `attempt`, but the action runs on a spawned
    /// thread. The window is stamped before this returns.
    pub fn try_trigger_detached(
        self: &Arc<Self>,
        actuator: Arc<dyn Actuator>,
    ) -> std::result::Result<JoinHandle<bool>, TriggerAttempt> {
        let timing = self.claim(actuator.as_ref())?;
        let controller = Arc::clone(self);
        std::thread::Builder::new()
            .name("trigger-action".into())
            .spawn(move || controller.perform(actuator.as_ref(), &timing))
            .map_err(|err| {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("failed to spawn trigger action thread: {}", err);
                TriggerAttempt::Failed
            })
    }

    fn perform(&self, actuator: &dyn Actuator, timing: &TriggerTiming) -> bool {
        let _exec = self.exec_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match run_action(actuator, timing) {
            Ok(()) => {
                self.total.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("trigger action failed: {:#}", err);
                false
            }
        }
    }

    /// Run one action ignoring the cooldown. Statistics are not touched.
    pub fn test_action(&self, actuator: &dyn Actuator) -> Result<()> {
        if !actuator.is_available() {
            return Err(anyhow!("actuator {} not available", actuator.name()));
        }
        let timing = self.timing();
        let _exec = self.exec_lock.lock().unwrap_or_else(PoisonError::into_inner);
        log::info!(
            "test action on {} (press {}, release {})",
            actuator.name(),
            timing.press,
            timing.release
        );
        run_action(actuator, &timing)
    }

    pub fn stats(&self) -> TriggerStats {
        let total = self.total.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        TriggerStats {
            total,
            failed,
            success_rate: total as f64 / (total + failed).max(1) as f64 * 100.0,
            cooldown_remaining_ms: self.cooldown_remaining().as_millis() as u64,
        }
    }

    pub fn reset_stats(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        log::info!("trigger statistics reset");
    }

    /// Forget the last trigger, returning the controller to `Idle`.
    pub fn reset(&self) {
        self.window().last_trigger = None;
    }
}

fn run_action(actuator: &dyn Actuator, timing: &TriggerTiming) -> Result<()> {
    let press_delay = timing.press.sample();
    let hold = timing.release.sample();

    if !press_delay.is_zero() {
        std::thread::sleep(press_delay);
    }
    actuator.press()?;
    log::debug!("pressed after {}ms", press_delay.as_millis());

    if !hold.is_zero() {
        std::thread::sleep(hold);
    }
    actuator.release()?;
    log::debug!("released after {}ms hold", hold.as_millis());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(cooldown_ms: u64) -> TriggerTiming {
        TriggerTiming {
            press: DelayRange::fixed(0),
            release: DelayRange::fixed(0),
            cooldown: DelayRange::fixed(cooldown_ms),
        }
    }

    struct Unavailable;

    impl Actuator for Unavailable {
        fn name(&self) -> &str {
            "unavailable"
        }
        fn is_available(&self) -> bool {
            false
        }
        fn press(&self) -> Result<()> {
            Ok(())
        }
        fn release(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FailsOnRelease;

    impl Actuator for FailsOnRelease {
        fn name(&self) -> &str {
            "flaky"
        }
        fn is_available(&self) -> bool {
            true
        }
        fn press(&self) -> Result<()> {
            Ok(())
        }
        fn release(&self) -> Result<()> {
            Err(anyhow!("release lost"))
        }
    }

    #[test]
    fn delay_range_rejects_inverted_bounds() {
        assert!(DelayRange::new(10, 5).is_err());
        assert!(DelayRange::new(0, MAX_DELAY_MS + 1).is_err());
        assert!(DelayRange::new(5, 10).is_ok());
    }

    #[test]
    fn sampled_delay_stays_in_range() {
        let range = DelayRange::new(3, 9).unwrap();
        for _ in 0..200 {
            let ms = range.sample().as_millis() as u64;
            assert!((3..=9).contains(&ms));
        }
        assert_eq!(DelayRange::fixed(7).sample(), Duration::from_millis(7));
    }

    #[test]
    fn cooldown_blocks_then_releases() {
        let controller = TriggerController::new(timing(60)).unwrap();
        let actuator = LogActuator::new();
        assert!(controller.can_trigger());
        assert!(controller.try_trigger(&actuator));
        assert!(!controller.can_trigger());
        assert_eq!(controller.phase(), TriggerPhase::Cooling);
        assert!(!controller.try_trigger(&actuator));

        std::thread::sleep(Duration::from_millis(80));
        assert!(controller.can_trigger());
        assert!(controller.try_trigger(&actuator));
        assert_eq!(actuator.presses(), 2);
    }

    #[test]
    fn unavailable_actuator_counts_failure_without_stamp() {
        let controller = TriggerController::new(timing(1000)).unwrap();
        assert_eq!(controller.attempt(&Unavailable), TriggerAttempt::Unavailable);
        assert!(controller.can_trigger());
        assert_eq!(controller.stats().failed, 1);
        assert_eq!(controller.stats().total, 0);
    }

    #[test]
    fn failed_action_is_counted_and_cooldown_still_applies() {
        let controller = TriggerController::new(timing(1000)).unwrap();
        assert_eq!(controller.attempt(&FailsOnRelease), TriggerAttempt::Failed);
        assert!(!controller.can_trigger());
        let stats = controller.stats();
        assert_eq!((stats.total, stats.failed), (0, 1));
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn test_action_ignores_cooldown_and_stats() {
        let controller = TriggerController::new(timing(10_000)).unwrap();
        let actuator = LogActuator::new();
        assert!(controller.try_trigger(&actuator));
        controller.test_action(&actuator).unwrap();
        assert_eq!(actuator.presses(), 2);
        assert_eq!(controller.stats().total, 1);
        assert!(controller.test_action(&Unavailable).is_err());
    }

    #[test]
    fn detached_trigger_stamps_before_returning() {
        let controller = Arc::new(TriggerController::new(timing(10_000)).unwrap());
        let actuator: Arc<dyn Actuator> = Arc::new(LogActuator::new());
        let handle = controller.try_trigger_detached(actuator.clone()).unwrap();
        assert_eq!(
            controller.try_trigger_detached(actuator).err(),
            Some(TriggerAttempt::CoolingDown)
        );
        assert!(handle.join().unwrap());
        assert_eq!(controller.stats().total, 1);
    }

    #[test]
    fn reset_returns_to_idle() {
        let controller = TriggerController::new(timing(10_000)).unwrap();
        controller.try_trigger(&LogActuator::new());
        assert!(controller.cooldown_remaining() > Duration::ZERO);
        controller.reset();
        assert_eq!(controller.phase(), TriggerPhase::Idle);
    }

    #[test]
    fn invalid_timing_update_keeps_previous() {
        let controller = TriggerController::new(timing(100)).unwrap();
        let bad = TriggerTiming {
            cooldown: DelayRange { min_ms: 200, max_ms: 100 },
            ..timing(100)
        };
        assert!(controller.update_timing(bad).is_err());
        assert_eq!(controller.timing(), timing(100));
    }

    #[test]
    fn stats_report_success_rate() {
        let controller = TriggerController::new(timing(0)).unwrap();
        let actuator = LogActuator::new();
        for _ in 0..3 {
            assert!(controller.try_trigger(&actuator));
        }
        controller.try_trigger(&Unavailable);
        let stats = controller.stats();
        assert_eq!(stats.success_rate, 75.0);
        controller.reset_stats();
        assert_eq!(controller.stats().total, 0);
    }
}
