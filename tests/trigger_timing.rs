use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use chroma_trigger::{Actuator, DelayRange, TriggerAttempt, TriggerController, TriggerTiming};

/// Records press/release instants and the peak number of overlapping actions.
#[derive(Default)]
struct Recorder {
    presses: Mutex<Vec<Instant>>,
    releases: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    unplugged: AtomicBool,
    fail_press: AtomicBool,
}

impl Recorder {
    fn press_count(&self) -> usize {
        self.presses.lock().unwrap().len()
    }
}

impl Actuator for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn is_available(&self) -> bool {
        !self.unplugged.load(Ordering::SeqCst)
    }

    fn press(&self) -> Result<()> {
        if self.fail_press.load(Ordering::SeqCst) {
            return Err(anyhow!("press rejected"));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.presses.lock().unwrap().push(Instant::now());
        Ok(())
    }

    fn release(&self) -> Result<()> {
        self.releases.lock().unwrap().push(Instant::now());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn timing(press: u64, release: (u64, u64), cooldown: u64) -> TriggerTiming {
    TriggerTiming {
        press: DelayRange::fixed(press),
        release: DelayRange::new(release.0, release.1).unwrap(),
        cooldown: DelayRange::fixed(cooldown),
    }
}

#[test]
fn racing_callers_fire_once_inside_cooldown() {
    let controller = Arc::new(TriggerController::new(timing(0, (5, 5), 10_000)).unwrap());
    let recorder = Arc::new(Recorder::default());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let controller = controller.clone();
            let recorder = recorder.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                controller.try_trigger(recorder.as_ref())
            })
        })
        .collect();
    let fired = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|fired| *fired)
        .count();

    assert_eq!(fired, 1);
    assert_eq!(recorder.press_count(), 1);
    assert_eq!(controller.stats().total, 1);
    assert_eq!(controller.stats().failed, 0);
    assert!(!controller.can_trigger());
}

#[test]
fn actions_never_overlap_without_cooldown() {
    let controller = Arc::new(TriggerController::new(timing(0, (5, 5), 0)).unwrap());
    let recorder = Arc::new(Recorder::default());

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let controller = controller.clone();
            let recorder = recorder.clone();
            thread::spawn(move || {
                for _ in 0..3 {
                    controller.try_trigger(recorder.as_ref());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(recorder.press_count(), 18);
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
}

#[test]
fn detached_actions_are_single_flight() {
    let controller = Arc::new(TriggerController::new(timing(0, (10, 10), 0)).unwrap());
    let recorder = Arc::new(Recorder::default());

    let handles: Vec<_> = (0..5)
        .filter_map(|_| {
            controller
                .try_trigger_detached(recorder.clone() as Arc<dyn Actuator>)
                .ok()
        })
        .collect();
    assert_eq!(handles.len(), 5);
    for handle in handles {
        assert!(handle.join().unwrap());
    }
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
    assert_eq!(controller.stats().total, 5);
}

#[test]
fn cooldown_expires_after_minimum() {
    let controller = TriggerController::new(timing(0, (0, 0), 60)).unwrap();
    let recorder = Recorder::default();

    assert_eq!(controller.attempt(&recorder), TriggerAttempt::Completed);
    assert_eq!(controller.attempt(&recorder), TriggerAttempt::CoolingDown);
    assert!(controller.cooldown_remaining() <= Duration::from_millis(60));

    thread::sleep(Duration::from_millis(80));
    assert!(controller.can_trigger());
    assert_eq!(controller.attempt(&recorder), TriggerAttempt::Completed);
    assert_eq!(recorder.press_count(), 2);
}

#[test]
fn hold_duration_stays_inside_release_range() {
    let controller = TriggerController::new(timing(0, (20, 40), 0)).unwrap();
    let recorder = Recorder::default();

    for _ in 0..4 {
        assert!(controller.try_trigger(&recorder));
    }
    let presses = recorder.presses.lock().unwrap();
    let releases = recorder.releases.lock().unwrap();
    for (pressed, released) in presses.iter().zip(releases.iter()) {
        let held = released.duration_since(*pressed);
        assert!(held >= Duration::from_millis(20), "held {:?}", held);
        assert!(held < Duration::from_millis(200), "held {:?}", held);
    }
}

#[test]
fn unavailable_and_failed_actions_count_as_failures() {
    let controller = TriggerController::new(timing(0, (0, 0), 0)).unwrap();
    let recorder = Recorder::default();

    recorder.unplugged.store(true, Ordering::SeqCst);
    assert_eq!(controller.attempt(&recorder), TriggerAttempt::Unavailable);
    recorder.unplugged.store(false, Ordering::SeqCst);

    recorder.fail_press.store(true, Ordering::SeqCst);
    assert_eq!(controller.attempt(&recorder), TriggerAttempt::Failed);
    recorder.fail_press.store(false, Ordering::SeqCst);

    assert_eq!(controller.attempt(&recorder), TriggerAttempt::Completed);
    let stats = controller.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.failed, 2);
    assert!((stats.success_rate - 100.0 / 3.0).abs() < 0.01);
}

#[test]
fn test_action_ignores_cooldown_and_stats() {
    let controller = TriggerController::new(timing(0, (0, 0), 10_000)).unwrap();
    let recorder = Recorder::default();

    assert!(controller.try_trigger(&recorder));
    controller.test_action(&recorder).unwrap();
    assert_eq!(recorder.press_count(), 2);
    assert_eq!(controller.stats().total, 1);

    recorder.unplugged.store(true, Ordering::SeqCst);
    assert!(controller.test_action(&recorder).is_err());
}

#[test]
fn sampled_cooldown_stays_in_range_but_minimum_gates() {
    let controller = TriggerController::new(TriggerTiming {
        press: DelayRange::fixed(0),
        release: DelayRange::fixed(0),
        cooldown: DelayRange::new(100, 200).unwrap(),
    })
    .unwrap();
    for _ in 0..50 {
        let sampled = controller.sample_cooldown();
        assert!(sampled >= Duration::from_millis(100) && sampled <= Duration::from_millis(200));
    }

    let recorder = Recorder::default();
    assert!(controller.try_trigger(&recorder));
    assert!(controller.cooldown_remaining() <= Duration::from_millis(100));
}
