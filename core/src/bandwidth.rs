//! Bandwidth Controller (spec §4.D): mediates all capture admission,
//! caps concurrent in-flight captures, enforces inter-capture spacing, and
//! runs the adaptive concurrency-limit search. A single `Mutex` guards the
//! concurrency-limit/phase/per-camera counters together; it is held only
//! across state mutations, never across device calls or sleeps, per spec
//! §5's shared-resource discipline. `await_slot`'s 5ms poll is implemented
//! as a `Condvar::wait_timeout` woken early by `on_end`, the refinement
//! spec §9 explicitly endorses.

use crate::error::PipelineError;
use crate::types::{BandwidthPriority, CameraHealth};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

pub const MIN_INTER_CAPTURE: Duration = Duration::from_millis(150);
pub const THROTTLE_DELAY: Duration = Duration::from_millis(250);
pub const PRIORITY_HOLDOFF: Duration = Duration::from_millis(80);
pub const AWAIT_SLOT_SAFETY_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_GRANULARITY: Duration = Duration::from_millis(5);

/// Adaptive concurrency-limit search phase (spec §4.D.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Baseline,
    Scaling,
    Optimized,
}

struct BandwidthState {
    concurrency_limit: u32,
    n_cameras: u32,
    active_captures: u32,
    global_last_capture: Option<Instant>,
    /// Shared by the throttle-clearing rule (§4.D.2) and the adaptive
    /// search's "N consecutive successes" triggers (§4.D.3); both reset on
    /// any failure and increment on any success, so spec.md's single
    /// mention of "consecutive successes" is modeled as one counter.
    global_consecutive_successes: u32,
    phase: Phase,
    window_successes: u32,
    window_total: u32,
    cameras: HashMap<String, CameraHealth>,
}

impl BandwidthState {
    fn health_mut(&mut self, serial: &str) -> &mut CameraHealth {
        self.cameras.entry(serial.to_string()).or_default()
    }
}

/// Process-wide admission gate for capture scheduling.
pub struct BandwidthController {
    state: Mutex<BandwidthState>,
    changed: Condvar,
}

impl BandwidthController {
    pub fn new(n_cameras: u32) -> Self {
        Self {
            state: Mutex::new(BandwidthState {
                concurrency_limit: 2,
                n_cameras: n_cameras.max(1),
                active_captures: 0,
                global_last_capture: None,
                global_consecutive_successes: 0,
                phase: Phase::Baseline,
                window_successes: 0,
                window_total: 0,
                cameras: HashMap::new(),
            }),
            changed: Condvar::new(),
        }
    }

    fn may_start_locked(state: &BandwidthState, serial: &str, now: Instant) -> bool {
        if state.active_captures >= state.concurrency_limit {
            return false;
        }
        if let Some(last) = state.global_last_capture {
            if now.duration_since(last) < MIN_INTER_CAPTURE {
                return false;
            }
        }
        let Some(health) = state.cameras.get(serial) else {
            return true;
        };
        if let Some(last) = health.last_capture_instant {
            if health.needs_throttling && now.duration_since(last) < THROTTLE_DELAY {
                return false;
            }
            if health.bandwidth_priority > BandwidthPriority::Normal
                && now.duration_since(last) < PRIORITY_HOLDOFF
            {
                return false;
            }
            if health.had_recent_black_image && now.duration_since(last) < 2 * MIN_INTER_CAPTURE {
                return false;
            }
        }
        true
    }

    /// Non-blocking admission test (spec §4.D.1).
    pub fn may_start(&self, serial: &str) -> bool {
        let state = self.state.lock().expect("bandwidth state poisoned");
        Self::may_start_locked(&state, serial, Instant::now())
    }

    /// Block (poll at 5ms granularity, woken early on `on_end`) until
    /// `may_start` is true or the 5s safety timeout fires.
    pub fn await_slot(&self, serial: &str) -> Result<(), PipelineError> {
        let start = Instant::now();
        let mut guard = self.state.lock().expect("bandwidth state poisoned");
        loop {
            if Self::may_start_locked(&guard, serial, Instant::now()) {
                return Ok(());
            }
            if start.elapsed() >= AWAIT_SLOT_SAFETY_TIMEOUT {
                warn!(camera = serial, "await_slot exceeded its 5s safety timeout");
                return Err(PipelineError::AdmissionTimeout);
            }
            let (next_guard, _) = self
                .changed
                .wait_timeout(guard, POLL_GRANULARITY)
                .expect("bandwidth state poisoned");
            guard = next_guard;
        }
    }

    /// Increment active count and stamp timestamps (spec §4.D).
    pub fn on_start(&self, serial: &str) {
        let mut state = self.state.lock().expect("bandwidth state poisoned");
        let now = Instant::now();
        state.active_captures += 1;
        state.global_last_capture = Some(now);
        state.health_mut(serial).last_capture_instant = Some(now);
    }

    /// Decrement active count, update the rolling average and failure/
    /// priority state, and possibly adjust the concurrency limit (spec
    /// §4.D, §4.D.2, §4.D.3).
    pub fn on_end(&self, serial: &str, success: bool, elapsed_ms: u64) {
        let mut state = self.state.lock().expect("bandwidth state poisoned");
        state.active_captures = state.active_captures.saturating_sub(1);

        {
            let health = state.health_mut(serial);
            const EMA_WEIGHT: f64 = 0.3;
            health.rolling_average_capture_ms = if health.rolling_average_capture_ms == 0.0 {
                elapsed_ms as f64
            } else {
                EMA_WEIGHT * elapsed_ms as f64 + (1.0 - EMA_WEIGHT) * health.rolling_average_capture_ms
            };
        }

        if success {
            let health = state.health_mut(serial);
            if health.consecutive_bandwidth_failures > 0 {
                health.consecutive_bandwidth_failures -= 1;
            }
            state.global_consecutive_successes += 1;
            let health = state.health_mut(serial);
            if health.consecutive_bandwidth_failures == 0 && state.global_consecutive_successes >= 3 {
                health.needs_throttling = false;
                health.bandwidth_priority = health.bandwidth_priority.lower();
            }
        } else {
            let health = state.health_mut(serial);
            health.consecutive_bandwidth_failures += 1;
            if health.consecutive_bandwidth_failures >= 1 {
                health.needs_throttling = true;
                health.bandwidth_priority = health.bandwidth_priority.raise();
            }
            state.global_consecutive_successes = 0;
        }

        state.window_total += 1;
        if success {
            state.window_successes += 1;
        }
        Self::maybe_adjust_concurrency(&mut state);

        self.changed.notify_all();
    }

    /// Baseline's "8 consecutive successes" trigger is evaluated on every
    /// completed capture, not gated behind the 5-capture window below: a
    /// window reset can otherwise land the 8th consecutive success mid-
    /// window, and spec §8 Scenario 6 requires the Baseline -> Scaling
    /// transition to fire exactly at the 8th success regardless of where
    /// that falls relative to the window boundary. Scaling's and
    /// Optimized's rate-based rules stay on the 5-capture cadence spec §9
    /// selects between the two the source exhibits.
    fn maybe_adjust_concurrency(state: &mut BandwidthState) {
        let consecutive = state.global_consecutive_successes;

        if state.phase == Phase::Baseline {
            if consecutive >= 8 {
                state.phase = Phase::Scaling;
            }
            if state.window_total < 5 {
                return;
            }
            state.window_successes = 0;
            state.window_total = 0;
            return;
        }

        if state.window_total < 5 {
            return;
        }
        let rate = state.window_successes as f64 / state.window_total as f64;

        match state.phase {
            Phase::Baseline => unreachable!("handled above"),
            Phase::Scaling => {
                if rate >= 0.99 && consecutive >= 4 {
                    state.concurrency_limit = (state.concurrency_limit + 1).min(state.n_cameras);
                    state.global_consecutive_successes = 0;
                } else if rate < 0.98 {
                    state.concurrency_limit = state.concurrency_limit.saturating_sub(1).max(2);
                    state.phase = Phase::Optimized;
                }
            }
            Phase::Optimized => {
                if rate < 1.0 {
                    state.concurrency_limit = state.concurrency_limit.saturating_sub(1).max(1);
                } else if consecutive >= 20 {
                    state.concurrency_limit = (state.concurrency_limit + 1).min(state.n_cameras);
                }
            }
        }
        state.concurrency_limit = state.concurrency_limit.clamp(1, state.n_cameras);
        state.window_successes = 0;
        state.window_total = 0;
    }

    /// Mark a dark-image detection against `serial` (spec §3
    /// `had_recent_black_image`/`black_image_count`).
    pub fn mark_dark_image(&self, serial: &str) {
        let mut state = self.state.lock().expect("bandwidth state poisoned");
        let health = state.health_mut(serial);
        health.black_image_count += 1;
        health.had_recent_black_image = true;
    }

    /// Clear the dark-image cooldown after a successful, non-dark capture.
    pub fn clear_dark_flag(&self, serial: &str) {
        let mut state = self.state.lock().expect("bandwidth state poisoned");
        state.health_mut(serial).had_recent_black_image = false;
    }

    /// Force a camera into throttled/critical state (used by the pipeline
    /// and retry engine on WAIT exhaustion and dark-image exhaustion, spec
    /// §4.E/§4.F).
    pub fn escalate(&self, serial: &str) {
        let mut state = self.state.lock().expect("bandwidth state poisoned");
        let health = state.health_mut(serial);
        health.needs_throttling = true;
        health.bandwidth_priority = BandwidthPriority::Critical;
    }

    /// Reset per-camera bandwidth flags without changing the adaptive
    /// search phase (spec §4.D.3 `reset_stats`).
    pub fn reset_stats(&self) {
        let mut state = self.state.lock().expect("bandwidth state poisoned");
        for health in state.cameras.values_mut() {
            health.needs_throttling = false;
            health.consecutive_bandwidth_failures = 0;
            health.bandwidth_priority = BandwidthPriority::Normal;
            health.had_recent_black_image = false;
        }
    }

    pub fn is_throttled(&self, serial: &str) -> bool {
        let state = self.state.lock().expect("bandwidth state poisoned");
        state.cameras.get(serial).map(|h| h.needs_throttling).unwrap_or(false)
    }

    pub fn bandwidth_priority(&self, serial: &str) -> BandwidthPriority {
        let state = self.state.lock().expect("bandwidth state poisoned");
        state
            .cameras
            .get(serial)
            .map(|h| h.bandwidth_priority)
            .unwrap_or(BandwidthPriority::Normal)
    }

    pub fn consecutive_bandwidth_failures(&self, serial: &str) -> u32 {
        let state = self.state.lock().expect("bandwidth state poisoned");
        state.cameras.get(serial).map(|h| h.consecutive_bandwidth_failures).unwrap_or(0)
    }

    pub fn concurrency_limit(&self) -> u32 {
        self.state.lock().expect("bandwidth state poisoned").concurrency_limit
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().expect("bandwidth state poisoned").phase
    }

    pub fn active_captures(&self) -> u32 {
        self.state.lock().expect("bandwidth state poisoned").active_captures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_captures_never_exceeds_concurrency_limit() {
        let controller = BandwidthController::new(4);
        assert!(controller.may_start("A"));
        controller.on_start("A");
        assert!(controller.may_start("B"));
        controller.on_start("B");
        // limit starts at 2; a third camera must not be admitted.
        assert!(!controller.may_start("C"));
    }

    #[test]
    fn consecutive_bandwidth_failures_never_goes_negative() {
        let controller = BandwidthController::new(4);
        controller.on_start("A");
        controller.on_end("A", true, 10);
        assert_eq!(controller.consecutive_bandwidth_failures("A"), 0);
    }

    #[test]
    fn bandwidth_priority_stays_in_bounds() {
        let controller = BandwidthController::new(4);
        for _ in 0..10 {
            controller.on_start("A");
            controller.on_end("A", false, 10);
        }
        assert_eq!(controller.bandwidth_priority("A"), BandwidthPriority::Critical);
    }

    #[test]
    fn admission_respects_throttle_cooldown() {
        let controller = BandwidthController::new(4);
        controller.on_start("A");
        controller.on_end("A", false, 10); // flips needs_throttling

        // Simulate "100ms ago" by checking against the real clock is awkward
        // in a unit test; instead verify the immediately-after-failure state
        // is throttled (last_capture_instant == now), which must fail
        // admission until THROTTLE_DELAY elapses.
        assert!(!controller.may_start("A"));
        std::thread::sleep(THROTTLE_DELAY + Duration::from_millis(20));
        assert!(controller.may_start("A"));
    }

    #[test]
    fn phase_transitions_from_baseline_to_scaling() {
        let controller = BandwidthController::new(4);
        for _ in 0..8 {
            controller.on_start("A");
            controller.on_end("A", true, 10);
            std::thread::sleep(MIN_INTER_CAPTURE);
        }
        assert_eq!(controller.phase(), Phase::Scaling);
    }
}
