//! Replication factor controller
//!
//! A small PID loop turns memory usage into a replication factor.
//! The gains are tunables, not derived from first principles; they
//! follow the values the system was run with in production.

use std::collections::VecDeque;

pub const PID_KP: f64 = 0.3;
pub const PID_KI: f64 = 0.05;
pub const PID_KD: f64 = 0.05;

/// Bound on the error history driving the integral term
pub const PID_HISTORY: usize = 10;

/// Custom error function: `(used_memory, memory_limit) -> error`
pub type ErrorFn = Box<dyn Fn(u64, u64) -> f64 + Send + Sync>;

/// Adjusts the local replication factor from memory usage, ring
/// participation and peer count
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,

    memory_limit: u64,

    /// Fill level of the memory budget the controller steers towards
    target_occupancy: f64,

    history: VecDeque<f64>,

    error_fn: Option<ErrorFn>,
}

impl PidController {
    pub fn new(memory_limit: u64) -> PidController {
        PidController {
            kp: PID_KP,
            ki: PID_KI,
            kd: PID_KD,
            memory_limit,
            target_occupancy: 1.0,
            history: VecDeque::new(),
            error_fn: None,
        }
    }

    pub fn with_gains(mut self, kp: f64, ki: f64, kd: f64) -> PidController {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
        self
    }

    pub fn with_error_fn(mut self, error_fn: ErrorFn) -> PidController {
        self.error_fn = Some(error_fn);
        self
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    /// One controller step, returns the new factor in [0, 1]
    ///
    /// Memory above the budget pushes the factor down; an uncovered
    /// ring pulls it up, split across the participating peers.
    pub fn tick(
        &mut self,
        used_memory: u64,
        current_factor: f64,
        total_participation: f64,
        peer_count: usize,
    ) -> f64 {
        let error = match &self.error_fn {
            Some(f) => f(used_memory, self.memory_limit),
            None => used_memory as f64 / self.memory_limit as f64 - self.target_occupancy,
        };

        let previous = self.history.back().copied().unwrap_or(error);
        if self.history.len() == PID_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(error);

        let integral: f64 = self.history.iter().sum();
        let derivative = error - previous;

        let uncovered = (1.0 - total_participation).max(0.0) / peer_count.max(1) as f64;

        let factor = current_factor - self.kp * error - self.ki * integral - self.kd * derivative
            + uncovered;
        factor.clamp(0.0, 1.0)
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod test {
    use crate::pid::*;

    #[test]
    pub fn test_pressure_lowers_factor() {
        let mut pid = PidController::new(1_000);
        let mut factor = 1.0;
        for _ in 0..10 {
            factor = pid.tick(4_000, factor, 3.0, 3);
        }
        assert!(factor < 0.5);
        assert!(factor >= 0.0);
    }

    #[test]
    pub fn test_uncovered_ring_raises_factor() {
        let mut pid = PidController::new(1_000_000);
        let mut factor = 0.1;
        for _ in 0..10 {
            factor = pid.tick(0, factor, 0.2, 2);
        }
        assert!(factor > 0.1);
        assert!(factor <= 1.0);
    }

    #[test]
    pub fn test_output_stays_bounded() {
        let mut pid = PidController::new(10);
        let factor = pid.tick(u32::MAX as u64, 0.5, 1.0, 1);
        assert_eq!(factor, 0.0);

        let mut pid = PidController::new(u64::MAX);
        let factor = pid.tick(0, 0.9, 0.0, 1);
        assert_eq!(factor, 1.0);
    }

    #[test]
    pub fn test_history_bounded() {
        let mut pid = PidController::new(1_000);
        for _ in 0..50 {
            pid.tick(1_000, 0.5, 1.0, 1);
        }
        assert!(pid.history.len() <= PID_HISTORY);
    }

    #[test]
    pub fn test_custom_error_fn() {
        let mut pid =
            PidController::new(1_000).with_error_fn(Box::new(|_used, _limit| -1.0));
        let factor = pid.tick(u64::MAX, 0.5, 1.0, 1);
        // a negative error always grows the factor
        assert!(factor > 0.5);
    }
}
