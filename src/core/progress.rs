//! Step-weighted progress arithmetic.
//!
//! Overall job progress is the sum of the weights of fully completed steps
//! plus the current step's fraction of its own weight. The in-step estimate
//! is derived from output volume and never claims completion before the
//! process has exited.

/// Tolerance when checking that weights sum to one.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Highest in-step percentage reported while the process is still running.
pub const MAX_RUNNING_STEP_PERCENT: u8 = 99;

/// True if `weights` has one entry per step, each in (0, 1], summing to ~1.
pub fn weights_are_valid(weights: &[f64], steps: usize) -> bool {
    if steps == 0 || weights.len() != steps {
        return false;
    }
    if weights.iter().any(|w| !w.is_finite() || *w <= 0.0 || *w > 1.0) {
        return false;
    }
    (weights.iter().sum::<f64>() - 1.0).abs() <= WEIGHT_TOLERANCE
}

pub fn uniform_weights(steps: usize) -> Vec<f64> {
    if steps == 0 {
        return Vec::new();
    }
    vec![1.0 / steps as f64; steps]
}

/// Resolve per-step weights from a plan. Any missing or out-of-range weight,
/// or a total that is not ~1.0, falls back to a uniform split.
pub fn normalize_weights(raw: &[Option<f64>]) -> Vec<f64> {
    let explicit: Option<Vec<f64>> = raw.iter().copied().collect();
    match explicit {
        Some(weights) if weights_are_valid(&weights, raw.len()) => weights,
        _ => uniform_weights(raw.len()),
    }
}

/// Integer overall progress for the given state.
///
/// `completed` flags and `weights` are parallel. `current` is the step
/// in flight (ignored if it is already completed or out of range).
pub fn overall_percent(weights: &[f64], completed: &[bool], current: usize, step_percent: u8) -> u8 {
    let done: f64 = weights
        .iter()
        .zip(completed)
        .filter(|(_, done)| **done)
        .map(|(w, _)| *w)
        .sum();

    let in_flight = match (weights.get(current), completed.get(current)) {
        (Some(w), Some(false)) => f64::from(step_percent.min(100)) / 100.0 * w,
        _ => 0.0,
    };

    ((done + in_flight) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Heuristic in-step progress from the number of output lines seen.
///
/// The curve is `99 * n / (n + half_way)`: about 50% after `half_way` lines,
/// approaching but never reaching 99 while the step runs.
#[derive(Debug, Clone)]
pub struct StepEstimator {
    half_way_lines: u64,
    lines: u64,
    percent: u8,
}

impl StepEstimator {
    pub fn new(half_way_lines: u32) -> Self {
        Self {
            half_way_lines: u64::from(half_way_lines.max(1)),
            lines: 0,
            percent: 0,
        }
    }

    /// Account for one more output line. Returns the new percentage if it
    /// moved, so callers only publish real changes.
    pub fn observe_line(&mut self) -> Option<u8> {
        self.lines += 1;
        let estimate = (u64::from(MAX_RUNNING_STEP_PERCENT) * self.lines)
            / (self.lines + self.half_way_lines);
        let estimate = estimate.min(u64::from(MAX_RUNNING_STEP_PERCENT)) as u8;

        if estimate > self.percent {
            self.percent = estimate;
            Some(estimate)
        } else {
            None
        }
    }
}
