/// Steps a layer asks its simulation for in one frame.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct StepPlan {
    /// Signed seconds per step; negative runs time backwards.
    pub time_step_s: f64,
    pub steps: u32,
}

impl StepPlan {
    pub fn covers_s(&self) -> f64 {
        self.time_step_s * f64::from(self.steps)
    }
}

/// Splits the gap to a target time into equal steps no longer than
/// `max_step_s`.
///
/// When the gap needs more than `max_steps`, the plan takes `max_steps`
/// full-length steps and leaves the rest for later frames.
pub fn catch_up(gap_s: f64, max_step_s: f64, max_steps: u32) -> Option<StepPlan> {
    if gap_s == 0.0 || !gap_s.is_finite() || max_step_s <= 0.0 || max_steps == 0 {
        return None;
    }
    let needed = (gap_s / max_step_s).abs().ceil();
    if needed <= f64::from(max_steps) {
        let steps = needed as u32;
        Some(StepPlan {
            time_step_s: gap_s / f64::from(steps),
            steps,
        })
    } else {
        Some(StepPlan {
            time_step_s: max_step_s.copysign(gap_s),
            steps: max_steps,
        })
    }
}

/// Whole fixed-size steps that fit in the gap, at most `max_steps`.
///
/// A remainder shorter than one step waits until the gap grows.
pub fn fixed_steps(gap_s: f64, step_s: f64, max_steps: u32) -> Option<StepPlan> {
    if gap_s == 0.0 || !gap_s.is_finite() || step_s <= 0.0 {
        return None;
    }
    let whole = (gap_s / step_s).abs().floor();
    let steps = (whole as u64).min(u64::from(max_steps)) as u32;
    (steps > 0).then(|| StepPlan {
        time_step_s: step_s.copysign(gap_s),
        steps,
    })
}
