/// Host frame metadata handed to per-frame callbacks.
///
/// Hosts drive frames at whatever rate they render; `dt_s` is the real time
/// since the previous frame, not a fixed tick.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Frame {
    /// 0-based frame index.
    pub index: u64,
    /// Real seconds since the previous frame.
    pub dt_s: f64,
    /// Real seconds since the first frame.
    pub elapsed_s: f64,
}

impl Frame {
    pub fn first() -> Self {
        Self {
            index: 0,
            dt_s: 0.0,
            elapsed_s: 0.0,
        }
    }

    pub fn next(self, dt_s: f64) -> Self {
        let dt_s = dt_s.max(0.0);
        Self {
            index: self.index + 1,
            dt_s,
            elapsed_s: self.elapsed_s + dt_s,
        }
    }
}
