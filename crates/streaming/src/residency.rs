use foundation::time::{RING_SIZE, TimeKey, bracket, ring_index};
use futures::future::{LocalBoxFuture, Shared};

use crate::error::SnapshotError;

/// Completion signal of a slot's in-flight reprojection.
pub type BusySignal = Shared<LocalBoxFuture<'static, ()>>;

/// Lifecycle of one ring slot: `Busy → Valid | Failed`.
#[derive(Clone)]
pub enum SlotStatus {
    Busy(BusySignal),
    Valid,
    Failed(SnapshotError),
}

impl std::fmt::Debug for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotStatus::Busy(_) => write!(f, "Busy"),
            SlotStatus::Valid => write!(f, "Valid"),
            SlotStatus::Failed(e) => write!(f, "Failed({e})"),
        }
    }
}

/// The key a ring slot is assigned to, plus the generation that claimed it.
///
/// Every claim takes a fresh generation. Async work captures the generation
/// it was started under and may only commit while the slot still carries it.
#[derive(Debug, Clone)]
pub struct BufferState {
    pub key: TimeKey,
    pub generation: u64,
    pub status: SlotStatus,
}

impl BufferState {
    pub fn is_valid(&self) -> bool {
        matches!(self.status, SlotStatus::Valid)
    }

    pub fn error(&self) -> Option<&SnapshotError> {
        match &self.status {
            SlotStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Readiness of the two slots bracketing a time.
pub enum Readiness {
    Ready { tex_0: usize, tex_1: usize, mix: f64 },
    Busy(BusySignal),
    Failed,
}

#[derive(Debug, Default)]
pub struct Ring {
    slots: [Option<BufferState>; RING_SIZE],
    next_generation: u64,
}

impl Ring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, key: TimeKey) -> Option<&BufferState> {
        self.slots[ring_index(key)].as_ref()
    }

    /// The slot if it currently holds `key`.
    pub fn holding(&self, key: TimeKey) -> Option<&BufferState> {
        self.slot(key).filter(|s| s.key == key)
    }

    pub fn keys(&self) -> Vec<TimeKey> {
        self.slots.iter().flatten().map(|s| s.key).collect()
    }

    /// Reassigns the slot for `key`, invalidating whatever held it.
    pub fn claim(&mut self, key: TimeKey, busy: BusySignal) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.slots[ring_index(key)] = Some(BufferState {
            key,
            generation,
            status: SlotStatus::Busy(busy),
        });
        generation
    }

    /// Generation the next `claim` will hand out.
    pub fn peek_generation(&self) -> u64 {
        self.next_generation + 1
    }

    pub fn is_current(&self, key: TimeKey, generation: u64) -> bool {
        self.slot(key)
            .is_some_and(|s| s.key == key && s.generation == generation)
    }

    /// Sets the status of the slot for `key` if `generation` still owns it.
    pub fn settle(&mut self, key: TimeKey, generation: u64, status: SlotStatus) -> bool {
        match &mut self.slots[ring_index(key)] {
            Some(s) if s.key == key && s.generation == generation => {
                s.status = status;
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, key: TimeKey) -> Option<BufferState> {
        let slot = &mut self.slots[ring_index(key)];
        if slot.as_ref().is_some_and(|s| s.key == key) {
            slot.take()
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.slots = Default::default();
    }

    /// Failed slots among `keys`.
    pub fn failed(&self, keys: &[TimeKey]) -> Vec<TimeKey> {
        keys.iter()
            .copied()
            .filter(|k| self.holding(*k).is_some_and(|s| s.error().is_some()))
            .collect()
    }

    /// Errors are reported before waiting: a failed slot fails the pair even
    /// while the other is still busy.
    pub fn readiness(&self, time: f64) -> Readiness {
        let (k0, k1) = bracket(time);
        let (Some(b0), Some(b1)) = (self.holding(k0), self.holding(k1)) else {
            return Readiness::Failed;
        };
        if b0.error().is_some() || b1.error().is_some() {
            return Readiness::Failed;
        }
        for b in [b0, b1] {
            if let SlotStatus::Busy(signal) = &b.status {
                return Readiness::Busy(signal.clone());
            }
        }
        Readiness::Ready {
            tex_0: ring_index(k0),
            tex_1: ring_index(k1),
            mix: time - k0 as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BusySignal, Readiness, Ring, SlotStatus};
    use crate::error::SnapshotError;
    use crate::loader::LoadError;
    use futures::FutureExt;
    use futures::future;

    fn signal() -> BusySignal {
        future::pending::<()>().boxed_local().shared()
    }

    #[test]
    fn reclaiming_a_slot_fences_the_old_generation() {
        let mut ring = Ring::new();
        let g5 = ring.claim(5, signal());
        assert!(ring.is_current(5, g5));
        let g8 = ring.claim(8, signal());
        assert!(!ring.is_current(5, g5));
        assert!(!ring.settle(5, g5, SlotStatus::Valid));
        assert!(ring.settle(8, g8, SlotStatus::Valid));
        assert!(ring.holding(5).is_none());
        assert!(ring.holding(8).unwrap().is_valid());
    }

    #[test]
    fn readiness_needs_both_bracket_keys() {
        let mut ring = Ring::new();
        let g10 = ring.claim(10, signal());
        assert!(matches!(ring.readiness(10.25), Readiness::Failed));
        let g11 = ring.claim(11, signal());
        assert!(matches!(ring.readiness(10.25), Readiness::Busy(_)));
        ring.settle(10, g10, SlotStatus::Valid);
        ring.settle(11, g11, SlotStatus::Valid);
        match ring.readiness(10.25) {
            Readiness::Ready { tex_0, tex_1, mix } => {
                assert_eq!((tex_0, tex_1), (1, 2));
                assert_eq!(mix, 0.25);
            }
            _ => panic!("expected ready"),
        }
    }

    #[test]
    fn an_error_fails_the_pair_even_if_the_other_is_busy() {
        let mut ring = Ring::new();
        ring.claim(10, signal());
        let g11 = ring.claim(11, signal());
        ring.settle(
            11,
            g11,
            SlotStatus::Failed(SnapshotError::Load(LoadError::Transport("down".into()))),
        );
        assert!(matches!(ring.readiness(10.5), Readiness::Failed));
        assert_eq!(ring.failed(&[10, 11]), vec![11]);
    }
}
