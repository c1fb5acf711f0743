use crate::sync::spin_loop;

/// Largest backoff step; step `n` spins `2^n` times.
#[cfg(not(feature = "loom"))]
const MAX_SPIN_STEP: u32 = 6;

// Under loom every spin is a yield, so a single one per step is enough
#[cfg(feature = "loom")]
const MAX_SPIN_STEP: u32 = 0;

/// Progressive spin backoff for contended lock acquisition.
///
/// Attempt 0: 1 spin, 1: 2 spins, 2: 4 spins ... capped at 64 spins per call.
/// Never yields to the scheduler, so it is usable where sleeping is not.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    #[inline]
    pub(crate) fn spin(&mut self) {
        for _ in 0..(1u32 << self.step) {
            spin_loop();
        }

        if self.step < MAX_SPIN_STEP {
            self.step += 1;
        }
    }

    #[cfg(test)]
    fn step(&self) -> u32 {
        self.step
    }
}
