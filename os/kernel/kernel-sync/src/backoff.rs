use core::hint::spin_loop;

/// Upper bound for the exponent; `1 << MAX_SHIFT` pause instructions per step.
const MAX_SHIFT: u32 = 6;

/// Bounded exponential backoff for contended spin loops.
///
/// Each call to [`spin`](Self::spin) issues `2^step` pause hints (capped), so a
/// waiter backs off from the contended cache line quickly without ever
/// yielding the CPU.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Pause for the current step and grow the step up to the cap.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..(1u32 << self.step) {
            spin_loop();
        }
        if self.step < MAX_SHIFT {
            self.step += 1;
        }
    }

    /// Whether the backoff has reached its maximum step.
    #[inline]
    #[must_use]
    pub const fn is_saturated(&self) -> bool {
        self.step >= MAX_SHIFT
    }

    #[inline]
    pub const fn reset(&mut self) {
        self.step = 0;
    }
}
