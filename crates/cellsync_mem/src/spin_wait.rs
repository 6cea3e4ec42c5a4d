// Portions of the project have been copied from parking_lot and is copyrighted by Amanieu d'Antras under the MIT license
use core::hint::spin_loop;

// Wastes some CPU time for the given number of iterations, using a hint to indicate to the CPU that we are spinning
#[inline]
pub(crate) fn cpu_relax(iterations: u32) {
    for _ in 0..iterations {
        spin_loop()
    }
}

/// A counter used to perform exponential backoff in spin loops
#[derive(Default)]
pub struct SpinWait {
    counter : u32,
}

impl SpinWait {
    /// Creates a new `SpinWait`
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets a `SpinWait` to its initial state
    #[inline]
    pub fn reset(&mut self) {
        self.counter = 0;
    }

    /// Spins until the yield threshold has been reached.
    ///
    /// Returns whether spinning should continue, once the threshold is reached further spinning has diminishing returns.
    ///
    /// The spin strategy will initially use a CPU-bound loop, but will fall back to yielding the CPU to the OS after a few iterations.
    #[inline]
    pub fn spin(&mut self) -> bool {
        if self.counter >= 10 {
            return false;
        }

        self.counter += 1;
        if self.counter <= 3 {
            cpu_relax(1 << self.counter);
        } else {
            std::thread::yield_now();
        }
        true
    }

    /// Spins without yielding the thread to the OS.
    ///
    /// Instead, the backoff is simply capped at a maximum value.
    /// This can be used to improve throughput in commit loops that have a high contention.
    #[inline]
    pub fn spin_no_yield(&mut self) {
        self.counter += 1;
        if self.counter > 10 {
            self.counter = 10;
        }
        cpu_relax(1 << self.counter);
    }
}
