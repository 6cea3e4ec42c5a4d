use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use rand::{Rng, SeedableRng, rngs::SmallRng};

use crate::{
    BackoffConfig, ReservationEvent,
    spin_wait::{SpinWait, cpu_relax},
};

/// Strategy a unit uses while it waits for a reserved block to change.
///
/// There is no blocking wait on an accelerator core: every primitive busy-retries, and the backoff decides what happens between two retries.
/// A wait must always be bounded, returning early is fine, as the caller re-checks its condition anyway.
pub trait Backoff : Send {
    /// Wait until `event` fires, or until the strategy decides it waited long enough
    fn wait(&mut self, event: &ReservationEvent<'_>);

    /// Called after a successful commit
    fn reset(&mut self) {}
}

/// Wait for the reservation-lost event, bounded by a maximum number of spin rounds
pub struct EventWait {
    spin      : SpinWait,
    max_spins : u32,
}

impl EventWait {
    pub fn new(config: &BackoffConfig) -> Self {
        Self { spin: SpinWait::new(), max_spins: config.event_spins.max(1) }
    }
}

impl Backoff for EventWait {
    fn wait(&mut self, event: &ReservationEvent<'_>) {
        for _ in 0..self.max_spins {
            if event.lost() {
                return;
            }
            if !self.spin.spin() {
                std::thread::yield_now();
            }
        }
    }

    fn reset(&mut self) {
        self.spin.reset();
    }
}

/// Bounded randomized delay, for when the event can't be used
pub struct RandomDelay {
    rng       : SmallRng,
    max_spins : u32,
}

impl RandomDelay {
    pub fn new(config: &BackoffConfig) -> Self {
        Self { rng: SmallRng::from_entropy(), max_spins: config.max_delay_spins.max(1) }
    }

    /// Create a delay with a fixed seed, so the sequence of delays is reproducible
    pub fn with_seed(config: &BackoffConfig, seed: u64) -> Self {
        Self { rng: SmallRng::seed_from_u64(seed), max_spins: config.max_delay_spins.max(1) }
    }
}

impl Backoff for RandomDelay {
    fn wait(&mut self, _event: &ReservationEvent<'_>) {
        let spins = self.rng.gen_range(1..=self.max_spins);
        cpu_relax(spins);
        std::thread::yield_now();
    }
}

/// Plain exponential spinning, ignoring the event
#[derive(Default)]
pub struct SpinBackoff {
    spin : SpinWait,
}

impl SpinBackoff {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backoff for SpinBackoff {
    fn wait(&mut self, _event: &ReservationEvent<'_>) {
        self.spin.spin_no_yield();
    }

    fn reset(&mut self) {
        self.spin.reset();
    }
}

/// Deterministic backoff for tests: counts how often it was asked to wait, and only yields the thread
#[derive(Clone, Default)]
pub struct CountingBackoff {
    waits : Arc<AtomicUsize>,
}

impl CountingBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a shared handle to the wait counter, which stays valid after the backoff was moved into a unit
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.waits.clone()
    }

    /// Get the number of waits so far
    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::Relaxed)
    }
}

impl Backoff for CountingBackoff {
    fn wait(&mut self, _event: &ReservationEvent<'_>) {
        self.waits.fetch_add(1, Ordering::Relaxed);
        std::thread::yield_now();
    }
}

cfg_if::cfg_if!{
    if #[cfg(feature = "event_wait")] {
        /// Backoff strategy units use when none is given explicitly
        pub type DefaultBackoff = EventWait;
    } else {
        /// Backoff strategy units use when none is given explicitly
        pub type DefaultBackoff = RandomDelay;
    }
}

/// Create the default backoff strategy
pub fn default_backoff(config: &BackoffConfig) -> Box<dyn Backoff> {
    Box::new(DefaultBackoff::new(config))
}
