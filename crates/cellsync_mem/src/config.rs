/// Settings for a shared region
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegionConfig {
    /// Size of the region in bytes, rounded up to a whole number of blocks
    pub size              : usize,
    /// Number of failed commits in a row after which a unit logs that a block is heavily contended, `0` disables the warning
    pub contention_report : u32,
}

impl RegionConfig {
    /// Default region size: 1 MiB
    pub const DEFAULT_SIZE : usize = 1024 * 1024;

    /// Create a config for a region of `size` bytes
    pub const fn with_size(size: usize) -> Self {
        Self { size, contention_report: 4096 }
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self::with_size(Self::DEFAULT_SIZE)
    }
}

/// Settings for the backoff strategies
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BackoffConfig {
    /// Maximum number of spin rounds an event wait lasts before giving up on the event and retrying anyway
    pub event_spins     : u32,
    /// Upper bound of a randomized delay, in spin iterations
    pub max_delay_spins : u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { event_spins: 64, max_delay_spins: 256 }
    }
}
