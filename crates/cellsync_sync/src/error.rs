use core::fmt;

/// Error returned by the non-blocking entry points of the primitives, and by their initialization
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// The resource is currently busy, full or empty, try again later
    Retry,
    /// There is nothing to look at
    NoData,
    /// The lock is held by somebody else
    Busy,
    /// An invalid value was passed when initializing a primitive
    BadValue(&'static str),
    /// The shared region has no space left for a new primitive
    OutOfMemory { size: usize },
}

impl Error {
    /// Check if the error is caused by contention, and the same call may succeed when repeated
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Retry | Error::Busy)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Retry                => f.write_str("Resource is temporarily unavailable, retry"),
            Error::NoData               => f.write_str("No data available"),
            Error::Busy                 => f.write_str("Lock is busy"),
            Error::BadValue(reason)     => f.write_fmt(format_args!("Bad value: {reason}")),
            Error::OutOfMemory { size } => f.write_fmt(format_args!("Out of shared memory, could not allocate {size} bytes")),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn transient_errors() {
        assert!(Error::Retry.is_transient());
        assert!(Error::Busy.is_transient());
        assert!(!Error::NoData.is_transient());
        assert!(!Error::BadValue("x").is_transient());
        assert_eq!(Error::OutOfMemory { size: 256 }.to_string(), "Out of shared memory, could not allocate 256 bytes");
    }
}
