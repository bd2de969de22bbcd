use std::fmt;

/// Failures that can surface from growing a [`HashMap`](crate::HashMap).
///
/// Contention and overflow-pool exhaustion are handled internally and never reported. When an
/// [`Error`] is returned the map is left exactly as it was before the failed grow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The allocator could not provide memory for a new block.
    Allocation { bytes: usize },
    /// A block of the requested size would exceed the configured or addressable limit.
    CapacityOverflow { cells: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Allocation { bytes } => {
                write!(f, "failed to allocate a block of {} bytes", bytes)
            }
            Error::CapacityOverflow { cells } => {
                write!(f, "a block of {} cells exceeds the capacity limit", cells)
            }
        }
    }
}

impl std::error::Error for Error {}
