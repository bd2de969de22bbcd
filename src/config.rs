//! Tuning knobs for [`HashMap`](crate::HashMap) and its reclamation [`Domain`](crate::ebr::Domain).

use std::time::Duration;

/// The default number of cells in the first block.
pub const DEFAULT_INITIAL_CELLS: usize = 256;

/// The default number of cells sharing one overflow cell.
pub const DEFAULT_OVERFLOW_RATIO: usize = 128;

/// The default number of deferred nodes a collector accumulates before an epoch advance is
/// requested.
pub const DEFAULT_RECLAIM_THRESHOLD: usize = 128;

/// The default upper bound on the number of cells in a block.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_MAX_CELLS: usize = 1_usize << 32;

/// The default upper bound on the number of cells in a block.
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_MAX_CELLS: usize = 1_usize << 24;

/// [`Config`] controls the geometry of a [`HashMap`](crate::HashMap).
///
/// # Examples
///
/// ```
/// use stripemap::{Config, HashMap};
///
/// let config = Config::default().initial_cells(4).overflow_ratio(2);
/// let hashmap: HashMap<u64, u64> = HashMap::with_config(config);
///
/// let participant = hashmap.register();
/// let guard = participant.acquire();
/// assert_eq!(hashmap.cell_count(&guard), 4);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of cells in the first block, rounded up to a power of two.
    pub initial_cells: usize,
    /// Number of cells per overflow cell; a block of `n` cells has `n / overflow_ratio`
    /// overflow cells.
    pub overflow_ratio: usize,
    /// The largest block a grow may allocate.
    pub max_cells: usize,
    /// How waiters burn CPU while a cell, an overflow cell, or a resize is busy.
    pub spin: SpinPolicy,
    /// Deferred nodes per collector before a flushing thread asks for an epoch advance.
    pub reclaim_threshold: usize,
}

impl Config {
    /// Sets the number of cells in the first block.
    #[inline]
    #[must_use]
    pub fn initial_cells(mut self, cells: usize) -> Self {
        self.initial_cells = cells;
        self
    }

    /// Sets the number of cells sharing one overflow cell.
    #[inline]
    #[must_use]
    pub fn overflow_ratio(mut self, ratio: usize) -> Self {
        self.overflow_ratio = ratio;
        self
    }

    /// Sets the upper bound on the number of cells in a block.
    #[inline]
    #[must_use]
    pub fn max_cells(mut self, cells: usize) -> Self {
        self.max_cells = cells;
        self
    }

    /// Sets the spin policy.
    #[inline]
    #[must_use]
    pub fn spin(mut self, spin: SpinPolicy) -> Self {
        self.spin = spin;
        self
    }

    /// Sets the reclamation threshold of a [`Domain`](crate::ebr::Domain) created for the map.
    #[inline]
    #[must_use]
    pub fn reclaim_threshold(mut self, threshold: usize) -> Self {
        self.reclaim_threshold = threshold;
        self
    }

    /// Returns the cell count of the first block.
    pub(crate) fn normalized_initial_cells(&self) -> usize {
        self.initial_cells
            .max(1)
            .checked_next_power_of_two()
            .unwrap_or(1_usize << (usize::BITS - 1))
    }

    /// Returns the number of overflow cells a block of `cells` cells carries.
    pub(crate) fn overflow_cells_for(&self, cells: usize) -> usize {
        cells / self.overflow_ratio.max(1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_cells: DEFAULT_INITIAL_CELLS,
            overflow_ratio: DEFAULT_OVERFLOW_RATIO,
            max_cells: DEFAULT_MAX_CELLS,
            spin: SpinPolicy::default(),
            reclaim_threshold: DEFAULT_RECLAIM_THRESHOLD,
        }
    }
}

/// [`SpinPolicy`] bounds how hard a waiter spins before it starts giving the CPU away.
///
/// A waiter first executes `spin_limit` spin-loop hints, then `yield_limit` calls to
/// [`std::thread::yield_now`], and afterwards sleeps for `sleep` between attempts. Waiting never
/// times out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpinPolicy {
    /// Busy-spin attempts before yielding.
    pub spin_limit: u32,
    /// Yield attempts before sleeping.
    pub yield_limit: u32,
    /// Sleep duration once both limits are exhausted.
    pub sleep: Duration,
}

impl SpinPolicy {
    /// A policy that yields on every attempt, as a cooperative scheduler would.
    pub const YIELD: SpinPolicy = SpinPolicy {
        spin_limit: 0,
        yield_limit: u32::MAX,
        sleep: Duration::from_micros(50),
    };
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self {
            spin_limit: 64,
            yield_limit: 64,
            sleep: Duration::from_micros(50),
        }
    }
}
