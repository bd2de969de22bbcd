use std::fmt;

/// [`CellState`] is a snapshot of the state word of a [`Cell`](super::cell::Cell).
///
/// | bits   | meaning                                              |
/// |--------|------------------------------------------------------|
/// | `0..2` | number of occupied inline slots                      |
/// | `2..5` | occupied bitmap, always the lowest `count` slots     |
/// | `5`    | a writer is mutating the cell                        |
/// | `6`    | the overflow chain is non-empty                      |
/// | `7`    | the cell is locked                                   |
/// | `8..`  | version, bumped by every completed mutation          |
#[derive(Clone, Copy, Eq, PartialEq)]
pub(crate) struct CellState(u64);

impl CellState {
    pub(crate) const COUNT_MASK: u64 = 0b11;
    pub(crate) const OCCUPIED_SHIFT: u32 = 2;
    pub(crate) const OCCUPIED_MASK: u64 = 0b111 << Self::OCCUPIED_SHIFT;
    pub(crate) const WRITING: u64 = 1 << 5;
    pub(crate) const OVERFLOW: u64 = 1 << 6;
    pub(crate) const LOCKED: u64 = 1 << 7;
    pub(crate) const VERSION_SHIFT: u32 = 8;
    pub(crate) const VERSION_ONE: u64 = 1 << Self::VERSION_SHIFT;

    #[inline]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) const fn count(self) -> usize {
        (self.0 & Self::COUNT_MASK) as usize
    }

    #[inline]
    pub(crate) const fn occupied(self) -> u64 {
        (self.0 & Self::OCCUPIED_MASK) >> Self::OCCUPIED_SHIFT
    }

    #[inline]
    pub(crate) const fn version(self) -> u64 {
        self.0 >> Self::VERSION_SHIFT
    }

    #[inline]
    pub(crate) const fn is_locked(self) -> bool {
        self.0 & Self::LOCKED != 0
    }

    #[inline]
    pub(crate) const fn is_writing(self) -> bool {
        self.0 & Self::WRITING != 0
    }

    #[inline]
    pub(crate) const fn has_overflow(self) -> bool {
        self.0 & Self::OVERFLOW != 0
    }

    /// Sets the number of inline entries along with the matching bitmap.
    #[inline]
    pub(crate) const fn with_count(self, count: usize) -> Self {
        debug_assert!(count <= super::CELL_ITEMS);
        let count = count as u64;
        let occupied = ((1 << count) - 1) << Self::OCCUPIED_SHIFT;
        Self((self.0 & !(Self::COUNT_MASK | Self::OCCUPIED_MASK)) | count | occupied)
    }

    #[inline]
    pub(crate) const fn with_overflow(self, overflow: bool) -> Self {
        if overflow {
            Self(self.0 | Self::OVERFLOW)
        } else {
            Self(self.0 & !Self::OVERFLOW)
        }
    }

    #[inline]
    pub(crate) const fn locked(self) -> Self {
        Self(self.0 | Self::LOCKED)
    }

    #[inline]
    pub(crate) const fn unlocked(self) -> Self {
        Self(self.0 & !Self::LOCKED)
    }

    /// The state a writer announces before touching any slot.
    #[inline]
    pub(crate) const fn writing(self) -> Self {
        Self(self.0 | Self::WRITING)
    }

    /// The state a writer publishes after its mutation: unlocked, idle, and one version ahead.
    #[inline]
    pub(crate) const fn published(self) -> Self {
        Self((self.0 & !(Self::WRITING | Self::LOCKED)).wrapping_add(Self::VERSION_ONE))
    }

    /// Returns `true` if no mutation happened between the two snapshots.
    ///
    /// Acquiring or releasing the lock without writing leaves the slots untouched, so the lock bit
    /// is ignored.
    #[inline]
    pub(crate) const fn same_contents(self, other: CellState) -> bool {
        (self.0 | Self::LOCKED) == (other.0 | Self::LOCKED)
    }
}

impl fmt::Debug for CellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellState")
            .field("count", &self.count())
            .field("overflow", &self.has_overflow())
            .field("writing", &self.is_writing())
            .field("locked", &self.is_locked())
            .field("version", &self.version())
            .finish()
    }
}

const _: () = {
    let fields = [
        CellState::COUNT_MASK,
        CellState::OCCUPIED_MASK,
        CellState::WRITING,
        CellState::OVERFLOW,
        CellState::LOCKED,
    ];
    let mut i = 0;
    while i < fields.len() {
        let mut j = i + 1;
        while j < fields.len() {
            assert!(fields[i] & fields[j] == 0);
            j += 1;
        }
        assert!(fields[i] < CellState::VERSION_ONE);
        i += 1;
    }
};
