use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::slice;

use super::cell::Cell;
use super::overflow::{OverflowCell, OverflowItem, OVERFLOW_ITEMS};
use super::CELL_ITEMS;
use crate::config::SpinPolicy;
use crate::error::Error;

/// [`Block`] is one generation of the table: a power-of-two array of cells followed by the
/// overflow cells shared by all of them, in a single zeroed allocation.
pub(crate) struct Block<K, V> {
    cells: NonNull<Cell<K, V>>,
    cell_count: usize,
    overflow: NonNull<OverflowCell<K, V>>,
    overflow_count: usize,
    layout: Layout,
}

impl<K, V> Block<K, V>
where
    K: Copy,
    V: Copy,
{
    /// Allocates a new [`Block`].
    ///
    /// # Errors
    ///
    /// Returns an error if the layout cannot be represented or the allocator fails.
    pub(crate) fn new(cell_count: usize, overflow_count: usize) -> Result<Box<Self>, Error> {
        debug_assert!(cell_count.is_power_of_two());
        let too_large = Error::CapacityOverflow { cells: cell_count };
        let cells_layout =
            Layout::array::<Cell<K, V>>(cell_count).map_err(|_| too_large.clone())?;
        let overflow_layout =
            Layout::array::<OverflowCell<K, V>>(overflow_count).map_err(|_| too_large.clone())?;
        let (layout, overflow_offset) = cells_layout
            .extend(overflow_layout)
            .map_err(|_| too_large)?;
        let layout = layout.pad_to_align();

        unsafe {
            let Some(base) = NonNull::new(alloc_zeroed(layout)) else {
                return Err(Error::Allocation {
                    bytes: layout.size(),
                });
            };
            let overflow = base.as_ptr().add(overflow_offset).cast::<OverflowCell<K, V>>();
            for home in 0..overflow_count {
                OverflowCell::init(overflow.add(home), home);
            }
            Ok(Box::new(Self {
                cells: base.cast(),
                cell_count,
                overflow: NonNull::new_unchecked(overflow),
                overflow_count,
                layout,
            }))
        }
    }

    /// Returns the number of cells.
    #[inline]
    pub(crate) fn cell_count(&self) -> usize {
        self.cell_count
    }

    /// Returns the number of overflow cells.
    #[inline]
    pub(crate) fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    /// Returns the number of entries the block can hold.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.cell_count * CELL_ITEMS + self.item_count()
    }

    /// Returns the total number of overflow items; no chain can be longer.
    #[inline]
    pub(crate) fn item_count(&self) -> usize {
        self.overflow_count * OVERFLOW_ITEMS
    }

    /// Returns the cell `hash` maps to.
    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    pub(crate) fn cell(&self, hash: u64) -> &Cell<K, V> {
        &self.cells()[(hash as usize) & (self.cell_count - 1)]
    }

    #[inline]
    pub(crate) fn cells(&self) -> &[Cell<K, V>] {
        unsafe { slice::from_raw_parts(self.cells.as_ptr(), self.cell_count) }
    }

    #[inline]
    fn overflow_cells(&self) -> &[OverflowCell<K, V>] {
        unsafe { slice::from_raw_parts(self.overflow.as_ptr(), self.overflow_count) }
    }

    /// Returns the number of free overflow items.
    #[cfg(test)]
    pub(crate) fn available_items(&self) -> usize {
        self.overflow_cells()
            .iter()
            .map(OverflowCell::available)
            .sum()
    }

    /// Takes a free overflow item.
    ///
    /// Overflow cells are probed starting from the one `hash` maps to; the first pass skips
    /// busy overflow cells and the second one waits for them. Returns `None` if the pool is
    /// exhausted.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn alloc_item(
        &self,
        hash: u64,
        spin: &SpinPolicy,
    ) -> Option<*mut OverflowItem<K, V>> {
        let pool = self.overflow_cells();
        if pool.is_empty() {
            return None;
        }
        let start = (hash as usize) % pool.len();
        for offset in 0..pool.len() {
            if let Some(Some(item)) = pool[(start + offset) % pool.len()].try_pop() {
                return Some(item);
            }
        }
        for offset in 0..pool.len() {
            if let Some(item) = pool[(start + offset) % pool.len()].pop(spin) {
                return Some(item);
            }
        }
        None
    }

    /// Returns an overflow item to its home overflow cell.
    ///
    /// # Safety
    ///
    /// The item must have been taken from `self` and unlinked from its chain.
    pub(crate) unsafe fn free_item(&self, item: *mut OverflowItem<K, V>, spin: &SpinPolicy) {
        let home = (*item).home();
        self.overflow_cells()[home].push(item, spin);
    }

    /// Copies every entry of `from` into `self`.
    ///
    /// Returns `false` if an entry could not be placed, in which case `self` has to be discarded.
    ///
    /// # Safety
    ///
    /// `self` must not be shared yet, and every cell of `from` must be locked by the caller.
    pub(crate) unsafe fn migrate<F>(&self, from: &Block<K, V>, hash: F, spin: &SpinPolicy) -> bool
    where
        F: Fn(&K) -> u64,
    {
        let mut placed = true;
        for cell in from.cells() {
            cell.for_each(cell.state(), |key, value| {
                if placed {
                    let hash = hash(&key);
                    placed = self
                        .cell(hash)
                        .place(key, value, || self.alloc_item(hash, spin));
                }
            });
            if !placed {
                return false;
            }
        }
        true
    }
}

impl<K, V> fmt::Debug for Block<K, V>
where
    K: Copy,
    V: Copy,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("cells", &self.cell_count())
            .field("overflow_cells", &self.overflow_count())
            .finish()
    }
}

impl<K, V> Drop for Block<K, V> {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.cells.as_ptr().cast::<u8>(), self.layout);
        }
    }
}

unsafe impl<K: Send, V: Send> Send for Block<K, V> {}
unsafe impl<K: Sync, V: Sync> Sync for Block<K, V> {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hash_table::state::CellState;

    #[test]
    fn sizing() {
        let block = Block::<u64, u64>::new(256, 2).unwrap();
        assert_eq!(block.cell_count(), 256);
        assert_eq!(block.overflow_count(), 2);
        assert_eq!(block.capacity(), 256 * CELL_ITEMS + 2 * OVERFLOW_ITEMS);
        assert_eq!(block.available_items(), 2 * OVERFLOW_ITEMS);
        assert!(block.cells().iter().all(|c| c.state() == CellState::from_raw(0)));

        let small = Block::<u64, u64>::new(4, 0).unwrap();
        assert_eq!(small.capacity(), 4 * CELL_ITEMS);
        assert!(small.alloc_item(0, &SpinPolicy::default()).is_none());
    }

    #[test]
    fn cell_mapping() {
        let block = Block::<u64, u64>::new(16, 0).unwrap();
        assert!(std::ptr::eq(block.cell(3), block.cell(19)));
        assert!(std::ptr::eq(block.cell(0), &block.cells()[0]));
        assert!(!std::ptr::eq(block.cell(1), block.cell(2)));
    }

    #[test]
    fn capacity_overflow() {
        let cells = 1_usize << (usize::BITS - 1);
        assert_eq!(
            Block::<u64, u64>::new(cells, 0).unwrap_err(),
            Error::CapacityOverflow { cells }
        );
    }

    #[test]
    fn pool_probing() {
        let block = Block::<u64, u64>::new(8, 3).unwrap();
        let spin = SpinPolicy::default();

        // Probing starts at `hash % 3` and wraps around.
        let item = block.alloc_item(4, &spin).unwrap();
        assert_eq!(unsafe { (*item).home() }, 1);

        let mut taken = vec![item];
        while let Some(item) = block.alloc_item(4, &spin) {
            taken.push(item);
        }
        assert_eq!(taken.len(), 3 * OVERFLOW_ITEMS);
        let from_first = taken
            .iter()
            .filter(|item| unsafe { (***item).home() } == 1)
            .count();
        assert_eq!(from_first, OVERFLOW_ITEMS);
        assert_eq!(unsafe { (*taken[OVERFLOW_ITEMS]).home() }, 2);
        assert_eq!(unsafe { (*taken[2 * OVERFLOW_ITEMS]).home() }, 0);

        for item in taken {
            unsafe { block.free_item(item, &spin) };
        }
        assert_eq!(block.available_items(), 3 * OVERFLOW_ITEMS);
    }

    #[test]
    fn migration() {
        let from = Block::<u64, u64>::new(4, 0).unwrap();
        let to = Block::<u64, u64>::new(16, 0).unwrap();
        let spin = SpinPolicy::default();
        for key in 0..12 {
            let cell = from.cell(key);
            let state = cell.state();
            unsafe { assert!(cell.place(key, key * 2, || None)) };
            assert_eq!(cell.state().count(), state.count() + 1);
        }
        assert!(unsafe { !from.cell(12).place(12, 24, || None) });

        assert!(unsafe { to.migrate(&from, |k| *k, &spin) });
        for key in 0..12 {
            let cell = to.cell(key);
            let locked = cell.try_lock(cell.state()).unwrap();
            let slot = unsafe { cell.locate(locked, &key) }.unwrap();
            assert_eq!(unsafe { cell.value(slot) }, key * 2);
            cell.unlock(locked);
        }
        assert!(to.cells().iter().all(|c| c.state().count() <= 1));

        // A block that is too small to hold the entries refuses them.
        let cramped = Block::<u64, u64>::new(1, 0).unwrap();
        assert!(unsafe { !cramped.migrate(&from, |k| *k, &spin) });
    }
}
