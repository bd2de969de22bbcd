use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{fence, AtomicPtr, AtomicU64};

use super::overflow::OverflowItem;
use super::state::CellState;
use super::CELL_ITEMS;
use crate::Equivalent;

/// [`Cell`] is a lock stripe: a seqlock-protected array of inline entries followed by an
/// optional chain of overflow items.
///
/// All-zero bytes are a valid empty, unlocked [`Cell`].
#[repr(align(64))]
pub(crate) struct Cell<K, V> {
    state: AtomicU64,
    head: AtomicPtr<OverflowItem<K, V>>,
    keys: [UnsafeCell<MaybeUninit<K>>; CELL_ITEMS],
    values: [UnsafeCell<MaybeUninit<V>>; CELL_ITEMS],
}

/// Where an entry lives while its cell is locked.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Slot<K, V> {
    /// An inline slot.
    Inline(usize),
    /// An overflow item and the link that points to it.
    Overflow {
        link: *const AtomicPtr<OverflowItem<K, V>>,
        item: *mut OverflowItem<K, V>,
    },
}

/// The outcome of an optimistic lookup.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Snapshot<V> {
    /// A writer was active; the lookup has to be retried.
    Torn,
    /// A consistent result. `frozen` is `true` if the cell was locked when the lookup began.
    Consistent { value: Option<V>, frozen: bool },
}

impl<K, V> Cell<K, V>
where
    K: Copy,
    V: Copy,
{
    /// Returns the current state.
    #[inline]
    pub(crate) fn state(&self) -> CellState {
        CellState::from_raw(self.state.load(Acquire))
    }

    /// Tries to lock the cell from an unlocked snapshot.
    #[inline]
    pub(crate) fn try_lock(&self, current: CellState) -> Result<CellState, CellState> {
        debug_assert!(!current.is_locked());
        let locked = current.locked();
        self.state
            .compare_exchange(current.raw(), locked.raw(), Acquire, Relaxed)
            .map(|_| locked)
            .map_err(CellState::from_raw)
    }

    /// Releases the lock without announcing a mutation.
    #[inline]
    pub(crate) fn unlock(&self, locked: CellState) {
        debug_assert!(locked.is_locked() && !locked.is_writing());
        self.state.store(locked.unlocked().raw(), Release);
    }

    /// Releases the lock regardless of the state.
    #[inline]
    pub(crate) fn force_unlock(&self) {
        self.state.fetch_and(!CellState::LOCKED, Release);
    }

    /// Announces a mutation; every optimistic reader that overlaps the mutation retries.
    #[inline]
    pub(crate) fn begin_write(&self, locked: CellState) -> CellState {
        debug_assert!(locked.is_locked());
        let writing = locked.writing();
        self.state.store(writing.raw(), Relaxed);
        fence(Release);
        writing
    }

    /// Completes a mutation, unlocking the cell.
    #[inline]
    pub(crate) fn publish(&self, writing: CellState) {
        debug_assert!(writing.is_writing());
        self.state.store(writing.published().raw(), Release);
    }

    /// Looks up `key` without locking the cell.
    ///
    /// Slots are copied into local buffers and only interpreted once the state word confirms
    /// that no writer touched them in the meantime. `chain_limit` bounds the number of overflow
    /// items visited.
    pub(crate) fn read<Q>(&self, key: &Q, chain_limit: usize) -> Snapshot<V>
    where
        Q: Equivalent<K> + ?Sized,
    {
        let before = self.state();
        if before.is_writing() {
            return Snapshot::Torn;
        }
        debug_assert_eq!(before.occupied(), (1 << before.count()) - 1);

        let count = before.count();
        let mut keys = [MaybeUninit::<K>::uninit(); CELL_ITEMS];
        let mut values = [MaybeUninit::<V>::uninit(); CELL_ITEMS];
        for i in 0..count {
            unsafe {
                keys[i] = ptr::read_volatile(self.keys[i].get());
                values[i] = ptr::read_volatile(self.values[i].get());
            }
        }
        let mut item = self.head.load(Relaxed);
        if !self.validate(before) {
            return Snapshot::Torn;
        }

        let frozen = before.is_locked();
        for i in 0..count {
            if key.equivalent(unsafe { keys[i].assume_init_ref() }) {
                return Snapshot::Consistent {
                    value: Some(unsafe { values[i].assume_init() }),
                    frozen,
                };
            }
        }

        let mut visited = 0;
        while !item.is_null() {
            if visited == chain_limit {
                return Snapshot::Torn;
            }
            visited += 1;
            let (candidate, value, next) = unsafe {
                (
                    ptr::read_volatile((*item).key_ptr()),
                    ptr::read_volatile((*item).value_ptr()),
                    (*item).next_link().load(Relaxed),
                )
            };
            if !self.validate(before) {
                return Snapshot::Torn;
            }
            if key.equivalent(unsafe { candidate.assume_init_ref() }) {
                return Snapshot::Consistent {
                    value: Some(unsafe { value.assume_init() }),
                    frozen,
                };
            }
            item = next;
        }

        Snapshot::Consistent {
            value: None,
            frozen,
        }
    }

    /// Finds the slot holding `key`.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock.
    pub(crate) unsafe fn locate<Q>(&self, locked: CellState, key: &Q) -> Option<Slot<K, V>>
    where
        Q: Equivalent<K> + ?Sized,
    {
        for i in 0..locked.count() {
            if key.equivalent((*self.keys[i].get()).assume_init_ref()) {
                return Some(Slot::Inline(i));
            }
        }
        let mut link: *const AtomicPtr<OverflowItem<K, V>> = &self.head;
        let mut item = (*link).load(Relaxed);
        while !item.is_null() {
            if key.equivalent((*(*item).key_ptr()).assume_init_ref()) {
                return Some(Slot::Overflow { link, item });
            }
            link = (*item).next_link();
            item = (*link).load(Relaxed);
        }
        None
    }

    /// Reads the value in `slot`.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock, and `slot` must have been located under it.
    #[inline]
    pub(crate) unsafe fn value(&self, slot: Slot<K, V>) -> V {
        (*self.value_ptr(slot)).assume_init()
    }

    /// Returns a pointer to the value in `slot`.
    #[inline]
    pub(crate) fn value_ptr(&self, slot: Slot<K, V>) -> *mut MaybeUninit<V> {
        match slot {
            Slot::Inline(i) => self.values[i].get(),
            Slot::Overflow { item, .. } => unsafe { (*item).value_ptr() },
        }
    }

    /// Overwrites the value in `slot`.
    ///
    /// # Safety
    ///
    /// The caller must have announced a mutation with [`Cell::begin_write`].
    #[inline]
    pub(crate) unsafe fn write_value(&self, slot: Slot<K, V>, value: V) {
        ptr::write_volatile(self.value_ptr(slot), MaybeUninit::new(value));
    }

    /// Appends an entry to the inline slots, returning the updated state.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the cell, and an inline slot must be free.
    pub(crate) unsafe fn push_inline(&self, state: CellState, key: K, value: V) -> CellState {
        let index = state.count();
        debug_assert!(index < CELL_ITEMS);
        ptr::write_volatile(self.keys[index].get(), MaybeUninit::new(key));
        ptr::write_volatile(self.values[index].get(), MaybeUninit::new(value));
        state.with_count(index + 1)
    }

    /// Prepends an overflow item to the chain, returning the updated state.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the cell, and `item` must be a free item of the
    /// block the cell belongs to.
    pub(crate) unsafe fn push_overflow(
        &self,
        state: CellState,
        item: *mut OverflowItem<K, V>,
        key: K,
        value: V,
    ) -> CellState {
        ptr::write_volatile((*item).key_ptr(), MaybeUninit::new(key));
        ptr::write_volatile((*item).value_ptr(), MaybeUninit::new(value));
        (*item)
            .next_link()
            .store(self.head.load(Relaxed), Relaxed);
        self.head.store(item, Release);
        state.with_overflow(true)
    }

    /// Removes the entry in `slot`, returning the updated state and the overflow item that was
    /// released, if any.
    ///
    /// An inline hole is refilled from the head of the chain if there is one, otherwise by the
    /// last inline entry.
    ///
    /// # Safety
    ///
    /// The caller must have announced a mutation with [`Cell::begin_write`], and `slot` must have
    /// been located under the same lock.
    pub(crate) unsafe fn remove(
        &self,
        state: CellState,
        slot: Slot<K, V>,
    ) -> (CellState, Option<*mut OverflowItem<K, V>>) {
        match slot {
            Slot::Inline(index) => {
                let head = self.head.load(Relaxed);
                if head.is_null() {
                    let last = state.count() - 1;
                    if index != last {
                        ptr::write_volatile(self.keys[index].get(), *self.keys[last].get());
                        ptr::write_volatile(self.values[index].get(), *self.values[last].get());
                    }
                    (state.with_count(last), None)
                } else {
                    ptr::write_volatile(self.keys[index].get(), *(*head).key_ptr());
                    ptr::write_volatile(self.values[index].get(), *(*head).value_ptr());
                    let next = (*head).next_link().load(Relaxed);
                    self.head.store(next, Release);
                    (state.with_overflow(!next.is_null()), Some(head))
                }
            }
            Slot::Overflow { link, item } => {
                let next = (*item).next_link().load(Relaxed);
                (*link).store(next, Release);
                (
                    state.with_overflow(!self.head.load(Relaxed).is_null()),
                    Some(item),
                )
            }
        }
    }

    /// Calls `f` for every entry.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock, or otherwise prevent concurrent writes.
    pub(crate) unsafe fn for_each<F: FnMut(K, V)>(&self, state: CellState, mut f: F) {
        for i in 0..state.count() {
            f(
                (*self.keys[i].get()).assume_init(),
                (*self.values[i].get()).assume_init(),
            );
        }
        let mut item = self.head.load(Relaxed);
        while !item.is_null() {
            f(
                (*(*item).key_ptr()).assume_init(),
                (*(*item).value_ptr()).assume_init(),
            );
            item = (*item).next_link().load(Relaxed);
        }
    }

    /// Stores an entry into a cell of a block that is not shared yet.
    ///
    /// Returns `false` if the inline slots are full and `alloc` cannot provide an overflow item.
    ///
    /// # Safety
    ///
    /// No other thread may access the cell.
    pub(crate) unsafe fn place<A>(&self, key: K, value: V, alloc: A) -> bool
    where
        A: FnOnce() -> Option<*mut OverflowItem<K, V>>,
    {
        let state = CellState::from_raw(self.state.load(Relaxed));
        let state = if state.count() < CELL_ITEMS {
            self.push_inline(state, key, value)
        } else if let Some(item) = alloc() {
            self.push_overflow(state, item, key, value)
        } else {
            return false;
        };
        self.state.store(state.raw(), Relaxed);
        true
    }

    /// Makes sure the slots read since `before` were not modified.
    #[inline]
    fn validate(&self, before: CellState) -> bool {
        fence(Acquire);
        let after = CellState::from_raw(self.state.load(Relaxed));
        before.same_contents(after)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    use crate::hash_table::overflow::{OverflowCell, OVERFLOW_ITEMS};

    static_assertions::const_assert_eq!(std::mem::align_of::<Cell<u64, u64>>(), 64);
    static_assertions::const_assert!(std::mem::size_of::<Cell<u64, u64>>() == 64);

    struct Fixture {
        cell: *mut Cell<u64, u64>,
        pool: *mut OverflowCell<u64, u64>,
    }

    impl Fixture {
        fn new() -> Self {
            unsafe {
                let cell = alloc_zeroed(Layout::new::<Cell<u64, u64>>()).cast();
                let pool: *mut OverflowCell<u64, u64> =
                    alloc_zeroed(Layout::new::<OverflowCell<u64, u64>>()).cast();
                assert!(!pool.is_null());
                OverflowCell::init(pool, 0);
                Self { cell, pool }
            }
        }

        fn cell(&self) -> &Cell<u64, u64> {
            unsafe { &*self.cell }
        }

        fn insert(&self, key: u64, value: u64) {
            let cell = self.cell();
            let locked = cell.try_lock(cell.state()).unwrap();
            let writing = cell.begin_write(locked);
            let writing = unsafe {
                if writing.count() < CELL_ITEMS {
                    cell.push_inline(writing, key, value)
                } else {
                    let item = (*self.pool).pop(&Default::default()).unwrap();
                    cell.push_overflow(writing, item, key, value)
                }
            };
            cell.publish(writing);
        }

        fn remove(&self, key: u64) -> bool {
            let cell = self.cell();
            let locked = cell.try_lock(cell.state()).unwrap();
            match unsafe { cell.locate(locked, &key) } {
                Some(slot) => {
                    let writing = cell.begin_write(locked);
                    let (writing, freed) = unsafe { cell.remove(writing, slot) };
                    cell.publish(writing);
                    if let Some(item) = freed {
                        unsafe { (*self.pool).push(item, &Default::default()) };
                    }
                    true
                }
                None => {
                    cell.unlock(locked);
                    false
                }
            }
        }

        fn find(&self, key: u64) -> Option<u64> {
            match self.cell().read(&key, OVERFLOW_ITEMS) {
                Snapshot::Consistent { value, .. } => value,
                Snapshot::Torn => unreachable!(),
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unsafe {
                dealloc(self.cell.cast(), Layout::new::<Cell<u64, u64>>());
                dealloc(self.pool.cast(), Layout::new::<OverflowCell<u64, u64>>());
            }
        }
    }

    #[test]
    fn inline_and_overflow() {
        let fixture = Fixture::new();
        for key in 0..6 {
            fixture.insert(key, key * 10);
        }
        let state = fixture.cell().state();
        assert_eq!(state.count(), CELL_ITEMS);
        assert!(state.has_overflow());
        assert_eq!(state.version(), 6);
        for key in 0..6 {
            assert_eq!(fixture.find(key), Some(key * 10));
        }
        assert_eq!(fixture.find(6), None);
    }

    #[test]
    fn remove_pulls_chain_head() {
        let fixture = Fixture::new();
        for key in 0..5 {
            fixture.insert(key, key);
        }
        assert_eq!(unsafe { (*fixture.pool).available() }, OVERFLOW_ITEMS - 2);

        // Removing an inline entry moves the most recent overflow entry into the hole.
        assert!(fixture.remove(1));
        assert_eq!(fixture.cell().state().count(), CELL_ITEMS);
        assert!(fixture.cell().state().has_overflow());
        assert_eq!(unsafe { (*fixture.pool).available() }, OVERFLOW_ITEMS - 1);

        assert!(fixture.remove(0));
        assert!(!fixture.cell().state().has_overflow());
        assert_eq!(unsafe { (*fixture.pool).available() }, OVERFLOW_ITEMS);

        // Without a chain the last inline entry fills the hole.
        assert!(fixture.remove(4));
        assert_eq!(fixture.cell().state().count(), 2);
        assert_eq!(fixture.find(3), Some(3));
        assert_eq!(fixture.find(2), Some(2));
        assert!(!fixture.remove(4));
        assert!(fixture.remove(3));
        assert!(fixture.remove(2));
        assert_eq!(fixture.cell().state().count(), 0);
    }

    #[test]
    fn remove_from_chain() {
        let fixture = Fixture::new();
        for key in 0..7 {
            fixture.insert(key, key);
        }
        // The chain is 6 -> 5 -> 4 -> 3.
        assert!(fixture.remove(4));
        assert!(fixture.remove(6));
        assert!(fixture.remove(3));
        assert_eq!(fixture.find(5), Some(5));
        assert_eq!(fixture.find(4), None);
        assert!(fixture.cell().state().has_overflow());
        assert!(fixture.remove(5));
        assert!(!fixture.cell().state().has_overflow());
        for key in 0..3 {
            assert_eq!(fixture.find(key), Some(key));
        }
    }

    #[test]
    fn torn_reads() {
        let fixture = Fixture::new();
        fixture.insert(1, 1);
        let cell = fixture.cell();

        let locked = cell.try_lock(cell.state()).unwrap();
        assert_eq!(
            cell.read(&1_u64, 0),
            Snapshot::Consistent {
                value: Some(1),
                frozen: true
            }
        );
        let writing = cell.begin_write(locked);
        assert_eq!(cell.read(&1_u64, 0), Snapshot::Torn);
        cell.publish(writing);
        assert_eq!(
            cell.read(&1_u64, 0),
            Snapshot::Consistent {
                value: Some(1),
                frozen: false
            }
        );
    }

    #[test]
    fn chain_limit() {
        let fixture = Fixture::new();
        for key in 0..5 {
            fixture.insert(key, key);
        }
        assert_eq!(
            fixture.cell().read(&0_u64, 1),
            Snapshot::Consistent {
                value: Some(0),
                frozen: false
            }
        );
        assert_eq!(fixture.cell().read(&3_u64, 1), Snapshot::Torn);
        assert_eq!(
            fixture.cell().read(&3_u64, 2),
            Snapshot::Consistent {
                value: Some(3),
                frozen: false
            }
        );
    }
}
