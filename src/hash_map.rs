//! [`HashMap`] is a lock-striped concurrent hash map with optimistic reads.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicBool, AtomicPtr};
use std::sync::Arc;

use crate::backoff::Backoff;
use crate::config::Config;
use crate::ebr::{Domain, Guard, Participant};
use crate::error::Error;
use crate::hash_table::block::Block;
use crate::hash_table::cell::{Cell, Slot, Snapshot};
use crate::hash_table::state::CellState;
use crate::hash_table::CELL_ITEMS;
use crate::rollback::Rollback;
use crate::Equivalent;

/// A grow multiplies the number of cells by this factor.
const GROWTH_FACTOR: usize = 4;

/// Lock-striped concurrent hash map.
///
/// [`HashMap`] stores up to three entries inline in each cell of a power-of-two cell array, and
/// spills the rest into overflow items drawn from a pool shared by groups of cells. The cell
/// array and its pool form a block; when the pool runs dry the map installs a block with four
/// times as many cells and retires the old one through its reclamation [`Domain`].
///
/// Keys and values are copied in and out; the map never hands out references to them.
///
/// ## Locking behavior
///
/// ### Reads
///
/// [`HashMap::find`] never locks. It copies the candidate slots of a cell and validates the copy
/// against the state word of the cell, retrying if a writer was active in the meantime.
///
/// ### Writes
///
/// Every write locks the cell the key maps to, and only that cell. Overflow pools have their own
/// short-lived locks.
///
/// ### Grow
///
/// A single thread grows the map at a time: it locks every cell of the old block, migrates the
/// entries, and publishes the new block. Writers that need the map to grow while another thread
/// is doing so wait for it and retry.
///
/// ### Locked entries
///
/// A [`LockedEntry`] holds its cell lock until it is released. [`HashMap::len`] and
/// [`HashMap::is_empty`] lock every cell in turn, and a grow locks every cell of the old block,
/// so calling them, or inserting into the same map, on a thread that holds a [`LockedEntry`]
/// of the map deadlocks. Other threads simply wait for the entry to be released.
///
/// ## Reclamation
///
/// Every operation takes a [`Guard`] of the map's [`Domain`]. Blocks retired by a grow are
/// dropped once every guard that could have observed them is gone.
///
/// # Examples
///
/// ```
/// use stripemap::HashMap;
///
/// let hashmap: HashMap<u64, u32> = HashMap::default();
/// let participant = hashmap.register();
/// let guard = participant.acquire();
///
/// assert_eq!(hashmap.insert(1, 10, &guard), Ok(true));
/// assert_eq!(hashmap.insert(1, 11, &guard), Ok(false));
/// assert_eq!(hashmap.find(&1, &guard), Some(10));
/// assert!(hashmap.remove(&1, &guard));
/// assert!(!hashmap.contains(&1, &guard));
/// ```
pub struct HashMap<K, V, H = RandomState>
where
    H: BuildHasher,
{
    anchor: AtomicPtr<Block<K, V>>,
    resizing: AtomicBool,
    domain: Arc<Domain>,
    config: Config,
    build_hasher: H,
    _marker: PhantomData<(K, V)>,
}

/// [`LockedEntry`] holds the lock of the cell containing an entry.
///
/// The lock is released by [`LockedEntry::update_and_unlock`], [`LockedEntry::unlock`], or by
/// dropping the [`LockedEntry`].
pub struct LockedEntry<'g, K, V>
where
    K: Copy,
    V: Copy,
{
    cell: &'g Cell<K, V>,
    locked: CellState,
    slot: Slot<K, V>,
    value: V,
}

impl<K, V, H> HashMap<K, V, H>
where
    K: Copy + Eq + Hash + Send + Sync + 'static,
    V: Copy + Send + Sync + 'static,
    H: BuildHasher,
{
    /// Creates an empty [`HashMap`] with the given [`BuildHasher`].
    ///
    /// # Panics
    ///
    /// Panics if the first block cannot be allocated.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let hashmap: HashMap<u64, u32, RandomState> = HashMap::with_hasher(RandomState::new());
    /// ```
    #[inline]
    pub fn with_hasher(build_hasher: H) -> Self {
        Self::with_config_and_hasher(Config::default(), build_hasher)
    }

    /// Creates an empty [`HashMap`] with the given [`Config`] and [`BuildHasher`].
    ///
    /// # Panics
    ///
    /// Panics if the first block cannot be allocated or exceeds [`Config::max_cells`].
    #[inline]
    pub fn with_config_and_hasher(config: Config, build_hasher: H) -> Self {
        match Self::try_with_config_and_hasher(config, build_hasher) {
            Ok(hashmap) => hashmap,
            Err(error) => panic!("{}", error),
        }
    }

    /// Creates an empty [`HashMap`] with its own reclamation [`Domain`].
    ///
    /// # Errors
    ///
    /// Returns an error if the first block cannot be allocated or exceeds
    /// [`Config::max_cells`].
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::{Config, Error, HashMap};
    /// use std::collections::hash_map::RandomState;
    ///
    /// let config = Config::default().initial_cells(64).max_cells(16);
    /// let result: Result<HashMap<u64, u32>, Error> =
    ///     HashMap::try_with_config_and_hasher(config, RandomState::new());
    /// assert_eq!(result.err(), Some(Error::CapacityOverflow { cells: 64 }));
    /// ```
    pub fn try_with_config_and_hasher(config: Config, build_hasher: H) -> Result<Self, Error> {
        let domain = Domain::with_threshold(config.reclaim_threshold);
        Self::with_domain(config, build_hasher, domain)
    }

    /// Creates an empty [`HashMap`] that retires its blocks into an existing [`Domain`].
    ///
    /// Maps sharing a [`Domain`] can be accessed with the same [`Guard`].
    ///
    /// # Errors
    ///
    /// Returns an error if the first block cannot be allocated or exceeds
    /// [`Config::max_cells`].
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::ebr::Domain;
    /// use stripemap::{Config, HashMap};
    /// use std::collections::hash_map::RandomState;
    ///
    /// let domain = Domain::new();
    /// let first: HashMap<u64, u32> =
    ///     HashMap::with_domain(Config::default(), RandomState::new(), domain.clone()).unwrap();
    /// let second: HashMap<u32, u64> =
    ///     HashMap::with_domain(Config::default(), RandomState::new(), domain.clone()).unwrap();
    ///
    /// let participant = domain.register();
    /// let guard = participant.acquire();
    /// assert_eq!(first.insert(1, 2, &guard), Ok(true));
    /// assert_eq!(second.insert(2, 1, &guard), Ok(true));
    /// ```
    pub fn with_domain(
        config: Config,
        build_hasher: H,
        domain: Arc<Domain>,
    ) -> Result<Self, Error> {
        let cells = config.normalized_initial_cells();
        if cells > config.max_cells {
            return Err(Error::CapacityOverflow { cells });
        }
        let block = Block::new(cells, config.overflow_cells_for(cells))?;
        Ok(Self {
            anchor: AtomicPtr::new(Box::into_raw(block)),
            resizing: AtomicBool::new(false),
            domain,
            config,
            build_hasher,
            _marker: PhantomData,
        })
    }

    /// Registers a new [`Participant`] of the map's [`Domain`] for the calling thread.
    #[inline]
    #[must_use]
    pub fn register(&self) -> Participant {
        self.domain.register()
    }

    /// Returns the reclamation [`Domain`] of the map.
    #[inline]
    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    /// Returns the [`Config`] of the map.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a copy of the value associated with the key.
    ///
    /// # Panics
    ///
    /// Panics if the guard belongs to a different [`Domain`].
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    /// let participant = hashmap.register();
    /// let guard = participant.acquire();
    ///
    /// assert!(hashmap.find(&1, &guard).is_none());
    /// assert_eq!(hashmap.insert(1, 10, &guard), Ok(true));
    /// assert_eq!(hashmap.find(&1, &guard), Some(10));
    /// ```
    #[inline]
    pub fn find<Q>(&self, key: &Q, guard: &Guard<'_>) -> Option<V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.check_guard(guard);
        let hash = self.hash(key);
        let mut backoff = Backoff::new(&self.config.spin);
        loop {
            let block = self.block(guard);
            match block.cell(hash).read(key, block.item_count()) {
                Snapshot::Consistent { value, frozen } => {
                    // A locked cell may belong to a block that has just been replaced.
                    if !frozen || ptr::eq(self.anchor.load(Acquire), block) {
                        return value;
                    }
                    backoff.reset();
                }
                Snapshot::Torn => {
                    backoff.snooze();
                }
            }
        }
    }

    /// Returns `true` if the map contains the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    /// let participant = hashmap.register();
    /// let guard = participant.acquire();
    ///
    /// assert!(!hashmap.contains(&1, &guard));
    /// assert_eq!(hashmap.insert(1, 0, &guard), Ok(true));
    /// assert!(hashmap.contains(&1, &guard));
    /// ```
    #[inline]
    pub fn contains<Q>(&self, key: &Q, guard: &Guard<'_>) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.find(key, guard).is_some()
    }

    /// Inserts a key-value pair; returns `Ok(false)` without touching the stored value if the
    /// key exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the map had to grow and the new block could not be allocated; the map
    /// is unchanged in that case.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    /// let participant = hashmap.register();
    /// let guard = participant.acquire();
    ///
    /// assert_eq!(hashmap.insert(1, 0, &guard), Ok(true));
    /// assert_eq!(hashmap.insert(1, 1, &guard), Ok(false));
    /// assert_eq!(hashmap.find(&1, &guard), Some(0));
    /// ```
    #[inline]
    pub fn insert(&self, key: K, value: V, guard: &Guard<'_>) -> Result<bool, Error> {
        self.insert_entry(key, value, false, guard)
    }

    /// Inserts a key-value pair, overwriting the value if the key exists; returns `Ok(true)` if
    /// the key was inserted and `Ok(false)` if it was updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the map had to grow and the new block could not be allocated; the map
    /// is unchanged in that case.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    /// let participant = hashmap.register();
    /// let guard = participant.acquire();
    ///
    /// assert_eq!(hashmap.insert_or_update(1, 0, &guard), Ok(true));
    /// assert_eq!(hashmap.insert_or_update(1, 1, &guard), Ok(false));
    /// assert_eq!(hashmap.find(&1, &guard), Some(1));
    /// ```
    #[inline]
    pub fn insert_or_update(&self, key: K, value: V, guard: &Guard<'_>) -> Result<bool, Error> {
        self.insert_entry(key, value, true, guard)
    }

    /// Removes the key; returns `true` if it was present.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    /// let participant = hashmap.register();
    /// let guard = participant.acquire();
    ///
    /// assert!(!hashmap.remove(&1, &guard));
    /// assert_eq!(hashmap.insert(1, 0, &guard), Ok(true));
    /// assert!(hashmap.remove(&1, &guard));
    /// assert!(!hashmap.remove(&1, &guard));
    /// ```
    pub fn remove<Q>(&self, key: &Q, guard: &Guard<'_>) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.check_guard(guard);
        let hash = self.hash(key);
        loop {
            let block = self.block(guard);
            let cell = block.cell(hash);
            let Some(locked) = self.lock(block, cell) else {
                continue;
            };
            let Some(slot) = (unsafe { cell.locate(locked, key) }) else {
                cell.unlock(locked);
                return false;
            };
            let writing = cell.begin_write(locked);
            let (writing, freed) = unsafe { cell.remove(writing, slot) };
            cell.publish(writing);
            if let Some(item) = freed {
                unsafe {
                    block.free_item(item, &self.config.spin);
                }
            }
            return true;
        }
    }

    /// Locks the cell containing the key, and returns a [`LockedEntry`] holding a copy of its
    /// value.
    ///
    /// Other writers to the same cell wait until the [`LockedEntry`] is released; readers do not.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    /// let participant = hashmap.register();
    /// let guard = participant.acquire();
    ///
    /// assert_eq!(hashmap.insert(1, 10, &guard), Ok(true));
    /// let entry = hashmap.find_and_lock(&1, &guard).unwrap();
    /// assert_eq!(*entry.value(), 10);
    /// entry.update_and_unlock(11);
    /// assert_eq!(hashmap.find(&1, &guard), Some(11));
    /// assert!(hashmap.find_and_lock(&2, &guard).is_none());
    /// ```
    pub fn find_and_lock<'g, Q>(
        &'g self,
        key: &Q,
        guard: &'g Guard<'_>,
    ) -> Option<LockedEntry<'g, K, V>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.check_guard(guard);
        let hash = self.hash(key);
        loop {
            let block = self.block(guard);
            let cell = block.cell(hash);
            let Some(locked) = self.lock(block, cell) else {
                continue;
            };
            let Some(slot) = (unsafe { cell.locate(locked, key) }) else {
                cell.unlock(locked);
                return None;
            };
            return Some(LockedEntry {
                cell,
                locked,
                slot,
                value: unsafe { cell.value(slot) },
            });
        }
    }

    /// Returns the number of cells of the current block.
    #[inline]
    pub fn cell_count(&self, guard: &Guard<'_>) -> usize {
        self.check_guard(guard);
        self.block(guard).cell_count()
    }

    /// Returns the number of entries the current block can hold, inline slots and overflow
    /// items combined.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::{Config, HashMap};
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::with_config(Config::default().initial_cells(256));
    /// let participant = hashmap.register();
    /// let guard = participant.acquire();
    /// assert_eq!(hashmap.capacity(&guard), 256 * 3 + 2 * 10);
    /// ```
    #[inline]
    pub fn capacity(&self, guard: &Guard<'_>) -> usize {
        self.check_guard(guard);
        self.block(guard).capacity()
    }

    /// Returns the number of entries.
    ///
    /// Cells are counted one at a time under their locks, so the result is not a snapshot of
    /// the whole map when other threads are writing. It waits for every [`LockedEntry`] of the
    /// map to be released, and must not be called while the calling thread holds one.
    pub fn len(&self, guard: &Guard<'_>) -> usize {
        self.check_guard(guard);
        'restart: loop {
            let block = self.block(guard);
            let mut len = 0;
            for cell in block.cells() {
                let Some(locked) = self.lock(block, cell) else {
                    continue 'restart;
                };
                unsafe {
                    cell.for_each(locked, |_, _| len += 1);
                }
                cell.unlock(locked);
            }
            return len;
        }
    }

    /// Returns `true` if the map has no entries.
    #[inline]
    pub fn is_empty(&self, guard: &Guard<'_>) -> bool {
        self.len(guard) == 0
    }

    fn insert_entry(
        &self,
        key: K,
        value: V,
        update: bool,
        guard: &Guard<'_>,
    ) -> Result<bool, Error> {
        self.check_guard(guard);
        let hash = self.hash(&key);
        loop {
            let block = self.block(guard);
            let cell = block.cell(hash);
            let Some(locked) = self.lock(block, cell) else {
                continue;
            };
            unsafe {
                if let Some(slot) = cell.locate(locked, &key) {
                    if update {
                        let writing = cell.begin_write(locked);
                        cell.write_value(slot, value);
                        cell.publish(writing);
                    } else {
                        cell.unlock(locked);
                    }
                    return Ok(false);
                }
                if locked.count() < CELL_ITEMS {
                    let writing = cell.begin_write(locked);
                    cell.publish(cell.push_inline(writing, key, value));
                    return Ok(true);
                }
                if let Some(item) = block.alloc_item(hash, &self.config.spin) {
                    let writing = cell.begin_write(locked);
                    cell.publish(cell.push_overflow(writing, item, key, value));
                    return Ok(true);
                }
            }
            self.grow(block, cell, locked, guard)?;
        }
    }

    /// Locks a cell of `block`; returns `None` if `block` was replaced while waiting.
    fn lock(&self, block: &Block<K, V>, cell: &Cell<K, V>) -> Option<CellState> {
        let mut backoff = Backoff::new(&self.config.spin);
        loop {
            let state = cell.state();
            if !state.is_locked() {
                if let Ok(locked) = cell.try_lock(state) {
                    return Some(locked);
                }
                continue;
            }
            if !ptr::eq(self.anchor.load(Acquire), block) {
                return None;
            }
            backoff.snooze();
        }
    }

    /// Replaces `block` with a larger one, or waits for the thread that is already doing so.
    ///
    /// The caller's cell lock is released first.
    fn grow(
        &self,
        block: &Block<K, V>,
        cell: &Cell<K, V>,
        locked: CellState,
        guard: &Guard<'_>,
    ) -> Result<(), Error> {
        cell.unlock(locked);
        if self.resizing.swap(true, Acquire) {
            let mut backoff = Backoff::new(&self.config.spin);
            while self.resizing.load(Acquire) {
                backoff.snooze();
            }
            return Ok(());
        }

        let result = if ptr::eq(self.anchor.load(Acquire), block) {
            self.replace_block(block, guard)
        } else {
            Ok(())
        };
        self.resizing.store(false, Release);

        #[cfg(feature = "tracing")]
        {
            if let Err(error) = &result {
                tracing::debug!(%error, cells = block.cell_count(), "grow failed");
            }
        }
        result
    }

    fn replace_block(&self, block: &Block<K, V>, guard: &Guard<'_>) -> Result<(), Error> {
        let mut backoff = Backoff::new(&self.config.spin);
        for cell in block.cells() {
            loop {
                let state = cell.state();
                if !state.is_locked() && cell.try_lock(state).is_ok() {
                    break;
                }
                backoff.snooze();
            }
            backoff.reset();
        }
        let frozen = Rollback::new(|| block.cells().iter().for_each(Cell::force_unlock));

        let mut cells = block.cell_count();
        let new_block = loop {
            cells = match cells.checked_mul(GROWTH_FACTOR) {
                Some(cells) if cells <= self.config.max_cells => cells,
                _ => {
                    return Err(Error::CapacityOverflow {
                        cells: cells.saturating_mul(GROWTH_FACTOR),
                    })
                }
            };
            let candidate = Block::new(cells, self.config.overflow_cells_for(cells))?;
            if unsafe { candidate.migrate(block, |key| self.hash(key), &self.config.spin) } {
                break candidate;
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(cells, "migration overflowed the new block");
        };
        frozen.commit();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            old_cells = block.cell_count(),
            new_cells = new_block.cell_count(),
            overflow_cells = new_block.overflow_count(),
            "block replaced"
        );

        // Cells of the retired block stay locked, so late writers find the new anchor.
        let retired = self.anchor.swap(Box::into_raw(new_block), AcqRel);
        debug_assert!(ptr::eq(retired, block));
        guard.defer(unsafe { Box::from_raw(retired) });
        guard.promote();
        Ok(())
    }

    /// Returns the current block, which stays valid while `guard` is alive.
    #[inline]
    pub(crate) fn block<'g>(&'g self, _guard: &'g Guard<'_>) -> &'g Block<K, V> {
        unsafe { &*self.anchor.load(Acquire) }
    }

    #[inline]
    fn check_guard(&self, guard: &Guard<'_>) {
        assert!(
            Arc::ptr_eq(guard.domain(), &self.domain),
            "the guard belongs to a different reclamation domain"
        );
    }

    #[inline]
    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }
}

impl<K, V> HashMap<K, V, RandomState>
where
    K: Copy + Eq + Hash + Send + Sync + 'static,
    V: Copy + Send + Sync + 'static,
{
    /// Creates an empty default [`HashMap`].
    ///
    /// # Panics
    ///
    /// Panics if the first block cannot be allocated.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::new();
    /// let participant = hashmap.register();
    /// let guard = participant.acquire();
    /// assert_eq!(hashmap.cell_count(&guard), 256);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty [`HashMap`] with the given [`Config`].
    ///
    /// # Panics
    ///
    /// Panics if the first block cannot be allocated or exceeds [`Config::max_cells`].
    #[inline]
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self::with_config_and_hasher(config, RandomState::new())
    }
}

impl<K, V, H> Default for HashMap<K, V, H>
where
    K: Copy + Eq + Hash + Send + Sync + 'static,
    V: Copy + Send + Sync + 'static,
    H: BuildHasher + Default,
{
    #[inline]
    fn default() -> Self {
        Self::with_hasher(H::default())
    }
}

impl<K, V, H> fmt::Debug for HashMap<K, V, H>
where
    H: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashMap")
            .field("config", &self.config)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl<K, V, H> Drop for HashMap<K, V, H>
where
    H: BuildHasher,
{
    fn drop(&mut self) {
        let block = *self.anchor.get_mut();
        unsafe {
            drop(Box::from_raw(block));
        }
    }
}

impl<'g, K, V> LockedEntry<'g, K, V>
where
    K: Copy,
    V: Copy,
{
    /// Returns the value read when the entry was locked.
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Overwrites the value and releases the lock.
    #[inline]
    pub fn update_and_unlock(self, value: V) {
        let this = ManuallyDrop::new(self);
        let writing = this.cell.begin_write(this.locked);
        unsafe {
            this.cell.write_value(this.slot, value);
        }
        this.cell.publish(writing);
    }

    /// Releases the lock without modifying the entry.
    #[inline]
    pub fn unlock(self) {
        drop(self);
    }
}

impl<K, V> fmt::Debug for LockedEntry<'_, K, V>
where
    K: Copy,
    V: Copy + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedEntry")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl<K, V> Drop for LockedEntry<'_, K, V>
where
    K: Copy,
    V: Copy,
{
    #[inline]
    fn drop(&mut self) {
        self.cell.unlock(self.locked);
    }
}
