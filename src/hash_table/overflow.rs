use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::{self, addr_of_mut};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};

use crate::backoff::Backoff;
use crate::config::SpinPolicy;

/// The number of items in an [`OverflowCell`].
pub(crate) const OVERFLOW_ITEMS: usize = 10;

/// [`OverflowItem`] stores an entry that did not fit into the inline slots of its cell.
///
/// While it is in use, `next` links the overflow chain of the owning cell; while it is free, it
/// links the free list of its home [`OverflowCell`].
pub(crate) struct OverflowItem<K, V> {
    next: AtomicPtr<OverflowItem<K, V>>,
    key: UnsafeCell<MaybeUninit<K>>,
    value: UnsafeCell<MaybeUninit<V>>,
    home: usize,
}

impl<K, V> OverflowItem<K, V> {
    #[inline]
    pub(crate) fn next_link(&self) -> &AtomicPtr<OverflowItem<K, V>> {
        &self.next
    }

    /// Returns the index of the overflow cell the item belongs to.
    #[inline]
    pub(crate) fn home(&self) -> usize {
        self.home
    }

    #[inline]
    pub(crate) fn key_ptr(&self) -> *mut MaybeUninit<K> {
        self.key.get()
    }

    #[inline]
    pub(crate) fn value_ptr(&self) -> *mut MaybeUninit<V> {
        self.value.get()
    }
}

/// [`OverflowCell`] is a lock-protected pool of [`OverflowItem`] instances shared by several
/// cells.
#[repr(align(64))]
pub(crate) struct OverflowCell<K, V> {
    lock: AtomicBool,
    available: AtomicUsize,
    free: UnsafeCell<*mut OverflowItem<K, V>>,
    items: [OverflowItem<K, V>; OVERFLOW_ITEMS],
}

impl<K, V> OverflowCell<K, V> {
    /// Links the free list of a zero-initialized [`OverflowCell`].
    ///
    /// # Safety
    ///
    /// `this` must point to zeroed memory that no other thread can access.
    pub(crate) unsafe fn init(this: *mut Self, home: usize) {
        let items = addr_of_mut!((*this).items).cast::<OverflowItem<K, V>>();
        for i in 0..OVERFLOW_ITEMS {
            let item = items.add(i);
            let next = if i + 1 < OVERFLOW_ITEMS {
                items.add(i + 1)
            } else {
                ptr::null_mut()
            };
            addr_of_mut!((*item).home).write(home);
            (*item).next.store(next, Relaxed);
        }
        addr_of_mut!((*this).free).write(UnsafeCell::new(items));
        (*this).available.store(OVERFLOW_ITEMS, Relaxed);
    }

    /// Returns the number of free items.
    #[cfg(test)]
    #[inline]
    pub(crate) fn available(&self) -> usize {
        self.available.load(Relaxed)
    }

    /// Pops a free item without waiting for the lock.
    pub(crate) fn try_pop(&self) -> Option<Option<*mut OverflowItem<K, V>>> {
        if !self.try_lock() {
            return None;
        }
        let item = unsafe { self.pop_locked() };
        self.unlock();
        Some(item)
    }

    /// Pops a free item, waiting for the lock.
    pub(crate) fn pop(&self, spin: &SpinPolicy) -> Option<*mut OverflowItem<K, V>> {
        self.lock(spin);
        let item = unsafe { self.pop_locked() };
        self.unlock();
        item
    }

    /// Returns an item to the free list.
    ///
    /// # Safety
    ///
    /// The item must belong to `self` and must no longer be reachable from any overflow chain.
    pub(crate) unsafe fn push(&self, item: *mut OverflowItem<K, V>, spin: &SpinPolicy) {
        debug_assert!(self
            .items
            .as_ptr_range()
            .contains(&item.cast_const()));
        self.lock(spin);
        let free = &mut *self.free.get();
        (*item).next.store(*free, Relaxed);
        *free = item;
        self.available.fetch_add(1, Relaxed);
        self.unlock();
    }

    unsafe fn pop_locked(&self) -> Option<*mut OverflowItem<K, V>> {
        let free = &mut *self.free.get();
        if free.is_null() {
            return None;
        }
        let item = *free;
        *free = (*item).next.load(Relaxed);
        (*item).next.store(ptr::null_mut(), Relaxed);
        self.available.fetch_sub(1, Relaxed);
        Some(item)
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Acquire, Relaxed)
            .is_ok()
    }

    fn lock(&self, spin: &SpinPolicy) {
        let mut backoff = Backoff::new(spin);
        while !self.try_lock() {
            while self.lock.load(Relaxed) {
                backoff.snooze();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        self.lock.store(false, Release);
    }
}
