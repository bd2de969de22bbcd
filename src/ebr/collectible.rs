use std::mem::ManuallyDrop;
use std::ptr;

/// [`Link`] is the header of every node handed to a [`Domain`](super::Domain).
///
/// The header sits at offset zero of its node so that a `*mut Link` can be cast back to the
/// concrete node by the type-erased `execute` function.
#[repr(C)]
pub(super) struct Link {
    next: *mut Link,
    execute: unsafe fn(*mut Link),
}

impl Link {
    /// Sets the next node in the list.
    #[inline]
    pub(super) fn set_next(&mut self, next: *mut Link) {
        self.next = next;
    }

    /// Executes and deallocates every node reachable from `head`, returning how many there were.
    ///
    /// # Safety
    ///
    /// The list must be exclusively owned by the caller, and no other thread may still be able to
    /// reach the resources the nodes reclaim.
    pub(super) unsafe fn execute_all(mut head: *mut Link) -> usize {
        let mut executed = 0;
        while !head.is_null() {
            let next = (*head).next;
            ((*head).execute)(head);
            executed += 1;
            head = next;
        }
        executed
    }
}

/// [`Deferred`] wraps a closure that runs once every thread that could observe the retired
/// resource has left.
#[repr(C)]
struct Deferred<F: FnOnce()> {
    link: Link,
    f: ManuallyDrop<F>,
}

impl<F: FnOnce() + Send + 'static> Deferred<F> {
    /// Allocates a node for the closure.
    fn alloc(f: F) -> *mut Link {
        let boxed = Box::new(Deferred {
            link: Link {
                next: ptr::null_mut(),
                execute: Self::execute,
            },
            f: ManuallyDrop::new(f),
        });
        Box::into_raw(boxed).cast::<Link>()
    }

    unsafe fn execute(link: *mut Link) {
        let mut boxed = Box::from_raw(link.cast::<Deferred<F>>());
        let f = ManuallyDrop::take(&mut boxed.f);
        drop(boxed);
        f();
    }
}

/// Creates a type-erased node that executes `f` when reclaimed.
#[inline]
pub(super) fn deferred<F: FnOnce() + Send + 'static>(f: F) -> *mut Link {
    Deferred::alloc(f)
}

/// [`Batch`] is a thread-local list of nodes that have not been flushed yet.
pub(super) struct Batch {
    head: *mut Link,
    tail: *mut Link,
    len: usize,
}

impl Batch {
    #[inline]
    pub(super) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub(super) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub(super) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(super) fn head(&self) -> *mut Link {
        self.head
    }

    #[inline]
    pub(super) fn tail(&self) -> *mut Link {
        self.tail
    }

    /// Pushes a node to the front.
    pub(super) fn push(&mut self, link: *mut Link) {
        debug_assert!(!link.is_null());
        unsafe {
            (*link).set_next(self.head);
        }
        if self.tail.is_null() {
            self.tail = link;
        }
        self.head = link;
        self.len += 1;
    }

    /// Takes the whole list, leaving `self` empty.
    #[inline]
    pub(super) fn take(&mut self) -> Batch {
        std::mem::replace(self, Batch::new())
    }

    /// Forgets the nodes after their ownership was transferred to a shared list.
    #[inline]
    pub(super) fn forget(mut self) {
        self.head = ptr::null_mut();
        self.tail = ptr::null_mut();
        self.len = 0;
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        // Only reachable when the owning participant is torn down without ever flushing, in which
        // case nobody else can observe the retired resources.
        unsafe {
            Link::execute_all(self.head);
        }
    }
}
