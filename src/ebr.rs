//! Epoch-based reclamation.
//!
//! A [`Domain`] owns a small ring of collectors. Exactly one collector is current at any time;
//! a thread that [acquires](Participant::acquire) the domain is counted in the current collector,
//! and every node retired through a [`Guard`] is queued on the collector that is current when the
//! retiring thread flushes its local list. A collector's queue is executed by whichever thread
//! drops the collector's reference count to zero, which happens only after every thread that was
//! counted in it, and every older collector, has left.
//!
//! Threads advertise progress by calling [`Guard::quiescent`] between units of work; the current
//! collector is advanced when a thread's flushed garbage exceeds the domain's threshold, or when a
//! thread [promotes](Guard::promote) its garbage after retiring something large.
//!
//! ```
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//! use stripemap::ebr::Domain;
//!
//! let domain = Domain::new();
//! let participant = domain.register();
//! let dropped = Arc::new(AtomicBool::new(false));
//!
//! let mut guard = participant.acquire();
//! let flag = dropped.clone();
//! guard.defer_execute(move || flag.store(true, Ordering::Release));
//! guard.promote();
//! guard.quiescent();
//! drop(guard);
//!
//! let mut guard = participant.acquire();
//! guard.promote();
//! guard.quiescent();
//! drop(guard);
//! assert!(dropped.load(Ordering::Acquire));
//! ```

mod collectible;

mod collector;
pub use collector::COLLECTOR_COUNT;

mod domain;
pub use domain::Domain;

mod guard;
pub use guard::Guard;

mod participant;
pub use participant::{Participant, ThreadState};
