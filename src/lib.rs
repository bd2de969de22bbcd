//! Lock-striped concurrent hash map with optimistic reads and epoch-based reclamation.
//!
//! # stripemap::HashMap
//! A concurrent hash map of plain `Copy` keys and values. Each cell of the table is a small
//! seqlock-protected bucket: writers lock a single cell, readers never lock. When the overflow
//! pool of the table runs dry the table is rebuilt four times larger.
//!
//! # stripemap::ebr
//! Epoch-based reclamation with an explicitly constructed [`Domain`](ebr::Domain). Threads
//! register a [`Participant`](ebr::Participant) and bracket their work with a
//! [`Guard`](ebr::Guard); retired tables are dropped once no guard can observe them.

mod backoff;
mod rollback;

pub mod config;
pub use config::{Config, SpinPolicy};

pub mod ebr;

mod error;
pub use error::Error;

mod hash_table;

pub mod hash_map;
pub use hash_map::{HashMap, LockedEntry};

pub use equivalent::Equivalent;
