//! Building blocks of [`HashMap`](crate::HashMap).

pub(crate) mod block;
pub(crate) mod cell;
pub(crate) mod overflow;
pub(crate) mod state;

/// The number of inline entry slots in a cell.
pub(crate) const CELL_ITEMS: usize = 3;
