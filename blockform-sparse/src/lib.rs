//! Sequential sparse matrix functionality for `blockform`.
//!
//! General-purpose sparse crates do not expose the row/column surgery the
//! block assembly layer needs (row resets, diagonal overwrites, index-set
//! restriction), so the kernel lives here.

mod sparse;

pub use sparse::{selection_matrix, CooMatrix, CsrMatrix};
