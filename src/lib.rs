//! Block-structured linear system assembly for coupled multi-physics
//! finite element problems.
//!
//! Physics modules contribute per-field operators, coupling blocks and
//! Lagrange-multiplier unknowns; the assembly engine places them into a
//! grid of sparse blocks with consistent global offsets, eliminates
//! essential (Dirichlet) degrees of freedom symmetrically, shrinks away
//! structurally empty rows and columns, and hands a monolithic operator to
//! a linear solver in one of several equivalent encodings.

pub mod assembly;
pub mod block;
pub mod comm;
pub mod grid;
pub mod physics;
pub mod solver;

pub extern crate nalgebra;

pub use num::complex::Complex64;
