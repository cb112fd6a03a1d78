//! The linear-system assembly engine.
//!
//! One assembly pass runs a fixed, strictly sequential phase sequence:
//! allocate fields and unknowns, update parameters, initialize physics,
//! apply essential values, assemble local and mixed forms, form per-field
//! local systems, collect global essential index sets, assemble extra
//! unknowns and interpolation constraints, place everything into the
//! global block grid, eliminate and shrink, and finalize into a
//! solver-consumable encoding. A failed pass poisons its context; the next
//! attempt must re-run from allocation.

pub mod context;
pub mod engine;
pub mod essential;

pub use context::AssemblyContext;
pub use engine::{AssembledPass, Assembler, AssemblyOptions, Solution};
pub use essential::DiagPolicy;
