//! The linear-solver interface and a reference dense direct solver.
//!
//! Production solvers are external collaborators; they consume exactly one
//! of the finalized monolithic encodings and return a flat solution vector
//! in the same numbering. The dense LU implementation here exists so that
//! assembled systems can be solved in tests and small examples without an
//! external backend.

use crate::block::{RealSplit, Values};
use crate::grid::InterleavedOperator;
use crate::Complex64;
use blockform_sparse::CsrMatrix;
use eyre::eyre;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// The monolithic encoding a solver consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SolverFormat {
    /// Coordinate/CSR matrix in the system's native dtype.
    #[default]
    Coo,
    /// Real matrix with stacked real/imaginary parts (doubles the unknown
    /// count for complex systems).
    CooReal,
    /// Real block operator with per-field interleaved real/imaginary
    /// blocks, for solvers that precondition field by field.
    BlkInterleave,
}

/// A finalized linear system in one of the supported encodings.
pub enum AssembledSystem {
    Coo {
        matrix: Values,
        rhs: Vec<DVector<Complex64>>,
    },
    CooReal {
        matrix: CsrMatrix<f64>,
        rhs: Vec<DVector<f64>>,
        split: RealSplit,
    },
    BlkInterleave {
        operator: InterleavedOperator,
        rhs: Vec<DVector<f64>>,
    },
}

impl AssembledSystem {
    pub fn unknown_count(&self) -> usize {
        match self {
            AssembledSystem::Coo { matrix, .. } => matrix.nrows(),
            AssembledSystem::CooReal { matrix, .. } => matrix.nrows(),
            AssembledSystem::BlkInterleave { operator, .. } => operator.nrows(),
        }
    }
}

pub trait LinearSolver {
    fn name(&self) -> &str;

    fn format(&self) -> SolverFormat {
        SolverFormat::Coo
    }

    /// Checked before the system is finalized; a missing required setting
    /// must surface here.
    fn verify_settings(&self) -> eyre::Result<()> {
        Ok(())
    }

    /// Solves against every right-hand side. Solutions come back in the
    /// encoding's own numbering; real encodings carry zero imaginary parts
    /// and are decoded by the assembly engine. Solver failures (e.g.
    /// non-convergence) are propagated unchanged, never retried.
    fn solve(&self, system: &AssembledSystem) -> eyre::Result<Vec<DVector<Complex64>>>;
}

/// Direct dense LU factorization via `nalgebra`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseLuSolver {
    format: SolverFormat,
}

impl DenseLuSolver {
    pub fn new(format: SolverFormat) -> Self {
        DenseLuSolver { format }
    }
}

impl LinearSolver for DenseLuSolver {
    fn name(&self) -> &str {
        "dense-lu"
    }

    fn format(&self) -> SolverFormat {
        self.format
    }

    fn solve(&self, system: &AssembledSystem) -> eyre::Result<Vec<DVector<Complex64>>> {
        match system {
            AssembledSystem::Coo { matrix, rhs } => match matrix {
                Values::Real(m) => {
                    let lu = m.to_dense().lu();
                    rhs.iter()
                        .map(|b| {
                            let b_re = b.map(|z| z.re);
                            lu.solve(&b_re)
                                .map(|x| x.map(|v| Complex64::new(v, 0.0)))
                                .ok_or_else(|| eyre!("dense-lu: operator is singular"))
                        })
                        .collect()
                }
                Values::Complex(m) => {
                    let lu = m.to_dense().lu();
                    rhs.iter()
                        .map(|b| {
                            lu.solve(b)
                                .ok_or_else(|| eyre!("dense-lu: operator is singular"))
                        })
                        .collect()
                }
            },
            AssembledSystem::CooReal { matrix, rhs, .. } => {
                let lu = matrix.to_dense().lu();
                rhs.iter()
                    .map(|b| {
                        lu.solve(b)
                            .map(|x| x.map(|v| Complex64::new(v, 0.0)))
                            .ok_or_else(|| eyre!("dense-lu: operator is singular"))
                    })
                    .collect()
            }
            AssembledSystem::BlkInterleave { operator, rhs } => {
                let lu = operator.to_monolithic().to_dense().lu();
                rhs.iter()
                    .map(|b| {
                        lu.solve(b)
                            .map(|x| x.map(|v| Complex64::new(v, 0.0)))
                            .ok_or_else(|| eyre!("dense-lu: operator is singular"))
                    })
                    .collect()
            }
        }
    }
}
