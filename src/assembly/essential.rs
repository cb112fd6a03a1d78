//! Essential (Dirichlet) degree-of-freedom elimination.
//!
//! Elimination runs in three places. Per field, the prescribed values are
//! folded into the field's own local system ([`form_local_system`]). Across
//! fields, a horizontal pass zeroes essential rows in the off-diagonal
//! blocks of the field's grid row, and a vertical pass captures what the
//! now-fixed essential columns would inject into other rows, stored in a
//! separate elimination grid and applied to the right-hand side at
//! finalize time (`b := b - Ae·b`).

use crate::block::{Block, DistBlock, Partition, Values};
use crate::comm::SharedComm;
use crate::grid::BlockGrid;
use crate::Complex64;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// How the diagonal of eliminated essential dofs is written.
///
/// `DiagOne` sets the diagonal entry to exactly 1 and `b[ess]` to the
/// prescribed value. `DiagKeep` preserves the assembled diagonal value `d`
/// and sets `b[ess] = d · value`, which keeps the operator's scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiagPolicy {
    DiagOne,
    #[default]
    DiagKeep,
}

/// Builds an n×1 block carrying this rank's slice of a vector, matching
/// the backend and partitioning of `reference`'s rows.
pub(crate) fn vector_block_like(
    reference: &Block,
    local: &DVector<Complex64>,
    complex: bool,
) -> Block {
    match reference {
        Block::Dist(d) => {
            let part = reference.row_partition();
            assert_eq!(local.len(), part.local_len());
            Block::Dist(DistBlock::new(
                SharedComm::clone(d.comm()),
                part,
                Partition::serial(1),
                Values::vector(local, complex),
            ))
        }
        _ => {
            assert_eq!(local.len(), reference.nrows());
            Block::local_vector(local, complex)
        }
    }
}

/// Folds the prescribed essential values of one field into its local
/// square system:
///
/// 1. `b := b - A · x_e` where `x_e` carries the prescribed values at the
///    essential dofs and zeros elsewhere;
/// 2. essential rows and columns of `A` are dropped;
/// 3. the diagonal and `b[ess]` are written per the [`DiagPolicy`], with a
///    zero imaginary part on the diagonal of complex blocks.
///
/// `ess` holds globally collected essential dofs; `x` is the field's
/// unknown block holding prescribed values. After this the reduced system
/// satisfies `x[ess] = value` by construction.
///
/// Returns the diagonal values written at the essential dofs, in `ess`
/// order; the vertical elimination pass needs them to keep `b := b - Ae·b`
/// exact under either policy.
pub fn form_local_system(
    a: &mut Block,
    b: &mut Block,
    x: &Block,
    ess: &[usize],
    policy: DiagPolicy,
) -> Vec<Complex64> {
    if ess.is_empty() {
        return Vec::new();
    }

    let xg = x.dense_vector();
    let diag: Vec<Complex64> = match policy {
        DiagPolicy::DiagOne => Vec::new(),
        DiagPolicy::DiagKeep => {
            let full = a.global_values().to_complex();
            ess.iter().map(|&g| full.get(g, g)).collect()
        }
    };

    let mut xe = DVector::zeros(xg.len());
    for &g in ess {
        xe[g] = xg[g];
    }
    let row_part = a.row_partition();
    let local_xe = DVector::from_iterator(
        row_part.local_len(),
        (row_part.begin..row_part.end).map(|g| xe[g]),
    );
    let correction = a.dot(&vector_block_like(a, &local_xe, x.is_complex()));
    *b = b.sub(&correction);

    a.reset_rows(ess);
    a.reset_cols(ess);

    match policy {
        DiagPolicy::DiagOne => {
            a.set_diag(ess, Complex64::new(1.0, 0.0));
            let values: Vec<Complex64> = ess.iter().map(|&g| xg[g]).collect();
            b.set_vector_entries(ess, &values);
            vec![Complex64::new(1.0, 0.0); ess.len()]
        }
        DiagPolicy::DiagKeep => {
            // A zero assembled diagonal cannot pin the unknown; fall back
            // to a unit entry there.
            let diag: Vec<Complex64> = diag
                .into_iter()
                .map(|d| {
                    if d == Complex64::new(0.0, 0.0) {
                        Complex64::new(1.0, 0.0)
                    } else {
                        d
                    }
                })
                .collect();
            a.set_diag_values(ess, &diag);
            let values: Vec<Complex64> = ess
                .iter()
                .zip(&diag)
                .map(|(&g, d)| *d * xg[g])
                .collect();
            b.set_vector_entries(ess, &values);
            diag
        }
    }
}

/// Horizontal pass: zeroes the essential rows of every off-diagonal block
/// in the field's grid row, removing the coupling from the field's
/// essential unknowns into other equations.
pub fn eliminate_essential_rows(m: &mut BlockGrid, field: usize, ess: &[usize]) {
    if ess.is_empty() {
        return;
    }
    for jb in 0..m.ncols() {
        if jb == field {
            continue;
        }
        if let Some(block) = m.get_mut(field, jb) {
            block.reset_rows(ess);
        }
    }
}

/// Vertical pass: for every off-diagonal block in the field's grid column,
/// stores `Ae[r, f] = A[r, f] · S` into the elimination grid, where `S`
/// selects the field's essential columns. At each essential index `S`
/// carries the reciprocal of the diagonal written by
/// [`form_local_system`], so that `Ae · b` reproduces exactly the
/// contribution of the prescribed values (`b[ess] = d · value`) under
/// either diagonal policy. `diag` is aligned with `ess`; unit entries are
/// assumed where it is shorter (fields whose diagonal was never formed).
pub fn fill_elimination_blocks(
    m: &BlockGrid,
    elimination: &mut BlockGrid,
    field: usize,
    ess: &[usize],
    diag: &[Complex64],
) {
    if ess.is_empty() {
        return;
    }
    let inv_diag: Vec<Complex64> = (0..ess.len())
        .map(|k| match diag.get(k) {
            Some(d) => Complex64::new(1.0, 0.0) / *d,
            None => Complex64::new(1.0, 0.0),
        })
        .collect();
    for ib in 0..m.nrows() {
        if ib == field {
            continue;
        }
        if let Some(block) = m.get(ib, field) {
            let mut selector = block.square_from_right();
            selector.set_diag_values(ess, &inv_diag);
            elimination.set(ib, field, block.dot(&selector));
        }
    }
}
