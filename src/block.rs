//! Sparse sub-matrix blocks and their backends.
//!
//! A [`Block`] is one cell of a block grid: a sparse matrix (or n×1 vector)
//! that is either sequential ([`Block::Local`]), row-partitioned across a
//! process group ([`Block::Dist`]), or the multiplicative identity
//! placeholder ([`Block::Identity`]). Every grid operation is written once
//! against this enum; no caller dispatches on the concrete backend.
//!
//! Numeric data is exclusively owned by the holding cell. Rust ownership
//! makes accidental aliasing between cells impossible, which discharges the
//! sharing invariant the original engine had to check at runtime.

use crate::comm::SharedComm;
use blockform_sparse::{selection_matrix, CooMatrix, CsrMatrix};
use nalgebra::{DMatrix, DVector};
use num::complex::Complex64;
use num::Zero;
use serde::{Deserialize, Serialize};

/// A contiguous index range owned by one rank, plus the global extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub begin: usize,
    pub end: usize,
    pub global: usize,
}

impl Partition {
    /// The whole range on a single rank.
    pub fn serial(n: usize) -> Self {
        Partition {
            begin: 0,
            end: n,
            global: n,
        }
    }

    pub fn local_len(&self) -> usize {
        self.end - self.begin
    }

    pub fn contains(&self, i: usize) -> bool {
        i >= self.begin && i < self.end
    }
}

/// Sign convention for converting a complex operator to a real one.
///
/// `Standard` stacks `[[Re, -Im], [Im, Re]]` with right-hand side
/// `[Re(b); Im(b)]`. `Symmetric` stacks `[[Re, -Im], [-Im, -Re]]` with
/// right-hand side `[Re(b); -Im(b)]`, which preserves symmetry of a
/// symmetric complex operator. Both encode the same solution `[Re(x); Im(x)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RealSplit {
    #[default]
    Standard,
    Symmetric,
}

/// Element storage of one block: a real or complex CSR matrix.
///
/// Mixed-dtype operations promote to complex.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Real(CsrMatrix<f64>),
    Complex(CsrMatrix<Complex64>),
}

impl Values {
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Values::Real(CsrMatrix::new(nrows, ncols))
    }

    pub fn from_dense(matrix: &DMatrix<f64>) -> Self {
        Values::Real(CsrMatrix::from_dense(matrix))
    }

    pub fn from_dense_complex(matrix: &DMatrix<Complex64>) -> Self {
        Values::Complex(CsrMatrix::from_dense(matrix))
    }

    /// An n×1 column from a dense vector. Stored real unless any entry has
    /// a nonzero imaginary part or `complex` forces the complex dtype.
    pub fn vector(v: &DVector<Complex64>, complex: bool) -> Self {
        if complex || v.iter().any(|z| z.im != 0.0) {
            Values::from_dense_complex(&DMatrix::from_column_slice(v.len(), 1, v.as_slice()))
        } else {
            let re: Vec<f64> = v.iter().map(|z| z.re).collect();
            Values::from_dense(&DMatrix::from_column_slice(v.len(), 1, &re))
        }
    }

    pub fn nrows(&self) -> usize {
        match self {
            Values::Real(m) => m.nrows(),
            Values::Complex(m) => m.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Values::Real(m) => m.ncols(),
            Values::Complex(m) => m.ncols(),
        }
    }

    pub fn nnz(&self) -> usize {
        match self {
            Values::Real(m) => m.nnz(),
            Values::Complex(m) => m.nnz(),
        }
    }

    pub fn true_nnz(&self) -> usize {
        match self {
            Values::Real(m) => m.true_nnz(),
            Values::Complex(m) => m.true_nnz(),
        }
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, Values::Complex(_))
    }

    pub fn to_complex(&self) -> CsrMatrix<Complex64> {
        match self {
            Values::Real(m) => m.map_values(|v| Complex64::new(*v, 0.0)),
            Values::Complex(m) => m.clone(),
        }
    }

    pub fn real_part(&self) -> CsrMatrix<f64> {
        match self {
            Values::Real(m) => m.clone(),
            Values::Complex(m) => m.map_values(|v| v.re).drop_zeros(),
        }
    }

    pub fn imag_part(&self) -> CsrMatrix<f64> {
        match self {
            Values::Real(m) => CsrMatrix::new(m.nrows(), m.ncols()),
            Values::Complex(m) => m.map_values(|v| v.im).drop_zeros(),
        }
    }

    pub fn to_dense_complex(&self) -> DMatrix<Complex64> {
        self.to_complex().to_dense()
    }

    pub fn add(&self, other: &Values) -> Values {
        match (self, other) {
            (Values::Real(a), Values::Real(b)) => Values::Real(a.add(b)),
            _ => Values::Complex(self.to_complex().add(&other.to_complex())),
        }
    }

    pub fn sub(&self, other: &Values) -> Values {
        self.add(&other.negated())
    }

    pub fn negated(&self) -> Values {
        match self {
            Values::Real(m) => Values::Real(m.negated()),
            Values::Complex(m) => Values::Complex(m.negated()),
        }
    }

    pub fn scaled(&self, factor: Complex64) -> Values {
        match self {
            Values::Real(m) if factor.im == 0.0 => {
                let mut m = m.clone();
                m.scale_mut(factor.re);
                Values::Real(m)
            }
            _ => {
                let mut m = self.to_complex();
                m.scale_mut(factor);
                Values::Complex(m)
            }
        }
    }

    pub fn conjugated(&self) -> Values {
        match self {
            Values::Real(m) => Values::Real(m.clone()),
            Values::Complex(m) => {
                let mut m = m.clone();
                m.conjugate_mut();
                Values::Complex(m)
            }
        }
    }

    pub fn transposed(&self) -> Values {
        match self {
            Values::Real(m) => Values::Real(m.transpose()),
            Values::Complex(m) => Values::Complex(m.transpose()),
        }
    }

    pub fn dot(&self, other: &Values) -> Values {
        match (self, other) {
            (Values::Real(a), Values::Real(b)) => Values::Real(a.spmm(b)),
            _ => Values::Complex(self.to_complex().spmm(&other.to_complex())),
        }
    }

    pub fn reset_rows(&mut self, rows: &[usize]) {
        match self {
            Values::Real(m) => m.reset_rows(rows),
            Values::Complex(m) => m.reset_rows(rows),
        }
    }

    pub fn reset_cols(&mut self, cols: &[usize]) {
        match self {
            Values::Real(m) => m.reset_cols(cols),
            Values::Complex(m) => m.reset_cols(cols),
        }
    }

    /// Overwrites the entries at the given coordinates, inserting them when
    /// not structurally present.
    pub fn set_entries(&mut self, entries: &[(usize, usize, Complex64)]) {
        fn overwrite<T: nalgebra::Scalar + Zero + nalgebra::ClosedAdd>(
            m: &CsrMatrix<T>,
            entries: impl Iterator<Item = (usize, usize, T)>,
            coords: &[(usize, usize)],
        ) -> CsrMatrix<T> {
            let mut coo = m.filter(|i, j, _| !coords.contains(&(i, j))).to_coo();
            for (i, j, v) in entries {
                coo.push(i, j, v);
            }
            coo.to_csr()
        }
        let coords: Vec<(usize, usize)> = entries.iter().map(|&(i, j, _)| (i, j)).collect();
        match self {
            Values::Real(m) if entries.iter().all(|(_, _, v)| v.im == 0.0) => {
                *m = overwrite(m, entries.iter().map(|&(i, j, v)| (i, j, v.re)), &coords)
            }
            _ => {
                *self = Values::Complex(overwrite(
                    &self.to_complex(),
                    entries.iter().copied(),
                    &coords,
                ))
            }
        }
    }

    pub fn select_rows(&self, keep: &[usize]) -> Values {
        match self {
            Values::Real(m) => Values::Real(m.select_rows(keep)),
            Values::Complex(m) => Values::Complex(m.select_rows(keep)),
        }
    }

    pub fn select_cols(&self, keep: &[usize]) -> Values {
        match self {
            Values::Real(m) => Values::Real(m.select_cols(keep)),
            Values::Complex(m) => Values::Complex(m.select_cols(keep)),
        }
    }

    pub fn nonzero_rows(&self) -> Vec<usize> {
        match self {
            Values::Real(m) => m.nonzero_rows(),
            Values::Complex(m) => m.nonzero_rows(),
        }
    }

    /// Interprets an n×1 block as a dense vector.
    pub fn dense_vector(&self) -> DVector<Complex64> {
        assert_eq!(self.ncols(), 1, "dense_vector requires an n×1 block");
        let dense = self.to_dense_complex();
        DVector::from_iterator(dense.nrows(), dense.column(0).iter().cloned())
    }

    /// The equivalent real matrix of a complex one, per the chosen sign
    /// convention. The shape doubles in both dimensions.
    pub fn real_stacked(&self, split: RealSplit) -> CsrMatrix<f64> {
        let (m, n) = (self.nrows(), self.ncols());
        let mut coo = CooMatrix::new(2 * m, 2 * n);
        let complex = self.to_complex();
        for (i, j, v) in complex.iter() {
            if v.re != 0.0 {
                coo.push(i, j, v.re);
            }
            if v.im != 0.0 {
                coo.push(i, j + n, -v.im);
            }
            match split {
                RealSplit::Standard => {
                    if v.im != 0.0 {
                        coo.push(i + m, j, v.im);
                    }
                    if v.re != 0.0 {
                        coo.push(i + m, j + n, v.re);
                    }
                }
                RealSplit::Symmetric => {
                    if v.im != 0.0 {
                        coo.push(i + m, j, -v.im);
                    }
                    if v.re != 0.0 {
                        coo.push(i + m, j + n, -v.re);
                    }
                }
            }
        }
        coo.to_csr()
    }
}

/// A row-partitioned block: this rank holds the contiguous row slice
/// `row_part.begin..row_part.end` with global column indexing.
///
/// All ranks of the group must hold the same element dtype; collective
/// operations (`gather_values`, `dot`, `transposed`, column/row selection)
/// must be entered by every rank in the same order.
#[derive(Clone)]
pub struct DistBlock {
    comm: SharedComm,
    row_part: Partition,
    col_part: Partition,
    values: Values,
}

impl std::fmt::Debug for DistBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistBlock")
            .field("row_part", &self.row_part)
            .field("col_part", &self.col_part)
            .field("values", &self.values)
            .finish()
    }
}

impl DistBlock {
    pub fn new(comm: SharedComm, row_part: Partition, col_part: Partition, values: Values) -> Self {
        assert_eq!(
            values.nrows(),
            row_part.local_len(),
            "local row count must match the row partition"
        );
        assert_eq!(
            values.ncols(),
            col_part.global,
            "distributed blocks store all global columns"
        );
        DistBlock {
            comm,
            row_part,
            col_part,
            values,
        }
    }

    /// Builds the row partition of this rank by gathering local row counts.
    pub fn partition_from_counts(comm: &SharedComm, local_len: usize) -> Partition {
        let counts = comm.allgather_count(local_len);
        let begin: usize = counts[..comm.rank()].iter().sum();
        Partition {
            begin,
            end: begin + local_len,
            global: counts.iter().sum(),
        }
    }

    pub fn comm(&self) -> &SharedComm {
        &self.comm
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    /// Gathers the full global matrix onto every rank. Collective.
    pub fn gather_values(&self) -> Values {
        let (rows, cols): (Vec<usize>, Vec<usize>) = {
            let coo = match &self.values {
                Values::Real(m) => m.to_coo().triplet_iter().map(|(i, j, _)| (i, j)).collect::<Vec<_>>(),
                Values::Complex(m) => m.to_coo().triplet_iter().map(|(i, j, _)| (i, j)).collect::<Vec<_>>(),
            };
            coo.into_iter()
                .map(|(i, j)| (i + self.row_part.begin, j))
                .unzip()
        };
        let all_rows = self.comm.allgather_usizes(&rows);
        let all_cols = self.comm.allgather_usizes(&cols);
        match &self.values {
            Values::Real(m) => {
                let vals: Vec<f64> = m.to_coo().triplet_iter().map(|(_, _, v)| *v).collect();
                let all_vals = self.comm.allgather_f64s(&vals);
                Values::Real(
                    CooMatrix::from_triplets(
                        self.row_part.global,
                        self.col_part.global,
                        all_rows,
                        all_cols,
                        all_vals,
                    )
                    .to_csr(),
                )
            }
            Values::Complex(m) => {
                let re: Vec<f64> = m.to_coo().triplet_iter().map(|(_, _, v)| v.re).collect();
                let im: Vec<f64> = m.to_coo().triplet_iter().map(|(_, _, v)| v.im).collect();
                let all_re = self.comm.allgather_f64s(&re);
                let all_im = self.comm.allgather_f64s(&im);
                let all_vals = all_re
                    .into_iter()
                    .zip(all_im)
                    .map(|(re, im)| Complex64::new(re, im))
                    .collect();
                Values::Complex(
                    CooMatrix::from_triplets(
                        self.row_part.global,
                        self.col_part.global,
                        all_rows,
                        all_cols,
                        all_vals,
                    )
                    .to_csr(),
                )
            }
        }
    }
}

/// The identity placeholder: behaves as the n×n identity under `dot`.
#[derive(Debug, Clone)]
pub struct IdentityBlock {
    n: usize,
    part: Partition,
}

/// One cell of a block grid.
#[derive(Debug, Clone)]
pub enum Block {
    Local(Values),
    Dist(DistBlock),
    Identity(IdentityBlock),
}

impl Block {
    pub fn from_dense(matrix: &DMatrix<f64>) -> Self {
        Block::Local(Values::from_dense(matrix))
    }

    pub fn from_dense_complex(matrix: &DMatrix<Complex64>) -> Self {
        Block::Local(Values::from_dense_complex(matrix))
    }

    /// An n×1 local block from a dense vector. Values with zero imaginary
    /// part are stored as real unless `complex` forces the complex dtype.
    pub fn local_vector(v: &DVector<Complex64>, complex: bool) -> Self {
        Block::Local(Values::vector(v, complex))
    }

    pub fn identity(n: usize) -> Self {
        Block::Identity(IdentityBlock {
            n,
            part: Partition::serial(n),
        })
    }

    pub fn identity_partitioned(n: usize, part: Partition) -> Self {
        assert_eq!(part.global, n);
        Block::Identity(IdentityBlock { n, part })
    }

    pub fn nrows(&self) -> usize {
        match self {
            Block::Local(v) => v.nrows(),
            Block::Dist(d) => d.row_part.global,
            Block::Identity(i) => i.n,
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Block::Local(v) => v.ncols(),
            Block::Dist(d) => d.col_part.global,
            Block::Identity(i) => i.n,
        }
    }

    pub fn local_nrows(&self) -> usize {
        match self {
            Block::Local(v) => v.nrows(),
            Block::Dist(d) => d.row_part.local_len(),
            Block::Identity(i) => i.part.local_len(),
        }
    }

    pub fn row_partition(&self) -> Partition {
        match self {
            Block::Local(v) => Partition::serial(v.nrows()),
            Block::Dist(d) => d.row_part,
            Block::Identity(i) => i.part,
        }
    }

    pub fn col_partition(&self) -> Partition {
        match self {
            Block::Local(v) => Partition::serial(v.ncols()),
            Block::Dist(d) => d.col_part,
            Block::Identity(i) => i.part,
        }
    }

    pub fn is_complex(&self) -> bool {
        match self {
            Block::Local(v) => v.is_complex(),
            Block::Dist(d) => d.values.is_complex(),
            Block::Identity(_) => false,
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Block::Dist(_))
    }

    pub fn true_nnz(&self) -> usize {
        match self {
            Block::Local(v) => v.true_nnz(),
            Block::Dist(d) => d.values.true_nnz(),
            Block::Identity(i) => i.n,
        }
    }

    pub fn add(&self, other: &Block) -> Block {
        match (self, other) {
            (Block::Local(a), Block::Local(b)) => Block::Local(a.add(b)),
            (Block::Dist(a), Block::Dist(b)) => {
                assert_eq!(a.row_part, b.row_part, "row partitioning disagrees");
                assert_eq!(a.col_part, b.col_part, "col partitioning disagrees");
                Block::Dist(DistBlock {
                    comm: SharedComm::clone(&a.comm),
                    row_part: a.row_part,
                    col_part: a.col_part,
                    values: a.values.add(&b.values),
                })
            }
            _ => panic!("cannot add blocks of different backends"),
        }
    }

    pub fn sub(&self, other: &Block) -> Block {
        self.add(&other.negated())
    }

    pub fn negated(&self) -> Block {
        self.map_values(Values::negated)
    }

    pub fn scaled(&self, factor: Complex64) -> Block {
        self.map_values(|v| v.scaled(factor))
    }

    pub fn conjugated(&self) -> Block {
        self.map_values(Values::conjugated)
    }

    fn map_values(&self, f: impl Fn(&Values) -> Values) -> Block {
        match self {
            Block::Local(v) => Block::Local(f(v)),
            Block::Dist(d) => Block::Dist(DistBlock {
                comm: SharedComm::clone(&d.comm),
                row_part: d.row_part,
                col_part: d.col_part,
                values: f(&d.values),
            }),
            Block::Identity(_) => panic!("identity blocks do not carry numeric data"),
        }
    }

    pub fn transposed(&self) -> Block {
        match self {
            Block::Local(v) => Block::Local(v.transposed()),
            Block::Dist(d) => {
                // Collective: the transpose redistributes by the column
                // partition, so every rank needs the full operand.
                let full = d.gather_values().transposed();
                let local_rows: Vec<usize> = (d.col_part.begin..d.col_part.end).collect();
                Block::Dist(DistBlock {
                    comm: SharedComm::clone(&d.comm),
                    row_part: d.col_part,
                    col_part: d.row_part,
                    values: full.select_rows(&local_rows),
                })
            }
            Block::Identity(_) => self.clone(),
        }
    }

    /// Block matrix product. `Identity` operands pass the other side through.
    pub fn dot(&self, other: &Block) -> Block {
        assert_eq!(
            self.ncols(),
            other.nrows(),
            "block product dimension mismatch"
        );
        match (self, other) {
            (Block::Identity(_), _) => other.clone(),
            (_, Block::Identity(_)) => self.clone(),
            (Block::Local(a), Block::Local(b)) => Block::Local(a.dot(b)),
            (Block::Dist(a), Block::Dist(b)) => {
                // Collective: the right operand is gathered so that local
                // rows of the product can be formed against global columns.
                let b_full = b.gather_values();
                Block::Dist(DistBlock {
                    comm: SharedComm::clone(&a.comm),
                    row_part: a.row_part,
                    col_part: b.col_part,
                    values: a.values.dot(&b_full),
                })
            }
            _ => panic!("cannot multiply blocks of different backends"),
        }
    }

    /// Drops all entries in the given rows (global indices).
    pub fn reset_rows(&mut self, rows: &[usize]) {
        match self {
            Block::Local(v) => v.reset_rows(rows),
            Block::Dist(d) => {
                let local: Vec<usize> = rows
                    .iter()
                    .filter(|&&g| d.row_part.contains(g))
                    .map(|&g| g - d.row_part.begin)
                    .collect();
                d.values.reset_rows(&local);
            }
            Block::Identity(_) => panic!("identity blocks do not support row resets"),
        }
    }

    /// Sets global diagonal entries at the given indices to one value.
    pub fn set_diag(&mut self, idx: &[usize], value: Complex64) {
        let values = vec![value; idx.len()];
        self.set_diag_values(idx, &values);
    }

    /// Sets global diagonal entries at the given indices, entry by entry.
    pub fn set_diag_values(&mut self, idx: &[usize], values: &[Complex64]) {
        assert_eq!(idx.len(), values.len());
        match self {
            Block::Local(v) => {
                let entries: Vec<(usize, usize, Complex64)> = idx
                    .iter()
                    .zip(values)
                    .map(|(&g, &v)| (g, g, v))
                    .collect();
                v.set_entries(&entries);
            }
            Block::Dist(d) => {
                let entries: Vec<(usize, usize, Complex64)> = idx
                    .iter()
                    .zip(values)
                    .filter(|(&g, _)| d.row_part.contains(g))
                    .map(|(&g, &v)| (g - d.row_part.begin, g, v))
                    .collect();
                d.values.set_entries(&entries);
            }
            Block::Identity(_) => panic!("identity blocks do not support diagonal writes"),
        }
    }

    /// Overwrites entries of an n×1 block at the given global indices.
    pub fn set_vector_entries(&mut self, idx: &[usize], values: &[Complex64]) {
        assert_eq!(idx.len(), values.len());
        assert_eq!(self.ncols(), 1, "vector writes require an n×1 block");
        match self {
            Block::Local(v) => {
                let entries: Vec<(usize, usize, Complex64)> = idx
                    .iter()
                    .zip(values)
                    .map(|(&g, &v)| (g, 0, v))
                    .collect();
                v.set_entries(&entries);
            }
            Block::Dist(d) => {
                let entries: Vec<(usize, usize, Complex64)> = idx
                    .iter()
                    .zip(values)
                    .filter(|(&g, _)| d.row_part.contains(g))
                    .map(|(&g, &v)| (g - d.row_part.begin, 0, v))
                    .collect();
                d.values.set_entries(&entries);
            }
            Block::Identity(_) => panic!("identity blocks do not carry numeric data"),
        }
    }

    /// Drops all entries in the given columns (global indices).
    pub fn reset_cols(&mut self, cols: &[usize]) {
        match self {
            Block::Local(v) => v.reset_cols(cols),
            Block::Dist(d) => d.values.reset_cols(cols),
            Block::Identity(_) => panic!("identity blocks do not support column resets"),
        }
    }

    /// Restricts to the given rows. `keep` is sorted, in global numbering.
    pub fn select_rows(&self, keep: &[usize]) -> Block {
        match self {
            Block::Local(v) => Block::Local(v.select_rows(keep)),
            Block::Dist(d) => {
                let local: Vec<usize> = keep
                    .iter()
                    .filter(|&&g| d.row_part.contains(g))
                    .map(|&g| g - d.row_part.begin)
                    .collect();
                let row_part = DistBlock::partition_from_counts(&d.comm, local.len());
                Block::Dist(DistBlock {
                    comm: SharedComm::clone(&d.comm),
                    row_part,
                    col_part: d.col_part,
                    values: d.values.select_rows(&local),
                })
            }
            Block::Identity(_) => panic!("identity blocks do not support row selection"),
        }
    }

    /// Restricts to the given columns. `keep` is sorted, in global numbering.
    pub fn select_cols(&self, keep: &[usize]) -> Block {
        match self {
            Block::Local(v) => Block::Local(v.select_cols(keep)),
            Block::Dist(d) => {
                let local_kept = keep.iter().filter(|&&g| d.col_part.contains(g)).count();
                let counts = d.comm.allgather_count(local_kept);
                let begin: usize = counts[..d.comm.rank()].iter().sum();
                let col_part = Partition {
                    begin,
                    end: begin + local_kept,
                    global: counts.iter().sum(),
                };
                Block::Dist(DistBlock {
                    comm: SharedComm::clone(&d.comm),
                    row_part: d.row_part,
                    col_part,
                    values: d.values.select_cols(keep),
                })
            }
            Block::Identity(_) => panic!("identity blocks do not support column selection"),
        }
    }

    /// The selection operator mapping this block's row space onto the kept
    /// indices: `P x` restricts, `P^T y` re-expands with zeros.
    pub fn elimination_matrix(&self, kept: &[usize]) -> Block {
        let n = self.nrows();
        match self {
            Block::Local(_) => Block::Local(Values::Real(selection_matrix(kept, n))),
            Block::Dist(d) => {
                let owned: Vec<usize> = kept
                    .iter()
                    .copied()
                    .filter(|&g| d.row_part.contains(g))
                    .collect();
                let row_part = DistBlock::partition_from_counts(&d.comm, owned.len());
                let mut coo = CooMatrix::new(owned.len(), n);
                for (k, &g) in owned.iter().enumerate() {
                    coo.push(k, g, 1.0);
                }
                Block::Dist(DistBlock {
                    comm: SharedComm::clone(&d.comm),
                    row_part,
                    col_part: d.row_part,
                    values: Values::Real(coo.to_csr()),
                })
            }
            Block::Identity(_) => panic!("identity blocks do not build elimination matrices"),
        }
    }

    /// Global indices of rows that contain at least one nonzero value on
    /// this rank. Union across ranks is the caller's concern.
    pub fn nonzero_rows(&self) -> Vec<usize> {
        match self {
            Block::Local(v) => v.nonzero_rows(),
            Block::Dist(d) => d
                .values
                .nonzero_rows()
                .into_iter()
                .map(|i| i + d.row_part.begin)
                .collect(),
            Block::Identity(i) => (i.part.begin..i.part.end).collect(),
        }
    }

    /// An empty square block matching this block's column space; used to
    /// build the essential sub-matrix in the vertical elimination pass.
    pub fn square_from_right(&self) -> Block {
        match self {
            Block::Local(v) => Block::Local(Values::zeros(v.ncols(), v.ncols())),
            Block::Dist(d) => Block::Dist(DistBlock {
                comm: SharedComm::clone(&d.comm),
                row_part: d.col_part,
                col_part: d.col_part,
                values: Values::zeros(d.col_part.local_len(), d.col_part.global),
            }),
            Block::Identity(_) => self.clone(),
        }
    }

    /// The full global matrix of this block. Collective for distributed
    /// blocks: every rank receives the same data.
    pub fn global_values(&self) -> Values {
        match self {
            Block::Local(v) => v.clone(),
            Block::Dist(d) => d.gather_values(),
            Block::Identity(i) => Values::Real(CsrMatrix::identity(i.n)),
        }
    }

    /// The full global dense vector of an n×1 block. Collective for
    /// distributed blocks.
    pub fn dense_vector(&self) -> DVector<Complex64> {
        self.global_values().dense_vector()
    }
}
