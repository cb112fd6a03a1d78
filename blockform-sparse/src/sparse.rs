//! COO/CSR matrices with the index-set operations used by block assembly.

use itertools::izip;
use nalgebra::{ClosedAdd, ClosedMul, ComplexField, DMatrix, DVector, Scalar};
use num::{One, Zero};
use std::ops::Neg;

/// A COO (triplet) representation of a sparse matrix.
///
/// Used as an assembly/interchange format; duplicate entries are allowed
/// and are combined by addition when converting to CSR.
#[derive(Debug, Clone, PartialEq)]
pub struct CooMatrix<T> {
    nrows: usize,
    ncols: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<T>,
}

impl<T> CooMatrix<T>
where
    T: Scalar,
{
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            rows: Vec::new(),
            cols: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        rows: Vec<usize>,
        cols: Vec<usize>,
        values: Vec<T>,
    ) -> Self {
        assert_eq!(rows.len(), cols.len());
        assert_eq!(cols.len(), values.len());
        if rows.iter().any(|i| *i >= nrows) {
            panic!("Row indices contain index out of bounds.");
        }
        if cols.iter().any(|j| *j >= ncols) {
            panic!("Col indices contain index out of bounds.");
        }
        Self {
            nrows,
            ncols,
            rows,
            cols,
            values,
        }
    }

    #[inline(always)]
    pub fn push(&mut self, i: usize, j: usize, v: T) {
        assert!(i < self.nrows);
        assert!(j < self.ncols);
        self.rows.push(i);
        self.cols.push(j);
        self.values.push(v);
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn triplet_iter(&self) -> impl Iterator<Item = (usize, usize, &T)> {
        izip!(&self.rows, &self.cols, &self.values).map(|(i, j, v)| (*i, *j, v))
    }

    /// Appends all triplets of `other`. Panics if the shapes differ.
    pub fn extend_triplets(&mut self, other: &CooMatrix<T>) {
        assert_eq!(
            (self.nrows, self.ncols),
            (other.nrows, other.ncols),
            "Triplet concatenation requires matrices of the same shape."
        );
        self.rows.extend_from_slice(&other.rows);
        self.cols.extend_from_slice(&other.cols);
        self.values.extend_from_slice(&other.values);
    }

    pub fn scale_mut(&mut self, factor: T)
    where
        T: ClosedMul,
    {
        for v in &mut self.values {
            *v *= factor.clone();
        }
    }

    pub fn map_values<U: Scalar>(&self, f: impl Fn(&T) -> U) -> CooMatrix<U> {
        CooMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            rows: self.rows.clone(),
            cols: self.cols.clone(),
            values: self.values.iter().map(f).collect(),
        }
    }

    pub fn to_dense(&self) -> DMatrix<T>
    where
        T: Zero + ClosedAdd,
    {
        let mut result = DMatrix::zeros(self.nrows, self.ncols);
        for (i, j, v) in self.triplet_iter() {
            result[(i, j)] += v.clone();
        }
        result
    }

    /// Converts to CSR, combining duplicate entries by addition.
    pub fn to_csr(&self) -> CsrMatrix<T>
    where
        T: Zero + ClosedAdd,
    {
        let nnz = self.nnz();
        let mut permutation: Vec<usize> = (0..nnz).collect();
        permutation.sort_unstable_by_key(|&p| (self.rows[p], self.cols[p]));

        let mut row_offsets = Vec::with_capacity(self.nrows + 1);
        let mut col_indices = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);
        row_offsets.push(0);

        let mut current_row = 0;
        for &p in &permutation {
            let (i, j) = (self.rows[p], self.cols[p]);
            while current_row < i {
                row_offsets.push(col_indices.len());
                current_row += 1;
            }
            let row_start = *row_offsets.last().unwrap();
            if col_indices.len() > row_start && *col_indices.last().unwrap() == j {
                let last = values.last_mut().unwrap();
                *last += self.values[p].clone();
            } else {
                col_indices.push(j);
                values.push(self.values[p].clone());
            }
        }
        while row_offsets.len() < self.nrows + 1 {
            row_offsets.push(col_indices.len());
        }

        CsrMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            row_offsets,
            col_indices,
            values,
        }
    }
}

/// A CSR sparse matrix.
///
/// Explicitly stored zeros are permitted; `true_nnz` reports the count of
/// structurally stored entries whose value is nonzero.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    nrows: usize,
    ncols: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<T>,
}

impl<T> CsrMatrix<T>
where
    T: Scalar,
{
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            row_offsets: vec![0; nrows + 1],
            col_indices: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn from_csr_data(
        nrows: usize,
        ncols: usize,
        row_offsets: Vec<usize>,
        col_indices: Vec<usize>,
        values: Vec<T>,
    ) -> Self {
        assert_eq!(
            row_offsets.len(),
            nrows + 1,
            "length of row_offsets must be equal to nrows + 1"
        );
        assert_eq!(col_indices.len(), values.len());
        assert_eq!(*row_offsets.last().unwrap(), col_indices.len());
        Self {
            nrows,
            ncols,
            row_offsets,
            col_indices,
            values,
        }
    }

    pub fn identity(n: usize) -> Self
    where
        T: One,
    {
        Self {
            nrows: n,
            ncols: n,
            row_offsets: (0..=n).collect(),
            col_indices: (0..n).collect(),
            values: vec![T::one(); n],
        }
    }

    pub fn from_diagonal(diagonal: &[T]) -> Self {
        let n = diagonal.len();
        Self {
            nrows: n,
            ncols: n,
            row_offsets: (0..=n).collect(),
            col_indices: (0..n).collect(),
            values: diagonal.to_vec(),
        }
    }

    pub fn from_dense(matrix: &DMatrix<T>) -> Self
    where
        T: Zero + ClosedAdd,
    {
        let mut coo = CooMatrix::new(matrix.nrows(), matrix.ncols());
        for i in 0..matrix.nrows() {
            for j in 0..matrix.ncols() {
                let v = matrix[(i, j)].clone();
                if !v.is_zero() {
                    coo.push(i, j, v);
                }
            }
        }
        coo.to_csr()
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Number of stored entries with a nonzero value.
    pub fn true_nnz(&self) -> usize
    where
        T: Zero,
    {
        self.values.iter().filter(|v| !v.is_zero()).count()
    }

    pub fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    /// Column indices and values of row `i`.
    pub fn row(&self, i: usize) -> (&[usize], &[T]) {
        let begin = self.row_offsets[i];
        let end = self.row_offsets[i + 1];
        (&self.col_indices[begin..end], &self.values[begin..end])
    }

    /// Gives an iterator over stored entries in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &T)> {
        (0..self.nrows).flat_map(move |i| {
            let (cols, vals) = self.row(i);
            izip!(cols, vals).map(move |(j, v)| (i, *j, v))
        })
    }

    pub fn get(&self, i: usize, j: usize) -> T
    where
        T: Zero,
    {
        let (cols, vals) = self.row(i);
        match cols.binary_search(&j) {
            Ok(local) => vals[local].clone(),
            Err(_) => T::zero(),
        }
    }

    pub fn to_coo(&self) -> CooMatrix<T> {
        let mut rows = Vec::with_capacity(self.nnz());
        for (i, window) in self.row_offsets.windows(2).enumerate() {
            rows.extend(std::iter::repeat(i).take(window[1] - window[0]));
        }
        CooMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            rows,
            cols: self.col_indices.clone(),
            values: self.values.clone(),
        }
    }

    pub fn to_dense(&self) -> DMatrix<T>
    where
        T: Zero,
    {
        let mut result = DMatrix::zeros(self.nrows, self.ncols);
        for (i, j, v) in self.iter() {
            result[(i, j)] = v.clone();
        }
        result
    }

    pub fn map_values<U: Scalar>(&self, f: impl Fn(&T) -> U) -> CsrMatrix<U> {
        CsrMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            row_offsets: self.row_offsets.clone(),
            col_indices: self.col_indices.clone(),
            values: self.values.iter().map(f).collect(),
        }
    }

    /// Returns a new matrix containing only the entries indicated by the
    /// predicate. The shape is unchanged.
    pub fn filter(&self, predicate: impl Fn(usize, usize, &T) -> bool) -> Self {
        let mut row_offsets = Vec::with_capacity(self.nrows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0);
        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            for (j, v) in izip!(cols, vals) {
                if predicate(i, *j, v) {
                    col_indices.push(*j);
                    values.push(v.clone());
                }
            }
            row_offsets.push(col_indices.len());
        }
        Self {
            nrows: self.nrows,
            ncols: self.ncols,
            row_offsets,
            col_indices,
            values,
        }
    }

    /// Drops stored entries whose value is zero.
    pub fn drop_zeros(&self) -> Self
    where
        T: Zero,
    {
        self.filter(|_, _, v| !v.is_zero())
    }

    pub fn scale_mut(&mut self, factor: T)
    where
        T: ClosedMul,
    {
        for v in &mut self.values {
            *v *= factor.clone();
        }
    }

    pub fn conjugate_mut(&mut self)
    where
        T: ComplexField,
    {
        for v in &mut self.values {
            *v = v.clone().conjugate();
        }
    }

    pub fn negated(&self) -> Self
    where
        T: Neg<Output = T>,
    {
        self.map_values(|v| -v.clone())
    }

    pub fn transpose(&self) -> Self {
        // Counting sort over columns.
        let mut counts = vec![0usize; self.ncols + 1];
        for &j in &self.col_indices {
            counts[j + 1] += 1;
        }
        for j in 0..self.ncols {
            counts[j + 1] += counts[j];
        }
        let row_offsets = counts.clone();

        let mut col_indices = vec![0usize; self.nnz()];
        let mut values = self.values.clone();
        let mut next = counts;
        for (i, j, v) in self.iter() {
            let dst = next[j];
            col_indices[dst] = i;
            values[dst] = v.clone();
            next[j] += 1;
        }

        Self {
            nrows: self.ncols,
            ncols: self.nrows,
            row_offsets,
            col_indices,
            values,
        }
    }

    /// Element-wise sum. Panics if the shapes differ.
    pub fn add(&self, other: &Self) -> Self
    where
        T: Zero + ClosedAdd,
    {
        assert_eq!(
            (self.nrows, self.ncols),
            (other.nrows, other.ncols),
            "Addition requires matrices of the same shape."
        );
        let mut coo = self.to_coo();
        coo.extend_triplets(&other.to_coo());
        coo.to_csr()
    }

    pub fn sub(&self, other: &Self) -> Self
    where
        T: Zero + ClosedAdd + Neg<Output = T>,
    {
        self.add(&other.negated())
    }

    /// Computes `A x`.
    pub fn spmv(&self, x: &DVector<T>) -> DVector<T>
    where
        T: Zero + ClosedAdd + ClosedMul,
    {
        assert_eq!(self.ncols, x.len(), "spmv dimension mismatch");
        let mut y = DVector::zeros(self.nrows);
        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            let mut acc = T::zero();
            for (j, v) in izip!(cols, vals) {
                acc += v.clone() * x[*j].clone();
            }
            y[i] = acc;
        }
        y
    }

    /// Computes the matrix product `A B`.
    pub fn spmm(&self, rhs: &Self) -> Self
    where
        T: Zero + ClosedAdd + ClosedMul,
    {
        assert_eq!(self.ncols, rhs.nrows, "matrix product dimension mismatch");

        // Dense accumulator workspace over the result row, tracking only
        // the touched columns.
        let mut acc = vec![T::zero(); rhs.ncols];
        let mut touched = Vec::new();
        let mut marked = vec![false; rhs.ncols];

        let mut row_offsets = Vec::with_capacity(self.nrows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0);

        for i in 0..self.nrows {
            let (a_cols, a_vals) = self.row(i);
            for (k, a_ik) in izip!(a_cols, a_vals) {
                let (b_cols, b_vals) = rhs.row(*k);
                for (j, b_kj) in izip!(b_cols, b_vals) {
                    if !marked[*j] {
                        marked[*j] = true;
                        touched.push(*j);
                    }
                    acc[*j] += a_ik.clone() * b_kj.clone();
                }
            }
            touched.sort_unstable();
            for &j in &touched {
                col_indices.push(j);
                values.push(std::mem::replace(&mut acc[j], T::zero()));
                marked[j] = false;
            }
            touched.clear();
            row_offsets.push(col_indices.len());
        }

        Self {
            nrows: self.nrows,
            ncols: rhs.ncols,
            row_offsets,
            col_indices,
            values,
        }
    }

    /// Drops all entries in the given rows. The shape is unchanged.
    pub fn reset_rows(&mut self, rows: &[usize]) {
        let mut member = vec![false; self.nrows];
        for &i in rows {
            member[i] = true;
        }
        let filtered = self.filter(|i, _, _| !member[i]);
        *self = filtered;
    }

    /// Drops all entries in the given columns. The shape is unchanged.
    pub fn reset_cols(&mut self, cols: &[usize]) {
        let mut member = vec![false; self.ncols];
        for &j in cols {
            member[j] = true;
        }
        let filtered = self.filter(|_, j, _| !member[j]);
        *self = filtered;
    }

    /// Restricts the matrix to the given rows, in the order given.
    pub fn select_rows(&self, keep: &[usize]) -> Self {
        let mut row_offsets = Vec::with_capacity(keep.len() + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0);
        for &i in keep {
            let (cols, vals) = self.row(i);
            col_indices.extend_from_slice(cols);
            values.extend_from_slice(vals);
            row_offsets.push(col_indices.len());
        }
        Self {
            nrows: keep.len(),
            ncols: self.ncols,
            row_offsets,
            col_indices,
            values,
        }
    }

    /// Restricts the matrix to the given columns, renumbered in the order
    /// given.
    pub fn select_cols(&self, keep: &[usize]) -> Self {
        let mut renumber = vec![usize::MAX; self.ncols];
        for (new, &old) in keep.iter().enumerate() {
            renumber[old] = new;
        }

        let mut row_offsets = Vec::with_capacity(self.nrows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        let mut row_buffer: Vec<(usize, T)> = Vec::new();
        row_offsets.push(0);
        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            row_buffer.clear();
            for (j, v) in izip!(cols, vals) {
                if renumber[*j] != usize::MAX {
                    row_buffer.push((renumber[*j], v.clone()));
                }
            }
            row_buffer.sort_unstable_by_key(|(j, _)| *j);
            for (j, v) in row_buffer.drain(..) {
                col_indices.push(j);
                values.push(v);
            }
            row_offsets.push(col_indices.len());
        }
        Self {
            nrows: self.nrows,
            ncols: keep.len(),
            row_offsets,
            col_indices,
            values,
        }
    }

    /// Indices of rows containing at least one nonzero value.
    pub fn nonzero_rows(&self) -> Vec<usize>
    where
        T: Zero,
    {
        (0..self.nrows)
            .filter(|&i| {
                let (_, vals) = self.row(i);
                vals.iter().any(|v| !v.is_zero())
            })
            .collect()
    }
}

/// The rectangular selection operator `P` with `P[k, kept[k]] = 1`.
///
/// `P x` restricts a vector to the kept indices; `P^T y` scatters a reduced
/// vector back, with zeros at the dropped indices.
pub fn selection_matrix<T>(kept: &[usize], ncols: usize) -> CsrMatrix<T>
where
    T: Scalar + One,
{
    for &j in kept {
        assert!(j < ncols, "selection index {} out of bounds", j);
    }
    CsrMatrix::from_csr_data(
        kept.len(),
        ncols,
        (0..=kept.len()).collect(),
        kept.to_vec(),
        vec![T::one(); kept.len()],
    )
}
