//! The grid of sparse blocks making up one block-structured operator or
//! right-hand side.

use crate::block::{Block, Partition, Values};
use blockform_sparse::{CooMatrix, CsrMatrix};
use itertools::Itertools;
use nalgebra::DVector;
use num::complex::Complex64;
use std::cell::RefCell;

/// A `rows × cols` grid of optional blocks.
///
/// Empty cells act as zero blocks in all arithmetic. The grid becomes
/// complex as soon as any complex block is placed, and the flag propagates
/// through every operation. Row/column sizes and partitionings are inferred
/// lazily from the first non-empty cell of each grid line and cached;
/// placing blocks with inconsistent partitioning in one grid line is a
/// fatal configuration error.
#[derive(Debug, Clone)]
pub struct BlockGrid {
    nrows: usize,
    ncols: usize,
    cells: Vec<Option<Block>>,
    complex: bool,
    sizes: RefCell<Option<GridSizes>>,
}

#[derive(Debug, Clone)]
struct GridSizes {
    row_parts: Vec<Option<Partition>>,
    col_parts: Vec<Option<Partition>>,
}

/// A real block operator with interleaved real/imaginary sub-blocks,
/// preserving the per-field block structure for solvers that precondition
/// field by field.
#[derive(Debug, Clone)]
pub struct InterleavedOperator {
    pub row_offsets: Vec<usize>,
    pub col_offsets: Vec<usize>,
    pub blocks: Vec<Vec<Option<CsrMatrix<f64>>>>,
}

impl InterleavedOperator {
    pub fn nrows(&self) -> usize {
        *self.row_offsets.last().unwrap()
    }

    pub fn ncols(&self) -> usize {
        *self.col_offsets.last().unwrap()
    }

    /// Flattens the block operator into one monolithic CSR matrix.
    pub fn to_monolithic(&self) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(self.nrows(), self.ncols());
        for (bi, row) in self.blocks.iter().enumerate() {
            for (bj, cell) in row.iter().enumerate() {
                if let Some(m) = cell {
                    for (i, j, v) in m.iter() {
                        coo.push(self.row_offsets[bi] + i, self.col_offsets[bj] + j, *v);
                    }
                }
            }
        }
        coo.to_csr()
    }
}

impl BlockGrid {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        BlockGrid {
            nrows,
            ncols,
            cells: (0..nrows * ncols).map(|_| None).collect(),
            complex: false,
            sizes: RefCell::new(None),
        }
    }

    /// An `n × 1` grid for right-hand sides and solutions.
    pub fn vector(nrows: usize) -> Self {
        Self::new(nrows, 1)
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn is_complex(&self) -> bool {
        self.complex
    }

    fn index(&self, i: usize, j: usize) -> usize {
        assert!(i < self.nrows && j < self.ncols, "grid index out of bounds");
        i * self.ncols + j
    }

    pub fn get(&self, i: usize, j: usize) -> Option<&Block> {
        self.cells[self.index(i, j)].as_ref()
    }

    pub fn get_mut(&mut self, i: usize, j: usize) -> Option<&mut Block> {
        let idx = self.index(i, j);
        *self.sizes.borrow_mut() = None;
        self.cells[idx].as_mut()
    }

    pub fn set(&mut self, i: usize, j: usize, block: Block) {
        let idx = self.index(i, j);
        self.complex |= block.is_complex();
        self.cells[idx] = Some(block);
        *self.sizes.borrow_mut() = None;
    }

    pub fn take(&mut self, i: usize, j: usize) -> Option<Block> {
        let idx = self.index(i, j);
        *self.sizes.borrow_mut() = None;
        self.cells[idx].take()
    }

    /// Accumulate-or-set: adds to an existing cell, or fills an empty one.
    pub fn add_to_element(&mut self, i: usize, j: usize, block: Block) {
        match self.get(i, j) {
            Some(existing) => {
                let sum = existing.add(&block);
                self.set(i, j, sum);
            }
            None => self.set(i, j, block),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cells.iter().all(Option::is_none)
    }

    fn sizes(&self) -> GridSizes {
        if self.sizes.borrow().is_none() {
            let mut row_parts = vec![None; self.nrows];
            let mut col_parts = vec![None; self.ncols];
            for i in 0..self.nrows {
                for j in 0..self.ncols {
                    if let Some(block) = self.get(i, j) {
                        let rp = block.row_partition();
                        let cp = block.col_partition();
                        match row_parts[i] {
                            None => row_parts[i] = Some(rp),
                            Some(existing) => assert_eq!(
                                existing, rp,
                                "row partitioning is not consistent at block ({}, {})",
                                i, j
                            ),
                        }
                        match col_parts[j] {
                            None => col_parts[j] = Some(cp),
                            Some(existing) => assert_eq!(
                                existing, cp,
                                "col partitioning is not consistent at block ({}, {})",
                                i, j
                            ),
                        }
                    }
                }
            }
            *self.sizes.borrow_mut() = Some(GridSizes {
                row_parts,
                col_parts,
            });
        }
        self.sizes.borrow().clone().unwrap()
    }

    /// Row partitioning of grid row `i`, if any block determines it.
    pub fn row_partition(&self, i: usize) -> Option<Partition> {
        self.sizes().row_parts[i]
    }

    pub fn col_partition(&self, j: usize) -> Option<Partition> {
        self.sizes().col_parts[j]
    }

    /// Global row size of grid row `i`; 0 when the row is empty.
    pub fn global_row_size(&self, i: usize) -> usize {
        self.row_partition(i).map_or(0, |p| p.global)
    }

    pub fn global_col_size(&self, j: usize) -> usize {
        self.col_partition(j).map_or(0, |p| p.global)
    }

    pub fn global_row_sizes(&self) -> Vec<usize> {
        (0..self.nrows).map(|i| self.global_row_size(i)).collect()
    }

    /// Per-cell true nonzero counts, for debug logging.
    pub fn format_nnz(&self) -> String {
        (0..self.nrows)
            .map(|i| {
                let row = (0..self.ncols)
                    .map(|j| match self.get(i, j) {
                        Some(block) => block.true_nnz().to_string(),
                        None => "-".to_string(),
                    })
                    .join(", ");
                format!("{} : {}", i, row)
            })
            .join("\n")
    }

    fn zip_cells(
        &self,
        other: &BlockGrid,
        combine: impl Fn(Option<&Block>, Option<&Block>) -> Option<Block>,
    ) -> BlockGrid {
        assert_eq!(
            (self.nrows, self.ncols),
            (other.nrows, other.ncols),
            "block grid shapes do not match"
        );
        let mut result = BlockGrid::new(self.nrows, self.ncols);
        for i in 0..self.nrows {
            for j in 0..self.ncols {
                if let Some(block) = combine(self.get(i, j), other.get(i, j)) {
                    result.set(i, j, block);
                }
            }
        }
        result
    }

    pub fn add(&self, other: &BlockGrid) -> BlockGrid {
        self.zip_cells(other, |a, b| match (a, b) {
            (None, None) => None,
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (Some(a), Some(b)) => Some(a.add(b)),
        })
    }

    pub fn sub(&self, other: &BlockGrid) -> BlockGrid {
        self.zip_cells(other, |a, b| match (a, b) {
            (None, None) => None,
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.negated()),
            (Some(a), Some(b)) => Some(a.sub(b)),
        })
    }

    pub fn scaled(&self, factor: Complex64) -> BlockGrid {
        self.map_cells(|block| block.scaled(factor))
    }

    pub fn negated(&self) -> BlockGrid {
        self.map_cells(Block::negated)
    }

    fn map_cells(&self, f: impl Fn(&Block) -> Block) -> BlockGrid {
        let mut result = BlockGrid::new(self.nrows, self.ncols);
        for i in 0..self.nrows {
            for j in 0..self.ncols {
                if let Some(block) = self.get(i, j) {
                    result.set(i, j, f(block));
                }
            }
        }
        result
    }

    pub fn transposed(&self) -> BlockGrid {
        let mut result = BlockGrid::new(self.ncols, self.nrows);
        for i in 0..self.nrows {
            for j in 0..self.ncols {
                if let Some(block) = self.get(i, j) {
                    result.set(j, i, block.transposed());
                }
            }
        }
        result
    }

    /// Block matrix product. Empty cells are zero blocks and are skipped,
    /// which is the dominant sparsity optimization at this level.
    pub fn dot(&self, other: &BlockGrid) -> BlockGrid {
        assert_eq!(
            self.ncols, other.nrows,
            "block grid product shapes do not match"
        );
        let mut result = BlockGrid::new(self.nrows, other.ncols);
        for i in 0..self.nrows {
            for j in 0..other.ncols {
                for k in 0..self.ncols {
                    let (a, b) = match (self.get(i, k), other.get(k, j)) {
                        (Some(a), Some(b)) => (a, b),
                        _ => continue,
                    };
                    let term = a.dot(b);
                    result.add_to_element(i, j, term);
                }
            }
        }
        result
    }

    /// Allocates an all-zero square block at `(r, c)`, with sizes and
    /// partitioning inferred from the off-diagonal blocks in row `r` and
    /// column `c`. Used so that essential elimination has a diagonal block
    /// to act on when no form contributed one.
    ///
    /// Does nothing when neither the row nor column size can be inferred
    /// (a row that only a time-dependent term would fill). Panics if the
    /// cell is occupied or the inferred block is not square.
    pub fn add_empty_square_block(&mut self, r: usize, c: usize) {
        assert!(
            self.get(r, c).is_none(),
            "block ({}, {}) is already filled",
            r,
            c
        );
        let row_part = self.row_partition(r);
        let col_part = self.col_partition(c);
        let (rp, cp) = match (row_part, col_part) {
            (Some(rp), Some(cp)) => (rp, cp),
            _ => return,
        };
        assert_eq!(
            rp.global, cp.global,
            "inferred diagonal block at ({}, {}) is not square",
            r, c
        );

        // Reuse a neighboring block's backend so the new cell matches the
        // grid line's partitioning.
        let reference = (0..self.ncols)
            .filter_map(|j| self.get(r, j))
            .chain((0..self.nrows).filter_map(|i| self.get(i, c)))
            .next()
            .expect("size inference implies at least one neighboring block");
        let block = match reference {
            Block::Dist(d) => Block::Dist(crate::block::DistBlock::new(
                crate::comm::SharedComm::clone(d.comm()),
                rp,
                cp,
                Values::zeros(rp.local_len(), cp.global),
            )),
            _ => Block::Local(Values::zeros(rp.global, cp.global)),
        };
        self.set(r, c, block);
    }

    /// Shrinks away rows/columns that are zero in every block of a grid
    /// line, returning the reduced grid and the block-diagonal projector
    /// that maps original row spaces onto the kept ones.
    ///
    /// The nonzero row set of a distributed grid row is the union across
    /// all ranks: a row invisible on one rank may carry entries on another
    /// and must not be dropped globally.
    pub fn eliminate_empty_rowcol(&self) -> (BlockGrid, BlockGrid) {
        assert_eq!(
            self.nrows, self.ncols,
            "empty row/col elimination requires a square block grid"
        );
        let mut reduced = self.clone();
        let mut projector = BlockGrid::new(self.nrows, self.ncols);

        log::debug!("eliminate_empty_rowcol, nnz per block:\n{}", self.format_nnz());

        for i in 0..self.nrows {
            let mut kept: Vec<usize> = Vec::new();
            let mut dist_comm = None;
            for j in 0..self.ncols {
                if let Some(block) = self.get(i, j) {
                    kept.extend(block.nonzero_rows());
                    if let Block::Dist(d) = block {
                        dist_comm = Some(crate::comm::SharedComm::clone(d.comm()));
                    }
                }
            }
            // Share locally visible nonzero rows across the group before
            // deciding what is globally empty.
            if let Some(comm) = dist_comm {
                kept = comm.allgather_usizes(&kept);
            }
            kept.sort_unstable();
            kept.dedup();

            let reference = match (0..self.ncols).filter_map(|j| self.get(i, j)).next() {
                Some(block) => block.clone(),
                None => continue,
            };
            let row_size = reference.row_partition().global;
            if kept.len() < row_size {
                projector.set(i, i, reference.elimination_matrix(&kept));
            } else {
                projector.set(
                    i,
                    i,
                    Block::identity_partitioned(row_size, reference.row_partition()),
                );
            }

            for j in 0..self.ncols {
                if let Some(block) = reduced.take(i, j) {
                    reduced.set(i, j, block.select_rows(&kept));
                }
                if let Some(block) = reduced.take(j, i) {
                    reduced.set(j, i, block.select_cols(&kept));
                }
            }
        }

        (reduced, projector)
    }

    /// Cumulative global row/column offsets of the grid lines.
    pub fn global_offsets(&self) -> (Vec<usize>, Vec<usize>) {
        let row_offsets = std::iter::once(0)
            .chain((0..self.nrows).scan(0, |acc, i| {
                *acc += self.global_row_size(i);
                Some(*acc)
            }))
            .collect();
        let col_offsets = std::iter::once(0)
            .chain((0..self.ncols).scan(0, |acc, j| {
                *acc += self.global_col_size(j);
                Some(*acc)
            }))
            .collect();
        (row_offsets, col_offsets)
    }

    /// Flattens the grid into one monolithic sparse matrix in the grid's
    /// native dtype. Collective when the grid holds distributed blocks:
    /// every rank receives the full matrix.
    pub fn global_matrix(&self) -> Values {
        let (row_offsets, col_offsets) = self.global_offsets();
        log::debug!("global_matrix row offsets {:?}", row_offsets);

        let nrows = *row_offsets.last().unwrap();
        let ncols = *col_offsets.last().unwrap();
        if self.complex {
            let mut coo = CooMatrix::new(nrows, ncols);
            for i in 0..self.nrows {
                for j in 0..self.ncols {
                    if let Some(block) = self.get(i, j) {
                        let full = block.global_values().to_complex();
                        for (bi, bj, v) in full.iter() {
                            coo.push(row_offsets[i] + bi, col_offsets[j] + bj, *v);
                        }
                    }
                }
            }
            Values::Complex(coo.to_csr())
        } else {
            let mut coo = CooMatrix::new(nrows, ncols);
            for i in 0..self.nrows {
                for j in 0..self.ncols {
                    if let Some(block) = self.get(i, j) {
                        let full = block.global_values().real_part();
                        for (bi, bj, v) in full.iter() {
                            coo.push(row_offsets[i] + bi, col_offsets[j] + bj, *v);
                        }
                    }
                }
            }
            Values::Real(coo.to_csr())
        }
    }

    /// Gathers an n×1 grid into one dense global vector. `row_sizes` gives
    /// the global size of each grid row, so that empty cells contribute
    /// zeros (the sizes generally come from the operator grid, since an
    /// empty right-hand-side row cannot size itself).
    pub fn gather_dense_vec(&self, row_sizes: &[usize]) -> DVector<Complex64> {
        assert_eq!(self.ncols, 1, "gathering requires an n×1 grid");
        assert_eq!(row_sizes.len(), self.nrows);
        let total: usize = row_sizes.iter().sum();
        let mut out = DVector::zeros(total);
        let mut offset = 0;
        for i in 0..self.nrows {
            if let Some(block) = self.get(i, 0) {
                let v = block.dense_vector();
                assert_eq!(
                    v.len(),
                    row_sizes[i],
                    "right-hand-side row {} does not match the operator size",
                    i
                );
                out.rows_mut(offset, v.len()).copy_from(&v);
            }
            offset += row_sizes[i];
        }
        out
    }

    /// Per-row Euclidean norms of an n×1 grid. Collective for distributed
    /// rows.
    pub fn block_norms(&self) -> Vec<f64> {
        assert_eq!(self.ncols, 1, "norms require an n×1 grid");
        (0..self.nrows)
            .map(|i| match self.get(i, 0) {
                Some(block) => block.dense_vector().iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt(),
                None => 0.0,
            })
            .collect()
    }

    /// The interleaved real block operator: for a complex system, each
    /// field expands to a 2×2 arrangement `[[Re, -Im], [Im, Re]]` so that
    /// unknowns are ordered `Re f1, Im f1, Re f2, Im f2, ...`. A real
    /// system passes through with its block structure intact. `complex` is
    /// the dtype of the overall system, which may exceed this grid's own
    /// flag (e.g. a real operator against a complex right-hand side).
    /// Collective for distributed grids.
    pub fn interleaved(&self, complex: bool) -> InterleavedOperator {
        let complex = complex || self.complex;
        let expand = if complex { 2 } else { 1 };
        let mut row_offsets = vec![0];
        for i in 0..self.nrows {
            let size = self.global_row_size(i);
            for _ in 0..expand {
                row_offsets.push(row_offsets.last().unwrap() + size);
            }
        }
        let mut col_offsets = vec![0];
        for j in 0..self.ncols {
            let size = self.global_col_size(j);
            for _ in 0..expand {
                col_offsets.push(col_offsets.last().unwrap() + size);
            }
        }

        let n_brows = expand * self.nrows;
        let n_bcols = expand * self.ncols;
        let mut blocks: Vec<Vec<Option<CsrMatrix<f64>>>> =
            (0..n_brows).map(|_| vec![None; n_bcols]).collect();

        for i in 0..self.nrows {
            for j in 0..self.ncols {
                let block = match self.get(i, j) {
                    Some(block) => block,
                    None => continue,
                };
                let full = block.global_values();
                if complex {
                    let re = full.real_part();
                    let im = full.imag_part();
                    blocks[2 * i][2 * j] = Some(re.clone());
                    blocks[2 * i + 1][2 * j + 1] = Some(re);
                    if im.nnz() > 0 {
                        blocks[2 * i][2 * j + 1] = Some(im.negated());
                        blocks[2 * i + 1][2 * j] = Some(im);
                    }
                } else {
                    blocks[i][j] = Some(full.real_part());
                }
            }
        }

        InterleavedOperator {
            row_offsets,
            col_offsets,
            blocks,
        }
    }

    /// Gathers an n×1 grid into the interleaved real ordering matching
    /// [`BlockGrid::interleaved`]: `Re f1, Im f1, Re f2, Im f2, ...`.
    pub fn gather_interleaved_vec(&self, row_sizes: &[usize], complex: bool) -> DVector<f64> {
        assert_eq!(self.ncols, 1, "gathering requires an n×1 grid");
        let complex = complex || self.complex;
        let expand = if complex { 2 } else { 1 };
        let total: usize = row_sizes.iter().sum::<usize>() * expand;
        let mut out = DVector::zeros(total);
        let mut offset = 0;
        for i in 0..self.nrows {
            let size = row_sizes[i];
            if let Some(block) = self.get(i, 0) {
                let v = block.dense_vector();
                assert_eq!(v.len(), size);
                for (k, z) in v.iter().enumerate() {
                    out[offset + k] = z.re;
                    if complex {
                        out[offset + size + k] = z.im;
                    }
                }
            }
            offset += expand * size;
        }
        out
    }
}
