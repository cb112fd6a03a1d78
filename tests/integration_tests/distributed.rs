use blockform::assembly::{Assembler, AssemblyOptions};
use blockform::block::{Block, DistBlock, Partition, Values};
use blockform::comm::{Communicator, SelfComm, SharedComm, ThreadGroup};
use blockform::grid::BlockGrid;
use blockform::physics::{FieldDecl, FieldSpace, PhysicsModule};
use blockform::solver::{DenseLuSolver, SolverFormat};
use blockform::Complex64;
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;
use std::thread;

fn rank_partition(total: usize, rank: usize, size: usize) -> Partition {
    // Contiguous near-even split.
    let base = total / size;
    let remainder = total % size;
    let begin = rank * base + rank.min(remainder);
    let len = base + usize::from(rank < remainder);
    Partition {
        begin,
        end: begin + len,
        global: total,
    }
}

fn dist_block(
    comm: &SharedComm,
    global: &DMatrix<f64>,
    row_part: Partition,
    col_part: Partition,
) -> Block {
    let local = global.rows(row_part.begin, row_part.local_len()).clone_owned();
    Block::Dist(DistBlock::new(
        SharedComm::clone(comm),
        row_part,
        col_part,
        Values::from_dense(&local),
    ))
}

#[test]
fn distributed_grid_matches_sequential_elimination() {
    // Two fields of sizes 4 and 2; the third row/column of field 0 is
    // globally empty and must be dropped on every rank, even though only
    // one rank owns it.
    let a00 = DMatrix::from_row_slice(
        4,
        4,
        &[
            2.0, 1.0, 0.0, 0.0, //
            1.0, 2.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 2.0,
        ],
    );
    let a01 = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    let a10 = DMatrix::from_row_slice(2, 4, &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    let a11 = DMatrix::from_row_slice(2, 2, &[3.0, 0.0, 0.0, 3.0]);

    let mut sequential = BlockGrid::new(2, 2);
    sequential.set(0, 0, Block::from_dense(&a00));
    sequential.set(0, 1, Block::from_dense(&a01));
    sequential.set(1, 0, Block::from_dense(&a10));
    sequential.set(1, 1, Block::from_dense(&a11));
    let (reduced_seq, _) = sequential.eliminate_empty_rowcol();
    let expected = reduced_seq.global_matrix().real_part().to_dense();
    assert_eq!(reduced_seq.global_row_sizes(), vec![3, 2]);

    let handles: Vec<_> = ThreadGroup::split(2)
        .into_iter()
        .map(|comm| {
            let (a00, a01, a10, a11) = (a00.clone(), a01.clone(), a10.clone(), a11.clone());
            thread::spawn(move || {
                let comm: SharedComm = Arc::new(comm);
                let rank = comm.rank();
                let p0 = rank_partition(4, rank, 2);
                let p1 = rank_partition(2, rank, 2);

                let mut grid = BlockGrid::new(2, 2);
                grid.set(0, 0, dist_block(&comm, &a00, p0, p0));
                grid.set(0, 1, dist_block(&comm, &a01, p0, p1));
                grid.set(1, 0, dist_block(&comm, &a10, p1, p0));
                grid.set(1, 1, dist_block(&comm, &a11, p1, p1));

                let (reduced, _) = grid.eliminate_empty_rowcol();
                (
                    reduced.global_row_sizes(),
                    reduced.global_matrix().real_part().to_dense(),
                )
            })
        })
        .collect();

    for handle in handles {
        let (sizes, dense) = handle.join().unwrap();
        assert_eq!(sizes, vec![3, 2]);
        assert_matrix_eq!(dense, expected, comp = abs, tol = 1e-14);
    }
}

/// A field space owning one rank's contiguous slice of the true dofs.
struct RankedSpace {
    part: Partition,
    essential_local: Vec<usize>,
}

impl FieldSpace for RankedSpace {
    fn true_dof_count(&self) -> usize {
        self.part.local_len()
    }

    fn global_true_dof_count(&self) -> usize {
        self.part.global
    }

    fn true_dof_offset(&self) -> usize {
        self.part.begin
    }

    fn essential_true_dofs(&self, bdr_attrs: &[usize]) -> Vec<usize> {
        if bdr_attrs.contains(&1) {
            self.essential_local.clone()
        } else {
            Vec::new()
        }
    }
}

/// A diffusion-like module whose operator rows are partitioned across the
/// group.
struct DistDiffusion {
    comm: SharedComm,
    part: Partition,
    a_global: DMatrix<f64>,
    b_global: DVector<f64>,
    essential_global: Vec<usize>,
    value: f64,
}

impl PhysicsModule for DistDiffusion {
    fn name(&self) -> &str {
        "diffusion"
    }

    fn fields(&self) -> Vec<FieldDecl> {
        let essential_local = self
            .essential_global
            .iter()
            .filter(|&&g| self.part.contains(g))
            .map(|&g| g - self.part.begin)
            .collect();
        vec![FieldDecl {
            name: "u".to_string(),
            space: Arc::new(RankedSpace {
                part: self.part,
                essential_local,
            }),
        }]
    }

    fn essential_bdr_attrs(&self, _kfes: usize) -> Vec<usize> {
        vec![1]
    }

    fn apply_essential(&self, _kfes: usize, x: &mut DVector<Complex64>) {
        for &g in &self.essential_global {
            if self.part.contains(g) {
                x[g - self.part.begin] = Complex64::new(self.value, 0.0);
            }
        }
    }

    fn local_operator(&self, _kfes: usize, term: usize) -> Option<Block> {
        if term > 0 {
            return None;
        }
        Some(dist_block(&self.comm, &self.a_global, self.part, self.part))
    }

    fn local_rhs(&self, _kfes: usize) -> Option<Block> {
        let local = DVector::from_iterator(
            self.part.local_len(),
            (self.part.begin..self.part.end).map(|g| self.b_global[g]),
        );
        Some(Block::Dist(DistBlock::new(
            SharedComm::clone(&self.comm),
            self.part,
            Partition::serial(1),
            Values::from_dense(&DMatrix::from_column_slice(local.len(), 1, local.as_slice())),
        )))
    }
}

fn tridiagonal(n: usize) -> DMatrix<f64> {
    let mut a = DMatrix::zeros(n, n);
    for i in 0..n {
        a[(i, i)] = 2.0;
        if i + 1 < n {
            a[(i, i + 1)] = -1.0;
            a[(i + 1, i)] = -1.0;
        }
    }
    a
}

fn solve_diffusion(comm: SharedComm, size: usize) -> DVector<Complex64> {
    let n = 5;
    let module = DistDiffusion {
        part: rank_partition(n, comm.rank(), size),
        comm,
        a_global: tridiagonal(n),
        b_global: DVector::from_element(n, 1.0),
        essential_global: vec![0],
        value: 1.0,
    };
    let mut assembler = Assembler::new(vec![Box::new(module)], AssemblyOptions::default());
    let mut pass = assembler.assemble().unwrap();
    let solution = pass
        .solve_with(&DenseLuSolver::new(SolverFormat::Coo))
        .unwrap();
    solution.field("u").unwrap().clone()
}

#[test]
fn distributed_assembly_matches_single_process() {
    let reference = solve_diffusion(Arc::new(SelfComm), 1);

    // The prescribed dof and the interior equations of the original system.
    assert!((reference[0].re - 1.0).abs() < 1e-12);
    let a = tridiagonal(5);
    let residual = &a * reference.map(|z| z.re) - DVector::from_element(5, 1.0);
    for r in 1..5 {
        assert!(residual[r].abs() < 1e-10);
    }

    let handles: Vec<_> = ThreadGroup::split(2)
        .into_iter()
        .map(|comm| thread::spawn(move || solve_diffusion(Arc::new(comm), 2)))
        .collect();
    for handle in handles {
        let u = handle.join().unwrap();
        for (z, r) in u.iter().zip(reference.iter()) {
            assert!((z - r).norm() < 1e-10);
        }
    }
}
