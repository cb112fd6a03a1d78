//! Orchestration of one assembly pass.

use crate::assembly::context::AssemblyContext;
use crate::assembly::essential::{self, DiagPolicy};
use crate::block::{Block, DistBlock, Partition, RealSplit, Values};
use crate::comm::SharedComm;
use crate::grid::BlockGrid;
use crate::physics::{ExtraContribution, ExtraKey, MixedForm, PhysicsModule};
use crate::solver::{AssembledSystem, LinearSolver, SolverFormat};
use crate::Complex64;
use eyre::{bail, WrapErr};
use log::{debug, info};
use nalgebra::DVector;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AssemblyOptions {
    pub diag_policy: DiagPolicy,
    pub real_split: RealSplit,
    /// Number of operator containers assembled against one right-hand side
    /// (`M0 x_n = M1 x_{n-1} + ... + b`). Stationary problems use 1.
    pub n_terms: usize,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        AssemblyOptions {
            diag_policy: DiagPolicy::default(),
            real_split: RealSplit::default(),
            n_terms: 1,
        }
    }
}

/// Drives physics modules through the assembly phase sequence and produces
/// an [`AssembledPass`].
pub struct Assembler {
    modules: Vec<Box<dyn PhysicsModule>>,
    options: AssemblyOptions,
}

/// The product of one assembly pass: the block operators, right-hand side
/// and elimination grid, plus the context that placed them.
pub struct AssembledPass {
    pub context: AssemblyContext,
    pub operators: Vec<BlockGrid>,
    pub rhs: BlockGrid,
    pub elimination: BlockGrid,
    /// Set by [`AssembledPass::eliminate_and_shrink`]; maps original row
    /// spaces onto the kept ones.
    pub projector: Option<BlockGrid>,
    options: AssemblyOptions,
    extra_reports: Vec<ExtraKey>,
    shrunk: bool,
}

/// The recovered solution: per-field raw unknown vectors (global
/// numbering), and the values of reported extra unknowns.
pub struct Solution {
    pub fields: Vec<(String, DVector<Complex64>)>,
    pub extras: Vec<(ExtraKey, DVector<Complex64>)>,
}

impl Solution {
    pub fn field(&self, name: &str) -> Option<&DVector<Complex64>> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// The distributed backend of a grid row, if any cell uses one.
fn dist_row_backend(grid: &BlockGrid, row: usize) -> Option<(SharedComm, Partition)> {
    for j in 0..grid.ncols() {
        if let Some(block @ Block::Dist(d)) = grid.get(row, j) {
            return Some((SharedComm::clone(d.comm()), block.row_partition()));
        }
    }
    None
}

/// The distributed backend of a grid column, if any cell uses one.
fn dist_col_backend(grid: &BlockGrid, col: usize) -> Option<(SharedComm, Partition)> {
    for i in 0..grid.nrows() {
        if let Some(block @ Block::Dist(d)) = grid.get(i, col) {
            return Some((SharedComm::clone(d.comm()), block.col_partition()));
        }
    }
    None
}

/// Wraps a globally known n×1 vector in the backend of the given row.
fn vector_block_for_row(
    backend: Option<(SharedComm, Partition)>,
    v: &DVector<Complex64>,
    complex: bool,
) -> Block {
    match backend {
        Some((comm, part)) => {
            let local =
                DVector::from_iterator(part.local_len(), (part.begin..part.end).map(|g| v[g]));
            Block::Dist(DistBlock::new(
                comm,
                part,
                Partition::serial(1),
                Values::vector(&local, complex),
            ))
        }
        None => Block::local_vector(v, complex),
    }
}

/// Essential dofs of a field in global numbering, unioned across the group
/// when the field's operator is distributed.
fn collect_global_essential(reference: Option<&Block>, global_local: &[usize]) -> Vec<usize> {
    let mut collected = match reference {
        Some(Block::Dist(d)) => d.comm().allgather_usizes(global_local),
        _ => global_local.to_vec(),
    };
    collected.sort_unstable();
    collected.dedup();
    collected
}

impl Assembler {
    pub fn new(modules: Vec<Box<dyn PhysicsModule>>, options: AssemblyOptions) -> Self {
        assert!(options.n_terms >= 1, "at least one operator term is required");
        Assembler { modules, options }
    }

    pub fn options(&self) -> &AssemblyOptions {
        &self.options
    }

    /// Runs one full assembly pass. On failure nothing usable is left
    /// behind; the next attempt re-runs from allocation.
    pub fn assemble(&mut self) -> eyre::Result<AssembledPass> {
        // AllocateFieldsAndUnknowns
        let mut context = AssemblyContext::allocate(&self.modules)?;

        // UpdateParameters
        for module in &mut self.modules {
            let name = module.name().to_string();
            module
                .update_parameters()
                .wrap_err_with(|| format!("{}: parameter update failed", name))?;
        }

        // InitializePhysics (verification happens before anything is built)
        for module in &self.modules {
            module
                .verify_settings()
                .wrap_err_with(|| format!("{}: invalid settings", module.name()))?;
        }

        let fields = context.field_vars();
        let n = context.len();
        let n_terms = self.options.n_terms;
        info!(
            "assembling {} dependent variables ({} fields), {} operator term(s)",
            n,
            fields.len(),
            n_terms
        );

        // ApplyEssentialValues: prescribed values per field, local slice
        let mut prescribed: FxHashMap<usize, DVector<Complex64>> = FxHashMap::default();
        for &(idx, mi, kfes, ref space) in &fields {
            let mut x = DVector::zeros(space.true_dof_count());
            self.modules[mi].apply_essential(kfes, &mut x);
            prescribed.insert(idx, x);
        }

        // AssembleLocalForms
        let mut diag: Vec<FxHashMap<usize, Block>> =
            (0..n_terms).map(|_| FxHashMap::default()).collect();
        let mut rhs_blocks: FxHashMap<usize, Block> = FxHashMap::default();
        for &(idx, mi, kfes, ref space) in &fields {
            let module = &self.modules[mi];
            for (term, slot) in diag.iter_mut().enumerate() {
                if let Some(block) = module.local_operator(kfes, term) {
                    if block.nrows() != block.ncols() {
                        bail!(
                            "{}: operator of field {} is not square",
                            module.name(),
                            context.dep_var(idx).name
                        );
                    }
                    if block.nrows() != space.global_true_dof_count() {
                        bail!(
                            "{}: operator of field {} has {} rows, expected {}",
                            module.name(),
                            context.dep_var(idx).name,
                            block.nrows(),
                            space.global_true_dof_count()
                        );
                    }
                    slot.insert(idx, block);
                }
            }
            if let Some(b) = module.local_rhs(kfes) {
                rhs_blocks.insert(idx, b);
            }
        }

        // AssembleMixedForms
        let mut mixed: Vec<Vec<(usize, MixedForm)>> = (0..n_terms).map(|_| Vec::new()).collect();
        for (term, slot) in mixed.iter_mut().enumerate() {
            for (mi, module) in self.modules.iter().enumerate() {
                for mf in module.mixed_forms(term) {
                    slot.push((mi, mf));
                }
            }
        }

        // FormLocalLinearSystem + CollectGlobalEssentialIndexSets
        for &(idx, mi, kfes, ref space) in &fields {
            let module = &self.modules[mi];
            let attrs = module.essential_bdr_attrs(kfes);
            let local_ess = space.essential_true_dofs(&attrs);
            let global_local: Vec<usize> = local_ess
                .iter()
                .map(|d| d + space.true_dof_offset())
                .collect();
            let collected = collect_global_essential(diag[0].get(&idx), &global_local);
            debug!(
                "field {}: {} essential dofs",
                context.dep_var(idx).name,
                collected.len()
            );

            let mut diag_values = Vec::new();
            if let Some(a) = diag[0].get_mut(&idx) {
                let complex = module.is_complex();
                let x_block = essential::vector_block_like(a, &prescribed[&idx], complex);
                let mut b = match rhs_blocks.remove(&idx) {
                    Some(b) => b,
                    None => essential::vector_block_like(
                        a,
                        &DVector::zeros(a.local_nrows()),
                        complex,
                    ),
                };
                diag_values = essential::form_local_system(
                    a,
                    &mut b,
                    &x_block,
                    &collected,
                    self.options.diag_policy,
                );
                rhs_blocks.insert(idx, b);
            }
            for slot in diag.iter_mut().skip(1) {
                if let Some(a) = slot.get_mut(&idx) {
                    a.reset_rows(&collected);
                    a.reset_cols(&collected);
                }
            }
            context.set_essential(idx, collected, diag_values);
        }

        // AssembleExtraDoF
        let mut extras: Vec<FxHashMap<ExtraKey, ExtraContribution>> =
            (0..n_terms).map(|_| FxHashMap::default()).collect();
        let mut extra_reports: Vec<ExtraKey> = Vec::new();
        for (term, slot) in extras.iter_mut().enumerate() {
            for module in &self.modules {
                for contribution in module.extra_contributions(term) {
                    let key = contribution.key.clone();
                    if context.index_of(&key.name).is_none() {
                        bail!(
                            "extra ({}, {}) was not declared before assembly",
                            key.field,
                            key.name
                        );
                    }
                    if slot.contains_key(&key) {
                        bail!("extra with key ({}, {}) already exists", key.field, key.name);
                    }
                    if term == 0 && contribution.report {
                        extra_reports.push(key.clone());
                    }
                    slot.insert(key, contribution);
                }
            }
        }

        // AssembleInterpolationConstraints
        for &(idx, mi, kfes, _) in &fields {
            let mut contribs = self.modules[mi].interpolation(kfes).into_iter();
            if let Some(mut merged) = contribs.next() {
                for c in contribs {
                    merged.projector = merged.projector.dot(&c.projector);
                    merged.kept.extend(c.kept);
                    merged.zeroed.extend(c.zeroed);
                }
                context.set_interp(idx, merged);
            }
        }

        // PlaceIntoGlobalBlockContainer
        let mut operators: Vec<BlockGrid> = (0..n_terms).map(|_| BlockGrid::new(n, n)).collect();
        let mut rhs = BlockGrid::vector(n);

        for &(idx, _, _, _) in &fields {
            for (term, slot) in diag.iter_mut().enumerate() {
                if let Some(a) = slot.remove(&idx) {
                    let a = match context.interp(idx) {
                        Some(c) => {
                            let mut projected = c
                                .projector
                                .conjugated()
                                .dot(&a)
                                .dot(&c.projector.transposed());
                            projected.set_diag(&c.zeroed, Complex64::new(1.0, 0.0));
                            projected
                        }
                        None => a,
                    };
                    operators[term].set(idx, idx, a);
                }
            }
            if let Some(b) = rhs_blocks.remove(&idx) {
                let b = match context.interp(idx) {
                    Some(c) => c.projector.conjugated().dot(&b),
                    None => b,
                };
                rhs.set(idx, 0, b);
            }
        }

        for (term, slot) in mixed.into_iter().enumerate() {
            for (mi, mf) in slot {
                let row = context.field_index(mi, mf.row);
                let col = context.field_index(mi, mf.col);
                let mut m = mf.matrix;
                if mf.fill_transpose {
                    m = m.transposed();
                }
                if mf.conjugate {
                    m = m.conjugated();
                }
                if let Some(c) = context.interp(row) {
                    m = c.projector.conjugated().dot(&m);
                }
                if let Some(c) = context.interp(col) {
                    m = m.dot(&c.projector.conjugated().transposed());
                }
                operators[term].add_to_element(row, col, m);
            }
        }

        let mut extra_rhs: Vec<(ExtraKey, DVector<Complex64>)> = Vec::new();
        for (term, slot) in extras.into_iter().enumerate() {
            for (key, contribution) in slot {
                let f = context.index_of(&key.field).unwrap();
                let e = context.index_of(&key.name).unwrap();
                if let Some(t1) = contribution.to_field {
                    let t1 = match context.interp(f) {
                        Some(c) => c.projector.conjugated().dot(&t1),
                        None => t1,
                    };
                    operators[term].set(f, e, t1);
                }
                if let Some(t2) = contribution.from_field {
                    let t2 = match context.interp(f) {
                        Some(c) => c.projector.dot(&t2),
                        None => t2,
                    };
                    operators[term].set(e, f, t2.transposed());
                }
                if let Some(t3) = contribution.diagonal {
                    operators[term].set(e, e, t3);
                }
                if term == 0 {
                    if let Some(t4) = contribution.rhs {
                        extra_rhs.push((key, t4));
                    }
                }
            }
        }
        for (key, t4) in extra_rhs {
            let e = context.index_of(&key.name).unwrap();
            let block = vector_block_for_row(dist_row_backend(&operators[0], e), &t4, false);
            rhs.set(e, 0, block);
        }

        if rhs.is_zero() {
            debug!("right-hand side is empty after placement");
        }

        // Placeholder diagonal blocks so elimination can act on fields
        // nothing contributed to.
        for idx in 0..n {
            if operators[0].get(idx, idx).is_none() {
                operators[0].add_empty_square_block(idx, idx);
            }
        }

        // EliminateAndShrink, part 1: the two elimination passes. The
        // shrink itself is deferred to `AssembledPass::eliminate_and_shrink`
        // since the right-hand side correction must see all fields.
        for &(idx, _, _, _) in &fields {
            let ess = context.essential(idx).to_vec();
            essential::eliminate_essential_rows(&mut operators[0], idx, &ess);
        }
        let mut elimination = BlockGrid::new(n, n);
        for &(idx, _, _, _) in &fields {
            let ess = context.essential(idx).to_vec();
            let diag_values = context.essential_diag(idx).to_vec();
            essential::fill_elimination_blocks(
                &operators[0],
                &mut elimination,
                idx,
                &ess,
                &diag_values,
            );
        }

        debug!("assembled operator nnz:\n{}", operators[0].format_nnz());

        Ok(AssembledPass {
            context,
            operators,
            rhs,
            elimination,
            projector: None,
            options: self.options,
            extra_reports,
            shrunk: false,
        })
    }

    /// Rebuilds only the right-hand side of an existing pass, reusing its
    /// collected essential sets, interpolation constraints and elimination
    /// grid. The pass must already be shrunk so the stored projector can be
    /// applied.
    pub fn assemble_rhs_only(&mut self, pass: &mut AssembledPass) -> eyre::Result<()> {
        pass.context.check_usable()?;
        if !pass.shrunk {
            bail!("assemble_rhs_only requires a shrunk pass");
        }
        let result = self.rebuild_rhs(pass);
        if result.is_err() {
            pass.context.poison();
        }
        result
    }

    fn rebuild_rhs(&mut self, pass: &mut AssembledPass) -> eyre::Result<()> {
        for module in &mut self.modules {
            let name = module.name().to_string();
            module
                .update_parameters()
                .wrap_err_with(|| format!("{}: parameter update failed", name))?;
        }

        let fields = pass.context.field_vars();
        let n = pass.context.len();
        let mut rhs = BlockGrid::vector(n);

        for &(idx, mi, kfes, ref space) in &fields {
            let module = &self.modules[mi];
            let complex = module.is_complex();
            let mut a = match module.local_operator(kfes, 0) {
                Some(a) => a,
                None => continue,
            };
            let mut x = DVector::zeros(space.true_dof_count());
            module.apply_essential(kfes, &mut x);
            let x_block = essential::vector_block_like(&a, &x, complex);
            let mut b = match module.local_rhs(kfes) {
                Some(b) => b,
                None => essential::vector_block_like(&a, &DVector::zeros(a.local_nrows()), complex),
            };
            let _ = essential::form_local_system(
                &mut a,
                &mut b,
                &x_block,
                pass.context.essential(idx),
                self.options.diag_policy,
            );
            let b = match pass.context.interp(idx) {
                Some(c) => c.projector.conjugated().dot(&b),
                None => b,
            };
            rhs.set(idx, 0, b);
        }

        for module in &self.modules {
            for contribution in module.extra_contributions(0) {
                if let Some(t4) = contribution.rhs {
                    let e = match pass.context.index_of(&contribution.key.name) {
                        Some(e) => e,
                        None => bail!(
                            "extra ({}, {}) was not declared before assembly",
                            contribution.key.field,
                            contribution.key.name
                        ),
                    };
                    let block =
                        vector_block_for_row(dist_col_backend(&pass.elimination, e), &t4, false);
                    rhs.set(e, 0, block);
                }
            }
        }

        let corrected = rhs.sub(&pass.elimination.dot(&rhs));
        let projector = pass.projector.as_ref().unwrap();
        pass.rhs = projector.dot(&corrected);
        Ok(())
    }
}

impl AssembledPass {
    fn system_complex(&self) -> bool {
        self.operators[0].is_complex() || self.rhs.is_complex()
    }

    /// Per-block right-hand-side norms, for convergence logging.
    pub fn rhs_norms(&self) -> Vec<f64> {
        self.rhs.block_norms()
    }

    /// Applies the stored elimination contribution to the right-hand side
    /// (`b := b - Ae·b`), shrinks structurally empty rows and columns of
    /// every operator term, and keeps the right-hand side consistent
    /// through the elimination projector.
    pub fn eliminate_and_shrink(&mut self) {
        assert!(!self.shrunk, "eliminate_and_shrink already ran for this pass");
        debug!("elimination grid nnz:\n{}", self.elimination.format_nnz());

        let corrected = self.rhs.sub(&self.elimination.dot(&self.rhs));
        let (reduced, projector) = self.operators[0].eliminate_empty_rowcol();
        info!(
            "shrink: {:?} -> {:?}",
            self.operators[0].global_row_sizes(),
            reduced.global_row_sizes()
        );
        self.operators[0] = reduced;
        for k in 1..self.operators.len() {
            self.operators[k] = projector
                .dot(&self.operators[k])
                .dot(&projector.transposed());
        }
        self.rhs = projector.dot(&corrected);
        self.projector = Some(projector);
        self.shrunk = true;
    }

    /// Finalizes the shrunk system into the encoding a solver consumes.
    /// All encodings represent the same system.
    pub fn finalize(&self, format: SolverFormat) -> AssembledSystem {
        let m = &self.operators[0];
        let sizes = m.global_row_sizes();
        let complex = self.system_complex();
        match format {
            SolverFormat::Coo => {
                let matrix = match (m.global_matrix(), complex) {
                    (matrix @ Values::Complex(_), _) => matrix,
                    (matrix, false) => matrix,
                    (matrix, true) => Values::Complex(matrix.to_complex()),
                };
                AssembledSystem::Coo {
                    matrix,
                    rhs: vec![self.rhs.gather_dense_vec(&sizes)],
                }
            }
            SolverFormat::CooReal => {
                let split = self.options.real_split;
                if complex {
                    let matrix = m.global_matrix().real_stacked(split);
                    let b = self.rhs.gather_dense_vec(&sizes);
                    let sign = match split {
                        RealSplit::Standard => 1.0,
                        RealSplit::Symmetric => -1.0,
                    };
                    let stacked = DVector::from_iterator(
                        2 * b.len(),
                        b.iter()
                            .map(|z| z.re)
                            .chain(b.iter().map(|z| sign * z.im))
                            .collect::<Vec<_>>(),
                    );
                    AssembledSystem::CooReal {
                        matrix,
                        rhs: vec![stacked],
                        split,
                    }
                } else {
                    let matrix = m.global_matrix().real_part();
                    let b = self.rhs.gather_dense_vec(&sizes).map(|z| z.re);
                    AssembledSystem::CooReal {
                        matrix,
                        rhs: vec![b],
                        split,
                    }
                }
            }
            SolverFormat::BlkInterleave => AssembledSystem::BlkInterleave {
                operator: m.interleaved(complex),
                rhs: vec![self.rhs.gather_interleaved_vec(&sizes, complex)],
            },
        }
    }

    /// Decodes a solver's raw solution (in the encoding's numbering) back
    /// into the complex reduced numbering.
    fn decode_solution(
        &self,
        format: SolverFormat,
        raw: DVector<Complex64>,
    ) -> DVector<Complex64> {
        if !self.system_complex() {
            return raw;
        }
        match format {
            SolverFormat::Coo => raw,
            SolverFormat::CooReal => {
                // Both stacking conventions solve for [Re(x); Im(x)].
                let n = raw.len() / 2;
                DVector::from_iterator(
                    n,
                    (0..n).map(|k| Complex64::new(raw[k].re, raw[n + k].re)),
                )
            }
            SolverFormat::BlkInterleave => {
                let sizes = self.operators[0].global_row_sizes();
                let total: usize = sizes.iter().sum();
                let mut out = DVector::zeros(total);
                let mut native = 0;
                let mut interleaved = 0;
                for &s in &sizes {
                    for k in 0..s {
                        out[native + k] =
                            Complex64::new(raw[interleaved + k].re, raw[interleaved + s + k].re);
                    }
                    native += s;
                    interleaved += 2 * s;
                }
                out
            }
        }
    }

    /// Finalizes for the given solver, solves, and recovers per-field
    /// solution vectors using the same offsets that placed the system.
    pub fn solve_with(&mut self, solver: &dyn LinearSolver) -> eyre::Result<Solution> {
        self.context.check_usable()?;
        solver
            .verify_settings()
            .wrap_err_with(|| format!("{}: invalid solver settings", solver.name()))?;
        if !self.shrunk {
            self.eliminate_and_shrink();
        }
        let system = self.finalize(solver.format());
        debug!(
            "solving {} unknowns with {}",
            system.unknown_count(),
            solver.name()
        );
        let mut solutions = solver.solve(&system)?;
        if solutions.is_empty() {
            bail!("{}: solver returned no solution", solver.name());
        }
        let flat = self.decode_solution(solver.format(), solutions.remove(0));
        self.recover_solution(&flat)
    }

    /// Splits a flat reduced solution by the placement offsets, re-expands
    /// eliminated rows through the projector, inverse-projects constrained
    /// fields, and returns per-field unknown vectors.
    pub fn recover_solution(&self, flat: &DVector<Complex64>) -> eyre::Result<Solution> {
        self.context.check_usable()?;
        let projector = match &self.projector {
            Some(p) => p,
            None => bail!("solution recovery requires a shrunk pass"),
        };
        let complex = self.system_complex();
        let n = self.context.len();
        let sizes = self.operators[0].global_row_sizes();
        assert_eq!(
            flat.len(),
            sizes.iter().sum::<usize>(),
            "solution length does not match the reduced system"
        );

        let mut sol = BlockGrid::vector(n);
        let mut offset = 0;
        for i in 0..n {
            let s = sizes[i];
            if s > 0 {
                let seg = DVector::from_iterator(s, (offset..offset + s).map(|k| flat[k]));
                let block =
                    vector_block_for_row(dist_row_backend(&self.operators[0], i), &seg, complex);
                sol.set(i, 0, block);
            }
            offset += s;
        }

        let expanded = projector.transposed().dot(&sol);

        let mut fields_out = Vec::new();
        for (idx, _, _, space) in self.context.field_vars() {
            let name = self.context.dep_var(idx).name.clone();
            let value = match expanded.get(idx, 0) {
                Some(block) => {
                    let y = block.dense_vector();
                    match self.context.interp(idx) {
                        Some(c) => {
                            let p = c.projector.global_values().to_complex();
                            p.transpose().spmv(&y)
                        }
                        None => y,
                    }
                }
                None => DVector::zeros(space.global_true_dof_count()),
            };
            fields_out.push((name, value));
        }

        let mut extras_out = Vec::new();
        for key in &self.extra_reports {
            let idx = self.context.index_of(&key.name).unwrap();
            let value = match expanded.get(idx, 0) {
                Some(block) => block.dense_vector(),
                None => DVector::zeros(0),
            };
            extras_out.push((key.clone(), value));
        }

        Ok(Solution {
            fields: fields_out,
            extras: extras_out,
        })
    }
}
