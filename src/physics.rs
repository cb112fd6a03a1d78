//! Interfaces to the external physics-module collaborators.
//!
//! The assembly engine does not compute element matrices itself; physics
//! modules hand it already-assembled per-field operators, coupling blocks
//! and extra (Lagrange-multiplier) unknowns through the traits below.

use crate::block::Block;
use crate::Complex64;
use nalgebra::DVector;
use std::sync::Arc;

/// Per-field finite-element space information.
pub trait FieldSpace {
    /// Number of true degrees of freedom owned by this rank.
    fn true_dof_count(&self) -> usize;

    /// Total number of true degrees of freedom across all ranks.
    fn global_true_dof_count(&self) -> usize {
        self.true_dof_count()
    }

    /// Offset of this rank's first true dof in global numbering.
    fn true_dof_offset(&self) -> usize {
        0
    }

    /// True dofs (this rank, local numbering) constrained by the given
    /// boundary attributes.
    fn essential_true_dofs(&self, bdr_attrs: &[usize]) -> Vec<usize>;
}

/// One unknown field declared by a physics module.
pub struct FieldDecl {
    pub name: String,
    pub space: Arc<dyn FieldSpace>,
}

/// A mixed bilinear-form contribution coupling two fields of one module.
///
/// `row`/`col` are field indices within the contributing module. When
/// `fill_transpose` is set the matrix is transposed before placement, and
/// `conjugate` additionally conjugates it. Several contributions may target
/// the same grid location; they accumulate.
pub struct MixedForm {
    pub row: usize,
    pub col: usize,
    pub fill_transpose: bool,
    pub conjugate: bool,
    pub matrix: Block,
}

/// Identifies one extra unknown: the dependent field it couples to, and the
/// multiplier name. Declaring the same key twice is a fatal configuration
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtraKey {
    pub field: String,
    pub name: String,
}

/// An extra-DoF (Lagrange multiplier) contribution.
///
/// `to_field` and `from_field` are shaped `field × extra`; `from_field` is
/// transposed at placement into the `(extra, field)` grid cell. `diagonal`
/// is the `extra × extra` block, `rhs` the multiplier right-hand side.
/// `report` marks multipliers whose solved value is handed back after the
/// solve.
pub struct ExtraContribution {
    pub key: ExtraKey,
    pub to_field: Option<Block>,
    pub from_field: Option<Block>,
    pub diagonal: Option<Block>,
    pub rhs: Option<DVector<Complex64>>,
    pub report: bool,
}

/// A linear constraint collapsing a field's raw unknowns onto a reduced
/// basis (periodicity, hanging-node continuity).
///
/// `projector` maps raw onto reduced unknowns (`reduced × raw`); `kept` and
/// `zeroed` list the reduced-space diagonal indices that survive and that
/// must be pinned to identity rows, respectively.
pub struct InterpConstraint {
    pub projector: Block,
    pub kept: Vec<usize>,
    pub zeroed: Vec<usize>,
}

/// One physics module: enumerates its fields and hands the engine its
/// assembled contributions.
///
/// `term` selects the operator slot for multi-matrix assemblies (e.g.
/// `M0 x_n = M1 x_{n-1} + ... + b`); single-matrix problems only ever see
/// `term == 0`.
pub trait PhysicsModule {
    fn name(&self) -> &str;

    /// Unknown fields, in a stable order. Field indices (`kfes`) used by
    /// the other methods index into this list.
    fn fields(&self) -> Vec<FieldDecl>;

    fn is_complex(&self) -> bool {
        false
    }

    /// Checked before every assembly pass; a missing required setting must
    /// surface here.
    fn verify_settings(&self) -> eyre::Result<()> {
        Ok(())
    }

    fn update_parameters(&mut self) -> eyre::Result<()> {
        Ok(())
    }

    /// Boundary attributes carrying essential conditions for field `kfes`,
    /// unioned over all enabled components.
    fn essential_bdr_attrs(&self, kfes: usize) -> Vec<usize> {
        let _ = kfes;
        Vec::new()
    }

    /// Writes prescribed essential values into this rank's slice of the
    /// unknown vector of field `kfes`.
    fn apply_essential(&self, kfes: usize, x: &mut DVector<Complex64>) {
        let _ = (kfes, x);
    }

    /// The assembled square bilinear-form block of field `kfes`.
    fn local_operator(&self, kfes: usize, term: usize) -> Option<Block>;

    /// The assembled linear-form block of field `kfes` (an n×1 block).
    fn local_rhs(&self, kfes: usize) -> Option<Block> {
        let _ = kfes;
        None
    }

    fn mixed_forms(&self, term: usize) -> Vec<MixedForm> {
        let _ = term;
        Vec::new()
    }

    /// Extra unknowns this module will contribute, declared up front so
    /// that global offsets can be assigned before assembly.
    fn extra_dof_keys(&self) -> Vec<ExtraKey> {
        Vec::new()
    }

    fn extra_contributions(&self, term: usize) -> Vec<ExtraContribution> {
        let _ = term;
        Vec::new()
    }

    /// Interpolation-constraint contributions for field `kfes`; the engine
    /// merges multiple contributions by projector composition.
    fn interpolation(&self, kfes: usize) -> Vec<InterpConstraint> {
        let _ = kfes;
        Vec::new()
    }
}

/// A field space with a fixed dof count and a direct attribute → dof map.
/// Sufficient for single-rank runs and tests; real discretizations
/// implement [`FieldSpace`] against their finite-element library.
pub struct SimpleFieldSpace {
    dof_count: usize,
    essential_by_attr: Vec<(usize, Vec<usize>)>,
}

impl SimpleFieldSpace {
    pub fn new(dof_count: usize) -> Self {
        SimpleFieldSpace {
            dof_count,
            essential_by_attr: Vec::new(),
        }
    }

    pub fn with_essential(mut self, attr: usize, dofs: Vec<usize>) -> Self {
        self.essential_by_attr.push((attr, dofs));
        self
    }
}

impl FieldSpace for SimpleFieldSpace {
    fn true_dof_count(&self) -> usize {
        self.dof_count
    }

    fn essential_true_dofs(&self, bdr_attrs: &[usize]) -> Vec<usize> {
        let mut dofs: Vec<usize> = self
            .essential_by_attr
            .iter()
            .filter(|(attr, _)| bdr_attrs.contains(attr))
            .flat_map(|(_, dofs)| dofs.iter().copied())
            .collect();
        dofs.sort_unstable();
        dofs.dedup();
        dofs
    }
}
