//! Per-pass assembly state: the ordered dependent-variable table, global
//! offsets, collected essential index sets and merged interpolation
//! constraints.
//!
//! The context is rebuilt from scratch at the start of every assembly pass
//! and is keyed by stable grid indices, never by pointer identity. A failed
//! pass poisons the context; every later use errors out until a full
//! re-assembly replaces it.

use crate::physics::{ExtraKey, FieldSpace, InterpConstraint, PhysicsModule};
use eyre::bail;
use rustc_hash::FxHashMap;
use std::ops::Range;
use std::sync::Arc;

pub enum DepVarKind {
    /// A finite-element field: `(module index, field index within module)`.
    Field {
        module: usize,
        kfes: usize,
        space: Arc<dyn FieldSpace>,
    },
    /// An extra (Lagrange-multiplier) unknown.
    Extra { module: usize, key: ExtraKey },
}

pub struct DepVar {
    pub name: String,
    pub kind: DepVarKind,
}

pub struct AssemblyContext {
    dep_vars: Vec<DepVar>,
    index_by_name: FxHashMap<String, usize>,
    ess_tdofs: FxHashMap<usize, Vec<usize>>,
    ess_diag: FxHashMap<usize, Vec<crate::Complex64>>,
    interp: FxHashMap<usize, InterpConstraint>,
    poisoned: bool,
}

impl AssemblyContext {
    /// Builds the dependent-variable table: FES fields grouped by module in
    /// declaration order, followed by all extra unknowns keyed
    /// `(field, multiplier)`. Offsets assigned here are valid for exactly
    /// one pass; changing the enabled module set invalidates them all.
    pub fn allocate(modules: &[Box<dyn PhysicsModule>]) -> eyre::Result<AssemblyContext> {
        let mut context = AssemblyContext {
            dep_vars: Vec::new(),
            index_by_name: FxHashMap::default(),
            ess_tdofs: FxHashMap::default(),
            ess_diag: FxHashMap::default(),
            interp: FxHashMap::default(),
            poisoned: false,
        };

        for (mi, module) in modules.iter().enumerate() {
            for (kfes, decl) in module.fields().into_iter().enumerate() {
                context.push_dep_var(
                    decl.name.clone(),
                    DepVarKind::Field {
                        module: mi,
                        kfes,
                        space: decl.space,
                    },
                )?;
            }
        }

        let mut seen_keys: Vec<ExtraKey> = Vec::new();
        for (mi, module) in modules.iter().enumerate() {
            for key in module.extra_dof_keys() {
                if seen_keys.contains(&key) {
                    bail!(
                        "extra with key ({}, {}) already exists",
                        key.field,
                        key.name
                    );
                }
                match context.index_of(&key.field) {
                    Some(idx) if context.is_field(idx) => {}
                    _ => bail!(
                        "extra ({}, {}) refers to unknown field {}",
                        key.field,
                        key.name,
                        key.field
                    ),
                }
                seen_keys.push(key.clone());
                context.push_dep_var(
                    key.name.clone(),
                    DepVarKind::Extra { module: mi, key },
                )?;
            }
        }

        log::debug!(
            "dependent variables: {:?}",
            context.dep_vars.iter().map(|d| &d.name).collect::<Vec<_>>()
        );
        Ok(context)
    }

    fn push_dep_var(&mut self, name: String, kind: DepVarKind) -> eyre::Result<()> {
        if self.index_by_name.contains_key(&name) {
            bail!("dependent variable {} is declared twice", name);
        }
        self.index_by_name.insert(name.clone(), self.dep_vars.len());
        self.dep_vars.push(DepVar { name, kind });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.dep_vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dep_vars.is_empty()
    }

    pub fn dep_var(&self, idx: usize) -> &DepVar {
        &self.dep_vars[idx]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index_by_name.get(name).copied()
    }

    pub fn is_field(&self, idx: usize) -> bool {
        matches!(self.dep_vars[idx].kind, DepVarKind::Field { .. })
    }

    /// Grid indices of all FES fields, with their module/field identity.
    pub fn field_vars(&self) -> Vec<(usize, usize, usize, Arc<dyn FieldSpace>)> {
        self.dep_vars
            .iter()
            .enumerate()
            .filter_map(|(idx, dv)| match &dv.kind {
                DepVarKind::Field {
                    module,
                    kfes,
                    space,
                } => Some((idx, *module, *kfes, Arc::clone(space))),
                DepVarKind::Extra { .. } => None,
            })
            .collect()
    }

    /// The grid index of field `kfes` of the given module.
    pub fn field_index(&self, module: usize, kfes: usize) -> usize {
        self.dep_vars
            .iter()
            .position(|dv| {
                matches!(&dv.kind, DepVarKind::Field { module: m, kfes: k, .. }
                         if *m == module && *k == kfes)
            })
            .unwrap_or_else(|| panic!("module {} has no field {}", module, kfes))
    }

    pub fn set_essential(
        &mut self,
        idx: usize,
        gl_ess_tdofs: Vec<usize>,
        diag: Vec<crate::Complex64>,
    ) {
        self.ess_tdofs.insert(idx, gl_ess_tdofs);
        self.ess_diag.insert(idx, diag);
    }

    /// Collected global essential dofs of a field; empty if none.
    pub fn essential(&self, idx: usize) -> &[usize] {
        self.ess_tdofs.get(&idx).map_or(&[], |v| v.as_slice())
    }

    /// Diagonal values written at the essential dofs, aligned with
    /// [`AssemblyContext::essential`].
    pub fn essential_diag(&self, idx: usize) -> &[crate::Complex64] {
        self.ess_diag.get(&idx).map_or(&[], |v| v.as_slice())
    }

    pub fn set_interp(&mut self, idx: usize, constraint: InterpConstraint) {
        self.interp.insert(idx, constraint);
    }

    pub fn interp(&self, idx: usize) -> Option<&InterpConstraint> {
        self.interp.get(&idx)
    }

    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn check_usable(&self) -> eyre::Result<()> {
        if self.poisoned {
            bail!("a previous assembly failure invalidated this context; re-run assembly");
        }
        Ok(())
    }

    /// The contiguous global scalar range of every dependent variable,
    /// given the per-row global sizes of the placed operator. Ranges are
    /// disjoint in insertion order and their union is `[0, N)`.
    pub fn scalar_ranges(&self, row_sizes: &[usize]) -> Vec<Range<usize>> {
        assert_eq!(row_sizes.len(), self.len());
        let mut offset = 0;
        row_sizes
            .iter()
            .map(|&size| {
                let range = offset..offset + size;
                offset += size;
                range
            })
            .collect()
    }
}
