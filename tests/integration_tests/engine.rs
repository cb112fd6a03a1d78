use blockform::assembly::{Assembler, AssemblyOptions, DiagPolicy};
use blockform::block::{Block, RealSplit, Values};
use blockform::physics::{
    ExtraContribution, ExtraKey, FieldDecl, InterpConstraint, MixedForm, PhysicsModule,
    SimpleFieldSpace,
};
use blockform::solver::{DenseLuSolver, SolverFormat};
use blockform::Complex64;
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

const ESS_ATTR: usize = 1;

fn cvec(entries: &[f64]) -> DVector<Complex64> {
    DVector::from_iterator(entries.len(), entries.iter().map(|&v| Complex64::new(v, 0.0)))
}

fn cmat(m: &DMatrix<f64>) -> DMatrix<Complex64> {
    m.map(|v| Complex64::new(v, 0.0))
}

struct TestField {
    name: String,
    size: usize,
    operator: Option<DMatrix<Complex64>>,
    rhs: Option<DVector<Complex64>>,
    essential: Option<(Vec<usize>, Vec<Complex64>)>,
    interp: Option<(DMatrix<f64>, Vec<usize>, Vec<usize>)>,
}

struct TestExtra {
    key: ExtraKey,
    to_field: Option<DMatrix<f64>>,
    from_field: Option<DMatrix<f64>>,
    diagonal: Option<DMatrix<f64>>,
    rhs: Option<DVector<f64>>,
}

/// A physics module handing the engine fixed, pre-assembled contributions.
struct TestModule {
    name: String,
    complex: bool,
    fields: Vec<TestField>,
    couplings: Vec<(usize, usize, bool, bool, DMatrix<Complex64>)>,
    extras: Vec<TestExtra>,
}

impl TestModule {
    fn new(name: &str) -> Self {
        TestModule {
            name: name.to_string(),
            complex: false,
            fields: Vec::new(),
            couplings: Vec::new(),
            extras: Vec::new(),
        }
    }

    fn complex(mut self) -> Self {
        self.complex = true;
        self
    }

    fn field(mut self, name: &str, size: usize) -> Self {
        self.fields.push(TestField {
            name: name.to_string(),
            size,
            operator: None,
            rhs: None,
            essential: None,
            interp: None,
        });
        self
    }

    fn operator(mut self, m: DMatrix<f64>) -> Self {
        self.fields.last_mut().unwrap().operator = Some(cmat(&m));
        self
    }

    fn operator_c(mut self, m: DMatrix<Complex64>) -> Self {
        self.fields.last_mut().unwrap().operator = Some(m);
        self
    }

    fn rhs(mut self, v: &[f64]) -> Self {
        self.fields.last_mut().unwrap().rhs = Some(cvec(v));
        self
    }

    fn rhs_c(mut self, v: DVector<Complex64>) -> Self {
        self.fields.last_mut().unwrap().rhs = Some(v);
        self
    }

    fn essential(mut self, dofs: &[usize], value: Complex64) -> Self {
        self.fields.last_mut().unwrap().essential =
            Some((dofs.to_vec(), vec![value; dofs.len()]));
        self
    }

    fn interp(mut self, p: DMatrix<f64>, kept: Vec<usize>, zeroed: Vec<usize>) -> Self {
        self.fields.last_mut().unwrap().interp = Some((p, kept, zeroed));
        self
    }

    fn coupling(mut self, row: usize, col: usize, m: DMatrix<f64>) -> Self {
        self.couplings.push((row, col, false, false, cmat(&m)));
        self
    }

    fn extra(mut self, extra: TestExtra) -> Self {
        self.extras.push(extra);
        self
    }

    fn to_block(&self, m: &DMatrix<Complex64>) -> Block {
        if self.complex {
            Block::from_dense_complex(m)
        } else {
            Block::from_dense(&m.map(|z| z.re))
        }
    }
}

impl PhysicsModule for TestModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_complex(&self) -> bool {
        self.complex
    }

    fn fields(&self) -> Vec<FieldDecl> {
        self.fields
            .iter()
            .map(|f| {
                let mut space = SimpleFieldSpace::new(f.size);
                if let Some((dofs, _)) = &f.essential {
                    space = space.with_essential(ESS_ATTR, dofs.clone());
                }
                FieldDecl {
                    name: f.name.clone(),
                    space: Arc::new(space),
                }
            })
            .collect()
    }

    fn essential_bdr_attrs(&self, kfes: usize) -> Vec<usize> {
        if self.fields[kfes].essential.is_some() {
            vec![ESS_ATTR]
        } else {
            Vec::new()
        }
    }

    fn apply_essential(&self, kfes: usize, x: &mut DVector<Complex64>) {
        if let Some((dofs, values)) = &self.fields[kfes].essential {
            for (d, v) in dofs.iter().zip(values) {
                x[*d] = *v;
            }
        }
    }

    fn local_operator(&self, kfes: usize, term: usize) -> Option<Block> {
        if term > 0 {
            return None;
        }
        self.fields[kfes].operator.as_ref().map(|m| self.to_block(m))
    }

    fn local_rhs(&self, kfes: usize) -> Option<Block> {
        self.fields[kfes]
            .rhs
            .as_ref()
            .map(|v| Block::local_vector(v, self.complex))
    }

    fn mixed_forms(&self, term: usize) -> Vec<MixedForm> {
        if term > 0 {
            return Vec::new();
        }
        self.couplings
            .iter()
            .map(|(row, col, fill_transpose, conjugate, m)| MixedForm {
                row: *row,
                col: *col,
                fill_transpose: *fill_transpose,
                conjugate: *conjugate,
                matrix: self.to_block(m),
            })
            .collect()
    }

    fn extra_dof_keys(&self) -> Vec<ExtraKey> {
        self.extras.iter().map(|e| e.key.clone()).collect()
    }

    fn extra_contributions(&self, term: usize) -> Vec<ExtraContribution> {
        if term > 0 {
            return Vec::new();
        }
        self.extras
            .iter()
            .map(|e| ExtraContribution {
                key: e.key.clone(),
                to_field: e.to_field.as_ref().map(Block::from_dense),
                from_field: e.from_field.as_ref().map(Block::from_dense),
                diagonal: e.diagonal.as_ref().map(Block::from_dense),
                rhs: e.rhs.as_ref().map(|v| v.map(|x| Complex64::new(x, 0.0))),
                report: true,
            })
            .collect()
    }

    fn interpolation(&self, kfes: usize) -> Vec<InterpConstraint> {
        self.fields[kfes]
            .interp
            .as_ref()
            .map(|(p, kept, zeroed)| InterpConstraint {
                projector: Block::from_dense(p),
                kept: kept.clone(),
                zeroed: zeroed.clone(),
            })
            .into_iter()
            .collect()
    }
}

fn assemble(modules: Vec<Box<dyn PhysicsModule>>, options: AssemblyOptions) -> Assembler {
    Assembler::new(modules, options)
}

#[test]
fn two_modules_with_extra_unknown_layout() {
    let em = TestModule::new("em")
        .field("u", 4)
        .operator(DMatrix::identity(4, 4))
        .rhs(&[1.0, 1.0, 1.0, 1.0]);
    let heat = TestModule::new("heat")
        .field("v", 3)
        .operator(DMatrix::identity(3, 3))
        .rhs(&[2.0, 2.0, 2.0])
        .extra(TestExtra {
            key: ExtraKey {
                field: "u".to_string(),
                name: "lambda".to_string(),
            },
            to_field: None,
            from_field: None,
            diagonal: Some(DMatrix::identity(1, 1)),
            rhs: Some(DVector::from_vec(vec![3.0])),
        });

    let mut assembler = assemble(
        vec![Box::new(em), Box::new(heat)],
        AssemblyOptions::default(),
    );
    let mut pass = assembler.assemble().unwrap();

    let row_sizes = pass.operators[0].global_row_sizes();
    assert_eq!(row_sizes, vec![4, 3, 1]);
    let ranges = pass.context.scalar_ranges(&row_sizes);
    assert_eq!(ranges, vec![0..4, 4..7, 7..8]);

    let solution = pass
        .solve_with(&DenseLuSolver::new(SolverFormat::Coo))
        .unwrap();
    let u = solution.field("u").unwrap();
    let v = solution.field("v").unwrap();
    for z in u.iter() {
        assert!((z.re - 1.0).abs() < 1e-12 && z.im == 0.0);
    }
    for z in v.iter() {
        assert!((z.re - 2.0).abs() < 1e-12);
    }
    let (key, lambda) = &solution.extras[0];
    assert_eq!(key.name, "lambda");
    assert!((lambda[0].re - 3.0).abs() < 1e-12);
}

#[test]
fn essential_elimination_round_trip() {
    let a_u = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 4.0, 1.0, 0.0, 1.0, 4.0]);
    let a_v = DMatrix::from_row_slice(3, 3, &[5.0, 1.0, 0.0, 1.0, 5.0, 1.0, 0.0, 1.0, 5.0]);
    let coupling = DMatrix::identity(3, 3);
    let b_u = [1.0, 2.0, 3.0];
    let b_v = [4.0, 5.0, 6.0];

    let module = TestModule::new("coupled")
        .field("u", 3)
        .operator(a_u.clone())
        .rhs(&b_u)
        .essential(&[0], Complex64::new(5.0, 0.0))
        .field("v", 3)
        .operator(a_v.clone())
        .rhs(&b_v)
        .coupling(0, 1, coupling.clone());

    let mut assembler = assemble(vec![Box::new(module)], AssemblyOptions::default());
    let mut pass = assembler.assemble().unwrap();
    let solution = pass
        .solve_with(&DenseLuSolver::new(SolverFormat::Coo))
        .unwrap();

    let u = solution.field("u").unwrap();
    let v = solution.field("v").unwrap();

    // The constrained dof recovers its prescribed value exactly.
    assert_eq!(u[0].re, 5.0);
    assert_eq!(u[0].im, 0.0);

    // Field v carries no coupling into its own equations: it solves
    // A_v v = b_v untouched.
    let v_expected = a_v.lu().solve(&DVector::from_row_slice(&b_v)).unwrap();
    for (z, e) in v.iter().zip(v_expected.iter()) {
        assert!((z.re - e).abs() < 1e-12);
    }

    // The unconstrained rows of u satisfy the original coupled equations.
    let u_re = u.map(|z| z.re);
    let v_re = v.map(|z| z.re);
    let residual = &a_u * &u_re + &coupling * &v_re - DVector::from_row_slice(&b_u);
    assert!(residual[1].abs() < 1e-10);
    assert!(residual[2].abs() < 1e-10);
}

#[test]
fn complex_real_encodings_agree_with_native_solve() {
    let n = 4;
    let mut a = DMatrix::from_element(n, n, Complex64::new(0.0, 0.0));
    for i in 0..n {
        a[(i, i)] = Complex64::new(4.0, 1.0);
        if i + 1 < n {
            a[(i, i + 1)] = Complex64::new(1.0, -0.5);
            a[(i + 1, i)] = Complex64::new(0.5, 0.2);
        }
    }
    let b = DVector::from_iterator(
        n,
        (0..n).map(|i| Complex64::new(1.0 + i as f64, 2.0 - i as f64)),
    );

    let module = |split| {
        let m = TestModule::new("wave")
            .complex()
            .field("psi", n)
            .operator_c(a.clone())
            .rhs_c(b.clone())
            .essential(&[1], Complex64::new(2.0, 1.0));
        assemble(
            vec![Box::new(m)],
            AssemblyOptions {
                real_split: split,
                ..AssemblyOptions::default()
            },
        )
    };

    let mut reference_pass = module(RealSplit::Standard).assemble().unwrap();
    let reference = reference_pass
        .solve_with(&DenseLuSolver::new(SolverFormat::Coo))
        .unwrap();
    let psi_native = reference.field("psi").unwrap().clone();
    assert!((psi_native[1] - Complex64::new(2.0, 1.0)).norm() < 1e-12);

    for (split, format) in [
        (RealSplit::Standard, SolverFormat::CooReal),
        (RealSplit::Symmetric, SolverFormat::CooReal),
        (RealSplit::Standard, SolverFormat::BlkInterleave),
    ] {
        let mut pass = module(split).assemble().unwrap();
        let solution = pass.solve_with(&DenseLuSolver::new(format)).unwrap();
        let psi = solution.field("psi").unwrap();
        for (z, r) in psi.iter().zip(psi_native.iter()) {
            assert!(
                (z - r).norm() < 1e-10,
                "{:?} encoding diverges from the native solve",
                format
            );
        }
    }
}

#[test]
fn diag_one_policy_writes_unit_diagonal() {
    let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 4.0]);
    let module = TestModule::new("single")
        .field("u", 2)
        .operator(a)
        .rhs(&[1.0, 2.0])
        .essential(&[0], Complex64::new(5.0, 0.0));
    let mut assembler = assemble(
        vec![Box::new(module)],
        AssemblyOptions {
            diag_policy: DiagPolicy::DiagOne,
            ..AssemblyOptions::default()
        },
    );
    let mut pass = assembler.assemble().unwrap();
    pass.eliminate_and_shrink();
    let system = pass.finalize(SolverFormat::Coo);
    match system {
        blockform::solver::AssembledSystem::Coo { matrix, rhs } => {
            let dense = match matrix {
                Values::Real(m) => m.to_dense(),
                Values::Complex(_) => panic!("real system expected"),
            };
            assert_eq!(dense[(0, 0)], 1.0);
            assert_eq!(dense[(0, 1)], 0.0);
            assert_eq!(dense[(1, 0)], 0.0);
            assert_eq!(rhs[0][0].re, 5.0);
        }
        _ => panic!("coo system expected"),
    }
}

#[test]
fn lagrange_multiplier_couples_field_and_extra() {
    let g = DMatrix::from_row_slice(3, 1, &[1.0, 1.0, 1.0]);
    let module = TestModule::new("constrained")
        .field("u", 3)
        .operator(DMatrix::from_diagonal(&DVector::from_element(3, 2.0)))
        .rhs(&[0.0, 0.0, 0.0])
        .extra(TestExtra {
            key: ExtraKey {
                field: "u".to_string(),
                name: "flux".to_string(),
            },
            to_field: Some(g.clone()),
            from_field: Some(g),
            diagonal: None,
            rhs: Some(DVector::from_vec(vec![3.0])),
        });

    let mut assembler = assemble(vec![Box::new(module)], AssemblyOptions::default());
    let mut pass = assembler.assemble().unwrap();
    let solution = pass
        .solve_with(&DenseLuSolver::new(SolverFormat::Coo))
        .unwrap();

    // [2I g; g^T 0] [u; l] = [0; 3]  =>  u = [1, 1, 1], l = -2.
    let u = solution.field("u").unwrap();
    for z in u.iter() {
        assert!((z.re - 1.0).abs() < 1e-12);
    }
    let (_, flux) = &solution.extras[0];
    assert!((flux[0].re + 2.0).abs() < 1e-12);
}

#[test]
fn interpolation_constraint_collapses_tied_dofs() {
    let a = DMatrix::from_row_slice(3, 3, &[2.0, 1.0, 0.0, 1.0, 2.0, 1.0, 0.0, 1.0, 2.0]);
    let p = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
    let module = TestModule::new("periodic")
        .field("u", 3)
        .operator(a.clone())
        .rhs(&[1.0, 2.0, 3.0])
        .interp(p.clone(), vec![0, 1], vec![]);

    let mut assembler = assemble(vec![Box::new(module)], AssemblyOptions::default());
    let mut pass = assembler.assemble().unwrap();
    let solution = pass
        .solve_with(&DenseLuSolver::new(SolverFormat::Coo))
        .unwrap();
    let u = solution.field("u").unwrap();

    // The tied dofs agree, and the reduced system P A P^T y = P b holds.
    assert!((u[1] - u[2]).norm() < 1e-12);
    let reduced = &p * &a * p.transpose();
    let reduced_rhs = &p * DVector::from_vec(vec![1.0, 2.0, 3.0]);
    let y = reduced.lu().solve(&reduced_rhs).unwrap();
    let expected = p.transpose() * y;
    for (z, e) in u.iter().zip(expected.iter()) {
        assert!((z.re - e).abs() < 1e-10);
    }
}

#[test]
fn duplicate_extra_key_is_a_fatal_configuration_error() {
    let key = ExtraKey {
        field: "u".to_string(),
        name: "lambda".to_string(),
    };
    let first = TestModule::new("first")
        .field("u", 2)
        .operator(DMatrix::identity(2, 2))
        .extra(TestExtra {
            key: key.clone(),
            to_field: None,
            from_field: None,
            diagonal: Some(DMatrix::identity(1, 1)),
            rhs: None,
        });
    let second = TestModule::new("second")
        .field("w", 2)
        .operator(DMatrix::identity(2, 2))
        .extra(TestExtra {
            key,
            to_field: None,
            from_field: None,
            diagonal: Some(DMatrix::identity(1, 1)),
            rhs: None,
        });

    let mut assembler = assemble(
        vec![Box::new(first), Box::new(second)],
        AssemblyOptions::default(),
    );
    let err = assembler.assemble().unwrap_err();
    assert!(format!("{:#}", err).contains("already exists"));
}

#[test]
fn rhs_only_reassembly_reproduces_the_solution() {
    let a_u = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 4.0, 1.0, 0.0, 1.0, 4.0]);
    let make_module = || {
        TestModule::new("steady")
            .field("u", 3)
            .operator(a_u.clone())
            .rhs(&[1.0, 2.0, 3.0])
            .essential(&[2], Complex64::new(-1.0, 0.0))
    };

    let mut assembler = assemble(vec![Box::new(make_module())], AssemblyOptions::default());
    let mut pass = assembler.assemble().unwrap();
    assert_eq!(pass.rhs_norms().len(), 1);
    let first = pass
        .solve_with(&DenseLuSolver::new(SolverFormat::Coo))
        .unwrap();

    assembler.assemble_rhs_only(&mut pass).unwrap();
    let second = pass
        .solve_with(&DenseLuSolver::new(SolverFormat::Coo))
        .unwrap();

    let (u1, u2) = (first.field("u").unwrap(), second.field("u").unwrap());
    for (a, b) in u1.iter().zip(u2.iter()) {
        assert!((a - b).norm() < 1e-12);
    }
}
