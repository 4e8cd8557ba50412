use log::debug;
use nalgebra::DMatrix;
use nalgebra_sparse::factorization::{CscCholesky, CscSymbolicCholesky};
use nalgebra_sparse::CscMatrix;
use sprs::{CsMat, FillInReduction, SymmetryCheck};
use sprs_ldl::{Ldl, LdlNumeric};

use crate::error::{Result, SimulationError};
use crate::jacobian::SparseJacobian;

enum Factor {
    Cholesky(CscCholesky<f64>),
    Ldl(LdlNumeric<f64, usize>),
}

/// Factorization of an assembled Jacobian, valid for one sub-step.
///
/// The assembled matrix `S·K + I` is solved through the symmetric system
/// `(K + S⁻¹)·x = S⁻¹·g`. A sparse Cholesky factorization is tried first;
/// when the system is not positive definite a sparse LDLᵀ takes over.
pub struct Factorization {
    scale: Vec<f64>,
    factor: Factor,
}

impl Factorization {
    pub fn new(jacobian: &SparseJacobian) -> Result<Self> {
        let scale = (0..jacobian.dim()).map(|i| jacobian.row_scale(i)).collect();
        Self::from_symmetric(jacobian.symmetrized()?, scale)
    }

    fn from_symmetric(matrix: CscMatrix<f64>, scale: Vec<f64>) -> Result<Self> {
        let symbolic = CscSymbolicCholesky::factor(matrix.pattern().clone());
        let factor = match CscCholesky::factor_numerical(symbolic, matrix.values()) {
            Ok(cholesky) => Factor::Cholesky(cholesky),
            Err(err) => {
                debug!("Sparse Cholesky failed ({err:?}), using sparse LDL");
                Factor::Ldl(factor_indefinite(matrix)?)
            }
        };
        Ok(Self { scale, factor })
    }

    /// Solves `M·x = rhs` into `out`.
    pub fn solve(&self, rhs: &[f64], out: &mut [f64]) -> Result<()> {
        let n = self.scale.len();
        let scaled: Vec<f64> = rhs.iter().zip(&self.scale).map(|(g, s)| g / s).collect();
        match &self.factor {
            Factor::Cholesky(cholesky) => {
                let b = DMatrix::from_column_slice(n, 1, &scaled);
                let x = cholesky.solve(&b);
                out.copy_from_slice(x.as_slice());
            }
            Factor::Ldl(ldl) => {
                let x = ldl.solve(&scaled[..]);
                out.copy_from_slice(&x);
            }
        }
        if out.iter().any(|value| !value.is_finite()) {
            return Err(SimulationError::SingularSystem);
        }
        Ok(())
    }

    pub fn is_cholesky(&self) -> bool {
        matches!(self.factor, Factor::Cholesky(_))
    }
}

/// LDLᵀ of a symmetric, possibly indefinite matrix with a fill-reducing
/// ordering. A zero or non-finite pivot means the system is singular.
fn factor_indefinite(matrix: CscMatrix<f64>) -> Result<LdlNumeric<f64, usize>> {
    let n = matrix.nrows();
    let (offsets, rows, values) = matrix.disassemble();
    let matrix = CsMat::try_new_csc((n, n), offsets, rows, values)
        .map_err(|(_, _, _, err)| SimulationError::SparseStructure(format!("{err:?}")))?;
    let ldl = Ldl::new()
        .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
        .check_symmetry(SymmetryCheck::DontCheckSymmetry)
        .numeric(matrix.view())
        .map_err(|err| {
            debug!("Sparse LDL failed: {err:?}");
            SimulationError::SingularSystem
        })?;
    if ldl.d().iter().any(|pivot| *pivot == 0.0 || !pivot.is_finite()) {
        return Err(SimulationError::SingularSystem);
    }
    Ok(ldl)
}
