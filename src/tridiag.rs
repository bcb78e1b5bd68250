use nalgebra::DVector;

use crate::error::{RichardsError, Result};

// Pivots smaller than this fraction of the diagonal entry are treated as zero
const PIVOT_TOLERANCE: f64 = 1.0e-14;

/// Tridiagonal system `a[i] u[i-1] + b[i] u[i] + c[i] u[i+1] = d[i]`.
///
/// `a[0]` and `c[m-1]` do not take part in the system and must be zero.
#[derive(Debug, Clone)]
pub struct Tridiagonal {
    pub a: DVector<f64>, // Sub-diagonal
    pub b: DVector<f64>, // Diagonal
    pub c: DVector<f64>, // Super-diagonal
    pub d: DVector<f64>, // Right-hand side
}

impl Tridiagonal {
    pub fn zeros(m: usize) -> Self {
        Tridiagonal {
            a: DVector::zeros(m),
            b: DVector::zeros(m),
            c: DVector::zeros(m),
            d: DVector::zeros(m),
        }
    }

    pub fn len(&self) -> usize {
        self.b.len()
    }

    pub fn is_empty(&self) -> bool {
        self.b.is_empty()
    }

    /// Thomas algorithm: one forward elimination sweep and one
    /// back-substitution sweep, O(m).
    pub fn solve(&self) -> Result<DVector<f64>> {
        let m = self.len();
        if self.a.len() != m || self.c.len() != m || self.d.len() != m {
            return Err(RichardsError::LayerMismatch {
                what: "tridiagonal bands",
                expected: m,
                actual: self.a.len().min(self.c.len()).min(self.d.len()),
            });
        }
        if m == 0 {
            return Ok(DVector::zeros(0));
        }
        if self.a[0] != 0.0 || self.c[m - 1] != 0.0 {
            return Err(RichardsError::config(
                "tridiagonal corner entries a[0] and c[m-1] must be zero",
            ));
        }

        let mut beta = DVector::zeros(m);
        let mut gamma = DVector::zeros(m);

        beta[0] = pivot(self.b[0], self.b[0], 0)?;
        gamma[0] = self.d[0] / beta[0];
        for i in 1..m {
            beta[i] = pivot(
                self.b[i] - self.a[i] * self.c[i - 1] / beta[i - 1],
                self.b[i],
                i,
            )?;
            gamma[i] = (self.d[i] - self.a[i] * gamma[i - 1]) / beta[i];
        }

        let mut u = DVector::zeros(m);
        u[m - 1] = gamma[m - 1];
        for i in (0..m - 1).rev() {
            u[i] = gamma[i] - self.c[i] * u[i + 1] / beta[i];
        }
        Ok(u)
    }
}

fn pivot(beta: f64, diagonal: f64, row: usize) -> Result<f64> {
    let scale = diagonal.abs().max(f64::MIN_POSITIVE);
    if !beta.is_finite() || beta.abs() <= PIVOT_TOLERANCE * scale {
        return Err(RichardsError::SingularSystem { row, pivot: beta });
    }
    Ok(beta)
}
