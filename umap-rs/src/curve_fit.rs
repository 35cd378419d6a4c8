//! Levenberg-Marquardt fit of the low-dimensional membership curve
//! `1 / (1 + a * x^(2b))` to the target given by `spread` and `min_dist`.

use crate::Q;
use log::debug;
use ndarray::Array1;

const MAX_ITERATIONS: usize = 200;
const LAMBDA_UP: Q = 11.0;
const LAMBDA_DOWN: Q = 9.0;
const EPSILON: Q = 1e-10;

fn curve(a: Q, b: Q, x: Q) -> Q {
    1.0 / (1.0 + a * x.powf(2.0 * b))
}

/// Residuals and the 2-column Jacobian of the curve at `(a, b)`
fn residuals_and_jacobian(a: Q, b: Q, x: &Array1<Q>, y: &Array1<Q>) -> (Array1<Q>, Vec<[Q; 2]>) {
    let mut r = Array1::zeros(x.len());
    let mut jac = Vec::with_capacity(x.len());
    for (i, (&xi, &yi)) in x.iter().zip(y).enumerate() {
        let f = curve(a, b, xi);
        r[i] = yi - f;
        if xi > 0.0 {
            let x2b = xi.powf(2.0 * b);
            let f2 = f * f;
            jac.push([-x2b * f2, -a * x2b * 2.0 * xi.ln() * f2]);
        } else {
            jac.push([0.0, 0.0]);
        }
    }
    (r, jac)
}

fn chi2(r: &Array1<Q>) -> Q {
    r.iter().map(|v| v * v).sum()
}

/// Fit `(a, b)` for the given `spread` and `min_dist`.
pub fn find_ab_params(spread: Q, min_dist: Q) -> (Q, Q) {
    let x = Array1::range(0.0, 3.0 * spread, spread / 100.0);
    let y = x.mapv(|v| if v < min_dist { 1.0 } else { (-(v - min_dist) / spread).exp() });

    let (mut a, mut b) = (1.0, 1.0);
    let mut lambda = 1e-3;
    let (mut r, mut jac) = residuals_and_jacobian(a, b, &x, &y);
    let mut current = chi2(&r);

    for iteration in 0..MAX_ITERATIONS {
        // normal equations J^T J delta = J^T r, damped on the diagonal
        let (mut jtj, mut jtr) = ([[0.0; 2]; 2], [0.0; 2]);
        for (row, &ri) in jac.iter().zip(&r) {
            for p in 0..2 {
                jtr[p] += row[p] * ri;
                for q in 0..2 {
                    jtj[p][q] += row[p] * row[q];
                }
            }
        }
        let m00 = jtj[0][0] * (1.0 + lambda);
        let m11 = jtj[1][1] * (1.0 + lambda);
        let det = m00 * m11 - jtj[0][1] * jtj[1][0];
        if det.abs() < Q::MIN_POSITIVE {
            break;
        }
        let da = (m11 * jtr[0] - jtj[0][1] * jtr[1]) / det;
        let db = (m00 * jtr[1] - jtj[1][0] * jtr[0]) / det;

        let (na, nb) = (a + da, b + db);
        let (nr, njac) = residuals_and_jacobian(na, nb, &x, &y);
        let next = chi2(&nr);
        if next.is_finite() && next < current {
            let converged = (current - next) < EPSILON * current.max(EPSILON)
                || (da.abs() < EPSILON * a.abs() && db.abs() < EPSILON * b.abs());
            a = na;
            b = nb;
            r = nr;
            jac = njac;
            current = next;
            lambda = (lambda / LAMBDA_DOWN).max(1e-12);
            if converged {
                debug!("curve fit converged after {} iterations", iteration + 1);
                break;
            }
        } else {
            lambda *= LAMBDA_UP;
            if lambda > 1e12 {
                break;
            }
        }
    }
    (a, b)
}
