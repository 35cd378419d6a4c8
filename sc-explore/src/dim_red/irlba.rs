#![allow(non_snake_case)]

use super::{full_svd, to_dmatrix, PcaResult};
use anyhow::{bail, Error};
use log::debug;
use nalgebra::DMatrix;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use std::cmp::{max, min};

fn norm(x: &ArrayView1<f64>) -> f64 {
    x.fold(0.0, |sum, v| sum + v * v).sqrt()
}

/// Orthogonalize a vector Y against the columns of the matrix X.
/// This function requires that Y and X have the same number of rows.
fn orthog(y: &ArrayView1<f64>, x: &ArrayView2<f64>) -> Array1<f64> {
    let dot_y = x.t().dot(y);
    y - &x.dot(&dot_y)
}

/// utility function used to check linear dependencies during computation:
fn invcheck(x: f64) -> f64 {
    let eps2 = 2.0 * f64::EPSILON;

    if x > eps2 {
        1.0 / x
    } else {
        0.0
    }
}

/// Struct for storing IRLBA parameters
#[derive(Clone, Debug)]
pub struct Irlba {
    /// IRLBA convergence tolerance
    pub tol: f64,
    /// Maximum number of iterations
    pub max_iter: usize,
    /// Seed of the random starting vector
    pub seed: u64,
}

impl Irlba {
    /// New IRLBA with default settings
    pub fn new(seed: u64) -> Irlba {
        Irlba {
            tol: 1e-5,
            max_iter: 100,
            seed,
        }
    }

    pub fn run(&self, A: &Array2<f64>, k: usize) -> Result<PcaResult, Error> {
        irlba(A, k, self.tol, self.max_iter, self.seed)
    }
}

fn to_ndarray(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Implementation of the IRLBA algorithm. Computes the `nu` largest singular
/// triplets of `A` by implicitly restarted Lanczos bidiagonalization, to
/// tolerance `tol` in at most `maxit` restarts. The result is `(U, d, V)`.
pub fn irlba(A: &Array2<f64>, nu: usize, tol: f64, maxit: usize, seed: u64) -> Result<PcaResult, Error> {
    let m = A.nrows();
    let n = A.ncols();

    if m < 2 || n < 2 {
        bail!("The input matrix must be at least 2x2, got {}x{}", m, n);
    }
    if nu == 0 || nu > min(m, n) {
        bail!("cannot compute {} singular vectors of a {}x{} matrix", nu, m, n);
    }

    let m_b = min(nu + 20, min(m, n));
    if m_b < nu + 3 {
        // basis too small to restart; the matrix is small enough to decompose directly
        return full_svd(A, nu);
    }
    let mut mprod = 0;
    let mut it = 0;
    let mut j = 0;
    let mut k = nu;
    let mut smax = f64::MIN;

    let mut V: Array2<f64> = Array2::zeros((n, m_b));
    let mut W: Array2<f64> = Array2::zeros((m, m_b));
    let mut F: Array1<f64> = Array1::zeros(n);
    let mut B: Array2<f64> = Array2::zeros((m_b, m_b));
    let mut u: Array2<f64> = Array2::zeros((m_b, m_b));
    let mut sigma: Array1<f64> = Array1::zeros(m_b);
    let mut vt: Array2<f64> = Array2::zeros((m_b, m_b));

    // random initial vector
    {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let rnorm = Normal::new(0.0f64, 1.0f64)?;
        let mut rand = Array1::from_shape_simple_fn(n, || rnorm.sample(&mut rng));
        rand *= 1.0f64 / norm(&rand.view());
        V.column_mut(0).assign(&rand);
    }

    while it < maxit {
        if it > 0 {
            j = k;
        }

        let w = A.dot(&V.column(j));
        mprod += 1;
        if it > 0 {
            let nc = orthog(&w.view(), &W.slice(s![.., 0..j]));
            W.column_mut(j).assign(&nc);
        } else {
            W.column_mut(j).assign(&w);
        }

        let mut s = norm(&W.column(j));
        let mut sinv = invcheck(s);
        W.column_mut(j).mapv_inplace(|x| x * sinv);

        let mut fnorm = 0.0;

        // Lanczos process
        while j < m_b {
            F = W.column(j).dot(A);
            mprod += 1;

            F -= &(&V.column(j) * s);
            F = orthog(&F.view(), &V.slice(s![.., 0..j + 1]));
            fnorm = norm(&F.view());
            let finv = invcheck(fnorm);
            F *= finv;

            if j == m_b - 1 {
                B[(j, j)] = s
            } else {
                V.column_mut(j + 1).assign(&F);
                B[(j, j)] = s;
                B[(j, j + 1)] = fnorm;

                let mut new_w_col = A.dot(&V.column(j + 1));
                mprod += 1;
                new_w_col -= &(&W.column(j) * fnorm);
                new_w_col = orthog(&new_w_col.view(), &W.slice(s![.., 0..j + 1]));
                s = norm(&new_w_col.view());
                sinv = invcheck(s);

                W.column_mut(j + 1).assign(&(&new_w_col * sinv));
            }

            j += 1;
        }

        (u, sigma, vt) = sorted_svd(&B)?;

        let resid = fnorm * &u.slice(s![m_b - 1, ..]);
        smax = if sigma[0] > smax { sigma[0] } else { smax };

        let num_converged = (0..nu).filter(|&i| resid[i].abs() < tol * smax).count();

        if num_converged < nu {
            k = max(num_converged + nu, k);
            k = min(k, m_b - 3);
        } else {
            break;
        }

        // Update Ritz vectors
        let v_update = V.slice(s![.., 0..m_b]).dot(&vt.t().slice(s![.., 0..k]));
        V.slice_mut(s![.., 0..k]).assign(&v_update);
        V.column_mut(k).assign(&F);

        B = Array2::zeros((m_b, m_b));
        for l in 0..k {
            B[(l, l)] = sigma[l];
        }

        B.slice_mut(s![0..k, k]).assign(&resid.slice(s![0..k]));

        // right update
        let upd = W.slice(s![.., 0..m_b]).dot(&u.slice(s![.., 0..k]));
        W.slice_mut(s![.., 0..k]).assign(&upd);

        it += 1;
    }

    let U = W.slice(s![.., 0..m_b]).dot(&u.slice(s![.., 0..nu]));
    let V = V.slice(s![.., 0..m_b]).dot(&vt.t().slice(s![.., 0..nu]));

    debug!("IRLBA: {} restarts, {} matrix products", it, mprod);
    let sigma_out = sigma.slice(s![0..nu]).to_owned();
    Ok((U, sigma_out, V))
}

/// SVD of a small dense matrix with singular values in decreasing order.
/// Returns `(U, d, V^T)`.
pub(crate) fn sorted_svd(B: &Array2<f64>) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), Error> {
    let svd = to_dmatrix(B).svd(true, true);
    let (Some(svd_u), Some(svd_vt)) = (svd.u, svd.v_t) else {
        bail!("SVD failed");
    };
    let d = svd.singular_values;
    let mut order: Vec<usize> = (0..d.len()).collect();
    order.sort_by(|&a, &b| d[b].total_cmp(&d[a]));

    let u_full = to_ndarray(&svd_u);
    let vt_full = to_ndarray(&svd_vt);
    let mut u = Array2::zeros(u_full.dim());
    let mut vt = Array2::zeros(vt_full.dim());
    let mut sigma = Array1::zeros(d.len());
    for (new, &old) in order.iter().enumerate() {
        u.column_mut(new).assign(&u_full.column(old));
        vt.row_mut(new).assign(&vt_full.row(old));
        sigma[new] = d[old];
    }
    Ok((u, sigma, vt))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dim_red::test::{low_rank_matrix, reconstruction_error};

    #[test]
    fn test_irlba_matches_full_svd() -> Result<(), Error> {
        let a = low_rank_matrix(200, 60, 0);
        let (u, d, v) = irlba(&a, 5, 1e-8, 200, 7)?;
        let (_, d_full, _) = full_svd(&a, 5)?;
        for i in 0..5 {
            assert!((d[i] - d_full[i]).abs() < 1e-6 * d_full[0], "{} vs {}", d[i], d_full[i]);
        }
        assert!(reconstruction_error(&a, &u, &d, &v) < reconstruction_error(&a, &u.slice(s![.., 0..4]).to_owned(), &d.slice(s![0..4]).to_owned(), &v.slice(s![.., 0..4]).to_owned()));
        Ok(())
    }

    #[test]
    fn test_orthonormal_vectors() -> Result<(), Error> {
        let a = low_rank_matrix(150, 40, 1);
        let (u, _, v) = irlba(&a, 4, 1e-8, 200, 3)?;
        let utu = u.t().dot(&u);
        let vtv = v.t().dot(&v);
        for i in 0..4 {
            for j in 0..4 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((utu[(i, j)] - expect).abs() < 1e-6);
                assert!((vtv[(i, j)] - expect).abs() < 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn test_bad_rank() {
        let a = low_rank_matrix(10, 5, 0);
        assert!(irlba(&a, 0, 1e-5, 10, 0).is_err());
        assert!(irlba(&a, 6, 1e-5, 10, 0).is_err());
    }
}
