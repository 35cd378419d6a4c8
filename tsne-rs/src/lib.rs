#![deny(warnings)]

//! Exact t-SNE (van der Maaten & Hinton, 2008) with early exaggeration,
//! momentum and adaptive gains. All O(n^2) kernels run row-parallel and the
//! result depends only on the seed.

#[macro_use]
extern crate smart_default;

use anyhow::{bail, Error};
use log::{debug, info};
use ndarray::{Array2, Axis, Zip};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;

const PERPLEXITY_TOLERANCE: f64 = 1e-5;
const MAX_BISECTIONS: usize = 200;
const MIN_GAIN: f64 = 0.01;
const INIT_SD: f64 = 1e-4;

#[derive(SmartDefault, Clone, Debug)]
pub struct Tsne {
    #[default = 2]
    pub n_dims: usize,
    #[default = 30.]
    pub perplexity: f64,
    #[default = 1000]
    pub max_iter: usize,
    #[default = 250]
    pub stop_lying_iter: usize,
    #[default = 250]
    pub mom_switch_iter: usize,
    #[default = 12.]
    pub exaggeration: f64,
    #[default = 200.]
    pub learning_rate: f64,
    #[default = 0.5]
    pub initial_momentum: f64,
    #[default = 0.8]
    pub final_momentum: f64,
    #[default = 0]
    pub seed: u64,
    #[default(State::default())]
    state: State,
}

#[derive(Default, Clone, Debug)]
struct State {
    p: Array2<f64>,
    y: Array2<f64>,
    update: Array2<f64>,
    gains: Array2<f64>,
    iter: usize,
}

/// Squared Euclidean distances between all rows
fn squared_distances(x: &Array2<f64>) -> Array2<f64> {
    let n = x.nrows();
    let mut d = Array2::zeros((n, n));
    d.axis_iter_mut(Axis(0)).into_par_iter().enumerate().for_each(|(i, mut row)| {
        let xi = x.row(i);
        for j in 0..n {
            row[j] = xi.iter().zip(x.row(j)).map(|(a, b)| (a - b) * (a - b)).sum();
        }
    });
    d
}

/// Conditional probabilities p(j|i) for one row, with the Gaussian precision
/// chosen by bisection so the row's entropy matches `log(perplexity)`.
fn conditional_row(dist: &[f64], i: usize, perplexity: f64, out: &mut [f64]) {
    let target = perplexity.ln();
    let (mut beta, mut lo, mut hi) = (1.0, f64::NEG_INFINITY, f64::INFINITY);
    for _ in 0..MAX_BISECTIONS {
        let mut sum = 0.0;
        let mut weighted = 0.0;
        for (j, (&d, o)) in dist.iter().zip(out.iter_mut()).enumerate() {
            *o = if j == i { 0.0 } else { (-beta * d).exp() };
            sum += *o;
            weighted += d * *o;
        }
        let sum = sum.max(f64::MIN_POSITIVE);
        let entropy = sum.ln() + beta * weighted / sum;
        for o in out.iter_mut() {
            *o /= sum;
        }
        let diff = entropy - target;
        if diff.abs() < PERPLEXITY_TOLERANCE {
            break;
        }
        if diff > 0.0 {
            lo = beta;
            beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
        } else {
            hi = beta;
            beta = if lo.is_finite() { (beta + lo) / 2.0 } else { beta / 2.0 };
        }
    }
}

/// Symmetric joint probabilities P
fn joint_probabilities(x: &Array2<f64>, perplexity: f64) -> Array2<f64> {
    let n = x.nrows();
    let mut d = squared_distances(x);
    // scale distances so the bisection starts in a sensible range
    let max = d.iter().copied().fold(0.0, f64::max);
    if max > 0.0 {
        d /= max;
    }

    let mut cond = Array2::zeros((n, n));
    cond.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(d.axis_iter(Axis(0)))
        .enumerate()
        .for_each(|(i, (mut out, dist))| {
            let dist = dist.to_vec();
            let mut row = vec![0.0; n];
            conditional_row(&dist, i, perplexity, &mut row);
            out.assign(&ndarray::ArrayView1::from(&row[..]));
        });

    let total = 2.0 * n as f64;
    let mut p = &cond + &cond.t();
    p.mapv_inplace(|v| (v / total).max(f64::MIN_POSITIVE));
    p
}

impl Tsne {
    /// Prepare the affinities and the seeded initial layout for the rows of `x`.
    pub fn init(&mut self, x: &Array2<f64>) -> Result<(), Error> {
        let n = x.nrows();
        if n < 4 {
            bail!("t-SNE needs at least 4 points, got {}", n);
        }
        if self.n_dims == 0 {
            bail!("embedding needs at least one dimension");
        }
        let max_perplexity = (n - 1) as f64 / 3.0;
        let perplexity = if self.perplexity > max_perplexity {
            info!("perplexity {} too large for {} points, using {:.2}", self.perplexity, n, max_perplexity);
            max_perplexity
        } else {
            self.perplexity
        };

        let p = joint_probabilities(x, perplexity);
        let mut rng = Pcg64Mcg::seed_from_u64(self.seed);
        let normal = Normal::new(0.0, INIT_SD)?;
        let y = Array2::from_shape_simple_fn((n, self.n_dims), || normal.sample(&mut rng));

        info!("t-SNE on {} points, perplexity {:.2}, {} iterations", n, perplexity, self.max_iter);
        self.state = State {
            p,
            update: Array2::zeros(y.dim()),
            gains: Array2::ones(y.dim()),
            y,
            iter: 0,
        };
        Ok(())
    }

    /// Run up to `n` more iterations. Returns true while iterations remain.
    pub fn run_n(&mut self, n: usize) -> bool {
        for _ in 0..n {
            if self.state.iter >= self.max_iter {
                break;
            }
            self.step();
        }
        self.state.iter < self.max_iter
    }

    pub fn iteration(&self) -> usize {
        self.state.iter
    }

    /// Run all remaining iterations and return the embedding.
    pub fn fit(mut self, x: &Array2<f64>) -> Result<Array2<f64>, Error> {
        self.init(x)?;
        while self.run_n(50) {}
        Ok(self.result())
    }

    pub fn result(self) -> Array2<f64> {
        self.state.y
    }

    fn step(&mut self) {
        let s = &mut self.state;
        let exaggeration = if s.iter < self.stop_lying_iter { self.exaggeration } else { 1.0 };
        let momentum = if s.iter < self.mom_switch_iter {
            self.initial_momentum
        } else {
            self.final_momentum
        };

        let (grad, kl) = gradient(&s.p, &s.y, exaggeration);
        Zip::from(&mut s.gains)
            .and(&mut s.update)
            .and(&grad)
            .for_each(|gain, update, &g| {
                *gain = if (g > 0.0) != (*update > 0.0) {
                    *gain + 0.2
                } else {
                    (*gain * 0.8).max(MIN_GAIN)
                };
                *update = momentum * *update - self.learning_rate * *gain * g;
            });
        s.y += &s.update;
        if let Some(mean) = s.y.mean_axis(Axis(0)) {
            s.y -= &mean;
        }

        s.iter += 1;
        if s.iter % 50 == 0 || s.iter == self.max_iter {
            debug!("t-SNE iteration {}: KL divergence {:.4}", s.iter, kl);
        }
    }
}

/// Gradient of KL(P || Q) with respect to the layout, and the divergence itself
fn gradient(p: &Array2<f64>, y: &Array2<f64>, exaggeration: f64) -> (Array2<f64>, f64) {
    let n = y.nrows();
    let mut num = Array2::zeros((n, n));
    num.axis_iter_mut(Axis(0)).into_par_iter().enumerate().for_each(|(i, mut row)| {
        let yi = y.row(i);
        for j in 0..n {
            if i != j {
                let d: f64 = yi.iter().zip(y.row(j)).map(|(a, b)| (a - b) * (a - b)).sum();
                row[j] = 1.0 / (1.0 + d);
            }
        }
    });
    let z: f64 = num.axis_iter(Axis(0)).map(|r| r.sum()).sum::<f64>().max(f64::MIN_POSITIVE);

    let mut grad = Array2::zeros(y.dim());
    grad.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut g)| {
            let yi = y.row(i);
            for j in 0..n {
                if i == j {
                    continue;
                }
                let mult = (exaggeration * p[[i, j]] - num[[i, j]] / z) * num[[i, j]];
                for (gd, (a, b)) in g.iter_mut().zip(yi.iter().zip(y.row(j))) {
                    *gd += 4.0 * mult * (a - b);
                }
            }
        });

    let kl: f64 = (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .filter(|&j| j != i)
                .map(|j| {
                    let pij = p[[i, j]];
                    let qij = (num[[i, j]] / z).max(f64::MIN_POSITIVE);
                    pij * (pij / qij).ln()
                })
                .sum::<f64>()
        })
        .collect::<Vec<f64>>()
        .into_iter()
        .sum();
    (grad, kl)
}

#[cfg(test)]
mod test {
    use super::*;

    fn blobs(n: usize) -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let noise = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((3 * n, 4), |(i, _)| 15.0 * (i / n) as f64 + noise.sample(&mut rng))
    }

    #[test]
    fn test_rows_match_perplexity() {
        let x = blobs(10);
        let d = squared_distances(&x);
        let mut row = vec![0.0; 30];
        conditional_row(&d.row(0).to_vec(), 0, 5.0, &mut row);
        assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert_eq!(row[0], 0.0);
        let entropy: f64 = -row.iter().filter(|&&v| v > 0.0).map(|v| v * v.ln()).sum::<f64>();
        assert!((entropy - 5f64.ln()).abs() < 1e-3);
    }

    #[test]
    fn test_joint_is_symmetric_distribution() {
        let p = joint_probabilities(&blobs(8), 5.0);
        assert!((p.sum() - 1.0).abs() < 1e-6);
        for i in 0..p.nrows() {
            for j in 0..p.ncols() {
                assert!((p[[i, j]] - p[[j, i]]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn test_separates_blobs() -> Result<(), Error> {
        let n = 20;
        let tsne = Tsne {
            perplexity: 10.0,
            max_iter: 500,
            seed: 1,
            ..Tsne::default()
        };
        let y = tsne.fit(&blobs(n))?;
        assert_eq!(y.dim(), (3 * n, 2));
        // every point is closer to its own blob's centroid than to any other
        let centroids: Vec<Vec<f64>> = (0..3)
            .map(|b| {
                let rows = y.slice(ndarray::s![b * n..(b + 1) * n, ..]);
                rows.mean_axis(Axis(0)).unwrap().to_vec()
            })
            .collect();
        for i in 0..3 * n {
            let d: Vec<f64> = centroids
                .iter()
                .map(|c| (y[[i, 0]] - c[0]).powi(2) + (y[[i, 1]] - c[1]).powi(2))
                .collect();
            let own = i / n;
            assert!((0..3).all(|b| b == own || d[own] < d[b]), "point {i}");
        }
        Ok(())
    }

    #[test]
    fn test_seeded() -> Result<(), Error> {
        let x = blobs(5);
        let run = |seed| Tsne { max_iter: 100, seed, ..Tsne::default() }.fit(&x);
        assert_eq!(run(4)?, run(4)?);
        assert_ne!(run(4)?, run(5)?);
        Ok(())
    }

    #[test]
    fn test_too_few_points() {
        assert!(Tsne::default().fit(&Array2::zeros((3, 2))).is_err());
    }
}
