//! Highly variable gene selection.
//!
//! Two per-gene models of technical noise are offered. The variance model
//! fits a mean-variance trend of the log-expression and calls the excess the
//! biological component. The CV² model fits `a / mean + b` to the squared
//! coefficient of variation of the scaled counts and uses the ratio to the
//! trend. Either way a chi-squared test gives a p-value for the excess.

use crate::normalization::Normalized;
use crate::stats::{median_mut, quantile};
use anyhow::{bail, Error};
use diff_exp::dist::adjusted_pvalue_bh;
use log::{info, warn};
use sc_types::LogCounts;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::HashSet;

const ROBUSTNESS_ITERATIONS: usize = 3;

/// Noise model used to rank genes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvgMethod {
    /// biological component of the log-expression variance
    Variance,
    /// ratio of the CV² to its trend
    Cv2,
}

impl HvgMethod {
    pub fn name(&self) -> &'static str {
        match self {
            HvgMethod::Variance => "variance",
            HvgMethod::Cv2 => "cv2",
        }
    }
}

/// Per-gene fit of a noise model. For the variance model `total` is the
/// variance, `tech` the trend and `effect` their difference. For the CV²
/// model `total` is the CV², `tech` the trend and `effect` their ratio.
#[derive(Clone, Debug)]
pub struct VarianceModel {
    pub method: HvgMethod,
    pub mean: Vec<f64>,
    pub total: Vec<f64>,
    pub tech: Vec<f64>,
    pub effect: Vec<f64>,
    pub p_value: Vec<f64>,
    pub fdr: Vec<f64>,
}

impl VarianceModel {
    pub fn n_genes(&self) -> usize {
        self.mean.len()
    }

    /// An effect above this value means more variation than the trend predicts
    pub fn effect_threshold(&self) -> f64 {
        match self.method {
            HvgMethod::Variance => 0.0,
            HvgMethod::Cv2 => 1.0,
        }
    }
}

/// Mean and sample variance of each gene (row) of a log-expression matrix
pub fn log_expression_stats(logcounts: &LogCounts) -> (Vec<f64>, Vec<f64>) {
    let n = logcounts.cols() as f64;
    let mut sum = vec![0.0; logcounts.rows()];
    let mut sumsq = vec![0.0; logcounts.rows()];
    for col in logcounts.outer_iterator() {
        for (g, &v) in col.iter() {
            sum[g] += v;
            sumsq[g] += v * v;
        }
    }
    moments(&sum, &sumsq, n)
}

fn moments(sum: &[f64], sumsq: &[f64], n: f64) -> (Vec<f64>, Vec<f64>) {
    let means: Vec<f64> = sum.iter().map(|s| s / n).collect();
    let vars = sumsq
        .iter()
        .zip(&means)
        .map(|(ss, m)| if n > 1.0 { ((ss - n * m * m) / (n - 1.0)).max(0.0) } else { 0.0 })
        .collect();
    (means, vars)
}

/// Locally weighted linear regression with tricube weights over the nearest
/// `span` fraction of points, followed by bisquare robustness iterations.
/// Returns the fitted value at each `x`.
pub fn lowess(x: &[f64], y: &[f64], span: f64, robustness_iterations: usize) -> Vec<f64> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]).then_with(|| a.cmp(&b)));
    let xs: Vec<f64> = order.iter().map(|&i| x[i]).collect();
    let ys: Vec<f64> = order.iter().map(|&i| y[i]).collect();
    let k = ((span * n as f64).ceil() as usize).clamp(2.min(n), n);

    let mut robustness = vec![1.0; n];
    let mut fitted = local_fit(&xs, &ys, &robustness, k);
    let mean_abs = ys.iter().map(|v| v.abs()).sum::<f64>() / n as f64;
    for _ in 0..robustness_iterations {
        let resid: Vec<f64> = ys.iter().zip(&fitted).map(|(y, f)| (y - f).abs()).collect();
        let cmad = 6.0 * median_mut(&mut resid.clone()).unwrap_or(0.0);
        if cmad < 1e-7 * mean_abs {
            break;
        }
        for (w, &r) in robustness.iter_mut().zip(&resid) {
            *w = if r <= 0.001 * cmad {
                1.0
            } else if r > 0.999 * cmad {
                0.0
            } else {
                let u = r / cmad;
                (1.0 - u * u).powi(2)
            };
        }
        fitted = local_fit(&xs, &ys, &robustness, k);
    }

    let mut out = vec![0.0; n];
    for (pos, &i) in order.iter().enumerate() {
        out[i] = fitted[pos];
    }
    out
}

/// One weighted least squares line per point over its `k` nearest neighbors;
/// `xs` is sorted. A point whose whole window was rejected by the robustness
/// weights is fitted with the distance weights alone.
fn local_fit(xs: &[f64], ys: &[f64], robustness: &[f64], k: usize) -> Vec<f64> {
    let n = xs.len();
    let mut out = vec![0.0; n];
    let mut lo = 0;
    for i in 0..n {
        while lo + k < n && xs[i] - xs[lo] > xs[lo + k] - xs[i] {
            lo += 1;
        }
        let h = (xs[i] - xs[lo]).max(xs[lo + k - 1] - xs[i]);
        out[i] = weighted_line(xs, ys, lo..lo + k, i, h, Some(robustness))
            .or_else(|| weighted_line(xs, ys, lo..lo + k, i, h, None))
            .unwrap_or(ys[i]);
    }
    out
}

fn weighted_line(
    xs: &[f64],
    ys: &[f64],
    window: std::ops::Range<usize>,
    i: usize,
    h: f64,
    robustness: Option<&[f64]>,
) -> Option<f64> {
    let (mut sw, mut swx, mut swy, mut swxx, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for j in window {
        let d = (xs[j] - xs[i]).abs();
        let tricube = if h == 0.0 {
            1.0
        } else if d < h {
            (1.0 - (d / h).powi(3)).powi(3)
        } else {
            0.0
        };
        let w = tricube * robustness.map_or(1.0, |r| r[j]);
        sw += w;
        swx += w * xs[j];
        swy += w * ys[j];
        swxx += w * xs[j] * xs[j];
        swxy += w * xs[j] * ys[j];
    }
    if sw <= 0.0 {
        return None;
    }
    let (mx, my) = (swx / sw, swy / sw);
    let var = swxx / sw - mx * mx;
    if var <= 1e-12 * mx.abs().max(1.0).powi(2) {
        Some(my)
    } else {
        Some(my + (swxy / sw - mx * my) / var * (xs[i] - mx))
    }
}

/// Piecewise linear trend through fitted points: linear from the origin below
/// the smallest fitted mean and flat beyond the largest.
struct Trend {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl Trend {
    fn new(x: &[f64], fitted: &[f64]) -> Trend {
        let mut pts: Vec<(f64, f64)> = x.iter().copied().zip(fitted.iter().map(|f| f.max(0.0))).collect();
        pts.sort_by(|a, b| a.0.total_cmp(&b.0));
        pts.dedup_by(|b, a| a.0 == b.0);
        Trend {
            x: pts.iter().map(|p| p.0).collect(),
            y: pts.iter().map(|p| p.1).collect(),
        }
    }

    fn at(&self, m: f64) -> f64 {
        let n = self.x.len();
        if n == 0 || m <= 0.0 {
            return 0.0;
        }
        if m <= self.x[0] {
            return self.y[0] * m / self.x[0].max(f64::MIN_POSITIVE);
        }
        if m >= self.x[n - 1] {
            return self.y[n - 1];
        }
        let hi = self.x.partition_point(|&v| v < m);
        let lo = hi - 1;
        let t = (m - self.x[lo]) / (self.x[hi] - self.x[lo]);
        self.y[lo] + t * (self.y[hi] - self.y[lo])
    }
}

/// Upper tail probability of `total / tech * (n - 1)` under chi-squared with `n - 1` degrees of freedom
fn excess_pvalues(ratio: &[f64], n_cells: usize) -> Vec<f64> {
    let df = (n_cells - 1) as f64;
    match ChiSquared::new(df) {
        Ok(chi) => ratio
            .iter()
            .map(|&r| if r.is_finite() && r > 0.0 { chi.sf(r * df) } else { 1.0 })
            .collect(),
        Err(_) => vec![1.0; ratio.len()],
    }
}

/// Model the log-expression variance of each gene as a technical trend in the
/// mean plus a biological component. The trend is a robust LOWESS fit over the
/// genes with mean above `min_mean`.
pub fn model_gene_var(norm: &Normalized, span: f64, min_mean: f64) -> Result<VarianceModel, Error> {
    let n_cells = norm.n_cells();
    if n_cells < 2 {
        bail!("at least 2 cells are needed to model gene variance, got {}", n_cells);
    }
    let (mean, total) = log_expression_stats(&norm.logcounts);
    let mut fit_genes: Vec<usize> = (0..mean.len()).filter(|&g| mean[g] > min_mean).collect();
    if fit_genes.len() < 3 {
        warn!("only {} genes have mean above {}, fitting the trend to all expressed genes", fit_genes.len(), min_mean);
        fit_genes = (0..mean.len()).filter(|&g| mean[g] > 0.0).collect();
    }
    if fit_genes.len() < 2 {
        bail!("too few expressed genes to fit a mean-variance trend");
    }

    let fx: Vec<f64> = fit_genes.iter().map(|&g| mean[g]).collect();
    let fy: Vec<f64> = fit_genes.iter().map(|&g| total[g]).collect();
    let trend = Trend::new(&fx, &lowess(&fx, &fy, span, ROBUSTNESS_ITERATIONS));

    let tech: Vec<f64> = mean.iter().map(|&m| trend.at(m)).collect();
    let effect: Vec<f64> = total.iter().zip(&tech).map(|(t, s)| t - s).collect();
    let ratio: Vec<f64> = total
        .iter()
        .zip(&tech)
        .map(|(&t, &s)| if s > 0.0 { t / s } else { f64::NAN })
        .collect();
    let p_value = excess_pvalues(&ratio, n_cells);
    let fdr = adjusted_pvalue_bh(&p_value);
    info!(
        "fitted mean-variance trend on {} of {} genes, {} with positive biological variance",
        fit_genes.len(),
        mean.len(),
        effect.iter().filter(|&&e| e > 0.0).count()
    );
    Ok(VarianceModel {
        method: HvgMethod::Variance,
        mean,
        total,
        tech,
        effect,
        p_value,
        fdr,
    })
}

/// Model the squared coefficient of variation of the size-factor-scaled counts
/// as `a / mean + b`, fitted by least squares over genes whose mean is at
/// least the lowest decile of nonzero means.
pub fn model_gene_cv2(norm: &Normalized) -> Result<VarianceModel, Error> {
    let n_cells = norm.n_cells();
    if n_cells < 2 {
        bail!("at least 2 cells are needed to model gene CV2, got {}", n_cells);
    }
    let mut sum = vec![0.0; norm.n_genes()];
    let mut sumsq = vec![0.0; norm.n_genes()];
    for (cell, col) in norm.counts.matrix.outer_iterator().enumerate() {
        let sf = norm.size_factors[cell];
        for (g, &v) in col.iter() {
            let x = v as f64 / sf;
            sum[g] += x;
            sumsq[g] += x * x;
        }
    }
    let (mean, var) = moments(&sum, &sumsq, n_cells as f64);
    let cv2: Vec<f64> = mean
        .iter()
        .zip(&var)
        .map(|(&m, &v)| if m > 0.0 { v / (m * m) } else { 0.0 })
        .collect();

    let nonzero: Vec<f64> = mean.iter().copied().filter(|&m| m > 0.0).collect();
    let Some(floor) = quantile(&nonzero, 0.1) else {
        bail!("no expressed genes to fit a CV2 trend");
    };
    let fit_genes: Vec<usize> = (0..mean.len()).filter(|&g| mean[g] > 0.0 && mean[g] >= floor).collect();
    if fit_genes.len() < 2 {
        bail!("too few expressed genes to fit a CV2 trend");
    }

    // least squares for cv2 = a * (1 / mean) + b
    let m = fit_genes.len() as f64;
    let (mut su, mut sy, mut suu, mut suy) = (0.0, 0.0, 0.0, 0.0);
    for &g in &fit_genes {
        let u = 1.0 / mean[g];
        su += u;
        sy += cv2[g];
        suu += u * u;
        suy += u * cv2[g];
    }
    let denom = m * suu - su * su;
    let (a, b) = if denom.abs() > f64::EPSILON * m * suu {
        let a = (m * suy - su * sy) / denom;
        (a, (sy - a * su) / m)
    } else {
        (0.0, sy / m)
    };
    info!("fitted CV2 trend {:.4} / mean + {:.4} on {} genes", a, b, fit_genes.len());

    let tech: Vec<f64> = mean
        .iter()
        .map(|&mu| if mu > 0.0 { (a / mu + b).max(f64::MIN_POSITIVE) } else { f64::NAN })
        .collect();
    let effect: Vec<f64> = cv2
        .iter()
        .zip(&tech)
        .map(|(&c, &t)| if t.is_finite() { c / t } else { 0.0 })
        .collect();
    let p_value = excess_pvalues(&effect, n_cells);
    let fdr = adjusted_pvalue_bh(&p_value);
    Ok(VarianceModel {
        method: HvgMethod::Cv2,
        mean,
        total: cv2,
        tech,
        effect,
        p_value,
        fdr,
    })
}

/// Indices of at most `n` genes whose effect exceeds the model's threshold
/// (and, when given, whose FDR is at most `fdr_threshold`), largest effect
/// first with ties broken by gene index.
pub fn top_hvgs(model: &VarianceModel, n: usize, fdr_threshold: Option<f64>) -> Vec<usize> {
    let threshold = model.effect_threshold();
    let mut genes: Vec<usize> = (0..model.n_genes())
        .filter(|&g| model.effect[g].is_finite() && model.effect[g] > threshold)
        .filter(|&g| fdr_threshold.map_or(true, |t| model.fdr[g] <= t))
        .collect();
    genes.sort_by(|&a, &b| model.effect[b].total_cmp(&model.effect[a]).then_with(|| a.cmp(&b)));
    genes.truncate(n);
    info!("selected {} highly variable genes by {}", genes.len(), model.method.name());
    genes
}

/// Overlap between two gene selections
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct HvgAgreement {
    pub overlap: usize,
    pub jaccard: f64,
}

pub fn hvg_agreement(a: &[usize], b: &[usize]) -> HvgAgreement {
    let sa: HashSet<usize> = a.iter().copied().collect();
    let sb: HashSet<usize> = b.iter().copied().collect();
    let overlap = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    let jaccard = if union == 0 { 1.0 } else { overlap as f64 / union as f64 };
    info!("HVG selections share {} genes, Jaccard index {:.3}", overlap, jaccard);
    HvgAgreement { overlap, jaccard }
}
