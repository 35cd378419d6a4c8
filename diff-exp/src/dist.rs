use statrs::distribution::{Binomial, ContinuousCDF, DiscreteCDF, Normal, StudentsT};

/// Benjamini-Hochberg adjusted p-values, returned in input order. NaN inputs
/// stay NaN and do not count towards the number of tests.
pub fn adjusted_pvalue_bh(pvalues: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..pvalues.len()).filter(|&i| !pvalues[i].is_nan()).collect();
    // largest p first
    order.sort_by(|&a, &b| pvalues[b].total_cmp(&pvalues[a]));

    let mut out = vec![f64::NAN; pvalues.len()];
    let len = order.len() as f64;
    let mut min = f64::MAX;
    for (idx, &i) in order.iter().enumerate() {
        let q = pvalues[i] * len / (len - idx as f64);
        if q < min {
            min = q;
        }
        out[i] = min.min(1.0);
    }
    out
}

/// First two moments of one group of observations
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Moments {
    pub n: usize,
    pub mean: f64,
    /// sample variance (n - 1 denominator)
    pub var: f64,
}

impl Moments {
    pub fn from_values(values: &[f64]) -> Moments {
        let n = values.len();
        if n == 0 {
            return Moments {
                n,
                mean: 0.0,
                var: 0.0,
            };
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let var = if n > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            0.0
        };
        Moments { n, mean, var }
    }
}

/// One-sided Welch t-test that `host` has a larger mean than `target`.
/// Groups with fewer than two observations cannot be tested and give 1.
pub fn welch_t_upper(host: &Moments, target: &Moments) -> f64 {
    if host.n < 2 || target.n < 2 {
        return 1.0;
    }
    let diff = host.mean - target.mean;
    let a = host.var / host.n as f64;
    let b = target.var / target.n as f64;
    let se2 = a + b;
    if se2 <= 0.0 {
        return if diff > 0.0 { 0.0 } else { 1.0 };
    }
    let df = se2 * se2 / (a * a / (host.n - 1) as f64 + b * b / (target.n - 1) as f64);
    let t = diff / se2.sqrt();
    StudentsT::new(0.0, 1.0, df).map_or(1.0, |d| d.sf(t))
}

/// One-sided Wilcoxon rank-sum test that `host` tends to exceed `target`.
/// Both slices must be sorted ascending. Returns `(auc, pvalue)` where the AUC
/// is P(host > target) + 0.5 P(tie), and the p-value uses the normal
/// approximation with tie and continuity correction.
pub fn wilcox_upper(host: &[f64], target: &[f64]) -> (f64, f64) {
    let (n1, n2) = (host.len(), target.len());
    if n1 == 0 || n2 == 0 {
        return (f64::NAN, 1.0);
    }

    let (mut i, mut j) = (0, 0);
    let mut u = 0.0;
    let mut ties = 0.0;
    while i < n1 || j < n2 {
        let v = match (host.get(i), target.get(j)) {
            (Some(&x), Some(&y)) => x.min(y),
            (Some(&x), None) => x,
            (None, Some(&y)) => y,
            (None, None) => break,
        };
        let below = j;
        let start_i = i;
        while i < n1 && host[i] == v {
            i += 1;
        }
        while j < n2 && target[j] == v {
            j += 1;
        }
        let (ci, cj) = ((i - start_i) as f64, (j - below) as f64);
        u += ci * (below as f64 + 0.5 * cj);
        let t = ci + cj;
        ties += t * t * t - t;
    }

    let (f1, f2) = (n1 as f64, n2 as f64);
    let n = f1 + f2;
    let auc = u / (f1 * f2);
    let mean = f1 * f2 / 2.0;
    let var = f1 * f2 / 12.0 * ((n + 1.0) - ties / (n * (n - 1.0)));
    if var <= 0.0 {
        return (auc, 1.0);
    }
    let z = (u - mean - 0.5) / var.sqrt();
    let p = Normal::new(0.0, 1.0).map_or(1.0, |d| d.sf(z));
    (auc, p)
}

/// One-sided binomial test that expressing cells are over-represented in the
/// host group. Under the null an expressing cell falls in the host with
/// probability proportional to the group sizes.
pub fn binom_upper(host_detected: usize, host_n: usize, target_detected: usize, target_n: usize) -> f64 {
    let total = (host_detected + target_detected) as u64;
    if total == 0 || host_detected == 0 || host_n + target_n == 0 {
        return 1.0;
    }
    let p0 = host_n as f64 / (host_n + target_n) as f64;
    Binomial::new(p0, total).map_or(1.0, |d| d.sf(host_detected as u64 - 1))
}

/// Log2 ratio of detection proportions, with one pseudo-cell added to each group.
pub fn detection_log2_ratio(host_detected: usize, host_n: usize, target_detected: usize, target_n: usize) -> f64 {
    let ph = (host_detected as f64 + 1.0) / (host_n as f64 + 1.0);
    let pt = (target_detected as f64 + 1.0) / (target_n as f64 + 1.0);
    (ph / pt).log2()
}
