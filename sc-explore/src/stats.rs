//! Statistics functions

use std::cmp::Ordering;

/// Scale factor making the MAD a consistent estimator of the standard deviation
pub const MAD_CONSTANT: f64 = 1.4826;

/// Return the median. Sorts its argument in place.
pub fn median_mut(xs: &mut [f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    xs.sort_unstable_by(f64::total_cmp);
    let n = xs.len();
    Some(if n % 2 == 0 {
        (xs[n / 2] + xs[n / 2 - 1]) / 2.0
    } else {
        xs[n / 2]
    })
}

pub fn median(xs: &[f64]) -> Option<f64> {
    median_mut(&mut xs.to_vec())
}

/// Median and scaled median absolute deviation
pub fn median_mad(xs: &[f64]) -> Option<(f64, f64)> {
    let center = median(xs)?;
    let mut dev: Vec<f64> = xs.iter().map(|x| (x - center).abs()).collect();
    let mad = median_mut(&mut dev)?;
    Some((center, MAD_CONSTANT * mad))
}

/// Sample quantile with linear interpolation between order statistics
/// (R's default, type 7).
pub fn quantile(xs: &[f64], q: f64) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let mut v = xs.to_vec();
    v.sort_unstable_by(f64::total_cmp);
    let h = (v.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    Some(v[lo] + (h - lo as f64) * (v[hi] - v[lo]))
}

/// 1-based ranks, ties receiving the average of the ranks they span
pub fn average_ranks(xs: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..xs.len()).collect();
    order.sort_by(|&a, &b| xs[a].partial_cmp(&xs[b]).unwrap_or(Ordering::Equal));
    let mut ranks = vec![0.0; xs.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && xs[order[j + 1]] == xs[order[i]] {
            j += 1;
        }
        let r = (i + j) as f64 / 2.0 + 1.0;
        for &o in &order[i..=j] {
            ranks[o] = r;
        }
        i = j + 1;
    }
    ranks
}

/// Pearson correlation; 0 when either side has no variance.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let ma = a[..n].iter().sum::<f64>() / n as f64;
    let mb = b[..n].iter().sum::<f64>() / n as f64;
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - ma, y - mb);
        sab += dx * dy;
        saa += dx * dx;
        sbb += dy * dy;
    }
    if saa <= 0.0 || sbb <= 0.0 {
        return 0.0;
    }
    sab / (saa * sbb).sqrt()
}

pub fn spearman(a: &[f64], b: &[f64]) -> f64 {
    pearson(&average_ranks(a), &average_ranks(b))
}

/// Mean and sample variance
pub fn mean_var(xs: &[f64]) -> (f64, f64) {
    let n = xs.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = xs.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1) as f64;
    (mean, var)
}

#[cfg(test)]
mod test_stats {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_median_mut() {
        assert_eq!(median_mut(&mut []), None);
        assert_eq!(median_mut(&mut [1.0]), Some(1.0));
        assert_eq!(median_mut(&mut [10.0, 1.0]), Some(5.5));
        assert_eq!(median_mut(&mut [100.0, 1.0, 10.0]), Some(10.0));
        assert_eq!(median_mut(&mut [1.0, 10.0, 100.0, 1000.0]), Some(55.0));
    }

    #[test]
    fn test_mad() {
        // R: mad(c(1, 2, 3, 4, 100)) == 1.4826
        let (m, s) = median_mad(&[1.0, 2.0, 3.0, 4.0, 100.0]).unwrap();
        assert_eq!(m, 3.0);
        assert_approx_eq!(s, 1.4826);
    }

    #[test]
    fn test_quantile() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&x, 0.5), Some(3.0));
        assert_approx_eq!(quantile(&x, 0.8).unwrap(), 4.2);
        assert_eq!(quantile(&x, 1.0), Some(5.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn test_ranks() {
        assert_eq!(average_ranks(&[10.0, 30.0, 20.0, 20.0]), vec![1.0, 4.0, 2.5, 2.5]);
    }

    #[test]
    fn test_correlations() {
        let a = [1.0, 2.0, 3.0, 4.0];
        assert_approx_eq!(pearson(&a, &[2.0, 4.0, 6.0, 8.0]), 1.0);
        assert_approx_eq!(pearson(&a, &[4.0, 3.0, 2.0, 1.0]), -1.0);
        assert_eq!(pearson(&a, &[1.0, 1.0, 1.0, 1.0]), 0.0);
        // monotone but not linear
        assert_approx_eq!(spearman(&a, &[1.0, 10.0, 100.0, 1000.0]), 1.0);
    }
}
