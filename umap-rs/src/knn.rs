use crate::Q;
use anyhow::{bail, Error};
use ndarray::{Array2, ArrayView1, Axis};
use rayon::prelude::*;

#[inline]
fn euclidean_sq(x: ArrayView1<Q>, y: ArrayView1<Q>) -> Q {
    x.iter().zip(y).map(|(&a, &b)| a - b).fold(0.0, |acc, d| acc + d * d)
}

/// Exhaustive Euclidean k-nearest neighbors of every row of `data`, excluding
/// the row itself. Neighbors are sorted by distance, ties by index.
pub fn nearest_neighbors(data: &Array2<Q>, k: usize) -> Result<(Array2<usize>, Array2<Q>), Error> {
    let n = data.nrows();
    if k == 0 || k >= n {
        bail!("{} neighbors requested for {} points", k, n);
    }

    let mut indices = Array2::zeros((n, k));
    let mut distances = Array2::zeros((n, k));
    indices
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(distances.axis_iter_mut(Axis(0)))
        .enumerate()
        .for_each_init(
            || Vec::with_capacity(n),
            |candidates, (i, (mut idx, mut dist))| {
                candidates.clear();
                let query = data.row(i);
                candidates.extend(
                    (0..n)
                        .filter(|&j| j != i)
                        .map(|j| (euclidean_sq(query, data.row(j)), j)),
                );
                candidates.select_nth_unstable_by(k - 1, |a: &(Q, usize), b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                candidates[..k].sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                for (j, &(d, c)) in candidates[..k].iter().enumerate() {
                    idx[j] = c;
                    dist[j] = d.sqrt();
                }
            },
        );
    Ok((indices, distances))
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_line() -> Result<(), Error> {
        let data = array![[0.0], [1.0], [3.0], [7.0]];
        let (idx, dist) = nearest_neighbors(&data, 2)?;
        assert_eq!(idx.row(0).to_vec(), vec![1, 2]);
        assert_eq!(idx.row(2).to_vec(), vec![1, 0]);
        assert_eq!(dist.row(3).to_vec(), vec![4.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_too_many_neighbors() {
        let data = array![[0.0], [1.0]];
        assert!(nearest_neighbors(&data, 2).is_err());
    }
}
