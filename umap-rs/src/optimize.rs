//! Negative-sampling SGD over the edges of the fuzzy graph.
//!
//! Updates are applied immediately and influence later edges in the same
//! epoch, so the optimization is sequential and fully determined by the seed.

use crate::Q;
use ndarray::Array2;
use rand::Rng;
use rand_pcg::Pcg64Mcg;
use sprs::CsMat;

const CLIP: Q = 4.0;

pub struct State {
    pub a: Q,
    pub b: Q,
    pub gamma: Q,
    pub initial_alpha: Q,
    pub negative_sample_rate: usize,
    pub n_epochs: usize,
    pub current_epoch: usize,

    head: Vec<usize>,
    tail: Vec<usize>,
    epochs_per_sample: Vec<Q>,
    epochs_per_negative_sample: Vec<Q>,
    epoch_of_next_sample: Vec<Q>,
    epoch_of_next_negative_sample: Vec<Q>,

    alpha: Q,
    embedding: Array2<Q>,
    random: Pcg64Mcg,
}

/// Edges of `graph` as (head, tail, weight), dropping those too weak to be
/// sampled even once in `n_epochs`.
pub fn graph_edges(graph: &CsMat<Q>, n_epochs: usize) -> (Vec<usize>, Vec<usize>, Vec<Q>) {
    let max = graph.data().iter().copied().fold(0.0, Q::max);
    let cutoff = max / n_epochs as Q;
    let mut head = Vec::with_capacity(graph.nnz());
    let mut tail = Vec::with_capacity(graph.nnz());
    let mut weights = Vec::with_capacity(graph.nnz());
    for (&w, (row, col)) in graph.iter() {
        if w > 0.0 && w >= cutoff {
            head.push(row);
            tail.push(col);
            weights.push(w);
        }
    }
    (head, tail, weights)
}

/// Number of epochs between samples of each edge; the strongest edge is sampled every epoch
pub fn make_epochs_per_sample(weights: &[Q], n_epochs: usize) -> Vec<Q> {
    let max = weights.iter().copied().fold(0.0, Q::max);
    weights
        .iter()
        .map(|&w| {
            let n = w / max * n_epochs as Q;
            if n > 0.0 {
                n_epochs as Q / n
            } else {
                -1.0
            }
        })
        .collect()
}

#[inline]
fn euclidean_sq(embedding: &Array2<Q>, j: usize, k: usize) -> Q {
    embedding
        .row(j)
        .iter()
        .zip(embedding.row(k))
        .fold(0.0, |acc, (&x, &y)| acc + (x - y) * (x - y))
}

impl State {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        embedding: Array2<Q>,
        graph: &CsMat<Q>,
        n_epochs: usize,
        (a, b): (Q, Q),
        learning_rate: Q,
        repulsion_strength: Q,
        negative_sample_rate: usize,
        random: Pcg64Mcg,
    ) -> State {
        let (head, tail, weights) = graph_edges(graph, n_epochs);
        let epochs_per_sample = make_epochs_per_sample(&weights, n_epochs);
        let epochs_per_negative_sample: Vec<Q> = epochs_per_sample
            .iter()
            .map(|&e| e / negative_sample_rate.max(1) as Q)
            .collect();
        State {
            a,
            b,
            gamma: repulsion_strength,
            initial_alpha: learning_rate,
            negative_sample_rate,
            n_epochs,
            current_epoch: 0,
            head,
            tail,
            epoch_of_next_sample: epochs_per_sample.clone(),
            epochs_per_sample,
            epoch_of_next_negative_sample: epochs_per_negative_sample.clone(),
            epochs_per_negative_sample,
            alpha: learning_rate,
            embedding,
            random,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.head.len()
    }

    pub fn optimize(&mut self) {
        while self.step() {}
    }

    /// Run one epoch. Returns false once all epochs are done.
    pub fn step(&mut self) -> bool {
        if self.current_epoch >= self.n_epochs {
            return false;
        }
        for i in 0..self.head.len() {
            self.iterate(i);
        }
        self.current_epoch += 1;
        self.alpha = self.initial_alpha * (1.0 - self.current_epoch as Q / self.n_epochs as Q);
        true
    }

    pub fn embedding(&self) -> &Array2<Q> {
        &self.embedding
    }

    pub fn into_embedding(self) -> Array2<Q> {
        self.embedding
    }

    #[inline]
    fn iterate(&mut self, i: usize) {
        let epoch = self.current_epoch as Q;
        if self.epochs_per_sample[i] <= 0.0 || self.epoch_of_next_sample[i] > epoch {
            return;
        }

        let (a, b, gamma, alpha) = (self.a, self.b, self.gamma, self.alpha);
        let dim = self.embedding.ncols();
        let n_points = self.embedding.nrows();
        let j = self.head[i];
        let k = self.tail[i];

        let dist_sq = euclidean_sq(&self.embedding, j, k);
        let grad_coeff = if dist_sq > 0.0 {
            (-2.0 * a * b * dist_sq.powf(b - 1.0)) / (1.0 + a * dist_sq.powf(b))
        } else {
            0.0
        };
        for d in 0..dim {
            let grad_d = (grad_coeff * (self.embedding[[j, d]] - self.embedding[[k, d]])).clamp(-CLIP, CLIP);
            self.embedding[[j, d]] += grad_d * alpha;
            self.embedding[[k, d]] -= grad_d * alpha;
        }
        self.epoch_of_next_sample[i] += self.epochs_per_sample[i];

        let n_neg_samples = ((epoch - self.epoch_of_next_negative_sample[i]) / self.epochs_per_negative_sample[i]).floor();
        for _ in 0..n_neg_samples.max(0.0) as usize {
            let k = self.random.gen_range(0..n_points);
            if j == k {
                continue;
            }
            let dist_sq = euclidean_sq(&self.embedding, j, k);
            let grad_coeff = if dist_sq > 0.0 {
                (2.0 * gamma * b) / ((1e-3 + dist_sq) * (1.0 + a * dist_sq.powf(b)))
            } else {
                0.0
            };
            for d in 0..dim {
                let grad_d = if grad_coeff > 0.0 {
                    (grad_coeff * (self.embedding[[j, d]] - self.embedding[[k, d]])).clamp(-CLIP, CLIP)
                } else {
                    CLIP
                };
                self.embedding[[j, d]] += grad_d * alpha;
            }
        }
        self.epoch_of_next_negative_sample[i] += n_neg_samples * self.epochs_per_negative_sample[i];
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_epochs_per_sample() {
        let e = make_epochs_per_sample(&[1.0, 0.5, 0.1], 100);
        assert_eq!(e[0], 1.0);
        assert_eq!(e[1], 2.0);
        assert!((e[2] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_weak_edges_dropped() {
        let mut tri = sprs::TriMat::new((3, 3));
        tri.add_triplet(0, 1, 1.0);
        tri.add_triplet(1, 0, 1.0);
        tri.add_triplet(1, 2, 0.001);
        let (head, tail, w) = graph_edges(&tri.to_csr(), 200);
        assert_eq!(head, vec![0, 1]);
        assert_eq!(tail, vec![1, 0]);
        assert_eq!(w.len(), 2);
    }
}
