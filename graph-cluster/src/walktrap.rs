//! Walktrap community detection (Pons & Latapy, 2005).
//!
//! Communities are merged bottom-up, always taking the adjacent pair whose
//! merge least increases the mean squared random-walk distance of nodes to
//! their community. The dendrogram is cut where modularity peaks.

use crate::{Clustering, Network, SimpleClustering};
use log::debug;
use rayon::prelude::*;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};

/// Default random walk length
pub const DEFAULT_STEPS: usize = 4;

type SparseVec = Vec<(usize, f64)>;

/// Walktrap clustering with a fixed random walk length
#[derive(Clone, Debug)]
pub struct Walktrap {
    steps: usize,
}

/// Full output of a Walktrap run
#[derive(Clone, Debug)]
pub struct WalktrapResult {
    /// Pairs of community ids merged at each step. Nodes are ids `0..n`, the
    /// community formed by merge `k` has id `n + k`.
    pub merges: Vec<(usize, usize)>,
    /// Modularity after each merge; entry 0 is the all-singletons partition
    pub modularity: Vec<f64>,
    /// Partition at the cut with the highest modularity
    pub clustering: SimpleClustering,
}

impl WalktrapResult {
    /// Modularity of the chosen partition
    pub fn best_modularity(&self) -> f64 {
        self.modularity.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

impl Default for Walktrap {
    fn default() -> Self {
        Walktrap { steps: DEFAULT_STEPS }
    }
}

#[derive(Clone, Copy, Debug)]
struct Link {
    delta_sigma: f64,
    weight: f64,
}

#[derive(Debug, PartialEq)]
struct Candidate {
    delta_sigma: f64,
    a: usize,
    b: usize,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.delta_sigma
            .total_cmp(&other.delta_sigma)
            .then_with(|| self.a.cmp(&other.a))
            .then_with(|| self.b.cmp(&other.b))
    }
}

/// Random-walk view of the network: every node gets a self-loop so walks can rest.
struct WalkGraph {
    adjacency: Vec<Vec<(usize, f64)>>,
    degree: Vec<f64>,
}

impl WalkGraph {
    fn new(n: &Network) -> WalkGraph {
        let mut adjacency = Vec::with_capacity(n.nodes());
        for i in 0..n.nodes() {
            let mut adj: Vec<(usize, f64)> = n.neighbors(i).collect();
            let loop_weight = if adj.is_empty() {
                1.0
            } else {
                adj.iter().map(|&(_, w)| w).sum::<f64>() / adj.len() as f64
            };
            adj.push((i, loop_weight + n.self_loop(i)));
            adjacency.push(adj);
        }
        let degree = adjacency.iter().map(|a| a.iter().map(|&(_, w)| w).sum()).collect();
        WalkGraph { adjacency, degree }
    }

    /// Distribution after `steps` transitions starting from node `start`
    fn walk_from(&self, start: usize, steps: usize, scratch: &mut Vec<f64>) -> SparseVec {
        let mut current: SparseVec = vec![(start, 1.0)];
        let mut touched = Vec::new();
        for _ in 0..steps {
            for &(j, p) in &current {
                let dj = self.degree[j];
                for &(k, w) in &self.adjacency[j] {
                    if scratch[k] == 0.0 {
                        touched.push(k);
                    }
                    scratch[k] += p * w / dj;
                }
            }
            touched.sort_unstable();
            current = touched.iter().map(|&k| (k, scratch[k])).collect();
            for &k in &touched {
                scratch[k] = 0.0;
            }
            touched.clear();
        }
        current
    }

    /// Squared distance between two walk distributions, each coordinate scaled by 1/degree
    fn distance2(&self, a: &SparseVec, b: &SparseVec) -> f64 {
        let (mut i, mut j) = (0, 0);
        let mut d = 0.0;
        while i < a.len() || j < b.len() {
            let (k, diff) = match (a.get(i), b.get(j)) {
                (Some(&(ka, va)), Some(&(kb, vb))) => match ka.cmp(&kb) {
                    Ordering::Less => {
                        i += 1;
                        (ka, va)
                    }
                    Ordering::Greater => {
                        j += 1;
                        (kb, vb)
                    }
                    Ordering::Equal => {
                        i += 1;
                        j += 1;
                        (ka, va - vb)
                    }
                },
                (Some(&(ka, va)), None) => {
                    i += 1;
                    (ka, va)
                }
                (None, Some(&(kb, vb))) => {
                    j += 1;
                    (kb, vb)
                }
                (None, None) => break,
            };
            d += diff * diff / self.degree[k];
        }
        d
    }
}

/// Size-weighted average of two sparse distributions
fn merge_probabilities(a: &SparseVec, sa: f64, b: &SparseVec, sb: f64) -> SparseVec {
    let total = sa + sb;
    let mut out = Vec::with_capacity(a.len().max(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        match (a.get(i), b.get(j)) {
            (Some(&(ka, va)), Some(&(kb, vb))) => match ka.cmp(&kb) {
                Ordering::Less => {
                    out.push((ka, va * sa / total));
                    i += 1;
                }
                Ordering::Greater => {
                    out.push((kb, vb * sb / total));
                    j += 1;
                }
                Ordering::Equal => {
                    out.push((ka, (va * sa + vb * sb) / total));
                    i += 1;
                    j += 1;
                }
            },
            (Some(&(ka, va)), None) => {
                out.push((ka, va * sa / total));
                i += 1;
            }
            (None, Some(&(kb, vb))) => {
                out.push((kb, vb * sb / total));
                j += 1;
            }
            (None, None) => break,
        }
    }
    out
}

impl Walktrap {
    /// Walktrap with random walks of length `steps` (at least 1)
    pub fn new(steps: usize) -> Walktrap {
        Walktrap { steps: steps.max(1) }
    }

    /// Run the full agglomeration and cut at maximum modularity
    pub fn run(&self, network: &Network) -> WalktrapResult {
        let n = network.nodes();
        let walk = WalkGraph::new(network);
        let m2 = network.get_total_node_weight();
        let inv_n = 1.0 / n.max(1) as f64;

        let mut probs: Vec<Option<SparseVec>> = (0..n)
            .into_par_iter()
            .map_init(|| vec![0.0; n], |scratch, i| Some(walk.walk_from(i, self.steps, scratch)))
            .collect();
        let mut sizes: Vec<f64> = vec![1.0; n];
        let mut internal: Vec<f64> = (0..n).map(|i| 2.0 * network.self_loop(i)).collect();
        let mut total: Vec<f64> = (0..n).map(|i| network.weight(i)).collect();
        let mut links: Vec<BTreeMap<usize, Link>> = vec![BTreeMap::new(); n];

        let pairs: Vec<(usize, usize, f64)> = (0..n)
            .flat_map(|i| network.neighbors(i).filter(move |&(j, _)| j > i).map(move |(j, w)| (i, j, w)))
            .collect();
        let deltas: Vec<f64> = pairs
            .par_iter()
            .map(|&(i, j, _)| {
                let (Some(pi), Some(pj)) = (&probs[i], &probs[j]) else { return f64::INFINITY };
                inv_n * 0.5 * walk.distance2(pi, pj)
            })
            .collect();

        let mut heap = BinaryHeap::with_capacity(pairs.len());
        for (&(i, j, w), &delta_sigma) in pairs.iter().zip(&deltas) {
            links[i].insert(j, Link { delta_sigma, weight: w });
            links[j].insert(i, Link { delta_sigma, weight: w });
            heap.push(Reverse(Candidate { delta_sigma, a: i, b: j }));
        }

        let mut q = if m2 > 0.0 {
            (0..n)
                .map(|i| internal[i] / m2 - (total[i] / m2).powi(2))
                .sum::<f64>()
        } else {
            0.0
        };
        let mut modularity = vec![q];
        let mut merges = Vec::new();
        let mut alive = vec![true; n];

        while let Some(Reverse(cand)) = heap.pop() {
            let (a, b) = (cand.a, cand.b);
            if !alive[a] || !alive[b] {
                continue;
            }
            let ab = match links[a].get(&b) {
                Some(l) if l.delta_sigma == cand.delta_sigma => *l,
                _ => continue,
            };

            let c = alive.len();
            let (sa, sb) = (sizes[a], sizes[b]);
            let (pa, pb) = (probs[a].take().unwrap_or_default(), probs[b].take().unwrap_or_default());
            let pc = merge_probabilities(&pa, sa, &pb, sb);
            let sc = sa + sb;
            let in_c = internal[a] + internal[b] + 2.0 * ab.weight;
            let tot_c = total[a] + total[b];
            if m2 > 0.0 {
                q += (in_c - internal[a] - internal[b]) / m2
                    - (tot_c * tot_c - total[a] * total[a] - total[b] * total[b]) / (m2 * m2);
            }

            let links_a = std::mem::take(&mut links[a]);
            let links_b = std::mem::take(&mut links[b]);
            let mut neighbors: BTreeMap<usize, (Option<Link>, Option<Link>)> = BTreeMap::new();
            for (&x, &l) in &links_a {
                if x != b {
                    neighbors.entry(x).or_default().0 = Some(l);
                }
            }
            for (&x, &l) in &links_b {
                if x != a {
                    neighbors.entry(x).or_default().1 = Some(l);
                }
            }

            let mut links_c = BTreeMap::new();
            for (x, (la, lb)) in neighbors {
                let sx = sizes[x];
                let delta_sigma = match (la, lb) {
                    (Some(la), Some(lb)) => {
                        ((sa + sx) * la.delta_sigma + (sb + sx) * lb.delta_sigma - sx * ab.delta_sigma) / (sc + sx)
                    }
                    _ => match &probs[x] {
                        Some(px) => inv_n * sc * sx / (sc + sx) * walk.distance2(&pc, px),
                        None => f64::INFINITY,
                    },
                };
                let weight = la.map_or(0.0, |l| l.weight) + lb.map_or(0.0, |l| l.weight);
                let link = Link { delta_sigma, weight };
                links[x].remove(&a);
                links[x].remove(&b);
                links[x].insert(c, link);
                links_c.insert(x, link);
                heap.push(Reverse(Candidate { delta_sigma, a: x, b: c }));
            }

            alive[a] = false;
            alive[b] = false;
            alive.push(true);
            probs.push(Some(pc));
            sizes.push(sc);
            internal.push(in_c);
            total.push(tot_c);
            links.push(links_c);
            merges.push((a, b));
            modularity.push(q);
        }

        let best = modularity
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(bi, bq), (i, &q)| if q > bq { (i, q) } else { (bi, bq) })
            .0;
        debug!(
            "walktrap: {} merges, best cut after {} with modularity {:.4}",
            merges.len(),
            best,
            modularity[best]
        );

        let clustering = cut(n, &merges[..best]);
        WalktrapResult {
            merges,
            modularity,
            clustering,
        }
    }
}

/// Partition of the `n` leaves after applying `merges` in order
fn cut(n: usize, merges: &[(usize, usize)]) -> SimpleClustering {
    let mut parent: Vec<usize> = (0..n + merges.len()).collect();
    for (k, &(a, b)) in merges.iter().enumerate() {
        parent[a] = n + k;
        parent[b] = n + k;
    }
    let labels: Vec<usize> = (0..n)
        .map(|mut x| {
            while parent[x] != x {
                x = parent[x];
            }
            x
        })
        .collect();
    SimpleClustering::from_labels(&labels)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cut() {
        let c = cut(4, &[(0, 1), (2, 4)]);
        assert_eq!(c.labels(), vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_merge_probabilities() {
        let a = vec![(0, 0.5), (2, 0.5)];
        let b = vec![(1, 1.0), (2, 0.0)];
        let m = merge_probabilities(&a, 1.0, &b, 3.0);
        assert_eq!(m, vec![(0, 0.125), (1, 0.75), (2, 0.125)]);
    }

    #[test]
    fn test_walk_is_a_distribution() {
        let n = Network::from_edges(4, vec![(0, 1, 1.0), (1, 2, 2.0), (2, 3, 1.0)]);
        let g = WalkGraph::new(&n);
        let mut scratch = vec![0.0; 4];
        let p = g.walk_from(0, 4, &mut scratch);
        let total: f64 = p.iter().map(|&(_, v)| v).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(scratch.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_disconnected_components_stay_apart() {
        let n = Network::from_edges(6, vec![(0, 1, 1.0), (1, 2, 1.0), (0, 2, 1.0), (3, 4, 1.0), (4, 5, 1.0), (3, 5, 1.0)]);
        let r = Walktrap::default().run(&n);
        assert_eq!(r.merges.len(), 4);
        assert_eq!(r.clustering.labels(), vec![0, 0, 0, 1, 1, 1]);
        assert!((r.best_modularity() - 0.5).abs() < 1e-12);
    }
}
