//! Two-level map equation for undirected weighted networks.
//!
//! Node visit rates are proportional to strength. A module's exit rate is the
//! weight of its boundary edges over the total strength. The description
//! length `L` of a random walk is minimized by greedy node moves followed by
//! aggregation, repeated for several randomized trials.

use crate::{Clustering, Network, SimpleClustering, ZeroVec};
use log::debug;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Default number of randomized trials
pub const DEFAULT_TRIALS: usize = 10;

const MIN_IMPROVEMENT: f64 = 1e-10;

fn plogp(x: f64) -> f64 {
    if x > 0.0 {
        x * x.log2()
    } else {
        0.0
    }
}

/// Infomap community detection
pub struct Infomap {
    trials: usize,
    rng: ChaCha20Rng,
}

/// Per-module flow statistics in units of the original network
#[derive(Default)]
struct ModuleFlow {
    /// summed strength of member nodes
    total: Vec<f64>,
    /// summed weight of edges with both ends inside, each edge counted twice
    internal: Vec<f64>,
    total_exit: f64,
    inv_m2: f64,
}

impl ModuleFlow {
    fn exit(&self, m: usize) -> f64 {
        (self.total[m] - self.internal[m]) * self.inv_m2
    }

    /// Module-dependent part of the codelength for one module
    fn term(&self, total: f64, internal: f64) -> f64 {
        let q = (total - internal) * self.inv_m2;
        let p = total * self.inv_m2;
        -2.0 * plogp(q) + plogp(q + p)
    }
}

/// Map equation codelength (in bits) of `clustering` on `network`
pub fn codelength(network: &Network, clustering: &impl Clustering) -> f64 {
    let m2 = network.get_total_node_weight();
    if m2 <= 0.0 {
        return 0.0;
    }
    let k = clustering.n_clusters();
    let mut total = vec![0.0; k];
    let mut internal = vec![0.0; k];
    let mut node_entropy = 0.0;
    for i in 0..network.nodes() {
        let ci = clustering.get(i);
        total[ci] += network.weight(i);
        internal[ci] += 2.0 * network.self_loop(i);
        for (j, w) in network.neighbors(i) {
            if clustering.get(j) == ci {
                internal[ci] += w;
            }
        }
        node_entropy += plogp(network.weight(i) / m2);
    }

    let mut exit_sum = 0.0;
    let mut module_terms = 0.0;
    for m in 0..k {
        let q = (total[m] - internal[m]) / m2;
        let p = total[m] / m2;
        exit_sum += q;
        module_terms += -2.0 * plogp(q) + plogp(q + p);
    }
    plogp(exit_sum) + module_terms - node_entropy
}

impl Infomap {
    /// Infomap with `trials` randomized restarts (at least one).
    /// A seed of 0 is used when none is supplied.
    pub fn new(trials: usize, seed: Option<u64>) -> Infomap {
        Infomap {
            trials: trials.max(1),
            rng: ChaCha20Rng::seed_from_u64(seed.unwrap_or_default()),
        }
    }

    /// Best partition over all trials and its codelength
    pub fn run(&mut self, network: &Network) -> (SimpleClustering, f64) {
        let one_module = SimpleClustering::from_labels(&vec![0; network.nodes()]);
        let mut best = (one_module.clone(), codelength(network, &one_module));
        for trial in 0..self.trials {
            let c = self.trial(network);
            let l = codelength(network, &c);
            debug!("infomap trial {}: {} modules, codelength {:.5}", trial, c.n_clusters(), l);
            if l < best.1 - MIN_IMPROVEMENT {
                best = (c, l);
            }
        }
        best
    }

    fn trial(&mut self, network: &Network) -> SimpleClustering {
        let mut c = SimpleClustering::singletons(network.nodes());
        let mut level = network.clone();
        let mut mover = LocalMoving::default();
        loop {
            let mut level_c = SimpleClustering::singletons(level.nodes());
            let mut moved = false;
            for _ in 0..100 {
                if !mover.iterate(&level, &mut level_c, &mut self.rng) {
                    break;
                }
                moved = true;
            }
            if !moved {
                break;
            }
            level_c.compact();
            c.collapse(&level_c);
            if level_c.n_clusters() == 1 {
                break;
            }
            level = level.create_reduced_network(&level_c);
        }
        c
    }
}

#[derive(Default)]
struct LocalMoving {
    flow: ModuleFlow,
    node_order: Vec<usize>,
    edge_weight_per_module: Vec<f64>,
    neighboring_modules: Vec<usize>,
}

impl LocalMoving {
    /// One sweep over every node in random order. Returns true if any node moved.
    fn iterate(&mut self, n: &Network, c: &mut SimpleClustering, rng: &mut impl Rng) -> bool {
        let nodes = n.nodes();
        let m2 = n.get_total_node_weight();
        if nodes == 0 || m2 <= 0.0 {
            return false;
        }

        let flow = &mut self.flow;
        flow.inv_m2 = 1.0 / m2;
        flow.total.zero_len(nodes);
        flow.internal.zero_len(nodes);
        for i in 0..nodes {
            let ci = c.get(i);
            flow.total[ci] += n.weight(i);
            flow.internal[ci] += 2.0 * n.self_loop(i);
            for (j, w) in n.neighbors(i) {
                if c.get(j) == ci {
                    flow.internal[ci] += w;
                }
            }
        }
        flow.total_exit = (0..nodes).map(|m| flow.exit(m)).sum();

        self.node_order.clear();
        self.node_order.extend(0..nodes);
        self.node_order.shuffle(rng);
        self.edge_weight_per_module.zero_len(nodes);

        let mut update = false;
        for idx in 0..nodes {
            let alpha = self.node_order[idx];
            let a = c.get(alpha);
            let s = n.weight(alpha);
            let own = 2.0 * n.self_loop(alpha);

            self.neighboring_modules.clear();
            for (j, w) in n.neighbors(alpha) {
                let m = c.get(j);
                if self.edge_weight_per_module[m] == 0.0 {
                    self.neighboring_modules.push(m);
                }
                self.edge_weight_per_module[m] += w;
            }

            let flow = &self.flow;
            let (tot_a, in_a) = (flow.total[a], flow.internal[a]);
            let tot_a_out = tot_a - s;
            let in_a_out = in_a - 2.0 * self.edge_weight_per_module[a] - own;
            let exit_a = flow.exit(a);
            let exit_a_out = (tot_a_out - in_a_out) * flow.inv_m2;
            let term_a = flow.term(tot_a, in_a);
            let term_a_out = flow.term(tot_a_out, in_a_out);

            let mut best_module = a;
            let mut best_delta = 0.0;
            let mut best_state = (0.0, 0.0);
            for &b in &self.neighboring_modules {
                if b == a {
                    continue;
                }
                let (tot_b, in_b) = (flow.total[b], flow.internal[b]);
                let tot_b_in = tot_b + s;
                let in_b_in = in_b + 2.0 * self.edge_weight_per_module[b] + own;
                let exit_b_in = (tot_b_in - in_b_in) * flow.inv_m2;
                let new_exit = flow.total_exit - exit_a - flow.exit(b) + exit_a_out + exit_b_in;
                let delta = plogp(new_exit) - plogp(flow.total_exit) + term_a_out + flow.term(tot_b_in, in_b_in)
                    - term_a
                    - flow.term(tot_b, in_b);
                let tie = (delta - best_delta).abs() <= MIN_IMPROVEMENT && best_module != a && b < best_module;
                if delta < best_delta - MIN_IMPROVEMENT || tie {
                    best_delta = delta;
                    best_module = b;
                    best_state = (tot_b_in, in_b_in);
                }
            }
            for &m in &self.neighboring_modules {
                self.edge_weight_per_module[m] = 0.0;
            }

            if best_module != a && best_delta < -MIN_IMPROVEMENT {
                let flow = &mut self.flow;
                let b = best_module;
                let old_exit_b = flow.exit(b);
                flow.total[a] = tot_a_out;
                flow.internal[a] = in_a_out;
                flow.total[b] = best_state.0;
                flow.internal[b] = best_state.1;
                flow.total_exit += flow.exit(a) + flow.exit(b) - exit_a - old_exit_b;
                c.set(alpha, b);
                update = true;
            }
        }
        update
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn two_triangles() -> Network {
        let edges = vec![(0, 1, 1.0), (1, 2, 1.0), (0, 2, 1.0), (3, 4, 1.0), (4, 5, 1.0), (3, 5, 1.0), (2, 3, 1.0)];
        Network::from_edges(6, edges)
    }

    #[test]
    fn test_one_module_codelength_is_node_entropy() {
        let n = two_triangles();
        let c = SimpleClustering::from_labels(&[0; 6]);
        let m2 = n.get_total_node_weight();
        let h: f64 = (0..6).map(|i| -plogp(n.weight(i) / m2)).sum();
        assert_approx_eq!(codelength(&n, &c), h, 1e-12);
    }

    #[test]
    fn test_split_beats_one_module() {
        let n = two_triangles();
        let split = SimpleClustering::from_labels(&[0, 0, 0, 1, 1, 1]);
        let one = SimpleClustering::from_labels(&[0; 6]);
        assert!(codelength(&n, &split) < codelength(&n, &one));
    }

    #[test]
    fn test_run_finds_triangles() {
        let n = two_triangles();
        let (c, l) = Infomap::new(DEFAULT_TRIALS, Some(1)).run(&n);
        let labels = c.labels();
        assert_eq!(c.n_clusters(), 2);
        assert!(labels[..3].iter().all(|&x| x == labels[0]));
        assert!(labels[3..].iter().all(|&x| x == labels[3]));
        assert_approx_eq!(l, codelength(&n, &c), 1e-12);
    }
}
