use crate::{Clustering, Network, ZeroVec};
use rand::{seq::SliceRandom, Rng};

/// Greedy node moves that increase modularity, visiting nodes in random order.
#[derive(Default)]
pub(crate) struct LocalMoving {
    resolution: f64,
    cluster_weights: Vec<f64>,
    cluster_sizes: Vec<usize>,
    unused_clusters: Vec<usize>,
    node_order: Vec<usize>,
    edge_weight_per_cluster: Vec<f64>,
    neighboring_clusters: Vec<usize>,
}

impl LocalMoving {
    pub fn new(resolution: f64) -> Self {
        LocalMoving {
            resolution,
            ..LocalMoving::default()
        }
    }

    /// One sweep over every node. Returns true if any node changed cluster.
    pub fn iterate(&mut self, n: &Network, c: &mut impl Clustering, rng: &mut impl Rng) -> bool {
        let nodes = n.nodes();
        if nodes == 0 {
            return false;
        }
        let total_node_weight = n.get_total_node_weight();
        if total_node_weight <= 0.0 {
            return false;
        }
        let mut update = false;

        self.cluster_weights.zero_len(nodes);
        self.cluster_sizes.zero_len(nodes);
        for i in 0..nodes {
            self.cluster_weights[c.get(i)] += n.weight(i);
            self.cluster_sizes[c.get(i)] += 1;
        }

        // stack of empty cluster ids, smallest on top
        self.unused_clusters.clear();
        self.unused_clusters
            .extend((0..nodes).rev().filter(|&i| self.cluster_sizes[i] == 0));

        self.node_order.clear();
        self.node_order.extend(0..nodes);
        self.node_order.shuffle(rng);

        self.edge_weight_per_cluster.zero_len(nodes);
        self.neighboring_clusters.clear();

        for idx in 0..nodes {
            let j = self.node_order[idx];
            let current_cluster = c.get(j);
            let w_j = n.weight(j);

            self.cluster_weights[current_cluster] -= w_j;
            self.cluster_sizes[current_cluster] -= 1;
            if self.cluster_sizes[current_cluster] == 0 {
                self.unused_clusters.push(current_cluster);
            }

            // An empty cluster is always a candidate so the node can be isolated.
            self.neighboring_clusters.clear();
            if let Some(&empty) = self.unused_clusters.last() {
                self.neighboring_clusters.push(empty);
            }
            for (target, edge_weight) in n.neighbors(j) {
                let neighbor_cluster = c.get(target);
                if self.edge_weight_per_cluster[neighbor_cluster] == 0.0 {
                    self.neighboring_clusters.push(neighbor_cluster);
                }
                self.edge_weight_per_cluster[neighbor_cluster] += edge_weight;
            }

            // Ties go to the old cluster, then the lowest id, so the sweep terminates.
            let gain = |l: usize, ew: f64, cw: f64| -> (usize, f64) {
                (l, ew - w_j * cw * self.resolution / total_node_weight)
            };
            let (mut best_cluster, mut max_increment) = gain(
                current_cluster,
                self.edge_weight_per_cluster[current_cluster],
                self.cluster_weights[current_cluster],
            );
            for &l in &self.neighboring_clusters {
                let (_, increment) = gain(l, self.edge_weight_per_cluster[l], self.cluster_weights[l]);
                if increment > max_increment || (increment == max_increment && l < best_cluster && best_cluster != current_cluster) {
                    best_cluster = l;
                    max_increment = increment;
                }
            }
            for &l in &self.neighboring_clusters {
                self.edge_weight_per_cluster[l] = 0.0;
            }
            self.edge_weight_per_cluster[current_cluster] = 0.0;

            self.cluster_weights[best_cluster] += w_j;
            self.cluster_sizes[best_cluster] += 1;
            if self.unused_clusters.last() == Some(&best_cluster) {
                self.unused_clusters.pop();
            }

            if best_cluster != current_cluster {
                c.set(j, best_cluster);
                update = true;
            }
        }

        if update {
            c.compact();
        }
        update
    }
}
