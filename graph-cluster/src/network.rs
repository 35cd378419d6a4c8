use crate::Clustering;
use fxhash::FxHashMap;

/// Weighted undirected graph being clustered.
///
/// Adjacency is stored in both directions. Self-loops are kept apart from the
/// adjacency lists; a loop of weight `w` adds `2w` to its node's strength, so
/// the strength of a node in a reduced network equals the summed strength of
/// the nodes it was built from.
#[derive(Clone, Debug, Default)]
pub struct Network {
    adjacency: Vec<Vec<(usize, f64)>>,
    self_loops: Vec<f64>,
    strengths: Vec<f64>,
}

impl Network {
    /// Build a network over `n_nodes` nodes from `(i, j, weight)` edges.
    /// Repeated edges are summed, edges with `i == j` become self-loops and
    /// non-positive weights are ignored.
    pub fn from_edges(n_nodes: usize, edges: impl IntoIterator<Item = (usize, usize, f64)>) -> Network {
        let mut memo: FxHashMap<(usize, usize), f64> = FxHashMap::default();
        let mut self_loops = vec![0.0; n_nodes];
        for (i, j, w) in edges {
            if w <= 0.0 {
                continue;
            }
            if i == j {
                self_loops[i] += w;
            } else {
                let key = if i < j { (i, j) } else { (j, i) };
                *memo.entry(key).or_insert(0.0) += w;
            }
        }

        let mut edge_list: Vec<_> = memo.into_iter().collect();
        edge_list.sort_by_key(|&(k, _)| k);

        let mut adjacency = vec![Vec::new(); n_nodes];
        for ((i, j), w) in edge_list {
            adjacency[i].push((j, w));
            adjacency[j].push((i, w));
        }
        for adj in &mut adjacency {
            adj.sort_by_key(|&(j, _)| j);
        }

        let strengths = adjacency
            .iter()
            .zip(&self_loops)
            .map(|(adj, &l)| adj.iter().map(|&(_, w)| w).sum::<f64>() + 2.0 * l)
            .collect();

        Network {
            adjacency,
            self_loops,
            strengths,
        }
    }

    /// Number of nodes in the graph
    pub fn nodes(&self) -> usize {
        self.adjacency.len()
    }

    /// Strength (weighted degree) of `node`, including its self-loop twice
    pub fn weight(&self, node: usize) -> f64 {
        self.strengths[node]
    }

    /// Self-loop weight of `node`
    pub fn self_loop(&self, node: usize) -> f64 {
        self.self_loops[node]
    }

    /// Pairs of (adjacent node id, edge weight) for all neighbors of `node`, excluding itself
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.adjacency[node].iter().copied()
    }

    /// Number of neighbors of `node`, excluding itself
    pub fn degree(&self, node: usize) -> usize {
        self.adjacency[node].len()
    }

    /// Number of distinct edges, self-loops included
    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum::<usize>() / 2 + self.self_loops.iter().filter(|&&l| l > 0.0).count()
    }

    /// Sum of all node strengths, i.e. twice the total edge weight
    pub fn get_total_node_weight(&self) -> f64 {
        self.strengths.iter().sum()
    }

    /// Total weight of all edges, each counted once
    pub fn get_total_edge_weight(&self) -> f64 {
        self.get_total_node_weight() / 2.0
    }

    /// Creates a reduced (or aggregate) network based on a clustering.
    /// Each node in the reduced network corresponds to a cluster of nodes in
    /// the original network. Edges between two clusters are summed into one
    /// edge and edges within a cluster become that node's self-loop.
    pub fn create_reduced_network(&self, clustering: &impl Clustering) -> Network {
        let mut edges = Vec::with_capacity(self.nodes());
        for i in 0..self.nodes() {
            let ci = clustering.get(i);
            if self.self_loops[i] > 0.0 {
                edges.push((ci, ci, self.self_loops[i]));
            }
            for &(j, w) in &self.adjacency[i] {
                if j > i {
                    edges.push((ci, clustering.get(j), w));
                }
            }
        }
        Network::from_edges(clustering.n_clusters(), edges)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SimpleClustering;

    #[test]
    fn test_from_edges() {
        let n = Network::from_edges(4, vec![(0, 1, 1.0), (1, 0, 2.0), (2, 2, 0.5), (1, 2, 1.0), (2, 3, 0.0)]);
        assert_eq!(n.nodes(), 4);
        assert_eq!(n.neighbors(1).collect::<Vec<_>>(), vec![(0, 3.0), (2, 1.0)]);
        assert_eq!(n.weight(2), 2.0);
        assert_eq!(n.weight(3), 0.0);
        assert_eq!(n.edge_count(), 3);
        assert_eq!(n.get_total_edge_weight(), 4.5);
    }

    #[test]
    fn test_reduced_network() {
        let n = Network::from_edges(4, vec![(0, 1, 1.0), (1, 2, 2.0), (2, 3, 3.0), (3, 0, 4.0)]);
        let c = SimpleClustering::from_labels(&[0, 0, 1, 1]);
        let r = n.create_reduced_network(&c);
        assert_eq!(r.nodes(), 2);
        assert_eq!(r.self_loop(0), 1.0);
        assert_eq!(r.self_loop(1), 3.0);
        assert_eq!(r.neighbors(0).collect::<Vec<_>>(), vec![(1, 6.0)]);
        assert_eq!(r.weight(0), n.weight(0) + n.weight(1));
        assert_eq!(r.get_total_node_weight(), n.get_total_node_weight());
    }
}
