/// Assignment of every node of a network to one community. Community ids are
/// dense `0..n_clusters()` after `compact`.
pub trait Clustering: std::fmt::Debug {
    /// Every node in a community of its own
    fn singletons(n_nodes: usize) -> Self;

    /// Communities from per-node ids, compacted
    fn from_labels(labels: &[usize]) -> Self;

    /// Nodes of each community, in node order
    fn members(&self) -> Vec<Vec<usize>>;

    /// Community of `node`
    fn get(&self, node: usize) -> usize;

    /// Move `node` into `community`; ids past the current range extend it
    fn set(&mut self, node: usize, community: usize);

    /// Number of nodes
    fn nodes(&self) -> usize;

    /// Number of community ids in use, including empty ones before `compact`
    fn n_clusters(&self) -> usize;

    /// Renumber communities to `0..k` keeping their order, dropping empty ones
    fn compact(&mut self);

    /// Map every node through `coarse`, a clustering of the current communities.
    /// Used after optimizing on an aggregated network.
    fn collapse<C: Clustering>(&mut self, coarse: &C) {
        for node in 0..self.nodes() {
            let community = coarse.get(self.get(node));
            self.set(node, community);
        }
        self.compact();
    }

    /// Community of every node
    fn labels(&self) -> Vec<usize> {
        (0..self.nodes()).map(|node| self.get(node)).collect()
    }
}

/// `Clustering` backed by one label per node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleClustering {
    labels: Vec<usize>,
    n_clusters: usize,
}

impl Clustering for SimpleClustering {
    fn singletons(n_nodes: usize) -> Self {
        SimpleClustering {
            labels: (0..n_nodes).collect(),
            n_clusters: n_nodes,
        }
    }

    fn from_labels(labels: &[usize]) -> Self {
        let mut c = SimpleClustering {
            labels: labels.to_vec(),
            n_clusters: labels.iter().max().map_or(0, |&m| m + 1),
        };
        c.compact();
        c
    }

    fn members(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.n_clusters];
        for (node, &l) in self.labels.iter().enumerate() {
            out[l].push(node);
        }
        out
    }

    fn get(&self, node: usize) -> usize {
        self.labels[node]
    }

    fn set(&mut self, node: usize, community: usize) {
        self.labels[node] = community;
        self.n_clusters = self.n_clusters.max(community + 1);
    }

    fn nodes(&self) -> usize {
        self.labels.len()
    }

    fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    fn compact(&mut self) {
        let mut used = vec![false; self.n_clusters];
        for &l in &self.labels {
            used[l] = true;
        }
        let mut remap = vec![0; self.n_clusters];
        let mut next = 0;
        for (old, &u) in used.iter().enumerate() {
            if u {
                remap[old] = next;
                next += 1;
            }
        }
        for l in self.labels.iter_mut() {
            *l = remap[*l];
        }
        self.n_clusters = next;
    }

    fn labels(&self) -> Vec<usize> {
        self.labels.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_sparse_ids() {
        let c = SimpleClustering::from_labels(&[7, 3, 7, 9]);
        assert_eq!(c.n_clusters(), 3);
        assert_eq!(c.labels(), vec![1, 0, 1, 2]);
        assert_eq!(c.members(), vec![vec![1], vec![0, 2], vec![3]]);
    }

    #[test]
    fn test_moves_then_compact() {
        let mut c = SimpleClustering::singletons(6);
        c.set(5, 1);
        c.set(2, 1);
        assert_eq!(c.n_clusters(), 6);
        c.compact();
        assert_eq!(c.labels(), vec![0, 1, 1, 2, 3, 1]);
        assert_eq!(c.n_clusters(), 4);
    }

    #[test]
    fn test_collapse() {
        let mut fine = SimpleClustering::from_labels(&[0, 1, 2, 2, 3]);
        fine.collapse(&SimpleClustering::from_labels(&[1, 1, 0, 0]));
        assert_eq!(fine.labels(), vec![1, 1, 0, 0, 0]);
        assert_eq!(fine.n_clusters(), 2);
    }
}
