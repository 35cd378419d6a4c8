use crate::{Clustering, Network};
use rayon::prelude::*;

/// Newman-Girvan modularity of a clustering, generalized with a resolution parameter.
/// Returns 0 for a network without edges.
pub fn modularity_with_resolution(resolution: f64, graph: &Network, clustering: &(impl Clustering + Sync)) -> f64 {
    let total = graph.get_total_node_weight();
    if total <= 0.0 {
        return 0.0;
    }

    // Sum chunks serially afterwards so the result does not depend on the thread count.
    let chunk_size = std::cmp::max(1, graph.nodes() / 64);
    let internal: f64 = (0..graph.nodes())
        .collect::<Vec<usize>>()
        .par_chunks(chunk_size)
        .map(|nodes| {
            let mut quality = 0.0;
            for &i in nodes {
                let c_i = clustering.get(i);
                quality += 2.0 * graph.self_loop(i);
                for (j, w) in graph.neighbors(i) {
                    if clustering.get(j) == c_i {
                        quality += w;
                    }
                }
            }
            quality
        })
        .collect::<Vec<f64>>()
        .into_iter()
        .sum();

    let mut cluster_weights = vec![0.0; clustering.n_clusters()];
    for i in 0..graph.nodes() {
        cluster_weights[clustering.get(i)] += graph.weight(i);
    }
    let expected: f64 = cluster_weights.iter().map(|w| w * w).sum::<f64>() * resolution / total;

    (internal - expected) / total
}

/// Newman-Girvan modularity of a clustering
pub fn modularity(graph: &Network, clustering: &(impl Clustering + Sync)) -> f64 {
    modularity_with_resolution(1.0, graph, clustering)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SimpleClustering;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_two_triangles() {
        // two triangles joined by one edge; igraph gives 0.357142857 for the natural split
        let edges = vec![(0, 1, 1.0), (1, 2, 1.0), (0, 2, 1.0), (3, 4, 1.0), (4, 5, 1.0), (3, 5, 1.0), (2, 3, 1.0)];
        let n = Network::from_edges(6, edges);
        let c = SimpleClustering::from_labels(&[0, 0, 0, 1, 1, 1]);
        assert_approx_eq!(modularity(&n, &c), 5.0 / 14.0, 1e-12);
        let one = SimpleClustering::from_labels(&[0; 6]);
        assert_approx_eq!(modularity(&n, &one), 0.0, 1e-12);
    }
}
