//! Clustering of cells on a shared nearest neighbor graph of their
//! principal components.
//!
//! One algorithm gives the partition used downstream; others can be run on
//! the same graph for comparison. Labels are ordered by cluster size.

use crate::nn::{build_snn_graph, SnnWeight};
use anyhow::{bail, Error};
use graph_cluster::{modularity, Clustering, Infomap, Louvain, Network, SimpleClustering, Walktrap};
use log::info;
use ndarray::Array2;
use sc_types::{Partition, Pca};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAlgorithm {
    Walktrap,
    Infomap,
    Louvain,
}

impl ClusterAlgorithm {
    pub const ALL: [ClusterAlgorithm; 3] = [ClusterAlgorithm::Walktrap, ClusterAlgorithm::Infomap, ClusterAlgorithm::Louvain];

    pub fn name(&self) -> &'static str {
        match self {
            ClusterAlgorithm::Walktrap => "walktrap",
            ClusterAlgorithm::Infomap => "infomap",
            ClusterAlgorithm::Louvain => "louvain",
        }
    }
}

impl FromStr for ClusterAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "walktrap" => Ok(ClusterAlgorithm::Walktrap),
            "infomap" => Ok(ClusterAlgorithm::Infomap),
            "louvain" => Ok(ClusterAlgorithm::Louvain),
            _ => bail!("unknown clustering algorithm '{}'", s),
        }
    }
}

/// Graph construction and clustering settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusteringParams {
    /// algorithm whose partition is used downstream
    pub algorithm: ClusterAlgorithm,
    /// further algorithms run on the same graph for comparison
    pub compare: Vec<ClusterAlgorithm>,
    /// neighbors per cell in the SNN graph
    pub k: usize,
    pub weighting: SnnWeight,
    /// walktrap random walk length
    pub steps: usize,
    /// infomap restarts
    pub trials: usize,
    /// louvain resolution
    pub resolution: f64,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        ClusteringParams {
            algorithm: ClusterAlgorithm::Walktrap,
            compare: Vec::new(),
            k: 10,
            weighting: SnnWeight::Rank,
            steps: 4,
            trials: 10,
            resolution: 1.0,
        }
    }
}

/// Partition of the graph nodes by one algorithm, with its modularity
pub fn cluster_graph(network: &Network, algorithm: ClusterAlgorithm, params: &ClusteringParams, seed: u64) -> Partition {
    let clustering: SimpleClustering = match algorithm {
        ClusterAlgorithm::Walktrap => Walktrap::new(params.steps).run(network).clustering,
        ClusterAlgorithm::Infomap => Infomap::new(params.trials, Some(seed)).run(network).0,
        ClusterAlgorithm::Louvain => Louvain::new(params.resolution, Some(seed)).run(network),
    };
    let q = modularity(network, &clustering);
    let partition = Partition::new(clustering.labels(), algorithm.name(), q);
    info!(
        "{} found {} clusters, modularity {:.4}, sizes {:?}",
        algorithm.name(),
        partition.n_clusters(),
        q,
        partition.sizes()
    );
    partition
}

#[derive(Clone, Debug)]
pub struct ClusteringResult {
    /// partition from the configured algorithm
    pub primary: Partition,
    /// partitions from the comparison algorithms, in configured order
    pub comparisons: Vec<Partition>,
}

impl ClusteringResult {
    pub fn all(&self) -> impl Iterator<Item = &Partition> {
        std::iter::once(&self.primary).chain(self.comparisons.iter())
    }
}

/// Build the SNN graph on the PCs and cluster it with the configured
/// algorithm and each comparison algorithm.
pub fn cluster_cells(pca: &Pca, params: &ClusteringParams, seed: u64) -> Result<ClusteringResult, Error> {
    let n = pca.n_cells();
    if n < 2 {
        bail!("clustering needs at least 2 cells, got {}", n);
    }
    let k = if params.k >= n {
        info!("{} neighbors requested, but only {} available", params.k, n - 1);
        n - 1
    } else {
        params.k
    };
    let network = build_snn_graph(&pca.scores, k, params.weighting)?;

    let primary = cluster_graph(&network, params.algorithm, params, seed);
    let mut comparisons = Vec::new();
    for &algorithm in &params.compare {
        if algorithm == params.algorithm || comparisons.iter().any(|p: &Partition| p.algorithm == algorithm.name()) {
            continue;
        }
        comparisons.push(cluster_graph(&network, algorithm, params, seed));
    }
    Ok(ClusteringResult { primary, comparisons })
}

/// Cells shared by each cluster of `a` (rows) and `b` (columns)
pub fn contingency_table(a: &Partition, b: &Partition) -> Result<Array2<usize>, Error> {
    if a.labels.len() != b.labels.len() {
        bail!("partitions cover {} and {} cells", a.labels.len(), b.labels.len());
    }
    let mut table = Array2::zeros((a.n_clusters(), b.n_clusters()));
    for (&la, &lb) in a.labels.iter().zip(&b.labels) {
        table[(la, lb)] += 1;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use rand_pcg::Pcg64Mcg;

    /// 3 separated blobs of 40, 30 and 20 cells
    fn blob_pca() -> Pca {
        let sizes = [40, 30, 20];
        let blob: Vec<usize> = sizes.iter().enumerate().flat_map(|(b, &s)| vec![b; s]).collect();
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let scores = Array2::from_shape_fn((blob.len(), 5), |(i, j)| {
            (if j == blob[i] { 25.0 } else { 0.0 }) + noise.sample(&mut rng)
        });
        Pca {
            scores,
            sdev: Array1::ones(5),
            percent_var: vec![20.0; 5],
            rotation: Array2::zeros((10, 5)),
            genes: (0..10).collect(),
        }
    }

    fn expected_labels() -> Vec<usize> {
        [vec![0; 40], vec![1; 30], vec![2; 20]].concat()
    }

    #[test]
    fn test_algorithms_recover_blobs() -> Result<(), Error> {
        let params = ClusteringParams {
            compare: vec![ClusterAlgorithm::Infomap, ClusterAlgorithm::Louvain],
            ..ClusteringParams::default()
        };
        let result = cluster_cells(&blob_pca(), &params, 1)?;
        assert_eq!(result.primary.algorithm, "walktrap");
        assert_eq!(result.comparisons.len(), 2);
        for p in result.all() {
            // ordered by size, so the labels match the blob order
            assert_eq!(p.labels, expected_labels(), "{}", p.algorithm);
            assert!(p.modularity > 0.5);
        }
        Ok(())
    }

    #[test]
    fn test_deterministic() -> Result<(), Error> {
        let params = ClusteringParams {
            algorithm: ClusterAlgorithm::Louvain,
            compare: vec![ClusterAlgorithm::Louvain, ClusterAlgorithm::Infomap],
            ..ClusteringParams::default()
        };
        let a = cluster_cells(&blob_pca(), &params, 9)?;
        let b = cluster_cells(&blob_pca(), &params, 9)?;
        assert_eq!(a.primary, b.primary);
        assert_eq!(a.comparisons, b.comparisons);
        // the primary algorithm is not repeated
        assert_eq!(a.comparisons.len(), 1);
        Ok(())
    }

    #[test]
    fn test_contingency() -> Result<(), Error> {
        let a = Partition::new(vec![0, 0, 0, 1, 1, 2], "a", 0.0);
        let b = Partition::new(vec![0, 0, 1, 1, 1, 1], "b", 0.0);
        let table = contingency_table(&a, &b)?;
        assert_eq!(table, ndarray::arr2(&[[1, 2], [2, 0], [1, 0]]));
        assert!(contingency_table(&a, &Partition::new(vec![0], "c", 0.0)).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("Infomap".parse::<ClusterAlgorithm>().unwrap(), ClusterAlgorithm::Infomap);
        assert!("leiden".parse::<ClusterAlgorithm>().is_err());
    }
}
