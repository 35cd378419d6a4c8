use std::collections::{BTreeMap, HashMap};

/// Assignment of cells to clusters produced by one graph clustering run.
/// Labels are 0-based and ordered by decreasing cluster size; they only have
/// meaning relative to the graph and algorithm that produced them.
#[derive(Clone, Debug, PartialEq)]
pub struct Partition {
    pub labels: Vec<usize>,
    pub algorithm: String,
    pub modularity: f64,
}

impl Partition {
    pub fn new(labels: Vec<usize>, algorithm: impl Into<String>, modularity: f64) -> Partition {
        Partition {
            labels: relabel_by_size(labels),
            algorithm: algorithm.into(),
            modularity,
        }
    }

    pub fn n_clusters(&self) -> usize {
        self.labels.iter().max().map_or(0, |&m| m + 1)
    }

    /// Cell indices belonging to each cluster
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.n_clusters()];
        for (cell, &l) in self.labels.iter().enumerate() {
            out[l].push(cell);
        }
        out
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.members().iter().map(Vec::len).collect()
    }
}

fn bincount(values: &[usize]) -> BTreeMap<usize, usize> {
    let mut res = BTreeMap::default();
    for &v in values {
        *res.entry(v).or_insert(0) += 1;
    }
    res
}

/// Relabel a clustering from greatest cluster size to least. Ties keep the
/// order of the original labels.
pub fn relabel_by_size(mut labels: Vec<usize>) -> Vec<usize> {
    let mut hist = bincount(&labels).into_iter().collect::<Vec<_>>();
    hist.sort_by(|(_, x), (_, y)| y.cmp(x));
    let map = hist
        .into_iter()
        .enumerate()
        .map(|(i, (label, _))| (label, i))
        .collect::<HashMap<_, _>>();
    for x in labels.iter_mut() {
        *x = map[x];
    }
    labels
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_relabel_by_size() {
        assert_eq!(relabel_by_size(vec![5, 2, 2, 7, 2, 5]), vec![1, 0, 0, 2, 0, 1]);
        assert_eq!(relabel_by_size(vec![]), Vec::<usize>::new());
    }

    #[test]
    fn test_members() {
        let p = Partition::new(vec![3, 3, 1], "walktrap", 0.0);
        assert_eq!(p.n_clusters(), 2);
        assert_eq!(p.members(), vec![vec![0, 1], vec![2]]);
        assert_eq!(p.sizes(), vec![2, 1]);
    }
}
