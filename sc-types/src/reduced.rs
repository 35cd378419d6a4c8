use ndarray::{s, Array1, Array2, Axis};

/// Linear (principal component) representation of the cells. This is the only
/// reduced representation accepted by the quantitative downstream steps.
#[derive(Clone, Debug)]
pub struct Pca {
    /// cells x k component scores
    pub scores: Array2<f64>,
    /// standard deviation of each component
    pub sdev: Array1<f64>,
    /// percentage of the total variance of the input genes explained by each component
    pub percent_var: Vec<f64>,
    /// genes x k loadings
    pub rotation: Array2<f64>,
    /// row indices of the genes the decomposition was computed on
    pub genes: Vec<usize>,
}

impl Pca {
    pub fn n_cells(&self) -> usize {
        self.scores.nrows()
    }

    pub fn n_components(&self) -> usize {
        self.scores.ncols()
    }

    /// Keep the first `k` components
    pub fn truncate(&self, k: usize) -> Pca {
        let k = k.clamp(1, self.n_components());
        Pca {
            scores: self.scores.slice(s![.., ..k]).to_owned(),
            sdev: self.sdev.slice(s![..k]).to_owned(),
            percent_var: self.percent_var[..k].to_vec(),
            rotation: self.rotation.slice(s![.., ..k]).to_owned(),
            genes: self.genes.clone(),
        }
    }

    /// Keep the cells at `idx`, in that order
    pub fn select_cells(&self, idx: &[usize]) -> Pca {
        Pca {
            scores: self.scores.select(Axis(0), idx),
            ..self.clone()
        }
    }
}

/// Which nonlinear method produced a `VisualEmbedding`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EmbeddingKind {
    Tsne,
    Umap,
}

impl EmbeddingKind {
    pub fn name(&self) -> &'static str {
        match self {
            EmbeddingKind::Tsne => "TSNE",
            EmbeddingKind::Umap => "UMAP",
        }
    }
}

/// A 2D layout of the cells for plotting. Distances in this space are not
/// meaningful, so no analysis routine takes one as input.
#[derive(Clone, Debug)]
pub struct VisualEmbedding {
    pub kind: EmbeddingKind,
    /// cells x 2 coordinates
    pub coords: Array2<f64>,
}

impl VisualEmbedding {
    pub fn select_cells(&self, idx: &[usize]) -> VisualEmbedding {
        VisualEmbedding {
            kind: self.kind,
            coords: self.coords.select(Axis(0), idx),
        }
    }
}
