use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CACHE_FILE: &str = "processed.json";

/// One furniture-part sample: node features, undirected edges and a
/// multi-hot machining-feature target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartGraph {
    pub node_features: Vec<Vec<f32>>,
    pub edges: Vec<[usize; 2]>,
    pub labels: Vec<f32>,
}

impl PartGraph {
    pub fn node_count(&self) -> usize {
        self.node_features.len()
    }
}

/// Ordered, shuffleable sequence of part graphs backed by shared storage.
///
/// `shuffled` hands out a reordered snapshot instead of mutating in place,
/// so every trial gets its own ordering over the same loaded samples.
pub struct PartGraphDataset {
    items: Arc<Vec<PartGraph>>,
    order: Vec<usize>,
    feature_dim: usize,
    class_count: usize,
}

impl PartGraphDataset {
    /// Loads the dataset, materializing a processed cache at the destination
    /// on first access and reading it back afterwards.
    pub fn load(source: &Path, destination: &Path) -> Result<Self> {
        let cache = destination.join(CACHE_FILE);
        let items: Vec<PartGraph> = if cache.is_file() {
            serde_json::from_reader(BufReader::new(File::open(&cache)?))?
        } else {
            let items = read_source(source)?;
            fs::create_dir_all(destination)?;
            serde_json::to_writer(BufWriter::new(File::create(&cache)?), &items)?;
            items
        };

        if items.is_empty() {
            return Err(Error::EmptyDataset(source.to_path_buf()));
        }

        Self::from_items(items)
    }

    pub fn from_items(items: Vec<PartGraph>) -> Result<Self> {
        let first = items
            .first()
            .ok_or_else(|| Error::Dataset("no samples".into()))?;
        let feature_dim = first
            .node_features
            .first()
            .map(Vec::len)
            .ok_or_else(|| Error::Dataset("sample 0 has no nodes".into()))?;
        let class_count = first.labels.len();

        for (index, item) in items.iter().enumerate() {
            if item.node_count() == 0 {
                return Err(Error::Dataset(format!("sample {index} has no nodes")));
            }
            if item.node_features.iter().any(|row| row.len() != feature_dim) {
                return Err(Error::Dataset(format!(
                    "sample {index} has node features of width != {feature_dim}"
                )));
            }
            if item.labels.len() != class_count {
                return Err(Error::Dataset(format!(
                    "sample {index} has {} labels, expected {class_count}",
                    item.labels.len()
                )));
            }
            if let Some(edge) = item
                .edges
                .iter()
                .find(|[u, v]| *u >= item.node_count() || *v >= item.node_count())
            {
                return Err(Error::Dataset(format!(
                    "sample {index} edge {edge:?} out of range for {} nodes",
                    item.node_count()
                )));
            }
        }

        let order = (0..items.len()).collect();

        Ok(Self {
            items: Arc::new(items),
            order,
            feature_dim,
            class_count,
        })
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// Snapshot of this dataset under a fresh seeded ordering. Storage is
    /// shared; the receiver's ordering is untouched.
    pub fn shuffled(&self, seed: u64) -> Self {
        let mut order = self.order.clone();
        order.shuffle(&mut StdRng::seed_from_u64(seed));

        Self {
            items: Arc::clone(&self.items),
            order,
            feature_dim: self.feature_dim,
            class_count: self.class_count,
        }
    }

    /// Contiguous view over the current ordering. Out-of-range bounds error.
    pub fn slice(&self, range: Range<usize>) -> Result<DatasetView> {
        if range.start > range.end || range.end > self.order.len() {
            return Err(Error::SliceOutOfRange {
                start: range.start,
                end: range.end,
                len: self.order.len(),
            });
        }

        Ok(DatasetView {
            items: Arc::clone(&self.items),
            indices: self.order[range].to_vec(),
        })
    }

    /// Train/validation partition at a fixed index.
    pub fn split(&self, at: usize) -> Result<(DatasetView, DatasetView)> {
        let train = self.slice(0..at)?;
        let validation = self.slice(at..self.order.len())?;

        Ok((train, validation))
    }
}

impl Dataset<PartGraph> for PartGraphDataset {
    fn get(&self, index: usize) -> Option<PartGraph> {
        self.order.get(index).map(|&i| self.items[i].clone())
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// A borrowed-ordering slice of the dataset, cheap to clone.
#[derive(Clone)]
pub struct DatasetView {
    items: Arc<Vec<PartGraph>>,
    indices: Vec<usize>,
}

impl Dataset<PartGraph> for DatasetView {
    fn get(&self, index: usize) -> Option<PartGraph> {
        self.indices.get(index).map(|&i| self.items[i].clone())
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

fn read_source(source: &Path) -> Result<Vec<PartGraph>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(source)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    paths
        .par_iter()
        .map(|path| {
            let file = File::open(path)?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|err| Error::Dataset(format!("{}: {err}", path.display())))
        })
        .collect()
}

/// Number of full batches under drop-last semantics.
pub fn batch_count(sample_count: usize, batch_size: usize) -> usize {
    sample_count / batch_size
}

/// A disjoint union of part graphs: features and adjacency are concatenated
/// block-diagonally, `pooling` mean-pools node rows back to per-graph rows.
#[derive(Clone, Debug)]
pub struct GraphBatch<B: Backend> {
    pub node_features: Tensor<B, 2>,
    pub adjacency: Tensor<B, 2>,
    pub pooling: Tensor<B, 2>,
    pub targets: Tensor<B, 2, Int>,
}

#[derive(Clone)]
pub struct GraphBatcher<B: Backend> {
    device: B::Device,
    feature_dim: usize,
    class_count: usize,
}

impl<B: Backend> GraphBatcher<B> {
    pub fn new(device: B::Device, feature_dim: usize, class_count: usize) -> Self {
        Self {
            device,
            feature_dim,
            class_count,
        }
    }
}

impl<B: Backend> Batcher<PartGraph, GraphBatch<B>> for GraphBatcher<B> {
    fn batch(&self, items: Vec<PartGraph>) -> GraphBatch<B> {
        let graph_count = items.len();
        let node_total: usize = items.iter().map(PartGraph::node_count).sum();

        let mut features = Vec::with_capacity(node_total * self.feature_dim);
        let mut adjacency = vec![0f32; node_total * node_total];
        let mut pooling = vec![0f32; graph_count * node_total];
        let mut targets = Vec::with_capacity(graph_count * self.class_count);

        let mut offset = 0;
        for (graph, item) in items.iter().enumerate() {
            let nodes = item.node_count();

            for row in &item.node_features {
                features.extend_from_slice(row);
            }

            // A + I, symmetric
            for node in 0..nodes {
                adjacency[(offset + node) * node_total + offset + node] = 1.0;
                pooling[graph * node_total + offset + node] = 1.0 / nodes as f32;
            }
            for [u, v] in &item.edges {
                adjacency[(offset + u) * node_total + offset + v] = 1.0;
                adjacency[(offset + v) * node_total + offset + u] = 1.0;
            }

            targets.extend(item.labels.iter().map(|&label| label as i64));
            offset += nodes;
        }

        // D^-1/2 (A + I) D^-1/2
        let inv_sqrt_degree: Vec<f32> = (0..node_total)
            .map(|row| {
                let degree: f32 = adjacency[row * node_total..(row + 1) * node_total]
                    .iter()
                    .sum();
                1.0 / degree.sqrt()
            })
            .collect();
        for row in 0..node_total {
            for col in 0..node_total {
                adjacency[row * node_total + col] *= inv_sqrt_degree[row] * inv_sqrt_degree[col];
            }
        }

        GraphBatch {
            node_features: Tensor::from_data(
                TensorData::new(features, [node_total, self.feature_dim])
                    .convert::<B::FloatElem>(),
                &self.device,
            ),
            adjacency: Tensor::from_data(
                TensorData::new(adjacency, [node_total, node_total]).convert::<B::FloatElem>(),
                &self.device,
            ),
            pooling: Tensor::from_data(
                TensorData::new(pooling, [graph_count, node_total]).convert::<B::FloatElem>(),
                &self.device,
            ),
            targets: Tensor::from_data(
                TensorData::new(targets, [graph_count, self.class_count])
                    .convert::<B::IntElem>(),
                &self.device,
            ),
        }
    }
}

/// Drop-last batch loader over a dataset view. Training loaders reshuffle
/// their order from an owned RNG before every pass; evaluation loaders keep
/// the view's order.
pub struct GraphLoader<B: Backend> {
    view: DatasetView,
    batcher: GraphBatcher<B>,
    batch_size: usize,
    order: Vec<usize>,
    rng: Option<StdRng>,
}

impl<B: Backend> GraphLoader<B> {
    pub fn shuffled(
        view: DatasetView,
        batcher: GraphBatcher<B>,
        batch_size: usize,
        rng: StdRng,
    ) -> Self {
        let order = (0..view.len()).collect();
        Self {
            view,
            batcher,
            batch_size,
            order,
            rng: Some(rng),
        }
    }

    pub fn sequential(view: DatasetView, batcher: GraphBatcher<B>, batch_size: usize) -> Self {
        let order = (0..view.len()).collect();
        Self {
            view,
            batcher,
            batch_size,
            order,
            rng: None,
        }
    }

    pub fn batch_count(&self) -> usize {
        batch_count(self.view.len(), self.batch_size)
    }

    pub fn iter(&mut self) -> Batches<'_, B> {
        if let Some(rng) = &mut self.rng {
            self.order.shuffle(rng);
        }

        Batches {
            loader: self,
            cursor: 0,
        }
    }
}

pub struct Batches<'a, B: Backend> {
    loader: &'a GraphLoader<B>,
    cursor: usize,
}

impl<B: Backend> Iterator for Batches<'_, B> {
    type Item = GraphBatch<B>;

    fn next(&mut self) -> Option<GraphBatch<B>> {
        let start = self.cursor * self.loader.batch_size;
        let end = start + self.loader.batch_size;
        if end > self.loader.order.len() {
            return None;
        }
        self.cursor += 1;

        let items = self.loader.order[start..end]
            .iter()
            .filter_map(|&index| self.loader.view.get(index))
            .collect();

        Some(self.loader.batcher.batch(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray;

    fn graph(nodes: usize, label: f32) -> PartGraph {
        PartGraph {
            node_features: vec![vec![1.0, 0.5]; nodes],
            edges: (1..nodes).map(|v| [v - 1, v]).collect(),
            labels: vec![label, 1.0 - label, 0.0],
        }
    }

    fn dataset(len: usize) -> PartGraphDataset {
        PartGraphDataset::from_items((0..len).map(|i| graph(3, (i % 2) as f32)).collect())
            .unwrap()
    }

    #[test]
    fn rejects_ragged_node_features() {
        let mut bad = graph(2, 1.0);
        bad.node_features[1] = vec![1.0];
        let result = PartGraphDataset::from_items(vec![graph(2, 0.0), bad]);
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn rejects_out_of_range_edges() {
        let mut bad = graph(2, 1.0);
        bad.edges.push([0, 5]);
        let result = PartGraphDataset::from_items(vec![bad]);
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn shuffled_is_a_snapshot() {
        let original = dataset(20);
        let before: Vec<_> = (0..original.len())
            .map(|i| original.get(i).unwrap().labels[0] as i64)
            .collect();

        let shuffled = original.shuffled(7);

        let after: Vec<_> = (0..original.len())
            .map(|i| original.get(i).unwrap().labels[0] as i64)
            .collect();
        assert_eq!(before, after);
        assert_eq!(shuffled.len(), original.len());
    }

    #[test]
    fn split_lengths_hold_for_any_ordering() {
        for seed in 0..4 {
            let data = dataset(100).shuffled(seed);
            let (train, validation) = data.split(73).unwrap();
            assert_eq!(train.len(), 73);
            assert_eq!(validation.len(), 27);
        }
    }

    #[test]
    fn slice_out_of_range_errors() {
        let data = dataset(10);
        assert!(data.slice(0..10).is_ok());
        assert!(matches!(
            data.slice(0..11),
            Err(Error::SliceOutOfRange { .. })
        ));
        assert!(matches!(data.split(11), Err(Error::SliceOutOfRange { .. })));
    }

    #[test]
    fn drop_last_batch_counts() {
        for batch_size in [16, 32, 64, 128] {
            assert_eq!(batch_count(8000, batch_size), 8000 / batch_size);
        }

        // 8000 samples split at 5973, batch size 32
        assert_eq!(batch_count(5973, 32), 186);
        assert_eq!(batch_count(2027, 32), 63);
    }

    #[test]
    fn loader_drops_trailing_partial_batch() {
        let data = dataset(10);
        let view = data.slice(0..10).unwrap();
        let batcher = GraphBatcher::<TestBackend>::new(Default::default(), 2, 3);
        let mut loader = GraphLoader::sequential(view, batcher, 4);

        assert_eq!(loader.batch_count(), 2);
        let batches: Vec<_> = loader.iter().collect();
        assert_eq!(batches.len(), 2);

        // 4 graphs of 3 nodes each
        assert_eq!(batches[0].node_features.dims(), [12, 2]);
        assert_eq!(batches[0].adjacency.dims(), [12, 12]);
        assert_eq!(batches[0].pooling.dims(), [4, 12]);
        assert_eq!(batches[0].targets.dims(), [4, 3]);
    }

    #[test]
    fn adjacency_is_symmetrically_normalized() {
        let item = PartGraph {
            node_features: vec![vec![1.0], vec![2.0]],
            edges: vec![[0, 1]],
            labels: vec![1.0],
        };
        let batcher = GraphBatcher::<TestBackend>::new(Default::default(), 1, 1);
        let batch = batcher.batch(vec![item]);

        // both degrees are 2 with self-loops, so every entry is 1/2
        let values = batch.adjacency.into_data().to_vec::<f32>().unwrap();
        for value in values {
            assert!((value - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn load_materializes_and_reuses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        let destination = dir.path().join("destination");
        fs::create_dir_all(&source).unwrap();

        for i in 0..3 {
            let file = File::create(source.join(format!("part_{i}.json"))).unwrap();
            serde_json::to_writer(file, &graph(2, (i % 2) as f32)).unwrap();
        }

        let loaded = PartGraphDataset::load(&source, &destination).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.feature_dim(), 2);
        assert_eq!(loaded.class_count(), 3);
        assert!(destination.join(CACHE_FILE).is_file());

        // second load comes from the cache even without the source
        fs::remove_dir_all(&source).unwrap();
        let cached = PartGraphDataset::load(&source, &destination).unwrap();
        assert_eq!(cached.len(), 3);
    }
}
