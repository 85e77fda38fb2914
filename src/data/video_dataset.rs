/// Per-video feature/label dataset loaded from a directory of `.npz` archives
///
/// Every archive holds one video sample:
/// - `relu6`: visual features `[T, D]`
/// - `label`: raw tIoU per timestep and anchor `[T, K]`
use candle_core::Tensor;
use ndarray::Array2;
use ndarray_npy::NpzReader;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::config::ComputeContext;
use crate::SSTError;

/// Archive entry holding the visual features
pub const FEATURE_KEY: &str = "relu6";
/// Archive entry holding the raw tIoU ground truth
pub const LABEL_KEY: &str = "label";

const SAMPLE_EXTENSION: &str = "npz";

/// Project raw tIoU scores onto {0, 1}: 1 iff `v >= threshold`
pub fn binarize_labels(raw: &Array2<f64>, threshold: f64) -> Array2<f64> {
    raw.mapv(|v| if v >= threshold { 1.0 } else { 0.0 })
}

/// Read one 2D array from an archive, accepting f64 or f32 storage
fn read_array(npz: &mut NpzReader<File>, names: &[String], key: &str, path: &Path) -> crate::Result<Array2<f64>> {
    let name = names
        .iter()
        .find(|n| n.as_str() == key || n.strip_suffix(".npy") == Some(key))
        .ok_or_else(|| {
            SSTError::DataIntegrity(format!("{} has no '{}' array", path.display(), key))
        })?;

    match npz.by_name::<ndarray::OwnedRepr<f64>, ndarray::Ix2>(name) {
        Ok(array) => Ok(array),
        Err(f64_err) => match npz.by_name::<ndarray::OwnedRepr<f32>, ndarray::Ix2>(name) {
            Ok(array) => Ok(array.mapv(f64::from)),
            Err(_) => Err(f64_err.into()),
        },
    }
}

/// Load the (features, raw labels) pair stored in one archive
pub fn read_sample<P: AsRef<Path>>(path: P) -> crate::Result<(Array2<f64>, Array2<f64>)> {
    let path = path.as_ref();
    let mut npz = NpzReader::new(File::open(path)?)?;
    let names = npz.names()?;

    let features = read_array(&mut npz, &names, FEATURE_KEY, path)?;
    let labels = read_array(&mut npz, &names, LABEL_KEY, path)?;

    Ok((features, labels))
}

/// Dataset of equally shaped video samples with binarized labels
#[derive(Debug, Clone)]
pub struct VideoDataset {
    features: Vec<Array2<f64>>, // N x [T, D]
    labels: Vec<Array2<f64>>,   // N x [T, K], values in {0, 1}
    sources: Vec<PathBuf>,
    seq_len: usize,
    feature_dim: usize,
    num_proposals: usize,
}

impl VideoDataset {
    /// Build from in-memory samples
    ///
    /// Fails with a data integrity error if any sample's feature and label
    /// row counts disagree, or if samples differ in T, D or K.
    pub fn from_samples(
        features: Vec<Array2<f64>>,
        raw_labels: Vec<Array2<f64>>,
        tiou_threshold: f64,
    ) -> crate::Result<Self> {
        if features.len() != raw_labels.len() {
            return Err(SSTError::DataIntegrity(format!(
                "{} feature matrices but {} label matrices",
                features.len(),
                raw_labels.len()
            )));
        }

        let (seq_len, feature_dim, num_proposals) = match (features.first(), raw_labels.first()) {
            (Some(f), Some(l)) => (f.nrows(), f.ncols(), l.ncols()),
            _ => (0, 0, 0),
        };

        for (i, (feat, gt)) in features.iter().zip(raw_labels.iter()).enumerate() {
            if feat.nrows() != gt.nrows() {
                return Err(SSTError::DataIntegrity(format!(
                    "sample {}: {} feature rows but {} label rows",
                    i,
                    feat.nrows(),
                    gt.nrows()
                )));
            }

            if feat.nrows() != seq_len || feat.ncols() != feature_dim || gt.ncols() != num_proposals {
                return Err(SSTError::DataIntegrity(format!(
                    "sample {}: shape features {:?} / labels {:?} differs from [{}, {}] / [{}, {}]",
                    i,
                    feat.shape(),
                    gt.shape(),
                    seq_len,
                    feature_dim,
                    seq_len,
                    num_proposals
                )));
            }
        }

        let labels = raw_labels
            .iter()
            .map(|gt| binarize_labels(gt, tiou_threshold))
            .collect();

        Ok(Self {
            features,
            labels,
            sources: Vec::new(),
            seq_len,
            feature_dim,
            num_proposals,
        })
    }

    /// Load every `.npz` archive in `dir`, in file name order
    pub fn from_directory<P: AsRef<Path>>(dir: P, tiou_threshold: f64) -> crate::Result<Self> {
        let dir = dir.as_ref();

        log::info!("Loading video samples from: {:?}", dir);

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|s| s.to_str()) != Some(SAMPLE_EXTENSION) {
                log::debug!("Skipping non-sample file {:?}", path);
                continue;
            }
            paths.push(path);
        }
        paths.sort();

        log::info!("Number of samples: {}", paths.len());

        let report_every = (paths.len() / 10).max(1);
        let mut features = Vec::with_capacity(paths.len());
        let mut raw_labels = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            let (feat, gt) = read_sample(path)?;

            if feat.nrows() != gt.nrows() {
                return Err(SSTError::DataIntegrity(format!(
                    "{}: {} feature rows but {} label rows",
                    path.display(),
                    feat.nrows(),
                    gt.nrows()
                )));
            }

            features.push(feat);
            raw_labels.push(gt);

            if (i + 1) % report_every == 0 || i + 1 == paths.len() {
                log::info!("Read {}/{} samples", i + 1, paths.len());
            }
        }

        let mut dataset = Self::from_samples(features, raw_labels, tiou_threshold)?;
        dataset.sources = paths;

        log::info!(
            "Dataset loaded: {} samples, seq_len={}, feature_dim={}, num_proposals={}",
            dataset.len(),
            dataset.seq_len,
            dataset.feature_dim,
            dataset.num_proposals
        );

        Ok(dataset)
    }

    /// Get number of samples
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn num_proposals(&self) -> usize {
        self.num_proposals
    }

    /// Binarized label matrices, one per sample
    pub fn labels(&self) -> &[Array2<f64>] {
        &self.labels
    }

    pub fn features(&self) -> &[Array2<f64>] {
        &self.features
    }

    /// Files the samples were read from (empty for in-memory datasets)
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Stack the selected samples into `[N, T, D]` features and `[N, T, K]` labels
    pub fn batch(&self, indices: &[usize], ctx: &ComputeContext) -> crate::Result<(Tensor, Tensor)> {
        let n = indices.len();
        let mut feature_data = Vec::with_capacity(n * self.seq_len * self.feature_dim);
        let mut label_data = Vec::with_capacity(n * self.seq_len * self.num_proposals);

        for &idx in indices {
            let (feat, gt) = match (self.features.get(idx), self.labels.get(idx)) {
                (Some(f), Some(l)) => (f, l),
                _ => {
                    return Err(SSTError::Precondition(format!(
                        "sample index {} out of range for {} samples",
                        idx,
                        self.len()
                    )))
                }
            };
            feature_data.extend(feat.iter().copied());
            label_data.extend(gt.iter().copied());
        }

        let features = Tensor::from_vec(feature_data, (n, self.seq_len, self.feature_dim), &ctx.device)?
            .to_dtype(ctx.dtype)?;
        let labels = Tensor::from_vec(label_data, (n, self.seq_len, self.num_proposals), &ctx.device)?
            .to_dtype(ctx.dtype)?;

        Ok((features, labels))
    }
}

/// Fixed-size minibatch iterator over a VideoDataset
///
/// Trailing samples that do not fill a whole batch are dropped.
pub struct VideoDataLoader<'a> {
    dataset: &'a VideoDataset,
    batch_size: usize,
    current_batch: usize,
    indices: Vec<usize>,
    shuffle: bool,
    rng: StdRng,
}

impl<'a> VideoDataLoader<'a> {
    /// Create new data loader
    ///
    /// `seed` makes the shuffling order reproducible.
    pub fn new(dataset: &'a VideoDataset, batch_size: usize, shuffle: bool, seed: Option<u64>) -> crate::Result<Self> {
        if batch_size == 0 {
            return Err(SSTError::Config("batch_size must be > 0".to_string()));
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut loader = Self {
            dataset,
            batch_size,
            current_batch: 0,
            indices: (0..dataset.len()).collect(),
            shuffle,
            rng,
        };
        if shuffle {
            loader.indices.shuffle(&mut loader.rng);
        }

        Ok(loader)
    }

    /// Indices of every batch for the current epoch order
    pub fn batch_indices(&self) -> impl Iterator<Item = &[usize]> {
        self.indices.chunks_exact(self.batch_size)
    }

    /// Number of samples left out of every epoch
    pub fn num_dropped(&self) -> usize {
        self.dataset.len() % self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Get dataset reference
    pub fn dataset(&self) -> &VideoDataset {
        self.dataset
    }
}

impl super::BatchDataLoader for VideoDataLoader<'_> {
    fn next_batch(&mut self, ctx: &ComputeContext) -> crate::Result<Option<(Tensor, Tensor)>> {
        if self.current_batch >= self.num_batches() {
            return Ok(None);
        }

        let start = self.current_batch * self.batch_size;
        let batch = self.dataset.batch(&self.indices[start..start + self.batch_size], ctx)?;
        self.current_batch += 1;

        Ok(Some(batch))
    }

    fn reset(&mut self) {
        self.current_batch = 0;

        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    fn num_batches(&self) -> usize {
        self.dataset.len() / self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BatchDataLoader;
    use ndarray::{array, Array2};
    use ndarray_npy::NpzWriter;

    fn uniform_dataset(n: usize, seq_len: usize, dim: usize, k: usize) -> VideoDataset {
        let features = (0..n).map(|i| Array2::from_elem((seq_len, dim), i as f64)).collect();
        let labels = (0..n).map(|_| Array2::zeros((seq_len, k))).collect();
        VideoDataset::from_samples(features, labels, 0.5).unwrap()
    }

    fn write_sample(path: &Path, feat: &Array2<f64>, gt: &Array2<f64>) {
        let mut npz = NpzWriter::new(File::create(path).unwrap());
        npz.add_array(FEATURE_KEY, feat).unwrap();
        npz.add_array(LABEL_KEY, gt).unwrap();
        npz.finish().unwrap();
    }

    #[test]
    fn test_binarize_threshold_inclusive() {
        let raw = array![[0.3, 0.5, 0.7]];
        assert_eq!(binarize_labels(&raw, 0.5), array![[0.0, 1.0, 1.0]]);

        let raw = array![[0.0, 0.49999, 1.0]];
        assert_eq!(binarize_labels(&raw, 0.5), array![[0.0, 0.0, 1.0]]);
    }

    #[test]
    fn test_row_count_mismatch_is_rejected() {
        let features = vec![Array2::zeros((10, 4))];
        let labels = vec![Array2::zeros((9, 2))];

        let result = VideoDataset::from_samples(features, labels, 0.5);
        assert!(matches!(result, Err(SSTError::DataIntegrity(_))));
    }

    #[test]
    fn test_differing_timesteps_across_samples_rejected() {
        let features = vec![Array2::zeros((10, 4)), Array2::zeros((12, 4))];
        let labels = vec![Array2::zeros((10, 2)), Array2::zeros((12, 2))];

        let result = VideoDataset::from_samples(features, labels, 0.5);
        assert!(matches!(result, Err(SSTError::DataIntegrity(_))));
    }

    #[test]
    fn test_full_batch_drops_nothing() -> crate::Result<()> {
        let dataset = uniform_dataset(64, 128, 500, 32);
        let ctx = ComputeContext::cpu();
        let mut loader = VideoDataLoader::new(&dataset, 64, true, Some(7))?;

        assert_eq!(loader.num_batches(), 1);
        assert_eq!(loader.num_dropped(), 0);

        let (x, y) = loader.next_batch(&ctx)?.expect("one batch");
        assert_eq!(x.dims(), &[64, 128, 500]);
        assert_eq!(y.dims(), &[64, 128, 32]);
        assert!(loader.next_batch(&ctx)?.is_none());

        Ok(())
    }

    #[test]
    fn test_partial_batch_is_dropped() -> crate::Result<()> {
        let dataset = uniform_dataset(64, 128, 500, 32);
        let ctx = ComputeContext::cpu();
        let mut loader = VideoDataLoader::new(&dataset, 50, false, None)?;

        assert_eq!(loader.num_batches(), 1);
        assert_eq!(loader.num_dropped(), 14);

        let (x, _) = loader.next_batch(&ctx)?.expect("one batch");
        assert_eq!(x.dim(0)?, 50);
        assert!(loader.next_batch(&ctx)?.is_none());

        Ok(())
    }

    #[test]
    fn test_unshuffled_order_and_reset() -> crate::Result<()> {
        let dataset = uniform_dataset(6, 2, 1, 1);
        let ctx = ComputeContext::cpu();
        let mut loader = VideoDataLoader::new(&dataset, 2, false, None)?;

        let mut firsts = Vec::new();
        while let Some((x, _)) = loader.next_batch(&ctx)? {
            firsts.extend(x.flatten_all()?.to_vec1::<f64>()?);
        }
        assert_eq!(firsts, vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 5.0, 5.0]);

        loader.reset();
        assert!(loader.next_batch(&ctx)?.is_some());

        Ok(())
    }

    #[test]
    fn test_shuffle_is_permutation_and_seeded() -> crate::Result<()> {
        let dataset = uniform_dataset(10, 1, 1, 1);

        let a = VideoDataLoader::new(&dataset, 3, true, Some(42))?;
        let b = VideoDataLoader::new(&dataset, 3, true, Some(42))?;
        let batches_a: Vec<Vec<usize>> = a.batch_indices().map(|s| s.to_vec()).collect();
        let batches_b: Vec<Vec<usize>> = b.batch_indices().map(|s| s.to_vec()).collect();

        assert_eq!(batches_a.len(), 3);
        assert_eq!(batches_a, batches_b);

        let mut seen: Vec<usize> = batches_a.concat();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 9);

        Ok(())
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dataset = uniform_dataset(2, 1, 1, 1);
        assert!(matches!(
            VideoDataLoader::new(&dataset, 0, false, None),
            Err(SSTError::Config(_))
        ));
    }

    #[test]
    fn test_from_directory() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let feat = Array2::from_elem((4, 3), 1.5);
        let gt = array![[0.3, 0.9], [0.5, 0.1], [0.7, 0.0], [0.2, 0.6]];
        write_sample(&dir.path().join("video_b.npz"), &feat, &gt);
        write_sample(&dir.path().join("video_a.npz"), &(feat.clone() * 2.0), &gt);
        std::fs::write(dir.path().join("README.txt"), "not a sample")?;

        let dataset = VideoDataset::from_directory(dir.path(), 0.5)?;

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.seq_len(), 4);
        assert_eq!(dataset.feature_dim(), 3);
        assert_eq!(dataset.num_proposals(), 2);
        assert!(dataset.sources()[0].ends_with("video_a.npz"));
        assert_eq!(dataset.features()[0][[0, 0]], 3.0);
        assert_eq!(
            dataset.labels()[0],
            array![[0.0, 1.0], [1.0, 0.0], [1.0, 0.0], [0.0, 1.0]]
        );

        Ok(())
    }

    #[test]
    fn test_from_directory_accepts_f32_arrays() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let feat = Array2::<f32>::from_elem((2, 2), 0.25);
        let gt = Array2::<f32>::from_elem((2, 1), 0.75);
        let mut npz = NpzWriter::new(File::create(dir.path().join("v.npz"))?);
        npz.add_array(FEATURE_KEY, &feat).unwrap();
        npz.add_array(LABEL_KEY, &gt).unwrap();
        npz.finish().unwrap();

        let dataset = VideoDataset::from_directory(dir.path(), 0.5)?;
        assert_eq!(dataset.features()[0][[1, 1]], 0.25);
        assert_eq!(dataset.labels()[0][[0, 0]], 1.0);

        Ok(())
    }

    #[test]
    fn test_from_directory_fails_fast_on_mismatch() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        write_sample(&dir.path().join("good.npz"), &Array2::zeros((4, 3)), &Array2::zeros((4, 2)));
        write_sample(&dir.path().join("bad.npz"), &Array2::zeros((4, 3)), &Array2::zeros((5, 2)));

        let result = VideoDataset::from_directory(dir.path(), 0.5);
        assert!(matches!(result, Err(SSTError::DataIntegrity(_))));

        Ok(())
    }

    #[test]
    fn test_missing_array_is_data_integrity_error() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut npz = NpzWriter::new(File::create(dir.path().join("v.npz"))?);
        npz.add_array(FEATURE_KEY, &Array2::<f64>::zeros((2, 2))).unwrap();
        npz.finish().unwrap();

        let result = VideoDataset::from_directory(dir.path(), 0.5);
        assert!(matches!(result, Err(SSTError::DataIntegrity(_))));

        Ok(())
    }
}
