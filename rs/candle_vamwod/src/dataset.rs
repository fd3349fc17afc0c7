//! Webpage screenshot dataset
//!
//! A data directory holds, for every sample id `x`, the screenshot `x.png` and
//! its box metadata `x.json`, plus a `splits.json` listing the ids of each
//! split. Samples of a batch are loaded in parallel on a rayon pool; the batch
//! is assembled only once every sample has loaded.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use clap::Args;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;
use webtools::{BackgroundCap, BoxBatch, ContextTable, SampleBoxes, SampleMeta, Split, Splits};

use crate::preprocess::preprocess_image;

/// Data loading options shared by the train and eval subcommands
#[derive(Args, Debug, Clone)]
pub struct DataArgs {
    /// Directory with `<id>.png` / `<id>.json` samples.
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Split lists; defaults to `<data_dir>/splits.json`.
    #[arg(long)]
    pub splits: Option<PathBuf>,

    /// Maximum number of background boxes per training sample, -1 keeps all.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub background_cap: i64,

    /// Number of sample-loading threads.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Seed for batch order and background sampling.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl DataArgs {
    pub fn splits_path(&self) -> PathBuf {
        self.splits
            .clone()
            .unwrap_or_else(|| self.data_dir.join("splits.json"))
    }

    pub fn load_splits(&self) -> anyhow::Result<Splits> {
        Ok(Splits::load(&self.splits_path())?)
    }
}

/// One loaded sample, boxes already in model input coordinates
#[derive(Debug)]
pub struct Sample {
    pub id: String,
    /// Image tensor [3, img_size, img_size]
    pub image: Tensor,
    pub boxes: SampleBoxes,
}

/// Reads single samples of one split from disk.
#[derive(Debug, Clone)]
pub struct SampleLoader {
    root: PathBuf,
    split: Split,
    cap: BackgroundCap,
    img_size: usize,
    normalize_input: bool,
    device: Device,
}

impl SampleLoader {
    /// Fails if `cap` is a positive cap on an evaluation split.
    pub fn new(
        root: &Path,
        split: Split,
        cap: BackgroundCap,
        img_size: usize,
        normalize_input: bool,
        device: &Device,
    ) -> anyhow::Result<Self> {
        cap.check_split(split)?;
        Ok(Self {
            root: root.to_path_buf(),
            split,
            cap,
            img_size,
            normalize_input,
            device: device.clone(),
        })
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Image and metadata paths of sample `id`
    pub fn paths(&self, id: &str) -> (PathBuf, PathBuf) {
        (
            self.root.join(format!("{id}.png")),
            self.root.join(format!("{id}.json")),
        )
    }

    pub fn load<R: Rng + ?Sized>(&self, id: &str, rng: &mut R) -> anyhow::Result<Sample> {
        let (image_path, meta_path) = self.paths(id);
        self.load_paths(id, &image_path, &meta_path, rng)
    }

    /// Load a sample from explicit paths, e.g. for prediction outside a data dir.
    pub fn load_paths<R: Rng + ?Sized>(
        &self,
        id: &str,
        image_path: &Path,
        meta_path: &Path,
        rng: &mut R,
    ) -> anyhow::Result<Sample> {
        let boxes = SampleMeta::load(meta_path)?.into_sample_boxes(id, self.cap, rng)?;
        let prepared = preprocess_image(image_path, self.img_size, self.normalize_input, &self.device)?;
        let (sx, sy) = prepared.box_scale(self.img_size);
        debug!(
            "sample {id}: {} boxes, {} background",
            boxes.len(),
            boxes.num_background()
        );
        Ok(Sample {
            id: id.to_string(),
            image: prepared.tensor,
            boxes: boxes.scaled(sx, sy),
        })
    }
}

/// Model inputs for one batch
#[derive(Debug)]
pub struct Batch {
    pub ids: Vec<String>,
    /// [B, 3, S, S]
    pub images: Tensor,
    /// Rows of `[owner, x1, y1, x2, y2]`, [N, 5] (f32)
    pub boxes: Tensor,
    /// [N] (u32)
    pub labels: Tensor,
    pub context: ContextTable,
    pub box_batch: BoxBatch,
}

/// Stack images and flatten the samples' boxes into one owner-tagged batch.
pub fn collate(samples: &[Sample], n_context: usize, device: &Device) -> anyhow::Result<Batch> {
    if samples.is_empty() {
        anyhow::bail!("cannot collate an empty batch");
    }
    let images: Vec<&Tensor> = samples.iter().map(|s| &s.image).collect();
    let images = Tensor::stack(&images, 0)?.to_device(device)?;

    let box_batch = BoxBatch::collate(samples.iter().map(|s| &s.boxes));
    let n = box_batch.len();
    let rows: Vec<f32> = box_batch.rows().into_iter().flatten().collect();
    let boxes = Tensor::from_vec(rows, (n, 5), device)?;
    let labels = Tensor::from_slice(box_batch.labels(), n, device)?;
    let context = ContextTable::nearest(&box_batch, n_context)?;

    Ok(Batch {
        ids: samples.iter().map(|s| s.id.clone()).collect(),
        images,
        boxes,
        labels,
        context,
        box_batch,
    })
}

#[derive(Debug, Clone, Copy)]
enum RngPurpose {
    Order = 0,
    Sample = 1,
}

/// Batched access to one split
pub struct WebDataset {
    loader: SampleLoader,
    ids: Vec<String>,
    batch_size: usize,
    n_context: usize,
    seed: u64,
    pool: rayon::ThreadPool,
}

impl WebDataset {
    pub fn new(
        loader: SampleLoader,
        ids: Vec<String>,
        batch_size: usize,
        n_context: usize,
        seed: u64,
        workers: usize,
    ) -> anyhow::Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch size must be positive");
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()?;
        Ok(Self {
            loader,
            ids,
            batch_size,
            n_context,
            seed,
            pool,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.ids.len().div_ceil(self.batch_size)
    }

    /// Random source for `stream` of `epoch`. The seed, epoch, purpose and
    /// stream each own a separate part of the 256-bit key, so no two
    /// combinations share a generator.
    fn stream_rng(&self, epoch: usize, purpose: RngPurpose, stream: u64) -> StdRng {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&self.seed.to_le_bytes());
        key[8..16].copy_from_slice(&(epoch as u64).to_le_bytes());
        key[16..24].copy_from_slice(&(purpose as u64).to_le_bytes());
        key[24..].copy_from_slice(&stream.to_le_bytes());
        StdRng::from_seed(key)
    }

    /// Random source of sample `index` in `epoch`, independent of which
    /// thread loads it.
    fn sample_rng(&self, epoch: usize, index: usize) -> StdRng {
        self.stream_rng(epoch, RngPurpose::Sample, index as u64)
    }

    /// Sample indices of every batch of `epoch`. Training order is reshuffled
    /// each epoch; evaluation splits keep file order.
    pub fn batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.ids.len()).collect();
        if self.loader.split() == Split::Train {
            let mut rng = self.stream_rng(epoch, RngPurpose::Order, 0);
            order.shuffle(&mut rng);
        }
        order.chunks(self.batch_size).map(|c| c.to_vec()).collect()
    }

    /// Load the given samples in parallel, then assemble them.
    pub fn load_batch(&self, epoch: usize, indices: &[usize]) -> anyhow::Result<Batch> {
        let samples: Vec<Sample> = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&i| {
                    let id = self
                        .ids
                        .get(i)
                        .ok_or_else(|| anyhow::anyhow!("sample index {i} out of range"))?;
                    let mut rng = self.sample_rng(epoch, i);
                    self.loader.load(id, &mut rng)
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })?;
        collate(&samples, self.n_context, self.loader.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use webtools::GT_LABELS;

    /// Writes a 40x20 screenshot with three ground-truth and `n_bg`
    /// background boxes.
    fn write_sample(dir: &Path, id: &str, n_bg: usize) {
        RgbImage::from_pixel(40, 20, Rgb([200, 200, 200]))
            .save(dir.join(format!("{id}.png")))
            .unwrap();
        let meta = SampleMeta {
            gt_boxes: vec![[0.0, 0.0, 10.0, 5.0], [10.0, 0.0, 10.0, 5.0], [20.0, 10.0, 20.0, 10.0]],
            other_boxes: (0..n_bg).map(|i| [i as f32, 5.0, 4.0, 4.0]).collect(),
        };
        std::fs::write(
            dir.join(format!("{id}.json")),
            serde_json::to_string(&meta).unwrap(),
        )
        .unwrap();
    }

    fn loader(dir: &Path, split: Split, cap: BackgroundCap) -> SampleLoader {
        SampleLoader::new(dir, split, cap, 16, false, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_load_scales_boxes_to_input_size() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", 2);
        let loader = loader(dir.path(), Split::Val, BackgroundCap::Unlimited);

        let sample = loader.load("a", &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(sample.image.dims(), &[3, 16, 16]);
        assert_eq!(sample.boxes.labels, vec![1, 2, 3, 0, 0]);
        // 40x20 -> 16x16: sx = 0.4, sy = 0.8
        let third = sample.boxes.boxes[2].to_array();
        assert!((third[0] - 8.0).abs() < 1e-5 && (third[3] - 16.0).abs() < 1e-5);
    }

    #[test]
    fn test_cap_applies_to_train_only() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", 10);

        let train = loader(dir.path(), Split::Train, BackgroundCap::AtMost(4));
        let sample = train.load("a", &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(sample.boxes.num_background(), 4);
        assert_eq!(&sample.boxes.labels[..3], &GT_LABELS);

        assert!(SampleLoader::new(
            dir.path(),
            Split::Test,
            BackgroundCap::AtMost(4),
            16,
            false,
            &Device::Cpu
        )
        .is_err());
    }

    #[test]
    fn test_missing_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path(), Split::Val, BackgroundCap::Unlimited);
        assert!(loader.load("missing", &mut StdRng::seed_from_u64(0)).is_err());

        // Metadata present, image missing
        write_sample(dir.path(), "b", 1);
        std::fs::remove_file(dir.path().join("b.png")).unwrap();
        assert!(loader.load("b", &mut StdRng::seed_from_u64(0)).is_err());
    }

    #[test]
    fn test_collate_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", 2);
        write_sample(dir.path(), "b", 0);
        let loader = loader(dir.path(), Split::Val, BackgroundCap::Unlimited);
        let mut rng = StdRng::seed_from_u64(0);
        let samples = vec![
            loader.load("a", &mut rng).unwrap(),
            loader.load("b", &mut rng).unwrap(),
        ];

        let batch = collate(&samples, 3, &Device::Cpu).unwrap();
        assert_eq!(batch.images.dims(), &[2, 3, 16, 16]);
        assert_eq!(batch.boxes.dims(), &[8, 5]);
        assert_eq!(batch.labels.to_vec1::<u32>().unwrap(), vec![1, 2, 3, 0, 0, 1, 2, 3]);
        assert_eq!(batch.context.n_boxes(), 8);
        batch.context.validate(batch.box_batch.owners()).unwrap();

        let owners: Vec<f32> = batch.boxes.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(owners, vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_dataset_batches_are_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<String> = (0..5).map(|i| format!("s{i}")).collect();
        for id in &ids {
            write_sample(dir.path(), id, 6);
        }
        let make = || {
            let loader = loader(dir.path(), Split::Train, BackgroundCap::AtMost(2));
            WebDataset::new(loader, ids.clone(), 2, 4, 7, 2).unwrap()
        };
        let (a, b) = (make(), make());
        assert_eq!(a.num_batches(), 3);
        assert_eq!(a.batches(0), b.batches(0));

        let mut seen: Vec<usize> = a.batches(1).concat();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        let first = &a.batches(0)[0];
        let batch_a = a.load_batch(0, first).unwrap();
        let batch_b = b.load_batch(0, first).unwrap();
        assert_eq!(batch_a.box_batch, batch_b.box_batch);
        assert_eq!(batch_a.box_batch.len(), 2 * (3 + 2));
    }

    #[test]
    fn test_seed_and_epoch_do_not_alias() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<String> = (0..12).map(|i| format!("s{i}")).collect();
        let with_seed = |seed| {
            let loader = loader(dir.path(), Split::Train, BackgroundCap::Unlimited);
            WebDataset::new(loader, ids.clone(), 12, 4, seed, 1).unwrap()
        };
        let (zero, one) = (with_seed(0), with_seed(1));

        assert_ne!(zero.batches(1), one.batches(0));
        assert_ne!(zero.batches(0), zero.batches(1));

        let draw = |rng: &mut StdRng| rng.random::<u64>();
        assert_ne!(draw(&mut zero.sample_rng(1, 0)), draw(&mut one.sample_rng(0, 0)));
        assert_ne!(draw(&mut zero.sample_rng(0, 1)), draw(&mut zero.sample_rng(1, 0)));
        assert_ne!(
            draw(&mut zero.stream_rng(0, RngPurpose::Order, 0)),
            draw(&mut zero.sample_rng(0, 0))
        );
        assert_eq!(draw(&mut zero.sample_rng(3, 5)), draw(&mut with_seed(0).sample_rng(3, 5)));
    }

    #[test]
    fn test_eval_order_is_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path(), Split::Val, BackgroundCap::Unlimited);
        let ids: Vec<String> = (0..3).map(|i| format!("s{i}")).collect();
        let dataset = WebDataset::new(loader, ids, 1, 4, 0, 1).unwrap();
        assert_eq!(dataset.batches(5), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_failed_sample_fails_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "ok", 1);
        let loader = loader(dir.path(), Split::Val, BackgroundCap::Unlimited);
        let dataset =
            WebDataset::new(loader, vec!["ok".into(), "gone".into()], 2, 4, 0, 2).unwrap();
        assert!(dataset.load_batch(0, &[0, 1]).is_err());
    }
}
