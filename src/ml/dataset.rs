//! 画像フォルダからのデータ供給
//!
//! ルートディレクトリ直下のサブディレクトリ名をクラス名として画像を収集し、
//! 学習用・検証用のデータローダーと量子化用の代表データを作ります。

use anyhow::{Context, Result};
use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    tensor::{backend::Backend, Int, Tensor},
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::ml::ml_model::load_image_with_size;

/// 学習に使う画像の拡張子
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

/// クラスごとのディレクトリに分かれた画像の一覧
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    class_names: Vec<String>,
    /// クラスIDごとの画像パス（ソート済み）
    files: Vec<Vec<PathBuf>>,
}

impl ImageFolder {
    /// ディレクトリを走査する
    ///
    /// クラス名・ファイル名ともに辞書順に並べる。画像が1枚もないクラスは
    /// その時点でエラーにする。
    pub fn scan(root: &Path) -> Result<Self> {
        let mut class_dirs = Vec::new();
        for entry in std::fs::read_dir(root)
            .with_context(|| format!("データセットを開けません: {}", root.display()))?
        {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow::anyhow!("Invalid directory name: {}", path.display()))?
                .to_string();
            if name.starts_with('.') {
                continue;
            }
            class_dirs.push((name, path));
        }

        if class_dirs.is_empty() {
            return Err(PipelineError::EmptyDataset(root.to_path_buf()).into());
        }
        class_dirs.sort();

        let mut class_names = Vec::with_capacity(class_dirs.len());
        let mut files = Vec::with_capacity(class_dirs.len());
        for (name, dir) in class_dirs {
            let mut images = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if is_image(&path) {
                    images.push(path);
                }
            }
            if images.is_empty() {
                return Err(PipelineError::EmptyClass { class: name }.into());
            }
            images.sort();

            log::info!("  クラス '{}': {} 枚", name, images.len());
            class_names.push(name);
            files.push(images);
        }

        Ok(Self {
            root: root.to_path_buf(),
            class_names,
            files,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// 全画像数
    pub fn len(&self) -> usize {
        self.files.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// クラス数がモデルの出力数と一致するか確認
    pub fn ensure_class_count(&self, expected: usize) -> Result<()> {
        if self.num_classes() != expected {
            return Err(PipelineError::ClassCountMismatch {
                expected,
                found: self.num_classes(),
            }
            .into());
        }
        Ok(())
    }

    /// ラベルファイルを書き出す（1行1クラス、辞書順）
    pub fn write_labels(&self, path: &Path) -> Result<()> {
        let mut content = self.class_names.join("\n");
        content.push('\n');
        std::fs::write(path, content)
            .with_context(|| format!("ラベルファイルを書き込めません: {}", path.display()))?;
        Ok(())
    }

    /// 学習用と検証用に分割
    ///
    /// クラスごとにソート済みの先頭 `floor(split * n)` 枚を検証用、残りを学習用にする。
    pub fn split(&self, validation_split: f32) -> Result<(ImageDataset, ImageDataset)> {
        if !(0.0..1.0).contains(&validation_split) {
            return Err(PipelineError::InvalidSplit(validation_split).into());
        }

        let mut train = Vec::new();
        let mut valid = Vec::new();
        for (label, images) in self.files.iter().enumerate() {
            let val_len = (validation_split * images.len() as f32).floor() as usize;
            let (val_images, train_images) = images.split_at(val_len);
            valid.extend(val_images.iter().map(|path| (path.clone(), label)));
            train.extend(train_images.iter().map(|path| (path.clone(), label)));
        }

        Ok((ImageDataset::new(train), ImageDataset::new(valid)))
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// 画像パスとクラスIDの組のリスト
#[derive(Debug, Clone)]
pub struct ImageDataset {
    samples: Vec<(PathBuf, usize)>,
}

impl ImageDataset {
    pub fn new(samples: Vec<(PathBuf, usize)>) -> Self {
        Self { samples }
    }

    /// 代表データ用に画像パスを `count` 回抽出（重複あり）
    pub fn sample_paths(&self, count: usize, seed: u64) -> Vec<PathBuf> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..count)
            .filter_map(|_| self.samples.choose(&mut rng))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let (path, label) = self.samples.get(index)?;
        Some(ImageItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// 代表データを読み込む（学習時と同じ前処理）
pub fn load_representative(paths: &[PathBuf], image_size: usize) -> Result<Vec<Vec<f32>>> {
    paths
        .iter()
        .map(|path| load_image_with_size(path, image_size))
        .collect()
}

/// 1エポックあたりのバッチ数
pub fn batches_per_epoch(num_items: usize, batch_size: usize) -> usize {
    num_items.div_ceil(batch_size)
}

/// バッチャー
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    num_classes: usize,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, image_size: usize, num_classes: usize) -> Self {
        Self {
            device,
            image_size,
            num_classes,
        }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut one_hot = vec![0.0f32; batch_size * self.num_classes];
        let mut targets_vec = Vec::with_capacity(batch_size);

        for (i, item) in items.into_iter().enumerate() {
            match load_image_with_size(&item.path, size) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    log::warn!("画像読み込み失敗 {}: {:#}", item.path.display(), e);
                    // エラーの場合はゼロで埋める
                    all_pixels.extend(std::iter::repeat(0.0f32).take(3 * size * size));
                }
            }
            one_hot[i * self.num_classes + item.label] = 1.0;
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let labels = Tensor::<B, 1>::from_floats(one_hot.as_slice(), &self.device)
            .reshape([batch_size, self.num_classes]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        ImageBatch {
            images,
            labels,
            targets,
        }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// [batch_size, 3, size, size]、値は [0, 1]
    pub images: Tensor<B, 4>,
    /// one-hot ラベル [batch_size, num_classes]
    pub labels: Tensor<B, 2>,
    /// クラスID [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// データローダーを作成
///
/// 何度 `iter()` を呼んでも先頭から読み直すため、エポックごとに再利用できる。
/// `shuffle_seed` を指定するとエポックごとに順序を入れ替える。
pub fn build_loader<B: Backend>(
    dataset: ImageDataset,
    batcher: ImageBatcher<B>,
    batch_size: usize,
    shuffle_seed: Option<u64>,
) -> Arc<dyn DataLoader<B, ImageBatch<B>>> {
    let builder = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .num_workers(0);
    match shuffle_seed {
        Some(seed) => builder.shuffle(seed).build(dataset),
        None => builder.build(dataset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{scratch_dir, write_image_folder};
    use burn::tensor::ElementConversion;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    const CLASSES: [(&str, usize); 6] = [
        ("trash", 10),
        ("cardboard", 10),
        ("glass", 10),
        ("metal", 10),
        ("paper", 10),
        ("plastic", 10),
    ];

    #[test]
    fn test_scan_sorts_classes_and_writes_labels() {
        let dir = scratch_dir("dataset_labels");
        write_image_folder(&dir, &CLASSES, 8);
        std::fs::write(dir.join("README.txt"), "not a class").unwrap();
        std::fs::write(dir.join("glass").join("notes.txt"), "not an image").unwrap();

        let folder = ImageFolder::scan(&dir).unwrap();
        assert_eq!(
            folder.class_names(),
            &["cardboard", "glass", "metal", "paper", "plastic", "trash"]
        );
        assert_eq!(folder.len(), 60);

        let labels_path = dir.join("labels.txt");
        folder.write_labels(&labels_path).unwrap();
        let content = std::fs::read_to_string(&labels_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        let mut sorted = lines.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(lines, sorted);
        assert_eq!(lines, folder.class_names());
    }

    #[test]
    fn test_empty_class_is_error() {
        let dir = scratch_dir("dataset_empty_class");
        write_image_folder(&dir, &[("glass", 2)], 8);
        std::fs::create_dir_all(dir.join("metal")).unwrap();

        let err = ImageFolder::scan(&dir).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::EmptyClass { class }) => assert_eq!(class, "metal"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_class_count_mismatch() {
        let dir = scratch_dir("dataset_mismatch");
        write_image_folder(&dir, &CLASSES[..5], 8);

        let folder = ImageFolder::scan(&dir).unwrap();
        assert!(folder.ensure_class_count(5).is_ok());
        let err = folder.ensure_class_count(6).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ClassCountMismatch {
                expected: 6,
                found: 5
            })
        ));
    }

    #[test]
    fn test_split_and_batch_counts() {
        let dir = scratch_dir("dataset_split");
        write_image_folder(&dir, &CLASSES, 8);
        let folder = ImageFolder::scan(&dir).unwrap();

        let (train, valid) = folder.split(0.1).unwrap();
        assert_eq!(train.len(), 54);
        assert_eq!(valid.len(), 6);
        assert!(folder.split(1.0).is_err());

        let device = Default::default();
        let batch_size = 4;
        let train_loader = build_loader::<TestBackend>(
            train,
            ImageBatcher::new(device, 8, 6),
            batch_size,
            Some(42),
        );
        let valid_loader = build_loader::<TestBackend>(
            valid,
            ImageBatcher::new(device, 8, 6),
            batch_size,
            None,
        );

        assert_eq!(train_loader.iter().count(), batches_per_epoch(54, batch_size));
        assert_eq!(valid_loader.iter().count(), batches_per_epoch(6, batch_size));
        // 2回目のパスも同じ数のバッチを返す
        assert_eq!(train_loader.iter().count(), 14);
        assert_eq!(valid_loader.iter().count(), 2);
    }

    #[test]
    fn test_batch_invariants() {
        let dir = scratch_dir("dataset_batch");
        write_image_folder(&dir, &CLASSES, 12);
        let folder = ImageFolder::scan(&dir).unwrap();
        let (train, _) = folder.split(0.1).unwrap();

        let device = Default::default();
        let loader = build_loader::<TestBackend>(train, ImageBatcher::new(device, 16, 6), 8, Some(1));

        for batch in loader.iter() {
            let [n, c, h, w] = batch.images.dims();
            assert_eq!((c, h, w), (3, 16, 16));
            assert_eq!(batch.labels.dims(), [n, 6]);

            let min = batch.images.clone().min().into_scalar().elem::<f32>();
            let max = batch.images.clone().max().into_scalar().elem::<f32>();
            assert!(min >= 0.0 && max <= 1.0);

            // 各行がちょうど1つの1を持つ
            let row_sums = batch.labels.clone().sum_dim(1).into_data().convert::<f32>();
            assert!(row_sums.to_vec::<f32>().unwrap().iter().all(|s| *s == 1.0));
            let ones = batch.labels.clone().equal_elem(1.0).int().sum();
            assert_eq!(ones.into_scalar().elem::<i64>(), n as i64);

            // one-hot とクラスIDが一致する
            let argmax = batch.labels.argmax(1).reshape([n]);
            let matches = argmax.equal(batch.targets).int().sum();
            assert_eq!(matches.into_scalar().elem::<i64>(), n as i64);
        }
    }

    #[test]
    fn test_sample_paths_is_seeded() {
        let dir = scratch_dir("dataset_sample");
        write_image_folder(&dir, &CLASSES, 8);
        let folder = ImageFolder::scan(&dir).unwrap();
        let (train, _) = folder.split(0.1).unwrap();

        let a = train.sample_paths(100, 7);
        let b = train.sample_paths(100, 7);
        assert_eq!(a.len(), 100);
        assert_eq!(a, b);

        let samples = load_representative(&a[..3], 8).unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.len() == 3 * 8 * 8));
    }
}
