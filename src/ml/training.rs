//! 分類器の学習
//!
//! 各フェーズは burn の `Learner` で回す。フェーズのディレクトリには
//! チェックポイント (`checkpoint/model-<epoch>.mpk`) とエポックごとの
//! メトリクスログ (`train/`, `valid/`) が残り、学習履歴はそのログから組み立てる。

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoader,
    module::{AutodiffModule, Module},
    optim::AdamConfig,
    record::{BinBytesRecorder, FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
    train::{
        metric::{AccuracyMetric, LossMetric},
        renderer::{
            EvaluationName, EvaluationProgress, MetricState, MetricsRenderer,
            MetricsRendererEvaluation, MetricsRendererTraining, TrainingProgress,
        },
        ClassificationOutput, LearnerBuilder, LearnerSummary, LearningStrategy, MetricSummary,
        TrainOutput, TrainStep, ValidStep,
    },
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::ml::dataset::ImageBatch;
use crate::ml::ml_model::Classifier;

/// チェックポイントを置くサブディレクトリ
pub const CHECKPOINT_DIR: &str = "checkpoint";

const LOSS_METRIC: &str = "Loss";
const ACCURACY_METRIC: &str = "Accuracy";

/// TrainStep実装 (学習時の順伝播 + 逆伝播)
impl<B: AutodiffBackend> TrainStep<ImageBatch<B>, ClassificationOutput<B>> for Classifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_train_classification(batch.images, batch.targets);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> ValidStep<ImageBatch<B>, ClassificationOutput<B>> for Classifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

/// 1エポック分の集計値（正解率は 0..=1）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
}

impl std::fmt::Display for EpochStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "epoch {:>3} | loss {:.4} acc {:.4} | val_loss {:.4} val_acc {:.4}",
            self.epoch, self.train_loss, self.train_accuracy, self.valid_loss, self.valid_accuracy
        )
    }
}

/// 1フェーズの学習履歴
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochStats>,
}

impl TrainingHistory {
    pub fn push(&mut self, stats: EpochStats) {
        self.epochs.push(stats);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochStats> {
        self.epochs.last()
    }

    /// 2つのフェーズを続けた履歴
    pub fn chain(&self, other: &TrainingHistory) -> TrainingHistory {
        let offset = self.epochs.len();
        let mut epochs = self.epochs.clone();
        epochs.extend(other.epochs.iter().map(|stats| EpochStats {
            epoch: stats.epoch + offset,
            ..*stats
        }));
        TrainingHistory { epochs }
    }

    /// 学習ディレクトリのメトリクスログから組み立てる
    ///
    /// 検証データが空などで記録の無い値は NaN になる。
    pub fn from_learner_logs(dir: &Path) -> Result<Self> {
        let summary = LearnerSummary::new(dir, &[LOSS_METRIC, ACCURACY_METRIC])
            .map_err(|e| anyhow::anyhow!("Failed to read training logs: {}", e))?;

        let lookup = |split: &[MetricSummary], name: &str, epoch: usize| {
            split
                .iter()
                .find(|metric| metric.name == name)
                .and_then(|metric| metric.entries.iter().find(|entry| entry.step == epoch))
                .map_or(f64::NAN, |entry| entry.value)
        };

        let train = summary.metrics.train.as_slice();
        let valid = summary.metrics.valid.as_slice();
        let epochs = (1..=summary.epochs)
            .map(|epoch| EpochStats {
                epoch,
                train_loss: lookup(train, LOSS_METRIC, epoch),
                train_accuracy: lookup(train, ACCURACY_METRIC, epoch) / 100.0,
                valid_loss: lookup(valid, LOSS_METRIC, epoch),
                valid_accuracy: lookup(valid, ACCURACY_METRIC, epoch) / 100.0,
            })
            .collect();
        Ok(Self { epochs })
    }

    /// CSVに書き出す
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create history file: {}", path.display()))?;
        for stats in &self.epochs {
            writer.serialize(stats)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// CSVから読み込む
    pub fn load_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open history file: {}", path.display()))?;
        let epochs = reader
            .deserialize()
            .collect::<std::result::Result<Vec<EpochStats>, _>>()?;
        Ok(Self { epochs })
    }
}

/// 学習フェーズの設定
#[derive(Debug, Clone)]
pub struct PhaseSchedule {
    pub name: String,
    pub num_epochs: usize,
    pub learning_rate: f64,
}

/// エポックの終わりにメトリクスをログへ出すレンダラー
struct LogRenderer {
    phase: String,
    train: BTreeMap<String, String>,
    valid: BTreeMap<String, String>,
    logged_epoch: usize,
}

impl LogRenderer {
    fn new(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            train: BTreeMap::new(),
            valid: BTreeMap::new(),
            logged_epoch: 0,
        }
    }

    fn remember(metrics: &mut BTreeMap<String, String>, state: MetricState) {
        let entry = match state {
            MetricState::Generic(entry) => entry,
            MetricState::Numeric(entry, _) => entry,
        };
        metrics.insert(entry.name.to_string(), entry.formatted);
    }

    fn joined(metrics: &BTreeMap<String, String>) -> String {
        metrics.values().cloned().collect::<Vec<_>>().join(", ")
    }
}

impl MetricsRendererTraining for LogRenderer {
    fn update_train(&mut self, state: MetricState) {
        Self::remember(&mut self.train, state);
    }

    fn update_valid(&mut self, state: MetricState) {
        Self::remember(&mut self.valid, state);
    }

    fn render_train(&mut self, item: TrainingProgress) {
        log::trace!(
            "[{}] epoch {}/{} iteration {} ({}/{})",
            self.phase,
            item.epoch,
            item.epoch_total,
            item.iteration,
            item.progress.items_processed,
            item.progress.items_total
        );
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        let done = item.progress.items_processed >= item.progress.items_total;
        if done && item.epoch != self.logged_epoch {
            self.logged_epoch = item.epoch;
            log::info!(
                "[{}] epoch {}/{} | 学習: {} | 検証: {}",
                self.phase,
                item.epoch,
                item.epoch_total,
                Self::joined(&self.train),
                Self::joined(&self.valid)
            );
        }
    }

    fn on_train_end(
        &mut self,
        summary: Option<LearnerSummary>,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        if let Some(summary) = summary {
            log::info!("[{}] 学習サマリー\n{}", self.phase, summary);
        }
        Ok(())
    }
}

impl MetricsRendererEvaluation for LogRenderer {
    fn update_test(&mut self, _name: EvaluationName, _state: MetricState) {}

    fn render_test(&mut self, _item: EvaluationProgress) {}
}

impl MetricsRenderer for LogRenderer {
    fn manual_close(&mut self) {}
}

/// 1フェーズ分の学習を実行
///
/// 凍結範囲はモデル側の設定に従う。`artifact_dir` は学習前に空にする。
/// 戻り値のモデルは推論用バックエンド上にある。
pub fn train_phase<B: AutodiffBackend>(
    model: Classifier<B>,
    train_loader: Arc<dyn DataLoader<B, ImageBatch<B>>>,
    valid_loader: Arc<dyn DataLoader<B::InnerBackend, ImageBatch<B::InnerBackend>>>,
    schedule: &PhaseSchedule,
    artifact_dir: &Path,
    device: &B::Device,
) -> Result<(Classifier<B::InnerBackend>, TrainingHistory)> {
    if schedule.num_epochs == 0 {
        log::info!("[{}] エポック数が 0 のため学習を省略します", schedule.name);
        return Ok((model.valid(), TrainingHistory::default()));
    }

    if artifact_dir.exists() {
        std::fs::remove_dir_all(artifact_dir)
            .with_context(|| format!("Failed to clear training dir: {}", artifact_dir.display()))?;
    }
    std::fs::create_dir_all(artifact_dir)
        .with_context(|| format!("Failed to create training dir: {}", artifact_dir.display()))?;

    log::info!(
        "[{}] 学習開始: エポック数 {}, 学習率 {}, 学習対象パラメータ {} / {}",
        schedule.name,
        schedule.num_epochs,
        schedule.learning_rate,
        model.trainable_params(),
        model.num_params()
    );

    let learner = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_file_checkpointer(NamedMpkFileRecorder::<FullPrecisionSettings>::new())
        .with_application_logger(None)
        .renderer(LogRenderer::new(&schedule.name))
        .learning_strategy(LearningStrategy::SingleDevice(device.clone()))
        .num_epochs(schedule.num_epochs)
        .summary()
        .build(model, AdamConfig::new().init(), schedule.learning_rate);

    let trained = learner.fit(train_loader, valid_loader);
    let history = TrainingHistory::from_learner_logs(artifact_dir)?;
    if let Some(last) = history.last() {
        log::info!("[{}] {}", schedule.name, last);
    }

    Ok((trained.model, history))
}

/// 推論用バックエンドのパラメータを学習用の分類器へ移す
///
/// 凍結範囲などの設定は `target` のものを保つ。
pub fn restore_for_training<B: AutodiffBackend>(
    target: Classifier<B>,
    trained: Classifier<B::InnerBackend>,
    device: &B::Device,
) -> Result<Classifier<B>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let bytes = Recorder::<B::InnerBackend>::record(&recorder, trained.into_record(), ())
        .map_err(|e| anyhow::anyhow!("パラメータの書き出しエラー: {:?}", e))?;
    let record = Recorder::<B>::load(&recorder, bytes, device)
        .map_err(|e| anyhow::anyhow!("パラメータの読み込みエラー: {:?}", e))?;
    Ok(target.load_record(record))
}

/// チェックポイントからパラメータを読み込む
///
/// `path` は `checkpoint/model-<epoch>.mpk` などの NamedMpk レコード。
pub fn load_checkpoint<B: Backend>(
    model: Classifier<B>,
    path: &Path,
    device: &B::Device,
) -> Result<Classifier<B>> {
    log::info!("チェックポイント読み込み: {}", path.display());
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| anyhow::anyhow!("チェックポイント読み込みエラー {}: {:?}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::{build_loader, ImageBatcher, ImageFolder};
    use crate::ml::ml_model::{ClassifierConfig, FreezePolicy};
    use crate::test_util::{scratch_dir, write_image_folder};
    use burn::backend::Autodiff;
    use burn::tensor::ElementConversion;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    const IMAGE_SIZE: usize = 96;

    fn loaders(
        dir: &Path,
    ) -> (
        Arc<dyn DataLoader<TestAutodiffBackend, ImageBatch<TestAutodiffBackend>>>,
        Arc<dyn DataLoader<TestBackend, ImageBatch<TestBackend>>>,
    ) {
        write_image_folder(dir, &[("glass", 4), ("metal", 4), ("paper", 4)], 16);
        let folder = ImageFolder::scan(dir).unwrap();
        let (train, valid) = folder.split(0.25).unwrap();
        let device = Default::default();
        (
            build_loader(train, ImageBatcher::new(device, IMAGE_SIZE, 3), 4, Some(42)),
            build_loader(valid, ImageBatcher::new(device, IMAGE_SIZE, 3), 4, None),
        )
    }

    fn tiny_model() -> Classifier<TestAutodiffBackend> {
        ClassifierConfig::new(3)
            .with_width_multiplier(0.35)
            .with_head_filters(4)
            .init(&Default::default())
    }

    #[test]
    fn test_two_phases_through_learner() {
        let dir = scratch_dir("training_phases");
        let (train_loader, valid_loader) = loaders(&dir.join("data"));
        let device = Default::default();

        let model = tiny_model();
        let schedule = PhaseSchedule {
            name: "head".to_string(),
            num_epochs: 2,
            learning_rate: 1e-3,
        };
        let head_dir = dir.join("training_1");
        let (trained, history) = train_phase(
            model.clone(),
            train_loader.clone(),
            valid_loader.clone(),
            &schedule,
            &head_dir,
            &device,
        )
        .unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history.epochs.iter().map(|s| s.epoch).collect::<Vec<_>>(), vec![1, 2]);
        for stats in &history.epochs {
            assert!(stats.train_loss.is_finite());
            assert!(stats.valid_loss.is_finite());
            assert!((0.0..=1.0).contains(&stats.train_accuracy));
            assert!((0.0..=1.0).contains(&stats.valid_accuracy));
        }
        assert!(head_dir.join(CHECKPOINT_DIR).join("model-2.mpk").exists());

        // フェーズ2へ学習済みパラメータを引き継ぐ
        let model = restore_for_training(model, trained.clone(), &device)
            .unwrap()
            .with_freeze(FreezePolicy::From(17));
        let diff = (model.head.fc.weight.val().inner() - trained.head.fc.weight.val())
            .abs()
            .max()
            .into_scalar()
            .elem::<f32>();
        assert_eq!(diff, 0.0);
        assert_eq!(model.partition().trainable.start, 17);

        let schedule = PhaseSchedule {
            name: "fine_tune".to_string(),
            num_epochs: 1,
            learning_rate: 1e-5,
        };
        let (_, fine) = train_phase(
            model,
            train_loader,
            valid_loader,
            &schedule,
            &dir.join("training_2"),
            &device,
        )
        .unwrap();
        let total = history.chain(&fine);
        assert_eq!(
            total.epochs.iter().map(|s| s.epoch).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_rerun_replaces_previous_logs() {
        let dir = scratch_dir("training_rerun");
        let (train_loader, valid_loader) = loaders(&dir.join("data"));
        let device = Default::default();
        let phase_dir = dir.join("training_1");

        for num_epochs in [2, 1] {
            let schedule = PhaseSchedule {
                name: "head".to_string(),
                num_epochs,
                learning_rate: 1e-3,
            };
            let (_, history) = train_phase(
                tiny_model(),
                train_loader.clone(),
                valid_loader.clone(),
                &schedule,
                &phase_dir,
                &device,
            )
            .unwrap();
            assert_eq!(history.len(), num_epochs);
        }
        assert!(!phase_dir.join(CHECKPOINT_DIR).join("model-2.mpk").exists());
    }

    #[test]
    fn test_zero_epochs_skips_training() {
        let dir = scratch_dir("training_zero");
        let (train_loader, valid_loader) = loaders(&dir.join("data"));
        let schedule = PhaseSchedule {
            name: "fine_tune".to_string(),
            num_epochs: 0,
            learning_rate: 1e-5,
        };
        let (_, history) = train_phase(
            tiny_model(),
            train_loader,
            valid_loader,
            &schedule,
            &dir.join("training_2"),
            &Default::default(),
        )
        .unwrap();
        assert!(history.is_empty());
        assert!(!dir.join("training_2").exists());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = scratch_dir("training_checkpoint");
        let device = Default::default();
        let model = ClassifierConfig::new(3)
            .with_width_multiplier(0.35)
            .with_head_filters(4)
            .init::<TestBackend>(&device);

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        std::fs::create_dir_all(dir.join(CHECKPOINT_DIR)).unwrap();
        let path = dir.join(CHECKPOINT_DIR).join("model-1");
        model.clone().save_file(path.clone(), &recorder).unwrap();

        let fresh = ClassifierConfig::new(3)
            .with_width_multiplier(0.35)
            .with_head_filters(4)
            .init::<TestBackend>(&device);
        let restored = load_checkpoint(fresh, &path.with_extension("mpk"), &device).unwrap();
        let before = model.head.fc.weight.val();
        let after = restored.head.fc.weight.val();
        let diff = (before - after).abs().max().into_scalar().elem::<f32>();
        assert_eq!(diff, 0.0);

        let missing = ClassifierConfig::new(3)
            .with_width_multiplier(0.35)
            .with_head_filters(4)
            .init::<TestBackend>(&device);
        assert!(load_checkpoint(missing, &dir.join("nothing.mpk"), &device).is_err());
    }

    #[test]
    fn test_history_csv_round_trip() {
        let dir = scratch_dir("training_history");
        let mut history = TrainingHistory::default();
        for epoch in 1..=3 {
            history.push(EpochStats {
                epoch,
                train_loss: 1.0 / epoch as f64,
                train_accuracy: 0.3 * epoch as f64,
                valid_loss: 1.2 / epoch as f64,
                valid_accuracy: 0.25 * epoch as f64,
            });
        }
        let path = dir.join("history.csv");
        history.save_csv(&path).unwrap();

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("epoch,train_loss,train_accuracy,valid_loss,valid_accuracy"));
        assert_eq!(TrainingHistory::load_csv(&path).unwrap(), history);
    }
}
