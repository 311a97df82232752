//! フル精度モデルと量子化モデルの正解率比較
//!
//! 検証データの1バッチを両方に通して結果を記録する。結果は参考情報で、
//! 差が大きくてもパイプラインは止めない。

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ml::dataset::ImageBatch;
use crate::ml::inference::InferenceEngine;
use crate::ml::ml_model::Classifier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub batch_size: usize,
    pub float_accuracy: f64,
    pub quantized_accuracy: f64,
    /// 両モデルの予測クラスが一致した割合
    pub agreement: f64,
}

impl VerificationReport {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write verification report: {}", path.display()))?;
        Ok(())
    }

    pub fn print(&self) {
        log::info!("=== 量子化の検証 ({} 枚) ===", self.batch_size);
        log::info!("フル精度モデル 正解率: {:.4}", self.float_accuracy);
        log::info!("量子化モデル   正解率: {:.4}", self.quantized_accuracy);
        log::info!("予測の一致率: {:.4}", self.agreement);
    }
}

fn count_equal<B: Backend>(a: Tensor<B, 1, Int>, b: Tensor<B, 1, Int>) -> usize {
    a.equal(b).int().sum().into_scalar().elem::<i64>() as usize
}

/// 1バッチで両モデルを比較
pub fn compare_on_batch<B: Backend>(
    model: &Classifier<B>,
    engine: &InferenceEngine<B>,
    batch: ImageBatch<B>,
) -> Result<VerificationReport> {
    let [batch_size, _, _, _] = batch.images.dims();
    if batch_size == 0 {
        anyhow::bail!("verification batch is empty");
    }

    let (float_predictions, _) = model.predict(batch.images.clone());
    let quantized_predictions = engine
        .probabilities(batch.images)?
        .argmax(1)
        .reshape([batch_size]);

    let float_correct = count_equal(float_predictions.clone(), batch.targets.clone());
    let quantized_correct = count_equal(quantized_predictions.clone(), batch.targets);
    let agree = count_equal(float_predictions, quantized_predictions);

    Ok(VerificationReport {
        batch_size,
        float_accuracy: float_correct as f64 / batch_size as f64,
        quantized_accuracy: quantized_correct as f64 / batch_size as f64,
        agreement: agree as f64 / batch_size as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::{build_loader, ImageBatcher, ImageFolder};
    use crate::ml::ml_model::ClassifierConfig;
    use crate::model::ModelMetadata;
    use crate::quant::{calibrate, lower_classifier, quantize_graph, GraphExecutor};
    use crate::test_util::{scratch_dir, write_image_folder};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_compare_on_batch_reports_fractions() {
        let dir = scratch_dir("verify_batch");
        write_image_folder(&dir, &[("glass", 3), ("metal", 3)], 32);
        let folder = ImageFolder::scan(&dir).unwrap();
        let (_, valid) = folder.split(0.5).unwrap();

        let device = Default::default();
        let model = ClassifierConfig::new(2)
            .with_width_multiplier(0.35)
            .with_head_filters(4)
            .init::<TestBackend>(&device);
        let graph = lower_classifier(&model, 96).unwrap();
        let samples = crate::ml::dataset::load_representative(&valid.sample_paths(4, 42), 96).unwrap();
        let ranges = calibrate(&GraphExecutor::<TestBackend>::new(graph.clone(), &device).unwrap(), &samples).unwrap();
        let quantized = quantize_graph(&graph, &ranges).unwrap();
        let metadata = ModelMetadata::new(folder.class_names().to_vec(), 96, 0.35, 4, 1, 1, 11);
        let engine = InferenceEngine::from_graph(quantized, &metadata, &device).unwrap();

        let loader = build_loader::<TestBackend>(valid, ImageBatcher::new(device, 96, 2), 64, None);
        let batch = loader.iter().next().unwrap();
        let report = compare_on_batch(&model, &engine, batch).unwrap();

        assert_eq!(report.batch_size, 2);
        for value in [report.float_accuracy, report.quantized_accuracy, report.agreement] {
            assert!((0.0..=1.0).contains(&value));
        }

        let path = dir.join("verification.json");
        report.save(&path).unwrap();
        let restored: VerificationReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(restored, report);
    }
}
