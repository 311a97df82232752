//! 代表データによる値域の測定

use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};

use crate::quant::executor::GraphExecutor;

/// 1つの値の観測範囲
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
}

impl ValueRange {
    fn empty() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        }
    }

    fn observe(&mut self, (min, max): (f32, f32)) {
        // NaN はそのまま伝播させ、量子化時に検出する
        if min.is_nan() || max.is_nan() {
            self.min = f32::NAN;
            self.max = f32::NAN;
        } else if !self.min.is_nan() {
            self.min = self.min.min(min);
            self.max = self.max.max(max);
        }
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }
}

/// 代表データ1回分の推論で扱うサンプル数
const CALIBRATION_BATCH: usize = 16;

/// 浮動小数点グラフを代表データで実行し、全ての値の範囲を測る
///
/// `samples` は学習時と同じ前処理を済ませた (C, H, W) の画像。
pub fn calibrate<B: Backend>(
    executor: &GraphExecutor<B>,
    samples: &[Vec<f32>],
) -> Result<Vec<ValueRange>> {
    if samples.is_empty() {
        anyhow::bail!("representative dataset is empty");
    }

    let [channels, height, width] = executor.graph().input_shape;
    let mut ranges = vec![ValueRange::empty(); executor.graph().num_values()];

    for chunk in samples.chunks(CALIBRATION_BATCH) {
        let mut pixels = Vec::with_capacity(chunk.len() * channels * height * width);
        for sample in chunk {
            if sample.len() != channels * height * width {
                anyhow::bail!(
                    "representative sample has {} values, expected {}",
                    sample.len(),
                    channels * height * width
                );
            }
            pixels.extend_from_slice(sample);
        }
        let input = Tensor::<B, 1>::from_floats(pixels.as_slice(), executor.device())
            .reshape([chunk.len(), channels, height, width]);

        for (range, value) in ranges.iter_mut().zip(executor.trace(input)?) {
            range.observe(value.min_max());
        }
    }

    log::debug!("キャリブレーション完了: {} サンプル, {} 値", samples.len(), ranges.len());
    Ok(ranges)
}
