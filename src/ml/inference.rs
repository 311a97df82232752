//! 変換済みモデルによる推論

use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};
use std::path::Path;

use crate::ml::ml_model::load_image_with_size;
use crate::model::{InferenceConfig, ModelMetadata};
use crate::quant::{load_graph, Graph, GraphExecutor};

/// 1枚の画像の分類結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    pub confidence: f32,
}

/// 推論エンジン
///
/// 浮動小数点グラフと量子化済みグラフのどちらも同じ入出力で扱う。
/// 量子化済みの場合は入力を uint8 に量子化し、出力を逆量子化する。
pub struct InferenceEngine<B: Backend> {
    executor: GraphExecutor<B>,
    config: InferenceConfig,
}

impl<B: Backend> InferenceEngine<B> {
    /// グラフファイルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(graph_path: P, device: &B::Device) -> Result<Self> {
        let (graph, metadata) = load_graph(graph_path.as_ref())?;
        Self::from_graph(graph, &metadata, device)
    }

    pub fn from_graph(graph: Graph, metadata: &ModelMetadata, device: &B::Device) -> Result<Self> {
        let config = InferenceConfig::from_metadata(metadata);
        if graph.num_classes() != config.num_classes() {
            anyhow::bail!(
                "graph outputs {} classes but metadata lists {} labels",
                graph.num_classes(),
                config.num_classes()
            );
        }
        Ok(Self {
            executor: GraphExecutor::new(graph, device)?,
            config,
        })
    }

    pub fn is_quantized(&self) -> bool {
        self.executor.graph().is_quantized()
    }

    /// クラス確率 [batch_size, num_classes]
    ///
    /// `images` は値域 [0, 1] の [batch_size, 3, size, size]。
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let graph = self.executor.graph();
        match (graph.input_quant, graph.output_quant()) {
            (Some(input), Some(output)) => {
                let (qmin, qmax) = input.dtype.range();
                let codes = images
                    .div_scalar(input.scale)
                    .round()
                    .add_scalar(input.zero_point as f32)
                    .clamp(qmin as f32, qmax as f32);
                let output_codes = self.executor.run(codes)?;
                Ok(output_codes
                    .sub_scalar(output.zero_point as f32)
                    .mul_scalar(output.scale))
            }
            _ => self.executor.run(images),
        }
    }

    /// 単一画像を分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let size = self.config.input_size();
        let image_data = load_image_with_size(image_path.as_ref(), size)?;
        let tensor = Tensor::<B, 1>::from_floats(image_data.as_slice(), self.executor.device())
            .reshape([1, 3, size, size]);

        let probabilities = self
            .probabilities(tensor)?
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;

        let (class_index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        let label = self
            .config
            .class_index_to_label(class_index)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_index))?
            .to_string();

        Ok(Prediction {
            class_index,
            label,
            confidence,
        })
    }

    /// 複数画像をバッチ分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        image_paths
            .iter()
            .map(|path| self.classify_image(path))
            .collect()
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}
