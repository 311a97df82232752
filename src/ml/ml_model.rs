//! 分類モデルの共通定義
//!
//! MobileNetV2 特徴抽出器と学習可能な分類ヘッドを組み合わせた分類器、
//! 凍結範囲の分割関数、および画像の読み込み処理を提供します。

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{BinBytesRecorder, FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::{activation::softmax, backend::AutodiffBackend, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::imageops::FilterType;
use std::ops::Range;
use std::path::Path;

use crate::ml::mobilenet::{MobileNetV2, MobileNetV2Config};
use crate::model::{load_model_with_metadata, save_model_with_metadata, ModelMetadata};

/// 既定のクラス数
pub const NUM_CLASSES: usize = 6;

/// 既定の画像サイズ
pub const IMAGE_SIZE: usize = 224;

/// バックボーンのどこから学習対象にするか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezePolicy {
    /// バックボーン全体を凍結（ヘッドのみ学習）
    Backbone,
    /// 指定インデックス以降のバックボーン層を学習対象にする
    From(usize),
}

/// 順序付き層リストの凍結・学習対象への分割
///
/// 2つの範囲は互いに素で、合わせると全層を覆う。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPartition {
    pub frozen: Range<usize>,
    pub trainable: Range<usize>,
}

/// 層数と凍結方針から分割を計算
///
/// インデックスが層数を超える場合は全層凍結と同じ扱い。
pub fn partition_layers(layer_count: usize, policy: FreezePolicy) -> LayerPartition {
    let boundary = match policy {
        FreezePolicy::Backbone => layer_count,
        FreezePolicy::From(index) => index.min(layer_count),
    };
    LayerPartition {
        frozen: 0..boundary,
        trainable: boundary..layer_count,
    }
}

/// 分類器設定
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// MobileNetV2 の幅係数
    #[config(default = 1.0)]
    pub width_multiplier: f64,
    /// ヘッドの畳み込みフィルタ数
    #[config(default = 32)]
    pub head_filters: usize,
    /// ドロップアウト率
    #[config(default = 0.1)]
    pub dropout: f64,
}

impl ClassifierConfig {
    /// 分類器を初期化（バックボーン全体を凍結した状態）
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        let backbone = MobileNetV2Config::new()
            .with_width_multiplier(self.width_multiplier)
            .init(device);
        let head = self.init_head(backbone.out_channels(), device);
        let trainable_from = backbone.layer_count();

        Classifier {
            backbone,
            head,
            trainable_from,
        }
    }

    /// 事前学習済みバックボーンを読み込んで分類器を初期化
    ///
    /// 重みファイルは burn の named mpk 形式 (FullPrecision)。
    pub fn init_pretrained<B: Backend>(
        &self,
        weights: &Path,
        device: &B::Device,
    ) -> Result<Classifier<B>> {
        let mut classifier = self.init::<B>(device);
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        classifier.backbone = classifier
            .backbone
            .load_file(weights.to_path_buf(), &recorder, device)
            .map_err(|e| {
                anyhow::anyhow!("バックボーン重みの読み込みエラー {}: {:?}", weights.display(), e)
            })?;
        Ok(classifier)
    }

    fn init_head<B: Backend>(&self, in_channels: usize, device: &B::Device) -> ClassificationHead<B> {
        ClassificationHead {
            // Conv 3x3 (no padding)
            conv: Conv2dConfig::new([in_channels, self.head_filters], [3, 3])
                .with_padding(PaddingConfig2d::Valid)
                .init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(self.head_filters, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// 分類ヘッド
///
/// Conv 3x3 + ReLU -> Dropout -> Global Average Pooling -> Dense
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    pub conv: Conv2d<B>,
    pub dropout: Dropout,
    pub pool: AdaptiveAvgPool2d,
    pub fc: Linear<B>,
    pub activation: Relu,
}

impl<B: Backend> ClassificationHead<B> {
    /// 特徴マップからロジットを計算
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv.forward(features);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        let x = self.pool.forward(x);

        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        self.fc.forward(x)
    }
}

/// ゴミ分類モデル
///
/// # アーキテクチャ
/// - MobileNetV2 特徴抽出器 (19層)
/// - Conv 3x3 (no padding) + ReLU
/// - Dropout
/// - Global Average Pooling
/// - Dense: filters -> num_classes
/// - Softmax (予測時)
///
/// `trainable_from` より前のバックボーン層は学習時に推論モードで実行され、
/// 勾配を受け取らない。
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    pub backbone: MobileNetV2<B>,
    pub head: ClassificationHead<B>,
    trainable_from: usize,
}

impl<B: Backend> Classifier<B> {
    /// 凍結方針を適用した分類器を返す
    pub fn with_freeze(mut self, policy: FreezePolicy) -> Self {
        self.trainable_from = partition_layers(self.backbone.layer_count(), policy).trainable.start;
        self
    }

    /// 現在のバックボーン分割
    pub fn partition(&self) -> LayerPartition {
        partition_layers(
            self.backbone.layer_count(),
            FreezePolicy::From(self.trainable_from),
        )
    }

    /// 学習対象のパラメータ数（ヘッド + 学習対象のバックボーン層）
    pub fn trainable_params(&self) -> usize {
        self.head.num_params() + self.backbone.params_in(self.partition().trainable)
    }

    /// クラス数
    pub fn num_classes(&self) -> usize {
        self.head.fc.weight.val().dims()[1]
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.head.forward(features)
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID [batch_size], 確率 [batch_size, num_classes])
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 1, Int>, Tensor<B, 2>) {
        let probabilities = softmax(self.forward(images), 1);
        let [batch_size, _] = probabilities.dims();
        let predictions = probabilities.clone().argmax(1).reshape([batch_size]);
        (predictions, probabilities)
    }

    /// 順伝播と損失計算（検証用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        classification_output(output, targets)
    }
}

impl<B: AutodiffBackend> Classifier<B> {
    /// 学習時の順伝播
    ///
    /// 凍結範囲の層は内部バックエンドで実行するため、勾配は流れず
    /// BatchNorm も移動統計量を使う。
    pub fn forward_train(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let partition = self.partition();

        let mut frozen = images.inner();
        for layer in &self.backbone.layers[partition.frozen] {
            frozen = layer.valid().forward(frozen);
        }

        let mut x = Tensor::<B, 4>::from_inner(frozen);
        for layer in &self.backbone.layers[partition.trainable] {
            x = layer.forward(x);
        }

        self.head.forward(x)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_train_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward_train(images);
        classification_output(output, targets)
    }
}

/// ロジットとターゲットから交差エントロピー損失を計算
fn classification_output<B: Backend>(
    output: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> ClassificationOutput<B> {
    let loss = CrossEntropyLossConfig::new()
        .init(&output.device())
        .forward(output.clone(), targets.clone());

    ClassificationOutput::new(loss, output, targets)
}

/// 分類器をメタデータと共にバンドルへ保存
///
/// 重みは burn のバイナリレコード (FullPrecision)。
pub fn save_classifier_bundle<B: Backend>(
    path: &Path,
    model: &Classifier<B>,
    metadata: &ModelMetadata,
) -> Result<()> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let binary = recorder
        .record(model.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))?;
    save_model_with_metadata(path, metadata, &binary)?;
    log::info!(
        "モデルを保存しました: {} ({:.2} MB)",
        path.display(),
        binary.len() as f64 / 1024.0 / 1024.0
    );
    Ok(())
}

/// バンドルから分類器を復元
pub fn load_classifier_bundle<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(Classifier<B>, ModelMetadata)> {
    let (metadata, binary) = load_model_with_metadata(path)?;
    let model = ClassifierConfig::new(metadata.num_classes())
        .with_width_multiplier(metadata.width_multiplier)
        .with_head_filters(metadata.head_filters)
        .init::<B>(device);

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(binary, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok((model.load_record(record), metadata))
}

/// 画像を読み込んでリサイズ・正規化
///
/// 画素値を 1/255 倍して [0, 1] に収めます。
///
/// # 戻り値
/// - RGB画像データ (C, H, W) の順で平坦化
pub fn load_image_with_size(path: &Path, size: usize) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("画像の読み込みに失敗しました: {}", path.display()))?
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8();

    let mut data = Vec::with_capacity(3 * size * size);
    for channel in 0..3 {
        for pixel in img.pixels() {
            data.push(pixel[channel] as f32 / 255.0);
        }
    }

    Ok(data)
}
