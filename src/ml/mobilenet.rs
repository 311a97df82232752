//! MobileNetV2 特徴抽出器
//!
//! 分類層を持たないMobileNetV2本体。層は順序付きリストとして保持し、
//! 先頭から何層を凍結するかを外部の分割関数で決められるようにしている。
//!
//! # 層の並び (width_multiplier = 1.0)
//! - 0: Stem  Conv 3x3 stride 2 (3 -> 32)
//! - 1..=17: Inverted Residual ブロック (16 -> 24 -> 32 -> 64 -> 96 -> 160 -> 320)
//! - 18: Conv 1x1 (320 -> 1280)

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};

/// Inverted Residual の設定 (拡張率 t, 出力チャネル c, 繰り返し n, ストライド s)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

/// Stem の出力チャネル
const STEM_CHANNELS: usize = 32;

/// 最終層の出力チャネル
const LAST_CHANNELS: usize = 1280;

/// チャネル数を `divisor` の倍数に丸める（10%以上小さくならないようにする）
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let divisor_f = divisor as f64;
    let rounded = (((value + divisor_f / 2.0) / divisor_f).floor() as usize * divisor).max(divisor);
    if (rounded as f64) < 0.9 * value {
        rounded + divisor
    } else {
        rounded
    }
}

/// Conv + BatchNorm (+ ReLU6)
#[derive(Module, Debug)]
pub struct ConvNormAct<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B>,
    /// 変換時に畳み込みを再構成するための値
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
    /// ReLU6 を適用するか（射影層は線形）
    pub relu6: bool,
}

impl<B: Backend> ConvNormAct<B> {
    fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        groups: usize,
        relu6: bool,
        device: &B::Device,
    ) -> Self {
        let padding = (kernel - 1) / 2;
        let conv = Conv2dConfig::new(channels, [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);

        Self {
            conv,
            norm: BatchNormConfig::new(channels[1]).init(device),
            stride,
            padding,
            groups,
            relu6,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.norm.forward(x);
        if self.relu6 {
            x.clamp(0.0, 6.0)
        } else {
            x
        }
    }

    /// 出力チャネル数
    pub fn out_channels(&self) -> usize {
        self.norm.gamma.val().dims()[0]
    }
}

/// バックボーンの1層
///
/// Stem、Inverted Residual ブロック、最終 1x1 Conv のいずれも
/// ConvNormAct の列として表す。入出力の形が同じブロックだけ残差接続を持つ。
#[derive(Module, Debug)]
pub struct BackboneLayer<B: Backend> {
    pub units: Vec<ConvNormAct<B>>,
    pub residual: bool,
}

impl<B: Backend> BackboneLayer<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input.clone();
        for unit in &self.units {
            x = unit.forward(x);
        }
        if self.residual {
            x + input
        } else {
            x
        }
    }

    /// Inverted Residual ブロック
    fn inverted_residual(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expand_ratio: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let mut units = Vec::with_capacity(3);

        // 拡張率1のブロック（最初のブロック）は拡張層を持たない
        if expand_ratio != 1 {
            units.push(ConvNormAct::new([in_channels, hidden], 1, 1, 1, true, device));
        }
        // Depthwise 3x3
        units.push(ConvNormAct::new([hidden, hidden], 3, stride, hidden, true, device));
        // 線形射影
        units.push(ConvNormAct::new([hidden, out_channels], 1, 1, 1, false, device));

        Self {
            units,
            residual: stride == 1 && in_channels == out_channels,
        }
    }
}

/// MobileNetV2 設定
#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    /// 幅係数 (alpha)
    #[config(default = 1.0)]
    pub width_multiplier: f64,
}

impl MobileNetV2Config {
    /// バックボーンを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let alpha = self.width_multiplier;
        let mut layers = Vec::new();

        let mut in_channels = make_divisible(STEM_CHANNELS as f64 * alpha, 8);
        layers.push(BackboneLayer {
            units: vec![ConvNormAct::new([3, in_channels], 3, 2, 1, true, device)],
            residual: false,
        });

        for (expand_ratio, channels, repeats, stride) in INVERTED_RESIDUAL_SETTINGS {
            let out_channels = make_divisible(channels as f64 * alpha, 8);
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                layers.push(BackboneLayer::inverted_residual(
                    in_channels,
                    out_channels,
                    stride,
                    expand_ratio,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        // alpha > 1 のときだけ最終層も広げる
        let last_channels = if alpha > 1.0 {
            make_divisible(LAST_CHANNELS as f64 * alpha, 8)
        } else {
            LAST_CHANNELS
        };
        layers.push(BackboneLayer {
            units: vec![ConvNormAct::new([in_channels, last_channels], 1, 1, 1, true, device)],
            residual: false,
        });

        MobileNetV2 { layers }
    }
}

/// MobileNetV2 特徴抽出器（分類層なし）
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    pub layers: Vec<BackboneLayer<B>>,
}

impl<B: Backend> MobileNetV2<B> {
    /// 全層を通した特徴マップ [batch, out_channels, size/32, size/32]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers
            .iter()
            .fold(images, |x, layer| layer.forward(x))
    }

    /// 層の数
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// 出力チャネル数
    pub fn out_channels(&self) -> usize {
        self.layers
            .last()
            .and_then(|layer| layer.units.last())
            .map(|unit| unit.out_channels())
            .unwrap_or(0)
    }

    /// 指定範囲の層のパラメータ数
    pub fn params_in(&self, range: std::ops::Range<usize>) -> usize {
        self.layers[range].iter().map(|layer| layer.num_params()).sum()
    }
}
