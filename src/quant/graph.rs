//! 変換済みモデルのグラフ表現
//!
//! 学習済み分類器を、BatchNorm を畳み込みへ畳み込み Dropout を取り除いた
//! 演算ノードの列に変換する。重みは `buffers` にまとめて保持し、
//! 各ノードはインデックスで参照する。
//!
//! 値の番号付け: 0 がグラフ入力、ノード `i` の出力が `i + 1`。

use anyhow::Result;
use burn::{
    module::Module,
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::ml::ml_model::Classifier;
use crate::ml::mobilenet::ConvNormAct;

/// 畳み込みの後に適用する活性化
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    None,
    Relu,
    Relu6,
}

/// 量子化後の整数型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantType {
    Int8,
    Uint8,
}

impl QuantType {
    pub fn range(&self) -> (i32, i32) {
        match self {
            QuantType::Int8 => (-128, 127),
            QuantType::Uint8 => (0, 255),
        }
    }
}

/// テンソル単位のアフィン量子化パラメータ
///
/// `real = scale * (q - zero_point)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
    pub dtype: QuantType,
}

impl QuantParams {
    /// 値域 [0, 1] の画像入力 (uint8)
    pub fn image_input() -> Self {
        Self {
            scale: 1.0 / 255.0,
            zero_point: 0,
            dtype: QuantType::Uint8,
        }
    }

    /// Softmax 出力 (uint8)
    pub fn softmax_output() -> Self {
        Self {
            scale: 1.0 / 256.0,
            zero_point: 0,
            dtype: QuantType::Uint8,
        }
    }

    pub fn quantize(&self, value: f32) -> i32 {
        let (qmin, qmax) = self.dtype.range();
        ((value / self.scale).round() as i32 + self.zero_point).clamp(qmin, qmax)
    }

    pub fn dequantize(&self, q: i32) -> f32 {
        (q - self.zero_point) as f32 * self.scale
    }
}

/// 重みなどの定数データ
#[derive(Debug, Clone, PartialEq)]
pub enum BufferData {
    F32(Vec<f32>),
    I8(Vec<i8>),
    I32(Vec<i32>),
}

impl BufferData {
    pub fn len(&self) -> usize {
        match self {
            BufferData::F32(v) => v.len(),
            BufferData::I8(v) => v.len(),
            BufferData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 定数テンソル
///
/// 整数データはチャネルごとのスケールを持ち、`axis` 次元の添字でスケールを選ぶ。
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub shape: Vec<usize>,
    pub data: BufferData,
    pub scales: Vec<f32>,
    pub axis: usize,
}

impl Buffer {
    pub fn float(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            shape,
            data: BufferData::F32(data),
            scales: Vec::new(),
            axis: 0,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// 形状・スケール・軸の整合性
    fn check(&self) -> std::result::Result<(), String> {
        if self.data.len() != self.num_elements() {
            return Err(format!(
                "{} values do not fill shape {:?}",
                self.data.len(),
                self.shape
            ));
        }
        if matches!(self.data, BufferData::F32(_)) {
            return Ok(());
        }
        let channels = self.shape.get(self.axis).ok_or_else(|| {
            format!("axis {} is out of range for shape {:?}", self.axis, self.shape)
        })?;
        if self.scales.len() != *channels {
            return Err(format!(
                "{} scales for {} channels on axis {}",
                self.scales.len(),
                channels,
                self.axis
            ));
        }
        if let Some(scale) = self.scales.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(format!("scale {} is not positive", scale));
        }
        Ok(())
    }

    /// 浮動小数点の値に戻す
    pub fn to_f32(&self) -> Result<Vec<f32>> {
        self.check().map_err(PipelineError::MalformedGraph)?;
        let codes: Vec<f32> = match &self.data {
            BufferData::F32(values) => return Ok(values.clone()),
            BufferData::I8(values) => values.iter().map(|q| *q as f32).collect(),
            BufferData::I32(values) => values.iter().map(|q| *q as f32).collect(),
        };

        let channels = self.scales.len();
        let stride: usize = self.shape.iter().skip(self.axis + 1).product();
        Ok(codes
            .iter()
            .enumerate()
            .map(|(i, q)| q * self.scales[(i / stride) % channels])
            .collect())
    }
}

/// 演算の種類
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// 重み [out, in / groups, k, k]
    Conv2d {
        weight: usize,
        bias: usize,
        stride: usize,
        padding: usize,
        groups: usize,
        activation: Activation,
    },
    Add,
    /// 空間方向の平均 [b, c, h, w] -> [b, c]
    Mean,
    /// 重み [in, out]
    FullyConnected { weight: usize, bias: usize },
    Softmax,
}

impl Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Conv2d { .. } => "CONV_2D",
            Op::Add => "ADD",
            Op::Mean => "MEAN",
            Op::FullyConnected { .. } => "FULLY_CONNECTED",
            Op::Softmax => "SOFTMAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<usize>,
    /// 量子化済みグラフのみ
    pub output_quant: Option<QuantParams>,
}

/// 変換済みモデル
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    /// [channels, height, width]
    pub input_shape: [usize; 3],
    /// 量子化済みグラフのみ
    pub input_quant: Option<QuantParams>,
    pub nodes: Vec<Node>,
    pub buffers: Vec<Buffer>,
}

impl Graph {
    pub fn is_quantized(&self) -> bool {
        self.input_quant.is_some()
    }

    /// 出力の量子化パラメータ
    pub fn output_quant(&self) -> Option<QuantParams> {
        self.nodes.last().and_then(|node| node.output_quant)
    }

    /// 値の総数（入力を含む）
    pub fn num_values(&self) -> usize {
        self.nodes.len() + 1
    }

    pub fn num_classes(&self) -> usize {
        self.nodes
            .iter()
            .rev()
            .find_map(|node| match node.op {
                Op::FullyConnected { bias, .. } => self.buffers.get(bias).map(Buffer::num_elements),
                _ => None,
            })
            .unwrap_or(0)
    }

    /// ノードが参照するバッファ
    pub fn buffer(&self, node: &Node, index: usize) -> Result<&Buffer> {
        self.buffers.get(index).ok_or_else(|| {
            PipelineError::MalformedGraph(format!(
                "node {} refers to buffer {} but the graph has {}",
                node.name,
                index,
                self.buffers.len()
            ))
            .into()
        })
    }

    /// 読み込んだグラフの整合性を確認
    ///
    /// 入力の参照順、バッファの参照先と形状、チャネルごとのスケールを調べる。
    pub fn validate(&self) -> Result<()> {
        let malformed = |reason: String| -> anyhow::Error { PipelineError::MalformedGraph(reason).into() };

        for (index, buffer) in self.buffers.iter().enumerate() {
            buffer
                .check()
                .map_err(|reason| malformed(format!("buffer {}: {}", index, reason)))?;
        }
        for params in self.input_quant.iter().chain(self.nodes.iter().filter_map(|n| n.output_quant.as_ref())) {
            if !params.scale.is_finite() || params.scale <= 0.0 {
                return Err(malformed(format!("quantization scale {} is not positive", params.scale)));
            }
        }

        for (index, node) in self.nodes.iter().enumerate() {
            let arity = match node.op {
                Op::Add => 2,
                _ => 1,
            };
            if node.inputs.len() != arity {
                return Err(malformed(format!(
                    "node {} takes {} inputs, got {}",
                    node.name,
                    arity,
                    node.inputs.len()
                )));
            }
            if let Some(id) = node.inputs.iter().find(|id| **id > index) {
                return Err(malformed(format!(
                    "node {} reads value {} before it is produced",
                    node.name, id
                )));
            }
            if node.output_quant.is_some() != self.is_quantized() {
                return Err(malformed(format!(
                    "node {} quantization does not match the graph input",
                    node.name
                )));
            }

            let (weight, bias, rank, out_axis) = match node.op {
                Op::Conv2d { weight, bias, groups, .. } => {
                    if groups == 0 {
                        return Err(malformed(format!("node {} has zero groups", node.name)));
                    }
                    (weight, bias, 4, 0)
                }
                Op::FullyConnected { weight, bias } => (weight, bias, 2, 1),
                Op::Add | Op::Mean | Op::Softmax => continue,
            };
            let weight = self.buffer(node, weight)?;
            let bias = self.buffer(node, bias)?;
            if weight.shape.len() != rank {
                return Err(malformed(format!(
                    "node {} weight must be {}-D, got {:?}",
                    node.name, rank, weight.shape
                )));
            }
            if bias.num_elements() != weight.shape[out_axis] {
                return Err(malformed(format!(
                    "node {} has {} biases for {} output channels",
                    node.name,
                    bias.num_elements(),
                    weight.shape[out_axis]
                )));
            }
            if !matches!(weight.data, BufferData::F32(_)) && weight.axis != out_axis {
                return Err(malformed(format!(
                    "node {} weight scales must run along axis {}",
                    node.name, out_axis
                )));
            }
        }
        Ok(())
    }

    fn push_buffer(&mut self, buffer: Buffer) -> usize {
        self.buffers.push(buffer);
        self.buffers.len() - 1
    }

    fn push_node(&mut self, name: String, op: Op, inputs: Vec<usize>) -> usize {
        self.nodes.push(Node {
            name,
            op,
            inputs,
            output_quant: None,
        });
        self.nodes.len()
    }
}

fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read tensor data: {:?}", e))
}

/// BatchNorm を畳み込みの重みとバイアスへ畳み込む
fn fold_conv_norm<B: Backend>(unit: &ConvNormAct<B>) -> Result<(Buffer, Buffer)> {
    let weight = unit.conv.weight.val();
    let shape = weight.dims();
    let gamma = tensor_values(unit.norm.gamma.val())?;
    let beta = tensor_values(unit.norm.beta.val())?;
    let mean = tensor_values(unit.norm.running_mean.value())?;
    let var = tensor_values(unit.norm.running_var.value())?;
    let conv_bias = match &unit.conv.bias {
        Some(bias) => tensor_values(bias.val())?,
        None => vec![0.0; shape[0]],
    };
    let epsilon = unit.norm.epsilon as f32;

    let mut values = tensor_values(weight)?;
    let per_channel = values.len() / shape[0];
    let mut bias = Vec::with_capacity(shape[0]);
    for c in 0..shape[0] {
        let factor = gamma[c] / (var[c] + epsilon).sqrt();
        for w in &mut values[c * per_channel..(c + 1) * per_channel] {
            *w *= factor;
        }
        bias.push(beta[c] + (conv_bias[c] - mean[c]) * factor);
    }

    Ok((
        Buffer::float(shape.to_vec(), values),
        Buffer::float(vec![shape[0]], bias),
    ))
}

/// 学習済み分類器をグラフへ変換
///
/// 入力サイズは正方形の画像の一辺。
pub fn lower_classifier<B: Backend>(model: &Classifier<B>, image_size: usize) -> Result<Graph> {
    let mut graph = Graph {
        input_shape: [3, image_size, image_size],
        input_quant: None,
        nodes: Vec::new(),
        buffers: Vec::new(),
    };

    let mut current = 0;
    for (layer_index, layer) in model.backbone.layers.iter().enumerate() {
        let layer_input = current;
        for (unit_index, unit) in layer.units.iter().enumerate() {
            let (weight, bias) = fold_conv_norm(unit)?;
            let weight = graph.push_buffer(weight);
            let bias = graph.push_buffer(bias);
            let activation = if unit.relu6 {
                Activation::Relu6
            } else {
                Activation::None
            };
            current = graph.push_node(
                format!("backbone.{}.{}", layer_index, unit_index),
                Op::Conv2d {
                    weight,
                    bias,
                    stride: unit.stride,
                    padding: unit.padding,
                    groups: unit.groups,
                    activation,
                },
                vec![current],
            );
        }
        if layer.residual {
            current = graph.push_node(
                format!("backbone.{}.add", layer_index),
                Op::Add,
                vec![current, layer_input],
            );
        }
    }

    // ヘッド (Dropout は推論時に恒等写像なので省く)
    let head = &model.head;
    let head_weight = head.conv.weight.val();
    let head_shape = head_weight.dims();
    let head_bias = match &head.conv.bias {
        Some(bias) => tensor_values(bias.val())?,
        None => vec![0.0; head_shape[0]],
    };
    let weight = graph.push_buffer(Buffer::float(head_shape.to_vec(), tensor_values(head_weight)?));
    let bias = graph.push_buffer(Buffer::float(vec![head_shape[0]], head_bias));
    current = graph.push_node(
        "head.conv".to_string(),
        Op::Conv2d {
            weight,
            bias,
            stride: 1,
            padding: 0,
            groups: 1,
            activation: Activation::Relu,
        },
        vec![current],
    );
    current = graph.push_node("head.pool".to_string(), Op::Mean, vec![current]);

    let fc_weight = head.fc.weight.val();
    let fc_shape = fc_weight.dims();
    let fc_bias = match &head.fc.bias {
        Some(bias) => tensor_values(bias.val())?,
        None => vec![0.0; fc_shape[1]],
    };
    let weight = graph.push_buffer(Buffer::float(fc_shape.to_vec(), tensor_values(fc_weight)?));
    let bias = graph.push_buffer(Buffer::float(vec![fc_shape[1]], fc_bias));
    current = graph.push_node(
        "head.fc".to_string(),
        Op::FullyConnected { weight, bias },
        vec![current],
    );
    graph.push_node("head.softmax".to_string(), Op::Softmax, vec![current]);

    log::debug!(
        "グラフ変換: {} ノード, {} バッファ, パラメータ {}",
        graph.nodes.len(),
        graph.buffers.len(),
        model.num_params()
    );

    Ok(graph)
}
