//! グラフの実行
//!
//! 浮動小数点グラフはそのまま、量子化済みグラフは各テンソルの境界で
//! 量子化と逆量子化を行い整数演算の結果を再現する。

use anyhow::Result;
use burn::tensor::{
    activation::softmax,
    backend::Backend,
    module::conv2d,
    ops::ConvOptions,
    Tensor,
};

use crate::quant::graph::{Activation, Graph, Op, QuantParams};

/// 実行中の値
#[derive(Debug, Clone)]
pub enum Value<B: Backend> {
    /// [batch, channels, height, width]
    Map(Tensor<B, 4>),
    /// [batch, features]
    Flat(Tensor<B, 2>),
}

impl<B: Backend> Value<B> {
    fn map(self, node: &str) -> Result<Tensor<B, 4>> {
        match self {
            Value::Map(tensor) => Ok(tensor),
            Value::Flat(_) => anyhow::bail!("node {} expects a feature map input", node),
        }
    }

    fn flat(self, node: &str) -> Result<Tensor<B, 2>> {
        match self {
            Value::Flat(tensor) => Ok(tensor),
            Value::Map(_) => anyhow::bail!("node {} expects a flat input", node),
        }
    }

    fn fake_quant(self, params: &QuantParams) -> Self {
        match self {
            Value::Map(tensor) => Value::Map(fake_quant(tensor, params)),
            Value::Flat(tensor) => Value::Flat(fake_quant(tensor, params)),
        }
    }

    /// (最小値, 最大値)
    pub fn min_max(&self) -> (f32, f32) {
        use burn::tensor::ElementConversion;
        match self {
            Value::Map(tensor) => (
                tensor.clone().min().into_scalar().elem::<f32>(),
                tensor.clone().max().into_scalar().elem::<f32>(),
            ),
            Value::Flat(tensor) => (
                tensor.clone().min().into_scalar().elem::<f32>(),
                tensor.clone().max().into_scalar().elem::<f32>(),
            ),
        }
    }
}

/// 量子化して即座に逆量子化する
fn fake_quant<B: Backend, const D: usize>(tensor: Tensor<B, D>, params: &QuantParams) -> Tensor<B, D> {
    let (qmin, qmax) = params.dtype.range();
    let zero_point = params.zero_point as f32;
    tensor
        .div_scalar(params.scale)
        .round()
        .add_scalar(zero_point)
        .clamp(qmin as f32, qmax as f32)
        .sub_scalar(zero_point)
        .mul_scalar(params.scale)
}

/// デバイス上に展開した演算
enum LoadedOp<B: Backend> {
    Conv2d {
        weight: Tensor<B, 4>,
        bias: Tensor<B, 1>,
        options: ConvOptions<2>,
        activation: Activation,
    },
    Add,
    Mean,
    FullyConnected {
        weight: Tensor<B, 2>,
        bias: Tensor<B, 1>,
    },
    Softmax,
}

/// グラフ実行器
///
/// 重みは生成時に一度だけデバイスへ転送する。
pub struct GraphExecutor<B: Backend> {
    graph: Graph,
    ops: Vec<LoadedOp<B>>,
    device: B::Device,
}

impl<B: Backend> GraphExecutor<B> {
    pub fn new(graph: Graph, device: &B::Device) -> Result<Self> {
        graph.validate()?;

        let mut ops = Vec::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            let op = match &node.op {
                Op::Conv2d {
                    weight,
                    bias,
                    stride,
                    padding,
                    groups,
                    activation,
                } => {
                    let buffer = graph.buffer(node, *weight)?;
                    let [o, i, kh, kw] = <[usize; 4]>::try_from(buffer.shape.as_slice())
                        .map_err(|_| anyhow::anyhow!("node {}: conv weight must be 4-D", node.name))?;
                    LoadedOp::Conv2d {
                        weight: Tensor::<B, 1>::from_floats(buffer.to_f32()?.as_slice(), device)
                            .reshape([o, i, kh, kw]),
                        bias: Tensor::from_floats(graph.buffer(node, *bias)?.to_f32()?.as_slice(), device),
                        options: ConvOptions::new(
                            [*stride, *stride],
                            [*padding, *padding],
                            [1, 1],
                            *groups,
                        ),
                        activation: *activation,
                    }
                }
                Op::Add => LoadedOp::Add,
                Op::Mean => LoadedOp::Mean,
                Op::FullyConnected { weight, bias } => {
                    let buffer = graph.buffer(node, *weight)?;
                    let [d_in, d_out] = <[usize; 2]>::try_from(buffer.shape.as_slice())
                        .map_err(|_| anyhow::anyhow!("node {}: dense weight must be 2-D", node.name))?;
                    LoadedOp::FullyConnected {
                        weight: Tensor::<B, 1>::from_floats(buffer.to_f32()?.as_slice(), device)
                            .reshape([d_in, d_out]),
                        bias: Tensor::from_floats(graph.buffer(node, *bias)?.to_f32()?.as_slice(), device),
                    }
                }
                Op::Softmax => LoadedOp::Softmax,
            };
            ops.push(op);
        }

        Ok(Self {
            graph,
            ops,
            device: device.clone(),
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// 全ての中間値を返す（インデックスは値番号）
    ///
    /// 量子化済みグラフでは `input` は uint8 の符号値で、返す値は逆量子化済み。
    pub fn trace(&self, input: Tensor<B, 4>) -> Result<Vec<Value<B>>> {
        let input = match &self.graph.input_quant {
            Some(params) => input
                .sub_scalar(params.zero_point as f32)
                .mul_scalar(params.scale),
            None => input,
        };

        let mut values: Vec<Value<B>> = Vec::with_capacity(self.graph.num_values());
        values.push(Value::Map(input));

        for (node, op) in self.graph.nodes.iter().zip(&self.ops) {
            let arg = |index: usize| -> Result<Value<B>> {
                let id = *node
                    .inputs
                    .get(index)
                    .ok_or_else(|| anyhow::anyhow!("node {} is missing input {}", node.name, index))?;
                values
                    .get(id)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("node {} reads undefined value {}", node.name, id))
            };

            let output = match op {
                LoadedOp::Conv2d {
                    weight,
                    bias,
                    options,
                    activation,
                } => {
                    let x = conv2d(
                        arg(0)?.map(&node.name)?,
                        weight.clone(),
                        Some(bias.clone()),
                        options.clone(),
                    );
                    let x = match activation {
                        Activation::None => x,
                        Activation::Relu => burn::tensor::activation::relu(x),
                        Activation::Relu6 => x.clamp(0.0, 6.0),
                    };
                    Value::Map(x)
                }
                LoadedOp::Add => {
                    Value::Map(arg(0)?.map(&node.name)? + arg(1)?.map(&node.name)?)
                }
                LoadedOp::Mean => {
                    let x = arg(0)?.map(&node.name)?.mean_dim(3).mean_dim(2);
                    let [batch_size, channels, _, _] = x.dims();
                    Value::Flat(x.reshape([batch_size, channels]))
                }
                LoadedOp::FullyConnected { weight, bias } => {
                    let x = arg(0)?.flat(&node.name)?.matmul(weight.clone());
                    Value::Flat(x + bias.clone().unsqueeze::<2>())
                }
                LoadedOp::Softmax => Value::Flat(softmax(arg(0)?.flat(&node.name)?, 1)),
            };

            let output = match &node.output_quant {
                Some(params) => output.fake_quant(params),
                None => output,
            };
            values.push(output);
        }

        Ok(values)
    }

    /// グラフを実行して最終出力を返す
    ///
    /// 浮動小数点グラフは [0, 1] の画像を受け取り確率を返す。
    /// 量子化済みグラフは uint8 の符号値を受け取り、uint8 の符号値を返す。
    pub fn run(&self, input: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let output = self
            .trace(input)?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("graph has no output"))?;
        let output = output.flat("output")?;

        match self.graph.output_quant() {
            Some(params) => Ok(output
                .div_scalar(params.scale)
                .round()
                .add_scalar(params.zero_point as f32)),
            None => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::ClassifierConfig;
    use crate::quant::graph::lower_classifier;
    use burn::module::{Param, RunningState};
    use burn::tensor::{Distribution, ElementConversion};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_lowered_graph_matches_classifier() {
        let device = Default::default();
        let mut model = ClassifierConfig::new(4)
            .with_width_multiplier(0.35)
            .with_head_filters(8)
            .init::<TestBackend>(&device);

        // BatchNorm に自明でない統計量を入れる
        for layer in model.backbone.layers.iter_mut() {
            for unit in layer.units.iter_mut() {
                let channels = unit.out_channels();
                unit.norm.gamma = Param::from_tensor(Tensor::random(
                    [channels],
                    Distribution::Uniform(0.5, 1.5),
                    &device,
                ));
                unit.norm.beta = Param::from_tensor(Tensor::random(
                    [channels],
                    Distribution::Uniform(-0.2, 0.2),
                    &device,
                ));
                unit.norm.running_mean = RunningState::new(Tensor::random(
                    [channels],
                    Distribution::Uniform(-0.1, 0.1),
                    &device,
                ));
                unit.norm.running_var = RunningState::new(Tensor::random(
                    [channels],
                    Distribution::Uniform(0.5, 2.0),
                    &device,
                ));
            }
        }

        let graph = lower_classifier(&model, 96).unwrap();
        assert!(!graph.is_quantized());
        assert_eq!(graph.num_classes(), 4);
        assert!(graph.nodes.iter().all(|node| node.op.kind() != "DROPOUT"));

        let images = Tensor::<TestBackend, 4>::random(
            [2, 3, 96, 96],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let (_, expected) = model.predict(images.clone());
        let executor = GraphExecutor::<TestBackend>::new(graph, &device).unwrap();
        let actual = executor.run(images).unwrap();

        let diff = (expected - actual).abs().max().into_scalar().elem::<f32>();
        assert!(diff < 1e-4, "max diff {}", diff);
    }

    #[test]
    fn test_trace_returns_every_value() {
        let device = Default::default();
        let model = ClassifierConfig::new(3)
            .with_width_multiplier(0.35)
            .with_head_filters(4)
            .init::<TestBackend>(&device);
        let graph = lower_classifier(&model, 96).unwrap();
        let num_values = graph.num_values();

        let executor = GraphExecutor::<TestBackend>::new(graph, &device).unwrap();
        let values = executor
            .trace(Tensor::zeros([1, 3, 96, 96], &device))
            .unwrap();
        assert_eq!(values.len(), num_values);
        assert!(matches!(values.last(), Some(Value::Flat(_))));
    }
}
