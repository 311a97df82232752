//! 全整数量子化
//!
//! - 活性化: テンソル単位の非対称 int8（範囲は必ず 0 を含む）
//! - 重み: 出力チャネル単位の対称 int8 (-127..=127)
//! - バイアス: int32、スケールは 入力スケール × 重みスケール
//!   （int32 に収まらないチャネルは重みスケールを広げて合わせる）
//! - モデルの入出力: uint8
//!
//! 非有限値を含むなど量子化できない演算があれば、浮動小数点へ戻さずに失敗する。

use anyhow::Result;

use crate::error::PipelineError;
use crate::quant::calibrate::ValueRange;
use crate::quant::graph::{Buffer, BufferData, Graph, Op, QuantParams, QuantType};

const WEIGHT_QMAX: i32 = 127;

/// バイアス符号の上限（累積の余裕として int32 の半分）
const BIAS_QMAX: f32 = (i32::MAX / 2) as f32;

/// 活性化の値域の下限
///
/// これより狭い範囲は、この幅を持つものとして扱う。
const MIN_ACTIVATION_RANGE: f32 = 1e-3;

fn unquantizable(op: &str, reason: impl Into<String>) -> anyhow::Error {
    PipelineError::Unquantizable {
        op: op.to_string(),
        reason: reason.into(),
    }
    .into()
}

/// 観測範囲から int8 の非対称パラメータを求める
pub fn asymmetric_int8(range: &ValueRange) -> Option<QuantParams> {
    if !range.is_finite() {
        return None;
    }
    let min = range.min.min(0.0);
    let max = range.max.max(0.0);
    let scale = (max - min).max(MIN_ACTIVATION_RANGE) / 255.0;
    let zero_point = (-128.0 - min / scale).round().clamp(-128.0, 127.0) as i32;
    Some(QuantParams {
        scale,
        zero_point,
        dtype: QuantType::Int8,
    })
}

/// 対称量子化のスケール
fn symmetric_scale(values: &[f32]) -> f32 {
    let max_abs = values.iter().fold(0.0f32, |acc, value| acc.max(value.abs()));
    if max_abs < 1e-12 {
        1.0
    } else {
        max_abs / WEIGHT_QMAX as f32
    }
}

fn float_values<'a>(name: &str, buffer: &'a Buffer, what: &str) -> Result<&'a [f32]> {
    let values = match &buffer.data {
        BufferData::F32(values) => values,
        _ => return Err(unquantizable(name, format!("{} are already quantized", what))),
    };
    if values.iter().any(|v| !v.is_finite()) {
        return Err(unquantizable(name, format!("{} contain non-finite values", what)));
    }
    Ok(values)
}

/// 重みとバイアスをまとめて量子化
///
/// `axis` は出力チャネルの次元（畳み込みは 0、全結合 [in, out] は 1）。
/// バイアスが int32 に収まらないチャネルは、収まるまで重みスケールを広げる。
fn quantize_weight_and_bias(
    name: &str,
    weight: &Buffer,
    bias: &Buffer,
    axis: usize,
    input: &QuantParams,
) -> Result<(Buffer, Buffer)> {
    let weights = float_values(name, weight, "weights")?;
    let biases = float_values(name, bias, "biases")?;

    let channels = *weight
        .shape
        .get(axis)
        .ok_or_else(|| unquantizable(name, format!("weight shape {:?} has no axis {}", weight.shape, axis)))?;
    if biases.len() != channels {
        return Err(unquantizable(
            name,
            format!("{} biases for {} output channels", biases.len(), channels),
        ));
    }
    let stride: usize = weight.shape.iter().skip(axis + 1).product();
    let channel_of = |index: usize| (index / stride) % channels;

    let mut per_channel = vec![Vec::new(); channels];
    for (i, v) in weights.iter().enumerate() {
        per_channel[channel_of(i)].push(*v);
    }
    let mut weight_scales: Vec<f32> = per_channel.iter().map(|v| symmetric_scale(v)).collect();

    let mut widened = 0;
    for (scale, b) in weight_scales.iter_mut().zip(biases) {
        let needed = b.abs() / (input.scale * BIAS_QMAX);
        if needed > *scale {
            *scale = needed;
            widened += 1;
        }
    }
    if widened > 0 {
        log::debug!(
            "{}: バイアスを int32 に収めるため {} チャネルの重みスケールを広げました",
            name,
            widened
        );
    }

    let quantized_weights = weights
        .iter()
        .enumerate()
        .map(|(i, v)| ((v / weight_scales[channel_of(i)]).round() as i32).clamp(-WEIGHT_QMAX, WEIGHT_QMAX) as i8)
        .collect();

    let bias_scales: Vec<f32> = weight_scales.iter().map(|s| s * input.scale).collect();
    let mut quantized_biases = Vec::with_capacity(biases.len());
    for (b, scale) in biases.iter().zip(&bias_scales) {
        let q = (b / scale).round();
        if !q.is_finite() || q.abs() > i32::MAX as f32 {
            return Err(unquantizable(name, format!("bias {} overflows int32 at scale {}", b, scale)));
        }
        quantized_biases.push(q as i32);
    }

    Ok((
        Buffer {
            shape: weight.shape.clone(),
            data: BufferData::I8(quantized_weights),
            scales: weight_scales,
            axis,
        },
        Buffer {
            shape: bias.shape.clone(),
            data: BufferData::I32(quantized_biases),
            scales: bias_scales,
            axis: 0,
        },
    ))
}

/// 浮動小数点グラフを全整数グラフへ変換
///
/// `ranges` は `calibrate` が返す値ごとの観測範囲。
pub fn quantize_graph(graph: &Graph, ranges: &[ValueRange]) -> Result<Graph> {
    if graph.is_quantized() {
        anyhow::bail!("graph is already quantized");
    }
    graph.validate()?;
    if ranges.len() != graph.num_values() {
        anyhow::bail!(
            "calibration covers {} values but the graph has {}",
            ranges.len(),
            graph.num_values()
        );
    }

    let mut quantized = Graph {
        input_shape: graph.input_shape,
        input_quant: Some(QuantParams::image_input()),
        nodes: Vec::with_capacity(graph.nodes.len()),
        buffers: graph.buffers.clone(),
    };
    // 値番号ごとの量子化パラメータ
    let mut params: Vec<QuantParams> = vec![QuantParams::image_input()];

    for (index, node) in graph.nodes.iter().enumerate() {
        let input_params = *node
            .inputs
            .first()
            .and_then(|id| params.get(*id))
            .ok_or_else(|| unquantizable(&node.name, "input value is not defined"))?;

        let parameters = match &node.op {
            Op::Conv2d { weight, bias, .. } => Some((*weight, *bias, 0)),
            Op::FullyConnected { weight, bias } => Some((*weight, *bias, 1)),
            Op::Add | Op::Mean | Op::Softmax => None,
        };
        if let Some((weight, bias, axis)) = parameters {
            let (w, b) = quantize_weight_and_bias(
                &node.name,
                graph.buffer(node, weight)?,
                graph.buffer(node, bias)?,
                axis,
                &input_params,
            )?;
            quantized.buffers[weight] = w;
            quantized.buffers[bias] = b;
        }

        let output = match node.op {
            Op::Softmax => QuantParams::softmax_output(),
            _ => asymmetric_int8(&ranges[index + 1]).ok_or_else(|| {
                unquantizable(
                    &node.name,
                    format!(
                        "{} output range [{}, {}] is not finite",
                        node.op.kind(),
                        ranges[index + 1].min,
                        ranges[index + 1].max
                    ),
                )
            })?,
        };
        params.push(output);

        let mut node = node.clone();
        node.output_quant = Some(output);
        quantized.nodes.push(node);
    }

    match quantized.output_quant() {
        Some(params) if params.dtype == QuantType::Uint8 => {}
        _ => {
            let name = quantized.nodes.last().map(|n| n.name.clone()).unwrap_or_default();
            return Err(unquantizable(&name, "model output must be a softmax"));
        }
    }

    log::info!(
        "量子化完了: {} ノード (入力 scale={:.6} zp={}, 出力 scale={:.6} zp={})",
        quantized.nodes.len(),
        QuantParams::image_input().scale,
        QuantParams::image_input().zero_point,
        QuantParams::softmax_output().scale,
        QuantParams::softmax_output().zero_point,
    );

    Ok(quantized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::calibrate::calibrate;
    use crate::quant::executor::GraphExecutor;
    use crate::quant::graph::{Activation, Node};
    use burn::tensor::{Distribution, Tensor};
    use burn_ndarray::NdArray;
    use rand::{Rng, SeedableRng};

    type TestBackend = NdArray<f32>;

    fn node(name: &str, op: Op, inputs: Vec<usize>) -> Node {
        Node {
            name: name.to_string(),
            op,
            inputs,
            output_quant: None,
        }
    }

    /// 最も明るいチャネルのクラスを選ぶ小さなグラフ
    fn channel_graph() -> Graph {
        let mut conv_weight = vec![0.0f32; 3 * 3];
        for c in 0..3 {
            conv_weight[c * 3 + c] = 1.0;
        }
        let mut fc_weight = vec![-2.0f32; 3 * 3];
        for c in 0..3 {
            fc_weight[c * 3 + c] = 8.0;
        }
        Graph {
            input_shape: [3, 8, 8],
            input_quant: None,
            nodes: vec![
                node(
                    "conv",
                    Op::Conv2d {
                        weight: 0,
                        bias: 1,
                        stride: 1,
                        padding: 0,
                        groups: 1,
                        activation: Activation::Relu6,
                    },
                    vec![0],
                ),
                node("pool", Op::Mean, vec![1]),
                node("fc", Op::FullyConnected { weight: 2, bias: 3 }, vec![2]),
                node("softmax", Op::Softmax, vec![3]),
            ],
            buffers: vec![
                Buffer::float(vec![3, 3, 1, 1], conv_weight),
                Buffer::float(vec![3], vec![0.0, 0.01, -0.01]),
                Buffer::float(vec![3, 3], fc_weight),
                Buffer::float(vec![3], vec![0.1, 0.0, -0.1]),
            ],
        }
    }

    fn samples(count: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let dominant = rng.gen_range(0..3);
                (0..3 * 64)
                    .map(|i| {
                        let base = if i / 64 == dominant { 0.6 } else { 0.0 };
                        base + rng.gen_range(0.0..0.4)
                    })
                    .collect()
            })
            .collect()
    }

    fn argmax(row: &[f32]) -> usize {
        row.iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, v)| if *v > best.1 { (i, *v) } else { best })
            .0
    }

    #[test]
    fn test_asymmetric_int8_includes_zero() {
        let params = asymmetric_int8(&ValueRange { min: 0.0, max: 6.0 }).unwrap();
        assert_eq!(params.zero_point, -128);
        assert!((params.scale - 6.0 / 255.0).abs() < 1e-7);

        let params = asymmetric_int8(&ValueRange { min: 1.0, max: 2.0 }).unwrap();
        assert_eq!(params.quantize(0.0), params.zero_point);
        assert_eq!(params.zero_point, -128);

        let params = asymmetric_int8(&ValueRange { min: -3.0, max: -1.0 }).unwrap();
        assert_eq!(params.zero_point, 127);

        // 値域が潰れていてもスケールは下限で止まる
        let params = asymmetric_int8(&ValueRange { min: 0.0, max: 0.0 }).unwrap();
        assert!((params.scale - MIN_ACTIVATION_RANGE / 255.0).abs() < 1e-10);
        let params = asymmetric_int8(&ValueRange { min: 0.0, max: 1e-9 }).unwrap();
        assert!((params.scale - MIN_ACTIVATION_RANGE / 255.0).abs() < 1e-10);
        assert_eq!(params.zero_point, -128);

        assert!(asymmetric_int8(&ValueRange { min: f32::NAN, max: 1.0 }).is_none());
    }

    fn int8_input(scale: f32) -> QuantParams {
        QuantParams {
            scale,
            zero_point: 0,
            dtype: QuantType::Int8,
        }
    }

    #[test]
    fn test_weights_are_symmetric_per_channel() {
        let weight = Buffer::float(vec![2, 2], vec![1.0, -0.25, 254.0, 127.0]);
        let bias = Buffer::float(vec![2], vec![0.0, 0.0]);
        let (w, b) = quantize_weight_and_bias("w", &weight, &bias, 0, &int8_input(0.1)).unwrap();
        assert_eq!(w.scales, vec![1.0 / 127.0, 2.0]);
        assert_eq!(w.data, BufferData::I8(vec![127, -32, 127, 64]));
        assert_eq!(b.data, BufferData::I32(vec![0, 0]));
        assert_eq!(b.scales, vec![0.1 / 127.0, 0.2]);
    }

    #[test]
    fn test_large_bias_widens_weight_scale() {
        // 入力スケールがほぼ 0 の層 (学習前のモデルで起きる)
        let input = int8_input(5.9e-15);
        let weight = Buffer::float(vec![2, 1, 1, 1], vec![0.5, 0.25]);
        let bias = Buffer::float(vec![2], vec![0.0084, 0.0]);

        let (w, b) = quantize_weight_and_bias("head.conv", &weight, &bias, 0, &input).unwrap();

        // バイアスが収まるチャネルはそのまま
        assert!((w.scales[1] - 0.25 / 127.0).abs() < 1e-9);
        assert!(w.scales[0] > 0.5 / 127.0);
        let codes = match (&w.data, &b.data) {
            (BufferData::I8(weights), BufferData::I32(biases)) => (weights.clone(), biases.clone()),
            other => panic!("unexpected buffers: {:?}", other),
        };
        assert!(codes.0.iter().all(|q| (-WEIGHT_QMAX..=WEIGHT_QMAX).contains(&(*q as i32))));
        assert!(codes.1[0].unsigned_abs() as f32 <= BIAS_QMAX * 1.001);

        // 逆量子化したバイアスは元の値を保つ
        let restored = b.to_f32().unwrap();
        assert!((restored[0] - 0.0084).abs() < 1e-6, "bias {}", restored[0]);
        assert!((b.scales[0] - w.scales[0] * input.scale).abs() <= b.scales[0] * 1e-6);
    }

    #[test]
    fn test_non_finite_bias_is_unquantizable() {
        let weight = Buffer::float(vec![1, 1], vec![1.0]);
        let bias = Buffer::float(vec![1], vec![f32::INFINITY]);
        let err = quantize_weight_and_bias("fc", &weight, &bias, 1, &int8_input(0.1)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Unquantizable { op, .. }) if op == "fc"
        ));
    }

    #[test]
    fn test_non_finite_range_is_unquantizable() {
        let graph = channel_graph();
        let mut ranges = vec![ValueRange { min: 0.0, max: 1.0 }; graph.num_values()];
        ranges[2] = ValueRange {
            min: f32::NAN,
            max: f32::NAN,
        };
        let err = quantize_graph(&graph, &ranges).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Unquantizable { op, .. }) => assert_eq!(op, "pool"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_quantized_predictions_agree_with_float() {
        let device = Default::default();
        let graph = channel_graph();
        let float_exec = GraphExecutor::<TestBackend>::new(graph.clone(), &device).unwrap();

        let representative = samples(100, 42);
        let ranges = calibrate(&float_exec, &representative).unwrap();
        let quantized = quantize_graph(&graph, &ranges).unwrap();
        assert!(quantized.is_quantized());
        assert!(quantized
            .buffers
            .iter()
            .all(|b| !matches!(b.data, BufferData::F32(_))));

        let input_params = quantized.input_quant.unwrap();
        let output_params = quantized.output_quant().unwrap();
        let quant_exec = GraphExecutor::<TestBackend>::new(quantized, &device).unwrap();

        let held_out = samples(50, 7);
        let pixels: Vec<f32> = held_out.iter().flatten().copied().collect();
        let images = Tensor::<TestBackend, 1>::from_floats(pixels.as_slice(), &device)
            .reshape([50, 3, 8, 8]);
        let codes = images
            .clone()
            .div_scalar(input_params.scale)
            .round()
            .clamp(0.0, 255.0);

        let expected = float_exec.run(images).unwrap().into_data().to_vec::<f32>().unwrap();
        let output = quant_exec.run(codes).unwrap().into_data().to_vec::<f32>().unwrap();
        assert!(output.iter().all(|q| (0.0..=255.0).contains(q)));
        let actual: Vec<f32> = output
            .iter()
            .map(|q| output_params.dequantize(*q as i32))
            .collect();

        let agree = expected
            .chunks(3)
            .zip(actual.chunks(3))
            .filter(|(e, a)| argmax(e) == argmax(a))
            .count();
        assert!(agree >= 45, "only {} of 50 predictions agree", agree);

        let max_diff = expected
            .iter()
            .zip(&actual)
            .fold(0.0f32, |acc, (e, a)| acc.max((e - a).abs()));
        assert!(max_diff < 0.05, "max diff {}", max_diff);
    }

    #[test]
    fn test_quantize_random_classifier() {
        use crate::ml::ml_model::ClassifierConfig;
        use crate::quant::graph::lower_classifier;

        let device = Default::default();
        let model = ClassifierConfig::new(6)
            .with_width_multiplier(0.35)
            .with_head_filters(4)
            .init::<TestBackend>(&device);
        let graph = lower_classifier(&model, 96).unwrap();
        let executor = GraphExecutor::<TestBackend>::new(graph.clone(), &device).unwrap();

        let representative: Vec<Vec<f32>> = (0..4)
            .map(|_| {
                Tensor::<TestBackend, 1>::random([3 * 96 * 96], Distribution::Uniform(0.0, 1.0), &device)
                    .into_data()
                    .to_vec::<f32>()
                    .unwrap()
            })
            .collect();
        let ranges = calibrate(&executor, &representative).unwrap();
        let quantized = quantize_graph(&graph, &ranges).unwrap();
        quantized.validate().unwrap();

        assert_eq!(quantized.nodes.len(), graph.nodes.len());
        assert!(quantized.nodes.iter().all(|n| n.output_quant.is_some()));
        assert_eq!(quantized.output_quant(), Some(QuantParams::softmax_output()));
        assert!(quantize_graph(&quantized, &ranges).is_err());
    }
}
