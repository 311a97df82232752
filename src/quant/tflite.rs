//! TFLite 形式への書き出し
//!
//! 量子化済みグラフを TFLite のフラットバッファ（識別子 `TFL3`）に変換する。
//! テンソルは NHWC 配置で、モデルの入出力は uint8、内部は int8。
//! 入出力の型変換には QUANTIZE を挟み、パディング付きの畳み込みは
//! PAD と VALID 畳み込みに分ける。

use anyhow::{Context, Result};
use flatbuffers::{FlatBufferBuilder, TableFinishedWIPOffset, WIPOffset};
use std::path::Path;

use crate::error::PipelineError;
use crate::quant::graph::{Activation, Buffer, BufferData, Graph, Node, Op, QuantParams, QuantType};

pub const FILE_IDENTIFIER: &str = "TFL3";
const SCHEMA_VERSION: u32 = 3;

// BuiltinOperator
const OP_ADD: i32 = 0;
const OP_CONV_2D: i32 = 3;
const OP_DEPTHWISE_CONV_2D: i32 = 4;
const OP_FULLY_CONNECTED: i32 = 9;
const OP_SOFTMAX: i32 = 25;
const OP_PAD: i32 = 34;
const OP_MEAN: i32 = 40;
const OP_QUANTIZE: i32 = 114;

// TensorType
const TENSOR_INT32: i8 = 2;
const TENSOR_UINT8: i8 = 3;
const TENSOR_INT8: i8 = 9;

// BuiltinOptions
const OPTIONS_CONV_2D: u8 = 1;
const OPTIONS_DEPTHWISE_CONV_2D: u8 = 2;
const OPTIONS_FULLY_CONNECTED: u8 = 8;
const OPTIONS_SOFTMAX: u8 = 9;
const OPTIONS_ADD: u8 = 11;
const OPTIONS_REDUCER: u8 = 27;

const PADDING_VALID: i8 = 1;

type Offset = WIPOffset<TableFinishedWIPOffset>;

/// テーブルの `index` 番目のフィールドの vtable オフセット
const fn field(index: u16) -> u16 {
    4 + 2 * index
}

fn fused_activation(activation: Activation) -> i8 {
    match activation {
        Activation::None => 0,
        Activation::Relu => 1,
        Activation::Relu6 => 3,
    }
}

#[derive(Debug, Clone)]
struct TensorQuant {
    scales: Vec<f32>,
    zero_points: Vec<i64>,
    axis: i32,
}

impl TensorQuant {
    fn per_tensor(params: QuantParams) -> Self {
        Self {
            scales: vec![params.scale],
            zero_points: vec![params.zero_point as i64],
            axis: 0,
        }
    }

    fn per_channel(scales: &[f32], axis: i32) -> Self {
        Self {
            scales: scales.to_vec(),
            zero_points: vec![0; scales.len()],
            axis,
        }
    }
}

#[derive(Debug)]
struct TensorSpec {
    name: String,
    shape: Vec<i32>,
    dtype: i8,
    buffer: u32,
    quant: Option<TensorQuant>,
}

#[derive(Debug, Clone, Copy)]
enum Options {
    None,
    Conv2d { stride: i32, activation: i8 },
    DepthwiseConv2d { stride: i32, activation: i8 },
    FullyConnected,
    Softmax,
    Add,
    Reducer,
}

#[derive(Debug)]
struct OperatorSpec {
    opcode_index: u32,
    inputs: Vec<i32>,
    outputs: Vec<i32>,
    options: Options,
}

/// 変換中の値（int8 側の表現）
#[derive(Debug, Clone)]
struct Value {
    tensor: i32,
    shape: Vec<usize>,
    quant: QuantParams,
}

/// 書き出す前のモデル
#[derive(Debug)]
struct ModelSpec {
    opcodes: Vec<i32>,
    tensors: Vec<TensorSpec>,
    operators: Vec<OperatorSpec>,
    /// 0 番は活性化用の空バッファ
    buffers: Vec<Vec<u8>>,
    inputs: Vec<i32>,
    outputs: Vec<i32>,
}

impl ModelSpec {
    fn new() -> Self {
        Self {
            opcodes: Vec::new(),
            tensors: Vec::new(),
            operators: Vec::new(),
            buffers: vec![Vec::new()],
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn push_tensor(&mut self, tensor: TensorSpec) -> i32 {
        self.tensors.push(tensor);
        self.tensors.len() as i32 - 1
    }

    fn activation(&mut self, name: &str, shape: &[usize], quant: QuantParams) -> i32 {
        self.push_tensor(TensorSpec {
            name: name.to_string(),
            shape: shape.iter().map(|d| *d as i32).collect(),
            dtype: dtype_code(quant.dtype),
            buffer: 0,
            quant: Some(TensorQuant::per_tensor(quant)),
        })
    }

    fn constant(
        &mut self,
        name: &str,
        shape: &[usize],
        dtype: i8,
        data: Vec<u8>,
        quant: Option<TensorQuant>,
    ) -> i32 {
        self.buffers.push(data);
        let buffer = self.buffers.len() as u32 - 1;
        self.push_tensor(TensorSpec {
            name: name.to_string(),
            shape: shape.iter().map(|d| *d as i32).collect(),
            dtype,
            buffer,
            quant,
        })
    }

    fn int32_constant(&mut self, name: &str, shape: &[usize], values: &[i32]) -> i32 {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.constant(name, shape, TENSOR_INT32, data, None)
    }

    fn operator(&mut self, opcode: i32, inputs: Vec<i32>, outputs: Vec<i32>, options: Options) {
        let opcode_index = match self.opcodes.iter().position(|code| *code == opcode) {
            Some(index) => index,
            None => {
                self.opcodes.push(opcode);
                self.opcodes.len() - 1
            }
        };
        self.operators.push(OperatorSpec {
            opcode_index: opcode_index as u32,
            inputs,
            outputs,
            options,
        });
    }

    /// uint8 の値を int8 へ変換する（int8 ならそのまま）
    fn requantize_int8(&mut self, name: &str, tensor: i32, shape: Vec<usize>, quant: QuantParams) -> Value {
        let int8 = int8_view(quant);
        if quant.dtype == QuantType::Int8 {
            return Value { tensor, shape, quant };
        }
        let converted = self.activation(&format!("{}/int8", name), &shape, int8);
        self.operator(OP_QUANTIZE, vec![tensor], vec![converted], Options::None);
        Value {
            tensor: converted,
            shape,
            quant: int8,
        }
    }
}

fn dtype_code(dtype: QuantType) -> i8 {
    match dtype {
        QuantType::Int8 => TENSOR_INT8,
        QuantType::Uint8 => TENSOR_UINT8,
    }
}

/// 同じ実数値を表す int8 のパラメータ
fn int8_view(params: QuantParams) -> QuantParams {
    match params.dtype {
        QuantType::Int8 => params,
        QuantType::Uint8 => QuantParams {
            zero_point: params.zero_point - 128,
            dtype: QuantType::Int8,
            ..params
        },
    }
}

fn malformed(node: &Node, reason: impl Into<String>) -> anyhow::Error {
    PipelineError::MalformedGraph(format!("node {}: {}", node.name, reason.into())).into()
}

fn int8_codes<'a>(node: &Node, buffer: &'a Buffer) -> Result<&'a [i8]> {
    match &buffer.data {
        BufferData::I8(codes) => Ok(codes),
        _ => Err(malformed(node, "weights are not int8")),
    }
}

fn int32_bytes(node: &Node, buffer: &Buffer) -> Result<Vec<u8>> {
    match &buffer.data {
        BufferData::I32(codes) => Ok(codes.iter().flat_map(|v| v.to_le_bytes()).collect()),
        _ => Err(malformed(node, "biases are not int32")),
    }
}

fn input_value<'a>(values: &'a [Value], node: &Node, slot: usize) -> Result<&'a Value> {
    node.inputs
        .get(slot)
        .and_then(|id| values.get(*id))
        .ok_or_else(|| malformed(node, "missing input"))
}

/// 畳み込み（必要なら前に PAD を置く）
fn lower_conv(model: &mut ModelSpec, graph: &Graph, node: &Node, values: &[Value]) -> Result<Value> {
    let Op::Conv2d { weight, bias, stride, padding, groups, activation } = node.op else {
        return Err(malformed(node, "not a convolution"));
    };
    let input = input_value(values, node, 0)?.clone();
    let quant = int8_view(node.output_quant.ok_or_else(|| malformed(node, "missing quantization"))?);
    let weight = graph.buffer(node, weight)?;
    let bias = graph.buffer(node, bias)?;
    let [out_channels, in_per_group, kh, kw] = weight.shape[..] else {
        return Err(malformed(node, "weight must be 4-D"));
    };
    let [_, height, width, in_channels] = input.shape[..] else {
        return Err(malformed(node, "input must be NHWC"));
    };

    let depthwise = groups > 1;
    if depthwise && !(groups == in_channels && out_channels == in_channels && in_per_group == 1) {
        return Err(PipelineError::Unquantizable {
            op: node.name.clone(),
            reason: format!("grouped convolution with {} groups", groups),
        }
        .into());
    }
    if !depthwise && in_per_group != in_channels {
        return Err(malformed(node, format!("expects {} input channels, got {}", in_per_group, in_channels)));
    }

    let mut source = input.tensor;
    let (padded_h, padded_w) = (height + 2 * padding, width + 2 * padding);
    if padding > 0 {
        let p = padding as i32;
        let paddings = model.int32_constant(
            &format!("{}/paddings", node.name),
            &[4, 2],
            &[0, 0, p, p, p, p, 0, 0],
        );
        let padded = model.activation(
            &format!("{}/pad", node.name),
            &[1, padded_h, padded_w, in_channels],
            input.quant,
        );
        model.operator(OP_PAD, vec![source, paddings], vec![padded], Options::None);
        source = padded;
    }
    if padded_h < kh || padded_w < kw || stride == 0 {
        return Err(malformed(node, "kernel does not fit the input"));
    }
    let out_h = (padded_h - kh) / stride + 1;
    let out_w = (padded_w - kw) / stride + 1;

    let codes = int8_codes(node, weight)?;
    let (weight_shape, reordered, axis) = if depthwise {
        // [out, 1, kh, kw] -> [1, kh, kw, out]
        let mut data = vec![0u8; codes.len()];
        for o in 0..out_channels {
            for y in 0..kh {
                for x in 0..kw {
                    data[(y * kw + x) * out_channels + o] = codes[(o * kh + y) * kw + x] as u8;
                }
            }
        }
        (vec![1, kh, kw, out_channels], data, 3)
    } else {
        // [out, in, kh, kw] -> [out, kh, kw, in]
        let mut data = vec![0u8; codes.len()];
        for o in 0..out_channels {
            for i in 0..in_channels {
                for y in 0..kh {
                    for x in 0..kw {
                        data[((o * kh + y) * kw + x) * in_channels + i] =
                            codes[((o * in_channels + i) * kh + y) * kw + x] as u8;
                    }
                }
            }
        }
        (vec![out_channels, kh, kw, in_channels], data, 0)
    };
    let weight_tensor = model.constant(
        &format!("{}/weight", node.name),
        &weight_shape,
        TENSOR_INT8,
        reordered,
        Some(TensorQuant::per_channel(&weight.scales, axis)),
    );
    let bias_tensor = model.constant(
        &format!("{}/bias", node.name),
        &[out_channels],
        TENSOR_INT32,
        int32_bytes(node, bias)?,
        Some(TensorQuant::per_channel(&bias.scales, 0)),
    );

    let shape = vec![1, out_h, out_w, out_channels];
    let output = model.activation(&node.name, &shape, quant);
    let (opcode, options) = if depthwise {
        (
            OP_DEPTHWISE_CONV_2D,
            Options::DepthwiseConv2d {
                stride: stride as i32,
                activation: fused_activation(activation),
            },
        )
    } else {
        (
            OP_CONV_2D,
            Options::Conv2d {
                stride: stride as i32,
                activation: fused_activation(activation),
            },
        )
    };
    model.operator(opcode, vec![source, weight_tensor, bias_tensor], vec![output], options);
    Ok(Value {
        tensor: output,
        shape,
        quant,
    })
}

fn lower_fully_connected(
    model: &mut ModelSpec,
    graph: &Graph,
    node: &Node,
    values: &[Value],
) -> Result<Value> {
    let Op::FullyConnected { weight, bias } = node.op else {
        return Err(malformed(node, "not a fully connected layer"));
    };
    let input = input_value(values, node, 0)?;
    let quant = int8_view(node.output_quant.ok_or_else(|| malformed(node, "missing quantization"))?);
    let weight = graph.buffer(node, weight)?;
    let bias = graph.buffer(node, bias)?;
    let [in_features, out_features] = weight.shape[..] else {
        return Err(malformed(node, "weight must be 2-D"));
    };
    if input.shape != [1, in_features] {
        return Err(malformed(node, format!("expects {} features, got {:?}", in_features, input.shape)));
    }

    // [in, out] -> [out, in]
    let codes = int8_codes(node, weight)?;
    let mut data = vec![0u8; codes.len()];
    for i in 0..in_features {
        for o in 0..out_features {
            data[o * in_features + i] = codes[i * out_features + o] as u8;
        }
    }
    let weight_tensor = model.constant(
        &format!("{}/weight", node.name),
        &[out_features, in_features],
        TENSOR_INT8,
        data,
        Some(TensorQuant::per_channel(&weight.scales, 0)),
    );
    let bias_tensor = model.constant(
        &format!("{}/bias", node.name),
        &[out_features],
        TENSOR_INT32,
        int32_bytes(node, bias)?,
        Some(TensorQuant::per_channel(&bias.scales, 0)),
    );

    let shape = vec![1, out_features];
    let output = model.activation(&node.name, &shape, quant);
    model.operator(
        OP_FULLY_CONNECTED,
        vec![input.tensor, weight_tensor, bias_tensor],
        vec![output],
        Options::FullyConnected,
    );
    Ok(Value {
        tensor: output,
        shape,
        quant,
    })
}

fn lower(graph: &Graph) -> Result<ModelSpec> {
    graph.validate()?;
    let input_quant = graph
        .input_quant
        .ok_or_else(|| anyhow::anyhow!("Only quantized graphs can be written as TFLite"))?;

    let mut model = ModelSpec::new();
    let [channels, height, width] = graph.input_shape;
    let input_shape = vec![1, height, width, channels];
    let input = model.activation("input", &input_shape, input_quant);
    model.inputs.push(input);
    let mut values = vec![model.requantize_int8("input", input, input_shape, input_quant)];

    for node in &graph.nodes {
        let value = match &node.op {
            Op::Conv2d { .. } => lower_conv(&mut model, graph, node, &values)?,
            Op::FullyConnected { .. } => lower_fully_connected(&mut model, graph, node, &values)?,
            Op::Add | Op::Mean | Op::Softmax => {
                let input = input_value(&values, node, 0)?.clone();
                let quant =
                    int8_view(node.output_quant.ok_or_else(|| malformed(node, "missing quantization"))?);
                let (shape, opcode, mut inputs, options) = match node.op {
                    Op::Add => {
                        let other = input_value(&values, node, 1)?;
                        if other.shape != input.shape {
                            return Err(malformed(node, "operand shapes differ"));
                        }
                        (input.shape.clone(), OP_ADD, vec![other.tensor], Options::Add)
                    }
                    Op::Mean => {
                        let [_, _, _, c] = input.shape[..] else {
                            return Err(malformed(node, "input must be NHWC"));
                        };
                        let axes = model.int32_constant(&format!("{}/axes", node.name), &[2], &[1, 2]);
                        (vec![1, c], OP_MEAN, vec![axes], Options::Reducer)
                    }
                    _ => (input.shape.clone(), OP_SOFTMAX, Vec::new(), Options::Softmax),
                };
                inputs.insert(0, input.tensor);
                let output = model.activation(&node.name, &shape, quant);
                model.operator(opcode, inputs, vec![output], options);
                Value {
                    tensor: output,
                    shape,
                    quant,
                }
            }
        };
        values.push(value);
    }

    let (last, last_node) = match (values.last(), graph.nodes.last()) {
        (Some(last), Some(node)) => (last.clone(), node),
        _ => return Err(PipelineError::MalformedGraph("graph has no nodes".to_string()).into()),
    };
    match last_node.output_quant {
        Some(params) if params.dtype == QuantType::Uint8 => {
            let output = model.activation("output", &last.shape, params);
            model.operator(OP_QUANTIZE, vec![last.tensor], vec![output], Options::None);
            model.outputs.push(output);
        }
        _ => model.outputs.push(last.tensor),
    }
    Ok(model)
}

fn write_options(fbb: &mut FlatBufferBuilder, options: Options) -> Option<(u8, Offset)> {
    let kind = match options {
        Options::None => return None,
        Options::Conv2d { .. } => OPTIONS_CONV_2D,
        Options::DepthwiseConv2d { .. } => OPTIONS_DEPTHWISE_CONV_2D,
        Options::FullyConnected => OPTIONS_FULLY_CONNECTED,
        Options::Softmax => OPTIONS_SOFTMAX,
        Options::Add => OPTIONS_ADD,
        Options::Reducer => OPTIONS_REDUCER,
    };

    let start = fbb.start_table();
    match options {
        Options::Conv2d { stride, activation } => {
            fbb.push_slot::<i8>(field(0), PADDING_VALID, 0);
            fbb.push_slot::<i32>(field(1), stride, 0);
            fbb.push_slot::<i32>(field(2), stride, 0);
            fbb.push_slot::<i8>(field(3), activation, 0);
        }
        Options::DepthwiseConv2d { stride, activation } => {
            fbb.push_slot::<i8>(field(0), PADDING_VALID, 0);
            fbb.push_slot::<i32>(field(1), stride, 0);
            fbb.push_slot::<i32>(field(2), stride, 0);
            fbb.push_slot::<i32>(field(3), 1, 0);
            fbb.push_slot::<i8>(field(4), activation, 0);
        }
        Options::Softmax => fbb.push_slot::<f32>(field(0), 1.0, 0.0),
        // 既定値のみ
        Options::None | Options::FullyConnected | Options::Add | Options::Reducer => {}
    }
    Some((kind, fbb.end_table(start)))
}

fn write_tensor(fbb: &mut FlatBufferBuilder, tensor: &TensorSpec) -> Offset {
    let shape = fbb.create_vector(&tensor.shape);
    let name = fbb.create_string(&tensor.name);
    let quant = tensor.quant.as_ref().map(|quant| {
        let scales = fbb.create_vector(&quant.scales);
        let zero_points = fbb.create_vector(&quant.zero_points);
        let start = fbb.start_table();
        fbb.push_slot_always(field(2), scales);
        fbb.push_slot_always(field(3), zero_points);
        fbb.push_slot::<i32>(field(6), quant.axis, 0);
        fbb.end_table(start)
    });

    let start = fbb.start_table();
    fbb.push_slot_always(field(0), shape);
    fbb.push_slot::<i8>(field(1), tensor.dtype, 0);
    fbb.push_slot::<u32>(field(2), tensor.buffer, 0);
    fbb.push_slot_always(field(3), name);
    if let Some(quant) = quant {
        fbb.push_slot_always(field(4), quant);
    }
    fbb.end_table(start)
}

fn write_operator(fbb: &mut FlatBufferBuilder, operator: &OperatorSpec) -> Offset {
    let inputs = fbb.create_vector(&operator.inputs);
    let outputs = fbb.create_vector(&operator.outputs);
    let options = write_options(fbb, operator.options);

    let start = fbb.start_table();
    fbb.push_slot::<u32>(field(0), operator.opcode_index, 0);
    fbb.push_slot_always(field(1), inputs);
    fbb.push_slot_always(field(2), outputs);
    if let Some((kind, table)) = options {
        fbb.push_slot::<u8>(field(3), kind, 0);
        fbb.push_slot_always(field(4), table);
    }
    fbb.end_table(start)
}

fn encode(model: &ModelSpec) -> Vec<u8> {
    let mut fbb = FlatBufferBuilder::new();

    let mut opcodes = Vec::with_capacity(model.opcodes.len());
    for code in &model.opcodes {
        let start = fbb.start_table();
        fbb.push_slot::<i8>(field(0), (*code).min(127) as i8, 0);
        fbb.push_slot::<i32>(field(3), *code, 0);
        opcodes.push(fbb.end_table(start));
    }

    let mut buffers = Vec::with_capacity(model.buffers.len());
    for data in &model.buffers {
        let data = (!data.is_empty()).then(|| fbb.create_vector(data));
        let start = fbb.start_table();
        if let Some(data) = data {
            fbb.push_slot_always(field(0), data);
        }
        buffers.push(fbb.end_table(start));
    }

    let tensors: Vec<Offset> = model.tensors.iter().map(|t| write_tensor(&mut fbb, t)).collect();
    let operators: Vec<Offset> = model.operators.iter().map(|o| write_operator(&mut fbb, o)).collect();

    let tensors = fbb.create_vector(&tensors);
    let inputs = fbb.create_vector(&model.inputs);
    let outputs = fbb.create_vector(&model.outputs);
    let operators = fbb.create_vector(&operators);
    let name = fbb.create_string("main");
    let start = fbb.start_table();
    fbb.push_slot_always(field(0), tensors);
    fbb.push_slot_always(field(1), inputs);
    fbb.push_slot_always(field(2), outputs);
    fbb.push_slot_always(field(3), operators);
    fbb.push_slot_always(field(4), name);
    let subgraph = fbb.end_table(start);

    let opcodes = fbb.create_vector(&opcodes);
    let subgraphs = fbb.create_vector(&[subgraph]);
    let description = fbb.create_string(concat!("garbage-classifier ", env!("CARGO_PKG_VERSION")));
    let buffers = fbb.create_vector(&buffers);
    let start = fbb.start_table();
    fbb.push_slot::<u32>(field(0), SCHEMA_VERSION, 0);
    fbb.push_slot_always(field(1), opcodes);
    fbb.push_slot_always(field(2), subgraphs);
    fbb.push_slot_always(field(3), description);
    fbb.push_slot_always(field(4), buffers);
    let root = fbb.end_table(start);

    fbb.finish(root, Some(FILE_IDENTIFIER));
    fbb.finished_data().to_vec()
}

/// 量子化済みグラフを TFLite のバイト列にする
pub fn encode_tflite(graph: &Graph) -> Result<Vec<u8>> {
    let model = lower(graph)?;
    Ok(encode(&model))
}

/// 量子化済みグラフを `.tflite` ファイルに書き出す
pub fn save_tflite(path: &Path, graph: &Graph) -> Result<()> {
    let model = lower(graph)?;
    let bytes = encode(&model);
    std::fs::write(path, &bytes)
        .with_context(|| format!("Failed to write TFLite model: {}", path.display()))?;
    log::info!(
        "TFLite モデルを書き出しました: {} ({} 演算, {} バイト)",
        path.display(),
        model.operators.len(),
        bytes.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::ClassifierConfig;
    use crate::quant::calibrate::{calibrate, ValueRange};
    use crate::quant::executor::GraphExecutor;
    use crate::quant::graph::lower_classifier;
    use crate::quant::quantize::quantize_graph;
    use crate::test_util::scratch_dir;
    use burn_ndarray::NdArray;
    use flatbuffers::{ForwardsUOffset, Table, Vector};

    type TestBackend = NdArray<f32>;
    type Tables<'a> = ForwardsUOffset<Vector<'a, ForwardsUOffset<Table<'a>>>>;

    fn quantized_graph() -> Graph {
        let device = Default::default();
        let model = ClassifierConfig::new(3)
            .with_width_multiplier(0.35)
            .with_head_filters(4)
            .init::<TestBackend>(&device);
        let graph = lower_classifier(&model, 96).unwrap();
        let executor = GraphExecutor::<TestBackend>::new(graph.clone(), &device).unwrap();
        let samples: Vec<Vec<f32>> = (0..2)
            .map(|i| vec![0.2 + 0.3 * i as f32; 3 * 96 * 96])
            .collect();
        let ranges: Vec<ValueRange> = calibrate(&executor, &samples).unwrap();
        quantize_graph(&graph, &ranges).unwrap()
    }

    #[test]
    fn test_model_structure() {
        let graph = quantized_graph();
        let bytes = encode_tflite(&graph).unwrap();
        assert!(flatbuffers::buffer_has_identifier(&bytes, FILE_IDENTIFIER, false));

        let padded = graph
            .nodes
            .iter()
            .filter(|node| matches!(node.op, Op::Conv2d { padding, .. } if padding > 0))
            .count();
        // 入力と出力の QUANTIZE を含む
        let expected_ops = graph.nodes.len() + padded + 2;

        unsafe {
            let model = flatbuffers::root_unchecked::<Table>(&bytes);
            assert_eq!(model.get::<u32>(field(0), Some(0)), Some(SCHEMA_VERSION));
            let subgraphs = model.get::<Tables>(field(2), None).unwrap();
            assert_eq!(subgraphs.len(), 1);
            let subgraph = subgraphs.get(0);
            let operators = subgraph.get::<Tables>(field(3), None).unwrap();
            assert_eq!(operators.len(), expected_ops);

            let tensors = subgraph.get::<Tables>(field(0), None).unwrap();
            let inputs = subgraph
                .get::<ForwardsUOffset<Vector<i32>>>(field(1), None)
                .unwrap();
            let input = tensors.get(inputs.get(0) as usize);
            assert_eq!(input.get::<i8>(field(1), Some(0)), Some(TENSOR_UINT8));
            let shape = input
                .get::<ForwardsUOffset<Vector<i32>>>(field(0), None)
                .unwrap();
            assert_eq!(shape.iter().collect::<Vec<_>>(), vec![1, 96, 96, 3]);

            let outputs = subgraph
                .get::<ForwardsUOffset<Vector<i32>>>(field(2), None)
                .unwrap();
            let output = tensors.get(outputs.get(0) as usize);
            assert_eq!(output.get::<i8>(field(1), Some(0)), Some(TENSOR_UINT8));
            let shape = output
                .get::<ForwardsUOffset<Vector<i32>>>(field(0), None)
                .unwrap();
            assert_eq!(shape.iter().collect::<Vec<_>>(), vec![1, 3]);
        }
    }

    #[test]
    fn test_file_is_deterministic() {
        let dir = scratch_dir("tflite_deterministic");
        let graph = quantized_graph();
        let first = dir.join("first.tflite");
        let second = dir.join("second.tflite");
        save_tflite(&first, &graph).unwrap();
        save_tflite(&second, &graph).unwrap();
        assert_eq!(std::fs::read(first).unwrap(), std::fs::read(second).unwrap());
    }

    #[test]
    fn test_float_graph_is_rejected() {
        let model = ClassifierConfig::new(3)
            .with_width_multiplier(0.35)
            .with_head_filters(4)
            .init::<TestBackend>(&Default::default());
        let graph = lower_classifier(&model, 96).unwrap();
        assert!(encode_tflite(&graph).is_err());
    }

    #[test]
    fn test_unsupported_groups_are_rejected() {
        let mut graph = quantized_graph();
        let node = graph
            .nodes
            .iter_mut()
            .find(|node| matches!(node.op, Op::Conv2d { groups, .. } if groups > 1))
            .unwrap();
        if let Op::Conv2d { groups, .. } = &mut node.op {
            *groups -= 1;
        }
        let err = encode_tflite(&graph).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Unquantizable { .. })
        ));
    }
}
