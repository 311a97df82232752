//! 変換済みモデルの保存形式
//!
//! tar.gz バンドル内部:
//! - graph.json    - ノード列、入出力の量子化パラメータ、バッファ目録
//! - tensors.bin   - 全バッファのリトルエンディアン連結
//! - metadata.json - ラベルなどのメタデータ
//!
//! 学習日時は同梱しないため、同じグラフとメタデータからは常に同じバイト列になる。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::model::model_storage::{read_bundle, take_entry, write_bundle, METADATA_ENTRY};
use crate::model::ModelMetadata;
use crate::quant::graph::{Buffer, BufferData, Graph, Node, QuantParams};

pub const GRAPH_ENTRY: &str = "graph.json";
pub const TENSORS_ENTRY: &str = "tensors.bin";

/// 形式のバージョン
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DType {
    F32,
    I8,
    I32,
}

#[derive(Debug, Serialize, Deserialize)]
struct BufferEntry {
    shape: Vec<usize>,
    dtype: DType,
    /// tensors.bin 内のバイトオフセット
    offset: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    scales: Vec<f32>,
    #[serde(default)]
    axis: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphManifest {
    version: u32,
    input_shape: [usize; 3],
    input_quant: Option<QuantParams>,
    nodes: Vec<Node>,
    buffers: Vec<BufferEntry>,
}

fn encode_buffers(buffers: &[Buffer]) -> (Vec<BufferEntry>, Vec<u8>) {
    let mut bytes = Vec::new();
    let mut entries = Vec::with_capacity(buffers.len());

    for buffer in buffers {
        let offset = bytes.len();
        let dtype = match &buffer.data {
            BufferData::F32(values) => {
                values.iter().for_each(|v| bytes.extend_from_slice(&v.to_le_bytes()));
                DType::F32
            }
            BufferData::I8(values) => {
                values.iter().for_each(|v| bytes.extend_from_slice(&v.to_le_bytes()));
                DType::I8
            }
            BufferData::I32(values) => {
                values.iter().for_each(|v| bytes.extend_from_slice(&v.to_le_bytes()));
                DType::I32
            }
        };
        entries.push(BufferEntry {
            shape: buffer.shape.clone(),
            dtype,
            offset,
            scales: buffer.scales.clone(),
            axis: buffer.axis,
        });
    }

    (entries, bytes)
}

fn decode_buffer(entry: &BufferEntry, bytes: &[u8]) -> Result<Buffer> {
    let count: usize = entry.shape.iter().product();
    let width = match entry.dtype {
        DType::F32 | DType::I32 => 4,
        DType::I8 => 1,
    };
    let raw = count
        .checked_mul(width)
        .and_then(|len| entry.offset.checked_add(len))
        .and_then(|end| bytes.get(entry.offset..end))
        .ok_or_else(|| anyhow::anyhow!("buffer at offset {} exceeds tensors.bin", entry.offset))?;

    let data = match entry.dtype {
        DType::F32 => BufferData::F32(
            raw.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DType::I32 => BufferData::I32(
            raw.chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DType::I8 => BufferData::I8(raw.iter().map(|b| *b as i8).collect()),
    };

    Ok(Buffer {
        shape: entry.shape.clone(),
        data,
        scales: entry.scales.clone(),
        axis: entry.axis,
    })
}

/// グラフをメタデータと共に保存
///
/// メタデータの学習日時は書き込まない。
pub fn save_graph(path: &Path, graph: &Graph, metadata: &ModelMetadata) -> Result<()> {
    let (buffers, tensors) = encode_buffers(&graph.buffers);
    let manifest = GraphManifest {
        version: FORMAT_VERSION,
        input_shape: graph.input_shape,
        input_quant: graph.input_quant,
        nodes: graph.nodes.clone(),
        buffers,
    };
    let manifest_json = serde_json::to_string_pretty(&manifest)?;
    let metadata_json = metadata.clone().without_timestamp().to_json_string()?;

    write_bundle(
        path,
        &[
            (GRAPH_ENTRY, manifest_json.as_bytes()),
            (TENSORS_ENTRY, tensors.as_slice()),
            (METADATA_ENTRY, metadata_json.as_bytes()),
        ],
    )?;

    log::info!(
        "グラフを保存しました: {} ({} ノード, {}, tensors {:.2} MB)",
        path.display(),
        graph.nodes.len(),
        if graph.is_quantized() { "int8" } else { "float32" },
        tensors.len() as f64 / 1024.0 / 1024.0
    );
    Ok(())
}

/// グラフとメタデータを読み込む
pub fn load_graph(path: &Path) -> Result<(Graph, ModelMetadata)> {
    let mut entries = read_bundle(path)?;
    let manifest = take_entry(&mut entries, GRAPH_ENTRY, path)?;
    let tensors = take_entry(&mut entries, TENSORS_ENTRY, path)?;
    let metadata = take_entry(&mut entries, METADATA_ENTRY, path)?;

    let manifest: GraphManifest = serde_json::from_slice(&manifest)
        .with_context(|| format!("Failed to parse {} in {}", GRAPH_ENTRY, path.display()))?;
    if manifest.version != FORMAT_VERSION {
        anyhow::bail!(
            "unsupported graph format version {} in {}",
            manifest.version,
            path.display()
        );
    }
    let metadata = String::from_utf8(metadata).context("metadata.json is not valid UTF-8")?;
    let metadata = ModelMetadata::from_json_string(&metadata)?;

    let buffers = manifest
        .buffers
        .iter()
        .map(|entry| decode_buffer(entry, &tensors))
        .collect::<Result<Vec<_>>>()?;

    let graph = Graph {
        input_shape: manifest.input_shape,
        input_quant: manifest.input_quant,
        nodes: manifest.nodes,
        buffers,
    };
    graph
        .validate()
        .with_context(|| format!("Invalid graph in {}", path.display()))?;
    if graph.num_classes() != metadata.num_classes() {
        anyhow::bail!(
            "graph in {} outputs {} classes but its metadata lists {}",
            path.display(),
            graph.num_classes(),
            metadata.num_classes()
        );
    }

    Ok((graph, metadata))
}
