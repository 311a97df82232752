//! パイプライン固有のエラー定義

use std::path::PathBuf;
use thiserror::Error;

/// パイプライン実行中に発生するドメインエラー
///
/// I/O などの汎用エラーは `anyhow` で伝播し、ここでは
/// 呼び出し側が区別したい失敗だけを列挙する。
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no class directories found under {0}")]
    EmptyDataset(PathBuf),

    #[error("class directory '{class}' contains no images")]
    EmptyClass { class: String },

    #[error("dataset has {found} classes but the classifier is configured for {expected}")]
    ClassCountMismatch { expected: usize, found: usize },

    #[error("validation split must be in [0, 1), got {0}")]
    InvalidSplit(f32),

    #[error("invalid configuration '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("malformed graph: {0}")]
    MalformedGraph(String),

    #[error("operation '{op}' cannot be quantized: {reason}")]
    Unquantizable { op: String, reason: String },

    #[error("external tool '{program}' failed ({status})")]
    ToolFailed { program: String, status: String },

    #[error("expected output {0} was not produced")]
    MissingOutput(PathBuf),

    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(PathBuf),
}
