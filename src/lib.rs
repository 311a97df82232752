//! ごみ画像分類器の学習・量子化パイプライン

pub mod error;
pub mod external;
pub mod acquire;
pub mod model;
pub mod ml;
pub mod plot;
pub mod quant;
pub mod verify;
pub mod compiler;
pub mod pipeline;

#[cfg(test)]
mod test_util;

pub use error::PipelineError;
