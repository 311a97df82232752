//! モデル変換と全整数量子化

pub mod artifact;
pub mod calibrate;
pub mod executor;
pub mod graph;
pub mod quantize;
pub mod tflite;

pub use artifact::{load_graph, save_graph};
pub use calibrate::{calibrate, ValueRange};
pub use executor::GraphExecutor;
pub use graph::{lower_classifier, Graph, QuantParams};
pub use quantize::quantize_graph;
pub use tflite::{encode_tflite, save_tflite};
