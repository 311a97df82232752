pub mod model_metadata;
pub mod model_storage;
pub mod inference_config;
pub mod config;

pub use model_metadata::ModelMetadata;
pub use model_storage::{save_model_with_metadata, load_metadata, load_model_with_metadata, print_metadata_info, read_bundle, write_bundle};
pub use inference_config::InferenceConfig;
pub use config::{AppConfig, CompilerSettings, DatasetSettings, DatasetSource, DeviceType, FineTuneSettings, ModelSettings, OutputSettings, PhaseSettings, QuantizationSettings, TrainingSettings};
