pub mod mobilenet;
pub mod ml_model;
pub mod dataset;
pub mod training;
pub mod inference;

pub use mobilenet::{MobileNetV2, MobileNetV2Config};
pub use ml_model::{Classifier, ClassifierConfig, FreezePolicy, LayerPartition, partition_layers, load_image_with_size, save_classifier_bundle, load_classifier_bundle, NUM_CLASSES, IMAGE_SIZE};
pub use dataset::{ImageBatch, ImageBatcher, ImageDataset, ImageFolder, ImageItem, build_loader, batches_per_epoch, load_representative};
pub use training::{EpochStats, PhaseSchedule, TrainingHistory, train_phase, restore_for_training, load_checkpoint, CHECKPOINT_DIR};
pub use inference::{InferenceEngine, Prediction};
