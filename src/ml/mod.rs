pub mod labels;
pub mod preprocess;
pub mod dataset;
pub mod batcher;
pub mod backbone;
pub mod classifier;
pub mod training;
pub mod inference;
pub mod export;
pub mod shapes;

pub use labels::{predict_letter, LabelSpace, NUM_CLASSES};
pub use preprocess::{ImageTransform, CHANNELS, IMAGE_SIZE};
pub use dataset::{GestureDataset, Sample};
pub use batcher::{BatchLoader, BatchSampler, GestureBatch, GestureBatcher};
pub use backbone::{Backbone, BackboneConfig, EMBEDDING_DIM};
pub use classifier::{Classifier, ClassifierConfig};
pub use training::{fit, run_training, EpochSummary, FitOptions, TrainingReport, TrainingState};
pub use inference::{InferenceEngine, Prediction};
pub use shapes::{ensure_same_shapes, param_shapes};
pub use export::{export_model, ExportOptions, ExportPrecision, MobileModel, RuntimeProfile};
