//! rollcall-core — Face detection and recognition engine.
//!
//! Detects faces with a SeetaFace funnel cascade (primary + fallback),
//! normalizes crops through a fixed preprocessing pipeline, and classifies
//! them with a pure-Rust LBPH recognizer.

pub mod augment;
pub mod detector;
pub mod labels;
pub mod preprocess;
pub mod recognizer;
pub mod sharpness;
pub mod types;

pub use augment::Augmenter;
pub use detector::{DetectorConfig, FaceDetector};
pub use labels::LabelTable;
pub use preprocess::{CropHint, Preprocessor};
pub use recognizer::{
    LbphParams, LbphRecognizer, Recognizer, TrainingError, LABELS_FILE, MODEL_FILE,
};
pub use types::{FaceBox, Prediction, UNKNOWN_LABEL};
