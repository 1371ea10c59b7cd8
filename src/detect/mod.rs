//! Detection models and output extraction.
//!
//! - `backend`: the `InferenceModel` / `ModelLoader` seams
//! - `backends`: stub and tract (ONNX) implementations
//! - `registry`: static job type to model file mapping, label files
//! - `extract`: raw tensors to thresholded detections

mod backend;
pub mod backends;
mod extract;
mod registry;
mod result;

pub use backend::{InferenceModel, ModelLoader};
pub use backends::{StubLoader, StubModel};
pub use extract::extract;
pub use registry::{
    Labels, ModelEntry, ModelRegistry, ModelSpec, DEFAULT_INPUT_HEIGHT, DEFAULT_INPUT_WIDTH,
};
pub use result::{BBox, Detection, ModelOutput};

#[cfg(feature = "backend-tract")]
pub use backends::{TractLoader, TractModel};
