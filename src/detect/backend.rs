use anyhow::Result;

use super::registry::ModelSpec;
use super::result::ModelOutput;

/// A loaded, ready-to-invoke detection model.
///
/// Implementations own all interpreter state. A model is only ever driven by
/// one stream session at a time, so `invoke` takes `&mut self`.
pub trait InferenceModel: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Fixed input dimensions `(width, height)` frames must be resized to.
    fn input_size(&self) -> (u32, u32);

    /// Run the model on one RGB8 frame of exactly `input_size()` pixels.
    fn invoke(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<ModelOutput>;
}

/// Builds models from registry entries.
///
/// This is the only place that touches model files. The model cache decides
/// when to call it.
pub trait ModelLoader: Send {
    /// Loader identifier.
    fn name(&self) -> &'static str;

    /// Load the model described by `spec`. Paths in `spec` are already
    /// resolved against the model directory.
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn InferenceModel>>;
}
