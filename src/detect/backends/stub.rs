use anyhow::{anyhow, Result};

use crate::detect::backend::{InferenceModel, ModelLoader};
use crate::detect::registry::ModelSpec;
use crate::detect::result::ModelOutput;

/// Model that accepts frames and never detects anything.
///
/// Used when the daemon is built without an inference backend, so the job
/// pipeline (connect, stream, timeout, publish) can still be exercised.
pub struct StubModel {
    width: u32,
    height: u32,
}

impl StubModel {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl InferenceModel for StubModel {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn invoke(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<ModelOutput> {
        let expected = (width as usize) * (height as usize) * 3;
        if rgb.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected,
                rgb.len()
            ));
        }
        Ok(ModelOutput::default())
    }
}

/// Loader for `StubModel`. Still requires the model file to exist so that a
/// misconfigured registry fails the same way it would with a real backend.
#[derive(Default)]
pub struct StubLoader;

impl StubLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModelLoader for StubLoader {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn InferenceModel>> {
        if !spec.model_file.is_file() {
            return Err(anyhow!(
                "model file {} does not exist",
                spec.model_file.display()
            ));
        }
        Ok(Box::new(StubModel::new(spec.input_width, spec.input_height)))
    }
}
