#![cfg(feature = "backend-tract")]

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{InferenceModel, ModelLoader};
use crate::detect::registry::ModelSpec;
use crate::detect::result::ModelOutput;

/// Tract-based SSD detector loaded from an ONNX file.
///
/// The model must take a `[1, 3, H, W]` f32 input scaled to 0..1 and expose
/// the four detection post-process outputs: boxes `[1, N, 4]`, classes
/// `[1, N]`, scores `[1, N]` and count `[1]`.
pub struct TractModel {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
}

impl TractModel {
    pub fn load(spec: &ModelSpec) -> Result<Self> {
        let model_path = &spec.model_file;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, spec.input_height as usize, spec.input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width: spec.input_width,
            height: spec.input_height,
        })
    }

    fn build_input(&self, rgb: &[u8], width: u32, height: u32) -> Result<Tensor> {
        if width != self.width || height != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                width,
                height,
                self.width,
                self.height
            ));
        }

        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if rgb.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected_len,
                rgb.len()
            ));
        }

        let width = width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, height as usize, width),
            |(_, channel, y, x)| rgb[(y * width + x) * 3 + channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }
}

fn flat_f32(outputs: &TVec<TValue>, index: usize, name: &str) -> Result<Vec<f32>> {
    let tensor = outputs
        .get(index)
        .ok_or_else(|| anyhow!("model produced no '{}' output (index {})", name, index))?;
    let view = tensor
        .to_array_view::<f32>()
        .with_context(|| format!("'{}' output tensor was not f32", name))?;
    Ok(view.iter().copied().collect())
}

fn parse_outputs(outputs: TVec<TValue>) -> Result<ModelOutput> {
    if outputs.len() < 4 {
        return Err(anyhow!(
            "expected 4 detection outputs, model produced {}",
            outputs.len()
        ));
    }
    let boxes_flat = flat_f32(&outputs, 0, "boxes")?;
    if boxes_flat.len() % 4 != 0 {
        return Err(anyhow!(
            "boxes output has {} values, not a multiple of 4",
            boxes_flat.len()
        ));
    }
    let boxes = boxes_flat
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect();
    let class_ids = flat_f32(&outputs, 1, "classes")?;
    let scores = flat_f32(&outputs, 2, "scores")?;
    let count = flat_f32(&outputs, 3, "count")?
        .first()
        .copied()
        .filter(|c| c.is_finite() && *c >= 0.0)
        .map(|c| c as usize)
        .unwrap_or(0);

    Ok(ModelOutput {
        boxes,
        class_ids,
        scores,
        count,
    })
}

impl InferenceModel for TractModel {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn invoke(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<ModelOutput> {
        let input = self.build_input(rgb, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        parse_outputs(outputs)
    }
}

/// Loads `TractModel`s for the model cache.
#[derive(Default)]
pub struct TractLoader;

impl TractLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModelLoader for TractLoader {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn InferenceModel>> {
        Ok(Box::new(TractModel::load(spec)?))
    }
}
