//! Single-slot model cache keyed by job type.
//!
//! The cache holds at most one loaded model. Consecutive jobs of the same type
//! reuse it with no I/O; a different job type replaces it. The cache is owned
//! by the dispatcher and is only touched between sessions, never during one.

use std::time::Instant;

use crate::detect::{InferenceModel, Labels, ModelLoader, ModelRegistry, ModelSpec};
use crate::error::JobError;

/// A loaded model with its labels, owned exclusively by the cache.
pub struct ModelHandle {
    job_type: String,
    model: Box<dyn InferenceModel>,
    labels: Labels,
}

impl ModelHandle {
    pub fn new(job_type: impl Into<String>, model: Box<dyn InferenceModel>, labels: Labels) -> Self {
        Self {
            job_type: job_type.into(),
            model,
            labels,
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn input_size(&self) -> (u32, u32) {
        self.model.input_size()
    }

    pub fn model_mut(&mut self) -> &mut dyn InferenceModel {
        self.model.as_mut()
    }
}

pub struct ModelCache {
    registry: ModelRegistry,
    loader: Box<dyn ModelLoader>,
    current: Option<ModelHandle>,
    loads: u64,
}

impl ModelCache {
    pub fn new(registry: ModelRegistry, loader: Box<dyn ModelLoader>) -> Self {
        Self {
            registry,
            loader,
            current: None,
            loads: 0,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Job type of the currently cached model, if any.
    pub fn current_job_type(&self) -> Option<&str> {
        self.current.as_ref().map(|h| h.job_type.as_str())
    }

    /// Number of successful model loads performed so far.
    pub fn load_count(&self) -> u64 {
        self.loads
    }

    /// Return the model for `job_type`, loading it if the cached model is for
    /// a different type.
    ///
    /// Unknown job types fail before any file is touched. A failed load keeps
    /// the previously cached model.
    pub fn resolve(&mut self, job_type: &str) -> Result<&mut ModelHandle, JobError> {
        let spec = self
            .registry
            .spec(job_type)
            .ok_or_else(|| JobError::UnknownJobType(job_type.to_string()))?;

        let handle = match self.current.take() {
            Some(handle) if handle.job_type == job_type => {
                log::debug!("model cache hit for {}", job_type);
                handle
            }
            previous => match self.load(&spec) {
                Ok(handle) => handle,
                Err(e) => {
                    self.current = previous;
                    return Err(e);
                }
            },
        };
        Ok(self.current.insert(handle))
    }

    fn load(&mut self, spec: &ModelSpec) -> Result<ModelHandle, JobError> {
        let started = Instant::now();
        let load_err = |reason: String| JobError::ModelLoad {
            job_type: spec.job_type.clone(),
            reason,
        };

        let labels = Labels::load(&spec.label_file).map_err(|e| load_err(format!("{:#}", e)))?;
        let model = self
            .loader
            .load(spec)
            .map_err(|e| load_err(format!("{:#}", e)))?;

        self.loads += 1;
        log::info!(
            "loaded {} model for {} from {} ({} labels, input {}x{}) in {} ms",
            self.loader.name(),
            spec.job_type,
            spec.model_file.display(),
            labels.len(),
            model.input_size().0,
            model.input_size().1,
            started.elapsed().as_millis()
        );

        Ok(ModelHandle::new(spec.job_type.clone(), model, labels))
    }
}
