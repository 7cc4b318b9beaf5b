use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::configuration::{LoadConfig, Quantization};
use crate::error::{InferenceError, ModelLoadError, Result};
use crate::models::{Model, ModelBuilder};

/// Loads a model file and returns a handle to it.
///
/// The handle is only created after the whole file has been validated.
pub fn load_model(path: impl AsRef<Path>, config: LoadConfig) -> Result<ModelHandle, ModelLoadError> {
    log::debug!("{config:?}");
    let model = ModelBuilder::new(path).with_load_config(&config).build()?;
    Ok(ModelHandle::from_model(model))
}

/// Shared, explicitly owned reference to a loaded model.
///
/// Clones refer to the same model. After [`ModelHandle::unload`] no new session
/// or generation can start; memory is released once the last running
/// generation and open session let go of it.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    inner: Arc<RwLock<Option<Arc<Model>>>>,
}

impl ModelHandle {
    pub fn from_model(model: Model) -> Self {
        Self { inner: Arc::new(RwLock::new(Some(Arc::new(model)))) }
    }

    /// The loaded model, or [`InferenceError::ModelNotLoaded`] after unload.
    pub fn model(&self) -> Result<Arc<Model>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone().ok_or(InferenceError::ModelNotLoaded)
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Detaches the model from every clone of this handle.
    pub fn unload(&self) {
        if let Some(model) = self.inner.write().unwrap_or_else(PoisonError::into_inner).take() {
            log::info!(
                "unloaded {} ({} other references remain)",
                model.path().display(),
                Arc::strong_count(&model) - 1
            );
        }
    }

    pub fn info(&self) -> Option<ModelInfo> {
        self.model().ok().map(|model| ModelInfo::from(model.as_ref()))
    }
}

/// Summary of a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub model_path: String,
    /// Context window of each session.
    pub n_ctx: usize,
    pub n_vocab: usize,
    pub n_layers: usize,
    pub n_embd: usize,
    pub quantization: Quantization,
    pub n_threads: usize,
}

impl ModelInfo {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&Model> for ModelInfo {
    fn from(model: &Model) -> Self {
        let config = model.config();
        Self {
            model_path: model.path().display().to_string(),
            n_ctx: model.context_window(),
            n_vocab: config.vocab_size,
            n_layers: config.n_layers,
            n_embd: config.dim,
            quantization: config.quantization,
            n_threads: model.thread_count(),
        }
    }
}
