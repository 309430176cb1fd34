//! Text-to-vector embedding pipeline.
//!
//! [`EmbeddingProvider`] is the model seam: [`local`] runs a BGE-style ONNX
//! model, [`hashed`] is a deterministic feature-hashing fallback that needs no
//! model files. [`Encoder`] wraps a provider with a lazy, load-once lifecycle
//! and maps load failures to [`EngineError::ModelUnavailable`].

pub mod hashed;
pub mod local;

use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::config::EmbeddingConfig;
use crate::error::EngineError;

/// Trait for embedding text into vectors.
///
/// Implementations are deterministic and produce L2-normalized vectors of
/// exactly [`EmbeddingProvider::dimensions`] components. All methods are
/// synchronous; async callers use `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Embed a retrieval query. Instruction-tuned models prepend their query prompt here.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text)
    }

    fn dimensions(&self) -> usize;

    /// Identifier recorded in `schema_meta` next to the stored vectors.
    fn model_id(&self) -> String;
}

/// Create an embedding provider from config.
///
/// `local` needs the model files (`echo-memory model download`); `hashed`
/// always succeeds.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => {
            let provider = local::LocalEmbeddingProvider::new(config)?;
            Ok(Box::new(provider))
        }
        "hashed" => Ok(Box::new(hashed::HashedEmbeddingProvider::new(config.dimensions))),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, hashed"),
    }
}

type Loader = Box<dyn Fn() -> Result<Arc<dyn EmbeddingProvider>> + Send + Sync>;

/// Shared encoder service.
///
/// The provider is created on the first call that needs it, under a mutex so
/// concurrent first calls load exactly once. A failed load is not cached; the
/// next call tries again.
pub struct Encoder {
    loader: Loader,
    provider: Mutex<Option<Arc<dyn EmbeddingProvider>>>,
    dimensions: usize,
}

impl Encoder {
    /// Encoder that builds its provider from `config` on first use.
    pub fn new(config: &EmbeddingConfig) -> Self {
        let config = config.clone();
        Self::with_loader(config.dimensions, move || {
            create_provider(&config).map(Arc::from)
        })
    }

    /// Encoder with a custom loader. `dimensions` is the expected output size.
    pub fn with_loader<F>(dimensions: usize, loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn EmbeddingProvider>> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            provider: Mutex::new(None),
            dimensions,
        }
    }

    /// Encoder around an already constructed provider.
    pub fn from_provider(provider: Arc<dyn EmbeddingProvider>) -> Self {
        let dimensions = provider.dimensions();
        let slot = Arc::clone(&provider);
        Self {
            loader: Box::new(move || Ok(Arc::clone(&slot))),
            provider: Mutex::new(Some(provider)),
            dimensions,
        }
    }

    /// Load the provider if it is not loaded yet.
    pub fn ensure_loaded(&self) -> Result<Arc<dyn EmbeddingProvider>, EngineError> {
        let mut slot = self
            .provider
            .lock()
            .map_err(|_| EngineError::ModelUnavailable("encoder lock poisoned".into()))?;
        if let Some(provider) = slot.as_ref() {
            return Ok(Arc::clone(provider));
        }

        let provider = (self.loader)().map_err(|e| {
            tracing::warn!(error = %e, "embedding model unavailable");
            EngineError::ModelUnavailable(format!("{e:#}"))
        })?;
        if provider.dimensions() != self.dimensions {
            return Err(EngineError::ModelUnavailable(format!(
                "model {} produces {} dimensions, configured for {}",
                provider.model_id(),
                provider.dimensions(),
                self.dimensions
            )));
        }
        tracing::info!(model = %provider.model_id(), dims = self.dimensions, "embedding model loaded");
        *slot = Some(Arc::clone(&provider));
        Ok(provider)
    }

    /// Drop the loaded model. The next embed call loads it again.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.provider.lock() {
            if slot.take().is_some() {
                tracing::info!("embedding model unloaded");
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.provider.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Output dimension every stored vector must match.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_id(&self) -> Result<String, EngineError> {
        Ok(self.ensure_loaded()?.model_id())
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let provider = self.ensure_loaded()?;
        let v = provider.embed(text)?;
        self.check_dim(v)
    }

    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let provider = self.ensure_loaded()?;
        let v = provider.embed_query(text)?;
        self.check_dim(v)
    }

    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EngineError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let provider = self.ensure_loaded()?;
        provider
            .embed_batch(texts)?
            .into_iter()
            .map(|v| self.check_dim(v))
            .collect()
    }

    fn check_dim(&self, v: Vec<f32>) -> Result<Vec<f32>, EngineError> {
        if v.len() != self.dimensions {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimensions,
                found: v.len(),
            });
        }
        Ok(v)
    }
}

/// L2-normalize a vector in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn l2_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn encoder_loads_lazily_and_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let encoder = Encoder::with_loader(32, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(hashed::HashedEmbeddingProvider::new(32)) as Arc<dyn EmbeddingProvider>)
        });

        assert!(!encoder.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        encoder.embed("first call").unwrap();
        encoder.embed("second call").unwrap();
        assert!(encoder.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        encoder.shutdown();
        assert!(!encoder.is_loaded());
        encoder.embed("after shutdown").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_first_calls_load_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let encoder = Arc::new(Encoder::with_loader(16, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(Arc::new(hashed::HashedEmbeddingProvider::new(16)) as Arc<dyn EmbeddingProvider>)
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let encoder = Arc::clone(&encoder);
                std::thread::spawn(move || encoder.embed("hello world").unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_load_is_model_unavailable() {
        let encoder = Encoder::with_loader(384, || anyhow::bail!("model.onnx not found"));
        let err = encoder.embed("anything").unwrap_err();
        assert!(err.is_model_unavailable());
        assert!(!encoder.is_loaded());
    }

    #[test]
    fn dimension_disagreement_is_model_unavailable() {
        let encoder = Encoder::with_loader(384, || {
            Ok(Arc::new(hashed::HashedEmbeddingProvider::new(64)) as Arc<dyn EmbeddingProvider>)
        });
        assert!(encoder.embed("text").unwrap_err().is_model_unavailable());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = EmbeddingConfig {
            provider: "cloud".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }
}
