//! Engine capability surface and the types that identify a loaded engine.
//!
//! The registry treats the engine as an opaque capability set: stream a
//! prediction, compute an embedding, encode/decode tokens, and release. How
//! those are implemented (local runner process, in-process library, remote
//! backend) is a concern of the [`EngineLoader`] the registry is built with.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// Identifies which artifacts compose an engine: the base model plus any
/// adapters and projectors applied on top of it.
///
/// Equality is the reload decision: two descriptors are equal iff the model
/// path and the ordered adapter/projector path lists are identical.
/// `short_name` is presentation metadata for user-facing messages and is
/// deliberately excluded from identity.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    pub model_path: PathBuf,
    pub adapter_paths: Vec<PathBuf>,
    pub projector_paths: Vec<PathBuf>,
    pub short_name: String,
}

impl PartialEq for EngineDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.model_path == other.model_path
            && self.adapter_paths == other.adapter_paths
            && self.projector_paths == other.projector_paths
    }
}

impl EngineDescriptor {
    pub fn new(model_path: impl Into<PathBuf>, short_name: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            adapter_paths: Vec::new(),
            projector_paths: Vec::new(),
            short_name: short_name.into(),
        }
    }
}

/// Runner-affecting options. Any difference forces a rebuild of the engine
/// even when the descriptor is unchanged, so every field here must actually
/// change engine construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOptions {
    pub num_ctx: u32,
    pub num_batch: u32,
    /// Layers to offload to the GPU; -1 means autodetect.
    pub num_gpu: i32,
    pub main_gpu: u32,
    pub low_vram: bool,
    pub f16_kv: bool,
    /// 0 means let the engine pick.
    pub num_thread: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub seed: i64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            num_ctx: 2048,
            num_batch: 512,
            num_gpu: -1,
            main_gpu: 0,
            low_vram: false,
            f16_kv: true,
            num_thread: 0,
            use_mmap: true,
            use_mlock: false,
            seed: -1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictRequest {
    pub prompt: String,
    /// Response format constraint, e.g. "json".
    pub format: Option<String>,
    /// Raw image payloads for multimodal models.
    pub images: Vec<Vec<u8>>,
}

/// One streamed unit of a prediction. Timing counters are only populated on
/// the final chunk (`done == true`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictChunk {
    pub content: String,
    pub done: bool,
    pub prompt_eval_count: usize,
    pub prompt_eval_duration: Duration,
    pub eval_count: usize,
    pub eval_duration: Duration,
}

pub type PredictCallback = Box<dyn FnMut(PredictChunk) + Send>;

/// A live computation engine instance.
///
/// Implementations must tolerate concurrent read-style calls; serialization
/// against release is handled above this trait by the synced wrapper.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Stream a prediction, delivering chunks through `on_chunk`.
    async fn predict(
        &self,
        request: PredictRequest,
        on_chunk: PredictCallback,
    ) -> anyhow::Result<()>;

    async fn embedding(&self, input: &str) -> anyhow::Result<Vec<f64>>;

    async fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>>;

    async fn decode(&self, tokens: &[u32]) -> anyhow::Result<String>;

    /// Release the engine's resources. Called at most once by the wrapper.
    async fn shutdown(&self);
}

/// Construction collaborator: builds an engine from a descriptor and options.
///
/// Loading is expected to be slow (disk or network bound). The registry
/// guarantees at most one load runs at a time per slot.
#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load(
        &self,
        descriptor: &EngineDescriptor,
        options: &EngineOptions,
    ) -> Result<Box<dyn Engine>, LoadError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_identity_ignores_short_name() {
        let a = EngineDescriptor::new("/models/llama.bin", "llama2:7b");
        let mut b = a.clone();
        b.short_name = "renamed".to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn descriptor_identity_is_order_sensitive_over_adapters() {
        let mut a = EngineDescriptor::new("/models/llama.bin", "llama2:7b");
        a.adapter_paths = vec![PathBuf::from("/a"), PathBuf::from("/b")];
        let mut b = a.clone();
        b.adapter_paths = vec![PathBuf::from("/b"), PathBuf::from("/a")];
        assert_ne!(a, b);
    }

    #[test]
    fn options_compare_by_value() {
        let a = EngineOptions::default();
        let mut b = a.clone();
        assert_eq!(a, b);
        b.num_ctx = 4096;
        assert_ne!(a, b);
    }
}
