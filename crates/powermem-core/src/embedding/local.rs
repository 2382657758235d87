//! Local embedding generation via `fastembed` (ONNX runtime, no network
//! calls), gated by the `embeddings` feature. Grounded directly in the
//! teacher's `embeddings::local` module, generalized to a configurable
//! output dimension instead of a hardcoded 256.

use std::sync::{Mutex, OnceLock};

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::error::{PowerMemError, Result};

use super::{matryoshka_truncate, EmbeddingProvider};

const MAX_TEXT_LENGTH: usize = 8192;
const BATCH_SIZE: usize = 32;

fn cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("FASTEMBED_CACHE_PATH") {
        return std::path::PathBuf::from(path);
    }
    if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "powermem", "powermem") {
        return proj_dirs.cache_dir().join("fastembed");
    }
    std::path::PathBuf::from(".fastembed_cache")
}

struct Model(TextEmbedding);

static MODEL: OnceLock<std::result::Result<Mutex<Model>, String>> = OnceLock::new();

fn get_model() -> std::result::Result<std::sync::MutexGuard<'static, Model>, String> {
    let result = MODEL.get_or_init(|| {
        let dir = cache_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(error = %e, path = ?dir, "failed to create fastembed cache dir");
        }
        let options = InitOptions::new(EmbeddingModel::NomicEmbedTextV15)
            .with_show_download_progress(true)
            .with_cache_dir(dir);
        TextEmbedding::try_new(options)
            .map(|m| Mutex::new(Model(m)))
            .map_err(|e| format!("failed to initialize nomic-embed-text-v1.5: {e}"))
    });
    match result {
        Ok(m) => m.lock().map_err(|e| format!("embedding model mutex poisoned: {e}")),
        Err(e) => Err(e.clone()),
    }
}

fn truncate_input(text: &str) -> &str {
    if text.len() > MAX_TEXT_LENGTH { &text[..MAX_TEXT_LENGTH] } else { text }
}

/// `EmbeddingProvider` backed by a process-local ONNX model, matching the
/// teacher's "one global model, many callers" pattern (loading the model
/// twice would double memory and startup cost for no benefit).
pub struct FastEmbedProvider {
    dims: usize,
}

impl FastEmbedProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_blocking(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut model = get_model().map_err(PowerMemError::BackendUnavailable)?;
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(BATCH_SIZE) {
            let truncated: Vec<&str> = chunk.iter().map(|t| truncate_input(t)).collect();
            let embeddings = model
                .0
                .embed(truncated, None)
                .map_err(|e| PowerMemError::BackendUnavailable(format!("embedding generation failed: {e}")))?;
            for v in embeddings {
                out.push(matryoshka_truncate(v, self.dims));
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(PowerMemError::Validation("cannot embed empty text".to_string()));
        }
        let dims = self.dims;
        let text = text.to_string();
        let results = tokio::task::spawn_blocking(move || {
            let provider = FastEmbedProvider { dims };
            provider.embed_blocking(vec![text])
        })
        .await
        .map_err(|e| PowerMemError::Fatal(format!("embedding task panicked: {e}")))??;
        results.into_iter().next().ok_or_else(|| {
            PowerMemError::BackendUnavailable("embedding provider returned no vectors".to_string())
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let dims = self.dims;
        let owned = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let provider = FastEmbedProvider { dims };
            provider.embed_blocking(owned)
        })
        .await
        .map_err(|e| PowerMemError::Fatal(format!("embedding task panicked: {e}")))?
    }
}
