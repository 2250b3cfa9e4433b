//! llama.cpp compute backend
//!
//! Adapts `llama-cpp-2` to the [`ComputeBackend`] seam. llama.cpp owns the
//! weights, the forward pass, and the attention tensors; this crate keeps
//! the token history and drives sampling itself.
//!
//! llama.cpp's backend may be initialized once per process, so create one
//! [`GgufLoader`] per process and reuse it.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;

use crate::backend::{ComputeBackend, ModelInfo, ModelLoader, TokenId};
use crate::error::ContextError;
use crate::model::LoadParams;

const BATCH_SIZE: usize = 512;

/// Loads GGUF model files through llama.cpp.
pub struct GgufLoader {
    backend: LlamaBackend,
}

impl GgufLoader {
    pub fn new() -> Result<Self, ContextError> {
        let backend = LlamaBackend::init()
            .map_err(|e| ContextError::Load(format!("llama backend init failed: {e}")))?;
        Ok(Self { backend })
    }
}

impl ModelLoader for GgufLoader {
    fn load(
        &self,
        path: &Path,
        params: &LoadParams,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<Box<dyn ComputeBackend>, ContextError> {
        if !path.is_file() {
            return Err(ContextError::Load(format!("model file not found: {}", path.display())));
        }

        on_progress(0);
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| ContextError::Load(e.to_string()))?;
        on_progress(90);

        let n_ctx = (params.context_length as u32).min(model.n_ctx_train());
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(BATCH_SIZE as u32)
            .with_n_threads(params.resolved_threads() as i32);

        let info = ModelInfo {
            path: path.to_string_lossy().into_owned(),
            architecture: model
                .meta_val_str("general.architecture")
                .unwrap_or_else(|_| "unknown".to_string()),
            vocab_size: model.n_vocab() as usize,
            context_length: n_ctx as usize,
            thread_count: params.resolved_threads(),
        };

        let backend = LlamaCppBackend::new(model, &self.backend, ctx_params, info)?;
        on_progress(100);
        Ok(Box::new(backend))
    }
}

/// One llama.cpp model plus its persistent decode context.
pub struct LlamaCppBackend {
    // ctx borrows model; declared first so it drops first
    ctx: LlamaContext<'static>,
    model: Box<LlamaModel>,
    info: ModelInfo,
}

// llama.cpp handles are raw pointers used from one thread at a time; the
// owning worker thread is the only accessor
unsafe impl Send for LlamaCppBackend {}

impl LlamaCppBackend {
    fn new(
        model: LlamaModel,
        backend: &LlamaBackend,
        ctx_params: LlamaContextParams,
        info: ModelInfo,
    ) -> Result<Self, ContextError> {
        let model = Box::new(model);
        // The context must not outlive the model; the Box never moves and
        // the field order above ties their lifetimes together
        let model_ref: &'static LlamaModel = unsafe { &*(model.as_ref() as *const LlamaModel) };
        let ctx = model_ref
            .new_context(backend, ctx_params)
            .map_err(|e| ContextError::Load(format!("failed to create llama context: {e}")))?;
        Ok(Self { ctx, model, info })
    }
}

impl ComputeBackend for LlamaCppBackend {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn default_chat_template(&self) -> Option<String> {
        self.model.meta_val_str("tokenizer.chat_template").ok()
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ContextError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| ContextError::Inference(format!("tokenization failed: {e}")))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, ContextError> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| ContextError::Inference(format!("detokenization failed: {e}")))
    }

    fn is_eog(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn eval(&mut self, tokens: &[TokenId], n_past: usize) -> Result<Vec<f32>, ContextError> {
        let mut logits = Vec::new();
        for (chunk_idx, chunk) in tokens.chunks(BATCH_SIZE).enumerate() {
            let mut batch = LlamaBatch::new(chunk.len(), 1);
            let base = n_past + chunk_idx * BATCH_SIZE;
            let last_chunk = (chunk_idx + 1) * BATCH_SIZE >= tokens.len();
            for (i, &token) in chunk.iter().enumerate() {
                let wants_logits = last_chunk && i == chunk.len() - 1;
                batch
                    .add(LlamaToken(token), (base + i) as i32, &[0], wants_logits)
                    .map_err(|e| ContextError::Inference(format!("batch add failed: {e}")))?;
            }
            self.ctx
                .decode(&mut batch)
                .map_err(|e| ContextError::Inference(format!("decode failed: {e}")))?;

            if last_chunk {
                let mut dense = vec![f32::NEG_INFINITY; self.info.vocab_size];
                for data in self.ctx.candidates_ith(batch.n_tokens() - 1) {
                    let idx = data.id().0 as usize;
                    if idx < dense.len() {
                        dense[idx] = data.logit();
                    }
                }
                logits = dense;
            }
        }
        Ok(logits)
    }

    fn export_state(&self, n_tokens: usize) -> Result<Vec<u8>, ContextError> {
        // llama.cpp serializes the full context state; the session layer
        // records the position count and trims on import
        let _ = n_tokens;
        let size = self.ctx.get_state_size();
        let mut buf = vec![0u8; size];
        // Safety: buf is sized from get_state_size on the same context
        let written = unsafe { self.ctx.copy_state_data(buf.as_mut_ptr()) };
        buf.truncate(written);
        Ok(buf)
    }

    fn import_state(&mut self, blob: &[u8], n_tokens: usize) -> Result<(), ContextError> {
        // Reject impossible claims before touching the live state
        if n_tokens > self.info.context_length {
            return Err(ContextError::SessionFormat(format!(
                "session covers {n_tokens} positions, context window is {}",
                self.info.context_length
            )));
        }
        // Safety: blob was produced by copy_state_data on a context with the
        // same model and context size
        unsafe {
            self.ctx.set_state_data(blob);
        }
        // Drop positions past the restored history so decode continues from
        // position n_tokens
        self.ctx
            .clear_kv_cache_seq(Some(0), Some(n_tokens as u32), None)
            .map_err(|e| ContextError::SessionFormat(format!("state restore failed: {e}")))?;
        Ok(())
    }
}
