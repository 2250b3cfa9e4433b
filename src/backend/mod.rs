//! Compute backend seam
//!
//! The tensor-compute engine (forward passes, attention state, vocabulary)
//! lives behind the [`ComputeBackend`] trait. The context never touches
//! weights or kernels directly; it feeds token ids in and gets logits out.

use std::path::Path;

use crate::error::ContextError;
use crate::model::LoadParams;

#[cfg(feature = "llama")]
pub mod llama;

/// Id of one vocabulary entry. Signed to match llama.cpp's `llama_token`.
pub type TokenId = i32;

/// Immutable facts about a loaded model.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// Source path of the model file
    pub path: String,
    /// Human-readable architecture tag (e.g. "llama", "qwen2")
    pub architecture: String,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Context window the backend was configured with
    pub context_length: usize,
    /// Worker threads the backend runs with
    pub thread_count: usize,
}

/// Interface to the engine that executes forward passes.
///
/// One backend instance backs exactly one context. The backend owns the
/// model weights and the per-position attention state; the context owns the
/// token history that mirrors that state. Methods that mutate attention
/// state take `&mut self` so the two cannot drift within a call.
pub trait ComputeBackend: Send {
    /// Facts fixed at load time.
    fn info(&self) -> &ModelInfo;

    /// Chat template embedded in the model file, if any.
    fn default_chat_template(&self) -> Option<String>;

    /// Convert text to token ids. `add_bos` prepends the beginning-of-text
    /// marker for vocabularies that use one.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, ContextError>;

    /// Raw bytes of a single token. May be an incomplete UTF-8 fragment;
    /// callers reassemble with [`crate::codec::Utf8Stream`].
    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, ContextError>;

    /// True if the token terminates generation (EOS / end-of-turn).
    fn is_eog(&self, token: TokenId) -> bool;

    /// Feed `tokens` starting at position `n_past` and return logits for the
    /// last fed position (one value per vocabulary entry). Extends the
    /// attention state by `tokens.len()` positions.
    fn eval(&mut self, tokens: &[TokenId], n_past: usize) -> Result<Vec<f32>, ContextError>;

    /// Serialize attention state covering the first `n_tokens` positions.
    fn export_state(&self, n_tokens: usize) -> Result<Vec<u8>, ContextError>;

    /// Replace attention state with `blob`, which must describe exactly
    /// `n_tokens` positions. On success the next `eval` continues from
    /// position `n_tokens`; on failure the previous state is left in place,
    /// so a rejected blob never costs the caller its history.
    fn import_state(&mut self, blob: &[u8], n_tokens: usize) -> Result<(), ContextError>;
}

/// Loads a model file and produces a ready backend.
///
/// `on_progress` receives load percentages; the caller-facing wrapper in
/// [`crate::model`] enforces the monotonic `[0,100]` contract, so loaders
/// may report raw values.
pub trait ModelLoader {
    fn load(
        &self,
        path: &Path,
        params: &LoadParams,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<Box<dyn ComputeBackend>, ContextError>;
}
