//! localm-infer
//!
//! Local LLM inference core: loads a model behind a compute-backend seam,
//! runs streaming autoregressive generation with cooperative cancellation,
//! renders multi-turn chat into model-specific prompts, and persists the
//! attention state for fast session resumption.
//!
//! Construct an [`InferenceContext`] with a [`backend::ModelLoader`], then
//! drive it: [`InferenceContext::complete`] streams tokens to a callback,
//! [`InferenceContext::format_chat_full`] turns a JSON message array into a
//! prompt plus generation controls, and
//! [`InferenceContext::save_session`] / [`InferenceContext::load_session`]
//! round-trip the token history with its attention state.

pub mod backend;
pub mod cache;
pub mod codec;
pub mod context;
pub mod error;
pub mod generate;
pub mod model;
pub mod session;
pub mod template;

pub use backend::{ComputeBackend, ModelInfo, ModelLoader, TokenId};
pub use context::{CancelHandle, ContextState, InferenceContext};
pub use error::ContextError;
pub use generate::{Completion, GenerationParams, StopReason};
pub use model::LoadParams;
pub use session::LoadedSession;
pub use template::{ChatFormat, ChatMessage, RenderedPrompt, Role, TemplateEngine};

#[cfg(feature = "llama")]
pub use backend::llama::GgufLoader;
