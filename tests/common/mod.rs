//! Deterministic scripted backend for integration tests.
//!
//! The vocabulary is the 256 byte values plus an end-of-generation token.
//! After the prompt, the model "predicts" the bytes of a fixed script in
//! order, then EOG, so greedy sampling reproduces the script exactly.

// Each test binary uses a different slice of this module
#![allow(dead_code)]

use localm_infer::backend::{ComputeBackend, ModelInfo, ModelLoader, TokenId};
use localm_infer::error::ContextError;
use localm_infer::model::LoadParams;
use std::path::Path;

pub const EOG: TokenId = 256;
pub const VOCAB: usize = 257;

pub struct ScriptedLoader {
    pub script: Vec<u8>,
    pub context_length: usize,
    pub chat_template: Option<String>,
    /// Raw progress values the loader reports (intentionally unclamped)
    pub progress: Vec<u8>,
    /// Load fails with this message instead of producing a backend
    pub fail_load: Option<String>,
    /// Backend fails on the Nth eval call (1-based)
    pub fail_on_eval: Option<usize>,
    /// Sleep per eval call, to keep a run in flight while a test pokes at it
    pub eval_delay_ms: u64,
}

impl ScriptedLoader {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.as_bytes().to_vec(),
            context_length: 512,
            chat_template: Some("<|im_start|>".to_string()),
            progress: vec![10, 60, 100],
            fail_load: None,
            fail_on_eval: None,
            eval_delay_ms: 0,
        }
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(
        &self,
        path: &Path,
        params: &LoadParams,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<Box<dyn ComputeBackend>, ContextError> {
        for &p in &self.progress {
            on_progress(p);
        }
        if let Some(msg) = &self.fail_load {
            return Err(ContextError::Load(msg.clone()));
        }
        Ok(Box::new(ScriptedBackend {
            info: ModelInfo {
                path: path.to_string_lossy().into_owned(),
                architecture: "scripted".to_string(),
                vocab_size: VOCAB,
                context_length: self.context_length.min(params.context_length),
                thread_count: params.resolved_threads(),
            },
            chat_template: self.chat_template.clone(),
            script: self.script.iter().map(|&b| b as TokenId).collect(),
            script_pos: 0,
            fed: Vec::new(),
            fail_on_eval: self.fail_on_eval,
            eval_delay_ms: self.eval_delay_ms,
            evals: 0,
        }))
    }
}

pub struct ScriptedBackend {
    info: ModelInfo,
    chat_template: Option<String>,
    script: Vec<TokenId>,
    script_pos: usize,
    /// Tokens fed through "the model", standing in for the attention state
    fed: Vec<TokenId>,
    fail_on_eval: Option<usize>,
    eval_delay_ms: u64,
    evals: usize,
}

impl ComputeBackend for ScriptedBackend {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn default_chat_template(&self) -> Option<String> {
        self.chat_template.clone()
    }

    fn tokenize(&self, text: &str, _add_bos: bool) -> Result<Vec<TokenId>, ContextError> {
        Ok(text.bytes().map(|b| b as TokenId).collect())
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, ContextError> {
        if token == EOG {
            Ok(Vec::new())
        } else if (0..256).contains(&token) {
            Ok(vec![token as u8])
        } else {
            Err(ContextError::Inference(format!("token {token} out of vocabulary")))
        }
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == EOG
    }

    fn eval(&mut self, tokens: &[TokenId], n_past: usize) -> Result<Vec<f32>, ContextError> {
        assert_eq!(n_past, self.fed.len(), "eval position out of sync with state");
        if self.eval_delay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(self.eval_delay_ms));
        }
        self.evals += 1;
        if let Some(n) = self.fail_on_eval {
            if self.evals >= n {
                return Err(ContextError::Inference("numeric fault in compute engine".into()));
            }
        }

        // A single fed-back token matching the current script position means
        // the model saw its own prediction; multi-token prompt chunks do not
        // advance the script
        if tokens.len() == 1
            && self.script_pos < self.script.len()
            && tokens[0] == self.script[self.script_pos]
        {
            self.script_pos += 1;
        }
        self.fed.extend_from_slice(tokens);

        let next = self.script.get(self.script_pos).copied().unwrap_or(EOG);
        let mut logits = vec![0.0f32; VOCAB];
        logits[next as usize] = 100.0;
        Ok(logits)
    }

    fn export_state(&self, n_tokens: usize) -> Result<Vec<u8>, ContextError> {
        let mut blob = Vec::with_capacity(n_tokens * 4);
        for &token in &self.fed[..n_tokens] {
            blob.extend_from_slice(&token.to_le_bytes());
        }
        Ok(blob)
    }

    fn import_state(&mut self, blob: &[u8], n_tokens: usize) -> Result<(), ContextError> {
        if blob.len() != n_tokens * 4 {
            return Err(ContextError::SessionFormat(format!(
                "state blob covers {} positions, expected {n_tokens}",
                blob.len() / 4
            )));
        }
        self.fed = blob
            .chunks_exact(4)
            .map(|c| TokenId::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.script_pos = 0;
        Ok(())
    }
}

/// Greedy, deterministic parameters for a scripted run.
pub fn greedy(prompt: &str, max_tokens: u32) -> localm_infer::GenerationParams {
    localm_infer::GenerationParams {
        prompt: prompt.to_string(),
        max_tokens,
        temperature: 0.0,
        ..Default::default()
    }
}
