//! Token generation
//!
//! The sample → append-to-cache → decode-callback cycle, with cooperative
//! cancellation at token boundaries and stop-sequence matching that never
//! leaks a partial stop marker to the caller.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::backend::{ComputeBackend, TokenId};
use crate::cache::KvCache;
use crate::codec::Utf8Stream;
use crate::error::ContextError;

/// Turn terminators merged into every run's stop list. Mirrors the set the
/// host app ships so a model that emits a foreign terminator still halts.
pub const DEFAULT_STOP_WORDS: &[&str] = &[
    "</s>",
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "<|EOT|>",
    "<|END_OF_TURN_TOKEN|>",
    "<|end_of_turn|>",
    "<end_of_turn>",
    "<|endoftext|>",
    "<|return|>",
];

/// Parameters for one generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    /// The input prompt text
    pub prompt: String,
    /// Maximum number of tokens to generate (0 = empty result, no compute)
    pub max_tokens: u32,
    /// Temperature for sampling (below 1e-7 = greedy)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter (1.0 = disabled)
    pub top_p: f32,
    /// Minimum probability relative to the best token (0.0 = disabled)
    pub min_p: f32,
    /// Repetition penalty (1.0 = disabled)
    pub repeat_penalty: f32,
    /// Window of recent tokens the penalty applies to
    pub penalty_last_n: u32,
    /// Stop sequences ending the run when matched in the output
    #[serde(default)]
    pub stop: Vec<String>,
    /// Random seed (0 = derive from entropy)
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_tokens: 1024,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            repeat_penalty: 1.0,
            penalty_last_n: 64,
            stop: Vec::new(),
            seed: 0,
        }
    }
}

impl GenerationParams {
    /// Reject out-of-range values before any compute starts.
    pub fn validate(&self) -> Result<(), ContextError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ContextError::InvalidParams(format!(
                "temperature must be a finite value >= 0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ContextError::InvalidParams(format!(
                "top_p must be within [0, 1], got {}",
                self.top_p
            )));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err(ContextError::InvalidParams(format!(
                "min_p must be within [0, 1], got {}",
                self.min_p
            )));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err(ContextError::InvalidParams(format!(
                "repeat_penalty must be > 0, got {}",
                self.repeat_penalty
            )));
        }
        if self.stop.iter().any(|s| s.is_empty()) {
            return Err(ContextError::InvalidParams("empty stop sequence".into()));
        }
        Ok(())
    }
}

/// What ended a generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A stop sequence was matched in the output
    StopSequence,
    /// The model produced an end-of-sequence token
    Eos,
    /// The token budget was exhausted
    MaxTokens,
    /// The caller cancelled the run
    Cancelled,
}

/// Result of a generation run. Always well-formed, including after
/// cancellation: `text` is exactly the concatenation of the delivered
/// fragments.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub tokens_generated: usize,
    pub stop_reason: StopReason,
}

/// Samples next tokens from logits under a fixed policy.
struct Sampler {
    rng: rand::rngs::StdRng,
    temperature: f32,
    top_k: usize,
    top_p: f32,
    min_p: f32,
    repeat_penalty: f32,
    penalty_last_n: usize,
    recent: Vec<TokenId>,
}

impl Sampler {
    fn new(params: &GenerationParams) -> Self {
        let seed = if params.seed == 0 { rand::random::<u64>() } else { params.seed };
        Self {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
            temperature: params.temperature,
            top_k: params.top_k as usize,
            top_p: params.top_p,
            min_p: params.min_p,
            repeat_penalty: params.repeat_penalty,
            penalty_last_n: params.penalty_last_n as usize,
            recent: Vec::new(),
        }
    }

    /// Record a token in the repetition-penalty window.
    fn accept(&mut self, token: TokenId) {
        if self.penalty_last_n == 0 {
            return;
        }
        self.recent.push(token);
        if self.recent.len() > self.penalty_last_n {
            let overflow = self.recent.len() - self.penalty_last_n;
            self.recent.drain(..overflow);
        }
    }

    /// Seed the penalty window with already-processed history.
    fn prime(&mut self, history: &[TokenId]) {
        let start = history.len().saturating_sub(self.penalty_last_n);
        for &token in &history[start..] {
            self.accept(token);
        }
    }

    fn apply_repetition_penalty(&self, logits: &mut [f32]) {
        if self.repeat_penalty == 1.0 {
            return;
        }
        for &token in &self.recent {
            let idx = token as usize;
            if idx < logits.len() {
                if logits[idx] > 0.0 {
                    logits[idx] /= self.repeat_penalty;
                } else {
                    logits[idx] *= self.repeat_penalty;
                }
            }
        }
    }

    fn argmax(logits: &[f32]) -> TokenId {
        logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i as TokenId)
            .unwrap_or(0)
    }

    fn sample(&mut self, logits: &mut [f32]) -> Result<TokenId, ContextError> {
        if logits.is_empty() {
            return Err(ContextError::Inference("backend returned empty logits".into()));
        }
        if logits.iter().any(|v| v.is_nan()) {
            return Err(ContextError::Inference("NaN in logits".into()));
        }

        self.apply_repetition_penalty(logits);

        if self.temperature < 1e-7 {
            return Ok(Self::argmax(logits));
        }

        // Temperature-scaled softmax
        let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut probs: Vec<f32> =
            logits.iter().map(|&x| ((x - max_logit) / self.temperature).exp()).collect();
        let sum: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= sum;
        }

        // Top-k: keep only the k most likely tokens
        if self.top_k > 0 && self.top_k < probs.len() {
            let mut indices: Vec<usize> = (0..probs.len()).collect();
            indices.select_nth_unstable_by(self.top_k, |&i, &j| probs[j].total_cmp(&probs[i]));
            for &i in &indices[self.top_k..] {
                probs[i] = 0.0;
            }
        }

        // Min-p: drop tokens far below the best surviving one
        if self.min_p > 0.0 {
            let best = probs.iter().copied().fold(0.0f32, f32::max);
            let floor = best * self.min_p;
            for p in probs.iter_mut() {
                if *p < floor {
                    *p = 0.0;
                }
            }
        }

        // Top-p: keep the smallest set of tokens covering the target mass
        if self.top_p > 0.0 && self.top_p < 1.0 {
            let mut indices: Vec<usize> = (0..probs.len()).collect();
            indices.sort_by(|&i, &j| probs[j].total_cmp(&probs[i]));
            let mut cumsum = 0.0;
            for &i in &indices {
                if cumsum >= self.top_p {
                    probs[i] = 0.0;
                } else {
                    cumsum += probs[i];
                }
            }
        }

        match WeightedIndex::new(&probs) {
            Ok(dist) => Ok(dist.sample(&mut self.rng) as TokenId),
            // All mass filtered away; fall back to the best token
            Err(_) => Ok(Self::argmax(logits)),
        }
    }
}

/// Scans streamed fragments for stop sequences, holding back any suffix
/// that could still grow into a match so partial markers never reach the
/// caller.
struct StopMatcher {
    stops: Vec<String>,
    held: String,
}

enum StopScan {
    /// Emit this text and keep generating
    Continue(String),
    /// A stop sequence completed; emit the text preceding it
    Matched(String),
}

impl StopMatcher {
    fn new(stops: Vec<String>) -> Self {
        Self { stops, held: String::new() }
    }

    fn push(&mut self, fragment: &str) -> StopScan {
        self.held.push_str(fragment);

        for stop in &self.stops {
            if let Some(idx) = self.held.find(stop.as_str()) {
                let emit = self.held[..idx].to_string();
                self.held.clear();
                return StopScan::Matched(emit);
            }
        }

        // Longest suffix of held text that is a proper prefix of some stop
        let mut keep = 0;
        for stop in &self.stops {
            for (i, _) in stop.char_indices().skip(1) {
                if self.held.ends_with(&stop[..i]) {
                    keep = keep.max(i);
                }
            }
        }

        let emit = self.held[..self.held.len() - keep].to_string();
        self.held.drain(..self.held.len() - keep);
        StopScan::Continue(emit)
    }

    /// Release held text at end of run (it never completed a match).
    fn flush(&mut self) -> String {
        std::mem::take(&mut self.held)
    }
}

/// Drive one generation run. `on_token` returns false when the consumer is
/// gone, which ends the run like a cancellation.
pub(crate) fn run_generation(
    backend: &mut dyn ComputeBackend,
    cache: &mut KvCache,
    params: &GenerationParams,
    cancel: &AtomicBool,
    on_token: &mut dyn FnMut(&str) -> bool,
) -> Result<Completion, ContextError> {
    params.validate()?;

    if params.max_tokens == 0 {
        return Ok(Completion { text: String::new(), tokens_generated: 0, stop_reason: StopReason::MaxTokens });
    }

    let prompt_tokens = backend.tokenize(&params.prompt, cache.is_empty())?;
    if prompt_tokens.is_empty() && cache.is_empty() {
        return Err(ContextError::InvalidParams("empty prompt on an empty context".into()));
    }

    let limit = backend.info().context_length;
    let needed = cache.len() + prompt_tokens.len() + params.max_tokens as usize;
    if needed > limit {
        return Err(ContextError::ContextOverflow { needed, limit });
    }

    tracing::debug!(
        prompt_tokens = prompt_tokens.len(),
        cached = cache.len(),
        max_tokens = params.max_tokens,
        "starting generation"
    );

    let mut sampler = Sampler::new(params);
    sampler.prime(cache.tokens());

    let mut logits = backend.eval(&prompt_tokens, cache.len())?;
    cache.extend(&prompt_tokens);
    for &t in &prompt_tokens {
        sampler.accept(t);
    }

    let mut matcher = StopMatcher::new(params.stop.clone());
    let mut utf8 = Utf8Stream::new();
    let mut text = String::new();
    let mut generated = 0usize;

    let mut consumer_gone = false;
    let mut deliver =
        |fragment: String, text: &mut String, gone: &mut bool| {
            if fragment.is_empty() {
                return;
            }
            text.push_str(&fragment);
            if !on_token(&fragment) {
                *gone = true;
            }
        };

    // Release the utf8 tail and any held partial-stop text at end of run.
    // Returns true if the tail happened to complete a stop sequence.
    macro_rules! drain_tail {
        () => {{
            match matcher.push(&utf8.flush()) {
                StopScan::Matched(emit) => {
                    deliver(emit, &mut text, &mut consumer_gone);
                    true
                }
                StopScan::Continue(emit) => {
                    deliver(emit, &mut text, &mut consumer_gone);
                    deliver(matcher.flush(), &mut text, &mut consumer_gone);
                    false
                }
            }
        }};
    }

    let stop_reason = loop {
        let token = sampler.sample(&mut logits)?;

        if backend.is_eog(token) {
            if drain_tail!() {
                break StopReason::StopSequence;
            }
            break StopReason::Eos;
        }

        // Append to cache and feed through the model before the stop checks
        // so history and attention state stay in lockstep
        let pos = cache.len();
        cache.push(token);
        sampler.accept(token);
        logits = backend.eval(&[token], pos)?;
        generated += 1;

        let fragment = utf8.push(&backend.token_bytes(token)?);
        let matched = match matcher.push(&fragment) {
            StopScan::Matched(emit) => {
                deliver(emit, &mut text, &mut consumer_gone);
                true
            }
            StopScan::Continue(emit) => {
                deliver(emit, &mut text, &mut consumer_gone);
                false
            }
        };

        // Stop conditions, in order: stop sequence, eos (handled above),
        // token budget, cancellation
        if matched {
            break StopReason::StopSequence;
        }
        if generated >= params.max_tokens as usize {
            if drain_tail!() {
                break StopReason::StopSequence;
            }
            break StopReason::MaxTokens;
        }
        if consumer_gone || cancel.load(Ordering::Relaxed) {
            deliver(matcher.flush(), &mut text, &mut consumer_gone);
            break StopReason::Cancelled;
        }
    };

    tracing::debug!(generated, ?stop_reason, "generation finished");

    Ok(Completion { text, tokens_generated: generated, stop_reason })
}
