//! Token/text conversion glue
//!
//! Tokens frequently cover partial UTF-8 sequences (emoji and CJK text span
//! several tokens), so streamed fragments must be reassembled before they
//! can be handed to a string callback.

use crate::backend::{ComputeBackend, TokenId};
use crate::error::ContextError;

/// Incremental UTF-8 decoder for streamed token bytes.
///
/// Feeds emit the longest valid prefix of the buffered bytes and keep the
/// incomplete suffix for the next token.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append token bytes; returns the decoded text that became complete.
    /// Invalid sequences decode to U+FFFD and are consumed; only an
    /// incomplete trailing sequence is held back for the next token.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(s) = std::str::from_utf8(&self.pending[..valid]) {
                        out.push_str(s);
                    }
                    match e.error_len() {
                        // Invalid bytes can never become text; consume them
                        // so decoding keeps moving
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        // Incomplete tail, wait for the next token
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Emit whatever buffered bytes still form valid text and discard the
    /// rest. Called at end of generation.
    pub fn flush(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        // A trailing truncated sequence decodes to replacement chars; drop them
        out.trim_end_matches('\u{FFFD}').to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Detokenize a token sequence into text.
pub fn detokenize(backend: &dyn ComputeBackend, tokens: &[TokenId]) -> Result<String, ContextError> {
    let mut stream = Utf8Stream::new();
    let mut text = String::new();
    for &token in tokens {
        let bytes = backend.token_bytes(token)?;
        text.push_str(&stream.push(&bytes));
    }
    text.push_str(&stream.flush());
    Ok(text)
}
