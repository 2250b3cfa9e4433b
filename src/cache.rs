//! Token history bookkeeping
//!
//! The backend holds the per-position attention tensors; this mirror holds
//! the token ids that produced them. Invariant: `len()` always equals the
//! number of positions the backend currently holds, so the two structures
//! describe the same sequence.

use crate::backend::TokenId;

/// Token-id mirror of the backend's attention state.
#[derive(Debug, Default, Clone)]
pub struct KvCache {
    tokens: Vec<TokenId>,
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of positions currently cached.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Record tokens that were just fed through the backend.
    pub fn extend(&mut self, tokens: &[TokenId]) {
        self.tokens.extend_from_slice(tokens);
    }

    pub fn push(&mut self, token: TokenId) {
        self.tokens.push(token);
    }

    /// Replace the whole history, as after a session restore.
    pub fn replace(&mut self, tokens: Vec<TokenId>) {
        self.tokens = tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow() {
        let mut cache = KvCache::new();
        assert!(cache.is_empty());
        cache.extend(&[1, 2, 3]);
        cache.push(4);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.tokens(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_replace() {
        let mut cache = KvCache::new();
        cache.extend(&[9, 9]);
        cache.replace(vec![1, 2, 3]);
        assert_eq!(cache.tokens(), &[1, 2, 3]);
    }
}
