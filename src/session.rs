//! Session persistence
//!
//! A session file is the token history plus the backend's serialized
//! attention state, letting a later context resume without recomputing the
//! prompt. Little-endian binary, self-describing version, validated in full
//! before anything in the live context is touched.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::backend::{ComputeBackend, TokenId};
use crate::cache::KvCache;
use crate::codec;
use crate::error::ContextError;

/// "LMSN" in little-endian byte order.
const SESSION_MAGIC: u32 = 0x4E53_4D4C;
const SESSION_VERSION: u32 = 1;

/// Result of a session restore.
#[derive(Debug, Clone)]
pub struct LoadedSession {
    /// Number of history tokens restored (equals the new cache length)
    pub tokens_loaded: usize,
    /// Detokenized form of the restored history
    pub prompt: String,
}

/// Decoded-but-not-applied session record.
#[derive(Debug)]
struct SessionRecord {
    tokens: Vec<TokenId>,
    state_blob: Vec<u8>,
}

/// Serializes and restores context state; stateless, parameterized per call.
pub struct SessionStore;

impl SessionStore {
    /// Persist the first `token_count` history tokens (`None` = all) with
    /// matching attention state. Returns the number of tokens written.
    pub fn save(
        backend: &dyn ComputeBackend,
        cache: &KvCache,
        path: &Path,
        token_count: Option<usize>,
    ) -> Result<usize, ContextError> {
        let count = match token_count {
            None => cache.len(),
            Some(n) if n <= cache.len() => n,
            Some(n) => {
                return Err(ContextError::InvalidParams(format!(
                    "cannot save {n} tokens, history holds {}",
                    cache.len()
                )))
            }
        };

        let state_blob = backend.export_state(count)?;
        let tokens = &cache.tokens()[..count];

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&SESSION_MAGIC.to_le_bytes())?;
        writer.write_all(&SESSION_VERSION.to_le_bytes())?;
        writer.write_all(&(count as u64).to_le_bytes())?;
        for &token in tokens {
            writer.write_all(&token.to_le_bytes())?;
        }
        writer.write_all(&(state_blob.len() as u64).to_le_bytes())?;
        writer.write_all(&state_blob)?;
        writer.flush()?;

        tracing::info!(tokens = count, blob_bytes = state_blob.len(), ?path, "session saved");
        Ok(count)
    }

    /// Restore a session file into the context, replacing its current
    /// history and attention state. The file is validated and its blob
    /// applied to the backend before the history mirror changes, so a
    /// rejected file or blob leaves the context exactly as it was.
    pub fn load(
        backend: &mut dyn ComputeBackend,
        cache: &mut KvCache,
        path: &Path,
    ) -> Result<LoadedSession, ContextError> {
        let record = Self::read_record(path)?;

        backend.import_state(&record.state_blob, record.tokens.len())?;
        cache.replace(record.tokens);

        let prompt = codec::detokenize(backend, cache.tokens())?;
        tracing::info!(tokens = cache.len(), ?path, "session restored");
        Ok(LoadedSession { tokens_loaded: cache.len(), prompt })
    }

    fn read_record(path: &Path) -> Result<SessionRecord, ContextError> {
        let mut reader = BufReader::new(File::open(path)?);

        let magic = read_u32(&mut reader)?;
        if magic != SESSION_MAGIC {
            return Err(ContextError::SessionFormat(format!(
                "bad magic 0x{magic:08X}, not a session file"
            )));
        }
        let version = read_u32(&mut reader)?;
        if version != SESSION_VERSION {
            return Err(ContextError::SessionFormat(format!(
                "unsupported session version {version} (expected {SESSION_VERSION})"
            )));
        }

        let n_tokens = read_u64(&mut reader)? as usize;
        let mut tokens = Vec::with_capacity(n_tokens.min(1 << 20));
        for _ in 0..n_tokens {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf).map_err(|_| {
                ContextError::SessionFormat(format!(
                    "declared {n_tokens} tokens but the payload is shorter"
                ))
            })?;
            tokens.push(TokenId::from_le_bytes(buf));
        }

        let n_blob = read_u64(&mut reader)?;
        // The declared size is untrusted; read up to it instead of
        // allocating it
        let mut state_blob = Vec::new();
        (&mut reader).take(n_blob).read_to_end(&mut state_blob)?;
        if state_blob.len() as u64 != n_blob {
            return Err(ContextError::SessionFormat(format!(
                "declared {n_blob} state bytes but the payload is shorter"
            )));
        }

        // Trailing garbage means the declared counts do not describe the file
        let mut probe = [0u8; 1];
        if reader.read(&mut probe)? != 0 {
            return Err(ContextError::SessionFormat("trailing bytes after state blob".into()));
        }

        Ok(SessionRecord { tokens, state_blob })
    }
}

fn read_u32(reader: &mut impl Read) -> Result<u32, ContextError> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| ContextError::SessionFormat("truncated header".into()))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, ContextError> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|_| ContextError::SessionFormat("truncated header".into()))?;
    Ok(u64::from_le_bytes(buf))
}
