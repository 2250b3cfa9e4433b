//! Model loading configuration
//!
//! Typed load parameters and the progress-reporting contract.

use serde::{Deserialize, Serialize};

use crate::error::ContextError;

/// Parameters for loading a model file.
///
/// Named, typed fields instead of a loose parameter map; out-of-range
/// values fail validation rather than being silently accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadParams {
    /// Context window size in tokens
    pub context_length: usize,
    /// Worker threads for the compute engine (0 = auto-detect)
    pub thread_count: usize,
    /// Layers to offload to the GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Memory-map the weights instead of reading them into RAM
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    /// Lock weights in physical memory
    #[serde(default)]
    pub use_mlock: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            context_length: 4096,
            thread_count: 0,
            gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

impl LoadParams {
    /// Minimum context window the engine can operate with.
    pub const MIN_CONTEXT: usize = 8;

    pub fn validate(&self) -> Result<(), ContextError> {
        if self.context_length < Self::MIN_CONTEXT {
            return Err(ContextError::InvalidParams(format!(
                "context_length {} is below the minimum of {}",
                self.context_length,
                Self::MIN_CONTEXT
            )));
        }
        Ok(())
    }

    /// Threads to actually use: explicit count, or 80% of cores when auto.
    pub fn resolved_threads(&self) -> usize {
        if self.thread_count > 0 {
            return self.thread_count;
        }
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        if cores <= 4 {
            cores
        } else {
            (cores as f64 * 0.8) as usize
        }
    }
}

/// Wraps a load-progress callback to enforce the reporting contract:
/// values clamped to `[0,100]` and strictly non-decreasing.
pub struct ProgressReporter<'a> {
    inner: Option<&'a mut dyn FnMut(u8)>,
    last: Option<u8>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(inner: Option<&'a mut dyn FnMut(u8)>) -> Self {
        Self { inner, last: None }
    }

    pub fn report(&mut self, percent: u8) {
        let percent = percent.min(100);
        if let Some(last) = self.last {
            if percent <= last {
                return;
            }
        }
        self.last = Some(percent);
        if let Some(cb) = self.inner.as_mut() {
            cb(percent);
        }
    }
}
