//! Inference context
//!
//! Top-level owner of a loaded model: lifecycle state machine, streaming
//! generation, chat formatting, and session persistence behind one handle.
//!
//! # Architecture
//!
//! Compute-engine handles are generally not `Send` (llama.cpp contexts hold
//! raw pointers), so the backend lives on a dedicated worker thread and the
//! public methods talk to it over channels. Every callback — load progress,
//! streamed tokens — runs on the calling thread while the caller blocks
//! inside the method, which is what guarantees a single logical thread of
//! callback delivery.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::backend::{ComputeBackend, ModelInfo, ModelLoader, TokenId};
use crate::cache::KvCache;
use crate::codec;
use crate::error::ContextError;
use crate::generate::{self, Completion, GenerationParams, DEFAULT_STOP_WORDS};
use crate::model::{LoadParams, ProgressReporter};
use crate::session::{LoadedSession, SessionStore};
use crate::template::{parse_messages, RenderedPrompt, TemplateEngine};

/// Lifecycle states of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Loading,
    Ready,
    Generating,
    Failed,
    Invalidated,
}

/// One-way cancellation flag for the context's in-flight generation run.
/// Cloneable and settable from any thread; each new run starts cleared.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

enum WorkerCommand {
    Generate {
        params: GenerationParams,
        cancel: Arc<AtomicBool>,
        events: Sender<GenEvent>,
    },
    FormatChat {
        messages_json: String,
        template: Option<String>,
        enable_thinking: bool,
        reply: Sender<Result<RenderedPrompt, ContextError>>,
    },
    Tokenize {
        text: String,
        reply: Sender<Result<Vec<TokenId>, ContextError>>,
    },
    Detokenize {
        tokens: Vec<TokenId>,
        reply: Sender<Result<String, ContextError>>,
    },
    SaveSession {
        path: PathBuf,
        token_count: Option<usize>,
        reply: Sender<Result<usize, ContextError>>,
    },
    LoadSession {
        path: PathBuf,
        reply: Sender<Result<LoadedSession, ContextError>>,
    },
    Shutdown,
}

enum GenEvent {
    Token(String),
    Done(Result<Completion, ContextError>),
}

enum LoadEvent {
    Progress(u8),
    Done(Result<ModelInfo, ContextError>),
}

/// A loaded model plus its generation state.
#[derive(Debug)]
pub struct InferenceContext {
    command_tx: Mutex<Option<Sender<WorkerCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    info: ModelInfo,
    state: Mutex<ContextState>,
    busy: AtomicBool,
    cancel: Arc<AtomicBool>,
}

impl InferenceContext {
    /// Load a model and construct a ready context.
    ///
    /// Blocks for the duration of the load. `on_progress` observes load
    /// percentages, clamped monotonic in `[0,100]`, all delivered before
    /// this returns; pass `None` to not observe progress. A failed load
    /// releases everything it allocated and returns the error.
    pub fn open<L>(
        loader: L,
        path: impl AsRef<Path>,
        params: &LoadParams,
        on_progress: Option<&mut dyn FnMut(u8)>,
    ) -> Result<Self, ContextError>
    where
        L: ModelLoader + Send + 'static,
    {
        params.validate()?;
        let path = path.as_ref().to_path_buf();
        let params = params.clone();

        let (load_tx, load_rx) = mpsc::channel::<LoadEvent>();
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        let handle = thread::Builder::new()
            .name("localm-infer-worker".into())
            .spawn(move || worker_main(loader, path, params, load_tx, command_rx))
            .map_err(|e| ContextError::Load(format!("failed to spawn worker thread: {e}")))?;

        let mut reporter = ProgressReporter::new(on_progress);
        let info = loop {
            match load_rx.recv() {
                Ok(LoadEvent::Progress(p)) => reporter.report(p),
                Ok(LoadEvent::Done(Ok(info))) => break info,
                Ok(LoadEvent::Done(Err(e))) => {
                    let _ = handle.join();
                    return Err(e);
                }
                Err(_) => {
                    let _ = handle.join();
                    return Err(ContextError::Load("worker thread died during load".into()));
                }
            }
        };

        tracing::info!(path = %info.path, ctx = info.context_length, "model loaded");

        Ok(Self {
            command_tx: Mutex::new(Some(command_tx)),
            worker: Mutex::new(Some(handle)),
            info,
            state: Mutex::new(ContextState::Ready),
            busy: AtomicBool::new(false),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Facts about the loaded model.
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        *self.state.lock().unwrap()
    }

    /// True while a model is usable: `Ready` or `Generating`.
    pub fn is_loaded(&self) -> bool {
        matches!(self.state(), ContextState::Ready | ContextState::Generating)
    }

    /// Handle for cancelling the in-flight generation run from another
    /// thread. Observed at token boundaries; never an error.
    pub fn canceller(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// Run one generation, streaming fragments to `on_token` in strict
    /// generation order. Returns the full text (the concatenation of every
    /// delivered fragment) even when the run was cancelled or stopped early.
    pub fn complete(
        &self,
        params: &GenerationParams,
        mut on_token: impl FnMut(&str),
    ) -> Result<Completion, ContextError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        self.enter_generating()?;

        // Fresh run, clean cancellation state
        self.cancel.store(false, Ordering::Relaxed);

        let mut params = params.clone();
        for &stop in DEFAULT_STOP_WORDS {
            if !params.stop.iter().any(|s| s == stop) {
                params.stop.push(stop.to_string());
            }
        }

        let (events_tx, events_rx) = mpsc::channel();
        let sent = self.send(WorkerCommand::Generate {
            params,
            cancel: Arc::clone(&self.cancel),
            events: events_tx,
        });
        let result = match sent {
            Ok(()) => self.pump_generation(&events_rx, &mut on_token),
            Err(e) => Err(e),
        };

        self.leave_generating(&result);
        result
    }

    fn pump_generation(
        &self,
        events: &Receiver<GenEvent>,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<Completion, ContextError> {
        loop {
            match events.recv() {
                Ok(GenEvent::Token(fragment)) => on_token(&fragment),
                Ok(GenEvent::Done(result)) => return result,
                Err(_) => {
                    return Err(ContextError::Inference("worker thread terminated".into()))
                }
            }
        }
    }

    /// Simple-form chat formatting: prompt text only.
    pub fn format_chat(
        &self,
        messages_json: &str,
        template: Option<&str>,
    ) -> Result<String, ContextError> {
        self.format_chat_full(messages_json, template, false).map(|r| r.prompt)
    }

    /// Full-form chat formatting: prompt plus stop sequences, detected
    /// format, and optional grammar from the template's directives.
    pub fn format_chat_full(
        &self,
        messages_json: &str,
        template: Option<&str>,
        enable_thinking: bool,
    ) -> Result<RenderedPrompt, ContextError> {
        self.require_loaded()?;
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(WorkerCommand::FormatChat {
            messages_json: messages_json.to_string(),
            template: template.map(str::to_string),
            enable_thinking,
            reply: reply_tx,
        })?;
        self.recv(&reply_rx)
    }

    /// Convert text to token ids with the model's vocabulary.
    pub fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, ContextError> {
        self.require_loaded()?;
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(WorkerCommand::Tokenize { text: text.to_string(), reply: reply_tx })?;
        self.recv(&reply_rx)
    }

    /// Convert token ids back to text.
    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String, ContextError> {
        self.require_loaded()?;
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(WorkerCommand::Detokenize { tokens: tokens.to_vec(), reply: reply_tx })?;
        self.recv(&reply_rx)
    }

    /// Persist the first `token_count` history tokens (`None` = full
    /// history) to `path`. Returns the number of tokens written. Valid only
    /// while the context is idle.
    pub fn save_session(
        &self,
        path: impl AsRef<Path>,
        token_count: Option<usize>,
    ) -> Result<usize, ContextError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        self.require_ready()?;
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(WorkerCommand::SaveSession {
            path: path.as_ref().to_path_buf(),
            token_count,
            reply: reply_tx,
        })?;
        self.recv(&reply_rx)
    }

    /// Replace the context's history and attention state with a persisted
    /// session. Returns the restored token count and the detokenized
    /// prompt. Valid only while the context is idle.
    pub fn load_session(&self, path: impl AsRef<Path>) -> Result<LoadedSession, ContextError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        self.require_ready()?;
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(WorkerCommand::LoadSession {
            path: path.as_ref().to_path_buf(),
            reply: reply_tx,
        })?;
        self.recv(&reply_rx)
    }

    /// Dispose of the context: stop any in-flight generation, shut down the
    /// worker, release model and cache memory. Idempotent; safe from any
    /// state.
    pub fn invalidate(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ContextState::Invalidated {
                return;
            }
            *state = ContextState::Invalidated;
        }

        // Unblock a run in progress so the worker can drain its queue
        self.cancel.store(true, Ordering::Relaxed);

        if let Some(tx) = self.command_tx.lock().unwrap().take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        tracing::info!("context invalidated");
    }

    fn send(&self, command: WorkerCommand) -> Result<(), ContextError> {
        let guard = self.command_tx.lock().unwrap();
        let tx = guard.as_ref().ok_or(ContextError::NotLoaded)?;
        tx.send(command)
            .map_err(|_| ContextError::Inference("worker thread terminated".into()))
    }

    fn recv<T>(&self, rx: &Receiver<Result<T, ContextError>>) -> Result<T, ContextError> {
        rx.recv()
            .map_err(|_| ContextError::Inference("worker thread terminated".into()))?
    }

    fn require_loaded(&self) -> Result<(), ContextError> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(ContextError::NotLoaded)
        }
    }

    fn require_ready(&self) -> Result<(), ContextError> {
        match self.state() {
            ContextState::Ready => Ok(()),
            ContextState::Generating => Err(ContextError::Busy),
            _ => Err(ContextError::NotLoaded),
        }
    }

    fn enter_generating(&self) -> Result<(), ContextError> {
        let mut state = self.state.lock().unwrap();
        match *state {
            ContextState::Ready => {
                *state = ContextState::Generating;
                Ok(())
            }
            ContextState::Generating => Err(ContextError::Busy),
            _ => Err(ContextError::NotLoaded),
        }
    }

    fn leave_generating(&self, result: &Result<Completion, ContextError>) {
        let mut state = self.state.lock().unwrap();
        if *state != ContextState::Generating {
            return; // invalidated mid-run
        }
        *state = match result {
            Err(e) if e.is_fatal() => ContextState::Failed,
            _ => ContextState::Ready,
        };
    }
}

impl Drop for InferenceContext {
    fn drop(&mut self) {
        self.invalidate();
    }
}

/// Releases the busy flag when the operation finishes, error or not.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ContextError> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .map_err(|_| ContextError::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Worker thread main loop. Owns the backend and the token-history cache;
/// processes commands until shutdown.
fn worker_main<L: ModelLoader>(
    loader: L,
    path: PathBuf,
    params: LoadParams,
    load_tx: Sender<LoadEvent>,
    command_rx: Receiver<WorkerCommand>,
) {
    let mut on_progress = |p: u8| {
        let _ = load_tx.send(LoadEvent::Progress(p));
    };
    let mut backend: Box<dyn ComputeBackend> =
        match loader.load(&path, &params, &mut on_progress) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::error!("model load failed: {e}");
                let _ = load_tx.send(LoadEvent::Done(Err(e)));
                return;
            }
        };
    let _ = load_tx.send(LoadEvent::Done(Ok(backend.info().clone())));

    let mut cache = KvCache::new();

    while let Ok(command) = command_rx.recv() {
        match command {
            WorkerCommand::Generate { params, cancel, events } => {
                let mut on_token =
                    |fragment: &str| events.send(GenEvent::Token(fragment.to_string())).is_ok();
                let result = generate::run_generation(
                    backend.as_mut(),
                    &mut cache,
                    &params,
                    &cancel,
                    &mut on_token,
                );
                let _ = events.send(GenEvent::Done(result));
            }
            WorkerCommand::FormatChat { messages_json, template, enable_thinking, reply } => {
                let result = parse_messages(&messages_json).and_then(|messages| {
                    TemplateEngine::format_full(
                        &messages,
                        template.as_deref(),
                        backend.default_chat_template().as_deref(),
                        enable_thinking,
                    )
                });
                let _ = reply.send(result);
            }
            WorkerCommand::Tokenize { text, reply } => {
                let _ = reply.send(backend.tokenize(&text, false));
            }
            WorkerCommand::Detokenize { tokens, reply } => {
                let _ = reply.send(codec::detokenize(backend.as_ref(), &tokens));
            }
            WorkerCommand::SaveSession { path, token_count, reply } => {
                let _ =
                    reply.send(SessionStore::save(backend.as_ref(), &cache, &path, token_count));
            }
            WorkerCommand::LoadSession { path, reply } => {
                let _ = reply.send(SessionStore::load(backend.as_mut(), &mut cache, &path));
            }
            WorkerCommand::Shutdown => break,
        }
    }
    tracing::debug!("worker thread shutting down");
}
