//! End-to-end tests of the context lifecycle, streaming generation, and
//! chat formatting against a scripted backend.

mod common;

use common::{greedy, ScriptedLoader};
use localm_infer::{
    ContextError, ContextState, GenerationParams, InferenceContext, LoadParams, StopReason,
};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

fn open(loader: ScriptedLoader) -> InferenceContext {
    InferenceContext::open(loader, "/models/scripted.gguf", &LoadParams::default(), None).unwrap()
}

#[test]
fn test_open_reports_progress_and_loads() {
    let mut loader = ScriptedLoader::new("hello");
    loader.progress = vec![10, 60, 60, 250];

    let mut seen = Vec::new();
    let mut cb = |p: u8| seen.push(p);
    let ctx = InferenceContext::open(
        loader,
        "/models/scripted.gguf",
        &LoadParams::default(),
        Some(&mut cb),
    )
    .unwrap();

    // Duplicates dropped, out-of-range values clamped
    assert_eq!(seen, vec![10, 60, 100]);
    assert!(ctx.is_loaded());
    assert_eq!(ctx.state(), ContextState::Ready);
    assert_eq!(ctx.info().architecture, "scripted");
}

#[test]
fn test_open_failure_propagates() {
    let mut loader = ScriptedLoader::new("");
    loader.fail_load = Some("weights file is corrupt".into());

    let err =
        InferenceContext::open(loader, "/models/bad.gguf", &LoadParams::default(), None)
            .unwrap_err();
    assert!(matches!(err, ContextError::Load(_)));
}

#[test]
fn test_open_rejects_bad_params() {
    let params = LoadParams { context_length: 2, ..Default::default() };
    let err = InferenceContext::open(ScriptedLoader::new(""), "/m.gguf", &params, None)
        .unwrap_err();
    assert!(matches!(err, ContextError::InvalidParams(_)));
}

#[test]
fn test_greedy_completion_runs_to_eos() {
    let ctx = open(ScriptedLoader::new("hello world"));

    let mut fragments = Vec::new();
    let completion = ctx
        .complete(&greedy("Q:", 100), |f| fragments.push(f.to_string()))
        .unwrap();

    assert_eq!(completion.text, "hello world");
    assert_eq!(completion.stop_reason, StopReason::Eos);
    assert_eq!(completion.tokens_generated, 11);
    assert_eq!(fragments.concat(), completion.text);
    assert_eq!(ctx.state(), ContextState::Ready);
}

#[test]
fn test_max_tokens_zero_is_empty_and_silent() {
    let ctx = open(ScriptedLoader::new("hello world"));

    let mut calls = 0;
    let completion = ctx.complete(&greedy("Q:", 0), |_| calls += 1).unwrap();

    assert_eq!(completion.text, "");
    assert_eq!(completion.tokens_generated, 0);
    assert_eq!(completion.stop_reason, StopReason::MaxTokens);
    assert_eq!(calls, 0);
}

#[test]
fn test_max_tokens_truncates_output() {
    let ctx = open(ScriptedLoader::new("hello world"));

    let completion = ctx.complete(&greedy("Q:", 5), |_| {}).unwrap();
    assert_eq!(completion.text, "hello");
    assert_eq!(completion.stop_reason, StopReason::MaxTokens);
    assert_eq!(completion.tokens_generated, 5);
}

#[test]
fn test_stop_sequence_halts_and_withholds_marker() {
    let ctx = open(ScriptedLoader::new("abc STOP def"));

    let mut params = greedy("Q:", 100);
    params.stop = vec!["STOP".to_string()];

    let mut fragments = Vec::new();
    let completion = ctx.complete(&params, |f| fragments.push(f.to_string())).unwrap();

    assert_eq!(completion.text, "abc ");
    assert_eq!(completion.stop_reason, StopReason::StopSequence);
    assert_eq!(fragments.concat(), "abc ");
    assert!(!fragments.concat().contains("STOP"));
}

#[test]
fn test_default_stop_words_always_apply() {
    // No explicit stop list, yet a common turn terminator still halts the run
    let ctx = open(ScriptedLoader::new("ok<|im_end|>more"));

    let completion = ctx.complete(&greedy("Q:", 100), |_| {}).unwrap();
    assert_eq!(completion.text, "ok");
    assert_eq!(completion.stop_reason, StopReason::StopSequence);
}

#[test]
fn test_overflow_rejected_before_any_compute() {
    let mut loader = ScriptedLoader::new("hello");
    loader.context_length = 16;
    let ctx = open(loader);

    let mut calls = 0;
    let err = ctx.complete(&greedy("Q:", 1024), |_| calls += 1).unwrap_err();
    assert!(matches!(err, ContextError::ContextOverflow { needed: _, limit: 16 }));
    assert_eq!(calls, 0);
    // Overflow is a parameter problem, not an engine fault
    assert_eq!(ctx.state(), ContextState::Ready);
}

#[test]
fn test_cancellation_stops_mid_run() {
    let mut loader = ScriptedLoader::new(&"x".repeat(1000));
    loader.context_length = 4096;
    loader.eval_delay_ms = 1;
    let ctx = Arc::new(open(loader));

    let (started_tx, started_rx) = mpsc::channel();
    let fragments = Arc::new(Mutex::new(Vec::new()));

    let runner = {
        let ctx = Arc::clone(&ctx);
        let fragments = Arc::clone(&fragments);
        std::thread::spawn(move || {
            ctx.complete(&greedy("Q:", 2000), |f| {
                fragments.lock().unwrap().push(f.to_string());
                let _ = started_tx.send(());
            })
        })
    };

    started_rx.recv().unwrap();
    ctx.canceller().cancel();
    let completion = runner.join().unwrap().unwrap();

    assert_eq!(completion.stop_reason, StopReason::Cancelled);
    assert!(completion.tokens_generated < 1000, "cancel was never observed");
    // The returned text is exactly what was streamed
    assert_eq!(fragments.lock().unwrap().concat(), completion.text);
    assert_eq!(ctx.state(), ContextState::Ready);
}

#[test]
fn test_concurrent_requests_get_busy() {
    let mut loader = ScriptedLoader::new("hello world");
    loader.eval_delay_ms = 1;
    let ctx = Arc::new(open(loader));

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let runner = {
        let ctx = Arc::clone(&ctx);
        std::thread::spawn(move || {
            let mut first = true;
            ctx.complete(&greedy("Q:", 100), |_| {
                if first {
                    first = false;
                    let _ = started_tx.send(());
                    // Hold the run open until the main thread has probed it
                    let _ = release_rx.recv();
                }
            })
        })
    };

    started_rx.recv().unwrap();
    assert!(ctx.is_loaded());
    assert!(matches!(ctx.complete(&greedy("again", 10), |_| {}), Err(ContextError::Busy)));
    assert!(matches!(ctx.save_session("/tmp/never.session", None), Err(ContextError::Busy)));
    release_tx.send(()).unwrap();

    // The rejected requests did not disturb the in-flight run
    let completion = runner.join().unwrap().unwrap();
    assert_eq!(completion.text, "hello world");
    assert_eq!(completion.stop_reason, StopReason::Eos);
}

#[test]
fn test_engine_fault_marks_context_failed() {
    let mut loader = ScriptedLoader::new("hello");
    loader.fail_on_eval = Some(2);
    let ctx = open(loader);

    let err = ctx.complete(&greedy("Q:", 100), |_| {}).unwrap_err();
    assert!(matches!(err, ContextError::Inference(_)));
    assert_eq!(ctx.state(), ContextState::Failed);
    assert!(!ctx.is_loaded());
    assert!(matches!(ctx.complete(&greedy("Q:", 1), |_| {}), Err(ContextError::NotLoaded)));
}

#[test]
fn test_invalid_params_rejected_without_compute() {
    let ctx = open(ScriptedLoader::new("hello"));

    let params = GenerationParams { prompt: "Q:".into(), temperature: -0.5, ..Default::default() };
    assert!(matches!(ctx.complete(&params, |_| {}), Err(ContextError::InvalidParams(_))));
    assert_eq!(ctx.state(), ContextState::Ready);
}

#[test]
fn test_invalidate_is_idempotent() {
    let ctx = open(ScriptedLoader::new("hello"));
    assert!(ctx.is_loaded());

    ctx.invalidate();
    ctx.invalidate();

    assert!(!ctx.is_loaded());
    assert_eq!(ctx.state(), ContextState::Invalidated);
    assert!(matches!(ctx.complete(&greedy("Q:", 5), |_| {}), Err(ContextError::NotLoaded)));
    assert!(matches!(ctx.tokenize("hi"), Err(ContextError::NotLoaded)));
}

#[test]
fn test_tokenize_detokenize_roundtrip() {
    let ctx = open(ScriptedLoader::new(""));

    let tokens = ctx.tokenize("hello").unwrap();
    assert_eq!(tokens.len(), 5);
    assert_eq!(ctx.detokenize(&tokens).unwrap(), "hello");
}

#[test]
fn test_format_chat_then_complete() {
    let ctx = open(ScriptedLoader::new("12345"));

    let messages = r#"[{"role":"user","content":"hi"}]"#;
    let rendered = ctx.format_chat_full(messages, None, false).unwrap();

    assert!(rendered.prompt.contains("hi"));
    assert!(rendered.prompt.contains("<|im_start|>user"));
    assert!(rendered.additional_stops.iter().any(|s| s == "<|im_end|>"));

    let mut params = greedy(&rendered.prompt, 5);
    params.stop = rendered.additional_stops;
    let completion = ctx.complete(&params, |_| {}).unwrap();
    assert_eq!(completion.text, "12345");
}

#[test]
fn test_format_chat_rejects_malformed_json() {
    let ctx = open(ScriptedLoader::new(""));
    let err = ctx.format_chat("not json", None).unwrap_err();
    assert!(matches!(err, ContextError::Template(_)));
}

#[test]
fn test_format_chat_without_any_template_fails() {
    let mut loader = ScriptedLoader::new("");
    loader.chat_template = None;
    let ctx = open(loader);

    let messages = r#"[{"role":"user","content":"hi"}]"#;
    let err = ctx.format_chat(messages, None).unwrap_err();
    assert!(matches!(err, ContextError::Template(_)));
}
