// Integration tests driving a SessionController against a scripted engine.

mod common;

use std::{sync::Arc, time::Duration};

use local_llm_session::{
    config::SessionTimeouts,
    error::SessionError,
    model::RunOutput,
    protocol::{InitStep, Stage},
    session::{Backend, ChannelSink, NoopSink, Precision, SessionEvent},
};
use tokio::sync::mpsc::UnboundedReceiver;

use common::{
    MODEL_ID, PROMPT, Reply, ScriptedEngine, controller, generate_payload, init_payload,
};

fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn init_reports_progress_and_commits_config() {
    let engine = Arc::new(ScriptedEngine::new());
    let session = controller(engine.clone(), false, SessionTimeouts::default());
    let (sink, mut events) = ChannelSink::new();

    let config = session
        .init(init_payload(Backend::Safe, Precision::Auto), Arc::new(sink))
        .await
        .unwrap();

    assert_eq!(config.model_id, MODEL_ID);
    assert_eq!(config.backend, Backend::Safe);
    assert_eq!(config.precision, Precision::Q8);
    assert_eq!(session.config(), Some(config));

    let statuses: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Status(status) => Some(status),
            _ => None,
        })
        .collect();
    assert!(statuses.iter().any(|s| s.step == Some(InitStep::Fetch) && s.percent == Some(100)));
    assert!(statuses.iter().any(|s| s.step == Some(InitStep::Warmup)));
}

#[tokio::test]
async fn accelerated_failure_restarts_on_safe_backend() {
    let engine = Arc::new(ScriptedEngine::new().broken(Backend::Accelerated));
    let session = controller(engine.clone(), true, SessionTimeouts::default());
    let (sink, mut events) = ChannelSink::new();

    let config = session
        .init(init_payload(Backend::Accelerated, Precision::Q8), Arc::new(sink))
        .await
        .unwrap();

    assert_eq!(config.backend, Backend::Safe);
    assert_eq!(config.precision, Precision::Q8);
    assert_eq!(
        engine.builds(),
        vec![
            (Backend::Accelerated, Precision::Fp16),
            (Backend::Safe, Precision::Q8)
        ]
    );

    let banner = drain(&mut events).into_iter().find_map(|event| match event {
        SessionEvent::Banner(banner) => Some(banner),
        _ => None,
    });
    let banner = banner.expect("fallback banner");
    assert_eq!(banner.from, "accelerated");
    assert_eq!(banner.to, "safe");
}

#[tokio::test]
async fn unavailable_accelerator_resolves_without_restart() {
    let engine = Arc::new(ScriptedEngine::new());
    let session = controller(engine.clone(), false, SessionTimeouts::default());

    let config = session
        .init(init_payload(Backend::Accelerated, Precision::Fp16), Arc::new(NoopSink))
        .await
        .unwrap();

    assert_eq!(config.backend, Backend::Safe);
    assert_eq!(config.precision, Precision::Fp16);
    assert_eq!(engine.builds(), vec![(Backend::Safe, Precision::Fp16)]);
}

#[tokio::test]
async fn missing_precision_falls_back_in_order() {
    let engine = Arc::new(ScriptedEngine::new().missing(Backend::Safe, Precision::Q8));
    let session = controller(engine.clone(), false, SessionTimeouts::default());
    let (sink, mut events) = ChannelSink::new();

    let config = session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(sink))
        .await
        .unwrap();

    assert_eq!(config.precision, Precision::Int8);
    assert_eq!(
        engine.builds(),
        vec![(Backend::Safe, Precision::Q8), (Backend::Safe, Precision::Int8)]
    );

    let banners: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Banner(banner) => Some(banner),
            _ => None,
        })
        .collect();
    assert_eq!(banners.len(), 1);
    assert_eq!(banners[0].from, "q8");
    assert_eq!(banners[0].to, "int8");
    assert!(banners[0].message.contains("\"q8\" not available"));
}

#[tokio::test]
async fn exhausted_fallbacks_report_the_original_precision() {
    let mut engine = ScriptedEngine::new();
    for precision in [
        Precision::Q8,
        Precision::Int8,
        Precision::Uint8,
        Precision::Q4,
        Precision::Q4f16,
    ] {
        engine = engine.missing(Backend::Safe, precision);
    }
    let session = controller(Arc::new(engine), false, SessionTimeouts::default());

    let err = session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap_err();

    match err {
        SessionError::MissingPrecisionResource { precision, .. } => {
            assert_eq!(precision, Precision::Q8)
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.config(), None);
}

#[tokio::test(start_paused = true)]
async fn slow_build_times_out() {
    let engine = Arc::new(ScriptedEngine::new().build_delay(Duration::from_secs(600)));
    let timeouts = SessionTimeouts {
        init: Duration::from_secs(5),
        ..SessionTimeouts::default()
    };
    let session = controller(engine, false, timeouts);

    let err = session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::InitTimeout(_)), "{err:?}");
    assert!(err.is_timeout());
}

#[tokio::test(start_paused = true)]
async fn slow_warm_up_times_out() {
    let engine = Arc::new(ScriptedEngine::new().warmup_delay(Duration::from_secs(600)));
    let timeouts = SessionTimeouts {
        warmup: Duration::from_secs(5),
        ..SessionTimeouts::default()
    };
    let session = controller(engine.clone(), false, timeouts);

    let err = session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::InitTimeout(ref msg) if msg == "Warm-up timed out"), "{err:?}");
    assert_eq!(engine.builds(), vec![(Backend::Safe, Precision::Q8)]);
    assert_eq!(session.config(), None);
}

#[tokio::test(start_paused = true)]
async fn accelerated_init_timeout_does_not_restart() {
    let engine = Arc::new(ScriptedEngine::new().build_delay(Duration::from_secs(600)));
    let timeouts = SessionTimeouts {
        init: Duration::from_secs(5),
        ..SessionTimeouts::default()
    };
    let session = controller(engine.clone(), true, timeouts);
    let (sink, mut events) = ChannelSink::new();

    let err = session
        .init(init_payload(Backend::Accelerated, Precision::Fp16), Arc::new(sink))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::InitTimeout(_)), "{err:?}");
    assert_eq!(engine.builds(), vec![(Backend::Accelerated, Precision::Fp16)]);
    assert!(!drain(&mut events)
        .iter()
        .any(|event| matches!(event, SessionEvent::Banner(_))));
    assert_eq!(session.config(), None);
}

#[tokio::test]
async fn generate_streams_and_cleans_reply() {
    let engine = Arc::new(
        ScriptedEngine::new().reply(Backend::Safe, Reply::streamed(&["Assistant: Hi", " there\nUser: more"])),
    );
    let session = controller(engine, false, SessionTimeouts::default());
    session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap();

    let (sink, mut events) = ChannelSink::new();
    let outcome = session
        .generate(generate_payload(), Arc::new(sink))
        .await
        .unwrap();

    assert_eq!(outcome.text, "Hi there");
    assert!(!outcome.aborted);
    assert!(!session.is_generating());

    let tokens: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Token(token) => Some(token.text),
            _ => None,
        })
        .collect();
    assert_eq!(tokens, vec!["Assistant: Hi", " there\nUser: more"]);
}

#[tokio::test]
async fn abort_mid_stream_returns_partial_text() {
    let engine = Arc::new(ScriptedEngine::new().reply(
        Backend::Safe,
        Reply::streamed(&["Hel", "lo", " world"]).paused_before(1),
    ));
    let gate = engine.gate();
    let session = controller(engine, false, SessionTimeouts::default());
    session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap();

    let (sink, mut events) = ChannelSink::new();
    let running = tokio::spawn({
        let session = session.clone();
        async move { session.generate(generate_payload(), Arc::new(sink)).await }
    });

    loop {
        match events.recv().await.expect("event stream") {
            SessionEvent::Token(token) if token.text == "Hel" => break,
            _ => {}
        }
    }
    assert!(session.is_generating());
    assert!(session.abort());

    loop {
        match events.recv().await.expect("event stream") {
            SessionEvent::Status(status)
                if status.stage == Stage::Abort && status.message == "Stopping..." =>
            {
                break
            }
            _ => {}
        }
    }
    gate.notify_one();

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.text, "Hel");
    assert!(outcome.aborted);
    assert!(!session.is_generating());
    assert!(session.config().is_some());
}

#[tokio::test]
async fn abort_without_generation_is_a_noop() {
    let session = controller(Arc::new(ScriptedEngine::new()), false, SessionTimeouts::default());
    assert!(!session.abort());

    session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap();
    assert!(!session.abort());
}

#[tokio::test]
async fn garbled_accelerated_output_retries_on_safe_backend() {
    let safe_text = format!("{PROMPT} Hello there");
    let engine = Arc::new(
        ScriptedEngine::new()
            .reply(Backend::Accelerated, Reply::streamed(&["\u{FFFD}\u{FFFD}", "##"]))
            .reply(Backend::Safe, Reply::silent(RunOutput::Text(safe_text))),
    );
    let session = controller(engine.clone(), true, SessionTimeouts::default());
    let config = session
        .init(init_payload(Backend::Accelerated, Precision::Fp16), Arc::new(NoopSink))
        .await
        .unwrap();
    assert_eq!(config.backend, Backend::Accelerated);

    let (sink, mut events) = ChannelSink::new();
    let outcome = session
        .generate(generate_payload(), Arc::new(sink))
        .await
        .unwrap();

    assert_eq!(outcome.text, "Hello there");
    assert!(!outcome.aborted);
    assert_eq!(
        engine.builds(),
        vec![
            (Backend::Accelerated, Precision::Fp16),
            (Backend::Safe, Precision::Q8)
        ]
    );

    let committed = session.config().unwrap();
    assert_eq!(committed.backend, Backend::Safe);
    assert_eq!(committed.precision, Precision::Q8);

    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        SessionEvent::Banner(banner) if banner.from == "accelerated" && banner.to == "safe"
    )));
}

#[tokio::test(start_paused = true)]
async fn failed_safe_rebuild_leaves_session_uninitialized() {
    let engine = Arc::new(
        ScriptedEngine::new()
            .reply(Backend::Accelerated, Reply::streamed(&["\u{FFFD}\u{FFFD}", "##"]))
            .broken(Backend::Safe),
    );
    let session = controller(engine.clone(), true, SessionTimeouts::default());
    session
        .init(init_payload(Backend::Accelerated, Precision::Fp16), Arc::new(NoopSink))
        .await
        .unwrap();

    let err = session
        .generate(generate_payload(), Arc::new(NoopSink))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Unclassified(_)), "{err:?}");
    assert_eq!(
        engine.builds(),
        vec![
            (Backend::Accelerated, Precision::Fp16),
            (Backend::Safe, Precision::Q8)
        ]
    );
    assert_eq!(session.config(), None);
    assert!(!session.is_generating());

    let err = session
        .generate(generate_payload(), Arc::new(NoopSink))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotInitialized), "{err:?}");
}

#[tokio::test]
async fn garbled_output_on_safe_backend_is_returned_as_is() {
    let engine = Arc::new(ScriptedEngine::new().reply(Backend::Safe, Reply::streamed(&["12 34 56"])));
    let session = controller(engine.clone(), false, SessionTimeouts::default());
    session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap();

    let outcome = session
        .generate(generate_payload(), Arc::new(NoopSink))
        .await
        .unwrap();
    assert_eq!(outcome.text, "12 34 56");
    assert_eq!(engine.builds().len(), 1);
}

#[tokio::test]
async fn empty_result_is_an_error() {
    let engine = Arc::new(
        ScriptedEngine::new().reply(Backend::Safe, Reply::silent(RunOutput::Text(PROMPT.to_string()))),
    );
    let session = controller(engine, false, SessionTimeouts::default());
    session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap();

    let err = session
        .generate(generate_payload(), Arc::new(NoopSink))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::EmptyResult), "{err:?}");
    assert!(session.config().is_some());
}

#[tokio::test]
async fn generate_before_init_is_rejected() {
    let session = controller(Arc::new(ScriptedEngine::new()), false, SessionTimeouts::default());
    let err = session
        .generate(generate_payload(), Arc::new(NoopSink))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotInitialized), "{err:?}");
    assert!(!session.has_executor());
}

#[tokio::test]
async fn second_generation_is_refused_while_one_runs() {
    let engine = Arc::new(
        ScriptedEngine::new().reply(Backend::Safe, Reply::streamed(&["a", "b"]).paused_before(1)),
    );
    let gate = engine.gate();
    let session = controller(engine, false, SessionTimeouts::default());
    session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap();

    let (sink, mut events) = ChannelSink::new();
    let running = tokio::spawn({
        let session = session.clone();
        async move { session.generate(generate_payload(), Arc::new(sink)).await }
    });
    while !matches!(events.recv().await, Some(SessionEvent::Token(_))) {}

    let err = session
        .generate(generate_payload(), Arc::new(NoopSink))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::GenerationInProgress), "{err:?}");

    gate.notify_one();
    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.text, "ab");
}

#[tokio::test(start_paused = true)]
async fn stalled_generation_times_out() {
    let engine = Arc::new(
        ScriptedEngine::new().reply(Backend::Safe, Reply::streamed(&["x", "y"]).paused_before(1)),
    );
    let timeouts = SessionTimeouts {
        generate: Duration::from_secs(3),
        ..SessionTimeouts::default()
    };
    let session = controller(engine, false, timeouts);
    session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap();

    let err = session
        .generate(generate_payload(), Arc::new(NoopSink))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::GenerateTimeout), "{err:?}");
    assert!(!session.is_generating());
    assert!(session.config().is_some());
}

#[tokio::test]
async fn reset_rejects_pending_generation_and_is_idempotent() {
    let engine = Arc::new(
        ScriptedEngine::new().reply(Backend::Safe, Reply::streamed(&["a", "b"]).paused_before(1)),
    );
    let session = controller(engine, false, SessionTimeouts::default());
    session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap();

    let (sink, mut events) = ChannelSink::new();
    let running = tokio::spawn({
        let session = session.clone();
        async move { session.generate(generate_payload(), Arc::new(sink)).await }
    });
    while !matches!(events.recv().await, Some(SessionEvent::Token(_))) {}

    session.reset("user reset");
    session.reset("user reset");

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Reset(ref reason) if reason == "user reset"), "{err:?}");
    assert!(!session.has_executor());
    assert!(!session.is_generating());
    assert_eq!(session.config(), None);

    // A fresh init spawns a new executor.
    session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap();
    assert!(session.has_executor());
}

#[tokio::test]
async fn executor_panic_rejects_pending_requests() {
    let engine = Arc::new(ScriptedEngine::new().crash_on_generate());
    let session = controller(engine, false, SessionTimeouts::default());
    session
        .init(init_payload(Backend::Safe, Precision::Q8), Arc::new(NoopSink))
        .await
        .unwrap();

    let err = session
        .generate(generate_payload(), Arc::new(NoopSink))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ExecutorCrash), "{err:?}");
    assert!(!session.has_executor());
    assert_eq!(session.config(), None);

    let err = session
        .generate(generate_payload(), Arc::new(NoopSink))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotInitialized), "{err:?}");
}
