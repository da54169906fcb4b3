//! End-to-end behavior of the gateway facade against scripted backends.

mod common;

use common::{backend_yaml, chat_model, config, Scripted, Step};
use futures::future::join_all;
use llm_gateway::{
    BackendId, CallContext, CallerId, ChannelTraceSink, CompletionRequest, Gateway, GatewayConfig, GatewayError,
    TraceEvent, TraceSink, UnsupportedParamPolicy, UsageFilter, UsageTracker,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn build(config: GatewayConfig, backend: &Arc<Scripted>) -> (Arc<Gateway>, Arc<UsageTracker>) {
    let usage = Arc::new(UsageTracker::new());
    let gateway = Gateway::builder(config)
        .backend(backend.clone())
        .usage_store(usage.clone())
        .build()
        .expect("gateway builds");
    (gateway, usage)
}

fn prompt(text: &str) -> CompletionRequest {
    CompletionRequest::from_prompt(text, None)
}

fn bypass() -> CallContext {
    CallContext::default().bypass_cache()
}

#[tokio::test]
async fn test_cache_hit_skips_backend_usage_and_rate_budget() {
    let backend = Arc::new(Scripted::new());
    let cfg = config(
        &[backend_yaml("a", "    limits:\n      requests_per_minute: 10\n")],
        &chat_model(&["a"], &[]),
    );
    let (gateway, usage) = build(cfg, &backend);

    let first = gateway.complete("chat", prompt("hello")).await.expect("served");
    let second = gateway.complete("chat", prompt("hello")).await.expect("served");

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.text, first.text);
    assert_eq!(backend.calls(), vec!["a"]);
    assert_eq!(usage.len(), 1);

    let budget = gateway
        .executor()
        .rate_limiter()
        .stats(&BackendId::new("a").expect("valid id"))
        .expect("tracked");
    assert_eq!(budget.admissions_in_window, 1);

    let stats = gateway.cache_stats().await.expect("in-memory cache keeps stats");
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn test_fingerprint_ignores_field_order_and_spelled_out_defaults() {
    let backend = Arc::new(Scripted::new());
    let (gateway, _usage) = build(config(&[backend_yaml("a", "")], &chat_model(&["a"], &[])), &backend);

    let one: CompletionRequest = serde_json::from_str(
        r#"{"messages":[{"role":"user","content":"hi"}],"seed":3,"extra":{"a":1,"b":2}}"#,
    )
    .expect("valid json");
    let other: CompletionRequest = serde_json::from_str(
        r#"{"extra":{"b":2,"a":1},"seed":3,"temperature":0.7,"messages":[{"content":"hi","role":"user"}]}"#,
    )
    .expect("valid json");

    assert!(!gateway.complete("chat", one).await.expect("served").cached);
    assert!(gateway.complete("chat", other).await.expect("served").cached);
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn test_bypass_cache_always_calls_backend() {
    let backend = Arc::new(Scripted::new());
    let (gateway, usage) = build(config(&[backend_yaml("a", "")], &chat_model(&["a"], &[])), &backend);

    for _ in 0..3 {
        let response = gateway
            .complete_with("chat", prompt("hello"), &bypass())
            .await
            .expect("served");
        assert!(!response.cached);
    }
    assert_eq!(backend.calls_to("a"), 3);
    assert_eq!(usage.len(), 3);
}

#[tokio::test]
async fn test_requests_per_minute_hold_under_concurrency() {
    let backend = Arc::new(Scripted::new());
    let cfg = config(
        &[backend_yaml("a", "    limits:\n      requests_per_minute: 5\n")],
        &chat_model(&["a"], &[]),
    );
    let (gateway, usage) = build(cfg, &backend);

    let calls = (0..12).map(|i| {
        let gateway = Arc::clone(&gateway);
        async move { gateway.complete("chat", prompt(&format!("question {i}"))).await }
    });
    let results = join_all(calls).await;

    let served = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(served, 5);
    assert_eq!(backend.calls_to("a"), 5);
    assert_eq!(usage.len(), 5);
    for result in results.iter().filter_map(|r| r.as_ref().err()) {
        match result {
            GatewayError::RateLimited { retry_after, .. } => {
                assert!(retry_after.is_some_and(|d| d > Duration::ZERO));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_walk_the_whole_chain() {
    let backend = Arc::new(
        Scripted::new()
            .script("a", vec![Step::Transient])
            .script("b", vec![Step::Transient]),
    );
    let cfg = config(
        &[backend_yaml("a", ""), backend_yaml("b", ""), backend_yaml("c", "")],
        &chat_model(&["a"], &["b", "c"]),
    );
    let (gateway, usage) = build(cfg, &backend);

    let started = Instant::now();
    let response = gateway.complete("chat", prompt("hello")).await.expect("served by c");
    let elapsed = started.elapsed();

    assert_eq!(response.backend.as_str(), "c");
    assert_eq!(backend.calls(), vec!["a", "a", "b", "b", "c"]);
    // One 100ms backoff on each failing candidate
    assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(250), "elapsed {elapsed:?}");

    let records = usage.records(&UsageFilter::all());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].backend.as_str(), "c");
}

#[tokio::test]
async fn test_permanent_failures_are_not_retried() {
    let backend = Arc::new(
        Scripted::new()
            .script("a", vec![Step::Permanent])
            .script("b", vec![Step::Permanent]),
    );
    let cfg = config(&[backend_yaml("a", ""), backend_yaml("b", "")], &chat_model(&["a"], &["b"]));
    let (gateway, usage) = build(cfg, &backend);

    let err = gateway.complete("chat", prompt("hello")).await.unwrap_err();
    let (model, attempts) = match err {
        GatewayError::AllBackendsExhausted { model, attempts } => (model, attempts),
        other => panic!("expected AllBackendsExhausted, got {other:?}"),
    };
    assert_eq!(model, "chat");
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts.attempts_for("a"), 1);
    assert_eq!(attempts.attempts_for("b"), 1);
    assert!(attempts.to_string().contains("a#1"));
    assert!(attempts.to_string().contains("authentication"));
    assert!(usage.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_success_records_usage_once() {
    let backend = Arc::new(
        Scripted::new().script("a", vec![Step::Transient, Step::Reply(Duration::ZERO)]),
    );
    let (gateway, usage) = build(config(&[backend_yaml("a", "")], &chat_model(&["a"], &[])), &backend);

    let response = gateway.complete("chat", prompt("hello")).await.expect("served on retry");
    assert_eq!(response.backend.as_str(), "a");
    assert_eq!(backend.calls_to("a"), 2);
    assert_eq!(usage.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_stops_the_chain_promptly() {
    let backend = Arc::new(Scripted::new().script("a", vec![Step::Reply(Duration::from_secs(10))]));
    let cfg = config(
        &[backend_yaml("a", "    timeout: 30s\n"), backend_yaml("b", "")],
        &chat_model(&["a"], &["b"]),
    );
    let (gateway, usage) = build(cfg, &backend);

    let ctx = CallContext::default().with_timeout(Duration::from_secs(1));
    let started = Instant::now();
    let err = gateway.complete_with("chat", prompt("hello"), &ctx).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, GatewayError::DeadlineExceeded { .. }), "got {err:?}");
    assert!(elapsed < Duration::from_millis(1100), "elapsed {elapsed:?}");
    assert_eq!(backend.calls(), vec!["a"]);
    assert!(usage.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_in_flight_attempt() {
    let backend = Arc::new(Scripted::new().script("a", vec![Step::Reply(Duration::from_secs(10))]));
    let (gateway, usage) = build(config(&[backend_yaml("a", "")], &chat_model(&["a"], &[])), &backend);

    let token = CancellationToken::new();
    let ctx = CallContext::default().with_cancellation(token.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
    });

    let err = gateway.complete_with("chat", prompt("hello"), &ctx).await.unwrap_err();
    assert!(matches!(err, GatewayError::Cancelled { .. }), "got {err:?}");
    assert!(usage.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_per_attempt_timeout_is_transient() {
    let backend = Arc::new(
        Scripted::new().script("a", vec![Step::Reply(Duration::from_secs(10)), Step::Reply(Duration::ZERO)]),
    );
    let cfg = config(&[backend_yaml("a", "    timeout: 2s\n")], &chat_model(&["a"], &[]));
    let (gateway, _usage) = build(cfg, &backend);

    let response = gateway.complete("chat", prompt("hello")).await.expect("served on retry");
    assert_eq!(response.backend.as_str(), "a");
    assert_eq!(backend.calls_to("a"), 2);
}

#[tokio::test]
async fn test_unknown_model_and_empty_request_are_rejected() {
    let backend = Arc::new(Scripted::new());
    let (gateway, _usage) = build(config(&[backend_yaml("a", "")], &chat_model(&["a"], &[])), &backend);

    let err = gateway.complete("missing", prompt("hello")).await.unwrap_err();
    assert!(matches!(err, GatewayError::UnknownModel { .. }), "got {err:?}");

    let err = gateway.complete("chat", CompletionRequest::default()).await.unwrap_err();
    assert!(matches!(err, GatewayError::RequestRejected { .. }), "got {err:?}");
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_unsupported_parameters_strip_or_reject() {
    let narrow = "    capabilities:\n      parameters: [temperature, max_tokens]\n";
    let with_seed = || {
        CompletionRequest::builder()
            .message(llm_gateway::ChatMessage::user("hello"))
            .seed(42)
            .build()
            .expect("valid request")
    };

    let backend = Arc::new(Scripted::new());
    let (gateway, _usage) = build(config(&[backend_yaml("a", narrow)], &chat_model(&["a"], &[])), &backend);
    gateway.complete("chat", with_seed()).await.expect("served without seed");
    let sent = backend.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seed, None);
    assert!(sent[0].max_tokens.is_some());

    let backend = Arc::new(Scripted::new());
    let mut cfg = config(&[backend_yaml("a", narrow)], &chat_model(&["a"], &[]));
    cfg.routing.unsupported_params = UnsupportedParamPolicy::Reject;
    let (gateway, _usage) = build(cfg, &backend);
    let err = gateway.complete("chat", with_seed()).await.unwrap_err();
    assert!(
        matches!(err, GatewayError::RequestRejected { field: Some(ref f), .. } if f == "seed"),
        "got {err:?}"
    );
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_embeddings_route_by_capability() {
    let embedder = "    capabilities:\n      chat: false\n      embeddings: true\n      parameters: []\n";
    let backend = Arc::new(Scripted::new());
    let cfg = config(
        &[backend_yaml("e", embedder)],
        "  - name: embed\n    backends: [e]\n",
    );
    let (gateway, usage) = build(cfg, &backend);

    let response = gateway.embed("embed", ["one", "three"]).await.expect("embedded");
    assert_eq!(response.vectors.len(), 2);
    assert_eq!(response.vectors[1][0], 5.0);
    assert_eq!(usage.len(), 1);

    let err = gateway.complete("embed", prompt("hello")).await.unwrap_err();
    assert!(matches!(err, GatewayError::RequestRejected { .. }), "got {err:?}");

    let err = gateway.embed("embed", Vec::<String>::new()).await.unwrap_err();
    assert!(matches!(err, GatewayError::RequestRejected { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_usage_is_attributed_to_caller_and_session() {
    let backend = Arc::new(Scripted::new());
    let cfg = config(
        &[backend_yaml(
            "a",
            "    pricing:\n      input_cost_per_1k: 1.0\n      output_cost_per_1k: 2.0\n",
        )],
        &chat_model(&["a"], &[]),
    );
    let (gateway, _usage) = build(cfg, &backend);

    let ctx = CallContext::new(CallerId::new("billing").expect("valid caller")).with_session("s-1");
    gateway.complete_with("chat", prompt("hello"), &ctx).await.expect("served");
    gateway.complete("chat", prompt("other")).await.expect("served");

    let billing = gateway
        .usage(&UsageFilter::all().caller("billing"))
        .expect("readable");
    assert_eq!(billing.calls, 1);
    assert_eq!(billing.prompt_tokens, 10);
    assert_eq!(billing.completion_tokens, 5);
    assert!((billing.cost - 0.02).abs() < 1e-9);

    let session = gateway.usage(&UsageFilter::all().session("s-1")).expect("readable");
    assert_eq!(session.calls, 1);
    let everyone = gateway.usage(&UsageFilter::all().model("chat")).expect("readable");
    assert_eq!(everyone.calls, 2);
}

#[tokio::test]
async fn test_trace_sink_sees_misses_and_hits() {
    let backend = Arc::new(Scripted::new());
    let (sink, mut events) = ChannelTraceSink::new(8);
    let gateway = Gateway::builder(config(&[backend_yaml("a", "")], &chat_model(&["a"], &[])))
        .backend(backend.clone())
        .trace_sink(Arc::new(sink))
        .build()
        .expect("gateway builds");

    let ctx = CallContext::default().with_session("s-9");
    gateway.complete_with("chat", prompt("hello"), &ctx).await.expect("served");
    gateway.complete_with("chat", prompt("hello"), &ctx).await.expect("served");

    let miss = events.try_recv().expect("first event");
    assert_eq!(miss.name, "complete");
    assert_eq!(miss.model, "chat");
    assert_eq!(miss.session_id.as_deref(), Some("s-9"));
    assert_eq!(miss.metadata.get("cache").map(String::as_str), Some("miss"));
    assert_eq!(miss.metadata.get("backend").map(String::as_str), Some("a"));
    assert_eq!(miss.output["text"], "from a");

    let hit = events.try_recv().expect("second event");
    assert_eq!(hit.metadata.get("cache").map(String::as_str), Some("hit"));
    assert_ne!(hit.metadata.get("call_id"), miss.metadata.get("call_id"));
}

/// Counts events it is handed while reporting itself disabled
#[derive(Default)]
struct DisabledSink {
    recorded: AtomicUsize,
}

impl TraceSink for DisabledSink {
    fn record_call(&self, _event: TraceEvent) {
        self.recorded.fetch_add(1, Ordering::SeqCst);
    }

    fn enabled(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn test_disabled_trace_sink_gets_no_events() {
    let backend = Arc::new(Scripted::new());
    let sink = Arc::new(DisabledSink::default());
    let gateway = Gateway::builder(config(&[backend_yaml("a", "")], &chat_model(&["a"], &[])))
        .backend(backend.clone())
        .trace_sink(sink.clone())
        .build()
        .expect("gateway builds");

    gateway.complete("chat", prompt("hello")).await.expect("served");
    gateway.complete("chat", prompt("hello")).await.expect("served");

    assert_eq!(sink.recorded.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalidate_model_forces_a_fresh_call() {
    let backend = Arc::new(Scripted::new());
    let (gateway, _usage) = build(config(&[backend_yaml("a", "")], &chat_model(&["a"], &[])), &backend);

    gateway.complete("chat", prompt("hello")).await.expect("served");
    assert_eq!(gateway.invalidate_model("chat").await.expect("cache reachable"), 1);
    let again = gateway.complete("chat", prompt("hello")).await.expect("served");
    assert!(!again.cached);
    assert_eq!(backend.calls_to("a"), 2);
}

#[tokio::test]
async fn test_metrics_count_calls_and_attempts() {
    let backend = Arc::new(Scripted::new().script("a", vec![Step::Permanent]));
    let (gateway, _usage) = build(
        config(&[backend_yaml("a", ""), backend_yaml("b", "")], &chat_model(&["a"], &["b"])),
        &backend,
    );

    gateway.complete("chat", prompt("hello")).await.expect("served by b");
    let rendered = gateway.metrics().expect("enabled by default").render();
    assert!(rendered.contains("llm_gateway_calls_total"));
    assert!(rendered.contains("llm_gateway_attempts_total"));
    assert!(rendered.contains("llm_gateway_fallbacks_total"));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_call_releases_in_flight_gauge() {
    let backend = Arc::new(Scripted::new().script("a", vec![Step::Reply(Duration::from_secs(10))]));
    let (gateway, _usage) = build(config(&[backend_yaml("a", "")], &chat_model(&["a"], &[])), &backend);

    let abandoned = tokio::time::timeout(Duration::from_millis(100), gateway.complete("chat", prompt("slow"))).await;
    assert!(abandoned.is_err());
    assert_eq!(backend.calls_to("a"), 1);

    let rendered = gateway.metrics().expect("enabled by default").render();
    assert!(rendered.contains("llm_gateway_in_flight_attempts{backend=\"a\"} 0"), "{rendered}");
    assert_eq!(gateway.executor().in_flight(&BackendId::new("a").expect("valid id")), 0);
}

#[tokio::test]
async fn test_builder_rejects_invalid_catalog() {
    let cfg = config(
        &[
            backend_yaml("a", "    fallbacks: [b]\n"),
            backend_yaml("b", "    fallbacks: [a]\n"),
        ],
        &chat_model(&["a"], &[]),
    );
    let err = Gateway::builder(cfg)
        .backend(Arc::new(Scripted::new()))
        .build()
        .unwrap_err();
    assert!(matches!(err, GatewayError::Config { .. }), "got {err:?}");
    assert!(err.to_string().contains("cycle"));
}
