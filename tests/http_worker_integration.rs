//! Integration tests for the HTTP decision worker against a mock backend
//!
//! ```
//! cargo test --test http_worker_integration
//! ```

mod common;

use common::backend_responses;
use decision_orchestrator::config::types::{
    BackendConfig, FallbackConfig, RateLimitConfig, RetryConfig,
};
use decision_orchestrator::resilience::http::MAX_RETRY_AFTER;
use decision_orchestrator::{
    ActionKind, DecisionWorker, DomainContext, HttpDecisionWorker, OrchestratorError,
    RateLimitTracker, ResilientCaller,
};
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter: 0.0,
        attempt_timeout_ms: 2_000,
        ..RetryConfig::default()
    }
}

fn worker(server: &MockServer, models: &[&str], retry: RetryConfig) -> HttpDecisionWorker {
    let backend = BackendConfig::new(
        server.uri(),
        models.iter().map(|m| m.to_string()).collect(),
    );
    HttpDecisionWorker::new(
        "test-backend",
        &backend,
        ResilientCaller::new(retry),
        FallbackConfig::default(),
    )
    .expect("worker should build")
}

fn context(domain: &str) -> DomainContext {
    DomainContext {
        domain: domain.to_string(),
        cycle: 1,
        balance: dec!(1000),
        peak_balance: dec!(1000),
        open_positions: Vec::new(),
        recent_decisions: Vec::new(),
        consecutive_no_ops: 0,
        built_at: chrono::Utc::now(),
    }
}

fn json_body(raw: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(raw, "application/json")
}

// ============================================================================
// Happy path
// ============================================================================

#[test_log::test(tokio::test)]
async fn test_backend_decision_is_mapped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/decide"))
        .and(body_string_contains(r#""model":"primary""#))
        .respond_with(json_body(backend_responses::BUY_BTC))
        .expect(1)
        .mount(&server)
        .await;

    let worker = worker(&server, &["primary"], fast_retry(0));
    let decision = worker
        .produce_decision(&context("spot"))
        .await
        .unwrap()
        .expect("backend proposed a decision");

    assert_eq!(decision.domain, "spot");
    assert_eq!(decision.action, ActionKind::Open);
    assert_eq!(decision.target.as_deref(), Some("BTC"));
    assert_eq!(decision.amount, Some(dec!(100)));
    assert_eq!(decision.confidence, 0.82);
}

#[test_log::test(tokio::test)]
async fn test_empty_backend_answer_is_no_decision() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(json_body(backend_responses::NOTHING))
        .mount(&server)
        .await;

    let worker = worker(&server, &["primary"], fast_retry(0));
    let decision = worker.produce_decision(&context("spot")).await.unwrap();
    assert!(decision.is_none());
}

// ============================================================================
// Retries and fallback
// ============================================================================

#[test_log::test(tokio::test)]
async fn test_transient_failure_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(json_body(backend_responses::BUY_BTC))
        .expect(1)
        .mount(&server)
        .await;

    let worker = worker(&server, &["primary"], fast_retry(3));
    let decision = worker.produce_decision(&context("spot")).await.unwrap();
    assert!(decision.is_some());
    assert_eq!(worker.models().last_success().as_deref(), Some("primary"));
}

#[test_log::test(tokio::test)]
async fn test_falls_back_to_next_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains(r#""model":"primary""#))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains(r#""model":"backup""#))
        .respond_with(json_body(backend_responses::BUY_BTC))
        .expect(2)
        .mount(&server)
        .await;

    let worker = worker(&server, &["primary", "backup"], fast_retry(1));
    let decision = worker.produce_decision(&context("spot")).await.unwrap();

    assert!(decision.is_some());
    assert_eq!(worker.models().last_success().as_deref(), Some("backup"));
    assert!(!worker.models().is_available("primary"));

    // The failed model stays in cooldown, so the next call goes straight to backup
    let again = worker.produce_decision(&context("spot")).await.unwrap();
    assert!(again.is_some());
}

#[test_log::test(tokio::test)]
async fn test_non_retryable_status_aborts_chain() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad context"))
        .expect(1)
        .mount(&server)
        .await;

    let worker = worker(&server, &["primary", "backup"], fast_retry(3));
    let result = worker.produce_decision(&context("spot")).await;

    match result {
        Err(OrchestratorError::Resilience(e)) => assert!(!e.is_retryable()),
        other => panic!("expected a non-retryable resilience error, got {:?}", other),
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

#[test_log::test(tokio::test)]
async fn test_rate_limited_backend_cools_down() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .expect(1)
        .mount(&server)
        .await;

    let limits = Arc::new(RateLimitTracker::new(RateLimitConfig::default()));
    let worker = worker(&server, &["primary"], fast_retry(0)).with_rate_limits(limits.clone());

    let first = worker.produce_decision(&context("spot")).await;
    assert!(first.is_err());

    let remaining = limits
        .remaining_cooldown("127.0.0.1")
        .expect("host should be cooling down");
    assert!(remaining > Duration::from_secs(25));

    // The host is not contacted again while cooling down
    let second = worker.produce_decision(&context("spot")).await;
    match second {
        Err(OrchestratorError::Worker { message, .. }) => assert!(message.contains("cooling down")),
        other => panic!("expected cooldown error, got {:?}", other),
    }
}

#[test_log::test(tokio::test)]
async fn test_oversized_retry_after_is_capped() {
    for raw in ["1e300", "18446744073709551615"] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", raw))
            .expect(2)
            .mount(&server)
            .await;

        let limits = Arc::new(RateLimitTracker::new(RateLimitConfig::default()));
        let worker = worker(&server, &["primary"], fast_retry(1)).with_rate_limits(limits.clone());

        // The retry waits the configured maximum, not the advertised hint
        let result = worker.produce_decision(&context("spot")).await;
        assert!(result.is_err(), "Retry-After {}", raw);

        let remaining = limits
            .remaining_cooldown("127.0.0.1")
            .expect("host should be cooling down");
        assert!(remaining <= MAX_RETRY_AFTER, "Retry-After {}", raw);
        assert!(remaining > MAX_RETRY_AFTER - Duration::from_secs(60));
    }
}
