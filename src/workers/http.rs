//! Decision worker backed by a remote HTTP decision service

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::common::errors::{OrchestratorError, ResilienceError, Result};
use crate::common::traits::DecisionWorker;
use crate::common::types::{ActionKind, Decision, DomainContext, Metadata};
use crate::config::types::{BackendConfig, FallbackConfig};
use crate::resilience::fallback::FallbackExecutor;
use crate::resilience::http;
use crate::resilience::rate_limit::RateLimitTracker;
use crate::resilience::retry::{CallFailure, ResilientCaller};

/// Request body sent to the backend
#[derive(Debug, Serialize)]
struct DecideRequest<'a> {
    model: &'a str,
    context: &'a DomainContext,
}

/// Backend reply; `decision` is absent when there is nothing to propose
#[derive(Debug, Deserialize)]
struct DecideResponse {
    #[serde(default)]
    decision: Option<BackendDecision>,
}

#[derive(Debug, Deserialize)]
struct BackendDecision {
    action: ActionKind,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    amount: Option<Decimal>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    percentage: Option<Decimal>,
}

impl BackendDecision {
    fn into_decision(self, domain: &str) -> Decision {
        let mut decision = Decision::new(domain, self.action, self.rationale)
            .with_confidence(self.confidence);
        decision.target = self.target;
        decision.amount = self.amount;
        decision.percentage = self.percentage;
        decision.metadata = self.metadata;
        decision
    }
}

/// Asks a decision backend over HTTP
///
/// Models are tried in order through a [`FallbackExecutor`]; each model
/// attempt is retried with backoff by a [`ResilientCaller`] before the
/// fallback moves on. A 429 that survives the retries puts the whole
/// backend host into cooldown, honoring its `Retry-After` hint.
pub struct HttpDecisionWorker {
    name: String,
    client: Client,
    endpoint: Url,
    host: String,
    caller: ResilientCaller,
    models: FallbackExecutor,
    limits: Arc<RateLimitTracker>,
}

impl HttpDecisionWorker {
    pub fn new(
        name: impl Into<String>,
        backend: &BackendConfig,
        caller: ResilientCaller,
        fallback: FallbackConfig,
    ) -> Result<Self> {
        let name = name.into();
        let endpoint = Url::parse(&backend.url)
            .and_then(|base| base.join(&backend.decide_path))
            .map_err(|e| {
                OrchestratorError::Configuration(format!(
                    "invalid decision backend url {}: {}",
                    backend.url, e
                ))
            })?;
        if backend.models.is_empty() {
            return Err(OrchestratorError::Configuration(
                "decision backend needs at least one model".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(caller.config().attempt_timeout() + Duration::from_secs(1))
            .build()?;
        let models = FallbackExecutor::new(format!("{}-models", name), backend.models.clone(), fallback);
        let host = endpoint.host_str().unwrap_or("backend").to_string();

        Ok(Self {
            name,
            client,
            endpoint,
            host,
            caller,
            models,
            limits: Arc::new(RateLimitTracker::new(Default::default())),
        })
    }

    /// Share a rate limit tracker, e.g. between workers on the same backend
    pub fn with_rate_limits(mut self, limits: Arc<RateLimitTracker>) -> Self {
        self.limits = limits;
        self
    }

    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.limits
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn models(&self) -> &FallbackExecutor {
        &self.models
    }

    async fn ask_model(
        &self,
        model: String,
        body: serde_json::Value,
    ) -> std::result::Result<DecideResponse, CallFailure> {
        let operation = format!("{} {}", self.endpoint, model);
        let result = self
            .caller
            .call(&operation, |_attempt| {
                let request = self.client.post(self.endpoint.clone()).json(&body);
                http::send_json::<DecideResponse>(request)
            })
            .await;

        match result {
            Ok(response) => {
                self.limits.record_success(&self.host);
                Ok(response)
            }
            // Surface the last underlying failure so the fallback can classify it
            Err(ResilienceError::CallFailed { last_error, .. }) => {
                if last_error.status_code() == Some(429) {
                    let cooldown = self.limits.record_failure(&self.host, last_error.retry_after());
                    warn!(
                        host = %self.host,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "Decision backend rate limited"
                    );
                }
                Err(last_error)
            }
            Err(other) => Err(CallFailure::Other(other.to_string())),
        }
    }
}

#[async_trait]
impl DecisionWorker for HttpDecisionWorker {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, context), fields(domain = %context.domain, cycle = context.cycle))]
    async fn produce_decision(&self, context: &DomainContext) -> Result<Option<Decision>> {
        if let Some(remaining) = self.limits.remaining_cooldown(&self.host) {
            return Err(OrchestratorError::worker(
                &context.domain,
                format!("backend {} cooling down for {:?}", self.host, remaining),
            ));
        }

        let served = self
            .models
            .execute(|model| {
                let body = serde_json::to_value(DecideRequest {
                    model: &model,
                    context,
                });
                async move {
                    let body = body.map_err(|e| CallFailure::Other(e.to_string()))?;
                    self.ask_model(model, body).await
                }
            })
            .await?;

        debug!(model = %served.resource, has_decision = served.value.decision.is_some(), "Backend answered");
        Ok(served
            .value
            .decision
            .map(|d| d.into_decision(&context.domain)))
    }
}
