pub mod anomaly;
pub mod cache;
pub mod challenge;
pub mod crypto;
pub mod forwarder;
pub mod intent;
pub mod llm;
pub mod patterns;
pub mod test_support;
pub mod types;

pub use anomaly::{AgentProfile, AnomalyDetector, AnomalyReport, HISTORY_CAP, PROFILE_TTL};
pub use cache::{AnalysisCache, CacheStats, ANALYSIS_TTL};
pub use challenge::{
    solve_proof_of_work, Challenge, ChallengeError, ChallengeService, ChallengeType,
    CHALLENGE_TTL, COMPLETED_RETENTION, PENDING_CAP,
};
pub use crypto::{CryptoVerifier, VerifyError, NONCE_TTL, TIMESTAMP_SKEW_MS};
pub use forwarder::{EchoForwarder, Forwarder, HttpForwarder, HttpForwarderConfig};
pub use intent::{IntentAnalyzer, IntentAnalyzerConfig, TRUSTED_SKIP_THRESHOLD};
pub use llm::{HttpLlmClient, HttpLlmConfig, LlmClient, LlmError};
pub use patterns::ThreatPatterns;
pub use types::{
    AnalysisResult, EvaluationContext, HttpRequest, HttpResponse, SignedRequest, SuggestedAction,
    ThreatType, UpstreamRequest, UpstreamResponse,
};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use control_plane::{
    KvError, KvRateLimiter, MetricPoint, MetricsSink, PolicyActionKind, PolicyEngine,
    SecurityEvent, SecurityEventLog,
};
use serde_json::json;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("store unavailable: {0}")]
    Store(#[from] KvError),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub const HEADER_SIGNATURE: &str = "x-agent-signature";
pub const HEADER_PUBKEY: &str = "x-agent-pubkey";
pub const HEADER_PAYLOAD: &str = "x-signed-payload";
pub const HEADER_CHALLENGE_ID: &str = "x-challenge-id";
pub const CHALLENGE_VERIFY_URL: &str = "/api/challenge/verify";
const COMPLETED_CHALLENGE_RISK: f64 = 30.0;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub upstream_base_url: String,
    /// Per-request budget; every KV, LLM, and upstream call a request makes
    /// runs under what remains of it.
    pub request_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: "http://127.0.0.1:9000".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

/// Bounds `fut` by the time left until `deadline`; `on_timeout` supplies the
/// error a blown budget maps to.
async fn with_deadline<T, E, F>(
    deadline: Instant,
    on_timeout: impl FnOnce() -> E,
    fut: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match timeout(deadline.saturating_duration_since(Instant::now()), fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

/// The request-evaluation pipeline: cryptographic identity, semantic intent,
/// then policy, each stage run serially for one request. Collaborators are
/// injected at construction; there is no global state beyond the KV store
/// they share.
pub struct Pipeline {
    verifier: CryptoVerifier,
    analyzer: IntentAnalyzer,
    detector: AnomalyDetector,
    policy: Arc<PolicyEngine>,
    challenges: ChallengeService,
    rate_limiter: KvRateLimiter,
    events: SecurityEventLog,
    metrics: Arc<dyn MetricsSink>,
    forwarder: Arc<dyn Forwarder>,
    config: PipelineConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: CryptoVerifier,
        analyzer: IntentAnalyzer,
        detector: AnomalyDetector,
        policy: Arc<PolicyEngine>,
        challenges: ChallengeService,
        rate_limiter: KvRateLimiter,
        events: SecurityEventLog,
        metrics: Arc<dyn MetricsSink>,
        forwarder: Arc<dyn Forwarder>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            verifier,
            analyzer,
            detector,
            policy,
            challenges,
            rate_limiter,
            events,
            metrics,
            forwarder,
            config,
        }
    }

    pub fn verifier(&self) -> &CryptoVerifier {
        &self.verifier
    }

    pub fn challenges(&self) -> &ChallengeService {
        &self.challenges
    }

    pub async fn handle(&self, request: HttpRequest) -> Result<HttpResponse, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();
        let deadline = start + Duration::from_millis(self.config.request_timeout_ms.max(1));
        info!(
            request_id = %request_id,
            method = %request.method,
            path = %request.path,
            "pipeline request start"
        );

        let (Some(signature), Some(public_key), Some(payload_b64)) = (
            request.headers.get(HEADER_SIGNATURE),
            request.headers.get(HEADER_PUBKEY),
            request.headers.get(HEADER_PAYLOAD),
        ) else {
            self.record(&request, "missing_auth", start);
            return Ok(HttpResponse::json(
                401,
                &json!({"error": "missing authentication headers"}),
            ));
        };

        let Ok(payload_bytes) = BASE64.decode(payload_b64) else {
            self.record(&request, "malformed", start);
            return Ok(HttpResponse::json(
                400,
                &json!({"error": "signed payload is not valid base64"}),
            ));
        };
        let Ok(signed) = serde_json::from_slice::<SignedRequest>(&payload_bytes) else {
            self.record(&request, "malformed", start);
            return Ok(HttpResponse::json(
                400,
                &json!({"error": "signed payload is not a valid request"}),
            ));
        };
        if signed.method != request.method || signed.path != request.path {
            self.record(&request, "malformed", start);
            return Ok(HttpResponse::json(
                400,
                &json!({"error": "signed payload does not match the request"}),
            ));
        }

        // Stage 1: cryptographic identity.
        let agent = match with_deadline(
            deadline,
            || VerifyError::Kv(KvError::Timeout),
            self.verifier
                .verify(&payload_bytes, &signed, signature, public_key),
        )
        .await
        {
            Ok(agent) => agent,
            Err(VerifyError::Kv(err)) => return Err(GatewayError::Store(err)),
            Err(VerifyError::Malformed(detail)) => {
                self.record(&request, "malformed", start);
                return Ok(HttpResponse::json(400, &json!({"error": detail})));
            }
            Err(err) => {
                let kind = err.kind();
                warn!(request_id = %request_id, error = kind, "verification failed");
                let mut event = SecurityEvent::new("deny", &request.method, &request.path);
                event.detail = format!("crypto: {kind}");
                self.publish(event, deadline).await;
                self.record(&request, "auth_failed", start);
                return Ok(HttpResponse::json(403, &json!({"error": kind})));
            }
        };

        let mut ctx = EvaluationContext::new(agent, signed, deadline);

        // Stage 2: semantic intent, short-circuited by a completed challenge.
        let completed_challenge = match request.headers.get(HEADER_CHALLENGE_ID) {
            Some(challenge_id) => match with_deadline(
                deadline,
                || ChallengeError::Kv(KvError::Timeout),
                self.challenges.completed(challenge_id),
            )
            .await
            {
                Ok(Some(challenge)) if challenge.agent_id == ctx.agent.id => Some(challenge),
                Ok(_) => None,
                Err(ChallengeError::Kv(err)) => return Err(GatewayError::Store(err)),
                Err(_) => None,
            },
            None => None,
        };

        let body_text = serde_json::to_string(&ctx.signed.body).unwrap_or_default();
        let mut analysis = match &completed_challenge {
            Some(challenge) => AnalysisResult {
                is_malicious: false,
                confidence: 0.9,
                threat_type: ThreatType::None,
                explanation: format!("challenge {} completed", challenge.id),
                suggested_action: SuggestedAction::Allow,
                risk_score: COMPLETED_CHALLENGE_RISK,
            },
            None => {
                let history: Vec<String> = with_deadline(
                    deadline,
                    || KvError::Timeout,
                    self.detector.history(&ctx.agent.id),
                )
                .await?
                .iter()
                .take(5)
                .map(|entry| format!("{} {}", entry.method, entry.path))
                .collect();
                self.analyzer
                    .analyze(&ctx.signed, &ctx.agent, &history, deadline)
                    .await
            }
        };

        // Behavioral scoring runs against the profile as it was before this
        // request, then the request is folded in.
        if completed_challenge.is_none() {
            let report = with_deadline(
                deadline,
                || KvError::Timeout,
                self.detector.detect(&ctx.agent.id, &ctx.signed, body_text.len()),
            )
            .await?;
            if report.score > 0.0 {
                analysis.risk_score =
                    (analysis.risk_score + 20.0 * report.score).min(100.0);
                analysis
                    .explanation
                    .push_str(&format!("; anomaly: {}", report.reasons.join(", ")));
            }
        }
        with_deadline(
            deadline,
            || KvError::Timeout,
            self.detector
                .update_profile(&ctx.agent.id, &ctx.signed, body_text.len()),
        )
        .await?;
        ctx.analysis = Some(analysis);

        // Stage 3: policy. When no explicit rule matched, the analyzer's
        // suggested action stands in for the default so a fail-safe
        // challenge or block is not silently downgraded to allow.
        let decision = self.policy.evaluate(&ctx.to_policy_value()).await;
        ctx.decision = Some(decision.clone());
        let effective_kind = if decision.rule_id.is_some() {
            decision.action.kind
        } else {
            match ctx
                .analysis
                .as_ref()
                .map(|analysis| analysis.suggested_action)
                .unwrap_or(SuggestedAction::Allow)
            {
                SuggestedAction::Allow => PolicyActionKind::Allow,
                SuggestedAction::Block => PolicyActionKind::Deny,
                SuggestedAction::Challenge => PolicyActionKind::Challenge,
                SuggestedAction::RateLimit => PolicyActionKind::RateLimit,
            }
        };
        info!(
            request_id = %request_id,
            agent_id = %ctx.agent.id,
            risk = ctx.analysis.as_ref().map(|analysis| analysis.risk_score).unwrap_or(0.0),
            action = ?effective_kind,
            rule = decision.rule_id.as_deref().unwrap_or("-"),
            "policy decision"
        );

        match effective_kind {
            PolicyActionKind::Allow => {
                let response = self.forward(&request, &ctx).await?;
                self.record(&request, "forwarded", start);
                Ok(response)
            }
            PolicyActionKind::Deny => {
                self.publish(self.event_for(&ctx, "deny"), deadline).await;
                self.record(&request, "denied", start);
                let analysis = ctx.analysis.as_ref();
                Ok(HttpResponse::json(
                    403,
                    &json!({
                        "error": "request denied by policy",
                        "reason": decision.rule_name,
                        "policyId": decision.rule_id,
                        "threatType": analysis.map(|analysis| analysis.threat_type.as_str()),
                    }),
                ))
            }
            PolicyActionKind::RateLimit => {
                let params = decision.action.params.as_ref();
                let max_requests = params
                    .and_then(|params| params.get("maxRequests"))
                    .and_then(|value| value.as_u64())
                    .map(|value| value as u32)
                    .unwrap_or(ctx.agent.rate_limit.max_requests);
                let window = params
                    .and_then(|params| params.get("windowSeconds"))
                    .and_then(|value| value.as_u64())
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| Duration::from_millis(ctx.agent.rate_limit.window_ms));
                let verdict = with_deadline(
                    deadline,
                    || KvError::Timeout,
                    self.rate_limiter.check(&ctx.agent.id, max_requests, window),
                )
                .await?;
                if verdict.allowed {
                    let response = self.forward(&request, &ctx).await?;
                    self.record(&request, "forwarded", start);
                    Ok(response)
                } else {
                    self.record(&request, "rate_limited", start);
                    Ok(HttpResponse::json(
                        429,
                        &json!({
                            "error": "rate limited",
                            "retryAfter": verdict.retry_after_secs,
                            "remaining": verdict.remaining,
                        }),
                    ))
                }
            }
            PolicyActionKind::Challenge => {
                let risk = ctx
                    .analysis
                    .as_ref()
                    .map(|analysis| analysis.risk_score)
                    .unwrap_or(50.0);
                match with_deadline(
                    deadline,
                    || ChallengeError::Kv(KvError::Timeout),
                    self.challenges.issue(&ctx.agent.id, risk),
                )
                .await
                {
                    Ok(challenge) => {
                        self.publish(self.event_for(&ctx, "challenge"), deadline).await;
                        self.record(&request, "challenged", start);
                        Ok(HttpResponse::json(
                            401,
                            &json!({
                                "status": "challenge_required",
                                "challenge": challenge,
                                "verifyUrl": CHALLENGE_VERIFY_URL,
                            }),
                        ))
                    }
                    Err(ChallengeError::TooManyPending) => {
                        self.record(&request, "rate_limited", start);
                        Ok(HttpResponse::json(
                            429,
                            &json!({"error": "too many pending challenges"}),
                        ))
                    }
                    Err(ChallengeError::Kv(err)) => Err(GatewayError::Store(err)),
                    Err(err) => Err(GatewayError::Internal(err.to_string())),
                }
            }
        }
    }

    async fn forward(
        &self,
        request: &HttpRequest,
        ctx: &EvaluationContext,
    ) -> Result<HttpResponse, GatewayError> {
        let mut headers: HashMap<String, String> = request
            .headers
            .iter()
            .filter(|(key, _)| {
                !matches!(
                    key.as_str(),
                    HEADER_SIGNATURE | HEADER_PUBKEY | HEADER_PAYLOAD | HEADER_CHALLENGE_ID
                ) && !key.eq_ignore_ascii_case("host")
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        headers.insert("x-verified-agent-id".to_string(), ctx.agent.id.clone());
        headers.insert(
            "x-risk-score".to_string(),
            format!(
                "{}",
                ctx.analysis
                    .as_ref()
                    .map(|analysis| analysis.risk_score)
                    .unwrap_or(0.0)
            ),
        );
        headers.insert("x-verified".to_string(), "true".to_string());

        let upstream = UpstreamRequest {
            method: request.method.clone(),
            url: format!(
                "{}{}",
                self.config.upstream_base_url.trim_end_matches('/'),
                request.path
            ),
            headers,
            body: request.body.clone(),
        };
        let response = with_deadline(
            ctx.deadline,
            || GatewayError::Upstream("upstream deadline exceeded".to_string()),
            self.forwarder.send(&upstream),
        )
        .await?;
        Ok(HttpResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
        })
    }

    fn event_for(&self, ctx: &EvaluationContext, kind: &str) -> SecurityEvent {
        let mut event = SecurityEvent::new(kind, &ctx.signed.method, &ctx.signed.path);
        event.agent_id = Some(ctx.agent.id.clone());
        event.fingerprint = Some(ctx.agent.fingerprint.clone());
        if let Some(analysis) = &ctx.analysis {
            event.risk_score = analysis.risk_score;
            if analysis.threat_type != ThreatType::None {
                event.threat_type = Some(analysis.threat_type.as_str().to_string());
            }
            event.detail = analysis.explanation.clone();
        }
        event
    }

    async fn publish(&self, event: SecurityEvent, deadline: Instant) {
        match with_deadline(deadline, || KvError::Timeout, self.events.record(&event)).await {
            Ok(()) => {}
            Err(err) => warn!(error = %err, "security event publish failed"),
        }
    }

    fn record(&self, request: &HttpRequest, outcome: &str, start: Instant) {
        let mut tags = HashMap::new();
        tags.insert("method".to_string(), request.method.clone());
        tags.insert("outcome".to_string(), outcome.to_string());
        self.metrics
            .write(MetricPoint::now("requests_total", 1.0, tags.clone()));
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .write(MetricPoint::now("request_latency_ms", latency_ms, tags));
    }
}
