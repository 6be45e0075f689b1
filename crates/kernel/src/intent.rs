use std::sync::Arc;
use std::time::{Duration, Instant};

use control_plane::{AgentIdentity, ReputationBucket};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::AnalysisCache;
use crate::llm::{LlmClient, LlmError};
use crate::patterns::ThreatPatterns;
use crate::types::{AnalysisResult, SignedRequest, SuggestedAction, ThreatType};

pub const TRUSTED_SKIP_THRESHOLD: f64 = 95.0;
const DEEP_REPUTATION_THRESHOLD: f64 = 40.0;
const DEEP_BODY_LENGTH: usize = 1000;

#[derive(Clone, Debug)]
pub struct IntentAnalyzerConfig {
    pub fast_model: String,
    pub deep_model: String,
    /// Soft deadline for one model call, always shorter than the request
    /// budget; past it the fail-safe ladder takes over.
    pub soft_deadline_ms: u64,
}

impl Default for IntentAnalyzerConfig {
    fn default() -> Self {
        Self {
            fast_model: "llama3.2:3b".to_string(),
            deep_model: "llama3.1:8b".to_string(),
            soft_deadline_ms: 5_000,
        }
    }
}

/// Raw verdict the model must return. Parsing is strict: a missing or
/// out-of-range field counts as an analysis failure and engages the ladder.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LlmVerdict {
    is_malicious: bool,
    confidence: f64,
    #[serde(default)]
    threat_type: Option<ThreatType>,
    explanation: String,
    risk_score: f64,
}

/// Second pipeline stage: tiered semantic analysis. Cheap checks run first
/// (trusted skip, regex pre-screen, cache); only the remainder reaches the
/// model. Model failure never fails the request — the fail-safe ladder
/// produces a verdict from reputation and the pre-screen instead.
pub struct IntentAnalyzer {
    llm: Arc<dyn LlmClient>,
    patterns: Arc<ThreatPatterns>,
    cache: AnalysisCache,
    config: IntentAnalyzerConfig,
}

impl IntentAnalyzer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        patterns: Arc<ThreatPatterns>,
        cache: AnalysisCache,
        config: IntentAnalyzerConfig,
    ) -> Self {
        Self {
            llm,
            patterns,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    /// `deadline` is the per-request budget propagated by the pipeline; the
    /// cache lookup and the model call both run under whatever remains of it,
    /// in addition to the model client's own shorter soft deadline.
    pub async fn analyze(
        &self,
        signed: &SignedRequest,
        agent: &AgentIdentity,
        history: &[String],
        deadline: Instant,
    ) -> AnalysisResult {
        let body_text = serde_json::to_string(&signed.body).unwrap_or_default();
        let matches = self.patterns.scan(&body_text);

        if matches.is_empty() && agent.reputation >= TRUSTED_SKIP_THRESHOLD {
            return AnalysisResult {
                is_malicious: false,
                confidence: 0.95,
                threat_type: ThreatType::None,
                explanation: "trusted agent, no suspicious patterns".to_string(),
                suggested_action: SuggestedAction::Allow,
                risk_score: 5.0,
            };
        }

        let bucket = ReputationBucket::of(agent.reputation);
        // A lookup that outruns the budget counts as a miss.
        match timeout(
            remaining(deadline),
            self.cache
                .get(&signed.method, &signed.path, &signed.body, bucket),
        )
        .await
        {
            Ok(Some(cached)) => {
                debug!(agent_id = %agent.id, "analysis cache hit");
                return cached;
            }
            Ok(None) => {}
            Err(_) => warn!(agent_id = %agent.id, "analysis cache lookup timed out"),
        }

        let model = if !matches.is_empty()
            || agent.reputation < DEEP_REPUTATION_THRESHOLD
            || body_text.len() > DEEP_BODY_LENGTH
        {
            &self.config.deep_model
        } else {
            &self.config.fast_model
        };

        let prompt = build_prompt(signed, agent, &matches, history, &body_text);
        let soft = Duration::from_millis(self.config.soft_deadline_ms.max(1));
        match timeout(
            remaining(deadline).min(soft),
            self.llm.complete(model, &prompt),
        )
        .await
        {
            Ok(Ok(raw)) => match parse_verdict(&raw) {
                Ok(verdict) => {
                    let result = finalize(verdict, agent.reputation, &matches);
                    let _ = timeout(
                        remaining(deadline),
                        self.cache
                            .put(&signed.method, &signed.path, &signed.body, bucket, &result),
                    )
                    .await;
                    result
                }
                Err(err) => {
                    warn!(agent_id = %agent.id, error = %err, "llm verdict rejected");
                    fail_safe(&matches, agent.reputation)
                }
            },
            Ok(Err(err)) => {
                warn!(agent_id = %agent.id, error = %err, "llm call failed");
                fail_safe(&matches, agent.reputation)
            }
            Err(_) => {
                warn!(agent_id = %agent.id, "llm call timed out");
                fail_safe(&matches, agent.reputation)
            }
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn build_prompt(
    signed: &SignedRequest,
    agent: &AgentIdentity,
    matches: &[ThreatType],
    history: &[String],
    body_text: &str,
) -> String {
    let matched = if matches.is_empty() {
        "none".to_string()
    } else {
        matches
            .iter()
            .map(|threat| threat.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let recent = if history.is_empty() {
        "none".to_string()
    } else {
        history
            .iter()
            .take(5)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ")
    };
    format!(
        "You are a security analyst for an AI agent gateway. Classify the \
         intent of the following request.\n\
         Agent reputation: {reputation:.0}/100\n\
         Recent requests: {recent}\n\
         Pattern pre-screen matches: {matched}\n\
         Request: {method} {path}\n\
         Body: {body}\n\
         Respond with strict JSON only, no prose, using exactly this schema: \
         {{\"isMalicious\": bool, \"confidence\": number 0..1, \
         \"threatType\": one of [\"prompt_injection\",\"jailbreak_attempt\",\
         \"data_exfiltration\",\"privilege_escalation\",\"denial_of_service\",\
         \"sql_injection\",\"command_injection\",\"social_engineering\",\
         \"none\"], \"explanation\": string, \"riskScore\": number 0..100}}",
        reputation = agent.reputation,
        recent = recent,
        matched = matched,
        method = signed.method,
        path = signed.path,
        body = truncate(body_text, 2000),
    )
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

fn parse_verdict(raw: &str) -> Result<LlmVerdict, LlmError> {
    let verdict: LlmVerdict = serde_json::from_str(raw)
        .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
    if !(0.0..=1.0).contains(&verdict.confidence) {
        return Err(LlmError::InvalidResponse(format!(
            "confidence out of range: {}",
            verdict.confidence
        )));
    }
    if !(0.0..=100.0).contains(&verdict.risk_score) {
        return Err(LlmError::InvalidResponse(format!(
            "riskScore out of range: {}",
            verdict.risk_score
        )));
    }
    Ok(verdict)
}

/// Maps the model's verdict to an action, discounted by reputation: a long
/// good history absorbs some risk, a poor one amplifies it.
fn finalize(verdict: LlmVerdict, reputation: f64, matches: &[ThreatType]) -> AnalysisResult {
    let adjusted = verdict.risk_score - (reputation - 50.0) * 0.3;
    let suggested_action = if adjusted >= 80.0 {
        SuggestedAction::Block
    } else if adjusted >= 60.0 {
        SuggestedAction::Challenge
    } else if adjusted >= 40.0 {
        SuggestedAction::RateLimit
    } else {
        SuggestedAction::Allow
    };
    let threat_type = verdict
        .threat_type
        .or_else(|| matches.first().copied())
        .unwrap_or(ThreatType::None);
    AnalysisResult {
        is_malicious: verdict.is_malicious,
        confidence: verdict.confidence,
        threat_type,
        explanation: verdict.explanation,
        suggested_action,
        risk_score: verdict.risk_score.clamp(0.0, 100.0),
    }
}

/// Verdict ladder for when the model is unreachable or returned garbage.
/// Pattern hits block outright; otherwise reputation decides, failing open
/// only for established trust.
fn fail_safe(matches: &[ThreatType], reputation: f64) -> AnalysisResult {
    if let Some(threat) = matches.first() {
        return AnalysisResult {
            is_malicious: true,
            confidence: 0.8,
            threat_type: *threat,
            explanation: "analysis unavailable; pattern pre-screen matched".to_string(),
            suggested_action: SuggestedAction::Block,
            risk_score: 90.0,
        };
    }
    if reputation < 60.0 {
        AnalysisResult {
            is_malicious: false,
            confidence: 0.5,
            threat_type: ThreatType::None,
            explanation: "analysis unavailable; low reputation".to_string(),
            suggested_action: SuggestedAction::Block,
            risk_score: 80.0,
        }
    } else if reputation < 85.0 {
        AnalysisResult {
            is_malicious: false,
            confidence: 0.5,
            threat_type: ThreatType::None,
            explanation: "analysis unavailable; challenging mid-reputation agent".to_string(),
            suggested_action: SuggestedAction::Challenge,
            risk_score: 50.0,
        }
    } else {
        AnalysisResult {
            is_malicious: false,
            confidence: 0.5,
            threat_type: ThreatType::None,
            explanation: "analysis unavailable; established trust".to_string(),
            suggested_action: SuggestedAction::Allow,
            risk_score: 20.0,
        }
    }
}
