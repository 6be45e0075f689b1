use std::collections::HashMap;
use std::time::Instant;

use control_plane::{AgentIdentity, PolicyDecision};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: serde_json::to_vec(body).unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// The payload the agent signed. The signature covers the canonical JSON of
/// the whole struct; verification runs over the exact bytes received, so this
/// type is only parsed, never re-serialized for the check.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedRequest {
    pub method: String,
    pub path: String,
    pub body: Value,
    pub timestamp: u64,
    pub nonce: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    PromptInjection,
    JailbreakAttempt,
    DataExfiltration,
    PrivilegeEscalation,
    DenialOfService,
    SqlInjection,
    CommandInjection,
    SocialEngineering,
    None,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PromptInjection => "prompt_injection",
            Self::JailbreakAttempt => "jailbreak_attempt",
            Self::DataExfiltration => "data_exfiltration",
            Self::PrivilegeEscalation => "privilege_escalation",
            Self::DenialOfService => "denial_of_service",
            Self::SqlInjection => "sql_injection",
            Self::CommandInjection => "command_injection",
            Self::SocialEngineering => "social_engineering",
            Self::None => "none",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Allow,
    Block,
    Challenge,
    RateLimit,
}

/// Semantic verdict for one request. `risk_score` stays within [0, 100] and
/// `confidence` within [0, 1].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub is_malicious: bool,
    pub confidence: f64,
    pub threat_type: ThreatType,
    pub explanation: String,
    pub suggested_action: SuggestedAction,
    pub risk_score: f64,
}

/// Per-request record threaded through the pipeline stages. The deadline is
/// fixed when the request enters the pipeline; every external call a stage
/// makes runs under whatever budget remains of it.
#[derive(Clone, Debug)]
pub struct EvaluationContext {
    pub agent: AgentIdentity,
    pub signed: SignedRequest,
    pub deadline: Instant,
    pub analysis: Option<AnalysisResult>,
    pub decision: Option<PolicyDecision>,
}

impl EvaluationContext {
    pub fn new(agent: AgentIdentity, signed: SignedRequest, deadline: Instant) -> Self {
        Self {
            agent,
            signed,
            deadline,
            analysis: None,
            decision: None,
        }
    }

    /// JSON rendering the policy engine resolves dotted field paths against.
    pub fn to_policy_value(&self) -> Value {
        serde_json::json!({
            "agent": &self.agent,
            "request": {
                "method": &self.signed.method,
                "path": &self.signed.path,
                "body": &self.signed.body,
                "timestamp": self.signed.timestamp,
                "nonce": &self.signed.nonce,
            },
            "analysis": &self.analysis,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use control_plane::{AgentPermissions, RateLimitSettings};

    fn agent() -> AgentIdentity {
        AgentIdentity {
            id: "agent_1".to_string(),
            public_key: "pk".to_string(),
            fingerprint: "fp".to_string(),
            registered_at: 0,
            last_seen: 0,
            reputation: 50.0,
            permissions: AgentPermissions::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }

    #[test]
    fn policy_value_exposes_camel_case_paths() {
        let signed = SignedRequest {
            method: "GET".to_string(),
            path: "/api/users".to_string(),
            body: Value::Null,
            timestamp: 1,
            nonce: "n".to_string(),
        };
        let mut ctx = EvaluationContext::new(
            agent(),
            signed,
            Instant::now() + std::time::Duration::from_secs(10),
        );
        ctx.analysis = Some(AnalysisResult {
            is_malicious: false,
            confidence: 0.9,
            threat_type: ThreatType::None,
            explanation: "ok".to_string(),
            suggested_action: SuggestedAction::Allow,
            risk_score: 12.0,
        });
        let value = ctx.to_policy_value();
        assert_eq!(value["analysis"]["riskScore"], 12.0);
        assert_eq!(value["agent"]["permissions"]["sensitiveDataAccess"], false);
        assert_eq!(value["request"]["path"], "/api/users");
    }

    #[test]
    fn threat_type_wire_names_are_snake_case() {
        let json = serde_json::to_string(&ThreatType::PromptInjection).expect("serialize");
        assert_eq!(json, "\"prompt_injection\"");
        let parsed: ThreatType = serde_json::from_str("\"sql_injection\"").expect("parse");
        assert_eq!(parsed, ThreatType::SqlInjection);
    }
}
