use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::identity::epoch_ms;
use crate::kv::KvStore;

pub const POLICY_AUDIT_KEY: &str = "gazorpazorp:audit_log";
pub const POLICY_AUDIT_CAP: usize = 100_000;
const AUDIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Contains,
    Matches,
    In,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyCondition {
    pub field: String,
    pub operator: ConditionOp,
    pub value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyActionKind {
    Allow,
    Deny,
    RateLimit,
    Challenge,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyAction {
    #[serde(rename = "type")]
    pub kind: PolicyActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl PolicyAction {
    pub fn allow() -> Self {
        Self {
            kind: PolicyActionKind::Allow,
            params: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub conditions: Vec<PolicyCondition>,
    pub action: PolicyAction,
    pub enabled: bool,
}

#[derive(Clone, Debug)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub rule_id: Option<String>,
    pub rule_name: Option<String>,
}

#[derive(Serialize)]
struct AuditedDecision<'a> {
    ts: u64,
    rule_id: Option<&'a str>,
    action: PolicyActionKind,
    agent_id: Option<&'a str>,
    path: Option<&'a str>,
}

/// Ordered rule evaluation over a JSON rendering of the evaluation context.
/// Lower priority wins; the first rule whose conditions all match decides.
/// No match means allow.
pub struct PolicyEngine {
    rules: RwLock<Vec<PolicyRule>>,
    kv: Arc<dyn KvStore>,
}

impl PolicyEngine {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_rules(kv, default_rules())
    }

    pub fn with_rules(kv: Arc<dyn KvStore>, rules: Vec<PolicyRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            kv,
        }
    }

    pub fn shared(kv: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self::new(kv))
    }

    pub fn rules(&self) -> Vec<PolicyRule> {
        self.rules.read().clone()
    }

    pub fn upsert_rule(&self, rule: PolicyRule) {
        let mut rules = self.rules.write();
        match rules.iter().position(|existing| existing.id == rule.id) {
            Some(index) => rules[index] = rule,
            None => rules.push(rule),
        }
    }

    pub fn remove_rule(&self, rule_id: &str) {
        self.rules.write().retain(|rule| rule.id != rule_id);
    }

    pub async fn evaluate(&self, context: &Value) -> PolicyDecision {
        let mut rules = self.rules.read().clone();
        rules.sort_by_key(|rule| rule.priority);
        for rule in rules.iter().filter(|rule| rule.enabled) {
            if rule
                .conditions
                .iter()
                .all(|condition| condition_matches(condition, context))
            {
                let decision = PolicyDecision {
                    action: rule.action.clone(),
                    rule_id: Some(rule.id.clone()),
                    rule_name: Some(rule.name.clone()),
                };
                self.audit(&decision, context).await;
                return decision;
            }
        }
        let decision = PolicyDecision {
            action: PolicyAction::allow(),
            rule_id: None,
            rule_name: None,
        };
        self.audit(&decision, context).await;
        decision
    }

    /// Best-effort append with its own bound: a slow store must not stall
    /// the decision it records.
    async fn audit(&self, decision: &PolicyDecision, context: &Value) {
        let entry = AuditedDecision {
            ts: epoch_ms(),
            rule_id: decision.rule_id.as_deref(),
            action: decision.action.kind,
            agent_id: lookup(context, "agent.id").and_then(Value::as_str),
            path: lookup(context, "request.path").and_then(Value::as_str),
        };
        let Ok(payload) = serde_json::to_string(&entry) else {
            return;
        };
        let append = self
            .kv
            .lpush_trim(POLICY_AUDIT_KEY, &payload, POLICY_AUDIT_CAP, None);
        match tokio::time::timeout(AUDIT_TIMEOUT, append).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "policy audit append failed"),
            Err(_) => warn!("policy audit append timed out"),
        }
    }
}

/// Resolves a dotted field path (`agent.permissions.sensitiveDataAccess`)
/// against the context value.
pub fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn condition_matches(condition: &PolicyCondition, context: &Value) -> bool {
    let Some(actual) = lookup(context, &condition.field) else {
        return false;
    };
    match condition.operator {
        ConditionOp::Eq => actual == &condition.value,
        ConditionOp::Neq => actual != &condition.value,
        ConditionOp::Gt => match (actual.as_f64(), condition.value.as_f64()) {
            (Some(lhs), Some(rhs)) => lhs > rhs,
            _ => false,
        },
        ConditionOp::Lt => match (actual.as_f64(), condition.value.as_f64()) {
            (Some(lhs), Some(rhs)) => lhs < rhs,
            _ => false,
        },
        ConditionOp::Contains => match (actual, &condition.value) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        ConditionOp::Matches => match (actual.as_str(), condition.value.as_str()) {
            (Some(text), Some(pattern)) => Regex::new(pattern)
                .map(|regex| regex.is_match(text))
                .unwrap_or(false),
            _ => false,
        },
        ConditionOp::In => match &condition.value {
            Value::Array(items) => items.contains(actual),
            _ => false,
        },
    }
}

/// The ruleset the gateway ships with.
pub fn default_rules() -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            id: "block_high_risk".to_string(),
            name: "Block high-risk requests".to_string(),
            priority: 1,
            conditions: vec![PolicyCondition {
                field: "analysis.riskScore".to_string(),
                operator: ConditionOp::Gt,
                value: Value::from(90.0),
            }],
            action: PolicyAction {
                kind: PolicyActionKind::Deny,
                params: None,
            },
            enabled: true,
        },
        PolicyRule {
            id: "protect_admin".to_string(),
            name: "Protect admin endpoints".to_string(),
            priority: 5,
            conditions: vec![
                PolicyCondition {
                    field: "request.path".to_string(),
                    operator: ConditionOp::Matches,
                    value: Value::from("^/api/admin"),
                },
                PolicyCondition {
                    field: "agent.permissions.sensitiveDataAccess".to_string(),
                    operator: ConditionOp::Eq,
                    value: Value::from(false),
                },
            ],
            action: PolicyAction {
                kind: PolicyActionKind::Deny,
                params: None,
            },
            enabled: true,
        },
        PolicyRule {
            id: "rate_limit_untrusted".to_string(),
            name: "Rate limit untrusted agents".to_string(),
            priority: 10,
            conditions: vec![PolicyCondition {
                field: "agent.reputation".to_string(),
                operator: ConditionOp::Lt,
                value: Value::from(30.0),
            }],
            action: PolicyAction {
                kind: PolicyActionKind::RateLimit,
                params: Some(serde_json::json!({
                    "maxRequests": 10,
                    "windowSeconds": 60,
                })),
            },
            enabled: true,
        },
        PolicyRule {
            id: "challenge_suspicious".to_string(),
            name: "Challenge suspicious requests".to_string(),
            priority: 20,
            conditions: vec![
                PolicyCondition {
                    field: "analysis.riskScore".to_string(),
                    operator: ConditionOp::Gt,
                    value: Value::from(50.0),
                },
                PolicyCondition {
                    field: "analysis.riskScore".to_string(),
                    operator: ConditionOp::Lt,
                    value: Value::from(90.0),
                },
            ],
            action: PolicyAction {
                kind: PolicyActionKind::Challenge,
                params: None,
            },
            enabled: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use serde_json::json;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(InMemoryKv::shared())
    }

    fn context(risk: f64, reputation: f64, path: &str, sensitive: bool) -> Value {
        json!({
            "agent": {
                "id": "agent_1",
                "reputation": reputation,
                "permissions": { "sensitiveDataAccess": sensitive },
            },
            "request": { "method": "GET", "path": path },
            "analysis": { "riskScore": risk },
        })
    }

    #[tokio::test]
    async fn risk_91_is_denied_by_highest_priority_rule() {
        let decision = engine().evaluate(&context(91.0, 80.0, "/api/users", true)).await;
        assert_eq!(decision.action.kind, PolicyActionKind::Deny);
        assert_eq!(decision.rule_id.as_deref(), Some("block_high_risk"));
    }

    #[tokio::test]
    async fn risk_90_matches_neither_block_nor_challenge() {
        let decision = engine().evaluate(&context(90.0, 80.0, "/api/users", true)).await;
        assert_eq!(decision.action.kind, PolicyActionKind::Allow);
    }

    #[tokio::test]
    async fn risk_89_matches_challenge_suspicious() {
        let decision = engine().evaluate(&context(89.0, 80.0, "/api/users", true)).await;
        assert_eq!(decision.action.kind, PolicyActionKind::Challenge);
        assert_eq!(decision.rule_id.as_deref(), Some("challenge_suspicious"));
    }

    #[tokio::test]
    async fn admin_path_without_sensitive_access_is_denied() {
        let decision = engine()
            .evaluate(&context(10.0, 80.0, "/api/admin/export", false))
            .await;
        assert_eq!(decision.action.kind, PolicyActionKind::Deny);
        assert_eq!(decision.rule_id.as_deref(), Some("protect_admin"));
    }

    #[tokio::test]
    async fn admin_path_with_sensitive_access_is_allowed() {
        let decision = engine()
            .evaluate(&context(10.0, 80.0, "/api/admin/export", true))
            .await;
        assert_eq!(decision.action.kind, PolicyActionKind::Allow);
    }

    #[tokio::test]
    async fn untrusted_agent_is_rate_limited() {
        let decision = engine().evaluate(&context(10.0, 20.0, "/api/users", true)).await;
        assert_eq!(decision.action.kind, PolicyActionKind::RateLimit);
        let params = decision.action.params.expect("params");
        assert_eq!(params["maxRequests"], 10);
        assert_eq!(params["windowSeconds"], 60);
    }

    #[tokio::test]
    async fn priority_ascending_wins() {
        // Risk 95 with reputation 20 matches both block_high_risk (1) and
        // rate_limit_untrusted (10); the lower priority number decides.
        let decision = engine().evaluate(&context(95.0, 20.0, "/api/users", true)).await;
        assert_eq!(decision.rule_id.as_deref(), Some("block_high_risk"));
    }

    #[tokio::test]
    async fn disabled_rules_are_skipped() {
        let kv = InMemoryKv::shared();
        let mut rules = default_rules();
        rules[0].enabled = false;
        let engine = PolicyEngine::with_rules(kv, rules);
        let decision = engine.evaluate(&context(95.0, 80.0, "/api/users", true)).await;
        assert_eq!(decision.action.kind, PolicyActionKind::Allow);
    }

    #[tokio::test]
    async fn operators_contains_and_in() {
        let engine = PolicyEngine::with_rules(
            InMemoryKv::shared(),
            vec![
                PolicyRule {
                    id: "method_in".to_string(),
                    name: "method in set".to_string(),
                    priority: 1,
                    conditions: vec![PolicyCondition {
                        field: "request.method".to_string(),
                        operator: ConditionOp::In,
                        value: json!(["DELETE", "PUT"]),
                    }],
                    action: PolicyAction {
                        kind: PolicyActionKind::Deny,
                        params: None,
                    },
                    enabled: true,
                },
                PolicyRule {
                    id: "path_contains".to_string(),
                    name: "path contains".to_string(),
                    priority: 2,
                    conditions: vec![PolicyCondition {
                        field: "request.path".to_string(),
                        operator: ConditionOp::Contains,
                        value: json!("internal"),
                    }],
                    action: PolicyAction {
                        kind: PolicyActionKind::Challenge,
                        params: None,
                    },
                    enabled: true,
                },
            ],
        );
        let ctx = json!({"request": {"method": "DELETE", "path": "/api/users"}});
        assert_eq!(
            engine.evaluate(&ctx).await.rule_id.as_deref(),
            Some("method_in")
        );
        let ctx = json!({"request": {"method": "GET", "path": "/api/internal/x"}});
        assert_eq!(
            engine.evaluate(&ctx).await.rule_id.as_deref(),
            Some("path_contains")
        );
    }

    #[tokio::test]
    async fn missing_field_never_matches() {
        let decision = engine().evaluate(&json!({"request": {"path": "/x"}})).await;
        assert_eq!(decision.action.kind, PolicyActionKind::Allow);
    }

    #[tokio::test]
    async fn decisions_are_audited() {
        let kv = InMemoryKv::shared();
        let engine = PolicyEngine::new(kv.clone());
        engine
            .evaluate(&context(95.0, 80.0, "/api/users", true))
            .await;
        let entries = kv.lrange(POLICY_AUDIT_KEY, 0, -1).await.expect("lrange");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("block_high_risk"));
    }
}
