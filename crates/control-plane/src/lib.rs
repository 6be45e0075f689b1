pub mod config;
pub mod events;
pub mod identity;
pub mod kv;
pub mod metrics;
pub mod policy;
pub mod rate_limit;
pub mod static_config;

pub use config::{default_config_template, ConfigError, SystemConfig, SystemConfigLoader};
pub use events::{
    SecurityEvent, SecurityEventLog, SECURITY_EVENTS_CAP, SECURITY_EVENTS_KEY, THREAT_CHANNEL,
};
pub use identity::{
    epoch_ms, AgentIdentity, AgentPermissions, KvIdentityStore, RateLimitSettings,
    ReputationBucket, ReputationChange, IDENTITY_TTL, INITIAL_REPUTATION, REPUTATION_LOG_CAP,
};
pub use kv::{InMemoryKv, KvError, KvStore, RedisKv};
pub use metrics::{InMemoryMetricsSink, MetricPoint, MetricsSink};
pub use policy::{
    default_rules, ConditionOp, PolicyAction, PolicyActionKind, PolicyCondition, PolicyDecision,
    PolicyEngine, PolicyRule, POLICY_AUDIT_CAP, POLICY_AUDIT_KEY,
};
pub use rate_limit::{KvRateLimiter, RateDecision};
