#[derive(Clone, Debug)]
pub struct StaticConfigItem {
    pub key: &'static str,
    pub description: &'static str,
    pub value_type: &'static str,
    pub default_value: &'static str,
}

pub static STATIC_CONFIG_TABLE: &[StaticConfigItem] = &[
    StaticConfigItem {
        key: "cache.redis_url",
        description: "Redis connection string (empty selects the in-process store)",
        value_type: "string",
        default_value: "",
    },
    StaticConfigItem {
        key: "upstream.base_url",
        description: "Backend base URL verified requests are forwarded to",
        value_type: "string",
        default_value: "http://127.0.0.1:9000",
    },
    StaticConfigItem {
        key: "upstream.timeout_ms",
        description: "Upstream forwarding timeout in milliseconds",
        value_type: "number",
        default_value: "30000",
    },
    StaticConfigItem {
        key: "llm.endpoint",
        description: "Completion endpoint used for intent analysis",
        value_type: "string",
        default_value: "http://127.0.0.1:11434/api/generate",
    },
    StaticConfigItem {
        key: "llm.fast_model",
        description: "Model used for routine intent analysis",
        value_type: "string",
        default_value: "llama3.2:3b",
    },
    StaticConfigItem {
        key: "llm.deep_model",
        description: "Model used when patterns matched, reputation is low, or the body is large",
        value_type: "string",
        default_value: "llama3.1:8b",
    },
    StaticConfigItem {
        key: "llm.timeout_ms",
        description: "Soft deadline for a single analysis call; past it the fail-safe ladder engages",
        value_type: "number",
        default_value: "5000",
    },
    StaticConfigItem {
        key: "security.admin_token",
        description: "Bearer token protecting the admin and dashboard routes",
        value_type: "string",
        default_value: "",
    },
    StaticConfigItem {
        key: "server.request_timeout_ms",
        description: "Per-request deadline; every KV, LLM, and upstream call runs under it",
        value_type: "number",
        default_value: "10000",
    },
];
