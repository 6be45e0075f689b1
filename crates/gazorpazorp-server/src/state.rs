use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use control_plane::{
    default_config_template, InMemoryKv, InMemoryMetricsSink, KvIdentityStore, KvRateLimiter,
    KvStore, MetricsSink, PolicyEngine, RedisKv, SecurityEventLog, SystemConfig,
    SystemConfigLoader,
};
use kernel::{
    AnalysisCache, AnomalyDetector, ChallengeService, CryptoVerifier, HttpForwarder,
    HttpForwarderConfig, HttpLlmClient, HttpLlmConfig, IntentAnalyzer, IntentAnalyzerConfig,
    Pipeline, PipelineConfig, ThreatPatterns,
};

use crate::error::AppError;

pub struct AppState {
    pub config: SystemConfig,
    pub admin_token: String,
    /// Same per-request budget the pipeline runs under; admin handlers bound
    /// their own store calls with it.
    pub request_timeout: Duration,
    pub kv: Arc<dyn KvStore>,
    pub pipeline: Pipeline,
    pub events: SecurityEventLog,
    pub metrics: Arc<dyn MetricsSink>,
}

impl AppState {
    pub async fn from_config(config: SystemConfig) -> Result<Self, AppError> {
        let redis_url = config.get_string("cache.redis_url");
        let kv: Arc<dyn KvStore> = if redis_url.trim().is_empty() {
            InMemoryKv::shared()
        } else {
            Arc::new(RedisKv::connect(&redis_url).await?)
        };

        let llm = HttpLlmClient::new(HttpLlmConfig {
            endpoint: config.get_string("llm.endpoint"),
            timeout_ms: config.get_number("llm.timeout_ms").max(1) as u64,
        });
        let forwarder = HttpForwarder::new(HttpForwarderConfig {
            timeout_ms: config.get_number("upstream.timeout_ms").max(1) as u64,
            ..HttpForwarderConfig::default()
        });

        let metrics: Arc<dyn MetricsSink> = InMemoryMetricsSink::shared();
        let events = SecurityEventLog::new(kv.clone());
        let identities = KvIdentityStore::new(kv.clone());
        let verifier = CryptoVerifier::new(identities, kv.clone());
        let analyzer = IntentAnalyzer::new(
            Arc::new(llm),
            Arc::new(ThreatPatterns::new()),
            AnalysisCache::new(kv.clone()),
            IntentAnalyzerConfig {
                fast_model: config.get_string("llm.fast_model"),
                deep_model: config.get_string("llm.deep_model"),
                soft_deadline_ms: config.get_number("llm.timeout_ms").max(1) as u64,
            },
        );
        let pipeline = Pipeline::new(
            verifier,
            analyzer,
            AnomalyDetector::new(kv.clone()),
            PolicyEngine::shared(kv.clone()),
            ChallengeService::new(kv.clone()),
            KvRateLimiter::new(kv.clone()),
            events.clone(),
            metrics.clone(),
            Arc::new(forwarder),
            PipelineConfig {
                upstream_base_url: config.get_string("upstream.base_url"),
                request_timeout_ms: config.get_number("server.request_timeout_ms").max(1) as u64,
            },
        );

        let admin_token = config.get_string("security.admin_token");
        let request_timeout =
            Duration::from_millis(config.get_number("server.request_timeout_ms").max(1) as u64);
        Ok(Self {
            config,
            admin_token,
            request_timeout,
            kv,
            pipeline,
            events,
            metrics,
        })
    }
}

pub fn load_config(path: &Path) -> Result<SystemConfig, AppError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(SystemConfigLoader::from_str(&raw)?)
}

pub fn create_default_config(path: &Path) -> Result<String, AppError> {
    let content = default_config_template();
    std::fs::write(path, content.as_bytes())?;
    Ok(content)
}
