use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::Method;

use crate::types::{UpstreamRequest, UpstreamResponse};
use crate::GatewayError;

#[derive(Clone, Debug)]
pub struct HttpForwarderConfig {
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for HttpForwarderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            user_agent: "gazorpazorp-gateway".to_string(),
        }
    }
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn send(&self, upstream: &UpstreamRequest) -> Result<UpstreamResponse, GatewayError>;
}

/// Forwards a verified request to the backend. Upstream status codes come
/// back verbatim; only transport failures surface as gateway errors.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    config: HttpForwarderConfig,
}

impl HttpForwarder {
    pub fn new(config: HttpForwarderConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, config }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn send(&self, upstream: &UpstreamRequest) -> Result<UpstreamResponse, GatewayError> {
        let method = Method::from_bytes(upstream.method.as_bytes())
            .map_err(|err| GatewayError::Upstream(err.to_string()))?;
        let mut headers = HeaderMap::new();
        let mut has_user_agent = false;
        for (key, value) in &upstream.headers {
            if key.eq_ignore_ascii_case("user-agent") {
                has_user_agent = true;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        if !has_user_agent {
            if let Ok(value) = HeaderValue::from_str(&self.config.user_agent) {
                headers.insert(USER_AGENT, value);
            }
        }

        let response = self
            .client
            .request(method, &upstream.url)
            .headers(headers)
            .body(upstream.body.clone())
            .send()
            .await
            .map_err(|err| GatewayError::Upstream(err.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_lowercase(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| GatewayError::Upstream(err.to_string()))?
            .to_vec();
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Test double that reflects the request body and records received headers.
pub struct EchoForwarder;

#[async_trait]
impl Forwarder for EchoForwarder {
    async fn send(&self, upstream: &UpstreamRequest) -> Result<UpstreamResponse, GatewayError> {
        let mut headers = HashMap::new();
        for (key, value) in &upstream.headers {
            headers.insert(format!("echo-{key}"), value.clone());
        }
        Ok(UpstreamResponse {
            status: 200,
            headers,
            body: upstream.body.clone(),
        })
    }
}
