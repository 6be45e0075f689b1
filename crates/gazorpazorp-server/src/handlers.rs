use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Response};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use control_plane::{AgentPermissions, SecurityEvent};
use kernel::{ChallengeError, HttpRequest as PipelineRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub public_key: String,
    #[serde(default)]
    pub permissions: Option<AgentPermissions>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeVerifyRequest {
    pub challenge_id: String,
    pub solution: String,
}

#[derive(Serialize)]
pub struct ChallengeVerifyResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct MetricPointResponse {
    pub name: String,
    pub value: f64,
    pub timestamp_ms: u64,
    pub tags: HashMap<String, String>,
}

#[derive(Serialize)]
pub struct SimpleResponse {
    pub ok: bool,
}

pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response<Body>, AppError> {
    let token = extract_bearer_token(req.headers());
    if state.admin_token.trim().is_empty() || token.as_deref() != Some(state.admin_token.as_str())
    {
        return Err(AppError::unauthorized("invalid admin token"));
    }
    Ok(next.run(req).await)
}

/// Every non-API path lands here: the request runs the evaluation pipeline
/// and either comes back with the upstream's response or with the gateway's
/// verdict.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response<Body>, AppError> {
    let (parts, body) = req.into_parts();
    let method = parts.method.to_string();
    let path = parts.uri.path().to_string();
    let headers = convert_headers(&parts.headers);
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;

    let pipeline_request = PipelineRequest {
        method,
        path,
        headers,
        body: body_bytes.to_vec(),
    };
    let response = state.pipeline.handle(pipeline_request).await?;

    let mut builder = Response::builder().status(response.status);
    for (key, value) in response.headers {
        if let (Ok(name), Ok(value)) = (
            key.parse::<header::HeaderName>(),
            HeaderValue::from_str(&value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(response.body))
        .map_err(|err| AppError::internal(err.to_string()))
}

/// Bounds an admin-handler store call with the configured request budget.
async fn bounded<T, F>(state: &AppState, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, control_plane::KvError>>,
{
    match tokio::time::timeout(state.request_timeout, fut).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::unavailable("store deadline exceeded")),
    }
}

pub async fn challenge_verify(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChallengeVerifyRequest>,
) -> Result<Json<ChallengeVerifyResponse>, AppError> {
    let verify = state
        .pipeline
        .challenges()
        .verify(&payload.challenge_id, &payload.solution);
    match tokio::time::timeout(state.request_timeout, verify).await {
        Err(_) => Err(AppError::unavailable("store deadline exceeded")),
        Ok(Ok(_)) => Ok(Json(ChallengeVerifyResponse {
            status: "verified",
            error: None,
        })),
        Ok(Err(ChallengeError::Kv(err))) => Err(AppError::from(err)),
        Ok(Err(err)) => Ok(Json(ChallengeVerifyResponse {
            status: "failed",
            error: Some(err.to_string()),
        })),
    }
}

pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let register = state
        .pipeline
        .verifier()
        .register_agent(&payload.public_key, payload.permissions);
    let agent = match tokio::time::timeout(state.request_timeout, register).await {
        Err(_) => return Err(AppError::unavailable("store deadline exceeded")),
        Ok(Err(kernel::VerifyError::Kv(err))) => return Err(AppError::from(err)),
        Ok(result) => result.map_err(|err| AppError::bad_request(err.to_string()))?,
    };
    Ok(Json(json!({ "agent": agent })))
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let identity = bounded(&state, state.pipeline.verifier().identities().get(&fingerprint))
        .await?
        .ok_or_else(|| AppError::not_found("agent not found"))?;
    Ok(Json(json!({ "agent": identity })))
}

pub async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<SimpleResponse>, AppError> {
    bounded(
        &state,
        state.pipeline.verifier().identities().remove(&fingerprint),
    )
    .await?;
    Ok(Json(SimpleResponse { ok: true }))
}

pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<SecurityEvent>>, AppError> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let events = bounded(&state, state.events.recent(limit)).await?;
    Ok(Json(events))
}

/// Live threat stream for the dashboard. The subscription is scoped to this
/// connection; dropping the stream releases the channel.
pub async fn events_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|message| {
        message
            .ok()
            .map(|data| Ok::<_, Infallible>(Event::default().data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn list_metrics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<MetricPointResponse>>, AppError> {
    let points = state
        .metrics
        .list()
        .into_iter()
        .map(|point| MetricPointResponse {
            name: point.name,
            value: point.value,
            timestamp_ms: point.timestamp_ms,
            tags: point.tags,
        })
        .collect();
    Ok(Json(points))
}

fn convert_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_lowercase(), value.to_string());
        }
    }
    map
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use control_plane::{SystemConfigLoader, INITIAL_REPUTATION};
    use kernel::test_support::test_keypair;

    async fn test_state() -> Arc<AppState> {
        let config = SystemConfigLoader::from_str(
            "cache = { redis_url = \"\" }\nsecurity = { admin_token = \"test-token\" }\n",
        )
        .expect("config");
        Arc::new(AppState::from_config(config).await.expect("state"))
    }

    #[tokio::test]
    async fn register_then_get_roundtrip() {
        let state = test_state().await;
        let (_, public_key) = test_keypair();
        let Json(created) = register_agent(
            State(state.clone()),
            Json(RegisterRequest {
                public_key: public_key.clone(),
                permissions: None,
            }),
        )
        .await
        .expect("register");
        let fingerprint = created["agent"]["fingerprint"]
            .as_str()
            .expect("fingerprint")
            .to_string();
        assert_eq!(
            created["agent"]["reputation"].as_f64(),
            Some(INITIAL_REPUTATION)
        );

        let Json(fetched) = get_agent(State(state), Path(fingerprint))
            .await
            .expect("get");
        assert_eq!(fetched["agent"]["publicKey"].as_str(), Some(public_key.as_str()));
    }

    #[tokio::test]
    async fn register_rejects_garbage_key() {
        let state = test_state().await;
        let result = register_agent(
            State(state),
            Json(RegisterRequest {
                public_key: "not a key".to_string(),
                permissions: None,
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delete_agent_removes_identity() {
        let state = test_state().await;
        let (_, public_key) = test_keypair();
        let Json(created) = register_agent(
            State(state.clone()),
            Json(RegisterRequest {
                public_key,
                permissions: None,
            }),
        )
        .await
        .expect("register");
        let fingerprint = created["agent"]["fingerprint"]
            .as_str()
            .expect("fingerprint")
            .to_string();

        delete_agent(State(state.clone()), Path(fingerprint.clone()))
            .await
            .expect("delete");
        let result = get_agent(State(state), Path(fingerprint)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn challenge_verify_reports_failed_for_unknown_id() {
        let state = test_state().await;
        let Json(response) = challenge_verify(
            State(state),
            Json(ChallengeVerifyRequest {
                challenge_id: "missing".to_string(),
                solution: "whatever".to_string(),
            }),
        )
        .await
        .expect("verify");
        assert_eq!(response.status, "failed");
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn events_listing_is_empty_on_fresh_state() {
        let state = test_state().await;
        let Json(events) = list_events(State(state), Query(EventsQuery { limit: None }))
            .await
            .expect("events");
        assert!(events.is_empty());
    }
}
