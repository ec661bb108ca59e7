// SolarMon Device - Local parameter portal
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Local HTTP portal for reading and editing parameters.
//!
//! | route               | description                           |
//! |---------------------|---------------------------------------|
//! | `GET /params`       | every descriptor with its value       |
//! | `POST /params/:id`  | apply the text body to one descriptor |
//! | `GET /health`       | liveness                              |

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use solarmon::{Agent, ApplyOutcome, Error, ParamError, ParameterInfo};
use tracing::{info, warn};

/// Portal routes over `agent`
pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/params", get(list_handler))
        .route("/params/:id", post(update_handler))
        .route("/health", get(health_handler))
        .with_state(agent)
}

/// Parameter listing handler.
async fn list_handler(State(agent): State<Arc<Agent>>) -> Json<Vec<ParameterInfo>> {
    Json(agent.parameters())
}

/// Result of one edit.
#[derive(Serialize)]
struct UpdateResponse {
    id: String,
    outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

/// Parameter edit handler; the body is the new value as text.
async fn update_handler(
    State(agent): State<Arc<Agent>>,
    Path(id): Path<String>,
    body: String,
) -> impl IntoResponse {
    let text = body.trim().to_string();
    let worker = Arc::clone(&agent);
    let key = id.clone();
    // Persisting touches the filesystem
    let result = tokio::task::spawn_blocking(move || worker.apply_local(&key, &text)).await;

    let outcome = match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(Error::Param(ParamError::Unknown(_)))) => {
            return (StatusCode::NOT_FOUND, Json(response(&id, "Unknown", None))).into_response()
        }
        Ok(Err(e)) => {
            warn!("Portal update of {} failed: {}", id, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
        Err(e) => {
            warn!("Portal worker failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let value = agent
        .registry()
        .get(&id)
        .map(|p| agent.live().read(|c| p.render(c)));
    let status = if outcome.is_rejected() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        if outcome == ApplyOutcome::Updated {
            info!("Portal set {}", id);
        }
        StatusCode::OK
    };
    (status, Json(response(&id, &format!("{:?}", outcome), value))).into_response()
}

fn response(id: &str, outcome: &str, value: Option<String>) -> UpdateResponse {
    UpdateResponse {
        id: id.to_string(),
        outcome: outcome.to_string(),
        value,
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use solarmon::broker::memory::MemoryBroker;
    use solarmon::{AgentConfig, ConfigStore, MemoryStore, RecordingRestarter, StaticLink};

    fn agent() -> Arc<Agent> {
        Arc::new(
            Agent::new(
                ConfigStore::new(Arc::new(MemoryStore::new())),
                Arc::new(MemoryBroker::new()),
                Arc::new(StaticLink::new("aabbcc")),
                Arc::new(RecordingRestarter::new()),
                AgentConfig::default(),
            )
            .unwrap(),
        )
    }

    async fn update(agent: &Arc<Agent>, id: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = update_handler(
            State(Arc::clone(agent)),
            Path(id.to_string()),
            body.to_string(),
        )
        .await
        .into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    #[tokio::test]
    async fn test_list_params() {
        let Json(params) = list_handler(State(agent())).await;
        assert_eq!(params.len(), 19);
        assert_eq!(params[0].id, "deviceId");
    }

    #[tokio::test]
    async fn test_update_param() {
        let agent = agent();
        let (status, body) = update(&agent, "relaisDuration", "15\n").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "Updated");
        assert_eq!(body["value"], "15");
        assert_eq!(agent.live().snapshot().relais_duration(), 15);
    }

    #[tokio::test]
    async fn test_rejected_and_unknown() {
        let agent = agent();
        let (status, body) = update(&agent, "relaisDuration", "99").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["outcome"], "OutOfRange");
        let (status, _) = update(&agent, "nope", "1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_router_builds() {
        let _ = router(agent());
    }
}
