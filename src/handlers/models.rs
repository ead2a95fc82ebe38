//! # Model Management REST API Handlers
//!
//! HTTP surface over the shared [`ModelCache`](crate::models::ModelCache):
//! inspecting which speech-to-text models are resident and evicting ones that
//! are no longer wanted. Loading happens implicitly the first time a model key
//! is used by a transcription request.
//!
//! ## Available Endpoints:
//! - `GET /v1/models` - List cached models with their load timestamps
//! - `DELETE /v1/models?model=KEY` - Evict a cached model

use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// Query parameters for the eviction endpoint.
///
/// Model keys routinely contain slashes (`openai/whisper-base`), so the key
/// travels as a query parameter rather than a path segment.
#[derive(Debug, Deserialize)]
pub struct ReleaseModelQuery {
    /// Cache key of the model to evict.
    pub model: String,
}

/// List every model currently resident in the cache.
///
/// ## Endpoint: `GET /v1/models`
///
/// ## Response:
/// ```json
/// {
///   "models": [
///     {"model": "base", "loaded_at": "2025-01-01T12:00:00Z"}
///   ],
///   "count": 1,
///   "timestamp": "2025-01-01T12:34:56Z"
/// }
/// ```
pub async fn list_models(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let handles = state.models.snapshot().await;

    let models: Vec<_> = handles
        .iter()
        .map(|handle| {
            json!({
                "model": handle.key(),
                "loaded_at": handle.loaded_at().to_rfc3339(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "models": models,
        "count": models.len(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Evict one model from the cache, dropping its weights once the last
/// in-flight request holding the handle finishes.
///
/// ## Endpoint: `DELETE /v1/models?model=KEY`
///
/// ## Response:
/// ```json
/// {
///   "released": "base",
///   "timestamp": "2025-01-01T12:34:56Z"
/// }
/// ```
///
/// Returns 404 when the key is not cached.
pub async fn release_model(
    query: web::Query<ReleaseModelQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let key = query.into_inner().model;

    if !state.models.release(&key).await {
        return Err(AppError::NotFound(format!("model '{}' is not loaded", key)));
    }

    info!("Released model '{}'", key);

    Ok(HttpResponse::Ok().json(json!({
        "released": key,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_query_parsing() {
        let query: ReleaseModelQuery =
            serde_json::from_str(r#"{"model": "openai/whisper-base"}"#).unwrap();
        assert_eq!(query.model, "openai/whisper-base");
    }

    #[test]
    fn test_release_query_requires_model() {
        let result = serde_json::from_str::<ReleaseModelQuery>("{}");
        assert!(result.is_err());
    }
}
