//! Status HTTP server
//!
//! Exposes the entity registry as JSON for dashboards and debugging.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::entity::{EntityInfo, EntityRegistry};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /entities
async fn get_entities(State(registry): State<Arc<EntityRegistry>>) -> Json<Vec<EntityInfo>> {
    Json(registry.snapshot())
}

/// Handler for GET /entities/:camera
async fn get_camera_entities(
    State(registry): State<Arc<EntityRegistry>>,
    Path(camera): Path<String>,
) -> Json<Vec<EntityInfo>> {
    Json(registry.snapshot_camera(&camera))
}

/// Creates the axum Router with the entity endpoints
pub fn create_status_router(registry: Arc<EntityRegistry>) -> Router {
    Router::new()
        .route("/entities", get(get_entities))
        .route("/entities/:camera", get(get_camera_entities))
        .with_state(registry)
}

/// Runs the status HTTP server on `bind`
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start
pub async fn run_status_server(registry: Arc<EntityRegistry>, bind: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_status_router(registry);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Status server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BoundingBox, DetectedIdentity, Domain};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Vec<EntityInfo>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let entities = if status == StatusCode::OK {
            serde_json::from_slice(&body).unwrap()
        } else {
            Vec::new()
        };
        (status, entities)
    }

    fn populated_registry() -> Arc<EntityRegistry> {
        let registry = Arc::new(EntityRegistry::detached());
        let (alice, _) = registry.register("front_door", Domain::FaceRecognition, "alice");
        alice.mark_detected(&DetectedIdentity::new(
            "alice",
            BoundingBox::new(1, 2, 3, 4),
            Some(0.9),
            None,
        ));
        registry.register("front_door", Domain::FaceRecognition, "bob");
        registry.register("garage", Domain::ObjectDetector, "car");
        registry
    }

    #[tokio::test]
    async fn test_get_entities_returns_all() {
        let (status, entities) = get_json(create_status_router(populated_registry()), "/entities").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(entities.len(), 3);
        let alice = entities.iter().find(|e| e.label == "alice").unwrap();
        assert!(alice.present);
        assert_eq!(
            alice.last_identity.as_ref().map(|i| i.coordinates),
            Some(BoundingBox::new(1, 2, 3, 4))
        );
        assert!(!entities.iter().find(|e| e.label == "bob").unwrap().present);
    }

    #[tokio::test]
    async fn test_get_camera_entities_filters() {
        let (status, entities) =
            get_json(create_status_router(populated_registry()), "/entities/garage").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_id, "binary_sensor.garage_object_detector_car");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (status, _) = get_json(create_status_router(populated_registry()), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        let result = run_status_server(populated_registry(), "not-an-address").await;
        assert!(matches!(result, Err(ServerError::InvalidAddress(_))));
    }
}
