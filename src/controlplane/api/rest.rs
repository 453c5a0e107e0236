//! REST API Handlers
//!
//! Implements the REST endpoints for submitting raid-group jobs and reading
//! the configuration store.

use crate::controlplane::job::{CreateRaidGroupJob, JobOutcome, JobStatus};
use crate::controlplane::Orchestrator;
use crate::domain::ports::ObjectId;
use crate::error::{Error, ErrorCategory, ErrorCode, Result};
use crate::store::entry::{EdgeEntry, ObjectEntry, UserEntry};
use crate::store::tables::StoreStatus;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Result of a create job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRaidGroupResponse {
    pub job_number: u64,
    pub object_id: Option<ObjectId>,
    pub raid_group_number: Option<u32>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&JobOutcome> for CreateRaidGroupResponse {
    fn from(outcome: &JobOutcome) -> Self {
        Self {
            job_number: outcome.job_number,
            object_id: outcome.object_id,
            raid_group_number: outcome.raid_group_number,
            status: outcome.status,
            error_code: outcome.error_code(),
            message: outcome.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// One object with its edges and user identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResponse {
    pub object: ObjectEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserEntry>,
    /// Downstream edges, by client index
    pub edges: Vec<EdgeEntry>,
    /// Edges of objects consuming this one
    pub upstream: Vec<EdgeEntry>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Raid group endpoints
            .route("/v1/raid-groups", post(create_raid_group))
            .route("/v1/raid-groups/:number", get(get_raid_group))
            // Store endpoints
            .route("/v1/objects/:id", get(get_object))
            .route("/v1/status", get(get_status))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

fn error_response(status: StatusCode, error: &str, message: String) -> axum::response::Response {
    (
        status,
        Json(ApiErrorResponse {
            error: error.into(),
            message,
            details: None,
        }),
    )
        .into_response()
}

fn status_for(outcome: &JobOutcome) -> StatusCode {
    match (outcome.status, outcome.error.as_ref().map(|e| e.category)) {
        (JobStatus::Completed, _) => StatusCode::CREATED,
        (JobStatus::Failed, Some(ErrorCategory::Validation)) => StatusCode::BAD_REQUEST,
        (JobStatus::Failed, Some(ErrorCategory::Capacity)) => StatusCode::UNPROCESSABLE_ENTITY,
        (JobStatus::Failed, Some(ErrorCategory::System))
        | (JobStatus::Failed, Some(ErrorCategory::SchemaVersion)) => StatusCode::SERVICE_UNAVAILABLE,
        (JobStatus::Failed, _) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Run a create job to completion
async fn create_raid_group(
    State(state): State<AppState>,
    Json(job): Json<CreateRaidGroupJob>,
) -> impl IntoResponse {
    info!(
        raid_type = %job.raid_type,
        drive_count = job.drive_count,
        "Create raid group requested"
    );
    let outcome = state.orchestrator.create_raid_group(job).await;
    if !outcome.is_completed() {
        error!(job_number = outcome.job_number, error = ?outcome.error, "Create raid group failed");
    }
    (status_for(&outcome), Json(CreateRaidGroupResponse::from(&outcome)))
}

/// Object entry with its edges
async fn get_object(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let object_id = match parse_object_id(&id) {
        Ok(object_id) => object_id,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_object_id", e.to_string()),
    };
    match describe_object(&state.orchestrator, object_id) {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Object {} not found", object_id),
        ),
    }
}

/// Raid group by user-visible number
async fn get_raid_group(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> impl IntoResponse {
    let found = state
        .orchestrator
        .store()
        .find_user_by_raid_group_number(number)
        .and_then(|user| describe_object(&state.orchestrator, user.header.object_id));
    match found {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Raid group {} not found", number),
        ),
    }
}

/// Orchestrator and table status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.orchestrator.status()))
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.store().status() {
        StoreStatus::Ready => (StatusCode::OK, "ready".to_string()),
        status => (StatusCode::SERVICE_UNAVAILABLE, status.to_string()),
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

fn describe_object(orchestrator: &Orchestrator, object_id: ObjectId) -> Option<ObjectResponse> {
    let store = orchestrator.store();
    let object = store.get_entry_by_id(object_id)?;
    Some(ObjectResponse {
        object,
        user: store.user_entry_for_object(object_id),
        edges: store.edges_of(object_id),
        upstream: store.find_upstream_edges(object_id),
    })
}

/// Parse an object id given in decimal or `0x` hex
fn parse_object_id(s: &str) -> Result<ObjectId> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    match parsed {
        Ok(id) if id != ObjectId::INVALID.0 => Ok(ObjectId(id)),
        _ => Err(Error::ApiValidation(format!("invalid object id: {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{DriveSpec, InMemoryArray};
    use crate::config::{ServiceConfig, Timeouts};
    use crate::controlplane::ProvisionContext;
    use crate::domain::ports::DriveLocation;
    use crate::metrics::JobMetrics;
    use crate::store::journal::MemoryJournal;
    use crate::store::tables::ConfigTableStore;
    use crate::store::transaction::TransactionManager;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn setup() -> (Arc<Orchestrator>, Router) {
        let config = ServiceConfig {
            timeouts: Timeouts::fast(),
            ..Default::default()
        };
        let store = Arc::new(ConfigTableStore::with_limits(&config.limits).unwrap());
        let txn = Arc::new(TransactionManager::new(store.clone(), Arc::new(MemoryJournal::new())));
        let array = InMemoryArray::new(store);
        for slot in 4..7 {
            array
                .add_drive(&txn, DriveSpec::new(DriveLocation::new(0, 0, slot), 0x10000))
                .await
                .unwrap();
        }
        let ctx = ProvisionContext::new(txn, array.collaborators(), &config);
        let orchestrator = Orchestrator::new(ctx, Arc::new(JobMetrics::new().unwrap()));
        orchestrator.initialize_defaults().await.unwrap();
        let router = RestRouter::new(orchestrator.clone()).build();
        (orchestrator, router)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/raid-groups")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_parse_object_id() {
        assert_eq!(parse_object_id("260").unwrap(), ObjectId(260));
        assert_eq!(parse_object_id("0x104").unwrap(), ObjectId(0x104));
        assert!(parse_object_id("").is_err());
        assert!(parse_object_id("0xzz").is_err());
        assert!(parse_object_id("4294967295").is_err());
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let (_orchestrator, router) = setup().await;
        let body = serde_json::json!({
            "raidType": "raid5",
            "driveCount": 3,
            "drives": [
                { "bus": 0, "enclosure": 0, "slot": 4 },
                { "bus": 0, "enclosure": 0, "slot": 5 },
                { "bus": 0, "enclosure": 0, "slot": 6 }
            ]
        });
        let response = router.clone().oneshot(create_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["status"], "completed");
        let number = created["raidGroupNumber"].as_u64().unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/raid-groups/{}", number))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let group = body_json(response).await;
        assert_eq!(group["edges"].as_array().unwrap().len(), 3);
        assert_eq!(group["object"]["header"]["object_id"], created["objectId"]);
    }

    #[tokio::test]
    async fn test_validation_failure_is_bad_request() {
        let (_orchestrator, router) = setup().await;
        let body = serde_json::json!({
            "raidType": "raid5",
            "driveCount": 2,
            "drives": [
                { "bus": 0, "enclosure": 0, "slot": 4 },
                { "bus": 0, "enclosure": 0, "slot": 5 }
            ]
        });
        let response = router.oneshot(create_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let failed = body_json(response).await;
        assert_eq!(failed["errorCode"], "invalid_drive_count");
    }

    #[tokio::test]
    async fn test_missing_object_and_readiness() {
        let (orchestrator, router) = setup().await;
        let response = router
            .clone()
            .oneshot(Request::builder().uri("/v1/objects/0x3ff").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let ready = Request::builder().uri("/ready").body(Body::empty()).unwrap();
        assert_eq!(router.clone().oneshot(ready).await.unwrap().status(), StatusCode::OK);

        orchestrator.store().enter_service_mode("test");
        let ready = Request::builder().uri("/ready").body(Body::empty()).unwrap();
        assert_eq!(
            router.oneshot(ready).await.unwrap().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
