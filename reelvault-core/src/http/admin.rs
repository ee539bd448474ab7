//! Operator control routes, nested under `/admin`. Every request carries the
//! configured admin token as a bearer credential.
//!
//! - `GET /admin/queue`
//! - `GET /admin/assets`
//! - `GET|DELETE /admin/assets/{asset_id}`
//! - `POST /admin/assets/{asset_id}/ingest`
//! - `POST /admin/assets/{asset_id}/package`

use std::path::PathBuf;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::asset::{Asset, AssetId};
use crate::packager::{EncodeRequest, PackageOutcome};
use crate::queue::AdmissionStatus;

use super::error::{ApiError, ApiResult};
use super::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestBody {
    /// Source file on the server's filesystem.
    pub source: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageBody {
    pub request: EncodeRequest,
    #[serde(default)]
    pub force: bool,
}

/// Proof that the request presented the admin token.
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.admin_token.as_deref() else {
            return Err(ApiError::not_found("not found"));
        };
        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                let (scheme, token) = value.trim().split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
            });
        match presented {
            Some(token) if Sha256::digest(token.as_bytes()) == Sha256::digest(expected.as_bytes()) => {
                Ok(AdminAuth)
            }
            _ => {
                warn!(path = %parts.uri.path(), "admin request denied");
                Err(ApiError::unauthorized("admin token required"))
            }
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/queue", get(queue))
        .route("/assets", get(list_assets))
        .route("/assets/{asset_id}", get(get_asset).delete(purge_asset))
        .route("/assets/{asset_id}/ingest", post(ingest_asset))
        .route("/assets/{asset_id}/package", post(package_asset))
}

fn parse_asset(raw: &str) -> ApiResult<AssetId> {
    AssetId::parse(raw).map_err(ApiError::from)
}

async fn queue(_auth: AdminAuth, State(state): State<AppState>) -> Json<AdmissionStatus> {
    Json(state.orchestrator.queue_status())
}

async fn list_assets(_auth: AdminAuth, State(state): State<AppState>) -> ApiResult<Json<Vec<Asset>>> {
    Ok(Json(state.orchestrator.list().await?))
}

async fn get_asset(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> ApiResult<Json<Asset>> {
    let asset_id = parse_asset(&asset_id)?;
    Ok(Json(state.orchestrator.asset(&asset_id).await?))
}

async fn purge_asset(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> ApiResult<StatusCode> {
    let asset_id = parse_asset(&asset_id)?;
    state.orchestrator.purge(&asset_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ingest_asset(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    Json(body): Json<IngestBody>,
) -> ApiResult<Json<Asset>> {
    let asset_id = parse_asset(&asset_id)?;
    Ok(Json(state.orchestrator.ingest(&asset_id, &body.source).await?))
}

/// Runs the job on its own task so a disconnecting client does not cancel
/// an admitted encode.
async fn package_asset(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    Json(body): Json<PackageBody>,
) -> ApiResult<Json<PackageOutcome>> {
    let asset_id = parse_asset(&asset_id)?;
    info!(asset_id = %asset_id, force = body.force, "package requested");
    let orchestrator = state.orchestrator.clone();
    let job = tokio::spawn(async move {
        orchestrator
            .package(&asset_id, &body.request, body.force)
            .await
    });
    let outcome = job.await.map_err(|err| {
        error!(error = %err, "packaging task failed");
        ApiError::internal("packaging task failed")
    })??;
    Ok(Json(outcome))
}
