use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{
    ACCEPT_RANGES, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, CACHE_CONTROL, CONTENT_LENGTH,
    CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::asset::AssetId;
use crate::delivery::{DeliveryError, SegmentName, MANIFEST_CONTENT_TYPE};
use crate::license::{LicenseError, NO_STORE_HEADERS};
use crate::token::{TokenError, VerifiedToken};

use super::error::{ApiError, ApiResult};
use super::extract::RequestContext;
use super::AppState;

const SEGMENT_CACHE_CONTROL: &str = "private, max-age=3600";

fn parse_asset(raw: &str, route: &'static str) -> ApiResult<AssetId> {
    AssetId::parse(raw).map_err(|err| {
        warn!(route, error = %err, "rejected asset id");
        ApiError::from(err)
    })
}

fn authorize(
    state: &AppState,
    ctx: &RequestContext,
    asset_id: &AssetId,
    route: &'static str,
) -> Result<VerifiedToken, TokenError> {
    let result = match &ctx.token {
        Ok(token) => state.tokens.verify(token, Some(asset_id), &ctx.meta),
        Err(err) => Err(err.clone()),
    };
    if let Err(err) = &result {
        warn!(route, asset_id = %asset_id, client_ip = ?ctx.meta.ip, reason = %err, "request denied");
    }
    result
}

fn build(builder: axum::http::response::Builder, body: Body) -> ApiResult<Response> {
    builder
        .body(body)
        .map_err(|_| ApiError::internal("failed to build response"))
}

pub async fn manifest(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    ctx: RequestContext,
) -> ApiResult<Response> {
    let asset_id = parse_asset(&asset_id, "manifest")?;
    authorize(&state, &ctx, &asset_id, "manifest")?;
    let body = state.server.manifest(&asset_id).await.map_err(|err| {
        warn!(asset_id = %asset_id, reason = %err, "manifest unavailable");
        ApiError::from(err)
    })?;
    build(
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, MANIFEST_CONTENT_TYPE)
            .header(CONTENT_LENGTH, body.len())
            .header(
                CACHE_CONTROL,
                format!("private, max-age={}", state.http.manifest_max_age_seconds),
            ),
        Body::from(body),
    )
}

pub async fn segment(
    State(state): State<AppState>,
    Path((asset_id, stream, filename)): Path<(String, String, String)>,
    headers: HeaderMap,
    ctx: RequestContext,
) -> ApiResult<Response> {
    let asset_id = parse_asset(&asset_id, "segment")?;
    authorize(&state, &ctx, &asset_id, "segment")?;
    let name = SegmentName::from_parts(&stream, &filename).map_err(|err| {
        warn!(asset_id = %asset_id, stream = %stream.escape_debug(), filename = %filename.escape_debug(), reason = %err, "segment name rejected");
        ApiError::from(err)
    })?;
    let range = headers.get(RANGE).and_then(|value| value.to_str().ok());

    let served = match state.server.segment(&asset_id, name, range).await {
        Ok(served) => served,
        Err(DeliveryError::RangeNotSatisfiable { size }) => {
            warn!(asset_id = %asset_id, range = ?range, size, "range not satisfiable");
            let mut response =
                ApiError::from(DeliveryError::RangeNotSatisfiable { size }).into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(CONTENT_RANGE, value);
            }
            return Ok(response);
        }
        Err(err) => {
            warn!(asset_id = %asset_id, reason = %err, "segment unavailable");
            return Err(ApiError::from(err));
        }
    };

    let mut builder = Response::builder()
        .header(CONTENT_TYPE, served.segment.content_type())
        .header(CONTENT_LENGTH, served.content_length())
        .header(ACCEPT_RANGES, "bytes")
        .header(CACHE_CONTROL, SEGMENT_CACHE_CONTROL);
    builder = match served.range {
        Some(range) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(CONTENT_RANGE, range.content_range(served.size)),
        None => builder.status(StatusCode::OK),
    };
    build(builder, Body::from_stream(served.body))
}

pub async fn license(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
    ctx: RequestContext,
) -> ApiResult<Response> {
    let asset_id = parse_asset(&asset_id, "license")?;
    let verified = authorize(&state, &ctx, &asset_id, "license")
        .map_err(|err| ApiError::from(LicenseError::Unauthorized(err)))?;
    let license = state
        .license
        .issue(&asset_id, &verified)
        .await
        .map_err(|err| {
            warn!(asset_id = %asset_id, reason = %err, "license denied");
            ApiError::from(err)
        })?;

    let mut response = Json(license).into_response();
    let headers = response.headers_mut();
    for (name, value) in NO_STORE_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    Ok(response)
}

pub async fn license_preflight() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [
            (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
            (ACCESS_CONTROL_ALLOW_HEADERS, "authorization, content-type"),
            (ACCESS_CONTROL_MAX_AGE, "600"),
        ],
    )
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "queue": state.orchestrator.queue_status(),
    }))
}
