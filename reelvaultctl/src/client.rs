//! HTTP client for the `/admin` routes of a running `reelvaultctl serve`.

use std::path::Path;

use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use reelvault_core::http::ErrorBody;
use reelvault_core::{AdmissionStatus, Asset, AssetId, EncodeRequest, PackageOutcome};

use crate::{AppError, Result};

#[derive(Debug, Clone)]
pub struct ControlClient {
    http: Client,
    base: String,
    token: Option<String>,
}

impl ControlClient {
    pub fn new(base: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.token.as_deref().ok_or(AppError::AdminTokenMissing)?;
        Ok(self
            .http
            .request(method, format!("{}/admin{}", self.base, path))
            .bearer_auth(token))
    }

    async fn send(builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
        };
        Err(AppError::Server {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T> {
        Ok(Self::send(builder).await?.json().await?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        Self::fetch(self.request(Method::POST, path)?.json(body)).await
    }

    pub async fn queue(&self) -> Result<AdmissionStatus> {
        Self::fetch(self.request(Method::GET, "/queue")?).await
    }

    pub async fn assets(&self) -> Result<Vec<Asset>> {
        Self::fetch(self.request(Method::GET, "/assets")?).await
    }

    pub async fn asset(&self, asset_id: &AssetId) -> Result<Asset> {
        Self::fetch(self.request(Method::GET, &format!("/assets/{asset_id}"))?).await
    }

    /// `source` must be readable by the server process.
    pub async fn ingest(&self, asset_id: &AssetId, source: &Path) -> Result<Asset> {
        self.post(
            &format!("/assets/{asset_id}/ingest"),
            &json!({ "source": source }),
        )
        .await
    }

    pub async fn package(
        &self,
        asset_id: &AssetId,
        request: &EncodeRequest,
        force: bool,
    ) -> Result<PackageOutcome> {
        self.post(
            &format!("/assets/{asset_id}/package"),
            &json!({ "request": request, "force": force }),
        )
        .await
    }

    pub async fn purge(&self, asset_id: &AssetId) -> Result<()> {
        Self::send(self.request(Method::DELETE, &format!("/assets/{asset_id}"))?).await?;
        Ok(())
    }
}
