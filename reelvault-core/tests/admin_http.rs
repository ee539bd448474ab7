#![cfg(unix)]

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt;

use reelvault_core::asset::{Asset, AssetState};
use reelvault_core::config::ReelvaultConfig;
use reelvault_core::http::{router, AppState};
use reelvault_core::packager::{EncodeRequest, PackageOrchestrator, PackageOutcome};
use reelvault_core::queue::AdmissionStatus;

use common::{fake_encoder, invocation_count, test_config, write_source, EncoderMode};

const ADMIN_TOKEN: &str = "change-me-admin-token";

struct Fixture {
    base: TempDir,
    config: ReelvaultConfig,
    orchestrator: PackageOrchestrator,
    app: Router,
}

impl Fixture {
    fn new(mode: EncoderMode) -> Self {
        Self::with_config(mode, |_| {})
    }

    fn with_config(mode: EncoderMode, customize: impl FnOnce(&mut ReelvaultConfig)) -> Self {
        let base = TempDir::new().unwrap();
        let program = fake_encoder(base.path(), mode);
        let mut config = test_config(&base, &program);
        config.server.admin_token = Some(ADMIN_TOKEN.to_string());
        config.queue.max_concurrent = 1;
        customize(&mut config);
        let state = AppState::from_config(&config);
        let orchestrator = state.orchestrator.clone();
        Self {
            base,
            config,
            orchestrator,
            app: router(state),
        }
    }

    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn admin(&self, method: Method, uri: &str, body: Option<serde_json::Value>) -> Response<Body> {
        self.call(method, uri, Some(ADMIN_TOKEN), body).await
    }

    async fn ingest(&self, asset: &str) {
        let source = write_source(self.base.path(), &format!("{asset}.mp4"));
        let response = self
            .admin(
                Method::POST,
                &format!("/admin/assets/{asset}/ingest"),
                Some(json!({ "source": source })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    fn package_body(&self) -> serde_json::Value {
        json!({ "request": EncodeRequest::from(&self.config.encoder) })
    }
}

async fn json_body<T: serde::de::DeserializeOwned>(response: Response<Body>) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn admin_routes_require_the_admin_token() {
    let fixture = Fixture::new(EncoderMode::Succeed);

    let missing = fixture.call(Method::GET, "/admin/assets", None, None).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = fixture
        .call(Method::GET, "/admin/assets", Some("not-the-token"), None)
        .await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let ok = fixture.admin(Method::GET, "/admin/assets", None).await;
    assert_eq!(ok.status(), StatusCode::OK);
    let assets: Vec<Asset> = json_body(ok).await;
    assert!(assets.is_empty());
}

#[tokio::test]
async fn admin_routes_are_absent_without_a_configured_token() {
    let fixture = Fixture::with_config(EncoderMode::Succeed, |config| {
        config.server.admin_token = None;
    });
    let response = fixture.admin(Method::GET, "/admin/queue", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ingest_package_and_purge_through_the_server() {
    let fixture = Fixture::new(EncoderMode::Succeed);
    fixture.ingest("film-a").await;

    let pending: Asset = json_body(fixture.admin(Method::GET, "/admin/assets/film-a", None).await).await;
    assert_eq!(pending.state, AssetState::Pending);

    let response = fixture
        .admin(
            Method::POST,
            "/admin/assets/film-a/package",
            Some(fixture.package_body()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    match json_body::<PackageOutcome>(response).await {
        PackageOutcome::Ready(asset) => assert_eq!(asset.state, AssetState::Ready),
        other => panic!("expected a fresh package, got {other:?}"),
    }

    let purged = fixture.admin(Method::DELETE, "/admin/assets/film-a", None).await;
    assert_eq!(purged.status(), StatusCode::NO_CONTENT);

    let gone = fixture.admin(Method::GET, "/admin/assets/film-a", None).await;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);

    let invalid = fixture.admin(Method::GET, "/admin/assets/..%2Fetc", None).await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn concurrent_package_requests_share_one_admission_queue() {
    let fixture = Fixture::new(EncoderMode::Slow);
    fixture.ingest("film-a").await;
    fixture.ingest("film-b").await;

    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let orchestrator = fixture.orchestrator.clone();
        let peak = Arc::clone(&peak);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                peak.fetch_max(orchestrator.arena().live_processes(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let (first, second) = tokio::join!(
        fixture.admin(
            Method::POST,
            "/admin/assets/film-a/package",
            Some(fixture.package_body()),
        ),
        fixture.admin(
            Method::POST,
            "/admin/assets/film-b/package",
            Some(fixture.package_body()),
        ),
    );
    done.store(true, Ordering::SeqCst);
    sampler.await.unwrap();

    for response in [first, second] {
        assert_eq!(response.status(), StatusCode::OK);
        let outcome: PackageOutcome = json_body(response).await;
        assert!(matches!(outcome, PackageOutcome::Ready(_)));
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(invocation_count(fixture.base.path()), 2);

    let queue: AdmissionStatus = json_body(fixture.admin(Method::GET, "/admin/queue", None).await).await;
    assert_eq!(queue.running, 0);
    assert_eq!(queue.waiting, 0);
}

#[tokio::test]
async fn health_reports_the_queue_packaging_runs_on() {
    let fixture = Fixture::new(EncoderMode::Slow);
    fixture.ingest("film-a").await;

    let package = {
        let app = fixture.app.clone();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/admin/assets/film-a/package")
            .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(fixture.package_body().to_string()))
            .unwrap();
        tokio::spawn(async move { app.oneshot(request).await.unwrap() })
    };

    let mut saw_running = false;
    for _ in 0..100 {
        let health: serde_json::Value = json_body(fixture.call(Method::GET, "/health", None, None).await).await;
        if health["queue"]["running"] == 1 {
            saw_running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(saw_running, "health never reported the running job");

    let response = package.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health: serde_json::Value = json_body(fixture.call(Method::GET, "/health", None, None).await).await;
    assert_eq!(health["queue"]["running"], 0);
}
