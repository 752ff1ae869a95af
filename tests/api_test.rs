//! HTTP surface tests against the router with in-memory backends.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use predict_jobs::app_state::AppState;
use predict_jobs::models::prediction::{ErrorResponse, Features, SubmitResponse};
use predict_jobs::routes;
use predict_jobs::services::{
    predictor::{LinearPriceModel, PredictionError, Predictor},
    queue::{InMemoryWorkQueue, WorkQueue},
    store::{InMemoryJobStore, JobStore},
    worker::{BatchWorker, WorkerConfig},
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    store: Arc<InMemoryJobStore>,
    queue: Arc<InMemoryWorkQueue>,
    router: Router,
}

fn app() -> TestApp {
    let store = Arc::new(InMemoryJobStore::default());
    let queue = Arc::new(InMemoryWorkQueue::default());
    let store_dyn: Arc<dyn JobStore> = store.clone();
    let queue_dyn: Arc<dyn WorkQueue> = queue.clone();
    TestApp {
        router: routes::router(AppState::new(store_dyn, queue_dyn)),
        store,
        queue,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(body: &str) -> Request<Body> {
    Request::post("/api/v1/predictions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_submit_then_poll_until_done() {
    let app = app();

    let (status, body) = send(&app.router, post_json(r#"{"rooms": 3, "area": 80, "floor": 5}"#)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let submitted: SubmitResponse = serde_json::from_value(body).unwrap();
    assert_eq!(submitted.status, "Pending");

    let uri = format!("/api/v1/predictions/{}", submitted.job_id);
    let (status, body) = send(&app.router, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"job_id": submitted.job_id.to_string(), "status": "Pending"}));

    let worker = BatchWorker::new(
        app.store.clone(),
        app.queue.clone(),
        Arc::new(LinearPriceModel::default()),
        WorkerConfig {
            batch_window: Duration::ZERO,
            ..WorkerConfig::default()
        },
    );
    worker.run_once().await.unwrap();

    let (status, body) = send(&app.router, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Done");
    assert_eq!(body["result"], json!(440_000.0));
    assert!(body.get("error").is_none());
}

/// A model that has diverged.
struct DivergedModel;

impl Predictor for DivergedModel {
    fn predict(&self, _features: &Features) -> Result<f64, PredictionError> {
        Ok(f64::NAN)
    }
}

#[tokio::test]
async fn test_non_finite_prediction_polls_as_failed() {
    let app = app();

    let (_, body) = send(&app.router, post_json(r#"{"rooms": 3, "area": 80, "floor": 5}"#)).await;
    let submitted: SubmitResponse = serde_json::from_value(body).unwrap();

    let worker = BatchWorker::new(
        app.store.clone(),
        app.queue.clone(),
        Arc::new(DivergedModel),
        WorkerConfig {
            batch_window: Duration::ZERO,
            ..WorkerConfig::default()
        },
    );
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.completed, 0);
    assert_eq!(report.failed, 1);

    let uri = format!("/api/v1/predictions/{}", submitted.job_id);
    let (status, body) = send(&app.router, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Failed");
    assert!(body.get("result").is_none());
    assert!(body["error"].as_str().unwrap().contains("non-finite"));
}

#[tokio::test]
async fn test_submit_rejects_schema_violations() {
    let app = app();

    let (status, body) = send(&app.router, post_json(r#"{"rooms": 3, "area": 80}"#)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let error: ErrorResponse = serde_json::from_value(body).unwrap();
    assert!(error.error.contains("floor"));

    let (status, _) = send(
        &app.router,
        post_json(r#"{"rooms": 3, "area": 80, "floor": 5, "view": "sea"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(&app.router, post_json("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(app.store.is_empty().await);
}

#[tokio::test]
async fn test_submit_reports_storage_outage() {
    let app = app();
    app.store.set_unavailable(true).await;

    let (status, body) = send(&app.router, post_json(r#"{"rooms": 1, "area": 30, "floor": 1}"#)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].is_string());
    assert_eq!(app.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_submit_reports_enqueue_failure_with_job_id() {
    let app = app();
    app.queue.fail_enqueues(1).await;

    let (status, body) = send(&app.router, post_json(r#"{"rooms": 1, "area": 30, "floor": 1}"#)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let error: ErrorResponse = serde_json::from_value(body).unwrap();
    let job_id = error.job_id.expect("job id in body");
    assert!(app.store.get(job_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_poll_unknown_and_malformed_ids() {
    let app = app();

    let (status, _) = send(&app.router, get(&format!("/api/v1/predictions/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app.router, get("/api/v1/predictions/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_reflects_store_state() {
    let app = app();

    let (status, body) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    app.store.set_unavailable(true).await;
    let (status, body) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"]["store"]["status"], "error");
}
