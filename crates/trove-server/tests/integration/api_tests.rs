use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use trove_core::error::AppError;
use trove_core::testutil::{MockAdapter, candidates};
use uuid::Uuid;

use crate::integration::common::{
    authed, json_body, send, setup_test_app, setup_test_app_with,
};

fn create_request(body: serde_json::Value) -> Request<Body> {
    authed(Request::post("/v1/jobs"))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn health_returns_200_without_database() {
    let app = setup_test_app();

    let response = send(&app.router, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["database"], "disabled");
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app();

    let response = send(&app.router, Request::get("/v1/jobs").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::get("/v1/jobs")
        .header("authorization", "Bearer wrong-key")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app.router, wrong).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_poll_and_complete_job() {
    let app = setup_test_app();

    let response = send(
        &app.router,
        create_request(serde_json::json!({
            "query": "gold ring",
            "source": "mock",
            "max_items": 30
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    assert_eq!(json["state"], "running");
    let job_id: Uuid = json["job_id"].as_str().unwrap().parse().unwrap();

    app.manager
        .wait_for(job_id, Duration::from_millis(10))
        .await
        .unwrap();

    let response = send(
        &app.router,
        authed(Request::get(format!("/v1/jobs/{job_id}")))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["state"], "completed");
    assert_eq!(json["progress"], 1.0);
    assert_eq!(json["items_found"], 30);
    assert_eq!(json["results"].as_array().unwrap().len(), 30);
    assert_eq!(json["results"][0]["title"], "Gold Ring 0");
    assert_eq!(json["results"][0]["image_status"], "skipped");
}

#[tokio::test]
async fn invalid_requests_return_400() {
    let app = setup_test_app();

    for body in [
        serde_json::json!({"query": "ring", "source": "mock", "max_items": 0}),
        serde_json::json!({"query": "  ", "source": "mock", "max_items": 5}),
        serde_json::json!({"query": "ring", "source": "nowhere", "max_items": 5}),
        serde_json::json!({"query": "ring", "source": "mock", "max_items": 5,
                           "filters": {"min_price": 50.0, "max_price": 10.0}}),
        serde_json::json!({"query": "ring", "source": "mock", "max_items": 5,
                           "filters": {"sort": "cheapest"}}),
    ] {
        let response = send(&app.router, create_request(body.clone())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        let json = json_body(response).await;
        assert_eq!(json["error"], "validation_error");
    }

    assert!(app.manager.list(None, 10).is_empty());
}

#[tokio::test]
async fn unknown_job_returns_404() {
    let app = setup_test_app();
    let id = Uuid::new_v4();

    let response = send(
        &app.router,
        authed(Request::get(format!("/v1/jobs/{id}"))).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "not_found");

    let response = send(
        &app.router,
        authed(Request::delete(format!("/v1/jobs/{id}"))).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_running_job() {
    let adapter = MockAdapter::with_candidates(candidates(200)).with_latency(Duration::from_millis(200));
    let app = setup_test_app_with(adapter);

    let json = json_body(
        send(
            &app.router,
            create_request(serde_json::json!({"query": "ring", "source": "mock", "max_items": 200})),
        )
        .await,
    )
    .await;
    let job_id: Uuid = json["job_id"].as_str().unwrap().parse().unwrap();

    let response = send(
        &app.router,
        authed(Request::delete(format!("/v1/jobs/{job_id}"))).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["state"], "cancelling");

    let snapshot = app
        .manager
        .wait_for(job_id, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(snapshot.summary.state.to_string(), "cancelled");
    assert!(snapshot.summary.items_completed < 200);

    // Cancelling a finished job is a no-op that reports the final state.
    let response = send(
        &app.router,
        authed(Request::delete(format!("/v1/jobs/{job_id}"))).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["state"], "cancelled");
}

#[tokio::test]
async fn failed_job_reports_error() {
    let adapter = MockAdapter::always_failing(|| AppError::Blocked {
        status_code: Some(403),
        reason: "HTTP 403".into(),
    });
    let app = setup_test_app_with(adapter);

    let id = app
        .manager
        .start(trove_core::request::ScrapeRequest::new("ring", "mock", 10))
        .unwrap();
    app.manager.wait_for(id, Duration::from_millis(10)).await.unwrap();

    let json = json_body(
        send(
            &app.router,
            authed(Request::get(format!("/v1/jobs/{id}"))).body(Body::empty()).unwrap(),
        )
        .await,
    )
    .await;
    assert_eq!(json["state"], "failed");
    assert_eq!(json["items_found"], 0);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn list_jobs_filters_by_state() {
    let app = setup_test_app();
    let id = app
        .manager
        .start(trove_core::request::ScrapeRequest::new("ring", "mock", 5))
        .unwrap();
    app.manager.wait_for(id, Duration::from_millis(10)).await.unwrap();

    let json = json_body(
        send(
            &app.router,
            authed(Request::get("/v1/jobs?state=completed")).body(Body::empty()).unwrap(),
        )
        .await,
    )
    .await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["jobs"][0]["id"], id.to_string());

    let json = json_body(
        send(
            &app.router,
            authed(Request::get("/v1/jobs?state=running")).body(Body::empty()).unwrap(),
        )
        .await,
    )
    .await;
    assert_eq!(json["total"], 0);

    let response = send(
        &app.router,
        authed(Request::get("/v1/jobs?state=bogus")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn system_status_reports_engine_state() {
    let app = setup_test_app();
    let id = app
        .manager
        .start(trove_core::request::ScrapeRequest::new("ring", "mock", 5))
        .unwrap();
    app.manager.wait_for(id, Duration::from_millis(10)).await.unwrap();

    let json = json_body(
        send(
            &app.router,
            authed(Request::get("/v1/system/status")).body(Body::empty()).unwrap(),
        )
        .await,
    )
    .await;
    assert_eq!(json["sources"], serde_json::json!(["mock"]));
    assert_eq!(json["jobs"]["completed"], 1);
    assert_eq!(json["jobs"]["active"], 0);
    assert_eq!(json["usable_identities"], 3);
    assert_eq!(json["pending_images"], 0);
    assert_eq!(json["identities"].as_array().unwrap().len(), 3);
    assert_eq!(json["rates"][0]["source"], "mock");
}

#[tokio::test]
async fn products_without_database_returns_503() {
    let app = setup_test_app();
    let response = send(
        &app.router,
        authed(Request::get("/v1/products")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn delete_products_without_database_returns_503() {
    let app = setup_test_app();
    let response = send(
        &app.router,
        authed(Request::delete("/v1/products"))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"fingerprints": ["abc"]}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = setup_test_app();
    let response = send(
        &app.router,
        Request::get("/api-docs/openapi.json").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert!(json["paths"]["/v1/jobs/{id}"].is_object());
    assert!(json["paths"]["/v1/products"]["delete"].is_object());
}
