use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use trove_core::models::{ImageStatus, Price, ProductRecord};

use crate::integration::common::{authed, json_body, send, setup_test_app_with_db};

fn product(n: u32, amount: f64) -> ProductRecord {
    ProductRecord {
        fingerprint: format!("{n:064}"),
        title: format!("Gold Ring {n}"),
        price: Price {
            amount,
            currency: "USD".into(),
        },
        source: "mock".into(),
        url: None,
        category: Some("Rings".into()),
        condition: None,
        specifications: BTreeMap::new(),
        images: vec![],
        image_status: ImageStatus::Skipped,
        captured_at: Utc::now(),
    }
}

#[tokio::test]
async fn health_reports_database_ok() {
    let (app, _repo, _container) = setup_test_app_with_db().await;

    let response = send(&app.router, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["database"], "ok");
}

#[tokio::test]
async fn list_products_with_filters() {
    let (app, repo, _container) = setup_test_app_with_db().await;
    repo.upsert(&product(1, 120.0)).await.unwrap();
    repo.upsert(&product(2, 40.0)).await.unwrap();
    repo.upsert(&product(3, 75.0)).await.unwrap();

    let response = send(
        &app.router,
        authed(Request::get("/v1/products?max_price=100&sort=price_asc"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["total"], 2);
    assert_eq!(json["products"][0]["title"], "Gold Ring 2");
    assert_eq!(json["products"][1]["title"], "Gold Ring 3");

    let response = send(
        &app.router,
        authed(Request::get("/v1/products?sort=bogus")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_products_by_fingerprint() {
    let (app, repo, _container) = setup_test_app_with_db().await;
    repo.upsert(&product(1, 120.0)).await.unwrap();
    repo.upsert(&product(2, 40.0)).await.unwrap();

    let response = send(
        &app.router,
        authed(Request::delete("/v1/products"))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "fingerprints": [product(1, 0.0).fingerprint] }).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["deleted"], 1);
    assert!(repo.get(&product(1, 0.0).fingerprint).await.unwrap().is_none());
    assert!(repo.get(&product(2, 0.0).fingerprint).await.unwrap().is_some());

    let response = send(
        &app.router,
        authed(Request::delete("/v1/products"))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"fingerprints": []}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
