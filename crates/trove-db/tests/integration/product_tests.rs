use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use trove_core::models::{ImageStatus, Price, ProductRecord};
use trove_core::traits::ProductStore;
use trove_db::{ProductQuery, ProductRepository, ProductSort};

use crate::integration::common::setup_test_db;

fn record(fingerprint: &str, title: &str, amount: f64, source: &str, age_minutes: i64) -> ProductRecord {
    ProductRecord {
        fingerprint: fingerprint.repeat(64 / fingerprint.len()),
        title: title.into(),
        price: Price {
            amount,
            currency: "USD".into(),
        },
        source: source.into(),
        url: Some(format!("https://{source}.test/{fingerprint}")),
        category: Some("Rings".into()),
        condition: Some("New".into()),
        specifications: BTreeMap::from([("metal".to_string(), "gold".to_string())]),
        images: vec![format!("https://img.test/{fingerprint}.jpg")],
        image_status: ImageStatus::Pending,
        captured_at: Utc::now() - Duration::minutes(age_minutes),
    }
}

#[tokio::test]
async fn upsert_and_get_round_trip() {
    let (pool, _container) = setup_test_db().await;
    let repo = ProductRepository::new(pool);

    let product = record("a", "14k Gold Ring", 199.99, "shop", 0);
    repo.upsert(&product).await.unwrap();

    let stored = repo
        .get(&product.fingerprint)
        .await
        .unwrap()
        .expect("Should find the product");
    assert_eq!(stored.title, "14k Gold Ring");
    assert_eq!(stored.price, product.price);
    assert_eq!(stored.specifications, product.specifications);
    assert_eq!(stored.image_status, ImageStatus::Pending);
}

#[tokio::test]
async fn upsert_refreshes_images_of_existing_fingerprint() {
    let (pool, _container) = setup_test_db().await;
    let repo = ProductRepository::new(pool);

    let mut product = record("b", "Silver Chain", 45.0, "shop", 0);
    repo.upsert(&product).await.unwrap();

    product.images = vec!["data/images/ab/abcd.jpg".into()];
    product.image_status = ImageStatus::Hydrated { stored: 1, failed: 0 };
    repo.upsert(&product).await.unwrap();

    let stored = repo.get(&product.fingerprint).await.unwrap().unwrap();
    assert_eq!(stored.images, vec!["data/images/ab/abcd.jpg"]);
    assert_eq!(stored.image_status, ImageStatus::Hydrated { stored: 1, failed: 0 });

    let page = repo.list(&ProductQuery { limit: 10, ..Default::default() }).await.unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn exists_by_fingerprint_via_trait() {
    let (pool, _container) = setup_test_db().await;
    let repo = ProductRepository::new(pool);
    let product = record("c", "Pearl Earrings", 80.0, "shop", 0);

    assert!(!ProductStore::exists_by_fingerprint(&repo, &product.fingerprint).await.unwrap());
    ProductStore::upsert(&repo, &product).await.unwrap();
    assert!(ProductStore::exists_by_fingerprint(&repo, &product.fingerprint).await.unwrap());
}

#[tokio::test]
async fn list_filters_sorts_and_paginates() {
    let (pool, _container) = setup_test_db().await;
    let repo = ProductRepository::new(pool);

    repo.upsert(&record("d", "Gold Ring", 300.0, "alpha", 3)).await.unwrap();
    repo.upsert(&record("e", "Gold Necklace", 150.0, "alpha", 2)).await.unwrap();
    repo.upsert(&record("f", "Silver Ring", 50.0, "beta", 1)).await.unwrap();

    let newest = repo.list(&ProductQuery { limit: 10, ..Default::default() }).await.unwrap();
    let titles: Vec<_> = newest.products.iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["Silver Ring", "Gold Necklace", "Gold Ring"]);

    let alpha = repo
        .list(&ProductQuery {
            source: Some("ALPHA".into()),
            sort: ProductSort::PriceAsc,
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(alpha.total, 2);
    assert_eq!(alpha.products[0].title, "Gold Necklace");

    let rings = repo
        .list(&ProductQuery {
            search: Some("ring".into()),
            max_price: Some(100.0),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rings.total, 1);
    assert_eq!(rings.products[0].title, "Silver Ring");

    let second_page = repo
        .list(&ProductQuery {
            sort: ProductSort::PriceDesc,
            limit: 1,
            offset: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(second_page.total, 3);
    assert_eq!(second_page.products.len(), 1);
    assert_eq!(second_page.products[0].title, "Gold Necklace");
}

#[tokio::test]
async fn list_rejects_inverted_price_bounds() {
    let (pool, _container) = setup_test_db().await;
    let repo = ProductRepository::new(pool);

    let err = repo
        .list(&ProductQuery {
            min_price: Some(10.0),
            max_price: Some(5.0),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("min_price"));
}

#[tokio::test]
async fn health_check_succeeds() {
    let (pool, _container) = setup_test_db().await;
    ProductRepository::new(pool).health_check().await.unwrap();
}

#[tokio::test]
async fn delete_removes_only_listed_products() {
    let (pool, _container) = setup_test_db().await;
    let repo = ProductRepository::new(pool);

    let keep = record("k", "Gold Ring", 120.0, "shop", 0);
    let drop_a = record("d", "Silver Ring", 80.0, "shop", 0);
    let drop_b = record("e", "Opal Ring", 60.0, "shop", 0);
    for product in [&keep, &drop_a, &drop_b] {
        repo.upsert(product).await.unwrap();
    }

    let deleted = repo
        .delete(&[
            drop_a.fingerprint.clone(),
            drop_b.fingerprint.clone(),
            "f".repeat(64),
        ])
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    assert!(repo.get(&drop_a.fingerprint).await.unwrap().is_none());
    assert!(repo.exists_by_fingerprint(&keep.fingerprint).await.unwrap());

    assert_eq!(repo.delete(&[]).await.unwrap(), 0);
}
