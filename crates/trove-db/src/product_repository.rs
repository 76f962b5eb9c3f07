use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Pool, Postgres};
use trove_core::error::AppError;
use trove_core::models::{ImageStatus, Price, ProductRecord};
use trove_core::traits::ProductStore;

const MAX_PAGE_SIZE: u32 = 200;

/// Sort order for product listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductSort {
    #[default]
    Newest,
    PriceAsc,
    PriceDesc,
}

impl ProductSort {
    fn order_by(self) -> &'static str {
        match self {
            Self::Newest => "captured_at DESC, fingerprint",
            Self::PriceAsc => "price_amount ASC, captured_at DESC",
            Self::PriceDesc => "price_amount DESC, captured_at DESC",
        }
    }
}

impl std::str::FromStr for ProductSort {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "newest" => Ok(Self::Newest),
            "price_asc" => Ok(Self::PriceAsc),
            "price_desc" => Ok(Self::PriceDesc),
            other => Err(AppError::ValidationError(format!(
                "Unknown sort '{other}' (expected newest, price_asc or price_desc)"
            ))),
        }
    }
}

/// Filters and pagination for [`ProductRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct ProductQuery {
    pub source: Option<String>,
    pub category: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    /// Case-insensitive substring of the title.
    pub search: Option<String>,
    pub sort: ProductSort,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductPage {
    pub total: i64,
    pub products: Vec<ProductRecord>,
}

/// Product persistence in PostgreSQL, keyed by fingerprint.
#[derive(Clone)]
pub struct ProductRepository {
    pool: Pool<Postgres>,
}

impl ProductRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a record, or refresh price, images and image status of an
    /// existing one with the same fingerprint.
    pub async fn upsert(&self, record: &ProductRecord) -> Result<(), AppError> {
        let specifications = serde_json::to_value(&record.specifications)?;
        let images = serde_json::to_value(&record.images)?;
        let image_status = serde_json::to_value(&record.image_status)?;

        sqlx::query(
            r#"
            INSERT INTO products (fingerprint, title, price_amount, currency, source, url,
                                  category, condition, specifications, images, image_status, captured_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (fingerprint) DO UPDATE SET
                price_amount = EXCLUDED.price_amount,
                currency = EXCLUDED.currency,
                url = COALESCE(EXCLUDED.url, products.url),
                images = EXCLUDED.images,
                image_status = EXCLUDED.image_status,
                updated_at = NOW()
            "#,
        )
        .bind(&record.fingerprint)
        .bind(&record.title)
        .bind(record.price.amount)
        .bind(&record.price.currency)
        .bind(&record.source)
        .bind(&record.url)
        .bind(&record.category)
        .bind(&record.condition)
        .bind(specifications)
        .bind(images)
        .bind(image_status)
        .bind(record.captured_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    pub async fn exists_by_fingerprint(&self, fingerprint: &str) -> Result<bool, AppError> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM products WHERE fingerprint = $1)")
                .bind(fingerprint)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.0)
    }

    /// Delete the given products. Returns how many rows were removed;
    /// unknown fingerprints are ignored.
    pub async fn delete(&self, fingerprints: &[String]) -> Result<u64, AppError> {
        if fingerprints.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM products WHERE fingerprint = ANY($1)")
            .bind(fingerprints)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        tracing::info!(deleted = result.rows_affected(), "Deleted products");
        Ok(result.rows_affected())
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<ProductRecord>, AppError> {
        let row = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT fingerprint, title, price_amount, currency, source, url, category, condition,
                   specifications, images, image_status, captured_at
            FROM products
            WHERE fingerprint = $1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(TryInto::try_into).transpose()
    }

    /// One page of stored products matching `query`, plus the total match count.
    pub async fn list(&self, query: &ProductQuery) -> Result<ProductPage, AppError> {
        if let (Some(min), Some(max)) = (query.min_price, query.max_price)
            && min > max
        {
            return Err(AppError::ValidationError(
                "min_price must not exceed max_price".into(),
            ));
        }

        let limit = query.limit.clamp(1, MAX_PAGE_SIZE) as i64;
        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(s)));

        const WHERE: &str = r#"
            WHERE ($1::text IS NULL OR lower(source) = lower($1))
              AND ($2::text IS NULL OR lower(category) = lower($2))
              AND ($3::float8 IS NULL OR price_amount >= $3)
              AND ($4::float8 IS NULL OR price_amount <= $4)
              AND ($5::text IS NULL OR title ILIKE $5)
        "#;

        let total: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM products {WHERE}"))
            .bind(&query.source)
            .bind(&query.category)
            .bind(query.min_price)
            .bind(query.max_price)
            .bind(&search)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let sql = format!(
            r#"
            SELECT fingerprint, title, price_amount, currency, source, url, category, condition,
                   specifications, images, image_status, captured_at
            FROM products
            {WHERE}
            ORDER BY {}
            LIMIT $6 OFFSET $7
            "#,
            query.sort.order_by()
        );
        let rows = sqlx::query_as::<_, ProductRow>(&sql)
            .bind(&query.source)
            .bind(&query.category)
            .bind(query.min_price)
            .bind(query.max_price)
            .bind(&search)
            .bind(limit)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let products = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProductPage {
            total: total.0,
            products,
        })
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ProductRow {
    fingerprint: String,
    title: String,
    price_amount: f64,
    currency: String,
    source: String,
    url: Option<String>,
    category: Option<String>,
    condition: Option<String>,
    specifications: serde_json::Value,
    images: serde_json::Value,
    image_status: serde_json::Value,
    captured_at: DateTime<Utc>,
}

impl TryFrom<ProductRow> for ProductRecord {
    type Error = AppError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        let specifications: BTreeMap<String, String> = serde_json::from_value(row.specifications)?;
        let images: Vec<String> = serde_json::from_value(row.images)?;
        let image_status: ImageStatus = serde_json::from_value(row.image_status)?;
        Ok(ProductRecord {
            fingerprint: row.fingerprint,
            title: row.title,
            price: Price {
                amount: row.price_amount,
                currency: row.currency,
            },
            source: row.source,
            url: row.url,
            category: row.category,
            condition: row.condition,
            specifications,
            images,
            image_status,
            captured_at: row.captured_at,
        })
    }
}

// -- Trait implementation --

impl ProductStore for ProductRepository {
    async fn upsert(&self, record: &ProductRecord) -> Result<(), AppError> {
        ProductRepository::upsert(self, record).await
    }

    async fn exists_by_fingerprint(&self, fingerprint: &str) -> Result<bool, AppError> {
        ProductRepository::exists_by_fingerprint(self, fingerprint).await
    }
}
