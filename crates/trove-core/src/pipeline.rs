//! Record pipeline: validate, normalise and deduplicate raw candidates.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use thiserror::Error;

use crate::models::{
    ImageStatus, ProductRecord, RawCandidate, compute_fingerprint, normalize_text, parse_price,
};
use crate::request::{ScrapeRequest, SearchFilters};

const MIN_TITLE_CHARS: usize = 3;

/// Why a candidate was dropped. Counted on the job, never surfaced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("missing or too short title")]
    MissingTitle,

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("no image references")]
    NoImages,

    #[error("filtered out: {0}")]
    FilteredOut(String),

    #[error("duplicate of a record already in this job")]
    Duplicate,

    #[error("already present in the product store")]
    KnownInStore,
}

impl Rejection {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Rejection::Duplicate | Rejection::KnownInStore)
    }
}

/// Turns raw candidates from one job into accepted records.
#[derive(Debug, Clone)]
pub struct RecordPipeline {
    source: String,
    filters: SearchFilters,
    hydrate_images: bool,
}

impl RecordPipeline {
    pub fn new(request: &ScrapeRequest, hydrate_images: bool) -> Self {
        Self {
            source: request.source.trim().to_lowercase(),
            filters: request.filters.clone(),
            hydrate_images,
        }
    }

    /// Validate and normalise one candidate.
    ///
    /// `seen` holds the fingerprints accepted so far in the owning job; an
    /// accepted record's fingerprint is added to it.
    pub fn process(
        &self,
        raw: RawCandidate,
        seen: &mut HashSet<String>,
    ) -> Result<ProductRecord, Rejection> {
        let title = raw
            .title
            .as_deref()
            .map(normalize_text)
            .filter(|t| t.chars().count() >= MIN_TITLE_CHARS)
            .ok_or(Rejection::MissingTitle)?;

        let price_text = raw
            .price
            .as_deref()
            .ok_or_else(|| Rejection::InvalidPrice("missing".into()))?;
        let price = parse_price(price_text, raw.currency.as_deref())
            .ok_or_else(|| Rejection::InvalidPrice(price_text.to_string()))?;
        if price.amount < 0.0 || !price.amount.is_finite() {
            return Err(Rejection::InvalidPrice(price_text.to_string()));
        }

        let images = dedup_nonempty(raw.images);
        if images.is_empty() {
            return Err(Rejection::NoImages);
        }

        let category = clean_optional(raw.category);
        let condition = clean_optional(raw.condition);
        self.apply_filters(&title, price.amount, category.as_deref(), condition.as_deref())?;

        let fingerprint = compute_fingerprint(&title, price.amount, &self.source);
        if !seen.insert(fingerprint.clone()) {
            return Err(Rejection::Duplicate);
        }

        Ok(ProductRecord {
            fingerprint,
            title,
            price,
            source: self.source.clone(),
            url: clean_optional(raw.url),
            category,
            condition,
            specifications: normalize_specifications(raw.specifications),
            images,
            image_status: if self.hydrate_images {
                ImageStatus::Pending
            } else {
                ImageStatus::Skipped
            },
            captured_at: Utc::now(),
        })
    }

    fn apply_filters(
        &self,
        title: &str,
        amount: f64,
        category: Option<&str>,
        condition: Option<&str>,
    ) -> Result<(), Rejection> {
        let f = &self.filters;
        if !f.price_in_bounds(amount) {
            return Err(Rejection::FilteredOut(format!("price {amount} out of bounds")));
        }
        if let Some(term) = f.excluded_term(title) {
            return Err(Rejection::FilteredOut(format!("excluded term '{term}'")));
        }
        if let (Some(wanted), Some(actual)) = (f.category.as_deref(), category)
            && !actual.to_lowercase().contains(&wanted.trim().to_lowercase())
        {
            return Err(Rejection::FilteredOut(format!("category '{actual}'")));
        }
        if let (Some(wanted), Some(actual)) = (f.condition.as_deref(), condition)
            && !actual.eq_ignore_ascii_case(wanted.trim())
        {
            return Err(Rejection::FilteredOut(format!("condition '{actual}'")));
        }
        Ok(())
    }
}

fn clean_optional(value: Option<String>) -> Option<String> {
    value.map(|v| normalize_text(&v)).filter(|v| !v.is_empty())
}

fn dedup_nonempty(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty() && seen.insert(u.clone()))
        .collect()
}

/// Trim and lowercase keys; the first value for a key wins.
fn normalize_specifications(pairs: Vec<(String, String)>) -> BTreeMap<String, String> {
    let mut specs = BTreeMap::new();
    for (key, value) in pairs {
        let key = normalize_text(&key).to_lowercase();
        let value = normalize_text(&value);
        if key.is_empty() || value.is_empty() {
            continue;
        }
        specs.entry(key).or_insert(value);
    }
    specs
}
