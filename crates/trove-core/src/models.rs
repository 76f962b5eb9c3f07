use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::request::ScrapeRequest;

/// A monetary amount with its ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    pub currency: String,
}

/// Unparsed listing as produced by a source adapter's `parse` step.
///
/// Every field is optional; the record pipeline decides what is acceptable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub title: Option<String>,
    /// Price text as shown on the page, e.g. `"$1,299.99"`.
    pub price: Option<String>,
    /// Explicit currency when the page gives one separately from the price.
    pub currency: Option<String>,
    pub url: Option<String>,
    pub category: Option<String>,
    pub condition: Option<String>,
    pub specifications: Vec<(String, String)>,
    pub images: Vec<String>,
}

/// Raw page data returned by a source adapter's `fetch` step.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Progress of media hydration for an accepted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ImageStatus {
    /// Waiting for (or undergoing) hydration.
    Pending,
    /// Hydration finished; `images` now holds stored locations where it could.
    Hydrated { stored: usize, failed: usize },
    /// Image hydration is disabled.
    Skipped,
}

/// The unit of output: one validated, deduplicated product listing.
///
/// Immutable once accepted into a job, except that the image pipeline
/// reassigns `images` (and `image_status`) exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub fingerprint: String,
    pub title: String,
    pub price: Price,
    pub source: String,
    pub url: Option<String>,
    pub category: Option<String>,
    pub condition: Option<String>,
    pub specifications: BTreeMap<String, String>,
    pub images: Vec<String>,
    pub image_status: ImageStatus,
    pub captured_at: DateTime<Utc>,
}

/// One page of a job's search space, assigned to a fetch worker.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub job_id: Uuid,
    /// Dispatch order within the job (0-based).
    pub sequence: usize,
    /// 1-based result page requested from the source.
    pub page: u32,
    /// Number of candidates wanted from this page.
    pub limit: u32,
    pub request: Arc<ScrapeRequest>,
    pub block_retries: u32,
    pub transient_retries: u32,
}

impl UnitOfWork {
    pub fn source(&self) -> &str {
        &self.request.source
    }

    pub fn attempts(&self) -> u32 {
        1 + self.block_retries + self.transient_retries
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable content fingerprint over normalised title, price and source.
pub fn compute_fingerprint(title: &str, amount: f64, source: &str) -> String {
    let key = format!(
        "{}|{:.2}|{}",
        normalize_text(title).to_lowercase(),
        amount,
        source.trim().to_lowercase()
    );
    compute_hash(&key)
}

/// Collapse runs of whitespace and trim.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

const CURRENCY_SYMBOLS: &[(char, &str)] = &[
    ('$', "USD"),
    ('€', "EUR"),
    ('£', "GBP"),
    ('¥', "JPY"),
    ('₹', "INR"),
];

/// ISO 4217 codes recognised when written out in price text.
const CURRENCY_CODES: &[&str] = &[
    "AED", "ARS", "AUD", "BGN", "BRL", "CAD", "CHF", "CLP", "CNY", "COP", "CZK", "DKK", "EGP",
    "EUR", "GBP", "HKD", "HUF", "IDR", "ILS", "INR", "ISK", "JPY", "KRW", "MXN", "MYR", "NGN",
    "NOK", "NZD", "PEN", "PHP", "PKR", "PLN", "RON", "RUB", "SAR", "SEK", "SGD", "THB", "TRY",
    "TWD", "UAH", "USD", "VND", "ZAR",
];

/// Parse a price as displayed on a listing page.
///
/// Accepts currency symbols or 3-letter codes anywhere in the text, and both
/// `1,299.99` and `1.299,99` digit grouping. Only the first number is used,
/// so ranges such as `"$10 - $20"` yield the lower bound. The amount may be
/// negative; callers decide whether that is acceptable.
pub fn parse_price(raw: &str, fallback_currency: Option<&str>) -> Option<Price> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let amount = parse_amount(raw)?;
    let currency = detect_currency(raw)
        .or_else(|| fallback_currency.and_then(currency_code))
        .unwrap_or_else(|| "USD".to_string());

    Some(Price {
        amount: (amount * 100.0).round() / 100.0,
        currency,
    })
}

fn detect_currency(raw: &str) -> Option<String> {
    if let Some((_, code)) = CURRENCY_SYMBOLS.iter().find(|(sym, _)| raw.contains(*sym)) {
        return Some((*code).to_string());
    }
    raw.split(|c: char| !c.is_ascii_alphabetic())
        .find(|token| CURRENCY_CODES.contains(token))
        .map(str::to_string)
}

/// A declared currency such as JSON-LD `priceCurrency`: three ASCII letters.
fn currency_code(declared: &str) -> Option<String> {
    let code = declared.trim();
    (code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()))
        .then(|| code.to_ascii_uppercase())
}

fn parse_amount(raw: &str) -> Option<f64> {
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let negative = raw[..start].trim_end().ends_with('-')
        || raw[..start].trim_start().starts_with('-');

    let number: String = raw[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    let number = number.trim_end_matches([',', '.']);

    let last_comma = number.rfind(',');
    let last_dot = number.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => number.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => number.replace(',', ""),
        (Some(c), None) => {
            let decimals = number.len() - c - 1;
            if number.matches(',').count() == 1 && (1..=2).contains(&decimals) {
                number.replace(',', ".")
            } else {
                number.replace(',', "")
            }
        }
        (None, Some(_)) if number.matches('.').count() > 1 => number.replace('.', ""),
        _ => number.to_string(),
    };

    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}
