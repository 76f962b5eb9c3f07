//! Product extraction from schema.org JSON-LD embedded in result pages.
//!
//! Handles `Product` objects at the top level, inside `@graph`, and inside
//! `ItemList.itemListElement` (optionally wrapped in `ListItem.item`).

use scraper::{Html, Selector};
use serde_json::{Map, Value};
use trove_core::error::AppError;
use trove_core::models::RawCandidate;
use url::Url;

const JSON_LD_SELECTOR: &str = r#"script[type="application/ld+json"]"#;

/// Extract every product candidate from an HTML page.
pub fn parse_products(html: &str, page_url: &str) -> Result<Vec<RawCandidate>, AppError> {
    let selector = Selector::parse(JSON_LD_SELECTOR)
        .map_err(|e| AppError::ParseError(format!("Invalid selector: {e}")))?;
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);

    let mut candidates = Vec::new();
    for script in document.select(&selector) {
        let raw: String = script.text().collect();
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => collect(&value, base.as_ref(), &mut candidates),
            Err(e) => tracing::debug!(error = %e, "Skipping malformed JSON-LD block"),
        }
    }
    Ok(candidates)
}

/// Page text a visitor would see, without scripts and styles.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut text = String::new();
    for node in document.tree.root().descendants() {
        let Some(fragment) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript" | "template"));
        if !hidden {
            text.push_str(fragment);
            text.push(' ');
        }
    }
    text
}

fn collect(value: &Value, base: Option<&Url>, out: &mut Vec<RawCandidate>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect(item, base, out);
            }
        }
        Value::Object(obj) => {
            if let Some(graph) = obj.get("@graph") {
                collect(graph, base, out);
            }
            if has_type(obj, "ItemList")
                && let Some(elements) = obj.get("itemListElement")
            {
                for element in elements.as_array().into_iter().flatten() {
                    match element.get("item") {
                        Some(item) => collect(item, base, out),
                        None => collect(element, base, out),
                    }
                }
            }
            if has_type(obj, "Product") {
                out.push(to_candidate(obj, base));
            }
        }
        _ => {}
    }
}

fn has_type(obj: &Map<String, Value>, wanted: &str) -> bool {
    match obj.get("@type") {
        Some(Value::String(t)) => t == wanted,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(wanted)),
        _ => false,
    }
}

fn to_candidate(obj: &Map<String, Value>, base: Option<&Url>) -> RawCandidate {
    let offer = match obj.get("offers") {
        Some(Value::Array(offers)) => offers.first().and_then(Value::as_object),
        Some(Value::Object(offer)) => Some(offer),
        _ => None,
    };
    let price = offer.and_then(|o| {
        o.get("price")
            .or_else(|| o.get("lowPrice"))
            .and_then(scalar_text)
    });
    let currency = offer.and_then(|o| o.get("priceCurrency")).and_then(scalar_text);
    let condition = offer
        .and_then(|o| o.get("itemCondition"))
        .or_else(|| obj.get("itemCondition"))
        .and_then(scalar_text)
        .map(|c| condition_label(&c));

    let mut specifications = Vec::new();
    if let Some(brand) = obj.get("brand").and_then(name_of) {
        specifications.push(("brand".to_string(), brand));
    }
    for prop in obj
        .get("additionalProperty")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let (Some(name), Some(value)) = (
            prop.get("name").and_then(scalar_text),
            prop.get("value").and_then(scalar_text),
        ) {
            specifications.push((name, value));
        }
    }

    RawCandidate {
        title: obj.get("name").and_then(scalar_text),
        price,
        currency,
        url: obj
            .get("url")
            .or_else(|| offer.and_then(|o| o.get("url")))
            .and_then(Value::as_str)
            .map(|u| resolve(u, base)),
        category: obj.get("category").and_then(name_of),
        condition,
        specifications,
        images: images_of(obj.get("image"), base),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A plain string, or an object's `name`.
fn name_of(value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => obj.get("name").and_then(scalar_text),
        other => scalar_text(other),
    }
}

/// `https://schema.org/NewCondition` -> `New`.
fn condition_label(raw: &str) -> String {
    let tail = raw.rsplit('/').next().unwrap_or(raw);
    tail.strip_suffix("Condition").unwrap_or(tail).to_string()
}

fn images_of(value: Option<&Value>, base: Option<&Url>) -> Vec<String> {
    let mut urls = Vec::new();
    let mut push = |v: &Value| {
        let url = match v {
            Value::String(s) => Some(s.as_str()),
            Value::Object(obj) => obj
                .get("url")
                .or_else(|| obj.get("contentUrl"))
                .and_then(Value::as_str),
            _ => None,
        };
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            urls.push(resolve(url.trim(), base));
        }
    };
    match value {
        Some(Value::Array(items)) => items.iter().for_each(&mut push),
        Some(other) => push(other),
        None => {}
    }
    urls
}

fn resolve(url: &str, base: Option<&Url>) -> String {
    match base.and_then(|b| b.join(url).ok()) {
        Some(joined) => joined.to_string(),
        None => url.to_string(),
    }
}
