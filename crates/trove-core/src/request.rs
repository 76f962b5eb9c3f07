use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Sort order requested from the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Relevance,
    PriceAsc,
    PriceDesc,
    Newest,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Relevance => "relevance",
            SortOrder::PriceAsc => "price_asc",
            SortOrder::PriceDesc => "price_desc",
            SortOrder::Newest => "newest",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relevance" => Ok(SortOrder::Relevance),
            "price_asc" => Ok(SortOrder::PriceAsc),
            "price_desc" => Ok(SortOrder::PriceDesc),
            "newest" => Ok(SortOrder::Newest),
            _ => Err(format!("Unknown sort order: {}", s)),
        }
    }
}

/// Optional narrowing of a search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub category: Option<String>,
    pub condition: Option<String>,
    #[serde(default)]
    pub sort: SortOrder,
    #[serde(default)]
    pub exclude_terms: Vec<String>,
}

impl SearchFilters {
    pub fn price_in_bounds(&self, amount: f64) -> bool {
        self.min_price.is_none_or(|min| amount >= min)
            && self.max_price.is_none_or(|max| amount <= max)
    }

    /// Returns the first excluded term found in `text` (case-insensitive).
    pub fn excluded_term<'a>(&'a self, text: &str) -> Option<&'a str> {
        let lowered = text.to_lowercase();
        self.exclude_terms
            .iter()
            .map(|t| t.trim())
            .find(|t| !t.is_empty() && lowered.contains(&t.to_lowercase()))
    }

    fn validate(&self) -> Result<(), AppError> {
        for (name, bound) in [("min_price", self.min_price), ("max_price", self.max_price)] {
            if let Some(v) = bound
                && (!v.is_finite() || v < 0.0)
            {
                return Err(AppError::ValidationError(format!(
                    "{name} must be a non-negative number, got {v}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price)
            && min > max
        {
            return Err(AppError::ValidationError(format!(
                "min_price ({min}) must not exceed max_price ({max})"
            )));
        }
        Ok(())
    }
}

/// Immutable input to the job manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub query: String,
    pub source: String,
    pub max_items: u32,
    #[serde(default)]
    pub filters: SearchFilters,
}

impl ScrapeRequest {
    pub fn new(query: impl Into<String>, source: impl Into<String>, max_items: u32) -> Self {
        Self {
            query: query.into(),
            source: source.into(),
            max_items,
            filters: SearchFilters::default(),
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Reject malformed requests before a job is created.
    ///
    /// `ceiling` is the largest `max_items` a single job may ask for.
    pub fn validate(&self, ceiling: u32) -> Result<(), AppError> {
        if self.query.trim().is_empty() {
            return Err(AppError::ValidationError("query must not be empty".into()));
        }
        if self.source.trim().is_empty() {
            return Err(AppError::ValidationError("source must not be empty".into()));
        }
        if self.max_items == 0 || self.max_items > ceiling {
            return Err(AppError::ValidationError(format!(
                "max_items must be between 1 and {ceiling}, got {}",
                self.max_items
            )));
        }
        self.filters.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_request() {
        let req = ScrapeRequest::new("gold ring", "A", 50);
        assert!(req.validate(500).is_ok());
    }

    #[test]
    fn test_rejects_blank_query() {
        let err = ScrapeRequest::new("   ", "A", 50).validate(500).unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[test]
    fn test_rejects_out_of_range_max_items() {
        assert!(ScrapeRequest::new("ring", "A", 0).validate(500).is_err());
        assert!(ScrapeRequest::new("ring", "A", 501).validate(500).is_err());
        assert!(ScrapeRequest::new("ring", "A", 500).validate(500).is_ok());
    }

    #[test]
    fn test_rejects_inverted_price_bounds() {
        let req = ScrapeRequest::new("ring", "A", 10).with_filters(SearchFilters {
            min_price: Some(100.0),
            max_price: Some(50.0),
            ..Default::default()
        });
        assert!(req.validate(500).is_err());

        let req = ScrapeRequest::new("ring", "A", 10).with_filters(SearchFilters {
            min_price: Some(-1.0),
            ..Default::default()
        });
        assert!(req.validate(500).is_err());
    }

    #[test]
    fn test_filter_helpers() {
        let filters = SearchFilters {
            min_price: Some(10.0),
            max_price: Some(20.0),
            exclude_terms: vec!["Plated".into(), " ".into()],
            ..Default::default()
        };
        assert!(filters.price_in_bounds(15.0));
        assert!(!filters.price_in_bounds(25.0));
        assert_eq!(filters.excluded_term("Gold plated ring"), Some("Plated"));
        assert_eq!(filters.excluded_term("Solid gold ring"), None);
    }

    #[test]
    fn test_sort_order_roundtrip() {
        for sort in [
            SortOrder::Relevance,
            SortOrder::PriceAsc,
            SortOrder::PriceDesc,
            SortOrder::Newest,
        ] {
            let parsed: SortOrder = sort.as_str().parse().unwrap();
            assert_eq!(parsed, sort);
        }
    }
}
