mod api_tests;
pub mod common;
mod product_tests;
