pub mod common;
mod product_tests;
