pub mod config;
pub mod database;
pub mod product_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use product_repository::{ProductPage, ProductQuery, ProductRepository, ProductSort};
