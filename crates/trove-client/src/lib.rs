pub mod adapter;
pub mod guard;
pub mod images;
pub mod parser;
pub mod source;

pub use adapter::{HttpSourceAdapter, registry_from};
pub use images::{FsImageStore, HttpImageFetcher};
pub use source::{FilterParams, SourceConfig, load_sources};
