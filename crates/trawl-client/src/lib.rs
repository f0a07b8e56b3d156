#[cfg(feature = "browser")]
pub mod browser_fetcher;
pub mod extractor;
pub mod fetcher;

#[cfg(feature = "browser")]
pub use browser_fetcher::{BrowserFetcher, BrowserFetcherFactory};
pub use extractor::{PROJECT_FIELDS, ProjectPageExtractor};
pub use fetcher::{ReqwestFetcher, ReqwestFetcherFactory};
