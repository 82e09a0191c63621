//! strigil — a polite, resilient web scraper for PDFs, readable text, and
//! full-resolution images.
//!
//! The pipeline maps a page (discover candidate assets) and then scrapes it
//! (bounded parallel downloads), with a crawl controller for following
//! in-page links and a fetch layer that handles retries, rate limiting, and
//! optional browser or challenge-solver backends.

pub mod cli;
pub mod extract;
pub mod fetch;
pub mod pipeline;
pub mod robots;
pub mod storage;

pub use fetch::{FetchBackend, FetchError, Fetcher, FetcherConfig};
pub use pipeline::crawl::CrawlOptions;
pub use pipeline::orchestrate::RunOptions;
pub use pipeline::{
    map_page, scrape_assets, scrape_page, ImageItem, MapResult, PageOptions, ProgressEvent,
    WantedTypes,
};
pub use robots::RobotsGate;
pub use storage::Manifest;
