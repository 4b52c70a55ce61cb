//! Magpie Core - domain model for anonymized dark web reconnaissance
//!
//! This crate provides the foundational primitives:
//! - Search result records and link-keyed deduplication
//! - Static search engine descriptor catalog
//! - Indicator (IOC) extraction and merge

pub mod engines;
pub mod indicators;
pub mod results;

pub use engines::*;
pub use indicators::*;
pub use results::*;

/// Maximum characters kept per scraped page before truncation
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 1200;

/// Suffix appended to truncated page content
pub const TRUNCATION_MARKER: &str = "...";

/// Default number of concurrent workers for search and scrape fan-out
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Default number of results kept after relevance filtering
pub const DEFAULT_TOP_N: usize = 20;
