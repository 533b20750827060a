//! Per-platform page-to-record adapters
//!
//! The engine never parses site markup itself. Each platform registers an
//! [`ExtractorAdapter`] that knows how to request a page for a cursor and how
//! to turn the fetched page into records plus the next continuation.

pub mod json_feed;

pub use json_feed::JsonFeedExtractor;

use crate::fetcher::{Continuation, Cursor, PageRequest, RawPage};
use crate::{Platform, Record, Target};
use std::collections::HashMap;
use std::sync::Arc;

/// Extraction errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractError {
    /// Page could not be parsed. A data-quality problem, not a fetch failure.
    #[error("malformed page: {message}")]
    MalformedPage {
        /// What was wrong
        message: String,
        /// Next continuation, when it could still be derived
        next: Option<Continuation>,
    },

    /// Adapter cannot build a request for this target
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),
}

/// Output of one successful extraction
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Records found on the page
    pub records: Vec<Record>,
    /// Where the next page starts; `None` when this was the last page
    pub next: Option<Continuation>,
}

/// Capability interface implemented once per platform
pub trait ExtractorAdapter: Send + Sync {
    /// Build the request for the page at `cursor`
    fn page_request(&self, target: &Target, cursor: &Cursor) -> Result<PageRequest, ExtractError>;

    /// Turn a fetched page into records. Must be pure.
    fn extract(
        &self,
        page: &RawPage,
        target: &Target,
        cursor: &Cursor,
    ) -> Result<Extraction, ExtractError>;

    /// Platform pages only make sense after JavaScript runs
    fn requires_render(&self) -> bool {
        false
    }

    /// Identity used to drop repeats within a job
    fn dedup_key(&self, record: &Record) -> String {
        record.source_url().to_string()
    }
}

/// Maps each platform to its adapter
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    adapters: HashMap<Platform, Arc<dyn ExtractorAdapter>>,
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

impl ExtractorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the adapter for `platform`
    pub fn register(&mut self, platform: Platform, adapter: Arc<dyn ExtractorAdapter>) {
        self.adapters.insert(platform, adapter);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, platform: Platform, adapter: Arc<dyn ExtractorAdapter>) -> Self {
        self.register(platform, adapter);
        self
    }

    /// Adapter for `platform`
    pub fn get(&self, platform: Platform) -> Option<Arc<dyn ExtractorAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    /// Platforms with an adapter, in declaration order
    pub fn platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.adapters.contains_key(p))
            .collect()
    }
}
