//! # multiscrape
//!
//! Orchestration core for collecting structured records (posts, videos, product
//! listings, articles) from public web sources that rate-limit and resist
//! automated access.
//!
//! ## Features
//!
//! - **Rate Control**: Token-bucket budget per platform with adaptive backoff
//! - **Session Lifecycle**: Lazy login, single-flight refresh, invalidation
//! - **Anti-Detection**: Seeded think-time, identity rotation, render-path selection
//! - **Pagination**: Cursor state machine with bounded retry
//! - **Crash Safety**: Checkpoint after every page, resumable jobs
//!
//! ## Quick Start
//!
//! ```no_run
//! use multiscrape::engine::{EngineConfig, EngineContext, JobLimits, ScrapeSession};
//! use multiscrape::extractor::{ExtractorRegistry, JsonFeedExtractor};
//! use multiscrape::output::MemorySink;
//! use multiscrape::resume::MemoryCheckpointStore;
//! use multiscrape::session::StaticCredentials;
//! use multiscrape::{Platform, Target};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut extractors = ExtractorRegistry::new();
//! extractors.register(Platform::News, Arc::new(JsonFeedExtractor::new("https://feeds.example.com/search")));
//!
//! let context = EngineContext::builder(EngineConfig::default())
//!     .extractors(extractors)
//!     .checkpoints(Arc::new(MemoryCheckpointStore::new()))
//!     .sink(Arc::new(MemorySink::new()))
//!     .credentials(Arc::new(StaticCredentials::new()))
//!     .build()?;
//!
//! let session = ScrapeSession::new(context);
//! let job_id = session
//!     .start(Target::keyword(Platform::News, "elections"), JobLimits::default())
//!     .await?;
//! let job = session.wait(job_id).await?;
//! println!("{} records, status {:?}", job.records_emitted, job.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - Job orchestration ([`engine::ScrapeSession`]), rate control, configuration
//! - [`session`] - Platform session lifecycle and credentials
//! - [`policy`] - Anti-detection pacing and fingerprint rotation
//! - [`fetcher`] - Transports, the page fetcher and the paginator
//! - [`extractor`] - Per-platform page-to-record adapters
//! - [`resume`] - Checkpoints and checkpoint stores
//! - [`output`] - Record sinks

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Cooperative job cancellation
pub mod cancel;

/// Job orchestration, rate control and configuration
pub mod engine;

/// Per-platform extractor adapters
pub mod extractor;

/// Transports, page fetching and pagination
pub mod fetcher;

/// Prometheus metrics
pub mod metrics;

/// Record sinks
pub mod output;

/// Anti-detection request planning
pub mod policy;

/// Checkpoints and checkpoint stores
pub mod resume;

/// Session lifecycle management
pub mod session;

/// Tracing subscriber setup
pub mod telemetry;

pub use fetcher::pagination::{Continuation, Cursor};

/// Source platform a target is scraped from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Twitter / X search results
    Twitter,
    /// YouTube search and channel listings
    Youtube,
    /// Amazon product search
    Amazon,
    /// News aggregator search
    News,
}

impl Platform {
    /// All supported platforms
    pub const ALL: [Platform; 4] = [
        Platform::Twitter,
        Platform::Youtube,
        Platform::Amazon,
        Platform::News,
    ];

    /// Lowercase platform name
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::Youtube => "youtube",
            Platform::Amazon => "amazon",
            Platform::News => "news",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "twitter" | "x" => Ok(Platform::Twitter),
            "youtube" => Ok(Platform::Youtube),
            "amazon" => Ok(Platform::Amazon),
            "news" => Ok(Platform::News),
            _ => Err(format!("Invalid platform: {s}")),
        }
    }
}

/// What a target searches for on its platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Query {
    /// Free-text keyword search
    Keyword(String),
    /// Hashtag (without the leading `#`)
    Hashtag(String),
    /// Channel or account identifier
    Channel(String),
    /// Product or content category
    Category(String),
}

impl Query {
    /// Raw query text
    pub fn text(&self) -> &str {
        match self {
            Query::Keyword(s) | Query::Hashtag(s) | Query::Channel(s) | Query::Category(s) => s,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Query::Keyword(_) => "keyword",
            Query::Hashtag(_) => "hashtag",
            Query::Channel(_) => "channel",
            Query::Category(_) => "category",
        }
    }
}

/// Inclusive calendar date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    /// First day (inclusive)
    pub start: NaiveDate,
    /// Last day (inclusive)
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a range, rejecting `end < start`
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, String> {
        if end < start {
            return Err(format!(
                "Date range end ({end}) must not be before start ({start})"
            ));
        }
        Ok(Self { start, end })
    }

    /// Whether `date` falls inside the range
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Next window of at most `days` days that begins after `after`
    ///
    /// `after = None` yields the first window. Returns `None` once the range
    /// is covered. Windows never overlap and never leave gaps.
    pub fn window(&self, after: Option<NaiveDate>, days: u32) -> Option<DateRange> {
        let days = i64::from(days.max(1));
        let start = match after {
            None => self.start,
            Some(prev_end) => prev_end.succ_opt()?,
        };
        if start > self.end {
            return None;
        }
        let end = start
            .checked_add_signed(chrono::Duration::days(days - 1))
            .map(|d| d.min(self.end))
            .unwrap_or(self.end);
        Some(DateRange { start, end })
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Scope of one scrape. Immutable once a job starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Platform to scrape
    pub platform: Platform,
    /// Search scope
    pub query: Query,
    /// Optional publication date filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    /// Extra platform-specific filters (sort order, language, region)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
}

impl Target {
    /// Create a target with an explicit query
    pub fn new(platform: Platform, query: Query) -> Self {
        Self {
            platform,
            query,
            date_range: None,
            filters: BTreeMap::new(),
        }
    }

    /// Keyword search target
    pub fn keyword(platform: Platform, keyword: impl Into<String>) -> Self {
        Self::new(platform, Query::Keyword(keyword.into()))
    }

    /// Restrict the target to a date range
    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    /// Add a platform-specific filter
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Validate target parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.query.text().trim().is_empty() {
            return Err("Query cannot be empty".to_string());
        }

        if let Some(range) = &self.date_range {
            if range.end < range.start {
                return Err(format!(
                    "Date range end ({}) must not be before start ({})",
                    range.end, range.start
                ));
            }
        }

        Ok(())
    }

    /// Stable provenance key, e.g. `news:keyword:elections@2024-01-01..2024-01-31`
    pub fn key(&self) -> String {
        let mut key = format!(
            "{}:{}:{}",
            self.platform,
            self.query.kind(),
            self.query.text()
        );
        if let Some(range) = &self.date_range {
            key.push('@');
            key.push_str(&range.to_string());
        }
        for (k, v) in &self.filters {
            key.push_str(&format!(";{k}={v}"));
        }
        key
    }
}

/// Generic record field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Missing value
    Null,
    /// Boolean flag
    Bool(bool),
    /// Integer count (views, likes, reviews)
    Int(i64),
    /// Floating point value (price, rating)
    Float(f64),
    /// Text value
    Text(String),
    /// Ordered list of values
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Render the value as a flat string (lists joined with `|`)
    pub fn to_flat_string(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::List(items) => items
                .iter()
                .map(FieldValue::to_flat_string)
                .collect::<Vec<_>>()
                .join("|"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(value: Vec<T>) -> Self {
        FieldValue::List(value.into_iter().map(Into::into).collect())
    }
}

/// Normalized output unit. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
    source_target: Target,
    source_url: String,
    collected_at: DateTime<Utc>,
}

impl Record {
    /// Start building a record for `target` scraped from `source_url`
    pub fn builder(target: &Target, source_url: impl Into<String>) -> RecordBuilder {
        RecordBuilder {
            fields: BTreeMap::new(),
            source_target: target.clone(),
            source_url: source_url.into(),
            collected_at: None,
        }
    }

    /// All fields
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Single field by name
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Target this record was collected for
    pub fn source_target(&self) -> &Target {
        &self.source_target
    }

    /// URL the record can be re-fetched from
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Collection timestamp
    pub fn collected_at(&self) -> DateTime<Utc> {
        self.collected_at
    }
}

/// Builder for [`Record`]
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    fields: BTreeMap<String, FieldValue>,
    source_target: Target,
    source_url: String,
    collected_at: Option<DateTime<Utc>>,
}

impl RecordBuilder {
    /// Set a field
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Override the collection timestamp (defaults to now)
    pub fn collected_at(mut self, at: DateTime<Utc>) -> Self {
        self.collected_at = Some(at);
        self
    }

    /// Finish the record
    pub fn build(self) -> Record {
        Record {
            fields: self.fields,
            source_target: self.source_target,
            source_url: self.source_url,
            collected_at: self.collected_at.unwrap_or_else(Utc::now),
        }
    }
}
