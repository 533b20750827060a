//! Reference adapter for JSON search feeds
//!
//! Expects pages shaped like
//!
//! ```json
//! { "items": [ { "url": "https://...", "title": "...", "views": 10 } ], "next": "c2" }
//! ```
//!
//! `next` may be a string cursor, a page number or `null`. Every item must
//! carry a `url`; its other keys become record fields. With
//! [`JsonFeedExtractor::with_window_days`] a dated target is walked one date
//! window at a time, each window paginated by the feed's own cursor.

use super::{ExtractError, Extraction, ExtractorAdapter};
use crate::fetcher::{Continuation, Cursor, PageRequest, RawPage};
use crate::{FieldValue, Record, Target};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct FeedPage {
    items: Option<Vec<serde_json::Map<String, Value>>>,
    #[serde(default)]
    next: Value,
}

/// Adapter for `{items, next}` JSON feeds
#[derive(Debug, Clone)]
pub struct JsonFeedExtractor {
    base_url: String,
    window_days: Option<u32>,
    render: bool,
}

impl JsonFeedExtractor {
    /// Feed served at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            window_days: None,
            render: false,
        }
    }

    /// Split dated targets into windows of `days` days
    pub fn with_window_days(mut self, days: u32) -> Self {
        self.window_days = Some(days.max(1));
        self
    }

    /// Mark the feed as needing a rendered browser
    pub fn with_render(mut self, render: bool) -> Self {
        self.render = render;
        self
    }

    fn first_window(&self, target: &Target) -> Option<Continuation> {
        let days = self.window_days?;
        let window = target.date_range?.window(None, days)?;
        Some(Continuation::Window {
            start: window.start,
            end: window.end,
            token: None,
            page: None,
        })
    }

    fn next_continuation(&self, target: &Target, current: &Continuation, next: &Value) -> Option<Continuation> {
        let inner = match next {
            Value::String(s) if !s.is_empty() => Some(Continuation::Token(s.clone())),
            Value::Number(n) => n.as_u64().map(|n| Continuation::Page(n.min(u64::from(u32::MAX)) as u32)),
            _ => None,
        };

        let Continuation::Window { start, end, .. } = current else {
            return inner;
        };

        match inner {
            Some(Continuation::Token(t)) => Some(Continuation::Window {
                start: *start,
                end: *end,
                token: Some(t),
                page: None,
            }),
            Some(Continuation::Page(p)) => Some(Continuation::Window {
                start: *start,
                end: *end,
                token: None,
                page: Some(p),
            }),
            _ => {
                let days = self.window_days?;
                let window = target.date_range?.window(Some(*end), days)?;
                Some(Continuation::Window {
                    start: window.start,
                    end: window.end,
                    token: None,
                    page: None,
                })
            }
        }
    }
}

fn to_field(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => n
            .as_i64()
            .map(FieldValue::Int)
            .or_else(|| n.as_f64().map(FieldValue::Float))
            .unwrap_or(FieldValue::Null),
        Value::String(s) => FieldValue::Text(s.clone()),
        Value::Array(items) => FieldValue::List(items.iter().map(to_field).collect()),
        Value::Object(_) => FieldValue::Text(value.to_string()),
    }
}

impl ExtractorAdapter for JsonFeedExtractor {
    fn page_request(&self, target: &Target, cursor: &Cursor) -> Result<PageRequest, ExtractError> {
        let mut request = PageRequest::get(self.base_url.clone()).param("q", target.query.text());
        for (key, value) in &target.filters {
            request = request.param(key.clone(), value);
        }

        let continuation = match &cursor.continuation {
            Continuation::Start => self.first_window(target).unwrap_or(Continuation::Start),
            other => other.clone(),
        };

        request = match continuation {
            Continuation::Start => match target.date_range {
                Some(range) => request.param("from", range.start).param("to", range.end),
                None => request,
            },
            Continuation::Page(n) => request.param("page", n),
            Continuation::Offset(n) => request.param("offset", n),
            Continuation::Token(t) => request.param("cursor", t),
            Continuation::Window {
                start,
                end,
                token,
                page,
            } => {
                let request = request.param("from", start).param("to", end);
                match (token, page) {
                    (Some(t), _) => request.param("cursor", t),
                    (None, Some(n)) => request.param("page", n),
                    (None, None) => request,
                }
            }
            Continuation::Exhausted => {
                return Err(ExtractError::UnsupportedTarget(
                    "cursor is exhausted".to_string(),
                ))
            }
        };
        Ok(request)
    }

    fn extract(
        &self,
        page: &RawPage,
        target: &Target,
        cursor: &Cursor,
    ) -> Result<Extraction, ExtractError> {
        let current = match &cursor.continuation {
            Continuation::Start => self.first_window(target).unwrap_or(Continuation::Start),
            other => other.clone(),
        };

        let feed: FeedPage = serde_json::from_str(&page.body).map_err(|e| ExtractError::MalformedPage {
            message: format!("invalid JSON from {}: {e}", page.url),
            next: None,
        })?;
        let next = self.next_continuation(target, &current, &feed.next);

        let Some(items) = feed.items else {
            return Err(ExtractError::MalformedPage {
                message: format!("missing items array in {}", page.url),
                next,
            });
        };

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let Some(url) = item.get("url").and_then(Value::as_str) else {
                warn!(page = %page.url, "Feed item without url skipped");
                continue;
            };
            let record = item
                .iter()
                .filter(|(key, _)| key.as_str() != "url")
                .fold(Record::builder(target, url), |builder, (key, value)| {
                    builder.field(key.clone(), to_field(value))
                })
                .collected_at(page.fetched_at)
                .build();
            records.push(record);
        }

        Ok(Extraction { records, next })
    }

    fn requires_render(&self) -> bool {
        self.render
    }
}
