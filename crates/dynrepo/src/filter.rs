//! Filter, pagination and paged-result types

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Value;

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending
    #[default]
    Asc,
    /// Descending
    Desc,
}

impl SortDirection {
    /// SQL keyword
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// Parse `asc`/`ascending`/`desc`/`descending`, case-insensitive
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(Self::Asc),
            "desc" | "descending" => Some(Self::Desc),
            _ => None,
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Caller-supplied sort. The column is sanitized before use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    /// Column name, optionally qualified
    pub column: String,
    /// Direction
    pub direction: SortDirection,
}

/// Search term, sort and key/value filters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterRequest {
    /// Free-text search term
    pub search_term: Option<String>,
    /// Sort column and direction
    pub sort: Option<SortSpec>,
    /// Filter values keyed by field name
    pub filters: BTreeMap<String, Value>,
}

impl FilterRequest {
    /// Create an empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the search term
    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search_term = Some(term.into());
        self
    }

    /// Set the sort
    pub fn sort_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            column: column.into(),
            direction,
        });
        self
    }

    /// Add a filter entry (replaces an existing key)
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Search term with surrounding whitespace removed; `None` when blank
    pub fn normalized_search(&self) -> Option<&str> {
        self.search_term
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Describe the request for result metadata
    pub fn metadata(&self) -> BTreeMap<String, serde_json::Value> {
        let mut metadata = BTreeMap::new();
        if let Some(sort) = &self.sort {
            metadata.insert("sortColumn".to_string(), sort.column.clone().into());
            metadata.insert(
                "sortDirection".to_string(),
                sort.direction.as_sql().to_string().into(),
            );
        }
        if let Some(term) = self.normalized_search() {
            metadata.insert("searchTerm".to_string(), term.to_string().into());
        }
        if !self.filters.is_empty() {
            let filters: serde_json::Map<_, _> = self
                .filters
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            metadata.insert("filters".to_string(), serde_json::Value::Object(filters));
        }
        metadata
    }
}

/// A filter request plus a 1-based page window
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    /// Filters and sort
    pub filter: FilterRequest,
    /// 1-based page index
    pub page_index: u32,
    /// Rows per page
    pub page_size: u32,
}

impl PageRequest {
    /// Page `page_index` of `page_size` rows, no filters
    pub fn new(page_index: u32, page_size: u32) -> Self {
        Self {
            filter: FilterRequest::default(),
            page_index,
            page_size,
        }
    }

    /// Attach filters and sort
    pub fn with_filter(mut self, filter: FilterRequest) -> Self {
        self.filter = filter;
        self
    }

    /// Check the page bounds
    pub fn validate(&self, max_page_size: u32) -> Result<()> {
        if self.page_index < 1 {
            return Err(Error::validation(format!(
                "page index must be >= 1, got {}",
                self.page_index
            )));
        }
        if self.page_size < 1 || self.page_size > max_page_size {
            return Err(Error::validation(format!(
                "page size must be between 1 and {}, got {}",
                max_page_size, self.page_size
            )));
        }
        Ok(())
    }

    /// Rows skipped before this page
    #[inline]
    pub fn offset(&self) -> i64 {
        (i64::from(self.page_index) - 1).max(0) * i64::from(self.page_size)
    }
}

/// One page of items plus the exact total
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// 1-based page index
    pub page_index: u32,
    /// Requested page size
    pub page_size: u32,
    /// Total rows across all pages
    pub total_count: i64,
    /// Request description (sort, search, filters, table)
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl<T> PagedResult<T> {
    /// Create a paged result
    pub fn new(items: Vec<T>, page_index: u32, page_size: u32, total_count: i64) -> Self {
        Self {
            items,
            page_index,
            page_size,
            total_count,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Number of pages (0 when there are no rows)
    pub fn total_pages(&self) -> i64 {
        if self.page_size == 0 || self.total_count <= 0 {
            return 0;
        }
        let size = i64::from(self.page_size);
        (self.total_count + size - 1) / size
    }

    /// Whether a later page exists
    pub fn has_next_page(&self) -> bool {
        i64::from(self.page_index) < self.total_pages()
    }

    /// Whether an earlier page exists
    pub fn has_previous_page(&self) -> bool {
        self.page_index > 1
    }

    /// Map items, keeping paging information
    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> PagedResult<U> {
        PagedResult {
            items: self.items.into_iter().map(f).collect(),
            page_index: self.page_index,
            page_size: self.page_size,
            total_count: self.total_count,
            metadata: self.metadata,
        }
    }
}
