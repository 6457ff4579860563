//! Parameter strategies for filters and stored procedures
//!
//! Filters reach the database either as one parameter per entry
//! ([`ParameterStrategy::Individual`]) or as a single JSON document
//! ([`ParameterStrategy::Json`]). Parameter names follow the configured
//! [`NamingConvention`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::CommandKind;
use crate::error::Result;
use crate::filter::FilterRequest;
use crate::params::Params;
use crate::security::{validate_sql_identifier, IdentifierSanitizer};
use crate::types::Value;

/// Parameter and JSON key naming convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingConvention {
    /// Leave names untouched
    #[default]
    AsIs,
    /// `PageSize`
    Pascal,
    /// `pageSize`
    Camel,
    /// `page_size`
    Snake,
}

impl NamingConvention {
    /// Convert a name to this convention
    pub fn apply(self, name: &str) -> String {
        match self {
            Self::AsIs => name.to_string(),
            Self::Snake => words(name)
                .iter()
                .map(|w| w.to_ascii_lowercase())
                .collect::<Vec<_>>()
                .join("_"),
            Self::Pascal => words(name).iter().map(|w| capitalize(w)).collect(),
            Self::Camel => words(name)
                .iter()
                .enumerate()
                .map(|(i, w)| {
                    if i == 0 {
                        w.to_ascii_lowercase()
                    } else {
                        capitalize(w)
                    }
                })
                .collect(),
        }
    }
}

/// Split on separators and case boundaries (`HTTPStatusCode` → HTTP, Status, Code)
fn words(name: &str) -> Vec<String> {
    let mut words = Vec::new();
    for part in name.split(|c: char| c == '_' || c == '-' || c == ' ' || c == '@') {
        let chars: Vec<char> = part.chars().collect();
        let mut current = String::new();
        for (i, &c) in chars.iter().enumerate() {
            let boundary = i > 0
                && c.is_uppercase()
                && (chars[i - 1].is_lowercase()
                    || chars[i - 1].is_ascii_digit()
                    || (chars[i - 1].is_uppercase()
                        && chars.get(i + 1).is_some_and(|n| n.is_lowercase())));
            if boundary && !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            current.push(c);
        }
        if !current.is_empty() {
            words.push(current);
        }
    }
    words
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// How filter entries are passed to the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterStrategy {
    /// One parameter per filter entry
    Individual,
    /// One JSON parameter holding the whole filter map
    Json,
}

/// Chooses a strategy and renders filter and procedure parameter sets
#[derive(Debug, Clone)]
pub struct ParameterStrategyResolver {
    naming: NamingConvention,
    text_strategy: ParameterStrategy,
    procedure_strategy: ParameterStrategy,
    blob_name: String,
    sanitizer: IdentifierSanitizer,
}

impl ParameterStrategyResolver {
    /// Create a resolver with JSON for procedures and individual parameters for text
    pub fn new(naming: NamingConvention) -> Self {
        Self {
            naming,
            text_strategy: ParameterStrategy::Individual,
            procedure_strategy: ParameterStrategy::Json,
            blob_name: "Filters".to_string(),
            sanitizer: IdentifierSanitizer::new(),
        }
    }

    /// Override the default strategies
    pub fn with_defaults(mut self, text: ParameterStrategy, procedure: ParameterStrategy) -> Self {
        self.text_strategy = text;
        self.procedure_strategy = procedure;
        self
    }

    /// Override the JSON blob parameter name
    pub fn with_blob_name(mut self, name: impl Into<String>) -> Self {
        self.blob_name = name.into();
        self
    }

    /// Naming convention in effect
    pub fn naming(&self) -> NamingConvention {
        self.naming
    }

    /// Parameter name in the configured convention
    pub fn parameter_name(&self, logical: &str) -> String {
        self.naming.apply(logical)
    }

    /// Strategy for a command kind, honoring a per-command override
    pub fn resolve(
        &self,
        kind: CommandKind,
        override_strategy: Option<ParameterStrategy>,
    ) -> ParameterStrategy {
        override_strategy.unwrap_or(match kind {
            CommandKind::Text => self.text_strategy,
            CommandKind::StoredProcedure => self.procedure_strategy,
        })
    }

    /// Render the filter map under `strategy`
    pub fn filter_params(
        &self,
        filters: &BTreeMap<String, Value>,
        strategy: ParameterStrategy,
    ) -> Result<Params> {
        let mut params = Params::new();
        match strategy {
            ParameterStrategy::Individual => {
                for (key, value) in filters {
                    let name = self.naming.apply(key);
                    validate_sql_identifier(&name)?;
                    params.insert(name, value.clone());
                }
            }
            ParameterStrategy::Json => {
                let blob: serde_json::Map<String, serde_json::Value> = filters
                    .iter()
                    .map(|(k, v)| (NamingConvention::Camel.apply(k), v.to_json()))
                    .collect();
                params.insert(
                    self.parameter_name(&self.blob_name),
                    Value::Json(serde_json::Value::Object(blob)),
                );
            }
        }
        Ok(params)
    }

    /// Parameters for an inline text filter: the filters plus `search_term`
    /// (always present, NULL when there is no term)
    pub fn text_params(&self, request: &FilterRequest, strategy: ParameterStrategy) -> Result<Params> {
        let mut params = self.filter_params(&request.filters, strategy)?;
        params.insert(self.parameter_name("SearchTerm"), search_value(request));
        Ok(params)
    }

    /// Full parameter set for a filtering or paging procedure
    pub fn procedure_params(
        &self,
        request: &FilterRequest,
        page: Option<(u32, u32)>,
        strategy: ParameterStrategy,
    ) -> Result<Params> {
        let mut params = self.text_params(request, strategy)?;

        let (sort_column, sort_direction) = match &request.sort {
            Some(sort) => (
                Value::String(self.sanitizer.sanitize(&sort.column)?),
                Value::String(sort.direction.as_sql().to_string()),
            ),
            None => (Value::Null, Value::Null),
        };
        params.insert(self.parameter_name("SortColumn"), sort_column);
        params.insert(self.parameter_name("SortDirection"), sort_direction);

        if let Some((page_index, page_size)) = page {
            params.insert(self.parameter_name("PageNumber"), i64::from(page_index));
            params.insert(self.parameter_name("PageSize"), i64::from(page_size));
        }
        Ok(params)
    }
}

fn search_value(request: &FilterRequest) -> Value {
    match request.normalized_search() {
        Some(term) => Value::String(format!("%{}%", term)),
        None => Value::Null,
    }
}
