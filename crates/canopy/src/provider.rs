//! The Resource Provider seam: whatever lists raw records from the remote API.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Errors raised by a provider listing or by decoding its records.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("listing {kind} failed: {detail}")]
    Transport { kind: String, detail: String },

    #[error("listing {kind} failed with status {status}: {detail}")]
    Status {
        kind: String,
        status: u16,
        detail: String,
    },

    #[error("cannot decode {kind} record: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("collector for {kind} received a parent item of the wrong type")]
    ParentType { kind: String },
}

impl ProviderError {
    pub fn transport(kind: impl Into<String>, detail: impl ToString) -> Self {
        ProviderError::Transport {
            kind: kind.into(),
            detail: detail.to_string(),
        }
    }

    /// The resource kind whose listing failed.
    pub fn kind(&self) -> &str {
        match self {
            ProviderError::Transport { kind, .. }
            | ProviderError::Status { kind, .. }
            | ProviderError::Decode { kind, .. }
            | ProviderError::ParentType { kind } => kind,
        }
    }
}

/// Query criteria passed to a listing, e.g. `volume_id` or `all_tenants`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListFilter {
    criteria: IndexMap<String, Value>,
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.criteria.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.criteria.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.criteria.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether a record satisfies every criterion it carries a field for.
    ///
    /// Criteria naming fields the record lacks (query switches such as
    /// `all_tenants`) are not record attributes and are ignored.
    pub fn matches(&self, record: &Value) -> bool {
        self.criteria
            .iter()
            .all(|(key, expected)| record.get(key).is_none_or(|actual| actual == expected))
    }
}

/// Lists raw records of a resource kind.
///
/// Shared read-only by every concurrent collector of a run; pagination,
/// authentication and transport belong to the implementation.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn list(&self, kind: &str, filter: &ListFilter) -> Result<Vec<Value>, ProviderError>;
}

/// List a resource kind and decode every record into `T`.
pub async fn list_as<T: DeserializeOwned>(
    provider: &dyn ResourceProvider,
    kind: &str,
    filter: &ListFilter,
) -> Result<Vec<T>, ProviderError> {
    provider
        .list(kind, filter)
        .await?
        .into_iter()
        .map(|value| decode(kind, value))
        .collect()
}

/// Decode one raw record.
pub fn decode<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, ProviderError> {
    serde_json::from_value(value).map_err(|source| ProviderError::Decode {
        kind: kind.to_string(),
        source,
    })
}
