//! A provider serving listings from JSON documents, for offline syncs and tests.

use async_trait::async_trait;
use canopy::{ListFilter, ProviderError, ResourceProvider};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Serves each resource kind from `<dir>/<kind>.json` or from listings
/// registered in memory.
///
/// A document is either an array of records or an object wrapping one, as
/// the APIs return them (`{"servers": [...]}`). Records not matching the
/// listing filter are dropped. Kinds without a document list as empty unless
/// the provider is strict.
#[derive(Debug, Default)]
pub struct FixtureProvider {
    root: Option<PathBuf>,
    listings: IndexMap<String, Vec<Value>>,
    failures: IndexMap<String, (u16, String)>,
    strict: bool,
    calls: Mutex<Vec<(String, ListFilter)>>,
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Serve `records` for `kind`, ahead of any document on disk.
    pub fn with_listing(mut self, kind: impl Into<String>, records: Vec<Value>) -> Self {
        self.listings.insert(kind.into(), records);
        self
    }

    /// Fail every listing of `kind` with an HTTP-like status.
    pub fn with_failure(
        mut self,
        kind: impl Into<String>,
        status: u16,
        detail: impl Into<String>,
    ) -> Self {
        self.failures.insert(kind.into(), (status, detail.into()));
        self
    }

    /// Report kinds without a document as 404 instead of an empty listing.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Every listing made so far, in call order.
    pub fn calls(&self) -> Vec<(String, ListFilter)> {
        self.calls.lock().clone()
    }

    async fn records(&self, kind: &str) -> Result<Vec<Value>, ProviderError> {
        if let Some(records) = self.listings.get(kind) {
            return Ok(records.clone());
        }
        let Some(root) = &self.root else {
            return self.missing(kind);
        };

        let path = root.join(format!("{kind}.json"));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return self.missing(kind),
            Err(e) => return Err(ProviderError::transport(kind, format!("{}: {e}", path.display()))),
        };
        let document: Value = serde_json::from_str(&text).map_err(|source| ProviderError::Decode {
            kind: kind.to_string(),
            source,
        })?;
        tracing::trace!(kind, path = %path.display(), "fixture loaded");
        unwrap_listing(kind, document)
    }

    fn missing(&self, kind: &str) -> Result<Vec<Value>, ProviderError> {
        if self.strict {
            return Err(ProviderError::Status {
                kind: kind.to_string(),
                status: 404,
                detail: "no fixture".to_string(),
            });
        }
        tracing::debug!(kind, "no fixture, listing is empty");
        Ok(Vec::new())
    }
}

fn unwrap_listing(kind: &str, document: Value) -> Result<Vec<Value>, ProviderError> {
    match document {
        Value::Array(records) => Ok(records),
        Value::Object(map) if map.len() == 1 => match map.into_iter().next() {
            Some((_, Value::Array(records))) => Ok(records),
            _ => Err(ProviderError::transport(kind, "fixture does not wrap an array")),
        },
        _ => Err(ProviderError::transport(
            kind,
            "fixture must be an array or an object wrapping one",
        )),
    }
}

#[async_trait]
impl ResourceProvider for FixtureProvider {
    async fn list(&self, kind: &str, filter: &ListFilter) -> Result<Vec<Value>, ProviderError> {
        self.calls.lock().push((kind.to_string(), filter.clone()));

        if let Some((status, detail)) = self.failures.get(kind) {
            return Err(ProviderError::Status {
                kind: kind.to_string(),
                status: *status,
                detail: detail.clone(),
            });
        }

        let records: Vec<Value> = self
            .records(kind)
            .await?
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect();
        tracing::debug!(kind, count = records.len(), "fixture listing");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_listing_is_filtered() {
        let provider = FixtureProvider::new().with_listing(
            "blockstorage.backups",
            vec![
                json!({ "id": "b1", "volume_id": "v1" }),
                json!({ "id": "b2", "volume_id": "v2" }),
            ],
        );
        let filter = ListFilter::new().with("volume_id", "v2");
        let records = provider.list("blockstorage.backups", &filter).await.unwrap();
        assert_eq!(records, vec![json!({ "id": "b2", "volume_id": "v2" })]);
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_reads_wrapped_documents_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("compute.servers.json"),
            r#"{ "servers": [{ "id": "s1" }, { "id": "s2" }] }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("identity.users.json"), r#"[{ "id": "u1" }]"#).unwrap();

        let provider = FixtureProvider::from_dir(dir.path());
        let servers = provider.list("compute.servers", &ListFilter::new()).await.unwrap();
        assert_eq!(servers.len(), 2);
        let users = provider.list("identity.users", &ListFilter::new()).await.unwrap();
        assert_eq!(users.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_kind_is_empty_unless_strict() {
        let dir = tempfile::tempdir().unwrap();
        let lenient = FixtureProvider::from_dir(dir.path());
        assert!(lenient.list("baremetal.drivers", &ListFilter::new()).await.unwrap().is_empty());

        let strict = FixtureProvider::from_dir(dir.path()).strict(true);
        let err = strict.list("baremetal.drivers", &ListFilter::new()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_configured_failure() {
        let provider = FixtureProvider::new().with_failure("compute.servers", 503, "maintenance");
        let err = provider.list("compute.servers", &ListFilter::new()).await.unwrap_err();
        assert_eq!(err.kind(), "compute.servers");
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_malformed_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("networking.ports.json"), r#"{ "a": [], "b": [] }"#).unwrap();
        let provider = FixtureProvider::from_dir(dir.path());
        let err = provider.list("networking.ports", &ListFilter::new()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transport { .. }));
    }
}
