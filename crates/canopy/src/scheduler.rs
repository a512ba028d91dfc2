//! Scheduler: how a table tree is walked.
//!
//! Each table invocation streams its collector, materializes rows for every
//! item, then resolves the item's child tables before pulling the next item.
//! Emitted items live in an item arena while their subtree is resolved;
//! children are handed the item's key rather than a copy.
//!
//! Concurrency is bounded by a semaphore sized by `max_concurrency`. A
//! permit is held only while a collector is polled for its next item, so a
//! deep tree cannot starve itself of permits.

use crate::collector::{CollectContext, Emitted};
use crate::config::SyncConfig;
use crate::pattern::ConfigurationError;
use crate::provider::{ProviderError, ResourceProvider};
use crate::sink::Sink;
use crate::table::{TableId, TableTree};
use futures_util::future::{BoxFuture, try_join_all};
use futures_util::{FutureExt, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Errors that abort a sync.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("table {table}: {source}")]
    Provider {
        table: String,
        #[source]
        source: ProviderError,
    },

    #[error("sink closed while emitting rows for table {table}")]
    SinkClosed { table: String },
}

impl SyncError {
    /// Name of the table whose invocation failed.
    pub fn table(&self) -> &str {
        match self {
            SyncError::Provider { table, .. } | SyncError::SinkClosed { table } => table,
        }
    }
}

/// Statistics from one sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    /// Total sync duration.
    pub duration: Duration,
    /// Rows pushed to the sink.
    pub rows: u64,
    /// Items emitted by collectors and processed.
    pub items: u64,
    /// Collector invocations started.
    pub invocations: u64,
    /// Rows per table, in tree order. Tables that produced nothing are listed with 0.
    pub per_table: IndexMap<String, u64>,
}

/// How a sync ended when it did not fail.
///
/// Rows pushed before cancellation are valid and already delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncStats),
    Cancelled(SyncStats),
}

impl SyncOutcome {
    pub fn stats(&self) -> &SyncStats {
        match self {
            SyncOutcome::Completed(stats) | SyncOutcome::Cancelled(stats) => stats,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncOutcome::Cancelled(_))
    }
}

/// Key of an emitted item: its table and per-table emission sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ItemKey {
    pub table: TableId,
    pub seq: u64,
}

/// Items whose subtrees are being resolved, plus the `(table, parent)`
/// pairs claimed for resolution.
///
/// Claims under a parent item live as long as the item: releasing the
/// item drops them, so the set only holds pairs of subtrees in progress
/// (and the root claims, which last the whole run).
pub(crate) struct ItemArena {
    next_seq: Vec<AtomicU64>,
    items: Mutex<HashMap<ItemKey, Arc<Emitted>>>,
    claims: Mutex<HashSet<(TableId, Option<ItemKey>)>>,
}

impl ItemArena {
    pub(crate) fn new(tables: usize) -> Self {
        Self {
            next_seq: (0..tables).map(|_| AtomicU64::new(0)).collect(),
            items: Mutex::default(),
            claims: Mutex::default(),
        }
    }

    pub(crate) fn insert(&self, table: TableId, item: Emitted) -> (ItemKey, Arc<Emitted>) {
        let seq = self.next_seq[table.index()].fetch_add(1, Ordering::Relaxed);
        let key = ItemKey { table, seq };
        let item = Arc::new(item);
        self.items.lock().insert(key, Arc::clone(&item));
        (key, item)
    }

    pub(crate) fn get(&self, key: ItemKey) -> Option<Arc<Emitted>> {
        self.items.lock().get(&key).cloned()
    }

    pub(crate) fn release(&self, key: ItemKey) {
        self.items.lock().remove(&key);
        self.claims.lock().retain(|(_, parent)| *parent != Some(key));
    }

    /// Claim `table` for resolution under `parent`. False if already claimed.
    pub(crate) fn claim(&self, table: TableId, parent: Option<ItemKey>) -> bool {
        self.claims.lock().insert((table, parent))
    }

    pub(crate) fn live(&self) -> usize {
        self.items.lock().len()
    }

    pub(crate) fn claimed(&self) -> usize {
        self.claims.lock().len()
    }
}

/// Walks table trees with a bounded number of in-flight collectors.
#[derive(Debug, Clone)]
pub struct Scheduler {
    max_concurrency: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            max_concurrency: Self::DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl Scheduler {
    pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

    pub fn new(max_concurrency: usize) -> Result<Self, ConfigurationError> {
        if max_concurrency == 0 {
            return Err(ConfigurationError::InvalidConcurrency(max_concurrency));
        }
        Ok(Self { max_concurrency })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigurationError> {
        Self::new(config.max_concurrency)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Walk `tree`, pushing every row to `sink`.
    ///
    /// Root tables and sibling relations run concurrently. The first
    /// failure aborts the whole walk; rows already pushed stay pushed.
    /// Cancelling `cancel` stops the walk at the next check and yields
    /// [`SyncOutcome::Cancelled`].
    pub async fn sync(
        &self,
        cancel: &CancellationToken,
        provider: &dyn ResourceProvider,
        tree: &TableTree,
        sink: &dyn Sink,
    ) -> Result<SyncOutcome, SyncError> {
        let start = Instant::now();
        let run = Run {
            tree,
            provider,
            sink,
            cancel: cancel.child_token(),
            permits: Semaphore::new(self.max_concurrency),
            arena: ItemArena::new(tree.len()),
            rows: (0..tree.len()).map(|_| AtomicU64::new(0)).collect(),
            items: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
        };
        tracing::info!(
            tables = tree.len(),
            max_concurrency = self.max_concurrency,
            "sync started"
        );

        let result = try_join_all(tree.roots().iter().map(|&root| run.run_table(root, None))).await;
        let stats = run.stats(start.elapsed());
        match result {
            Err(e) => {
                tracing::error!(table = e.table(), error = %e, rows = stats.rows, "sync failed");
                Err(e)
            }
            Ok(_) if cancel.is_cancelled() => {
                tracing::info!(rows = stats.rows, "sync cancelled");
                Ok(SyncOutcome::Cancelled(stats))
            }
            Ok(_) => {
                tracing::info!(
                    rows = stats.rows,
                    items = stats.items,
                    duration_ms = stats.duration.as_millis() as u64,
                    "sync finished"
                );
                Ok(SyncOutcome::Completed(stats))
            }
        }
    }
}

/// Walk `tree` with the default concurrency bound.
pub async fn sync(
    cancel: &CancellationToken,
    provider: &dyn ResourceProvider,
    tree: &TableTree,
    sink: &dyn Sink,
) -> Result<SyncOutcome, SyncError> {
    Scheduler::default().sync(cancel, provider, tree, sink).await
}

/// State of one sync.
struct Run<'r> {
    tree: &'r TableTree,
    provider: &'r dyn ResourceProvider,
    sink: &'r dyn Sink,
    cancel: CancellationToken,
    permits: Semaphore,
    arena: ItemArena,
    rows: Vec<AtomicU64>,
    items: AtomicU64,
    invocations: AtomicU64,
}

impl Run<'_> {
    fn run_table<'a>(
        &'a self,
        id: TableId,
        parent: Option<ItemKey>,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        let node = self.tree.node(id);
        let span = tracing::debug_span!(
            "table",
            table = node.name(),
            parent = ?parent.map(|key| key.seq)
        );

        async move {
            if self.cancel.is_cancelled() {
                tracing::debug!("cancelled before start");
                return Ok(());
            }
            if !self.arena.claim(id, parent) {
                tracing::warn!("already resolved for this parent, skipping");
                return Ok(());
            }
            let parent_item = match parent {
                Some(key) => match self.arena.get(key) {
                    Some(item) => Some(item),
                    None => {
                        tracing::error!(seq = key.seq, "parent item no longer held, skipping");
                        return Ok(());
                    }
                },
                None => None,
            };
            let parent_ref: &(dyn Any + Send + Sync) = match &parent_item {
                Some(item) => item.item(),
                None => &(),
            };

            self.invocations.fetch_add(1, Ordering::Relaxed);
            let ctx = CollectContext {
                cancel: &self.cancel,
                provider: self.provider,
                table: node.name(),
            };
            let mut stream = node.collector.collect(ctx, parent_ref);
            let mut emitted_rows = 0u64;

            loop {
                let next = {
                    let Ok(_permit) = self.permits.acquire().await else {
                        break;
                    };
                    // cancellation may have fired while waiting for the permit
                    if self.cancel.is_cancelled() {
                        tracing::debug!("cancelled before polling");
                        break;
                    }
                    stream.next().await
                };
                let Some(next) = next else { break };
                if self.cancel.is_cancelled() {
                    tracing::debug!("cancelled, dropping remaining items");
                    break;
                }
                let item = next.map_err(|source| SyncError::Provider {
                    table: node.name().to_string(),
                    source,
                })?;
                self.items.fetch_add(1, Ordering::Relaxed);

                let (key, item) = self.arena.insert(id, item);
                let result = self.emit(id, &item, &mut emitted_rows).await;
                drop(item);
                let result = match result {
                    Ok(()) => {
                        try_join_all(
                            node.children()
                                .iter()
                                .map(|&child| self.run_table(child, Some(key))),
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };
                self.arena.release(key);
                result?;
            }

            tracing::debug!(rows = emitted_rows, "table done");
            Ok(())
        }
        .instrument(span)
        .boxed()
    }

    /// Push the rows of one held item.
    async fn emit(&self, id: TableId, item: &Emitted, emitted: &mut u64) -> Result<(), SyncError> {
        let node = self.tree.node(id);
        for row in node.rows(item.value()) {
            if self.sink.push(row).await.is_err() {
                tracing::warn!(table = node.name(), "sink refused row, cancelling");
                self.cancel.cancel();
                return Err(SyncError::SinkClosed {
                    table: node.name().to_string(),
                });
            }
            self.rows[id.index()].fetch_add(1, Ordering::Relaxed);
            *emitted += 1;
        }
        Ok(())
    }

    fn stats(&self, duration: Duration) -> SyncStats {
        let per_table: IndexMap<String, u64> = self
            .tree
            .iter()
            .map(|node| {
                (
                    node.name().to_string(),
                    self.rows[node.id().index()].load(Ordering::Relaxed),
                )
            })
            .collect();
        SyncStats {
            duration,
            rows: per_table.values().sum(),
            items: self.items.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            per_table,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{Collector, ItemStream, ListCollector};
    use crate::provider::ListFilter;
    use crate::record::{ColumnType, Datum};
    use crate::sink::MemorySink;
    use crate::table::{Column, Table};
    use crate::transform::TransformChain;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicUsize;

    /// Serves `<kind>` listings and records how many are in flight.
    #[derive(Default)]
    struct CountingProvider {
        listings: HashMap<String, Vec<Value>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<(String, ListFilter)>>,
        /// Cancel this token while listing the given kind.
        cancel_on: Option<(&'static str, CancellationToken)>,
    }

    impl CountingProvider {
        fn with(mut self, kind: &str, items: Vec<Value>) -> Self {
            self.listings.insert(kind.to_string(), items);
            self
        }
    }

    #[async_trait]
    impl crate::provider::ResourceProvider for CountingProvider {
        async fn list(&self, kind: &str, filter: &ListFilter) -> Result<Vec<Value>, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().push((kind.to_string(), filter.clone()));
            if let Some((at, token)) = &self.cancel_on {
                if *at == kind {
                    token.cancel();
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let items = self
                .listings
                .get(kind)
                .ok_or_else(|| ProviderError::transport(kind, "404 Not Found"))?;
            Ok(items.iter().filter(|v| filter.matches(v)).cloned().collect())
        }
    }

    /// Lists `kind` filtered by the parent's `id` under `key`.
    struct ByParent {
        kind: &'static str,
        key: &'static str,
    }

    impl Collector for ByParent {
        type Parent = Value;
        type Item = Value;

        fn collect<'a>(&'a self, ctx: CollectContext<'a>, parent: &'a Value) -> ItemStream<'a, Value> {
            let filter = ListFilter::new().with(self.key, parent["id"].clone());
            Box::pin(async_stream::stream! {
                match ctx.provider.list(self.kind, &filter).await {
                    Ok(items) => {
                        for item in items {
                            yield Ok(item);
                        }
                    }
                    Err(e) => yield Err(e),
                }
            })
        }
    }

    /// Emits `total` items, failing with a provider error at `fail_at`.
    struct Flaky {
        total: usize,
        fail_at: Option<usize>,
        cancel_at: Option<(usize, CancellationToken)>,
    }

    impl Collector for Flaky {
        type Parent = ();
        type Item = Value;

        fn collect<'a>(&'a self, _: CollectContext<'a>, _: &'a ()) -> ItemStream<'a, Value> {
            futures_util::stream::iter(0..self.total)
                .map(move |i| {
                    if let Some((at, token)) = &self.cancel_at {
                        if *at == i {
                            token.cancel();
                        }
                    }
                    if self.fail_at == Some(i) {
                        return Err(ProviderError::transport("volumes", "connection reset"));
                    }
                    Ok(json!({ "id": format!("vol-{i}") }))
                })
                .boxed()
        }
    }

    fn id_column() -> Column {
        Column::new("id", ColumnType::String)
    }

    fn a_b_tree() -> TableTree {
        TableTree::new([Table::builder("a", ListCollector::<Value>::new("a"))
            .column(id_column())
            .relation(
                Table::builder("b", ByParent { kind: "b", key: "a_id" })
                    .column(id_column())
                    .column(Column::new("a_id", ColumnType::String)),
            )
            .build()])
        .unwrap()
    }

    fn a_b_provider() -> CountingProvider {
        CountingProvider::default()
            .with("a", vec![json!({ "id": "a1" }), json!({ "id": "a2" })])
            .with(
                "b",
                vec![
                    json!({ "id": "b1", "a_id": "a1" }),
                    json!({ "id": "b2", "a_id": "a2" }),
                    json!({ "id": "b3", "a_id": "a1" }),
                ],
            )
    }

    fn strings(rows: &[crate::table::OutputRow], column: &str) -> Vec<String> {
        rows.iter()
            .filter_map(|r| r.get(column).and_then(Datum::as_str).map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn test_child_invoked_once_per_parent_item() {
        let provider = a_b_provider();
        let sink = MemorySink::new();
        let outcome = sync(&CancellationToken::new(), &provider, &a_b_tree(), &sink)
            .await
            .unwrap();

        let calls = provider.calls.lock().clone();
        let b_parents: Vec<_> = calls
            .iter()
            .filter(|(kind, _)| kind == "b")
            .map(|(_, f)| f.get("a_id").cloned().unwrap())
            .collect();
        assert_eq!(b_parents, vec![json!("a1"), json!("a2")]);

        let b_rows = sink.rows_for("b");
        assert_eq!(strings(&b_rows, "id"), vec!["b1", "b3", "b2"]);
        assert_eq!(strings(&b_rows, "a_id"), vec!["a1", "a1", "a2"]);

        // a1's subtree is fully streamed before a2 is processed.
        let order: Vec<_> = sink.rows().iter().map(|r| r.table.clone()).collect();
        assert_eq!(order, vec!["a", "b", "b", "a", "b"]);

        let stats = outcome.stats();
        assert!(!outcome.is_cancelled());
        assert_eq!(stats.rows, 5);
        assert_eq!(stats.invocations, 3);
        assert_eq!(stats.per_table["b"], 3);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let provider = a_b_provider();
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = sync(&cancel, &provider, &a_b_tree(), &sink).await.unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(outcome.stats().invocations, 0);
        assert!(sink.is_empty());
        assert!(provider.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_root_waiting_for_permit_does_not_list_after_cancel() {
        let cancel = CancellationToken::new();
        let provider = CountingProvider {
            cancel_on: Some(("a", cancel.clone())),
            ..CountingProvider::default()
        }
        .with("a", vec![json!({ "id": "a1" })])
        .with("b", vec![json!({ "id": "b1" })]);
        let tree = TableTree::new([
            Table::builder("a", ListCollector::<Value>::new("a"))
                .column(id_column())
                .build(),
            Table::builder("b", ListCollector::<Value>::new("b"))
                .column(id_column())
                .build(),
        ])
        .unwrap();
        let sink = MemorySink::new();

        let outcome = Scheduler::new(1)
            .unwrap()
            .sync(&cancel, &provider, &tree, &sink)
            .await
            .unwrap();
        assert!(outcome.is_cancelled());
        let kinds: Vec<String> = provider.calls.lock().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(kinds, vec!["a"]);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_delivered_rows() {
        let cancel = CancellationToken::new();
        let tree = TableTree::new([Table::builder(
            "volumes",
            Flaky {
                total: 5,
                fail_at: None,
                cancel_at: Some((2, cancel.clone())),
            },
        )
        .column(id_column())
        .build()])
        .unwrap();
        let sink = MemorySink::new();

        let outcome = sync(&cancel, &CountingProvider::default(), &tree, &sink)
            .await
            .unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(strings(&sink.rows(), "id"), vec!["vol-0", "vol-1"]);
    }

    #[tokio::test]
    async fn test_provider_failure_aborts_sync() {
        let tree = TableTree::new([
            Table::builder(
                "volumes",
                Flaky {
                    total: 10,
                    fail_at: Some(3),
                    cancel_at: None,
                },
            )
            .column(id_column())
            .build(),
            Table::builder("later", ListCollector::<Value>::new("later"))
                .column(id_column())
                .build(),
        ])
        .unwrap();
        let provider = CountingProvider::default().with("later", vec![json!({ "id": "x" })]);
        let sink = MemorySink::new();

        let err = Scheduler::new(1)
            .unwrap()
            .sync(&CancellationToken::new(), &provider, &tree, &sink)
            .await
            .unwrap_err();
        assert_eq!(err.table(), "volumes");
        assert!(matches!(err, SyncError::Provider { .. }));
        assert_eq!(strings(&sink.rows_for("volumes"), "id"), vec!["vol-0", "vol-1", "vol-2"]);
        assert!(sink.rows_for("later").is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_bound_holds_on_nested_tree() {
        let roots = ["r1", "r2", "r3"].map(|name| {
            Table::builder(name, ListCollector::<Value>::new("roots"))
                .column(id_column())
                .relation(
                    Table::builder(format!("{name}_children"), ByParent { kind: "children", key: "root" })
                        .column(id_column()),
                )
                .build()
        });
        let tree = TableTree::new(roots).unwrap();
        let provider = CountingProvider::default()
            .with("roots", vec![json!({ "id": "x" }), json!({ "id": "y" })])
            .with(
                "children",
                vec![json!({ "id": "c1", "root": "x" }), json!({ "id": "c2", "root": "y" })],
            );

        let sink = MemorySink::new();
        let outcome = Scheduler::new(1)
            .unwrap()
            .sync(&CancellationToken::new(), &provider, &tree, &sink)
            .await
            .unwrap();
        assert_eq!(provider.peak.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.stats().rows, 12);

        let provider = CountingProvider {
            peak: AtomicUsize::new(0),
            ..provider
        };
        let sink = MemorySink::new();
        Scheduler::new(3)
            .unwrap()
            .sync(&CancellationToken::new(), &provider, &tree, &sink)
            .await
            .unwrap();
        assert!(provider.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(sink.len(), 12);
    }

    #[tokio::test]
    async fn test_sink_closed_stops_sync() {
        let tree = TableTree::new([Table::builder(
            "volumes",
            Flaky {
                total: 5,
                fail_at: None,
                cancel_at: None,
            },
        )
        .column(id_column())
        .build()])
        .unwrap();
        let sink = MemorySink::with_limit(2);
        let cancel = CancellationToken::new();

        let err = sync(&cancel, &CountingProvider::default(), &tree, &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SinkClosed { ref table } if table == "volumes"));
        assert_eq!(sink.len(), 2);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_unnested_item_with_no_rows_still_resolves_children() {
        let tree = TableTree::new([Table::builder("a", ListCollector::<Value>::new("a"))
            .unnest(TransformChain::path("missing"))
            .column(id_column())
            .relation(
                Table::builder("b", ByParent { kind: "b", key: "a_id" }).column(id_column()),
            )
            .build()])
        .unwrap();
        let sink = MemorySink::new();
        sync(&CancellationToken::new(), &a_b_provider(), &tree, &sink)
            .await
            .unwrap();
        assert!(sink.rows_for("a").is_empty());
        assert_eq!(sink.rows_for("b").len(), 3);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(matches!(
            Scheduler::new(0),
            Err(ConfigurationError::InvalidConcurrency(0))
        ));
        assert_eq!(Scheduler::default().max_concurrency(), 16);
    }

    #[test]
    fn test_arena_claims_once_and_releases() {
        let tree = a_b_tree();
        let arena = ItemArena::new(tree.len());
        let a = tree.find("a").unwrap().id();
        let b = tree.find("b").unwrap().id();

        let (first, _) = arena.insert(a, Emitted::new(json!({ "id": "a1" })));
        let (second, _) = arena.insert(a, Emitted::new(json!({ "id": "a2" })));
        assert_ne!(first, second);
        assert!(arena.claim(b, Some(first)));
        assert!(!arena.claim(b, Some(first)));
        assert!(arena.claim(b, Some(second)));

        assert_eq!(arena.claimed(), 2);

        assert_eq!(arena.get(first).unwrap().value()["id"], "a1");
        arena.release(first);
        assert_eq!(arena.claimed(), 1);
        arena.release(second);
        assert_eq!(arena.live(), 0);
        assert_eq!(arena.claimed(), 0);
    }
}
