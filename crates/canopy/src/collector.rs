//! Collectors: the per-table functions that stream raw items.
//!
//! A collector is statically typed by the item type of its parent table
//! (`()` for roots). The table builder only accepts a relation whose
//! collector's parent type equals the enclosing table's item type, so the
//! scheduler can hand each child the exact item it was declared against.

use crate::provider::{ListFilter, ProviderError, ResourceProvider, decode};
use crate::record::Record;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A lazy sequence of items produced by a collector.
pub type ItemStream<'a, T> = BoxStream<'a, Result<T, ProviderError>>;

/// What a collector gets to work with for one invocation.
#[derive(Clone, Copy)]
pub struct CollectContext<'a> {
    /// Run-wide cancellation; collectors stop emitting once it fires.
    pub cancel: &'a CancellationToken,
    /// Shared, read-only provider.
    pub provider: &'a dyn ResourceProvider,
    /// Name of the table being collected, for logging.
    pub table: &'a str,
}

impl CollectContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Streams the items of one table, optionally scoped by a parent item.
pub trait Collector: Send + Sync + 'static {
    /// Item type of the enclosing table, `()` for root tables.
    type Parent: Send + Sync + 'static;
    /// Item type this collector emits.
    type Item: Record;

    fn collect<'a>(
        &'a self,
        ctx: CollectContext<'a>,
        parent: &'a Self::Parent,
    ) -> ItemStream<'a, Self::Item>;
}

/// An emitted item together with its serialized form.
///
/// Never mutated after emission: the transform engine reads `value`,
/// child collectors read `item`.
pub struct Emitted {
    item: Arc<dyn Any + Send + Sync>,
    value: Value,
}

impl Emitted {
    pub(crate) fn new<T: Record>(item: T) -> Self {
        let value = serde_json::to_value(&item).unwrap_or_else(|e| {
            tracing::warn!(error = %e, item = std::any::type_name::<T>(), "item does not serialize; columns will be null");
            Value::Null
        });
        Self {
            item: Arc::new(item),
            value,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub(crate) fn item(&self) -> &(dyn Any + Send + Sync) {
        self.item.as_ref()
    }
}

/// Collector with its item and parent types erased, as stored in the tree.
pub(crate) trait ErasedCollector: Send + Sync {
    fn collect<'a>(
        &'a self,
        ctx: CollectContext<'a>,
        parent: &'a (dyn Any + Send + Sync),
    ) -> ItemStream<'a, Emitted>;
}

pub(crate) struct Typed<C>(pub C);

impl<C: Collector> ErasedCollector for Typed<C> {
    fn collect<'a>(
        &'a self,
        ctx: CollectContext<'a>,
        parent: &'a (dyn Any + Send + Sync),
    ) -> ItemStream<'a, Emitted> {
        match parent.downcast_ref::<C::Parent>() {
            Some(parent) => self
                .0
                .collect(ctx, parent)
                .map(|item| item.map(Emitted::new))
                .boxed(),
            None => {
                let kind = ctx.table.to_string();
                futures_util::stream::once(async move { Err(ProviderError::ParentType { kind }) })
                    .boxed()
            }
        }
    }
}

/// Root collector that lists one resource kind and decodes every record.
pub struct ListCollector<T> {
    kind: &'static str,
    filter: ListFilter,
    _item: PhantomData<fn() -> T>,
}

impl<T> ListCollector<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            filter: ListFilter::new(),
            _item: PhantomData,
        }
    }

    pub fn with_filter(mut self, filter: ListFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl<T: Record + DeserializeOwned> Collector for ListCollector<T> {
    type Parent = ();
    type Item = T;

    fn collect<'a>(&'a self, ctx: CollectContext<'a>, _parent: &'a ()) -> ItemStream<'a, T> {
        Box::pin(async_stream::stream! {
            if ctx.is_cancelled() {
                tracing::debug!(table = ctx.table, "cancelled, not listing");
            } else {
                match ctx.provider.list(self.kind, &self.filter).await {
                    Err(e) => {
                        tracing::error!(table = ctx.table, error = %e, "listing failed");
                        yield Err(e);
                    }
                    Ok(records) => {
                        tracing::debug!(table = ctx.table, count = records.len(), "records retrieved");
                        for record in records {
                            if ctx.is_cancelled() {
                                tracing::debug!(table = ctx.table, "cancelled, stop streaming");
                                break;
                            }
                            let item: Result<T, ProviderError> = decode(self.kind, record);
                            yield item;
                        }
                    }
                }
            }
        })
    }
}

/// Relation collector deriving its items from the parent item alone.
///
/// The parent already carries everything the child needs, so no listing
/// is made.
pub struct FromParent<P, T> {
    derive: fn(&P) -> Vec<T>,
}

impl<P, T> FromParent<P, T> {
    pub fn new(derive: fn(&P) -> Vec<T>) -> Self {
        Self { derive }
    }
}

impl<P: Send + Sync + 'static, T: Record> Collector for FromParent<P, T> {
    type Parent = P;
    type Item = T;

    fn collect<'a>(&'a self, ctx: CollectContext<'a>, parent: &'a P) -> ItemStream<'a, T> {
        let items = (self.derive)(parent);
        tracing::debug!(table = ctx.table, count = items.len(), "items derived from parent");
        futures_util::stream::iter(items.into_iter().map(Ok)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::TryStreamExt;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Flavor {
        id: String,
        ram: i64,
    }

    impl Record for Flavor {
        fn shape() -> crate::record::Shape {
            crate::record::Shape::new()
        }
    }

    struct StaticProvider;

    #[async_trait]
    impl ResourceProvider for StaticProvider {
        async fn list(&self, kind: &str, _: &ListFilter) -> Result<Vec<Value>, ProviderError> {
            match kind {
                "compute.flavors" => Ok(vec![
                    json!({ "id": "small", "ram": 512 }),
                    json!({ "id": "large", "ram": 8192 }),
                ]),
                "compute.broken" => Ok(vec![json!({ "id": 1 })]),
                other => Err(ProviderError::transport(other, "503 Service Unavailable")),
            }
        }
    }

    fn ctx<'a>(cancel: &'a CancellationToken) -> CollectContext<'a> {
        CollectContext {
            cancel,
            provider: &StaticProvider,
            table: "flavors",
        }
    }

    #[tokio::test]
    async fn test_list_collector_decodes_items() {
        let cancel = CancellationToken::new();
        let collector = ListCollector::<Flavor>::new("compute.flavors");
        let items: Vec<Flavor> = collector.collect(ctx(&cancel), &()).try_collect().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].ram, 8192);
    }

    #[tokio::test]
    async fn test_list_collector_skips_listing_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // a listing of this kind would fail, so an empty result means no call was made
        let collector = ListCollector::<Flavor>::new("compute.missing");
        let items: Vec<Flavor> = collector.collect(ctx(&cancel), &()).try_collect().await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_list_collector_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let collector = ListCollector::<Flavor>::new("compute.flavors");
        let items: Vec<Flavor> = collector.collect(ctx(&cancel), &()).try_collect().await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_list_collector_surfaces_errors() {
        let cancel = CancellationToken::new();
        let failing = ListCollector::<Flavor>::new("compute.missing");
        let err = failing
            .collect(ctx(&cancel), &())
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transport { .. }));

        let broken = ListCollector::<Flavor>::new("compute.broken");
        let err = broken
            .collect(ctx(&cancel), &())
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_from_parent_derives_items() {
        let cancel = CancellationToken::new();
        let parent = Flavor {
            id: "small".into(),
            ram: 512,
        };
        let collector = FromParent::new(|f: &Flavor| vec![json!(f.id), json!(f.ram)]);
        let items: Vec<Value> = collector.collect(ctx(&cancel), &parent).try_collect().await.unwrap();
        assert_eq!(items, vec![json!("small"), json!(512)]);
    }

    #[tokio::test]
    async fn test_erased_collector_rejects_wrong_parent() {
        let cancel = CancellationToken::new();
        let erased = Typed(ListCollector::<Flavor>::new("compute.flavors"));
        let wrong_parent: u32 = 7;
        let err = erased
            .collect(ctx(&cancel), &wrong_parent)
            .try_collect::<Vec<_>>()
            .await
            .err();
        assert!(matches!(err, Some(ProviderError::ParentType { .. })));
    }
}
