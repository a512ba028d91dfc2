//! Canopy: hierarchical resource synchronization engine
//!
//! Canopy walks a tree of tables, calling each table's collector against a
//! resource provider and re-invoking child collectors once per parent item.
//! Every item is flattened into typed output rows by declarative transform
//! chains and pushed to a sink.

mod collector;
mod config;
mod pattern;
mod provider;
mod record;
mod scheduler;
mod sink;
mod table;
mod transform;

pub use collector::{CollectContext, Collector, FromParent, ItemStream, ListCollector};
pub use config::{SyncConfig, format_for_path, load_document, parse_document};
pub use pattern::{ConfigurationError, PatternSet};
pub use provider::{ListFilter, ProviderError, ResourceProvider, decode, list_as};
pub use record::{ColumnType, Datum, Field, Record, Shape, parse_timestamp};
pub use scheduler::{Scheduler, SyncError, SyncOutcome, SyncStats, sync};
pub use sink::{MemorySink, Sink, SinkClosed};
pub use table::{
    Catalog, Column, OutputRow, SchemaError, Table, TableBuilder, TableId, TableNode, TableTree,
    materialize,
};
pub use transform::{Step, TransformChain};

// Re-exported so collector crates use the same token type.
pub use tokio_util::sync::CancellationToken;
