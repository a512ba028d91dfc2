//! Table declarations and the table tree.
//!
//! Tables are declared with a typed [`TableBuilder`]; a relation can only be
//! attached to a table whose item type is the relation collector's parent
//! type. Building erases the types and [`TableTree::new`] flattens the
//! declarations into an arena of [`TableNode`]s indexed by [`TableId`].

use crate::collector::{Collector, ErasedCollector, Typed};
use crate::pattern::PatternSet;
use crate::record::{ColumnType, Datum, Record};
use crate::transform::{Step, TransformChain};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Errors raised while building a table tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("table name must not be empty")]
    EmptyName,

    #[error("duplicate table name '{0}'")]
    DuplicateTable(String),

    #[error("table '{table}' declares column '{column}' more than once")]
    DuplicateColumn { table: String, column: String },

    #[error("table '{table}' names unknown primary key column '{column}'")]
    UnknownPrimaryKey { table: String, column: String },

    #[error("table '{table}' skips unknown field '{field}'")]
    UnknownField { table: String, field: String },
}

// ============================================
// Columns and rows
// ============================================

/// An output column: a name, a type, and the chain extracting its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub extract: TransformChain,
    pub description: Option<String>,
    pub primary_key: bool,
}

impl Column {
    /// A column reading the top-level key of the same name.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        let name = name.into();
        Self {
            extract: TransformChain::new().then(Step::get_map_entry(name.clone())),
            name,
            ty,
            description: None,
            primary_key: false,
        }
    }

    pub fn extract(mut self, chain: TransformChain) -> Self {
        self.extract = chain;
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Evaluate this column against a serialized item.
    pub fn evaluate(&self, item: &Value) -> Datum {
        self.ty.coerce(self.extract.apply(item))
    }
}

/// A flattened, typed record bound for the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRow {
    pub table: String,
    pub values: IndexMap<String, Datum>,
}

impl OutputRow {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: IndexMap::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Datum> {
        self.values.get(column)
    }
}

/// Evaluate every column against one item. Pure: same input, same row.
pub fn materialize(table: &str, item: &Value, columns: &[Column]) -> OutputRow {
    OutputRow {
        table: table.to_string(),
        values: columns
            .iter()
            .map(|column| (column.name.clone(), column.evaluate(item)))
            .collect(),
    }
}

// ============================================
// Declarations
// ============================================

/// A built table declaration, ready to be placed in a [`TableTree`].
pub struct Table {
    name: String,
    description: Option<String>,
    collector: Arc<dyn ErasedCollector>,
    columns: Vec<Column>,
    primary_keys: Vec<String>,
    unnest: Option<TransformChain>,
    unknown_skips: Vec<String>,
    relations: Vec<Table>,
}

impl Table {
    /// Start declaring a table collected by `collector`.
    pub fn builder<C: Collector>(
        name: impl Into<String>,
        collector: C,
    ) -> TableBuilder<C::Parent, C::Item> {
        TableBuilder {
            name: name.into(),
            description: None,
            collector: Arc::new(Typed(collector)),
            columns: Vec::new(),
            skip: Vec::new(),
            primary_keys: Vec::new(),
            unnest: None,
            relations: Vec::new(),
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("columns", &self.columns.len())
            .field("relations", &self.relations)
            .finish_non_exhaustive()
    }
}

/// Typed table declaration: `P` is the parent item type, `T` the item type.
pub struct TableBuilder<P, T> {
    name: String,
    description: Option<String>,
    collector: Arc<dyn ErasedCollector>,
    columns: Vec<Column>,
    skip: Vec<String>,
    primary_keys: Vec<String>,
    unnest: Option<TransformChain>,
    relations: Vec<Table>,
    _types: PhantomData<fn(&P) -> T>,
}

impl<P: Send + Sync + 'static, T: Record> TableBuilder<P, T> {
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Declare an explicit column. Replaces a derived column of the same name.
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Leave fields out of the derived columns, by serialized key or column name.
    pub fn skip_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn primary_keys<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys
            .extend(columns.into_iter().map(Into::into));
        self
    }

    /// Fan each item out into one row per element of `chain`'s result.
    ///
    /// A `null` or empty result yields no rows; any other scalar or object
    /// yields exactly one. Children still receive the whole item.
    pub fn unnest(mut self, chain: TransformChain) -> Self {
        self.unnest = Some(chain);
        self
    }

    /// Attach a relation table collected once per item of this table.
    pub fn relation<U: Record>(mut self, child: TableBuilder<T, U>) -> Self {
        self.relations.push(child.finish());
        self
    }

    fn finish(self) -> Table {
        let shape = T::shape();
        let unknown_skips = self
            .skip
            .iter()
            .filter(|s| !shape.fields().iter().any(|f| f.key == *s || f.name == *s))
            .cloned()
            .collect();

        let mut columns: Vec<Column> = shape
            .fields()
            .iter()
            .filter(|f| !self.skip.iter().any(|s| s == f.key || s == f.name))
            .map(|f| Column {
                extract: TransformChain::new().then(Step::get_map_entry(f.key)),
                ..Column::new(f.name, f.ty)
            })
            .collect();

        // an explicit column replaces a derived one at most once; a second
        // explicit column of the same name is kept and rejected by validation
        let mut overridden = vec![false; columns.len()];
        for explicit in self.columns {
            let derived = columns
                .iter()
                .zip(&overridden)
                .position(|(c, done)| !done && c.name == explicit.name);
            match derived {
                Some(i) => {
                    columns[i] = explicit;
                    overridden[i] = true;
                }
                None => columns.push(explicit),
            }
        }
        for column in &mut columns {
            column.primary_key = self.primary_keys.contains(&column.name);
        }

        Table {
            name: self.name,
            description: self.description,
            collector: self.collector,
            columns,
            primary_keys: self.primary_keys,
            unnest: self.unnest,
            unknown_skips,
            relations: self.relations,
        }
    }
}

impl<T: Record> TableBuilder<(), T> {
    /// Finish a root table declaration.
    pub fn build(self) -> Table {
        self.finish()
    }
}

/// Root table declarations, registered in declaration order.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: Vec<Table>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, table: Table) {
        self.tables.push(table);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Validate and flatten into a tree.
    pub fn build(self) -> Result<TableTree, SchemaError> {
        TableTree::new(self.tables)
    }
}

// ============================================
// Tree
// ============================================

/// Index of a table within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(usize);

impl TableId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A table within a tree.
#[derive(Clone)]
pub struct TableNode {
    id: TableId,
    name: String,
    description: Option<String>,
    pub(crate) collector: Arc<dyn ErasedCollector>,
    columns: Vec<Column>,
    primary_keys: Vec<String>,
    unnest: Option<TransformChain>,
    parent: Option<TableId>,
    children: Vec<TableId>,
}

impl TableNode {
    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn parent(&self) -> Option<TableId> {
        self.parent
    }

    pub fn children(&self) -> &[TableId] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Rows produced by one item of this table.
    pub fn rows(&self, item: &Value) -> Vec<OutputRow> {
        let Some(chain) = &self.unnest else {
            return vec![materialize(&self.name, item, &self.columns)];
        };
        match chain.apply(item) {
            Value::Null => Vec::new(),
            Value::Array(elements) => elements
                .iter()
                .map(|element| materialize(&self.name, element, &self.columns))
                .collect(),
            other => vec![materialize(&self.name, &other, &self.columns)],
        }
    }
}

impl fmt::Debug for TableNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

/// A validated forest of tables. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct TableTree {
    nodes: Vec<TableNode>,
    roots: Vec<TableId>,
}

impl TableTree {
    /// Flatten root declarations into a tree.
    ///
    /// Rejects duplicate table names anywhere in the forest, duplicate
    /// columns, unknown primary keys and unknown skipped fields.
    pub fn new(tables: impl IntoIterator<Item = Table>) -> Result<Self, SchemaError> {
        let mut tree = TableTree::default();
        let mut seen = IndexSet::new();
        for table in tables {
            let id = tree.insert(table, None, &mut seen)?;
            tree.roots.push(id);
        }
        Ok(tree)
    }

    fn insert(
        &mut self,
        table: Table,
        parent: Option<TableId>,
        seen: &mut IndexSet<String>,
    ) -> Result<TableId, SchemaError> {
        validate(&table)?;
        if !seen.insert(table.name.clone()) {
            return Err(SchemaError::DuplicateTable(table.name));
        }

        let id = TableId(self.nodes.len());
        self.nodes.push(TableNode {
            id,
            name: table.name,
            description: table.description,
            collector: table.collector,
            columns: table.columns,
            primary_keys: table.primary_keys,
            unnest: table.unnest,
            parent,
            children: Vec::new(),
        });
        for relation in table.relations {
            let child = self.insert(relation, Some(id), seen)?;
            self.nodes[id.0].children.push(child);
        }
        Ok(id)
    }

    /// Root tables in declaration order.
    pub fn roots(&self) -> &[TableId] {
        &self.roots
    }

    pub fn get(&self, id: TableId) -> Option<&TableNode> {
        self.nodes.get(id.0)
    }

    pub(crate) fn node(&self, id: TableId) -> &TableNode {
        &self.nodes[id.0]
    }

    pub fn find(&self, name: &str) -> Option<&TableNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Every table, parents before children, siblings in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &TableNode> {
        self.nodes.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Name of the parent table, if any.
    pub fn parent_name(&self, id: TableId) -> Option<&str> {
        self.get(id)?.parent.map(|p| self.node(p).name())
    }

    /// Number of ancestors.
    pub fn depth(&self, id: TableId) -> usize {
        std::iter::successors(self.get(id).and_then(|n| n.parent), |p| self.node(*p).parent)
            .count()
    }

    /// A new tree holding only the tables active under `patterns`.
    ///
    /// Dropping a table drops all of its descendants.
    pub fn filter(&self, patterns: &PatternSet) -> TableTree {
        let mut out = TableTree::default();
        let mut ancestors = Vec::new();
        for &root in &self.roots {
            if let Some(id) = self.copy_active(root, None, &mut ancestors, patterns, &mut out) {
                out.roots.push(id);
            }
        }
        out
    }

    fn copy_active<'t>(
        &'t self,
        id: TableId,
        parent: Option<TableId>,
        ancestors: &mut Vec<&'t str>,
        patterns: &PatternSet,
        out: &mut TableTree,
    ) -> Option<TableId> {
        let node = self.node(id);
        if !patterns.is_active(&node.name, ancestors) {
            tracing::debug!(table = %node.name, "table not active, dropping subtree");
            return None;
        }

        let new_id = TableId(out.nodes.len());
        out.nodes.push(TableNode {
            id: new_id,
            parent,
            children: Vec::new(),
            ..node.clone()
        });
        ancestors.push(&node.name);
        for &child in &node.children {
            if let Some(child_id) = self.copy_active(child, Some(new_id), ancestors, patterns, out) {
                out.nodes[new_id.0].children.push(child_id);
            }
        }
        ancestors.pop();
        Some(new_id)
    }
}

fn validate(table: &Table) -> Result<(), SchemaError> {
    if table.name.trim().is_empty() {
        return Err(SchemaError::EmptyName);
    }
    if let Some(field) = table.unknown_skips.first() {
        return Err(SchemaError::UnknownField {
            table: table.name.clone(),
            field: field.clone(),
        });
    }
    let mut names = IndexSet::new();
    for column in &table.columns {
        if !names.insert(column.name.as_str()) {
            return Err(SchemaError::DuplicateColumn {
                table: table.name.clone(),
                column: column.name.clone(),
            });
        }
    }
    if let Some(key) = table.primary_keys.iter().find(|k| !names.contains(k.as_str())) {
        return Err(SchemaError::UnknownPrimaryKey {
            table: table.name.clone(),
            column: key.clone(),
        });
    }
    Ok(())
}
