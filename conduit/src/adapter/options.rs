use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::filter::Filter;
use crate::bail;
use crate::error::{ConduitResult, ErrorKind};
use crate::types::{Record, Schema};

pub const DEFAULT_WRITE_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderBy {
    /// Creates an ascending order on `column`.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    /// Creates a descending order on `column`.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
    Right,
    Full,
}

/// `left = right`, both sides being column references such as `orders.user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCondition {
    pub left: String,
    pub right: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    #[serde(default)]
    pub kind: JoinKind,
    pub namespace: String,
    pub table: String,
    #[serde(default)]
    pub alias: Option<String>,
    pub on: Vec<JoinCondition>,
}

/// Options of [`Adapter::read_data`](crate::adapter::Adapter::read_data).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadOptions {
    /// Selected columns. Empty selects every column.
    pub columns: Vec<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub group_by: Vec<String>,
    /// Applied to the grouped rows, combined with AND.
    pub having: Vec<Filter>,
    pub joins: Vec<Join>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub include_total_count: bool,
}

impl ReadOptions {
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Limits the read to `limit` records.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` records.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    pub rows: Vec<Record>,
    pub row_count: usize,
    /// Rows matching the filters regardless of limit and offset, when requested.
    pub total_count: Option<u64>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Insert,
    Update,
    Upsert,
    /// Deletes the rows matching the conflict columns of the batch, then inserts.
    Replace,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Insert => "insert",
            WriteMode::Update => "update",
            WriteMode::Upsert => "upsert",
            WriteMode::Replace => "replace",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
    #[default]
    Error,
    Ignore,
    Update,
}

/// Options of [`Adapter::write_data`](crate::adapter::Adapter::write_data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteOptions {
    pub mode: WriteMode,
    pub batch_size: usize,
    pub conflict_columns: Vec<String>,
    /// Columns set by `upsert` and `update`. Empty means every non-conflict column.
    pub update_columns: Vec<String>,
    /// Columns whose per-row values identify the row in `update` mode.
    pub where_columns: Vec<String>,
    /// Static predicates added to every `update`.
    #[serde(rename = "whereConditions")]
    pub where_filters: Vec<Filter>,
    /// Columns returned for every written row.
    pub returning: Vec<String>,
    /// Conflict handling of `insert`.
    pub on_conflict: OnConflict,
    pub validate_schema: bool,
    /// Runs the whole call in one transaction.
    pub transaction: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            mode: WriteMode::Insert,
            batch_size: DEFAULT_WRITE_BATCH_SIZE,
            conflict_columns: Vec::new(),
            update_columns: Vec::new(),
            where_columns: Vec::new(),
            where_filters: Vec::new(),
            returning: Vec::new(),
            on_conflict: OnConflict::Error,
            validate_schema: false,
            transaction: false,
        }
    }
}

impl WriteOptions {
    /// Creates upsert options keyed on `conflict_columns`.
    pub fn upsert<I, S>(conflict_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: WriteMode::Upsert,
            conflict_columns: conflict_columns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Batch size used for chunking, never zero.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    /// Columns identifying a row on conflict, defaulting to the primary key of `schema`.
    pub fn conflict_target(&self, schema: &Schema) -> Vec<String> {
        if self.conflict_columns.is_empty() {
            schema.primary_keys.clone()
        } else {
            self.conflict_columns.clone()
        }
    }

    /// Rejects combinations that cannot identify the rows to change.
    pub fn check(&self, conflict_target: &[String]) -> ConduitResult<()> {
        match self.mode {
            WriteMode::Upsert | WriteMode::Replace if conflict_target.is_empty() => bail!(
                ErrorKind::QueryInvalid,
                "Write mode requires conflict columns",
                self.mode.as_str()
            ),
            WriteMode::Update
                if self.where_columns.is_empty()
                    && conflict_target.is_empty()
                    && self.where_filters.is_empty() =>
            {
                bail!(ErrorKind::QueryInvalid, "Update requires a where clause")
            }
            _ => Ok(()),
        }
    }

    /// Columns matching each row in `update` mode.
    pub fn update_keys<'a>(&'a self, conflict_target: &'a [String]) -> &'a [String] {
        if self.where_columns.is_empty() {
            conflict_target
        } else {
            &self.where_columns
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub written: u64,
    /// Rows produced by `returning`.
    pub data: Option<Vec<Record>>,
    pub batches: usize,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl WriteResult {
    /// Adds the counts and returned rows of `other`.
    pub fn merge(&mut self, other: WriteResult) {
        self.written += other.written;
        self.batches += other.batches;
        if let Some(rows) = other.data {
            self.data.get_or_insert_with(Vec::new).extend(rows);
        }
        self.metadata.extend(other.metadata);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub name: String,
    pub native_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub rows: Vec<Record>,
    pub row_count: u64,
    pub fields: Vec<FieldInfo>,
    /// Leading keyword of the statement, e.g. `SELECT`.
    pub command: String,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

/// Options of [`Adapter::discover_schemas`](crate::adapter::Adapter::discover_schemas).
///
/// Functions and sequences are not containers of records, so adapters accept the flags
/// and return no schema for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoverOptions {
    pub namespace: Option<String>,
    /// SQL `LIKE` pattern on the container name.
    pub name_pattern: Option<String>,
    pub include_views: bool,
    pub include_functions: bool,
    pub include_sequences: bool,
    pub include_indexes: bool,
    pub limit: Option<usize>,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            name_pattern: None,
            include_views: true,
            include_functions: false,
            include_sequences: false,
            include_indexes: false,
            limit: None,
        }
    }
}

impl DiscoverOptions {
    /// Creates options limited to one namespace.
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetadata {
    pub system_id: String,
    pub system_type: String,
    pub version: Option<String>,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
