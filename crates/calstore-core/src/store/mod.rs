//! The storage collaborator contract.
//!
//! A [`Store`] applies a batch of write operations atomically and resolves
//! back-references inside the batch. When a batch exceeds what the store can take in
//! one transaction it reports [`StoreError::TransactionTooLarge`] and changes nothing.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Transaction too large: {operations} operations, {bytes} bytes")]
    TransactionTooLarge { operations: usize, bytes: usize },

    #[error("Operation rejected: {0}")]
    Rejected(String),

    #[error("Database error")]
    Database(#[from] sqlx::Error),
}

// ============================================================================
// Tables and columns
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Events,
    Reminders,
    Attendees,
    ExtendedProperties,
    Tasks,
    TaskProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
}

use ColumnType::{Integer, Text};

/// Name of the identifier column every table has.
pub const ID_COLUMN: &str = "_id";

const EVENT_COLUMNS: &[(&str, ColumnType)] = &[
    ("uid", Text),
    ("sequence", Integer),
    ("original_sync_id", Text),
    ("original_id", Integer),
    ("original_instance_time", Integer),
    ("original_instance_timezone", Text),
    ("original_all_day", Integer),
    ("dtstart", Integer),
    ("dtend", Integer),
    ("duration", Text),
    ("event_timezone", Text),
    ("event_end_timezone", Text),
    ("all_day", Integer),
    ("rrule", Text),
    ("exrule", Text),
    ("rdate", Text),
    ("exdate", Text),
    ("title", Text),
    ("event_location", Text),
    ("description", Text),
    ("access_level", Integer),
    ("availability", Integer),
    ("status", Integer),
    ("organizer", Text),
    ("has_attendee_data", Integer),
];

const REMINDER_COLUMNS: &[(&str, ColumnType)] = &[
    ("event_id", Integer),
    ("minutes", Integer),
    ("method", Integer),
];

const ATTENDEE_COLUMNS: &[(&str, ColumnType)] = &[
    ("event_id", Integer),
    ("attendee_name", Text),
    ("attendee_email", Text),
    ("attendee_id_namespace", Text),
    ("attendee_identity", Text),
    ("attendee_relationship", Integer),
    ("attendee_type", Integer),
    ("attendee_status", Integer),
];

const EXTENDED_PROPERTY_COLUMNS: &[(&str, ColumnType)] = &[
    ("event_id", Integer),
    ("name", Text),
    ("value", Text),
];

const TASK_COLUMNS: &[(&str, ColumnType)] = &[
    ("uid", Text),
    ("sequence", Integer),
    ("original_sync_id", Text),
    ("original_id", Integer),
    ("original_instance_time", Integer),
    ("original_instance_timezone", Text),
    ("original_all_day", Integer),
    ("title", Text),
    ("location", Text),
    ("description", Text),
    ("url", Text),
    ("organizer", Text),
    ("geo", Text),
    ("priority", Integer),
    ("classification", Integer),
    ("status", Integer),
    ("completed", Integer),
    ("percent_complete", Integer),
    ("dtstart", Integer),
    ("due", Integer),
    ("duration", Text),
    ("is_allday", Integer),
    ("tz", Text),
    ("rrule", Text),
    ("exrule", Text),
    ("rdate", Text),
    ("exdate", Text),
    ("created", Integer),
    ("last_modified", Integer),
];

const TASK_PROPERTY_COLUMNS: &[(&str, ColumnType)] = &[
    ("task_id", Integer),
    ("mimetype", Text),
    ("data0", Text),
    ("data1", Text),
    ("data2", Text),
    ("data3", Text),
    ("data4", Text),
];

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Events,
        Table::Reminders,
        Table::Attendees,
        Table::ExtendedProperties,
        Table::Tasks,
        Table::TaskProperties,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Events => "events",
            Table::Reminders => "reminders",
            Table::Attendees => "attendees",
            Table::ExtendedProperties => "extended_properties",
            Table::Tasks => "tasks",
            Table::TaskProperties => "task_properties",
        }
    }

    /// Columns other than [`ID_COLUMN`], with their storage type.
    pub fn columns(&self) -> &'static [(&'static str, ColumnType)] {
        match self {
            Table::Events => EVENT_COLUMNS,
            Table::Reminders => REMINDER_COLUMNS,
            Table::Attendees => ATTENDEE_COLUMNS,
            Table::ExtendedProperties => EXTENDED_PROPERTY_COLUMNS,
            Table::Tasks => TASK_COLUMNS,
            Table::TaskProperties => TASK_PROPERTY_COLUMNS,
        }
    }

    pub fn column_type(&self, column: &str) -> Option<ColumnType> {
        if column == ID_COLUMN {
            return Some(ColumnType::Integer);
        }
        self.columns()
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, ty)| *ty)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowValue {
    Null,
    Integer(i64),
    Text(String),
}

impl RowValue {
    fn estimated_size(&self) -> usize {
        match self {
            RowValue::Null => 1,
            RowValue::Integer(_) => 8,
            RowValue::Text(text) => text.len(),
        }
    }
}

impl From<i64> for RowValue {
    fn from(value: i64) -> Self {
        RowValue::Integer(value)
    }
}

impl From<i32> for RowValue {
    fn from(value: i32) -> Self {
        RowValue::Integer(i64::from(value))
    }
}

impl From<u8> for RowValue {
    fn from(value: u8) -> Self {
        RowValue::Integer(i64::from(value))
    }
}

impl From<bool> for RowValue {
    fn from(value: bool) -> Self {
        RowValue::Integer(i64::from(value))
    }
}

impl From<String> for RowValue {
    fn from(value: String) -> Self {
        RowValue::Text(value)
    }
}

impl From<&str> for RowValue {
    fn from(value: &str) -> Self {
        RowValue::Text(value.to_string())
    }
}

/// Column values of one row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Values(BTreeMap<String, RowValue>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: &str, value: impl Into<RowValue>) -> &mut Self {
        self.0.insert(column.to_string(), value.into());
        self
    }

    /// Puts the value, or NULL when absent.
    pub fn put_opt<T: Into<RowValue>>(&mut self, column: &str, value: Option<T>) -> &mut Self {
        let value = value.map_or(RowValue::Null, Into::into);
        self.0.insert(column.to_string(), value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&RowValue> {
        self.0.get(column)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        match self.0.get(column) {
            Some(RowValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn integer(&self, column: &str) -> Option<i64> {
        match self.0.get(column) {
            Some(RowValue::Integer(value)) => Some(*value),
            Some(RowValue::Text(text)) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn flag(&self, column: &str) -> bool {
        self.integer(column).map_or(false, |v| v != 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RowValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rough payload size, used for transaction size limits.
    pub fn estimated_size(&self) -> usize {
        self.0
            .iter()
            .map(|(column, value)| column.len() + value.estimated_size())
            .sum()
    }
}

impl<K: Into<String>, V: Into<RowValue>> FromIterator<(K, V)> for Values {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Values(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Equality condition on one column. A `Null` value matches NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub column: String,
    pub value: RowValue,
}

impl Selection {
    pub fn equals(column: &str, value: impl Into<RowValue>) -> Self {
        Self {
            column: column.to_string(),
            value: value.into(),
        }
    }

    pub fn is_null(column: &str) -> Self {
        Self {
            column: column.to_string(),
            value: RowValue::Null,
        }
    }

    pub fn matches(&self, values: &Values, id: i64) -> bool {
        let actual = if self.column == ID_COLUMN {
            Some(RowValue::Integer(id))
        } else {
            values.get(&self.column).cloned()
        };
        match (&self.value, actual) {
            (RowValue::Null, None) | (RowValue::Null, Some(RowValue::Null)) => true,
            (expected, Some(actual)) => *expected == actual,
            (_, None) => false,
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// One write operation of a batch, as handed to a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOperation {
    pub kind: OperationKind,
    pub table: Table,
    pub values: Values,
    pub selection: Vec<Selection>,
    /// `(column, position)`: set `column` to the id inserted by the operation at `position`
    /// of the same batch
    pub back_references: Vec<(String, usize)>,
}

impl StoreOperation {
    pub fn estimated_size(&self) -> usize {
        self.values.estimated_size()
            + self
                .selection
                .iter()
                .map(|s| s.column.len() + s.value.estimated_size())
                .sum::<usize>()
            + self.back_references.len() * 8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Inserted { id: i64 },
    Affected { count: usize },
}

impl OperationResult {
    pub fn inserted_id(&self) -> Option<i64> {
        match self {
            OperationResult::Inserted { id } => Some(*id),
            OperationResult::Affected { .. } => None,
        }
    }

    /// Rows affected: 1 for an insert, the reported count otherwise.
    pub fn affected(&self) -> usize {
        match self {
            OperationResult::Inserted { .. } => 1,
            OperationResult::Affected { count } => *count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: i64,
    pub values: Values,
}

/// Size limits a store enforces per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchLimits {
    pub max_operations: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl BatchLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn operations(max: usize) -> Self {
        Self {
            max_operations: Some(max),
            max_bytes: None,
        }
    }

    /// `Err(TransactionTooLarge)` when the batch exceeds a limit.
    pub fn check(&self, operations: &[StoreOperation]) -> Result<(), StoreError> {
        let bytes: usize = operations.iter().map(StoreOperation::estimated_size).sum();
        let too_many = self.max_operations.map_or(false, |max| operations.len() > max);
        let too_big = self.max_bytes.map_or(false, |max| bytes > max);
        if too_many || too_big {
            return Err(StoreError::TransactionTooLarge {
                operations: operations.len(),
                bytes,
            });
        }
        Ok(())
    }
}

/// Resolves the back-references of `operation` against earlier results of the batch.
pub(crate) fn resolve_back_references(
    operation: &StoreOperation,
    results: &[OperationResult],
) -> Result<Values, StoreError> {
    let mut values = operation.values.clone();
    for (column, position) in &operation.back_references {
        let id = results
            .get(*position)
            .and_then(OperationResult::inserted_id)
            .ok_or_else(|| {
                StoreError::Rejected(format!(
                    "Back-reference to operation {} does not name an earlier insert",
                    position
                ))
            })?;
        values.put(column, id);
    }
    Ok(values)
}

/// A local store that applies batches atomically.
pub trait Store {
    /// Applies all operations in one transaction.
    ///
    /// Returns one result per operation, in order. On error nothing is applied.
    fn apply_batch(
        &mut self,
        operations: &[StoreOperation],
    ) -> Result<Vec<OperationResult>, StoreError>;

    /// Rows of `table` matching every selection, ordered by id.
    fn query(&self, table: Table, selection: &[Selection]) -> Result<Vec<StoredRow>, StoreError>;
}
