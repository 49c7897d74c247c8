use super::{
    resolve_back_references, BatchLimits, ColumnType, OperationKind, OperationResult, RowValue,
    Selection, Store, StoreError, StoreOperation, StoredRow, Table, Values, ID_COLUMN,
};
use crate::config::StorageConfig;
use crate::db::{establish_connection, DbPool};
use crate::error::CoreError;
use log::debug;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use tokio::runtime::{Builder, Runtime};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite-backed store.
///
/// Callers see a blocking API: every batch runs to completion on a runtime owned by
/// the store. One SQL transaction is used per batch.
pub struct SqliteStore {
    runtime: Runtime,
    pool: DbPool,
    limits: BatchLimits,
}

impl SqliteStore {
    /// Opens (and migrates) the database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>, limits: BatchLimits) -> Result<Self, CoreError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let pool = runtime.block_on(establish_connection(db_path.as_ref()))?;
        Ok(Self {
            runtime,
            pool,
            limits,
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, CoreError> {
        Self::open(
            &config.database_path,
            BatchLimits {
                max_operations: Some(config.max_batch_operations),
                max_bytes: Some(config.max_batch_bytes),
            },
        )
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn set_limits(&mut self, limits: BatchLimits) {
        self.limits = limits;
    }

    async fn apply_all(&self, operations: &[StoreOperation]) -> Result<Vec<OperationResult>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            let result = apply_one(&mut tx, operation, &results).await?;
            results.push(result);
        }
        tx.commit().await?;
        Ok(results)
    }
}

fn checked_column(table: Table, column: &str) -> Result<&str, StoreError> {
    match table.column_type(column) {
        Some(_) => Ok(column),
        None => Err(StoreError::Rejected(format!(
            "Unknown column {}.{}",
            table, column
        ))),
    }
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &RowValue) -> SqliteQuery<'q> {
    match value {
        RowValue::Null => query.bind(None::<i64>),
        RowValue::Integer(v) => query.bind(*v),
        RowValue::Text(text) => query.bind(text.clone()),
    }
}

/// `WHERE a = ? AND b IS NULL`, plus the values to bind.
fn where_clause<'s>(
    table: Table,
    selection: &'s [Selection],
) -> Result<(String, Vec<&'s RowValue>), StoreError> {
    let mut clauses = Vec::with_capacity(selection.len());
    let mut binds = Vec::new();
    for condition in selection {
        let column = checked_column(table, &condition.column)?;
        match &condition.value {
            RowValue::Null => clauses.push(format!("{} IS NULL", column)),
            value => {
                clauses.push(format!("{} = ?", column));
                binds.push(value);
            }
        }
    }
    if clauses.is_empty() {
        Ok((String::new(), binds))
    } else {
        Ok((format!(" WHERE {}", clauses.join(" AND ")), binds))
    }
}

async fn apply_one(
    tx: &mut Transaction<'static, Sqlite>,
    operation: &StoreOperation,
    results: &[OperationResult],
) -> Result<OperationResult, StoreError> {
    let table = operation.table;
    let values = resolve_back_references(operation, results)?;

    match operation.kind {
        OperationKind::Insert => {
            let columns = values
                .iter()
                .map(|(column, _)| checked_column(table, column))
                .collect::<Result<Vec<_>, _>>()?;
            let sql = if columns.is_empty() {
                format!("INSERT INTO {} DEFAULT VALUES", table)
            } else {
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    columns.join(", "),
                    vec!["?"; columns.len()].join(", ")
                )
            };
            let mut query = sqlx::query(&sql);
            for (_, value) in values.iter() {
                query = bind_value(query, value);
            }
            let done = query.execute(&mut **tx).await?;
            Ok(OperationResult::Inserted {
                id: done.last_insert_rowid(),
            })
        }
        OperationKind::Update => {
            let assignments = values
                .iter()
                .map(|(column, _)| checked_column(table, column).map(|c| format!("{} = ?", c)))
                .collect::<Result<Vec<_>, _>>()?;
            if assignments.is_empty() {
                return Ok(OperationResult::Affected { count: 0 });
            }
            let (filter, binds) = where_clause(table, &operation.selection)?;
            let sql = format!("UPDATE {} SET {}{}", table, assignments.join(", "), filter);
            let mut query = sqlx::query(&sql);
            for (_, value) in values.iter() {
                query = bind_value(query, value);
            }
            for value in binds {
                query = bind_value(query, value);
            }
            let done = query.execute(&mut **tx).await?;
            Ok(OperationResult::Affected {
                count: done.rows_affected() as usize,
            })
        }
        OperationKind::Delete => {
            if operation.selection.is_empty() {
                return Err(StoreError::Rejected(format!(
                    "Refusing to delete all rows of {}",
                    table
                )));
            }
            let (filter, binds) = where_clause(table, &operation.selection)?;
            let sql = format!("DELETE FROM {}{}", table, filter);
            let mut query = sqlx::query(&sql);
            for value in binds {
                query = bind_value(query, value);
            }
            let done = query.execute(&mut **tx).await?;
            Ok(OperationResult::Affected {
                count: done.rows_affected() as usize,
            })
        }
    }
}

fn row_values(table: Table, row: &SqliteRow) -> Result<StoredRow, StoreError> {
    let id: i64 = row.try_get(ID_COLUMN)?;
    let mut values = Values::new();
    for (column, ty) in table.columns() {
        match ty {
            ColumnType::Integer => {
                let value: Option<i64> = row.try_get(*column)?;
                values.put_opt(column, value);
            }
            ColumnType::Text => {
                let value: Option<String> = row.try_get(*column)?;
                values.put_opt(column, value);
            }
        }
    }
    Ok(StoredRow { id, values })
}

impl Store for SqliteStore {
    fn apply_batch(
        &mut self,
        operations: &[StoreOperation],
    ) -> Result<Vec<OperationResult>, StoreError> {
        self.limits.check(operations)?;
        let results = self.runtime.block_on(self.apply_all(operations))?;
        debug!("Committed batch of {} operation(s)", operations.len());
        Ok(results)
    }

    fn query(&self, table: Table, selection: &[Selection]) -> Result<Vec<StoredRow>, StoreError> {
        let (filter, binds) = where_clause(table, selection)?;
        let sql = format!("SELECT * FROM {}{} ORDER BY {}", table, filter, ID_COLUMN);

        self.runtime.block_on(async {
            let mut query = sqlx::query(&sql);
            for value in binds {
                query = bind_value(query, value);
            }
            let rows = query.fetch_all(&self.pool).await?;
            rows.iter().map(|row| row_values(table, row)).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (SqliteStore, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let store = SqliteStore::open(temp_dir.path().join("test.db"), BatchLimits::unlimited())
            .expect("Failed to open test store");
        (store, temp_dir)
    }

    fn event_insert(title: &str) -> StoreOperation {
        let mut values = Values::new();
        values
            .put("title", title)
            .put("dtstart", 0i64)
            .put("all_day", false);
        StoreOperation {
            kind: OperationKind::Insert,
            table: Table::Events,
            values,
            selection: Vec::new(),
            back_references: Vec::new(),
        }
    }

    #[test]
    fn test_insert_with_back_reference_and_query() {
        let (mut store, _dir) = open();
        let mut reminder = Values::new();
        reminder.put("minutes", 15i64).put("method", 1i64);
        let results = store
            .apply_batch(&[
                event_insert("Standup"),
                StoreOperation {
                    kind: OperationKind::Insert,
                    table: Table::Reminders,
                    values: reminder,
                    selection: Vec::new(),
                    back_references: vec![("event_id".to_string(), 0)],
                },
            ])
            .unwrap();

        let event_id = results[0].inserted_id().unwrap();
        let reminders = store
            .query(Table::Reminders, &[Selection::equals("event_id", event_id)])
            .unwrap();
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].values.integer("minutes"), Some(15));

        let events = store
            .query(Table::Events, &[Selection::is_null("original_id")])
            .unwrap();
        assert_eq!(events[0].values.text("title"), Some("Standup"));
    }

    #[test]
    fn test_failed_batch_is_rolled_back() {
        let (mut store, _dir) = open();
        let mut bad = event_insert("bad");
        bad.values.put("no_such_column", 1i64);

        let result = store.apply_batch(&[event_insert("first"), bad]);
        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert!(store.query(Table::Events, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_limits_report_too_large() {
        let (mut store, _dir) = open();
        store.set_limits(BatchLimits::operations(1));
        let result = store.apply_batch(&[event_insert("a"), event_insert("b")]);
        assert!(matches!(result, Err(StoreError::TransactionTooLarge { .. })));
    }

    #[test]
    fn test_delete_requires_selection() {
        let (mut store, _dir) = open();
        let result = store.apply_batch(&[StoreOperation {
            kind: OperationKind::Delete,
            table: Table::Events,
            values: Values::new(),
            selection: Vec::new(),
            back_references: Vec::new(),
        }]);
        assert!(matches!(result, Err(StoreError::Rejected(_))));
    }
}
