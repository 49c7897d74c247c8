use super::{
    resolve_back_references, BatchLimits, OperationKind, OperationResult, Selection, Store,
    StoreError, StoreOperation, StoredRow, Table,
};
use log::debug;
use std::collections::{BTreeMap, HashSet};

/// An in-process store with the same transaction semantics as [`super::SqliteStore`].
///
/// Batches are applied against a snapshot and discarded on error. Size limits and
/// per-table failures can be configured, and every committed batch size is recorded.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: BTreeMap<Table, Vec<StoredRow>>,
    next_id: i64,
    limits: BatchLimits,
    failing_tables: HashSet<Table>,
    committed_batches: Vec<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: BatchLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn set_limits(&mut self, limits: BatchLimits) {
        self.limits = limits;
    }

    /// Every later operation on `table` is rejected.
    pub fn fail_on(&mut self, table: Table) {
        self.failing_tables.insert(table);
    }

    pub fn clear_failures(&mut self) {
        self.failing_tables.clear();
    }

    /// Sizes of the batches committed so far, in commit order.
    pub fn committed_batches(&self) -> &[usize] {
        &self.committed_batches
    }

    pub fn rows(&self, table: Table) -> &[StoredRow] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    fn apply(
        &mut self,
        operation: &StoreOperation,
        results: &[OperationResult],
    ) -> Result<OperationResult, StoreError> {
        if self.failing_tables.contains(&operation.table) {
            return Err(StoreError::Rejected(format!(
                "{} is not writable",
                operation.table
            )));
        }
        let values = resolve_back_references(operation, results)?;
        let rows = self.tables.entry(operation.table).or_default();

        Ok(match operation.kind {
            OperationKind::Insert => {
                self.next_id += 1;
                rows.push(StoredRow {
                    id: self.next_id,
                    values,
                });
                OperationResult::Inserted { id: self.next_id }
            }
            OperationKind::Update => {
                let mut count = 0;
                for row in rows
                    .iter_mut()
                    .filter(|row| matches_all(&operation.selection, row))
                {
                    for (column, value) in values.iter() {
                        row.values.put(column, value.clone());
                    }
                    count += 1;
                }
                OperationResult::Affected { count }
            }
            OperationKind::Delete => {
                let before = rows.len();
                rows.retain(|row| !matches_all(&operation.selection, row));
                OperationResult::Affected {
                    count: before - rows.len(),
                }
            }
        })
    }
}

fn matches_all(selection: &[Selection], row: &StoredRow) -> bool {
    selection.iter().all(|s| s.matches(&row.values, row.id))
}

impl Store for MemoryStore {
    fn apply_batch(
        &mut self,
        operations: &[StoreOperation],
    ) -> Result<Vec<OperationResult>, StoreError> {
        self.limits.check(operations)?;

        let snapshot = (self.tables.clone(), self.next_id);
        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            match self.apply(operation, &results) {
                Ok(result) => results.push(result),
                Err(err) => {
                    (self.tables, self.next_id) = snapshot;
                    return Err(err);
                }
            }
        }

        debug!("Committed batch of {} operation(s)", operations.len());
        self.committed_batches.push(operations.len());
        Ok(results)
    }

    fn query(&self, table: Table, selection: &[Selection]) -> Result<Vec<StoredRow>, StoreError> {
        Ok(self
            .rows(table)
            .iter()
            .filter(|row| matches_all(selection, row))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Values;

    fn insert(table: Table, values: Values, back_references: Vec<(String, usize)>) -> StoreOperation {
        StoreOperation {
            kind: OperationKind::Insert,
            table,
            values,
            selection: Vec::new(),
            back_references,
        }
    }

    fn titled(title: &str) -> Values {
        let mut values = Values::new();
        values.put("title", title);
        values
    }

    #[test]
    fn test_batch_resolves_back_references() {
        let mut store = MemoryStore::new();
        let results = store
            .apply_batch(&[
                insert(Table::Events, titled("a"), vec![]),
                insert(Table::Reminders, Values::new(), vec![("event_id".to_string(), 0)]),
            ])
            .unwrap();

        let event_id = results[0].inserted_id().unwrap();
        assert_eq!(store.rows(Table::Reminders)[0].values.integer("event_id"), Some(event_id));
        assert_eq!(store.committed_batches(), &[2]);
    }

    #[test]
    fn test_failed_batch_changes_nothing() {
        let mut store = MemoryStore::new();
        store.fail_on(Table::Reminders);
        let result = store.apply_batch(&[
            insert(Table::Events, titled("a"), vec![]),
            insert(Table::Reminders, Values::new(), vec![]),
        ]);

        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert!(store.rows(Table::Events).is_empty());
        assert!(store.committed_batches().is_empty());
    }

    #[test]
    fn test_too_large_batch_is_refused() {
        let mut store = MemoryStore::with_limits(BatchLimits::operations(1));
        let result = store.apply_batch(&[
            insert(Table::Events, titled("a"), vec![]),
            insert(Table::Events, titled("b"), vec![]),
        ]);
        assert!(matches!(result, Err(StoreError::TransactionTooLarge { .. })));
        assert!(store.rows(Table::Events).is_empty());
    }

    #[test]
    fn test_update_and_delete_report_counts() {
        let mut store = MemoryStore::new();
        store
            .apply_batch(&[
                insert(Table::Events, titled("a"), vec![]),
                insert(Table::Events, titled("a"), vec![]),
                insert(Table::Events, titled("b"), vec![]),
            ])
            .unwrap();

        let results = store
            .apply_batch(&[
                StoreOperation {
                    kind: OperationKind::Update,
                    table: Table::Events,
                    values: titled("c"),
                    selection: vec![Selection::equals("title", "a")],
                    back_references: vec![],
                },
                StoreOperation {
                    kind: OperationKind::Delete,
                    table: Table::Events,
                    values: Values::new(),
                    selection: vec![Selection::equals("title", "b")],
                    back_references: vec![],
                },
            ])
            .unwrap();

        assert_eq!(results[0], OperationResult::Affected { count: 2 });
        assert_eq!(results[1], OperationResult::Affected { count: 1 });
        let titles: Vec<_> = store
            .query(Table::Events, &[])
            .unwrap()
            .into_iter()
            .map(|row| row.values.text("title").map(str::to_string))
            .collect();
        assert_eq!(titles, vec![Some("c".to_string()), Some("c".to_string())]);
    }
}
