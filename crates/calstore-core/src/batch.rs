//! Queued write operations committed as one store transaction.
//!
//! Intents may refer to rows inserted by earlier intents of the same batch through
//! back-references. When the store reports that the batch is too large, it is split in
//! half and each half committed on its own, recursively. Atomicity then only holds per
//! committed part.

use crate::error::CoreError;
use crate::store::{
    OperationKind, OperationResult, Selection, Store, StoreError, StoreOperation, Table, Values,
};
use log::{debug, warn};

/// Sets `column` to the id inserted by the intent at `position`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackReference {
    pub column: String,
    pub position: usize,
}

/// One queued write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteIntent {
    pub kind: OperationKind,
    pub table: Table,
    pub values: Values,
    pub selection: Vec<Selection>,
    pub back_references: Vec<BackReference>,
}

impl WriteIntent {
    pub fn insert(table: Table, values: Values) -> Self {
        Self {
            kind: OperationKind::Insert,
            table,
            values,
            selection: Vec::new(),
            back_references: Vec::new(),
        }
    }

    pub fn update(table: Table, values: Values, selection: Vec<Selection>) -> Self {
        Self {
            kind: OperationKind::Update,
            table,
            values,
            selection,
            back_references: Vec::new(),
        }
    }

    pub fn delete(table: Table, selection: Vec<Selection>) -> Self {
        Self {
            kind: OperationKind::Delete,
            table,
            values: Values::new(),
            selection,
            back_references: Vec::new(),
        }
    }

    pub fn with_back_reference(mut self, column: &str, position: usize) -> Self {
        self.back_references.push(BackReference {
            column: column.to_string(),
            position,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Queued,
    Committing,
    /// The store refused the current part as too large; it is being split
    SplitRetry,
    Committed,
    Failed,
}

/// An ordered queue of write intents.
#[derive(Debug)]
pub struct BatchOperation {
    intents: Vec<WriteIntent>,
    results: Vec<OperationResult>,
    state: BatchState,
}

impl Default for BatchOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchOperation {
    pub fn new() -> Self {
        Self {
            intents: Vec::new(),
            results: Vec::new(),
            state: BatchState::Queued,
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Number of queued intents
    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Queues an intent and returns its position.
    ///
    /// Back-references must name an earlier insert of this batch. Enqueuing after a
    /// commit starts a new batch.
    pub fn enqueue(&mut self, intent: WriteIntent) -> Result<usize, CoreError> {
        if self.state != BatchState::Queued {
            self.results.clear();
            self.state = BatchState::Queued;
        }

        let position = self.intents.len();
        for reference in &intent.back_references {
            let target = self
                .intents
                .get(reference.position)
                .filter(|_| reference.position < position);
            match target {
                Some(target) if target.kind == OperationKind::Insert => {}
                _ => {
                    return Err(CoreError::InvalidInput(format!(
                        "Back-reference of operation {} to {} does not name an earlier insert",
                        position, reference.position
                    )))
                }
            }
        }

        self.intents.push(intent);
        Ok(position)
    }

    /// Commits all queued intents and clears the queue.
    ///
    /// # Returns
    ///
    /// The number of affected rows: 1 per insert, the reported count per update or delete.
    ///
    /// # Errors
    ///
    /// `PersistenceFailure` when the store fails, or when a single intent is too large
    /// for one transaction. Parts committed before the failure stay committed.
    pub fn commit<S: Store + ?Sized>(&mut self, store: &mut S) -> Result<usize, CoreError> {
        let intents = std::mem::take(&mut self.intents);
        self.results.clear();
        if intents.is_empty() {
            self.transition(BatchState::Committed);
            return Ok(0);
        }

        self.transition(BatchState::Committing);
        match self.commit_range(store, &intents, 0, intents.len()) {
            Ok(()) => {
                self.transition(BatchState::Committed);
                Ok(self.results.iter().map(OperationResult::affected).sum())
            }
            Err(err) => {
                self.transition(BatchState::Failed);
                Err(err)
            }
        }
    }

    /// Results of the last commit, one per intent.
    pub fn results(&self) -> &[OperationResult] {
        &self.results
    }

    pub fn result(&self, position: usize) -> Option<&OperationResult> {
        self.results.get(position)
    }

    /// Id of the row inserted by the intent at `position` in the last commit.
    pub fn inserted_id(&self, position: usize) -> Option<i64> {
        self.results.get(position).and_then(OperationResult::inserted_id)
    }

    fn transition(&mut self, state: BatchState) {
        debug!("Batch state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Commits `intents[start..end]`; every intent before `start` is already committed.
    fn commit_range<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        intents: &[WriteIntent],
        start: usize,
        end: usize,
    ) -> Result<(), CoreError> {
        let operations = intents[start..end]
            .iter()
            .map(|intent| self.to_operation(intent, start))
            .collect::<Result<Vec<_>, _>>()?;

        match store.apply_batch(&operations) {
            Ok(results) if results.len() == operations.len() => {
                self.results.extend(results);
                Ok(())
            }
            Ok(results) => Err(CoreError::persistence(
                format!(
                    "Store returned {} result(s) for {} operation(s)",
                    results.len(),
                    operations.len()
                ),
                None,
            )),
            Err(StoreError::TransactionTooLarge { operations: count, bytes }) if end - start > 1 => {
                warn!(
                    "Transaction too large ({} operations, {} bytes), splitting (losing atomicity)",
                    count, bytes
                );
                self.transition(BatchState::SplitRetry);
                let middle = start + (end - start) / 2;
                self.transition(BatchState::Committing);
                self.commit_range(store, intents, start, middle)?;
                self.commit_range(store, intents, middle, end)
            }
            Err(err @ StoreError::TransactionTooLarge { .. }) => Err(CoreError::persistence(
                format!("Operation {} is too large for a single transaction", start),
                Some(err),
            )),
            Err(err) => Err(CoreError::persistence(
                format!("Couldn't commit operations {}..{}", start, end),
                Some(err),
            )),
        }
    }

    /// Builds the store operation for an intent of the part starting at `start`.
    ///
    /// References into the part are re-based; references to committed intents become
    /// the literal id.
    fn to_operation(&self, intent: &WriteIntent, start: usize) -> Result<StoreOperation, CoreError> {
        let mut values = intent.values.clone();
        let mut back_references = Vec::new();
        for reference in &intent.back_references {
            if reference.position >= start {
                back_references.push((reference.column.clone(), reference.position - start));
                continue;
            }
            let id = self.inserted_id(reference.position).ok_or_else(|| {
                CoreError::persistence(
                    format!("Operation {} has no inserted id", reference.position),
                    None,
                )
            })?;
            values.put(&reference.column, id);
        }

        Ok(StoreOperation {
            kind: intent.kind,
            table: intent.table,
            values,
            selection: intent.selection.clone(),
            back_references,
        })
    }
}
