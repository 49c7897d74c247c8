use crate::batch::{BatchOperation, WriteIntent};
use crate::component::RawComponent;
use crate::error::CoreError;
use crate::mapping::{
    child_tables, entity_to_rows, exception_to_rows, series_from_rows, table_for, EntityRows,
    MappingContext, RowSet,
};
use crate::models::{Correction, EntitySeries};
use crate::recurrence::{OrphanedException, Resolver};
use crate::store::{Selection, Store, StoredRow, Table, ID_COLUMN};
use log::{debug, info, warn};

/// Column linking an exception row to its master row
pub const ORIGINAL_ID: &str = "original_id";

/// A series as stored, with the id of its master row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSeries {
    pub table: Table,
    pub id: i64,
    pub series: EntitySeries,
}

/// Outcome of an import.
#[derive(Debug, Default)]
pub struct ImportReport {
    /// Master row ids of the stored series, in input order
    pub inserted: Vec<i64>,
    pub rejected: Vec<CoreError>,
    pub warnings: Vec<CoreError>,
    pub corrections: Vec<Correction>,
    pub orphaned_exceptions: Vec<OrphanedException>,
}

pub trait Repository {
    fn add_series(&mut self, series: &EntitySeries) -> Result<i64, CoreError>;
    fn update_series(&mut self, table: Table, id: i64, series: &EntitySeries) -> Result<i64, CoreError>;
    fn delete_series(&mut self, table: Table, id: i64) -> Result<usize, CoreError>;
    fn find_series(&self, table: Table, id: i64) -> Result<EntitySeries, CoreError>;
    fn find_series_by_uid(&self, uid: &str) -> Result<Option<StoredSeries>, CoreError>;
    fn import(
        &mut self,
        resolver: &Resolver,
        components: Vec<RawComponent>,
    ) -> Result<ImportReport, CoreError>;
}

/// Rows of a series, mapped and ready to be queued.
struct MappedSeries {
    master: RowSet,
    exceptions: Vec<RowSet>,
    corrections: Vec<Correction>,
    warnings: Vec<CoreError>,
}

/// A collection of series kept in a local [`Store`].
pub struct LocalCollection<S: Store> {
    store: S,
    ctx: MappingContext,
}

impl<S: Store> LocalCollection<S> {
    pub fn new(store: S, ctx: MappingContext) -> Self {
        Self { store, ctx }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn context(&self) -> &MappingContext {
        &self.ctx
    }

    fn map_series(&self, series: &EntitySeries) -> Result<MappedSeries, CoreError> {
        let master = entity_to_rows(&series.master, &self.ctx)?;
        let mut corrections = master.corrections;
        let mut warnings = master.warnings;

        let mut exceptions = Vec::with_capacity(series.exceptions.len());
        for exception in &series.exceptions {
            let mapped = exception_to_rows(exception, &series.master, &self.ctx)?;
            corrections.extend(mapped.corrections);
            warnings.extend(mapped.warnings);
            exceptions.push(mapped.rows);
        }

        Ok(MappedSeries {
            master: master.rows,
            exceptions,
            corrections,
            warnings,
        })
    }

    fn query(&self, table: Table, selection: &[Selection]) -> Result<Vec<StoredRow>, CoreError> {
        self.store
            .query(table, selection)
            .map_err(|err| CoreError::persistence(format!("Couldn't query {}", table), Some(err)))
    }

    fn load_rows(&self, table: Table, row: StoredRow) -> Result<EntityRows, CoreError> {
        let mut children = Vec::new();
        for (child_table, foreign_key) in child_tables(table) {
            let rows = self.query(*child_table, &[Selection::equals(foreign_key, row.id)])?;
            children.extend(rows.into_iter().map(|r| (*child_table, r)));
        }
        Ok(EntityRows {
            table,
            row,
            children,
        })
    }

    fn load_series(&self, table: Table, master: StoredRow) -> Result<EntitySeries, CoreError> {
        let exceptions = self
            .query(table, &[Selection::equals(ORIGINAL_ID, master.id)])?
            .into_iter()
            .map(|row| self.load_rows(table, row))
            .collect::<Result<Vec<_>, _>>()?;
        let master = self.load_rows(table, master)?;
        series_from_rows(&master, &exceptions, &self.ctx)
    }

    /// Queues deletion of a master row, its exceptions and every dependent row.
    fn enqueue_delete(&self, batch: &mut BatchOperation, table: Table, id: i64) -> Result<(), CoreError> {
        let exceptions = self.query(table, &[Selection::equals(ORIGINAL_ID, id)])?;
        for row_id in exceptions.iter().map(|row| row.id).chain(std::iter::once(id)) {
            for (child_table, foreign_key) in child_tables(table) {
                batch.enqueue(WriteIntent::delete(
                    *child_table,
                    vec![Selection::equals(foreign_key, row_id)],
                ))?;
            }
            batch.enqueue(WriteIntent::delete(
                table,
                vec![Selection::equals(ID_COLUMN, row_id)],
            ))?;
        }
        Ok(())
    }

    fn master_row(&self, table: Table, id: i64) -> Result<StoredRow, CoreError> {
        self.query(
            table,
            &[
                Selection::equals(ID_COLUMN, id),
                Selection::is_null(ORIGINAL_ID),
            ],
        )?
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::NotFound(format!("{} row {}", table, id)))
    }
}

/// Queues a row set; children refer to the main row through a back-reference.
fn enqueue_rows(
    batch: &mut BatchOperation,
    rows: RowSet,
    master: Option<usize>,
) -> Result<usize, CoreError> {
    let mut intent = WriteIntent::insert(rows.table, rows.values);
    if let Some(master) = master {
        intent = intent.with_back_reference(ORIGINAL_ID, master);
    }
    let position = batch.enqueue(intent)?;
    for child in rows.children {
        batch.enqueue(
            WriteIntent::insert(child.table, child.values)
                .with_back_reference(child.foreign_key, position),
        )?;
    }
    Ok(position)
}

/// Queues a mapped series and returns the position of its master insert.
fn enqueue_series(batch: &mut BatchOperation, mapped: MappedSeries) -> Result<usize, CoreError> {
    let master = enqueue_rows(batch, mapped.master, None)?;
    for exception in mapped.exceptions {
        enqueue_rows(batch, exception, Some(master))?;
    }
    Ok(master)
}

fn inserted_master(batch: &BatchOperation, position: usize) -> Result<i64, CoreError> {
    batch
        .inserted_id(position)
        .ok_or_else(|| CoreError::persistence("Master row was not inserted", None))
}

impl<S: Store> Repository for LocalCollection<S> {
    fn add_series(&mut self, series: &EntitySeries) -> Result<i64, CoreError> {
        let mapped = self.map_series(series)?;
        let mut batch = BatchOperation::new();
        let position = enqueue_series(&mut batch, mapped)?;
        batch.commit(&mut self.store)?;

        let id = inserted_master(&batch, position)?;
        debug!("Added {} {} as row {}", series.master.kind_name(), series.uid(), id);
        Ok(id)
    }

    /// Replaces a stored series: the old rows are deleted and the new ones inserted in
    /// the same batch. Returns the new master row id.
    fn update_series(&mut self, table: Table, id: i64, series: &EntitySeries) -> Result<i64, CoreError> {
        if table_for(&series.master) != table {
            return Err(CoreError::InvalidInput(format!(
                "Cannot store {} {} in {}",
                series.master.kind_name(),
                series.uid(),
                table
            )));
        }
        self.master_row(table, id)?;
        let mapped = self.map_series(series)?;

        let mut batch = BatchOperation::new();
        self.enqueue_delete(&mut batch, table, id)?;
        let position = enqueue_series(&mut batch, mapped)?;
        batch.commit(&mut self.store)?;

        let new_id = inserted_master(&batch, position)?;
        debug!("Updated {} row {} -> {}", series.uid(), id, new_id);
        Ok(new_id)
    }

    fn delete_series(&mut self, table: Table, id: i64) -> Result<usize, CoreError> {
        self.master_row(table, id)?;
        let mut batch = BatchOperation::new();
        self.enqueue_delete(&mut batch, table, id)?;
        let affected = batch.commit(&mut self.store)?;
        debug!("Deleted {} row {} ({} rows affected)", table, id, affected);
        Ok(affected)
    }

    fn find_series(&self, table: Table, id: i64) -> Result<EntitySeries, CoreError> {
        let master = self.master_row(table, id)?;
        self.load_series(table, master)
    }

    fn find_series_by_uid(&self, uid: &str) -> Result<Option<StoredSeries>, CoreError> {
        for table in [Table::Events, Table::Tasks] {
            let master = self
                .query(
                    table,
                    &[Selection::equals("uid", uid), Selection::is_null(ORIGINAL_ID)],
                )?
                .into_iter()
                .next();
            if let Some(master) = master {
                let id = master.id;
                return Ok(Some(StoredSeries {
                    table,
                    id,
                    series: self.load_series(table, master)?,
                }));
            }
        }
        Ok(None)
    }

    /// Resolves components into series and stores all of them in one batch.
    ///
    /// Series that cannot be resolved or mapped are reported in `rejected`; they do not
    /// affect the others.
    fn import(
        &mut self,
        resolver: &Resolver,
        components: Vec<RawComponent>,
    ) -> Result<ImportReport, CoreError> {
        let resolution = resolver.resolve(components);
        let mut report = ImportReport {
            rejected: resolution.rejected,
            warnings: resolution.warnings,
            corrections: resolution.corrections,
            orphaned_exceptions: resolution.orphaned_exceptions,
            ..ImportReport::default()
        };

        let mut batch = BatchOperation::new();
        let mut positions = Vec::with_capacity(resolution.series.len());
        for series in &resolution.series {
            match self.map_series(series) {
                Ok(mut mapped) => {
                    report.corrections.append(&mut mapped.corrections);
                    report.warnings.append(&mut mapped.warnings);
                    positions.push(enqueue_series(&mut batch, mapped)?);
                }
                Err(err) => {
                    warn!("Rejecting {}: {}", series.uid(), err);
                    report.rejected.push(err);
                }
            }
        }

        batch.commit(&mut self.store)?;
        report.inserted = positions
            .into_iter()
            .map(|position| inserted_master(&batch, position))
            .collect::<Result<_, _>>()?;
        info!(
            "Imported {} series ({} rejected, {} corrections)",
            report.inserted.len(),
            report.rejected.len(),
            report.corrections.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CalendarEntity, Participant, TimeSpan, TimeValue};
    use crate::store::{BatchLimits, MemoryStore};
    use crate::timezone::TimeNormalizer;
    use chrono::{NaiveDate, TimeZone};
    use chrono_tz::{Europe::Vienna, Tz};

    fn collection() -> LocalCollection<MemoryStore> {
        LocalCollection::new(MemoryStore::new(), MappingContext::default())
    }

    fn vienna(d: u32, h: u32) -> TimeValue {
        TimeValue::DateTime(Vienna.with_ymd_and_hms(2024, 5, d, h, 0, 0).unwrap())
    }

    fn weekly_series() -> EntitySeries {
        let mut master = CalendarEntity::event("u1", TimeSpan::with_end(vienna(1, 10), vienna(1, 11)));
        master.summary = Some("Weekly".to_string());
        master.recurrence.rrule = Some("FREQ=WEEKLY".to_string());
        master.organizer = Some("mailto:boss@example.com".to_string());
        master.participants.push(Participant::mailto("alice@example.com"));

        let mut exception = CalendarEntity::event("u1", TimeSpan::with_end(vienna(8, 12), vienna(8, 13)));
        exception.summary = Some("Weekly".to_string());
        exception.recurrence_id = Some(vienna(8, 10));
        EntitySeries {
            master,
            exceptions: vec![exception],
        }
    }

    #[test]
    fn test_add_and_find_series() {
        let mut collection = collection();
        let id = collection.add_series(&weekly_series()).unwrap();

        let found = collection.find_series(Table::Events, id).unwrap();
        assert_eq!(found.master.summary.as_deref(), Some("Weekly"));
        assert_eq!(found.exceptions.len(), 1);
        assert_eq!(found.exceptions[0].recurrence_id, Some(vienna(8, 10)));
        assert_eq!(
            found.exceptions[0].organizer.as_deref(),
            Some("mailto:boss@example.com")
        );

        let exception_row = collection
            .store()
            .rows(Table::Events)
            .iter()
            .find(|row| row.id != id)
            .unwrap();
        assert_eq!(exception_row.values.integer(ORIGINAL_ID), Some(id));
    }

    #[test]
    fn test_find_by_uid() {
        let mut collection = collection();
        let id = collection.add_series(&weekly_series()).unwrap();

        let stored = collection.find_series_by_uid("u1").unwrap().unwrap();
        assert_eq!(stored.table, Table::Events);
        assert_eq!(stored.id, id);
        assert!(collection.find_series_by_uid("missing").unwrap().is_none());
    }

    #[test]
    fn test_delete_removes_exceptions_and_children() {
        let mut collection = collection();
        let id = collection.add_series(&weekly_series()).unwrap();

        collection.delete_series(Table::Events, id).unwrap();
        for table in Table::ALL {
            assert!(collection.store().rows(table).is_empty(), "{} not empty", table);
        }
        assert!(matches!(
            collection.find_series(Table::Events, id),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_replaces_series() {
        let mut collection = collection();
        let id = collection.add_series(&weekly_series()).unwrap();

        let mut changed = weekly_series();
        changed.master.summary = Some("Biweekly".to_string());
        changed.exceptions.clear();
        let new_id = collection.update_series(Table::Events, id, &changed).unwrap();

        assert_eq!(collection.store().rows(Table::Events).len(), 1);
        let found = collection.find_series(Table::Events, new_id).unwrap();
        assert_eq!(found.master.summary.as_deref(), Some("Biweekly"));
        assert!(found.exceptions.is_empty());
    }

    #[test]
    fn test_update_rejects_other_table() {
        let mut collection = collection();
        let id = collection.add_series(&weekly_series()).unwrap();
        assert!(collection.update_series(Table::Tasks, id, &weekly_series()).is_err());
    }

    #[test]
    fn test_import_splits_large_batches() {
        let mut collection = LocalCollection::new(
            MemoryStore::with_limits(BatchLimits::operations(3)),
            MappingContext::default(),
        );
        let components = (0..4)
            .map(|i| {
                RawComponent::event()
                    .with("UID", &format!("e{}", i))
                    .with("DTSTART", "20240501")
            })
            .chain(std::iter::once(RawComponent::event().with("UID", "no-start")))
            .collect();
        let resolver = Resolver::new(TimeNormalizer::new(Tz::UTC));

        let report = collection.import(&resolver, components).unwrap();
        assert_eq!(report.inserted.len(), 4);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.corrections.len(), 4);
        assert!(collection
            .store()
            .committed_batches()
            .iter()
            .all(|&n| n <= 3));

        let stored = collection.find_series_by_uid("e2").unwrap().unwrap();
        let TimeValue::Date(start) = stored.series.master.anchor_time().unwrap().clone() else {
            panic!("expected a date-only start");
        };
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
    }
}
