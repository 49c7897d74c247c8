//! Conversion between entities and store rows.
//!
//! Each entity kind has its own mapper ([`event`], [`task`]); this module dispatches on
//! the kind and holds the pieces both share: exception anchors, recurrence sets and
//! alarm offsets.

pub mod dates;
pub mod event;
pub mod policy;
pub mod task;
pub mod unknown;

use crate::config::{MappingConfig, DEFAULT_MAX_UNKNOWN_PROPERTY_SIZE};
use crate::error::CoreError;
use crate::models::{
    Alarm, CalendarEntity, Correction, EntityKind, EntitySeries, RecurrenceSpec, TimeValue,
};
use crate::store::{StoredRow, Table, Values};
use chrono::Duration;
use chrono_tz::Tz;
use dates::{recurrence_set_from_storage, recurrence_set_to_storage, time_from_storage};

/// Settings the mappers need.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingContext {
    pub max_unknown_property_size: usize,
    /// Zone used for stored zone identifiers that are no longer known
    pub default_zone: Tz,
}

impl MappingContext {
    pub fn from_config(config: &MappingConfig) -> Self {
        Self {
            max_unknown_property_size: config.max_unknown_property_size,
            default_zone: config.default_zone(),
        }
    }
}

impl Default for MappingContext {
    fn default() -> Self {
        Self {
            max_unknown_property_size: DEFAULT_MAX_UNKNOWN_PROPERTY_SIZE,
            default_zone: Tz::UTC,
        }
    }
}

/// A dependent row, linked to its owner through `foreign_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRow {
    pub table: Table,
    pub foreign_key: &'static str,
    pub values: Values,
}

/// The main row of an entity plus its dependent rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSet {
    pub table: Table,
    pub values: Values,
    pub children: Vec<ChildRow>,
}

/// Result of mapping one entity to rows.
#[derive(Debug)]
pub struct MappedRows {
    pub rows: RowSet,
    pub corrections: Vec<Correction>,
    /// Recoverable conditions such as dropped oversize properties
    pub warnings: Vec<CoreError>,
}

/// Stored rows of one entity, as read back from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRows {
    pub table: Table,
    pub row: StoredRow,
    pub children: Vec<(Table, StoredRow)>,
}

impl EntityRows {
    pub fn children_in(&self, table: Table) -> impl Iterator<Item = &Values> {
        self.children
            .iter()
            .filter(move |(t, _)| *t == table)
            .map(|(_, row)| &row.values)
    }
}

/// Main table of an entity kind
pub fn table_for(entity: &CalendarEntity) -> Table {
    match entity.kind {
        EntityKind::Event(_) => Table::Events,
        EntityKind::Task(_) => Table::Tasks,
    }
}

/// Dependent tables of a main table, with their foreign key column.
pub fn child_tables(table: Table) -> &'static [(Table, &'static str)] {
    match table {
        Table::Events => &[
            (Table::Reminders, event::EVENT_ID),
            (Table::Attendees, event::EVENT_ID),
            (Table::ExtendedProperties, event::EVENT_ID),
        ],
        Table::Tasks => &[(Table::TaskProperties, task::TASK_ID)],
        _ => &[],
    }
}

/// Maps a master (or stand-alone) entity to rows.
pub fn entity_to_rows(
    entity: &CalendarEntity,
    ctx: &MappingContext,
) -> Result<MappedRows, CoreError> {
    match &entity.kind {
        EntityKind::Event(event) => event::event_to_rows(entity, event, ctx),
        EntityKind::Task(task) => task::task_to_rows(entity, task, ctx),
    }
}

/// Maps an exception to rows, adding the columns that tie it to `master`.
///
/// The link to the master row itself (`original_id`) is a back-reference added when
/// the rows are enqueued.
pub fn exception_to_rows(
    exception: &CalendarEntity,
    master: &CalendarEntity,
    ctx: &MappingContext,
) -> Result<MappedRows, CoreError> {
    if table_for(exception) != table_for(master) {
        return Err(CoreError::invalid_entity(
            &exception.uid,
            format!(
                "{} exception of a {} master",
                exception.kind_name(),
                master.kind_name()
            ),
        ));
    }
    let mut mapped = entity_to_rows(exception, ctx)?;
    write_exception_anchor(&mut mapped.rows.values, exception, master)?;
    Ok(mapped)
}

/// Reads one entity back from its rows.
pub fn entity_from_rows(rows: &EntityRows, ctx: &MappingContext) -> Result<CalendarEntity, CoreError> {
    match rows.table {
        Table::Events => event::event_from_rows(rows, ctx),
        Table::Tasks => task::task_from_rows(rows, ctx),
        other => Err(CoreError::InvalidInput(format!(
            "{} rows do not describe an entity",
            other
        ))),
    }
}

/// Reads a series back.
///
/// Exceptions take the master's organizer; when the master has no participants no
/// organizer is kept anywhere in the series.
pub fn series_from_rows(
    master: &EntityRows,
    exceptions: &[EntityRows],
    ctx: &MappingContext,
) -> Result<EntitySeries, CoreError> {
    let master = entity_from_rows(master, ctx)?;
    let mut series_exceptions = Vec::with_capacity(exceptions.len());
    for rows in exceptions {
        let mut exception = entity_from_rows(rows, ctx)?;
        exception.organizer = if master.participants.is_empty() {
            None
        } else {
            master.organizer.clone()
        };
        series_exceptions.push(exception);
    }
    Ok(EntitySeries {
        master,
        exceptions: series_exceptions,
    })
}

// ============================================================================
// Shared columns
// ============================================================================

/// `original_*` columns of an exception.
///
/// The anchor takes the kind of the master's start: a date-time anchor of an all-day
/// master is cut to its date.
fn write_exception_anchor(
    values: &mut Values,
    exception: &CalendarEntity,
    master: &CalendarEntity,
) -> Result<(), CoreError> {
    let anchor = exception
        .recurrence_id
        .as_ref()
        .ok_or_else(|| CoreError::invalid_entity(&exception.uid, "exception without recurrence id"))?;
    let anchor = match master.anchor_time() {
        Some(master_start) => anchor.to_kind_of(master_start),
        None => anchor.clone(),
    };
    values
        .put("original_sync_id", master.uid.as_str())
        .put("original_instance_time", anchor.epoch_millis())
        .put("original_instance_timezone", anchor.zone_id())
        .put("original_all_day", anchor.is_date_only());
    Ok(())
}

fn read_exception_anchor(values: &Values, default_zone: Tz) -> Result<Option<TimeValue>, CoreError> {
    values
        .integer("original_instance_time")
        .map(|millis| {
            time_from_storage(
                millis,
                values.text("original_instance_timezone"),
                values.flag("original_all_day"),
                default_zone,
            )
        })
        .transpose()
}

fn write_recurrence(values: &mut Values, recurrence: &RecurrenceSpec, all_day: bool) {
    values
        .put_opt("rrule", recurrence.rrule.as_deref())
        .put_opt("exrule", recurrence.exrule.as_deref())
        .put_opt("rdate", recurrence_set_to_storage(&recurrence.rdates, all_day))
        .put_opt("exdate", recurrence_set_to_storage(&recurrence.exdates, all_day));
}

fn read_recurrence(values: &Values, all_day: bool, default_zone: Tz) -> Result<RecurrenceSpec, CoreError> {
    let set = |column: &str| -> Result<Vec<TimeValue>, CoreError> {
        match values.text(column) {
            Some(text) => recurrence_set_from_storage(text, all_day, default_zone),
            None => Ok(Vec::new()),
        }
    };
    Ok(RecurrenceSpec {
        rrule: values.text("rrule").map(str::to_string),
        exrule: values.text("exrule").map(str::to_string),
        rdates: set("rdate")?,
        exdates: set("exdate")?,
    })
}

/// Stored reminder minutes are positive before the start; triggers are negative before it.
pub fn minutes_before(alarm: &Alarm) -> i64 {
    -alarm.trigger.num_minutes()
}

pub fn trigger_from_minutes(minutes: i64) -> Result<Duration, CoreError> {
    minutes
        .checked_neg()
        .and_then(Duration::try_minutes)
        .ok_or_else(|| CoreError::malformed(minutes.to_string(), "reminder minutes out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlarmAction, TimeSpan};
    use chrono::NaiveDate;

    fn date(d: u32) -> TimeValue {
        TimeValue::Date(NaiveDate::from_ymd_opt(2024, 5, d).unwrap())
    }

    #[test]
    fn test_reminder_sign_convention() {
        let alarm = Alarm {
            trigger: Duration::minutes(-15),
            action: AlarmAction::Display,
            description: None,
        };
        assert_eq!(minutes_before(&alarm), 15);
        assert_eq!(trigger_from_minutes(15).unwrap(), Duration::minutes(-15));
    }

    #[test]
    fn test_exception_anchor_cut_to_master_kind() {
        let master = CalendarEntity::event("u1", TimeSpan::new(date(1)));
        let mut exception = CalendarEntity::event("u1", TimeSpan::new(date(3)));
        exception.recurrence_id = Some(TimeValue::DateTime(
            chrono::TimeZone::with_ymd_and_hms(&Tz::UTC, 2024, 5, 2, 10, 0, 0).unwrap(),
        ));

        let mapped = exception_to_rows(&exception, &master, &MappingContext::default()).unwrap();
        let values = &mapped.rows.values;
        assert_eq!(values.text("original_sync_id"), Some("u1"));
        assert_eq!(values.integer("original_all_day"), Some(1));
        assert_eq!(values.integer("original_instance_time"), Some(date(2).epoch_millis()));
        assert_eq!(read_exception_anchor(values, Tz::UTC).unwrap(), Some(date(2)));
    }

    #[test]
    fn test_exception_requires_anchor_and_same_kind() {
        let master = CalendarEntity::event("u1", TimeSpan::new(date(1)));
        let exception = CalendarEntity::event("u1", TimeSpan::new(date(3)));
        assert!(exception_to_rows(&exception, &master, &MappingContext::default()).is_err());

        let mut task = CalendarEntity::task("u1", Default::default());
        task.recurrence_id = Some(date(2));
        assert!(exception_to_rows(&task, &master, &MappingContext::default()).is_err());
    }
}
