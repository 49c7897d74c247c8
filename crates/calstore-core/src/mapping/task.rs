//! Task rows: `tasks` plus typed `task_properties` rows.
//!
//! Sub-records are stored as property rows keyed by `mimetype`:
//!
//! | mimetype   | data0          | data1  | data2       | data3 | data4  |
//! |------------|----------------|--------|-------------|-------|--------|
//! | `alarm`    | minutes before | action | description |       |        |
//! | `attendee` | address        | name   | email       | role  | status |
//! | `unknown`  | JSON encoding  |        |             |       |        |

use super::policy::{organizer_for_storage, organizer_from_storage};
use super::unknown::{decode_all, encode_all};
use super::{
    minutes_before, read_exception_anchor, read_recurrence, trigger_from_minutes,
    write_recurrence, ChildRow, EntityRows, MappedRows, MappingContext, RowSet,
};
use crate::component::parse_geo;
use crate::duration::{format_duration, parse_duration};
use crate::error::CoreError;
use crate::mapping::dates::{instant_from_millis, time_from_storage};
use crate::models::{
    Alarm, AlarmAction, CalendarEntity, Classification, Participant, TaskData, TaskStatus,
    TimeValue,
};
use crate::store::{Table, Values};
use chrono::{DateTime, Utc};
use log::debug;

/// Foreign key column of task property rows
pub const TASK_ID: &str = "task_id";

pub const MIMETYPE_ALARM: &str = "alarm";
pub const MIMETYPE_ATTENDEE: &str = "attendee";
pub const MIMETYPE_UNKNOWN: &str = "unknown";

pub const CLASSIFICATION_PUBLIC: i64 = 0;
pub const CLASSIFICATION_PRIVATE: i64 = 1;
pub const CLASSIFICATION_CONFIDENTIAL: i64 = 2;

pub const STATUS_NEEDS_ACTION: i64 = 0;
pub const STATUS_IN_PROCESS: i64 = 1;
pub const STATUS_COMPLETED: i64 = 2;
pub const STATUS_CANCELLED: i64 = 3;

// ============================================================================
// Write
// ============================================================================

/// Maps a task to its rows.
///
/// # Behavior
///
/// - A task is all-day when its start or due is date-only; both are then stored as dates
///   and the `tz` column stays empty
/// - `tz` holds the zone of the start, or of the due when there is no start
/// - A duration is stored only for tasks without due
pub fn task_to_rows(
    entity: &CalendarEntity,
    task: &TaskData,
    ctx: &MappingContext,
) -> Result<MappedRows, CoreError> {
    let mut values = Values::new();
    let mut corrections = Vec::new();

    values
        .put("uid", entity.uid.as_str())
        .put("sequence", entity.sequence)
        .put_opt("title", entity.summary.as_deref())
        .put_opt("location", entity.location.as_deref())
        .put_opt("description", entity.description.as_deref())
        .put_opt("url", task.url.as_deref())
        .put_opt("priority", task.priority)
        .put_opt("percent_complete", task.percent_complete)
        .put_opt("classification", entity.classification.map(classification_code))
        .put_opt("status", task.status.map(status_code))
        .put_opt("completed", task.completed.map(|t| t.timestamp_millis()))
        .put_opt("created", task.created.map(|t| t.timestamp_millis()))
        .put_opt("last_modified", task.last_modified.map(|t| t.timestamp_millis()))
        .put_opt(
            "geo",
            task.geo.map(|g| format!("{},{}", g.latitude, g.longitude)),
        );

    let all_day = entity.is_all_day();
    let as_stored = |value: &TimeValue| {
        if all_day {
            TimeValue::Date(value.date())
        } else {
            value.clone()
        }
    };
    let start = task.start.as_ref().map(as_stored);
    let due = task.due.as_ref().map(as_stored);

    let zone = if all_day {
        None
    } else {
        start.as_ref().or(due.as_ref()).map(TimeValue::zone_id)
    };
    values
        .put("is_allday", all_day)
        .put_opt("tz", zone)
        .put_opt("dtstart", start.as_ref().map(TimeValue::epoch_millis))
        .put_opt("due", due.as_ref().map(TimeValue::epoch_millis));
    if due.is_none() {
        values.put_opt("duration", task.duration.map(format_duration));
    }
    write_recurrence(&mut values, &entity.recurrence, all_day);

    let (organizer, correction) = organizer_for_storage(
        &entity.uid,
        entity.organizer.as_deref(),
        !entity.participants.is_empty(),
    );
    corrections.extend(correction);
    values.put_opt("organizer", organizer);

    let mut children: Vec<ChildRow> = entity.alarms.iter().map(alarm_row).collect();
    children.extend(entity.participants.iter().map(attendee_row));

    let (encoded, warnings) =
        encode_all(&entity.unknown_properties, ctx.max_unknown_property_size)?;
    children.extend(encoded.into_iter().map(|json| {
        let mut values = Values::new();
        values.put("data0", json);
        property_row(MIMETYPE_UNKNOWN, values)
    }));

    Ok(MappedRows {
        rows: RowSet {
            table: Table::Tasks,
            values,
            children,
        },
        corrections,
        warnings,
    })
}

fn property_row(mimetype: &str, mut values: Values) -> ChildRow {
    values.put("mimetype", mimetype);
    ChildRow {
        table: Table::TaskProperties,
        foreign_key: TASK_ID,
        values,
    }
}

fn alarm_row(alarm: &Alarm) -> ChildRow {
    let mut values = Values::new();
    values
        .put("data0", minutes_before(alarm).to_string())
        .put("data1", alarm.action.as_str())
        .put_opt("data2", alarm.description.as_deref());
    property_row(MIMETYPE_ALARM, values)
}

fn attendee_row(participant: &Participant) -> ChildRow {
    let mut values = Values::new();
    values
        .put("data0", participant.address.as_str())
        .put_opt("data1", participant.name.as_deref())
        .put_opt("data2", participant.email.as_deref())
        .put("data3", participant.role.as_str())
        .put("data4", participant.status.as_str());
    property_row(MIMETYPE_ATTENDEE, values)
}

fn classification_code(classification: Classification) -> i64 {
    match classification {
        Classification::Public => CLASSIFICATION_PUBLIC,
        Classification::Private => CLASSIFICATION_PRIVATE,
        Classification::Confidential => CLASSIFICATION_CONFIDENTIAL,
    }
}

fn status_code(status: TaskStatus) -> i64 {
    match status {
        TaskStatus::NeedsAction => STATUS_NEEDS_ACTION,
        TaskStatus::InProcess => STATUS_IN_PROCESS,
        TaskStatus::Completed => STATUS_COMPLETED,
        TaskStatus::Cancelled => STATUS_CANCELLED,
    }
}

// ============================================================================
// Read
// ============================================================================

pub fn task_from_rows(rows: &EntityRows, ctx: &MappingContext) -> Result<CalendarEntity, CoreError> {
    let values = &rows.row.values;
    let uid = values.text("uid").unwrap_or_default();
    let all_day = values.flag("is_allday");
    let zone = values.text("tz");

    let time = |column: &str| -> Result<Option<TimeValue>, CoreError> {
        values
            .integer(column)
            .map(|millis| time_from_storage(millis, zone, all_day, ctx.default_zone))
            .transpose()
    };
    let instant = |column: &str| -> Result<Option<DateTime<Utc>>, CoreError> {
        values.integer(column).map(instant_from_millis).transpose()
    };

    let start = time("dtstart")?;
    let due = time("due")?;
    if start.is_none() && due.is_none() {
        return Err(CoreError::invalid_entity(uid, "stored task without start or due"));
    }
    let duration = match (&due, values.text("duration")) {
        (None, Some(text)) => Some(parse_duration(text)?),
        _ => None,
    };

    let task = TaskData {
        start,
        due,
        duration,
        completed: instant("completed")?,
        percent_complete: values.integer("percent_complete").and_then(|p| u8::try_from(p).ok()),
        priority: values.integer("priority").and_then(|p| u8::try_from(p).ok()),
        geo: values.text("geo").and_then(parse_geo),
        status: values.integer("status").and_then(|code| match code {
            STATUS_NEEDS_ACTION => Some(TaskStatus::NeedsAction),
            STATUS_IN_PROCESS => Some(TaskStatus::InProcess),
            STATUS_COMPLETED => Some(TaskStatus::Completed),
            STATUS_CANCELLED => Some(TaskStatus::Cancelled),
            _ => None,
        }),
        url: values.text("url").map(str::to_string),
        created: instant("created")?,
        last_modified: instant("last_modified")?,
    };

    let mut entity = CalendarEntity::task(uid, task);
    entity.sequence = values
        .integer("sequence")
        .and_then(|s| i32::try_from(s).ok())
        .unwrap_or(0);
    entity.summary = values.text("title").map(str::to_string);
    entity.location = values.text("location").map(str::to_string);
    entity.description = values.text("description").map(str::to_string);
    entity.classification = values.integer("classification").and_then(|code| match code {
        CLASSIFICATION_PUBLIC => Some(Classification::Public),
        CLASSIFICATION_PRIVATE => Some(Classification::Private),
        CLASSIFICATION_CONFIDENTIAL => Some(Classification::Confidential),
        _ => None,
    });
    entity.recurrence = read_recurrence(values, all_day, ctx.default_zone)?;
    entity.recurrence_id = read_exception_anchor(values, ctx.default_zone)?;

    let properties = |mimetype: &'static str| {
        rows.children_in(Table::TaskProperties)
            .filter(move |p| p.text("mimetype") == Some(mimetype))
    };
    entity.alarms = properties(MIMETYPE_ALARM)
        .filter_map(|p| alarm_from_values(p).transpose())
        .collect::<Result<_, _>>()?;
    entity.participants = properties(MIMETYPE_ATTENDEE)
        .filter_map(participant_from_values)
        .collect();
    entity.unknown_properties =
        decode_all(properties(MIMETYPE_UNKNOWN).filter_map(|p| p.text("data0")));
    entity.organizer =
        organizer_from_storage(values.text("organizer"), !entity.participants.is_empty());

    Ok(entity)
}

fn alarm_from_values(values: &Values) -> Result<Option<Alarm>, CoreError> {
    let Some(minutes) = values.text("data0").and_then(|m| m.trim().parse().ok()) else {
        debug!("Skipping task alarm without offset");
        return Ok(None);
    };
    Ok(Some(Alarm {
        trigger: trigger_from_minutes(minutes)?,
        action: values
            .text("data1")
            .and_then(|a| a.parse().ok())
            .unwrap_or(AlarmAction::Display),
        description: values.text("data2").map(str::to_string),
    }))
}

fn participant_from_values(values: &Values) -> Option<Participant> {
    let address = values.text("data0")?;
    let mut participant = Participant::mailto("");
    participant.address = address.to_string();
    participant.name = values.text("data1").map(str::to_string);
    participant.email = values.text("data2").map(str::to_string);
    if let Some(role) = values.text("data3").and_then(|r| r.parse().ok()) {
        participant.role = role;
    }
    if let Some(status) = values.text("data4").and_then(|s| s.parse().ok()) {
        participant.status = status;
    }
    Some(participant)
}
