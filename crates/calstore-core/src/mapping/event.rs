//! Event rows: `events` plus `reminders`, `attendees` and `extended_properties`.

use super::policy::{
    correct_all_day_end, correct_timed_end, encode_end, organizer_for_storage,
    organizer_from_storage, ClassificationPolicy, EndEncoding,
};
use super::unknown::{decode_all, encode_all, UNKNOWN_PROPERTY_NAME};
use super::{
    minutes_before, read_exception_anchor, read_recurrence, trigger_from_minutes,
    write_recurrence, ChildRow, EntityRows, MappedRows, MappingContext, RowSet,
};
use crate::duration::{format_duration, parse_duration};
use crate::error::CoreError;
use crate::mapping::dates::time_from_storage;
use crate::models::{
    mailto_address, Alarm, AlarmAction, CalendarEntity, EntityKind, EventData, EventStatus,
    Participant, ParticipantRole, ParticipationStatus, TimeSpan,
};
use crate::store::{Table, Values};

/// Foreign key column of the event child tables
pub const EVENT_ID: &str = "event_id";

pub const STATUS_TENTATIVE: i64 = 0;
pub const STATUS_CONFIRMED: i64 = 1;
pub const STATUS_CANCELED: i64 = 2;

pub const AVAILABILITY_BUSY: i64 = 0;
pub const AVAILABILITY_FREE: i64 = 1;

pub const METHOD_DEFAULT: i64 = 0;
pub const METHOD_ALERT: i64 = 1;
pub const METHOD_EMAIL: i64 = 2;
pub const METHOD_SMS: i64 = 3;
pub const METHOD_ALARM: i64 = 4;

pub const RELATIONSHIP_NONE: i64 = 0;
pub const RELATIONSHIP_ATTENDEE: i64 = 1;
pub const RELATIONSHIP_ORGANIZER: i64 = 2;

pub const TYPE_NONE: i64 = 0;
pub const TYPE_REQUIRED: i64 = 1;
pub const TYPE_OPTIONAL: i64 = 2;
pub const TYPE_RESOURCE: i64 = 3;

pub const ATTENDEE_STATUS_NONE: i64 = 0;
pub const ATTENDEE_STATUS_ACCEPTED: i64 = 1;
pub const ATTENDEE_STATUS_DECLINED: i64 = 2;
pub const ATTENDEE_STATUS_INVITED: i64 = 3;
pub const ATTENDEE_STATUS_TENTATIVE: i64 = 4;

// ============================================================================
// Write
// ============================================================================

/// Maps an event to its rows.
///
/// # Behavior
///
/// - All-day events always get an end after their start (start + 1 day otherwise);
///   timed events without a valid end become zero-length
/// - Recurring events store a duration instead of an end
/// - Confidential classification is stored as private plus a retained property
/// - Opaque properties larger than the configured limit are dropped with a warning
pub fn event_to_rows(
    entity: &CalendarEntity,
    event: &EventData,
    ctx: &MappingContext,
) -> Result<MappedRows, CoreError> {
    let mut values = Values::new();
    let mut corrections = Vec::new();

    values
        .put("uid", entity.uid.as_str())
        .put("sequence", entity.sequence)
        .put_opt("title", entity.summary.as_deref())
        .put_opt("event_location", entity.location.as_deref())
        .put_opt("description", entity.description.as_deref());

    let span = &event.span;
    let start = &span.start;
    let all_day = span.is_all_day();
    let (end, correction) = if all_day {
        correct_all_day_end(&entity.uid, start, span.effective_end()?)?
    } else {
        correct_timed_end(&entity.uid, start, span.effective_end()?)
    };
    let explicit_duration = match (&correction, &span.end) {
        (None, None) => span.duration,
        _ => None,
    };
    corrections.extend(correction);

    values
        .put("dtstart", start.epoch_millis())
        .put("event_timezone", start.zone_id())
        .put("all_day", all_day);
    match encode_end(entity.recurrence.is_recurring(), start, &end, explicit_duration) {
        EndEncoding::End(end) => {
            values
                .put("dtend", end.epoch_millis())
                .put("event_end_timezone", end.zone_id());
        }
        EndEncoding::Duration(duration) => {
            values.put("duration", format_duration(duration));
        }
    }
    write_recurrence(&mut values, &entity.recurrence, all_day);

    values
        .put_opt("status", event.status.map(status_code))
        .put(
            "availability",
            if event.opaque {
                AVAILABILITY_BUSY
            } else {
                AVAILABILITY_FREE
            },
        );

    let (access_level, retained) = ClassificationPolicy::write(entity.classification);
    values.put("access_level", access_level);

    let (organizer, correction) = organizer_for_storage(
        &entity.uid,
        entity.organizer.as_deref(),
        !entity.participants.is_empty(),
    );
    corrections.extend(correction);
    values
        .put_opt("organizer", organizer)
        .put("has_attendee_data", true);

    let mut children: Vec<ChildRow> = entity
        .alarms
        .iter()
        .map(|alarm| child(Table::Reminders, reminder_values(alarm)))
        .collect();
    children.extend(
        entity
            .participants
            .iter()
            .map(|p| child(Table::Attendees, attendee_values(p))),
    );

    let mut unknown = entity.unknown_properties.clone();
    unknown.extend(retained);
    let (encoded, warnings) = encode_all(&unknown, ctx.max_unknown_property_size)?;
    children.extend(encoded.into_iter().map(|json| {
        let mut values = Values::new();
        values.put("name", UNKNOWN_PROPERTY_NAME).put("value", json);
        child(Table::ExtendedProperties, values)
    }));

    Ok(MappedRows {
        rows: RowSet {
            table: Table::Events,
            values,
            children,
        },
        corrections,
        warnings,
    })
}

fn child(table: Table, values: Values) -> ChildRow {
    ChildRow {
        table,
        foreign_key: EVENT_ID,
        values,
    }
}

fn status_code(status: EventStatus) -> i64 {
    match status {
        EventStatus::Tentative => STATUS_TENTATIVE,
        EventStatus::Confirmed => STATUS_CONFIRMED,
        EventStatus::Cancelled => STATUS_CANCELED,
    }
}

fn reminder_values(alarm: &Alarm) -> Values {
    let method = match alarm.action {
        AlarmAction::Display => METHOD_ALERT,
        AlarmAction::Email => METHOD_EMAIL,
        AlarmAction::Audio => METHOD_ALARM,
    };
    let mut values = Values::new();
    values
        .put("minutes", minutes_before(alarm))
        .put("method", method);
    values
}

/// `mailto:` addresses are stored as email; other URIs keep their scheme and identity.
fn attendee_values(participant: &Participant) -> Values {
    let mut values = Values::new();
    values.put_opt("attendee_name", participant.name.as_deref());
    match mailto_address(&participant.address) {
        Some(email) => {
            values.put("attendee_email", email);
        }
        None => {
            let namespace = participant
                .address
                .split_once(':')
                .map_or("", |(scheme, _)| scheme);
            values
                .put("attendee_id_namespace", namespace)
                .put("attendee_identity", participant.address.as_str())
                .put_opt("attendee_email", participant.email.as_deref());
        }
    }

    let (relationship, attendee_type) = role_codes(participant.role);
    let status = match participant.status {
        ParticipationStatus::NeedsAction => ATTENDEE_STATUS_INVITED,
        ParticipationStatus::Accepted => ATTENDEE_STATUS_ACCEPTED,
        ParticipationStatus::Declined => ATTENDEE_STATUS_DECLINED,
        ParticipationStatus::Tentative => ATTENDEE_STATUS_TENTATIVE,
    };
    values
        .put("attendee_relationship", relationship)
        .put("attendee_type", attendee_type)
        .put("attendee_status", status);
    values
}

/// `(relationship, type)` of a role
fn role_codes(role: ParticipantRole) -> (i64, i64) {
    match role {
        ParticipantRole::Chair => (RELATIONSHIP_ORGANIZER, TYPE_REQUIRED),
        ParticipantRole::Required => (RELATIONSHIP_ATTENDEE, TYPE_REQUIRED),
        ParticipantRole::Optional => (RELATIONSHIP_ATTENDEE, TYPE_OPTIONAL),
        ParticipantRole::Resource => (RELATIONSHIP_ATTENDEE, TYPE_RESOURCE),
        ParticipantRole::NonParticipant => (RELATIONSHIP_NONE, TYPE_NONE),
    }
}

// ============================================================================
// Read
// ============================================================================

/// Reads an event back from its rows.
///
/// A stored end wins over a stored duration; a duration is kept as such.
pub fn event_from_rows(rows: &EntityRows, ctx: &MappingContext) -> Result<CalendarEntity, CoreError> {
    let values = &rows.row.values;
    let uid = values.text("uid").unwrap_or_default();
    let all_day = values.flag("all_day");

    let start_millis = values
        .integer("dtstart")
        .ok_or_else(|| CoreError::invalid_entity(uid, "stored event without start time"))?;
    let start = time_from_storage(
        start_millis,
        values.text("event_timezone"),
        all_day,
        ctx.default_zone,
    )?;
    let end = values
        .integer("dtend")
        .map(|millis| {
            let zone = values
                .text("event_end_timezone")
                .or_else(|| values.text("event_timezone"));
            time_from_storage(millis, zone, all_day, ctx.default_zone)
        })
        .transpose()?;
    let duration = match (&end, values.text("duration")) {
        (None, Some(text)) => Some(parse_duration(text)?),
        _ => None,
    };

    let status = values.integer("status").and_then(|code| match code {
        STATUS_TENTATIVE => Some(EventStatus::Tentative),
        STATUS_CONFIRMED => Some(EventStatus::Confirmed),
        STATUS_CANCELED => Some(EventStatus::Cancelled),
        _ => None,
    });
    let opaque = values.integer("availability") != Some(AVAILABILITY_FREE);

    let mut entity = CalendarEntity::new(
        uid,
        EntityKind::Event(EventData {
            span: TimeSpan {
                start,
                end,
                duration,
            },
            status,
            opaque,
        }),
    );
    entity.sequence = values
        .integer("sequence")
        .and_then(|s| i32::try_from(s).ok())
        .unwrap_or(0);
    entity.summary = values.text("title").map(str::to_string);
    entity.location = values.text("event_location").map(str::to_string);
    entity.description = values.text("description").map(str::to_string);
    entity.recurrence = read_recurrence(values, all_day, ctx.default_zone)?;
    entity.recurrence_id = read_exception_anchor(values, ctx.default_zone)?;

    entity.alarms = rows
        .children_in(Table::Reminders)
        .map(|reminder| alarm_from_values(reminder, entity.summary.as_deref()))
        .collect::<Result<_, _>>()?;
    entity.participants = rows
        .children_in(Table::Attendees)
        .map(participant_from_values)
        .collect();
    entity.organizer =
        organizer_from_storage(values.text("organizer"), !entity.participants.is_empty());

    let mut unknown = decode_all(
        rows.children_in(Table::ExtendedProperties)
            .filter(|p| p.text("name") == Some(UNKNOWN_PROPERTY_NAME))
            .filter_map(|p| p.text("value")),
    );
    entity.classification =
        ClassificationPolicy::read(values.integer("access_level").unwrap_or(0), &mut unknown);
    entity.unknown_properties = unknown;

    Ok(entity)
}

fn alarm_from_values(values: &Values, summary: Option<&str>) -> Result<Alarm, CoreError> {
    let action = match values.integer("method").unwrap_or(METHOD_DEFAULT) {
        METHOD_EMAIL | METHOD_SMS => AlarmAction::Email,
        METHOD_ALARM => AlarmAction::Audio,
        _ => AlarmAction::Display,
    };
    Ok(Alarm {
        trigger: trigger_from_minutes(values.integer("minutes").unwrap_or(0))?,
        action,
        description: summary.map(str::to_string),
    })
}

fn participant_from_values(values: &Values) -> Participant {
    let email = values.text("attendee_email");
    let (address, email) = match values.text("attendee_identity") {
        Some(identity) => (identity.to_string(), email.map(str::to_string)),
        None => (format!("mailto:{}", email.unwrap_or_default()), None),
    };

    let relationship = values.integer("attendee_relationship").unwrap_or(RELATIONSHIP_NONE);
    let attendee_type = values.integer("attendee_type").unwrap_or(TYPE_NONE);
    let role = match (relationship, attendee_type) {
        (RELATIONSHIP_ORGANIZER, _) => ParticipantRole::Chair,
        (_, TYPE_RESOURCE) => ParticipantRole::Resource,
        (_, TYPE_OPTIONAL) => ParticipantRole::Optional,
        (RELATIONSHIP_NONE, TYPE_NONE) => ParticipantRole::NonParticipant,
        _ => ParticipantRole::Required,
    };
    let status = match values.integer("attendee_status").unwrap_or(ATTENDEE_STATUS_NONE) {
        ATTENDEE_STATUS_ACCEPTED => ParticipationStatus::Accepted,
        ATTENDEE_STATUS_DECLINED => ParticipationStatus::Declined,
        ATTENDEE_STATUS_TENTATIVE => ParticipationStatus::Tentative,
        _ => ParticipationStatus::NeedsAction,
    };

    Participant {
        address,
        email,
        name: values.text("attendee_name").map(str::to_string),
        role,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::entity_to_rows;
    use crate::mapping::policy::ACCESS_PRIVATE;
    use crate::models::{Classification, TimeValue, UnknownProperty};
    use crate::store::StoredRow;
    use chrono::{Duration, NaiveDate, TimeZone};
    use chrono_tz::Europe::Vienna;
    use rstest::rstest;

    fn date(d: u32) -> TimeValue {
        TimeValue::Date(NaiveDate::from_ymd_opt(2024, 5, d).unwrap())
    }

    fn vienna(d: u32, h: u32) -> TimeValue {
        TimeValue::DateTime(Vienna.with_ymd_and_hms(2024, 5, d, h, 0, 0).unwrap())
    }

    /// Simulates storing the rows and reading them back.
    fn stored(mapped: &MappedRows) -> EntityRows {
        EntityRows {
            table: mapped.rows.table,
            row: StoredRow {
                id: 1,
                values: mapped.rows.values.clone(),
            },
            children: mapped
                .rows
                .children
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    (
                        c.table,
                        StoredRow {
                            id: i as i64 + 10,
                            values: c.values.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn round_trip(entity: &CalendarEntity) -> CalendarEntity {
        let ctx = MappingContext::default();
        let mapped = entity_to_rows(entity, &ctx).unwrap();
        event_from_rows(&stored(&mapped), &ctx).unwrap()
    }

    #[test]
    fn test_all_day_without_end_gets_next_day() {
        let entity = CalendarEntity::event("u1", TimeSpan::new(date(1)));
        let mapped = entity_to_rows(&entity, &MappingContext::default()).unwrap();

        assert_eq!(mapped.rows.values.integer("dtend"), Some(date(2).epoch_millis()));
        assert_eq!(mapped.rows.values.integer("all_day"), Some(1));
        assert_eq!(mapped.rows.values.text("event_timezone"), Some("UTC"));
        assert_eq!(mapped.corrections.len(), 1);

        let read = event_from_rows(&stored(&mapped), &MappingContext::default()).unwrap();
        let EntityKind::Event(event) = read.kind else {
            panic!("expected an event");
        };
        assert_eq!(event.span.end, Some(date(2)));
    }

    #[test]
    fn test_timed_round_trip() {
        let mut entity = CalendarEntity::event("u1", TimeSpan::with_end(vienna(1, 10), vienna(1, 11)));
        entity.summary = Some("Standup".to_string());
        entity.location = Some("Room 1".to_string());
        entity.sequence = 3;
        if let EntityKind::Event(event) = &mut entity.kind {
            event.status = Some(EventStatus::Confirmed);
            event.opaque = false;
        }
        entity.unknown_properties.push(UnknownProperty::new("X-FOO", "bar"));

        assert_eq!(round_trip(&entity), entity);
    }

    #[test]
    fn test_recurring_event_stores_duration() {
        let mut entity = CalendarEntity::event("u1", TimeSpan::with_end(vienna(1, 10), vienna(1, 12)));
        entity.recurrence.rrule = Some("FREQ=WEEKLY".to_string());
        let mapped = entity_to_rows(&entity, &MappingContext::default()).unwrap();

        assert_eq!(mapped.rows.values.text("duration"), Some("PT2H"));
        assert_eq!(mapped.rows.values.get("dtend"), None);

        let read = round_trip(&entity);
        let EntityKind::Event(event) = read.kind else {
            panic!("expected an event");
        };
        assert_eq!(event.span.end, None);
        assert_eq!(event.span.duration, Some(Duration::hours(2)));
    }

    #[test]
    fn test_reminder_minutes_are_positive_before_start() {
        let mut entity = CalendarEntity::event("u1", TimeSpan::new(vienna(1, 10)));
        entity.summary = Some("Dentist".to_string());
        entity.alarms.push(Alarm {
            trigger: Duration::minutes(-30),
            action: AlarmAction::Display,
            description: Some("Dentist".to_string()),
        });
        let mapped = entity_to_rows(&entity, &MappingContext::default()).unwrap();
        let reminder = &mapped.rows.children[0];
        assert_eq!(reminder.table, Table::Reminders);
        assert_eq!(reminder.values.integer("minutes"), Some(30));
        assert_eq!(reminder.values.integer("method"), Some(METHOD_ALERT));

        assert_eq!(round_trip(&entity).alarms, entity.alarms);
    }

    #[test]
    fn test_out_of_range_stored_values_are_malformed() {
        let mut entity = CalendarEntity::event("u1", TimeSpan::new(vienna(1, 10)));
        entity.alarms.push(Alarm {
            trigger: Duration::minutes(-30),
            action: AlarmAction::Display,
            description: None,
        });
        let ctx = MappingContext::default();
        let mut rows = stored(&entity_to_rows(&entity, &ctx).unwrap());

        rows.children[0].1.values.put("minutes", i64::MAX);
        assert!(matches!(
            event_from_rows(&rows, &ctx),
            Err(CoreError::MalformedTemporalValue { .. })
        ));

        rows.children[0].1.values.put("minutes", i64::MIN);
        assert!(event_from_rows(&rows, &ctx).is_err());
    }

    #[rstest]
    #[case(ParticipantRole::Chair)]
    #[case(ParticipantRole::Required)]
    #[case(ParticipantRole::Optional)]
    #[case(ParticipantRole::Resource)]
    #[case(ParticipantRole::NonParticipant)]
    fn test_participant_roles_round_trip(#[case] role: ParticipantRole) {
        let mut participant = Participant::mailto("alice@example.com");
        participant.role = role;
        participant.status = ParticipationStatus::Accepted;
        assert_eq!(participant_from_values(&attendee_values(&participant)), participant);
    }

    #[test]
    fn test_non_mailto_participant_keeps_identity() {
        let participant = Participant {
            address: "urn:uuid:1234".to_string(),
            email: Some("bob@example.com".to_string()),
            name: Some("Bob".to_string()),
            role: ParticipantRole::Required,
            status: ParticipationStatus::NeedsAction,
        };
        let values = attendee_values(&participant);
        assert_eq!(values.text("attendee_id_namespace"), Some("urn"));
        assert_eq!(values.text("attendee_email"), Some("bob@example.com"));
        assert_eq!(values.integer("attendee_status"), Some(ATTENDEE_STATUS_INVITED));
        assert_eq!(participant_from_values(&values), participant);
    }

    #[test]
    fn test_organizer_kept_only_with_participants() {
        let mut entity = CalendarEntity::event("u1", TimeSpan::new(vienna(1, 10)));
        entity.organizer = Some("mailto:boss@example.com".to_string());
        assert_eq!(round_trip(&entity).organizer, None);

        entity.participants.push(Participant::mailto("alice@example.com"));
        assert_eq!(
            round_trip(&entity).organizer.as_deref(),
            Some("mailto:boss@example.com")
        );
    }

    #[test]
    fn test_confidential_round_trip() {
        let mut entity = CalendarEntity::event("u1", TimeSpan::new(vienna(1, 10)));
        entity.classification = Some(Classification::Confidential);
        let mapped = entity_to_rows(&entity, &MappingContext::default()).unwrap();
        assert_eq!(
            mapped.rows.values.integer("access_level"),
            Some(ACCESS_PRIVATE)
        );

        let read = round_trip(&entity);
        assert_eq!(read.classification, Some(Classification::Confidential));
        assert!(read.unknown_properties.is_empty());
    }

    #[test]
    fn test_oversize_unknown_property_dropped() {
        let mut entity = CalendarEntity::event("u1", TimeSpan::new(vienna(1, 10)));
        entity
            .unknown_properties
            .push(UnknownProperty::new("X-HUGE", "x".repeat(200)));
        let ctx = MappingContext {
            max_unknown_property_size: 100,
            ..MappingContext::default()
        };
        let mapped = entity_to_rows(&entity, &ctx).unwrap();
        assert!(mapped.rows.children.is_empty());
        assert_eq!(mapped.warnings.len(), 1);
        assert!(mapped.warnings[0].is_recoverable());
    }

    #[test]
    fn test_recurrence_sets_round_trip() {
        let mut entity = CalendarEntity::event("u1", TimeSpan::with_end(date(1), date(2)));
        entity.recurrence.rrule = Some("FREQ=DAILY;COUNT=5".to_string());
        entity.recurrence.exdates = vec![date(3)];
        entity.recurrence.rdates = vec![date(10), date(12)];

        let read = round_trip(&entity);
        assert_eq!(read.recurrence, entity.recurrence);
    }
}
