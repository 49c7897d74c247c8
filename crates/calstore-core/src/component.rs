//! Parsed calendar components and the builder that turns one component into a
//! [`CalendarEntity`].
//!
//! Components arrive as property bags: the exchange-format grammar is handled by the
//! parser, which delivers names, raw values and parameters.

use crate::duration::parse_duration;
use crate::error::CoreError;
use crate::models::{
    Alarm, AlarmAction, CalendarEntity, Classification, EntityKind, EventData, EventStatus,
    GeoPosition, Participant, ParticipantRole, ParticipationStatus, RecurrenceSpec, TaskData,
    TaskStatus, TimeSpan, TimeValue, UnknownProperty,
};
use crate::timezone::{RawTemporal, TimeNormalizer};
use chrono::{DateTime, Duration, Utc};
use log::warn;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Event,
    Task,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProperty {
    pub name: String,
    pub value: String,
    pub parameters: BTreeMap<String, String>,
}

impl RawProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_uppercase(),
            value: value.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The value as a temporal value, honoring `TZID` and `VALUE=DATE`.
    pub fn temporal(&self) -> RawTemporal {
        self.temporal_value(&self.value)
    }

    /// Every value of a comma-separated list property (RDATE, EXDATE).
    ///
    /// PERIOD values contribute their start.
    pub fn temporal_list(&self) -> Vec<RawTemporal> {
        self.value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| self.temporal_value(v.split('/').next().unwrap_or(v)))
            .collect()
    }

    fn temporal_value(&self, value: &str) -> RawTemporal {
        RawTemporal {
            value: value.to_string(),
            tzid: self.param("TZID").map(str::to_string),
            date_only: self
                .param("VALUE")
                .map_or(false, |v| v.eq_ignore_ascii_case("DATE")),
        }
    }
}

/// A VALARM sub-component.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawAlarm {
    pub properties: Vec<RawProperty>,
}

/// One VEVENT or VTODO as produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawComponent {
    pub kind: ComponentKind,
    pub properties: Vec<RawProperty>,
    pub alarms: Vec<RawAlarm>,
}

impl RawComponent {
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            properties: Vec::new(),
            alarms: Vec::new(),
        }
    }

    pub fn event() -> Self {
        Self::new(ComponentKind::Event)
    }

    pub fn task() -> Self {
        Self::new(ComponentKind::Task)
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.properties.push(RawProperty::new(name, value));
        self
    }

    pub fn with_params(mut self, name: &str, value: &str, params: &[(&str, &str)]) -> Self {
        let mut property = RawProperty::new(name, value);
        for (key, param) in params {
            property
                .parameters
                .insert(key.to_ascii_uppercase(), param.to_string());
        }
        self.properties.push(property);
        self
    }

    pub fn with_alarm(mut self, alarm: RawAlarm) -> Self {
        self.alarms.push(alarm);
        self
    }

    pub fn property(&self, name: &str) -> Option<&RawProperty> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn uid(&self) -> Option<&str> {
        self.property("UID")
            .map(|p| p.value.trim())
            .filter(|uid| !uid.is_empty())
    }

    /// SEQUENCE, defaulting to 0 when absent or unparseable.
    pub fn sequence(&self) -> i32 {
        self.property("SEQUENCE")
            .and_then(|p| p.value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn recurrence_id(&self) -> Option<&RawProperty> {
        self.property("RECURRENCE-ID")
    }

    /// Replaces (or adds) the UID property.
    pub fn set_uid(&mut self, uid: &str) {
        self.properties.retain(|p| !p.name.eq_ignore_ascii_case("UID"));
        self.properties.insert(0, RawProperty::new("UID", uid));
    }
}

impl RawAlarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.properties.push(RawProperty::new(name, value));
        self
    }

    pub fn with_params(mut self, name: &str, value: &str, params: &[(&str, &str)]) -> Self {
        let mut property = RawProperty::new(name, value);
        for (key, param) in params {
            property
                .parameters
                .insert(key.to_ascii_uppercase(), param.to_string());
        }
        self.properties.push(property);
        self
    }

    fn property(&self, name: &str) -> Option<&RawProperty> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// Properties that carry no information worth storing.
const SKIPPED_PROPERTIES: &[&str] = &["PRODID", "DTSTAMP"];

/// An entity plus the recoverable conditions met while building it.
#[derive(Debug)]
pub struct BuiltEntity {
    pub entity: CalendarEntity,
    pub warnings: Vec<CoreError>,
}

/// Builds an entity from one component.
///
/// # Behavior
///
/// - Understood properties become typed fields; everything else except PRODID and
///   DTSTAMP is retained as an [`UnknownProperty`].
/// - RDATE/EXDATE fragments are concatenated in input order and converted to the
///   kind of the entity's start.
/// - Events require DTSTART; tasks require DTSTART or DUE. Otherwise `InvalidEntity`.
/// - An unparseable temporal value fails the entity with `MalformedTemporalValue`.
pub fn build_entity(
    component: &RawComponent,
    normalizer: &TimeNormalizer,
) -> Result<BuiltEntity, CoreError> {
    let uid = component.uid().unwrap_or_default().to_string();
    let mut builder = Builder {
        normalizer,
        warnings: Vec::new(),
    };

    // The kind payload is assembled once all time properties are known.
    let mut entity = CalendarEntity::new(uid.clone(), EntityKind::Task(TaskData::default()));
    entity.sequence = component.sequence();

    let mut start = None;
    let mut end = None;
    let mut due = None;
    let mut duration = None;
    let mut rdates = Vec::new();
    let mut exdates = Vec::new();
    let mut event_status = None;
    let mut opaque = true;
    let mut task = TaskData::default();

    for property in &component.properties {
        let name = property.name.as_str();
        match (component.kind, name) {
            (_, "UID") | (_, "SEQUENCE") => {}
            (_, name) if SKIPPED_PROPERTIES.contains(&name) => {}
            (_, "RECURRENCE-ID") => {
                entity.recurrence_id = Some(builder.time(&property.temporal())?);
            }
            (_, "SUMMARY") => entity.summary = Some(property.value.clone()),
            (_, "LOCATION") => entity.location = Some(property.value.clone()),
            (_, "DESCRIPTION") => entity.description = Some(property.value.clone()),
            (_, "CLASS") => match property.value.parse::<Classification>() {
                Ok(classification) => entity.classification = Some(classification),
                Err(_) => entity.unknown_properties.push(unknown(property)),
            },
            (_, "ORGANIZER") => entity.organizer = Some(property.value.trim().to_string()),
            (_, "ATTENDEE") => entity.participants.push(participant(property)),
            (_, "RRULE") => entity.recurrence.rrule = Some(property.value.trim().to_string()),
            (_, "EXRULE") => entity.recurrence.exrule = Some(property.value.trim().to_string()),
            (_, "RDATE") => {
                for raw in property.temporal_list() {
                    rdates.push(builder.time(&raw)?);
                }
            }
            (_, "EXDATE") => {
                for raw in property.temporal_list() {
                    exdates.push(builder.time(&raw)?);
                }
            }
            (_, "DTSTART") => start = Some(builder.time(&property.temporal())?),
            (_, "DURATION") => duration = Some(parse_duration(&property.value)?),
            (ComponentKind::Event, "DTEND") => end = Some(builder.time(&property.temporal())?),
            (ComponentKind::Event, "STATUS") => match property.value.parse::<EventStatus>() {
                Ok(status) => event_status = Some(status),
                Err(_) => entity.unknown_properties.push(unknown(property)),
            },
            (ComponentKind::Event, "TRANSP") => {
                opaque = !property.value.trim().eq_ignore_ascii_case("TRANSPARENT");
            }
            (ComponentKind::Task, "DUE") => due = Some(builder.time(&property.temporal())?),
            (ComponentKind::Task, "COMPLETED") => {
                task.completed = Some(builder.instant(property)?);
            }
            (ComponentKind::Task, "CREATED") => {
                task.created = Some(builder.instant(property)?);
            }
            (ComponentKind::Task, "LAST-MODIFIED") => {
                task.last_modified = Some(builder.instant(property)?);
            }
            (ComponentKind::Task, "PERCENT-COMPLETE") => {
                match property.value.trim().parse::<u8>() {
                    Ok(percent) if percent <= 100 => task.percent_complete = Some(percent),
                    _ => warn!("Ignoring invalid PERCENT-COMPLETE '{}'", property.value),
                }
            }
            (ComponentKind::Task, "PRIORITY") => match property.value.trim().parse::<u8>() {
                Ok(priority) if priority <= 9 => task.priority = Some(priority),
                _ => warn!("Ignoring invalid PRIORITY '{}'", property.value),
            },
            (ComponentKind::Task, "GEO") => match parse_geo(&property.value) {
                Some(geo) => task.geo = Some(geo),
                None => warn!("Ignoring invalid GEO '{}'", property.value),
            },
            (ComponentKind::Task, "STATUS") => match property.value.parse::<TaskStatus>() {
                Ok(status) => task.status = Some(status),
                Err(_) => entity.unknown_properties.push(unknown(property)),
            },
            (ComponentKind::Task, "URL") => {
                task.url = Some(property.value.trim().to_string());
            }
            _ => entity.unknown_properties.push(unknown(property)),
        }
    }

    let reference = match component.kind {
        ComponentKind::Event => {
            let start = start.ok_or_else(|| {
                CoreError::invalid_entity(uid.as_str(), "Event without start time")
            })?;
            let span = match end {
                Some(end) => TimeSpan::with_end(start.clone(), end.to_kind_of(&start)),
                None => TimeSpan {
                    duration,
                    ..TimeSpan::new(start.clone())
                },
            };
            entity.kind = EntityKind::Event(EventData {
                span,
                status: event_status,
                opaque,
            });
            start
        }
        ComponentKind::Task => {
            let reference = start.clone().or_else(|| due.clone()).ok_or_else(|| {
                CoreError::invalid_entity(uid.as_str(), "Task without start or due time")
            })?;
            task.start = start;
            task.due = due;
            task.duration = duration;
            entity.kind = EntityKind::Task(task);
            reference
        }
    };

    entity.recurrence = RecurrenceSpec {
        rdates: rdates.iter().map(|d| d.to_kind_of(&reference)).collect(),
        exdates: exdates.iter().map(|d| d.to_kind_of(&reference)).collect(),
        ..entity.recurrence
    };

    let span_length = match &entity.kind {
        EntityKind::Event(event) => event
            .span
            .effective_end()?
            .map(|e| e.since(&event.span.start)),
        EntityKind::Task(_) => None,
    };
    for alarm in &component.alarms {
        if let Some(alarm) = builder.alarm(alarm, &reference, span_length, entity.summary.as_deref())
        {
            entity.alarms.push(alarm);
        }
    }

    Ok(BuiltEntity {
        entity,
        warnings: builder.warnings,
    })
}

struct Builder<'a> {
    normalizer: &'a TimeNormalizer,
    warnings: Vec<CoreError>,
}

impl Builder<'_> {
    fn time(&mut self, raw: &RawTemporal) -> Result<TimeValue, CoreError> {
        let normalized = self.normalizer.normalize(raw)?;
        self.warnings.extend(normalized.fallback);
        Ok(normalized.value)
    }

    fn instant(&mut self, property: &RawProperty) -> Result<DateTime<Utc>, CoreError> {
        Ok(self.time(&property.temporal())?.to_utc())
    }

    fn alarm(
        &mut self,
        alarm: &RawAlarm,
        start: &TimeValue,
        span_length: Option<Duration>,
        summary: Option<&str>,
    ) -> Option<Alarm> {
        let action = alarm
            .property("ACTION")
            .and_then(|p| p.value.parse::<AlarmAction>().ok())
            .unwrap_or(AlarmAction::Display);

        let trigger = alarm.property("TRIGGER")?;
        let offset = if trigger
            .param("VALUE")
            .map_or(false, |v| v.eq_ignore_ascii_case("DATE-TIME"))
        {
            match self.time(&trigger.temporal()) {
                Ok(at) => at.since(start),
                Err(err) => {
                    warn!("Ignoring alarm with invalid trigger: {}", err);
                    return None;
                }
            }
        } else {
            match parse_duration(&trigger.value) {
                Ok(offset) => {
                    let related_end = trigger
                        .param("RELATED")
                        .map_or(false, |v| v.eq_ignore_ascii_case("END"));
                    match (related_end, span_length) {
                        (true, Some(length)) => match offset.checked_add(&length) {
                            Some(offset) => offset,
                            None => {
                                warn!("Ignoring alarm with out of range trigger: {}", trigger.value);
                                return None;
                            }
                        },
                        _ => offset,
                    }
                }
                Err(err) => {
                    warn!("Ignoring alarm with invalid trigger: {}", err);
                    return None;
                }
            }
        };

        Some(Alarm {
            trigger: offset,
            action,
            description: summary.map(str::to_string),
        })
    }
}

fn unknown(property: &RawProperty) -> UnknownProperty {
    UnknownProperty {
        name: property.name.clone(),
        value: property.value.clone(),
        parameters: property.parameters.clone(),
    }
}

fn participant(property: &RawProperty) -> Participant {
    let role = if property
        .param("CUTYPE")
        .map_or(false, |c| c.eq_ignore_ascii_case("RESOURCE") || c.eq_ignore_ascii_case("ROOM"))
    {
        ParticipantRole::Resource
    } else {
        property
            .param("ROLE")
            .and_then(|r| r.parse().ok())
            .unwrap_or(ParticipantRole::Required)
    };

    Participant {
        address: property.value.trim().to_string(),
        email: property.param("EMAIL").map(str::to_string),
        name: property.param("CN").map(str::to_string),
        role,
        status: property
            .param("PARTSTAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(ParticipationStatus::NeedsAction),
    }
}

pub(crate) fn parse_geo(value: &str) -> Option<GeoPosition> {
    let (lat, lon) = value.split_once(';').or_else(|| value.split_once(','))?;
    Some(GeoPosition {
        latitude: lat.trim().parse().ok()?,
        longitude: lon.trim().parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use chrono_tz::{Europe, Tz};

    fn normalizer() -> TimeNormalizer {
        TimeNormalizer::new(Tz::UTC)
    }

    fn event_data(entity: &CalendarEntity) -> &EventData {
        match &entity.kind {
            EntityKind::Event(event) => event,
            EntityKind::Task(_) => panic!("expected an event"),
        }
    }

    #[test]
    fn test_builds_event_fields() {
        let component = RawComponent::event()
            .with("UID", "u1")
            .with("SEQUENCE", "3")
            .with("PRODID", "-//Example//EN")
            .with("DTSTAMP", "20240101T000000Z")
            .with_params("DTSTART", "20240501T100000", &[("TZID", "Europe/Vienna")])
            .with_params("DTEND", "20240501T110000", &[("TZID", "Europe/Vienna")])
            .with("SUMMARY", "Standup")
            .with("CLASS", "CONFIDENTIAL")
            .with("STATUS", "CONFIRMED")
            .with("TRANSP", "TRANSPARENT")
            .with("X-CUSTOM", "kept")
            .with_params("ATTENDEE", "mailto:bob@example.com", &[("ROLE", "OPT-PARTICIPANT"), ("PARTSTAT", "ACCEPTED"), ("CN", "Bob")]);

        let built = build_entity(&component, &normalizer()).unwrap();
        let entity = built.entity;
        assert!(built.warnings.is_empty());
        assert_eq!(entity.uid, "u1");
        assert_eq!(entity.sequence, 3);
        assert_eq!(entity.classification, Some(Classification::Confidential));
        assert_eq!(entity.unknown_properties, vec![UnknownProperty::new("X-CUSTOM", "kept")]);

        let event = event_data(&entity);
        assert_eq!(event.status, Some(EventStatus::Confirmed));
        assert!(!event.opaque);
        assert_eq!(
            event.span.end,
            Some(TimeValue::DateTime(
                Europe::Vienna.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap()
            ))
        );

        let bob = &entity.participants[0];
        assert_eq!(bob.role, ParticipantRole::Optional);
        assert_eq!(bob.status, ParticipationStatus::Accepted);
        assert_eq!(bob.name.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_event_without_start_is_invalid() {
        let component = RawComponent::event().with("UID", "u1").with("SUMMARY", "x");
        assert!(matches!(
            build_entity(&component, &normalizer()),
            Err(CoreError::InvalidEntity { .. })
        ));
    }

    #[test]
    fn test_malformed_start_is_reported() {
        let component = RawComponent::event().with("UID", "u1").with("DTSTART", "soon");
        assert!(matches!(
            build_entity(&component, &normalizer()),
            Err(CoreError::MalformedTemporalValue { .. })
        ));
    }

    #[test]
    fn test_duration_past_calendar_range_is_malformed() {
        let component = RawComponent::event()
            .with("UID", "u1")
            .with("DTSTART", "20240501T100000Z")
            .with("DURATION", "P99999999W");
        assert!(matches!(
            build_entity(&component, &normalizer()),
            Err(CoreError::MalformedTemporalValue { .. })
        ));
    }

    #[test]
    fn test_task_needs_start_or_due() {
        let component = RawComponent::task().with("UID", "t1").with("DUE", "20240510T120000Z");
        assert!(build_entity(&component, &normalizer()).is_ok());

        let component = RawComponent::task().with("UID", "t1").with("SUMMARY", "x");
        assert!(build_entity(&component, &normalizer()).is_err());
    }

    #[test]
    fn test_rdate_fragments_are_concatenated_and_coerced() {
        let component = RawComponent::event()
            .with("UID", "u1")
            .with_params("DTSTART", "20240501", &[("VALUE", "DATE")])
            .with("RDATE", "20240510T100000Z,20240511T100000Z")
            .with_params("RDATE", "20240510", &[("VALUE", "DATE")]);

        let entity = build_entity(&component, &normalizer()).unwrap().entity;
        let day = |d| TimeValue::Date(NaiveDate::from_ymd_opt(2024, 5, d).unwrap());
        assert_eq!(entity.recurrence.rdates, vec![day(10), day(11), day(10)]);
    }

    #[test]
    fn test_alarm_trigger_variants() {
        let component = RawComponent::event()
            .with("UID", "u1")
            .with("SUMMARY", "Dentist")
            .with("DTSTART", "20240501T100000Z")
            .with("DTEND", "20240501T110000Z")
            .with_alarm(RawAlarm::new().with("ACTION", "AUDIO").with("TRIGGER", "-PT15M"))
            .with_alarm(
                RawAlarm::new()
                    .with("ACTION", "DISPLAY")
                    .with_params("TRIGGER", "-PT10M", &[("RELATED", "END")]),
            )
            .with_alarm(
                RawAlarm::new()
                    .with_params("TRIGGER", "20240501T093000Z", &[("VALUE", "DATE-TIME")]),
            );

        let entity = build_entity(&component, &normalizer()).unwrap().entity;
        let triggers: Vec<i64> = entity.alarms.iter().map(|a| a.trigger.num_minutes()).collect();
        assert_eq!(triggers, vec![-15, 50, -30]);
        assert_eq!(entity.alarms[0].action, AlarmAction::Audio);
        assert_eq!(entity.alarms[0].description.as_deref(), Some("Dentist"));
    }

    #[test]
    fn test_unknown_zone_is_reported_as_warning() {
        let component = RawComponent::event()
            .with("UID", "u1")
            .with_params("DTSTART", "20240501T100000", &[("TZID", "Nowhere Standard Time")]);
        let built = build_entity(&component, &normalizer()).unwrap();
        assert_eq!(built.warnings.len(), 1);
        assert!(built.warnings[0].is_recoverable());
    }

    #[test]
    fn test_parse_geo() {
        let geo = parse_geo("48.2;16.37").unwrap();
        assert_eq!(geo.latitude, 48.2);
        assert!(parse_geo("north").is_none());
    }
}
