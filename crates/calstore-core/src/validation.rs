//! Repairs applied to resolved series before they are mapped.
//!
//! Clients produce data that is technically invalid but common: ends before starts,
//! UNTIL values of the wrong kind, exceptions carrying their own rules. Each repair is
//! logged and reported as a [`Correction`].

use crate::models::{
    CalendarEntity, Correction, CorrectionRule, EntityKind, EntitySeries, TimeValue,
};
use crate::timezone::{localize, parse_date, parse_date_time};
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use log::info;

/// Repairs a series in place and returns what was changed.
pub fn repair_series(series: &mut EntitySeries) -> Vec<Correction> {
    let mut corrections = Vec::new();

    repair_entity(&mut series.master, &mut corrections);
    repair_until(&mut series.master, &mut corrections);

    for exception in &mut series.exceptions {
        repair_entity(exception, &mut corrections);

        if !exception.recurrence.is_empty() {
            exception.recurrence = Default::default();
            corrections.push(Correction::new(
                &exception.uid,
                CorrectionRule::ExceptionRecurrenceRemoved,
                "exceptions cannot recur",
            ));
        }
        if exception.summary.is_none() && series.master.summary.is_some() {
            exception.summary = series.master.summary.clone();
            corrections.push(Correction::new(
                &exception.uid,
                CorrectionRule::SummaryInherited,
                "exception inherits the master's summary",
            ));
        }
    }

    for correction in &corrections {
        info!("{}: {:?} ({})", correction.uid, correction.rule, correction.detail);
    }
    corrections
}

fn repair_entity(entity: &mut CalendarEntity, corrections: &mut Vec<Correction>) {
    let uid = entity.uid.clone();
    match &mut entity.kind {
        EntityKind::Event(event) => {
            let span = &mut event.span;
            if let Some(end) = &span.end {
                if end.is_date_only() != span.start.is_date_only() {
                    span.end = Some(end.to_kind_of(&span.start));
                    corrections.push(Correction::new(
                        &uid,
                        CorrectionRule::EndKindAligned,
                        "end converted to the kind of the start",
                    ));
                }
            }
            if let Some(end) = &span.end {
                if end.is_before(&span.start) {
                    span.end = None;
                    corrections.push(Correction::new(
                        &uid,
                        CorrectionRule::EndBeforeStart,
                        "end before start removed",
                    ));
                }
            }
        }
        EntityKind::Task(task) => {
            if let (Some(start), Some(due)) = (&task.start, &task.due) {
                if !start.is_before(due) {
                    task.start = None;
                    corrections.push(Correction::new(
                        &uid,
                        CorrectionRule::TaskStartNotBeforeDue,
                        "start not before due removed",
                    ));
                }
            }
        }
    }
}

/// The UNTIL value of a rule, if any.
fn find_until(rule: &str) -> Option<&str> {
    rule.split(';').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        key.trim().eq_ignore_ascii_case("UNTIL").then_some(value.trim())
    })
}

fn replace_until(rule: &str, until: &str) -> String {
    rule.split(';')
        .map(|part| match part.split_once('=') {
            Some((key, _)) if key.trim().eq_ignore_ascii_case("UNTIL") => format!("UNTIL={}", until),
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Parses an UNTIL value. Floating date-times are read in `zone`.
fn parse_until(value: &str, zone: Tz) -> Option<TimeValue> {
    if value.len() == 8 {
        return parse_date(value).map(TimeValue::Date);
    }
    let (local, utc) = parse_date_time(value)?;
    let instant = if utc {
        Tz::UTC.from_utc_datetime(&local)
    } else {
        localize(zone, local)?
    };
    Some(TimeValue::DateTime(instant))
}

fn format_until(value: &TimeValue) -> String {
    match value {
        TimeValue::Date(date) => date.format("%Y%m%d").to_string(),
        TimeValue::DateTime(dt) => dt.with_timezone(&Utc).format("%Y%m%dT%H%M%SZ").to_string(),
    }
}

/// Aligns UNTIL with the start and drops rules that end before they begin.
///
/// # Behavior
///
/// - date start, date-time UNTIL: UNTIL becomes its date
/// - date-time start, date UNTIL: UNTIL gets the start's time of day, expressed in UTC
/// - UNTIL before the start: the rule is removed
///
/// The rule text is split by hand because `rrule::RRule` does not keep whether UNTIL was a
/// DATE or a DATE-TIME, and that kind is what gets repaired here.
fn repair_until(entity: &mut CalendarEntity, corrections: &mut Vec<Correction>) {
    let Some(start) = entity.anchor_time().cloned() else {
        return;
    };
    let Some(rule) = entity.recurrence.rrule.clone() else {
        return;
    };
    let Some(until_text) = find_until(&rule) else {
        return;
    };
    let zone = match &start {
        TimeValue::DateTime(dt) => dt.timezone(),
        TimeValue::Date(_) => Tz::UTC,
    };
    let Some(until) = parse_until(until_text, zone) else {
        info!("{}: keeping rule with unparseable UNTIL '{}'", entity.uid, until_text);
        return;
    };

    let aligned = match (&start, &until) {
        (TimeValue::Date(_), TimeValue::DateTime(_)) => Some(until.to_kind_of(&start)),
        (TimeValue::DateTime(start_dt), TimeValue::Date(date)) => {
            localize(zone, date.and_time(start_dt.time())).map(TimeValue::DateTime)
        }
        _ => None,
    };
    let until = match aligned {
        Some(aligned) => {
            let text = format_until(&aligned);
            entity.recurrence.rrule = Some(replace_until(&rule, &text));
            corrections.push(Correction::new(
                &entity.uid,
                CorrectionRule::UntilAligned,
                format!("UNTIL {} aligned to {}", until_text, text),
            ));
            aligned
        }
        None => until,
    };

    if until.is_before(&start) {
        entity.recurrence.rrule = None;
        corrections.push(Correction::new(
            &entity.uid,
            CorrectionRule::UntilBeforeStart,
            format!("rule ending before its start removed ({})", rule),
        ));
    }
}
