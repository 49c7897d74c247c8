//! Storage representation of temporal values.
//!
//! Single values are stored as epoch milliseconds plus a zone column. Recurrence sets
//! (RDATE/EXDATE) are stored as `[TZID;]value1,value2,...`:
//!
//! | owner     | stored as                                          |
//! |-----------|----------------------------------------------------|
//! | all-day   | `yyyymmddT000000Z`, no zone prefix                 |
//! | timed     | local `yyyymmddThhmmss` in the zone of the first value, or `...Z` for UTC |

use crate::error::CoreError;
use crate::models::TimeValue;
use crate::timezone::{find_zone, localize, parse_date, parse_date_time, ZoneMatch};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

const ZONE_SEPARATOR: char = ';';
const VALUE_SEPARATOR: &str = ",";

pub fn instant_from_millis(millis: i64) -> Result<DateTime<Utc>, CoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| CoreError::malformed(millis.to_string(), "epoch value out of range"))
}

/// Rebuilds a value from its epoch milliseconds and zone column.
///
/// All-day values become the UTC date of the instant. Unknown zones fall back to `default_zone`.
pub fn time_from_storage(
    millis: i64,
    zone: Option<&str>,
    all_day: bool,
    default_zone: Tz,
) -> Result<TimeValue, CoreError> {
    let instant = instant_from_millis(millis)?;
    if all_day {
        return Ok(TimeValue::Date(instant.date_naive()));
    }
    let zone = zone
        .and_then(find_zone)
        .map_or(default_zone, ZoneMatch::zone);
    Ok(TimeValue::DateTime(instant.with_timezone(&zone)))
}

pub fn recurrence_set_to_storage(values: &[TimeValue], all_day: bool) -> Option<String> {
    let first = values.first()?;
    if all_day {
        let dates: Vec<String> = values
            .iter()
            .map(|v| v.date().format("%Y%m%dT000000Z").to_string())
            .collect();
        return Some(dates.join(VALUE_SEPARATOR));
    }

    let zone = match first {
        TimeValue::DateTime(dt) => dt.timezone(),
        TimeValue::Date(_) => Tz::UTC,
    };
    let formatted: Vec<String> = values
        .iter()
        .map(|v| {
            let local = v.to_utc().with_timezone(&zone);
            if zone == Tz::UTC {
                local.format("%Y%m%dT%H%M%SZ").to_string()
            } else {
                local.format("%Y%m%dT%H%M%S").to_string()
            }
        })
        .collect();
    let list = formatted.join(VALUE_SEPARATOR);
    Some(if zone == Tz::UTC {
        list
    } else {
        format!("{}{}{}", zone.name(), ZONE_SEPARATOR, list)
    })
}

pub fn recurrence_set_from_storage(
    text: &str,
    all_day: bool,
    default_zone: Tz,
) -> Result<Vec<TimeValue>, CoreError> {
    let (zone, list) = match text.split_once(ZONE_SEPARATOR) {
        Some((tzid, list)) => (find_zone(tzid).map_or(default_zone, ZoneMatch::zone), list),
        None => (Tz::UTC, text),
    };

    list.split(VALUE_SEPARATOR)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|value| {
            if all_day {
                let date = value
                    .get(..8)
                    .and_then(parse_date)
                    .ok_or_else(|| CoreError::malformed(value, "expected yyyymmdd"))?;
                return Ok(TimeValue::Date(date));
            }
            let (local, utc) = parse_date_time(value)
                .ok_or_else(|| CoreError::malformed(value, "expected yyyymmddThhmmss[Z]"))?;
            let instant = if utc {
                Utc.from_utc_datetime(&local).with_timezone(&zone)
            } else {
                localize(zone, local)
                    .ok_or_else(|| CoreError::malformed(value, "local time does not exist"))?
            };
            Ok(TimeValue::DateTime(instant))
        })
        .collect()
}
