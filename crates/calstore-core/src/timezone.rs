//! Normalization of raw temporal values into [`TimeValue`]s.
//!
//! Zone identifiers are resolved against the bundled IANA database. Identifiers that
//! cannot be resolved are replaced by the configured default zone without moving the
//! represented instant.

use crate::error::CoreError;
use crate::models::TimeValue;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::{Tz, TZ_VARIANTS};
use log::{debug, warn};
use std::collections::HashMap;
use std::str::FromStr;

/// A temporal value as delivered by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTemporal {
    /// Basic ISO 8601 text, e.g. `20240501` or `20240501T100000[Z]`
    pub value: String,
    /// `TZID` parameter, if any
    pub tzid: Option<String>,
    /// `VALUE=DATE` was given
    pub date_only: bool,
}

impl RawTemporal {
    pub fn new(value: impl Into<String>, tzid: Option<&str>) -> Self {
        Self {
            value: value.into(),
            tzid: tzid.map(str::to_string),
            date_only: false,
        }
    }

    pub fn date(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            tzid: None,
            date_only: true,
        }
    }
}

/// Result of normalizing one value.
#[derive(Debug)]
pub struct Normalized {
    pub value: TimeValue,
    /// Set when the zone identifier was unknown and the default zone was substituted
    pub fallback: Option<CoreError>,
}

/// How a zone identifier was matched against the IANA database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMatch {
    Exact(Tz),
    CaseInsensitive(Tz),
    Partial(Tz),
}

impl ZoneMatch {
    pub fn zone(self) -> Tz {
        match self {
            ZoneMatch::Exact(tz) | ZoneMatch::CaseInsensitive(tz) | ZoneMatch::Partial(tz) => tz,
        }
    }
}

/// Finds the IANA zone for an identifier.
///
/// # Behavior
///
/// 1. Exact match
/// 2. Case-insensitive match
/// 3. Partial match: the identifier contains a zone name (longest wins), or a zone name
///    contains the identifier (first in database order wins)
pub fn find_zone(tzid: &str) -> Option<ZoneMatch> {
    let tzid = tzid.trim();
    if tzid.is_empty() {
        return None;
    }
    if let Ok(tz) = Tz::from_str(tzid) {
        return Some(ZoneMatch::Exact(tz));
    }
    if let Some(tz) = TZ_VARIANTS
        .iter()
        .find(|tz| tz.name().eq_ignore_ascii_case(tzid))
    {
        return Some(ZoneMatch::CaseInsensitive(*tz));
    }

    let contained = TZ_VARIANTS
        .iter()
        .filter(|tz| tzid.contains(tz.name()))
        .max_by_key(|tz| tz.name().len());
    if let Some(tz) = contained {
        return Some(ZoneMatch::Partial(*tz));
    }
    TZ_VARIANTS
        .iter()
        .find(|tz| tz.name().contains(tzid))
        .map(|tz| ZoneMatch::Partial(*tz))
}

/// Maps a local wall time to an instant in `zone`.
///
/// Ambiguous times take the earliest mapping; times inside a DST gap move forward one hour.
pub fn localize(zone: Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    match zone.from_local_datetime(&local).earliest() {
        Some(dt) => Some(dt),
        None => zone
            .from_local_datetime(&local.checked_add_signed(Duration::hours(1))?)
            .earliest(),
    }
}

/// Parses `YYYYMMDD` (or `YYYY-MM-DD`).
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .ok()
}

/// Parses `YYYYMMDDTHHMMSS` (or the extended form). Returns the local time and whether it was UTC.
pub fn parse_date_time(value: &str) -> Option<(NaiveDateTime, bool)> {
    let (text, utc) = match value.strip_suffix('Z').or_else(|| value.strip_suffix('z')) {
        Some(stripped) => (stripped, true),
        None => (value, false),
    };
    NaiveDateTime::parse_from_str(text, "%Y%m%dT%H%M%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .map(|local| (local, utc))
}

/// Turns raw temporal text into [`TimeValue`]s.
#[derive(Debug, Clone)]
pub struct TimeNormalizer {
    default_zone: Tz,
    zone_definitions: HashMap<String, FixedOffset>,
}

impl TimeNormalizer {
    pub fn new(default_zone: Tz) -> Self {
        Self {
            default_zone,
            zone_definitions: HashMap::new(),
        }
    }

    /// Registers an offset the calendar itself defines for `tzid` (VTIMEZONE).
    ///
    /// Used only when `tzid` is not a known zone, to compute the instant before the
    /// default zone is substituted.
    pub fn with_zone_definition(mut self, tzid: impl Into<String>, offset: FixedOffset) -> Self {
        self.zone_definitions.insert(tzid.into(), offset);
        self
    }

    pub fn default_zone(&self) -> Tz {
        self.default_zone
    }

    /// Resolves a zone identifier, falling back to the default zone.
    pub fn zone_or_default(&self, tzid: &str) -> Tz {
        find_zone(tzid).map_or(self.default_zone, ZoneMatch::zone)
    }

    /// Normalizes one raw temporal value.
    ///
    /// # Returns
    ///
    /// The normalized value plus an `UnresolvedZone` warning when the default zone
    /// was substituted, or `MalformedTemporalValue` when the text cannot be parsed.
    pub fn normalize(&self, raw: &RawTemporal) -> Result<Normalized, CoreError> {
        let text = raw.value.trim();

        if raw.date_only || (text.len() == 8 && text.bytes().all(|b| b.is_ascii_digit())) {
            let date = parse_date(text)
                .ok_or_else(|| CoreError::malformed(text, "expected a date (YYYYMMDD)"))?;
            return Ok(Normalized {
                value: TimeValue::Date(date),
                fallback: None,
            });
        }

        let (local, utc) = parse_date_time(text)
            .ok_or_else(|| CoreError::malformed(text, "expected a date-time (YYYYMMDDTHHMMSS)"))?;

        let tzid = raw.tzid.as_deref().map(str::trim).filter(|t| !t.is_empty());
        let tzid = match (utc, tzid) {
            (true, _) | (false, None) => {
                return Ok(Normalized {
                    value: TimeValue::DateTime(Tz::UTC.from_utc_datetime(&local)),
                    fallback: None,
                })
            }
            (false, Some(tzid)) => tzid,
        };

        match find_zone(tzid) {
            Some(found) => {
                if let ZoneMatch::Partial(tz) = found {
                    debug!("Time zone '{}' matched partially to {}", tzid, tz.name());
                }
                let value = localize(found.zone(), local).ok_or_else(|| {
                    CoreError::malformed(text, format!("local time does not exist in {}", tzid))
                })?;
                Ok(Normalized {
                    value: TimeValue::DateTime(value),
                    fallback: None,
                })
            }
            None => self.substitute_default(text, tzid, local),
        }
    }

    /// Convenience for callers that only need the value.
    pub fn normalize_value(&self, raw: &RawTemporal) -> Result<TimeValue, CoreError> {
        self.normalize(raw).map(|normalized| normalized.value)
    }

    fn substitute_default(
        &self,
        text: &str,
        tzid: &str,
        local: NaiveDateTime,
    ) -> Result<Normalized, CoreError> {
        let instant = match self.zone_definitions.get(tzid) {
            Some(offset) => offset
                .from_local_datetime(&local)
                .single()
                .map(|dt| dt.with_timezone(&self.default_zone)),
            None => localize(self.default_zone, local),
        }
        .ok_or_else(|| CoreError::malformed(text, "local time cannot be mapped to an instant"))?;

        warn!(
            "Ignoring unknown time zone '{}', using {}",
            tzid,
            self.default_zone.name()
        );
        Ok(Normalized {
            value: TimeValue::DateTime(instant),
            fallback: Some(CoreError::UnresolvedZone {
                tzid: tzid.to_string(),
                substitute: self.default_zone.name().to_string(),
            }),
        })
    }
}

impl Default for TimeNormalizer {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}
