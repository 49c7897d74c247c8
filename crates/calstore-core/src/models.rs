use crate::error::CoreError;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Temporal values
// ============================================================================

/// A start, end or anchor value: either a calendar date or a zoned instant.
///
/// Date-only values have no zone; they report `UTC` as their zone identifier and
/// midnight UTC of the date as their epoch value.
#[derive(Debug, Clone)]
pub enum TimeValue {
    Date(NaiveDate),
    DateTime(DateTime<Tz>),
}

impl TimeValue {
    pub fn is_date_only(&self) -> bool {
        matches!(self, TimeValue::Date(_))
    }

    pub fn epoch_millis(&self) -> i64 {
        self.to_utc().timestamp_millis()
    }

    pub fn zone_id(&self) -> &'static str {
        match self {
            TimeValue::Date(_) => "UTC",
            TimeValue::DateTime(dt) => dt.timezone().name(),
        }
    }

    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            TimeValue::Date(date) => Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)),
            TimeValue::DateTime(dt) => dt.with_timezone(&Utc),
        }
    }

    /// Calendar date of the value in its own zone.
    pub fn date(&self) -> NaiveDate {
        match self {
            TimeValue::Date(date) => *date,
            TimeValue::DateTime(dt) => dt.date_naive(),
        }
    }

    /// Adds a duration. Date-only values move by whole days only.
    ///
    /// # Errors
    ///
    /// `MalformedTemporalValue` when the result falls outside the representable range.
    pub fn add(&self, duration: Duration) -> Result<TimeValue, CoreError> {
        let sum = match self {
            TimeValue::Date(date) => date
                .checked_add_signed(Duration::days(duration.num_days()))
                .map(TimeValue::Date),
            TimeValue::DateTime(dt) => dt.checked_add_signed(duration).map(TimeValue::DateTime),
        };
        sum.ok_or_else(|| {
            CoreError::malformed(
                format!("{} + {}", self.epoch_millis(), duration),
                "time out of range",
            )
        })
    }

    /// Difference `self - earlier`, in whole days when both are date-only.
    pub fn since(&self, earlier: &TimeValue) -> Duration {
        match (self, earlier) {
            (TimeValue::Date(a), TimeValue::Date(b)) => a.signed_duration_since(*b),
            _ => self.to_utc() - earlier.to_utc(),
        }
    }

    /// Converts this value to the kind (date-only or date-time) of `reference`.
    ///
    /// A date-time becomes its calendar date; a date becomes midnight in the reference's zone.
    pub fn to_kind_of(&self, reference: &TimeValue) -> TimeValue {
        match (self, reference) {
            (TimeValue::DateTime(dt), TimeValue::Date(_)) => TimeValue::Date(dt.date_naive()),
            (TimeValue::Date(date), TimeValue::DateTime(ref_dt)) => {
                let zone = ref_dt.timezone();
                let midnight = date.and_time(NaiveTime::MIN);
                match crate::timezone::localize(zone, midnight) {
                    Some(dt) => TimeValue::DateTime(dt),
                    None => TimeValue::DateTime(zone.from_utc_datetime(&midnight)),
                }
            }
            _ => self.clone(),
        }
    }

    /// Same kind as `other` and strictly before it
    pub fn is_before(&self, other: &TimeValue) -> bool {
        match (self, other) {
            (TimeValue::Date(a), TimeValue::Date(b)) => a < b,
            _ => self.epoch_millis() < other.epoch_millis(),
        }
    }
}

impl PartialEq for TimeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TimeValue::Date(a), TimeValue::Date(b)) => a == b,
            (TimeValue::DateTime(a), TimeValue::DateTime(b)) => {
                a == b && a.timezone() == b.timezone()
            }
            _ => false,
        }
    }
}

impl Eq for TimeValue {}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeValue::Date(date) => write!(f, "{}", date.format("%Y%m%d")),
            TimeValue::DateTime(dt) => {
                write!(f, "{};{}", dt.timezone().name(), dt.format("%Y%m%dT%H%M%S"))
            }
        }
    }
}

/// Start of an entity plus either an end or a duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSpan {
    pub start: TimeValue,
    pub end: Option<TimeValue>,
    pub duration: Option<Duration>,
}

impl TimeSpan {
    pub fn new(start: TimeValue) -> Self {
        Self {
            start,
            end: None,
            duration: None,
        }
    }

    pub fn with_end(start: TimeValue, end: TimeValue) -> Self {
        Self {
            start,
            end: Some(end),
            duration: None,
        }
    }

    pub fn with_duration(start: TimeValue, duration: Duration) -> Self {
        Self {
            start,
            end: None,
            duration: Some(duration),
        }
    }

    pub fn is_all_day(&self) -> bool {
        self.start.is_date_only()
    }

    /// The explicit end, or start + duration when only a duration is known.
    pub fn effective_end(&self) -> Result<Option<TimeValue>, CoreError> {
        match (&self.end, self.duration) {
            (Some(end), _) => Ok(Some(end.clone())),
            (None, Some(duration)) => self.start.add(duration).map(Some),
            (None, None) => Ok(None),
        }
    }
}

// ============================================================================
// Recurrence
// ============================================================================

/// Recurrence rules are passed through as opaque strings; only UNTIL is inspected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecurrenceSpec {
    pub rrule: Option<String>,
    pub exrule: Option<String>,
    pub rdates: Vec<TimeValue>,
    pub exdates: Vec<TimeValue>,
}

impl RecurrenceSpec {
    /// An entity recurs when it has a rule or at least one additional date.
    pub fn is_recurring(&self) -> bool {
        self.rrule.is_some() || !self.rdates.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.rrule.is_none()
            && self.exrule.is_none()
            && self.rdates.is_empty()
            && self.exdates.is_empty()
    }
}

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Public,
    Private,
    Confidential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    Tentative,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    NeedsAction,
    InProcess,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantRole {
    Chair,
    Required,
    Optional,
    Resource,
    NonParticipant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipationStatus {
    NeedsAction,
    Accepted,
    Declined,
    Tentative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmAction {
    Display,
    Audio,
    Email,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = crate::error::CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok($ty::$variant),)+
                    other => Err(crate::error::CoreError::InvalidInput(format!(
                        "Unknown {} value: {}",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum!(Classification {
    Public => "PUBLIC",
    Private => "PRIVATE",
    Confidential => "CONFIDENTIAL",
});

text_enum!(EventStatus {
    Tentative => "TENTATIVE",
    Confirmed => "CONFIRMED",
    Cancelled => "CANCELLED",
});

text_enum!(TaskStatus {
    NeedsAction => "NEEDS-ACTION",
    InProcess => "IN-PROCESS",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

text_enum!(ParticipantRole {
    Chair => "CHAIR",
    Required => "REQ-PARTICIPANT",
    Optional => "OPT-PARTICIPANT",
    Resource => "RESOURCE",
    NonParticipant => "NON-PARTICIPANT",
});

text_enum!(ParticipationStatus {
    NeedsAction => "NEEDS-ACTION",
    Accepted => "ACCEPTED",
    Declined => "DECLINED",
    Tentative => "TENTATIVE",
});

text_enum!(AlarmAction {
    Display => "DISPLAY",
    Audio => "AUDIO",
    Email => "EMAIL",
});

// ============================================================================
// Owned sub-records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Calendar address URI, e.g. `mailto:alice@example.com`
    pub address: String,
    /// Email for addresses that are not `mailto:` URIs
    pub email: Option<String>,
    pub name: Option<String>,
    pub role: ParticipantRole,
    pub status: ParticipationStatus,
}

impl Participant {
    pub fn mailto(email: &str) -> Self {
        Self {
            address: format!("mailto:{}", email),
            email: None,
            name: None,
            role: ParticipantRole::Required,
            status: ParticipationStatus::NeedsAction,
        }
    }

    /// The email address this participant can be reached at, if any.
    pub fn email_address(&self) -> Option<&str> {
        mailto_address(&self.address).or(self.email.as_deref())
    }
}

/// Strips a case-insensitive `mailto:` scheme.
pub fn mailto_address(uri: &str) -> Option<&str> {
    match uri.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("mailto:") => Some(&uri[7..]),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    /// Offset from the start; negative values fire before the start
    pub trigger: Duration,
    pub action: AlarmAction,
    pub description: Option<String>,
}

/// A property the model does not interpret, retained verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownProperty {
    pub name: String,
    pub value: String,
    pub parameters: BTreeMap<String, String>,
}

impl UnknownProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            parameters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    pub span: TimeSpan,
    pub status: Option<EventStatus>,
    /// Busy (`true`) or free time
    pub opaque: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskData {
    pub start: Option<TimeValue>,
    pub due: Option<TimeValue>,
    pub duration: Option<Duration>,
    pub completed: Option<DateTime<Utc>>,
    pub percent_complete: Option<u8>,
    pub priority: Option<u8>,
    pub geo: Option<GeoPosition>,
    pub status: Option<TaskStatus>,
    pub url: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    Event(EventData),
    Task(TaskData),
}

/// A single event or task: a series master or one date-specific exception.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEntity {
    pub uid: String,
    pub sequence: i32,
    /// Set on exceptions only: the occurrence of the master this entity replaces
    pub recurrence_id: Option<TimeValue>,
    pub summary: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub classification: Option<Classification>,
    /// Organizer calendar address URI
    pub organizer: Option<String>,
    pub participants: Vec<Participant>,
    pub alarms: Vec<Alarm>,
    pub unknown_properties: Vec<UnknownProperty>,
    pub recurrence: RecurrenceSpec,
    pub kind: EntityKind,
}

impl CalendarEntity {
    pub fn new(uid: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            uid: uid.into(),
            sequence: 0,
            recurrence_id: None,
            summary: None,
            location: None,
            description: None,
            classification: None,
            organizer: None,
            participants: Vec::new(),
            alarms: Vec::new(),
            unknown_properties: Vec::new(),
            recurrence: RecurrenceSpec::default(),
            kind,
        }
    }

    pub fn event(uid: impl Into<String>, span: TimeSpan) -> Self {
        Self::new(
            uid,
            EntityKind::Event(EventData {
                span,
                status: None,
                opaque: true,
            }),
        )
    }

    pub fn task(uid: impl Into<String>, data: TaskData) -> Self {
        Self::new(uid, EntityKind::Task(data))
    }

    pub fn is_exception(&self) -> bool {
        self.recurrence_id.is_some()
    }

    /// The value recurrence and exceptions are anchored to: DTSTART, or DUE for tasks without one.
    pub fn anchor_time(&self) -> Option<&TimeValue> {
        match &self.kind {
            EntityKind::Event(event) => Some(&event.span.start),
            EntityKind::Task(task) => task.start.as_ref().or(task.due.as_ref()),
        }
    }

    pub fn is_all_day(&self) -> bool {
        match &self.kind {
            EntityKind::Event(event) => event.span.is_all_day(),
            EntityKind::Task(task) => {
                task.start.as_ref().map_or(false, TimeValue::is_date_only)
                    || task.due.as_ref().map_or(false, TimeValue::is_date_only)
            }
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EntityKind::Event(_) => "event",
            EntityKind::Task(_) => "task",
        }
    }
}

/// A master entity and its exceptions, replaced as a whole on update.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySeries {
    pub master: CalendarEntity,
    pub exceptions: Vec<CalendarEntity>,
}

impl EntitySeries {
    pub fn single(master: CalendarEntity) -> Self {
        Self {
            master,
            exceptions: Vec::new(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.master.uid
    }
}

// ============================================================================
// Corrections
// ============================================================================

/// A repair applied to an entity so that the stored data stays consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub uid: String,
    pub rule: CorrectionRule,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrectionRule {
    AllDayEnd,
    TimedEnd,
    EndBeforeStart,
    EndKindAligned,
    UntilAligned,
    UntilBeforeStart,
    ExceptionRecurrenceRemoved,
    SummaryInherited,
    TaskStartNotBeforeDue,
    OrganizerDropped,
}

impl Correction {
    pub fn new(uid: &str, rule: CorrectionRule, detail: impl Into<String>) -> Self {
        Self {
            uid: uid.to_string(),
            rule,
            detail: detail.into(),
        }
    }
}
