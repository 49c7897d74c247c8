//! Correction and encoding policies applied by the entity mappers.
//!
//! Each policy is a pure function so that it can be tested on its own.

use crate::error::CoreError;
use crate::models::{
    mailto_address, Classification, Correction, CorrectionRule, TimeValue, UnknownProperty,
};
use chrono::Duration;
use log::info;

pub const ACCESS_DEFAULT: i64 = 0;
pub const ACCESS_CONFIDENTIAL: i64 = 1;
pub const ACCESS_PRIVATE: i64 = 2;
pub const ACCESS_PUBLIC: i64 = 3;

/// How the end of an entity is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndEncoding {
    End(TimeValue),
    Duration(Duration),
}

/// Date-only spans must end strictly after they start.
///
/// A missing end, or one not after the start, becomes start + 1 day. Applying the
/// policy to its own output changes nothing.
pub fn correct_all_day_end(
    uid: &str,
    start: &TimeValue,
    end: Option<TimeValue>,
) -> Result<(TimeValue, Option<Correction>), CoreError> {
    match end {
        Some(end) if start.is_before(&end) => Ok((end, None)),
        _ => {
            info!("{}: all-day event without valid end, dtend := dtstart + 1 day", uid);
            Ok((
                start.add(Duration::days(1))?,
                Some(Correction::new(
                    uid,
                    CorrectionRule::AllDayEnd,
                    "dtend := dtstart + 1 day",
                )),
            ))
        }
    }
}

/// Timed spans without an end, or ending before they start, become zero-length.
pub fn correct_timed_end(
    uid: &str,
    start: &TimeValue,
    end: Option<TimeValue>,
) -> (TimeValue, Option<Correction>) {
    match end {
        Some(end) if !end.is_before(start) => (end, None),
        _ => {
            info!("{}: event without valid end, dtend := dtstart", uid);
            (
                start.clone(),
                Some(Correction::new(uid, CorrectionRule::TimedEnd, "dtend := dtstart")),
            )
        }
    }
}

/// Non-recurring entities store their end; recurring ones store a duration.
///
/// The duration is the explicit one when given, otherwise `end - start`.
pub fn encode_end(
    recurring: bool,
    start: &TimeValue,
    end: &TimeValue,
    explicit_duration: Option<Duration>,
) -> EndEncoding {
    if recurring {
        EndEncoding::Duration(explicit_duration.unwrap_or_else(|| end.since(start)))
    } else {
        EndEncoding::End(end.clone())
    }
}

/// The organizer email to store: only when the entity has participants and the
/// organizer is reachable by email.
pub fn organizer_for_storage(
    uid: &str,
    organizer: Option<&str>,
    has_participants: bool,
) -> (Option<String>, Option<Correction>) {
    let Some(organizer) = organizer.filter(|_| has_participants) else {
        return (None, None);
    };
    match mailto_address(organizer) {
        Some(email) => (Some(email.to_string()), None),
        None => {
            info!("{}: organizer {} has no email address, not stored", uid, organizer);
            (
                None,
                Some(Correction::new(
                    uid,
                    CorrectionRule::OrganizerDropped,
                    format!("organizer {} is not a mailto address", organizer),
                )),
            )
        }
    }
}

/// The organizer read back from storage; dropped when there are no participants.
pub fn organizer_from_storage(email: Option<&str>, has_participants: bool) -> Option<String> {
    email
        .filter(|e| has_participants && !e.is_empty())
        .map(|e| format!("mailto:{}", e))
}

/// Event classification stored as an access level.
///
/// The access levels cannot express "confidential" on their own: it is written as
/// private plus a retained `CLASS:CONFIDENTIAL` property, and read back as confidential
/// only when that property is present.
pub struct ClassificationPolicy;

impl ClassificationPolicy {
    pub const RETAINED_NAME: &'static str = "CLASS";
    pub const RETAINED_VALUE: &'static str = "CONFIDENTIAL";

    pub fn retained_property() -> UnknownProperty {
        UnknownProperty::new(Self::RETAINED_NAME, Self::RETAINED_VALUE)
    }

    fn is_retained(property: &UnknownProperty) -> bool {
        property.name.eq_ignore_ascii_case(Self::RETAINED_NAME)
            && property.value.eq_ignore_ascii_case(Self::RETAINED_VALUE)
    }

    /// Access level plus the property to retain, if any.
    pub fn write(classification: Option<Classification>) -> (i64, Option<UnknownProperty>) {
        match classification {
            None => (ACCESS_DEFAULT, None),
            Some(Classification::Public) => (ACCESS_PUBLIC, None),
            Some(Classification::Private) => (ACCESS_PRIVATE, None),
            Some(Classification::Confidential) => (ACCESS_PRIVATE, Some(Self::retained_property())),
        }
    }

    /// Classification for a stored access level. Removes the retained property from
    /// `unknown` unless the level is the default one.
    pub fn read(access_level: i64, unknown: &mut Vec<UnknownProperty>) -> Option<Classification> {
        match access_level {
            ACCESS_PUBLIC => {
                unknown.retain(|p| !Self::is_retained(p));
                Some(Classification::Public)
            }
            ACCESS_PRIVATE | ACCESS_CONFIDENTIAL => {
                let before = unknown.len();
                unknown.retain(|p| !Self::is_retained(p));
                if unknown.len() < before {
                    Some(Classification::Confidential)
                } else {
                    Some(Classification::Private)
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use chrono_tz::Europe::Vienna;
    use proptest::prelude::*;
    use rstest::rstest;

    fn date(y: i32, m: u32, d: u32) -> TimeValue {
        TimeValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[rstest]
    #[case::missing(None, date(2024, 5, 2), true)]
    #[case::same_day(Some(date(2024, 5, 1)), date(2024, 5, 2), true)]
    #[case::before(Some(date(2024, 4, 30)), date(2024, 5, 2), true)]
    #[case::valid(Some(date(2024, 5, 3)), date(2024, 5, 3), false)]
    fn test_all_day_end(
        #[case] end: Option<TimeValue>,
        #[case] expected: TimeValue,
        #[case] corrected: bool,
    ) {
        let (result, correction) = correct_all_day_end("u1", &date(2024, 5, 1), end).unwrap();
        assert_eq!(result, expected);
        assert_eq!(correction.is_some(), corrected);
    }

    #[test]
    fn test_all_day_end_at_last_date_fails() {
        let last = TimeValue::Date(NaiveDate::MAX);
        assert!(matches!(
            correct_all_day_end("u1", &last, None),
            Err(CoreError::MalformedTemporalValue { .. })
        ));
    }

    #[test]
    fn test_timed_end() {
        let start = TimeValue::DateTime(Vienna.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        let earlier = TimeValue::DateTime(Vienna.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());

        assert_eq!(correct_timed_end("u1", &start, None).0, start);
        assert_eq!(correct_timed_end("u1", &start, Some(earlier)).0, start);
        let (same, correction) = correct_timed_end("u1", &start, Some(start.clone()));
        assert_eq!(same, start);
        assert!(correction.is_none());
    }

    #[test]
    fn test_encode_end() {
        let start = date(2024, 5, 1);
        let end = date(2024, 5, 3);
        assert_eq!(encode_end(false, &start, &end, None), EndEncoding::End(end.clone()));
        assert_eq!(
            encode_end(true, &start, &end, None),
            EndEncoding::Duration(Duration::days(2))
        );
        assert_eq!(
            encode_end(true, &start, &end, Some(Duration::hours(1))),
            EndEncoding::Duration(Duration::hours(1))
        );
    }

    #[rstest]
    #[case(Some("mailto:boss@example.com"), true, Some("boss@example.com"), false)]
    #[case(Some("mailto:boss@example.com"), false, None, false)]
    #[case(Some("urn:uuid:42"), true, None, true)]
    #[case(None, true, None, false)]
    fn test_organizer_for_storage(
        #[case] organizer: Option<&str>,
        #[case] has_participants: bool,
        #[case] expected: Option<&str>,
        #[case] corrected: bool,
    ) {
        let (stored, correction) = organizer_for_storage("u1", organizer, has_participants);
        assert_eq!(stored.as_deref(), expected);
        assert_eq!(correction.is_some(), corrected);
    }

    #[test]
    fn test_organizer_from_storage() {
        assert_eq!(
            organizer_from_storage(Some("boss@example.com"), true).as_deref(),
            Some("mailto:boss@example.com")
        );
        assert_eq!(organizer_from_storage(Some("boss@example.com"), false), None);
    }

    #[rstest]
    #[case::unset(None, ACCESS_DEFAULT, None)]
    #[case::public(Some(Classification::Public), ACCESS_PUBLIC, Some(Classification::Public))]
    #[case::private(Some(Classification::Private), ACCESS_PRIVATE, Some(Classification::Private))]
    #[case::confidential(Some(Classification::Confidential), ACCESS_PRIVATE, Some(Classification::Confidential))]
    fn test_classification_round_trip(
        #[case] classification: Option<Classification>,
        #[case] level: i64,
        #[case] read_back: Option<Classification>,
    ) {
        let (access, retained) = ClassificationPolicy::write(classification);
        assert_eq!(access, level);
        let mut unknown: Vec<UnknownProperty> = retained.into_iter().collect();
        assert_eq!(ClassificationPolicy::read(access, &mut unknown), read_back);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_public_discards_retained_property() {
        let mut unknown = vec![
            ClassificationPolicy::retained_property(),
            UnknownProperty::new("X-OTHER", "1"),
        ];
        assert_eq!(
            ClassificationPolicy::read(ACCESS_PUBLIC, &mut unknown),
            Some(Classification::Public)
        );
        assert_eq!(unknown, vec![UnknownProperty::new("X-OTHER", "1")]);
    }

    #[test]
    fn test_confidential_level_without_property_reads_private() {
        let mut unknown = Vec::new();
        assert_eq!(
            ClassificationPolicy::read(ACCESS_CONFIDENTIAL, &mut unknown),
            Some(Classification::Private)
        );
    }

    proptest! {
        #[test]
        fn prop_all_day_correction_is_idempotent(
            start_day in 0i64..20_000,
            end_offset in prop::option::of(-10i64..10),
        ) {
            let base = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
            let start = TimeValue::Date(base + Duration::days(start_day));
            let end = end_offset.map(|o| start.add(Duration::days(o)).unwrap());

            let (once, _) = correct_all_day_end("u1", &start, end).unwrap();
            let (twice, correction) = correct_all_day_end("u1", &start, Some(once.clone())).unwrap();
            prop_assert_eq!(&once, &twice);
            prop_assert!(correction.is_none());
            prop_assert!(start.is_before(&once));
        }
    }
}
