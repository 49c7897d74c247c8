//! Grouping of parsed components into series.
//!
//! Components sharing an identity become one master plus zero or more exceptions.
//! Duplicate versions are resolved by sequence number; on equal sequence numbers the
//! version seen last wins.

use crate::component::{build_entity, RawComponent};
use crate::error::CoreError;
use crate::models::{CalendarEntity, Correction, EntitySeries};
use crate::timezone::TimeNormalizer;
use crate::validation::repair_series;
use log::{debug, warn};
use std::collections::HashMap;
use uuid::Uuid;

/// Key an exception is grouped by within its identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnchorKey {
    /// Normalized anchor: epoch milliseconds and the date-only flag
    Instant { epoch_millis: i64, date_only: bool },
    /// Anchor text that could not be normalized
    Raw(String),
}

/// An item with the keys the resolver groups by.
#[derive(Debug, Clone)]
pub struct Keyed<T> {
    pub identity: Option<String>,
    pub anchor: Option<AnchorKey>,
    pub sequence: i32,
    pub item: T,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group<T> {
    pub identity: String,
    pub master: T,
    pub exceptions: Vec<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grouped<T> {
    pub groups: Vec<Group<T>>,
    /// Exceptions whose identity has no master, with that identity
    pub orphans: Vec<(String, T)>,
    /// Identities generated for items that had none
    pub synthesized: Vec<String>,
}

/// Slot of the current winner and the sequence it won with.
struct Winner<T> {
    sequence: i32,
    item: T,
}

impl<T> Winner<T> {
    /// `>=` so that the later of two equal versions replaces the earlier one.
    fn offer(&mut self, sequence: i32, item: T) {
        if sequence >= self.sequence {
            self.sequence = sequence;
            self.item = item;
        }
    }
}

/// Groups keyed items into masters and exceptions.
///
/// # Behavior
///
/// - Items without an anchor are masters, grouped by identity.
/// - Items with an anchor are exceptions, grouped by (identity, anchor).
/// - Within a group the highest sequence wins; ties go to the later item.
/// - Items without identity get a fresh UUID; such exceptions can never be attached.
/// - Exceptions without a master are returned as orphans.
/// - Groups are ordered by the first appearance of their master identity, exceptions by
///   the first appearance of their anchor.
pub fn group_components<T>(items: Vec<Keyed<T>>) -> Grouped<T> {
    let mut masters: Vec<(String, Winner<T>)> = Vec::new();
    let mut master_index: HashMap<String, usize> = HashMap::new();
    let mut exceptions: Vec<((String, AnchorKey), Winner<T>)> = Vec::new();
    let mut exception_index: HashMap<(String, AnchorKey), usize> = HashMap::new();
    let mut synthesized = Vec::new();

    for keyed in items {
        let identity = match keyed.identity {
            Some(identity) => identity,
            None => {
                let identity = Uuid::new_v4().to_string();
                warn!("Found component without identity, using a random one: {}", identity);
                synthesized.push(identity.clone());
                identity
            }
        };

        match keyed.anchor {
            None => match master_index.get(&identity) {
                Some(&idx) => masters[idx].1.offer(keyed.sequence, keyed.item),
                None => {
                    master_index.insert(identity.clone(), masters.len());
                    masters.push((
                        identity,
                        Winner {
                            sequence: keyed.sequence,
                            item: keyed.item,
                        },
                    ));
                }
            },
            Some(anchor) => {
                let key = (identity, anchor);
                match exception_index.get(&key) {
                    Some(&idx) => exceptions[idx].1.offer(keyed.sequence, keyed.item),
                    None => {
                        exception_index.insert(key.clone(), exceptions.len());
                        exceptions.push((
                            key,
                            Winner {
                                sequence: keyed.sequence,
                                item: keyed.item,
                            },
                        ));
                    }
                }
            }
        }
    }

    let mut groups: Vec<Group<T>> = masters
        .into_iter()
        .map(|(identity, winner)| Group {
            identity,
            master: winner.item,
            exceptions: Vec::new(),
        })
        .collect();

    let mut orphans = Vec::new();
    for ((identity, anchor), winner) in exceptions {
        match master_index.get(&identity) {
            Some(&idx) => groups[idx].exceptions.push(winner.item),
            None => {
                warn!(
                    "Discarding exception {:?} of {}: no master with this identity",
                    anchor, identity
                );
                orphans.push((identity, winner.item));
            }
        }
    }

    Grouped {
        groups,
        orphans,
        synthesized,
    }
}

/// An exception that was discarded because its master was missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedException {
    pub uid: String,
    pub recurrence_id: String,
}

/// Everything the resolver produced from one input stream.
#[derive(Debug, Default)]
pub struct Resolution {
    pub series: Vec<EntitySeries>,
    /// Entities that could not be built; one entry per rejected master or exception
    pub rejected: Vec<CoreError>,
    /// Recoverable conditions, e.g. substituted zones
    pub warnings: Vec<CoreError>,
    pub corrections: Vec<Correction>,
    pub orphaned_exceptions: Vec<OrphanedException>,
}

/// Turns a stream of parsed components into validated series.
#[derive(Debug, Clone)]
pub struct Resolver {
    normalizer: TimeNormalizer,
}

impl Resolver {
    pub fn new(normalizer: TimeNormalizer) -> Self {
        Self { normalizer }
    }

    pub fn normalizer(&self) -> &TimeNormalizer {
        &self.normalizer
    }

    /// Resolves components into series.
    ///
    /// A master that cannot be built rejects its whole series; an exception that cannot
    /// be built is dropped from its series. Other series are unaffected.
    pub fn resolve(&self, components: Vec<RawComponent>) -> Resolution {
        let keyed = components
            .into_iter()
            .map(|component| Keyed {
                identity: component.uid().map(str::to_string),
                anchor: self.anchor_key(&component),
                sequence: component.sequence(),
                item: component,
            })
            .collect();
        let grouped = group_components(keyed);

        let mut resolution = Resolution::default();
        for (uid, orphan) in grouped.orphans {
            resolution.orphaned_exceptions.push(OrphanedException {
                uid,
                recurrence_id: orphan
                    .recurrence_id()
                    .map(|p| p.value.clone())
                    .unwrap_or_default(),
            });
        }

        for group in grouped.groups {
            let master = match self.build(&group.identity, &group.master, &mut resolution) {
                Some(master) => master,
                None => {
                    if !group.exceptions.is_empty() {
                        warn!(
                            "Dropping {} exception(s) of rejected series {}",
                            group.exceptions.len(),
                            group.identity
                        );
                    }
                    continue;
                }
            };

            let exceptions = group
                .exceptions
                .iter()
                .filter_map(|exception| self.build(&group.identity, exception, &mut resolution))
                .collect();

            let mut series = EntitySeries { master, exceptions };
            resolution.corrections.extend(repair_series(&mut series));
            debug!(
                "Resolved series {} with {} exception(s)",
                series.master.uid,
                series.exceptions.len()
            );
            resolution.series.push(series);
        }

        resolution
    }

    fn build(
        &self,
        identity: &str,
        component: &RawComponent,
        resolution: &mut Resolution,
    ) -> Option<CalendarEntity> {
        match build_entity(component, &self.normalizer) {
            Ok(built) => {
                let mut entity = built.entity;
                entity.uid = identity.to_string();
                resolution.warnings.extend(built.warnings);
                Some(entity)
            }
            Err(err) => {
                warn!("Rejecting {} component {}: {}", kind_name(component), identity, err);
                resolution.rejected.push(match err {
                    CoreError::InvalidEntity { reason, .. } => CoreError::InvalidEntity {
                        uid: identity.to_string(),
                        reason,
                    },
                    other => other,
                });
                None
            }
        }
    }

    fn anchor_key(&self, component: &RawComponent) -> Option<AnchorKey> {
        let property = component.recurrence_id()?;
        Some(match self.normalizer.normalize_value(&property.temporal()) {
            Ok(value) => AnchorKey::Instant {
                epoch_millis: value.epoch_millis(),
                date_only: value.is_date_only(),
            },
            Err(_) => AnchorKey::Raw(property.value.trim().to_string()),
        })
    }
}

fn kind_name(component: &RawComponent) -> &'static str {
    match component.kind {
        crate::component::ComponentKind::Event => "event",
        crate::component::ComponentKind::Task => "task",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeValue;
    use chrono_tz::Tz;
    use proptest::prelude::*;

    fn resolver() -> Resolver {
        Resolver::new(TimeNormalizer::new(Tz::UTC))
    }

    fn master(uid: &str, sequence: i32, summary: &str) -> RawComponent {
        RawComponent::event()
            .with("UID", uid)
            .with("SEQUENCE", &sequence.to_string())
            .with("DTSTART", "20240501T100000Z")
            .with("RRULE", "FREQ=DAILY")
            .with("SUMMARY", summary)
    }

    fn exception(uid: &str, sequence: i32, recurrence_id: &str, summary: &str) -> RawComponent {
        RawComponent::event()
            .with("UID", uid)
            .with("SEQUENCE", &sequence.to_string())
            .with("RECURRENCE-ID", recurrence_id)
            .with("DTSTART", recurrence_id)
            .with("SUMMARY", summary)
    }

    #[test]
    fn test_sequence_scenario() {
        let components = vec![
            master("u1", 1, "master v1"),
            master("u1", 2, "master v2"),
            exception("u1", 0, "20240502T100000Z", "exception v0"),
            exception("u1", 1, "20240502T100000Z", "exception v1"),
        ];

        let resolution = resolver().resolve(components);
        assert_eq!(resolution.series.len(), 1);
        let series = &resolution.series[0];
        assert_eq!(series.master.sequence, 2);
        assert_eq!(series.master.summary.as_deref(), Some("master v2"));
        assert_eq!(series.exceptions.len(), 1);
        assert_eq!(series.exceptions[0].sequence, 1);
        assert_eq!(series.exceptions[0].summary.as_deref(), Some("exception v1"));
    }

    #[test]
    fn test_equal_sequence_keeps_last_seen() {
        let resolution = resolver().resolve(vec![master("u1", 1, "first"), master("u1", 1, "second")]);
        assert_eq!(resolution.series[0].master.summary.as_deref(), Some("second"));
    }

    #[test]
    fn test_orphan_exception_is_discarded() {
        let resolution = resolver().resolve(vec![
            master("u1", 0, "kept"),
            exception("u2", 0, "20240502T100000Z", "orphan"),
        ]);
        assert_eq!(resolution.series.len(), 1);
        assert_eq!(resolution.series[0].uid(), "u1");
        assert_eq!(
            resolution.orphaned_exceptions,
            vec![OrphanedException {
                uid: "u2".to_string(),
                recurrence_id: "20240502T100000Z".to_string(),
            }]
        );
    }

    #[test]
    fn test_missing_identity_gets_synthetic_uid() {
        let component = RawComponent::event().with("DTSTART", "20240501T100000Z");
        let resolution = resolver().resolve(vec![component]);
        let uid = &resolution.series[0].master.uid;
        assert!(Uuid::parse_str(uid).is_ok());
    }

    #[test]
    fn test_anchor_equality_uses_instant() {
        let resolution = resolver().resolve(vec![
            master("u1", 0, "m"),
            exception("u1", 0, "20240502T100000Z", "utc"),
            RawComponent::event()
                .with("UID", "u1")
                .with("SEQUENCE", "1")
                .with_params("RECURRENCE-ID", "20240502T120000", &[("TZID", "Europe/Berlin")])
                .with("DTSTART", "20240502T100000Z")
                .with("SUMMARY", "berlin"),
        ]);
        let series = &resolution.series[0];
        assert_eq!(series.exceptions.len(), 1);
        assert_eq!(series.exceptions[0].summary.as_deref(), Some("berlin"));
    }

    #[test]
    fn test_rejected_master_rejects_series_only() {
        let resolution = resolver().resolve(vec![
            RawComponent::event().with("UID", "bad").with("SUMMARY", "no start"),
            exception("bad", 0, "20240502T100000Z", "dropped"),
            master("good", 0, "kept"),
        ]);
        assert_eq!(resolution.series.len(), 1);
        assert_eq!(resolution.series[0].uid(), "good");
        assert_eq!(resolution.rejected.len(), 1);
        assert!(matches!(
            &resolution.rejected[0],
            CoreError::InvalidEntity { uid, .. } if uid == "bad"
        ));
    }

    #[test]
    fn test_rejected_exception_leaves_master() {
        let resolution = resolver().resolve(vec![
            master("u1", 0, "m"),
            RawComponent::event()
                .with("UID", "u1")
                .with("RECURRENCE-ID", "20240502T100000Z")
                .with("DTSTART", "not a time"),
        ]);
        assert_eq!(resolution.series[0].exceptions.len(), 0);
        assert!(matches!(
            resolution.rejected[0],
            CoreError::MalformedTemporalValue { .. }
        ));
    }

    #[test]
    fn test_output_order_follows_first_appearance() {
        let resolution = resolver().resolve(vec![
            master("b", 0, "b"),
            exception("a", 0, "20240503T100000Z", "a-3"),
            master("a", 0, "a"),
            exception("a", 0, "20240502T100000Z", "a-2"),
            master("b", 1, "b again"),
        ]);
        let uids: Vec<&str> = resolution.series.iter().map(|s| s.uid()).collect();
        assert_eq!(uids, vec!["b", "a"]);
        let anchors: Vec<i64> = resolution.series[1]
            .exceptions
            .iter()
            .map(|e| e.recurrence_id.as_ref().map(TimeValue::epoch_millis).unwrap_or_default())
            .collect();
        assert!(anchors[0] > anchors[1]);
    }

    fn arb_keyed() -> impl Strategy<Value = Vec<Keyed<usize>>> {
        prop::collection::vec((0u8..3, prop::option::of(0u8..3), 0i32..4), 0..24).prop_map(
            |entries| {
                entries
                    .into_iter()
                    .enumerate()
                    .map(|(item, (identity, anchor, sequence))| Keyed {
                        identity: Some(format!("id-{}", identity)),
                        anchor: anchor.map(|a| AnchorKey::Raw(a.to_string())),
                        sequence,
                        item,
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_winner_has_max_sequence_and_is_last_among_ties(items in arb_keyed()) {
            let grouped = group_components(items.clone());
            for group in &grouped.groups {
                let candidates: Vec<&Keyed<usize>> = items
                    .iter()
                    .filter(|k| k.anchor.is_none() && k.identity.as_deref() == Some(group.identity.as_str()))
                    .collect();
                let max = candidates.iter().map(|k| k.sequence).max().unwrap();
                let expected = candidates.iter().filter(|k| k.sequence == max).last().unwrap().item;
                prop_assert_eq!(group.master, expected);
            }
        }

        #[test]
        fn prop_grouping_is_deterministic(items in arb_keyed()) {
            prop_assert_eq!(group_components(items.clone()), group_components(items));
        }

        #[test]
        fn prop_every_exception_is_attached_or_orphaned(items in arb_keyed()) {
            let exception_keys: std::collections::HashSet<(String, AnchorKey)> = items
                .iter()
                .filter_map(|k| Some((k.identity.clone()?, k.anchor.clone()?)))
                .collect();
            let grouped = group_components(items);
            let attached: usize = grouped.groups.iter().map(|g| g.exceptions.len()).sum();
            prop_assert_eq!(attached + grouped.orphans.len(), exception_keys.len());
            for (identity, _) in &grouped.orphans {
                prop_assert!(grouped.groups.iter().all(|g| &g.identity != identity));
            }
        }
    }
}
