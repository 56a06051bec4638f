//! Property-based tests for peer registry deduplication

use peerlink_core::{BackendKind, Observation, PeerRegistry, RawPeerId};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

/// A discovery report: which of a few raw ids, which name, which rssi
fn arb_report() -> impl Strategy<Value = (u8, u8, Option<i16>)> {
    (0u8..4, 0u8..3, prop::option::of(-100i16..-20))
}

fn arb_backend() -> impl Strategy<Value = BackendKind> {
    prop_oneof![
        Just(BackendKind::Mesh),
        Just(BackendKind::Nearby),
        Just(BackendKind::Ble)
    ]
}

proptest! {
    /// Property: exactly one Found per (backend, raw id), however many reports arrive
    #[test]
    fn one_found_per_key(reports in prop::collection::vec((arb_backend(), arb_report()), 1..200)) {
        let mut registry = PeerRegistry::new();
        let mut found: HashMap<(BackendKind, u8), usize> = HashMap::new();
        let mut ids = HashSet::new();

        for (backend, (raw, name, rssi)) in &reports {
            let raw_id = RawPeerId::new(format!("dev-{raw}"));
            match registry.observe_found(*backend, &raw_id, &format!("name-{name}"), *rssi) {
                Observation::Found(record) => {
                    *found.entry((*backend, *raw)).or_default() += 1;
                    prop_assert!(ids.insert(record.logical_id), "logical id reused for a different key");
                }
                Observation::Updated(record) => {
                    prop_assert!(ids.contains(&record.logical_id));
                }
                Observation::Unchanged(id) => {
                    prop_assert!(ids.contains(&id));
                }
            }
        }

        let distinct: HashSet<(BackendKind, u8)> =
            reports.iter().map(|(backend, (raw, _, _))| (*backend, *raw)).collect();
        prop_assert_eq!(found.len(), distinct.len());
        prop_assert!(found.values().all(|count| *count == 1));
        prop_assert_eq!(registry.len(), distinct.len());
    }

    /// Property: a refresh with a changed name is always an update, never a second find
    #[test]
    fn rename_is_update(first in "[a-z]{1,8}", second in "[a-z]{1,8}") {
        prop_assume!(first != second);
        let mut registry = PeerRegistry::new();
        let raw_id = RawPeerId::new("aa:bb");
        let found = registry.observe_found(BackendKind::Ble, &raw_id, &first, None);
        prop_assert!(matches!(found, Observation::Found(_)));
        let again = registry.observe_found(BackendKind::Ble, &raw_id, &second, None);
        prop_assert!(matches!(again, Observation::Updated(_)));
    }
}
