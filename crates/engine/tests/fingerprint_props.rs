use parley_engine::Fingerprint;
use proptest::prelude::*;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

fn object(pairs: &[(String, i64)]) -> Value {
    let mut map = Map::new();
    for (key, value) in pairs {
        map.insert(key.clone(), Value::from(*value));
    }
    Value::Object(map)
}

proptest! {
    #[test]
    fn fingerprint_ignores_insertion_order(
        entries in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12)
    ) {
        let pairs: Vec<(String, i64)> = entries.into_iter().collect();
        let mut reversed = pairs.clone();
        reversed.reverse();

        let forward = Fingerprint::of(&object(&pairs)).unwrap();
        let backward = Fingerprint::of(&object(&reversed)).unwrap();
        prop_assert_eq!(forward, backward);
    }
}

proptest! {
    #[test]
    fn fingerprint_changes_with_any_value(
        entries in prop::collection::btree_map("[a-z]{1,8}", -1_000_000i64..1_000_000, 1..12),
        pick in any::<prop::sample::Index>(),
    ) {
        let original: BTreeMap<String, i64> = entries;
        let key = pick.get(&original.keys().cloned().collect::<Vec<_>>()).clone();
        let mut changed = original.clone();
        *changed.get_mut(&key).unwrap() += 1;

        prop_assert_ne!(
            Fingerprint::of(&original).unwrap(),
            Fingerprint::of(&changed).unwrap()
        );
    }
}

proptest! {
    #[test]
    fn hex_form_round_trips(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let fingerprint = Fingerprint::of_bytes(&bytes);
        prop_assert_eq!(Fingerprint::from_hex(&fingerprint.to_hex()).unwrap(), fingerprint);
        prop_assert_eq!(fingerprint.to_hex().len(), 64);
    }
}
