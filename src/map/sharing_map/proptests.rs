/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

use super::test::invariant_utils::check_invariants;
use super::*;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Operations driven against both the map and a `BTreeMap` model.  Keys are drawn from a small
/// space so that collisions, migrations and spine pruning happen often.
#[derive(Debug, Clone)]
enum Action {
    Insert(u8, i32),
    Remove(u8),
    Replace(u8, i32),
    Update(u8, i32),
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0u8..64, any::<i32>()).prop_map(|(k, v)| Action::Insert(k, v)),
        (0u8..64).prop_map(Action::Remove),
        (0u8..64, any::<i32>()).prop_map(|(k, v)| Action::Replace(k, v)),
        (0u8..64, 1i32..1_000).prop_map(|(k, d)| Action::Update(k, d)),
    ]
}

fn geometry_strategy() -> impl Strategy<Value = (u8, u8)> {
    prop::sample::select(vec![(30u8, 3u8), (16, 4), (8, 2)])
}

fn apply(map: &mut SharingMap<u8, i32>, model: &mut BTreeMap<u8, i32>, action: &Action) {
    match *action {
        Action::Insert(k, v) => {
            if !model.contains_key(&k) {
                map.insert_mut(k, v);
                model.insert(k, v);
            }
        }
        Action::Remove(k) => {
            let removed = map.remove_if_exists_mut(&k);

            assert_eq!(removed, model.remove(&k).is_some());
        }
        Action::Replace(k, v) => {
            // Replacing with an equal value is forbidden when change detection is enabled, so
            // the model only drives replacements that change something.
            if model.get(&k).is_some_and(|old| *old != v) {
                map.replace_mut(&k, v);
                model.insert(k, v);
            }
        }
        Action::Update(k, d) => {
            if model.contains_key(&k) {
                map.update_mut(&k, |v| *v = v.wrapping_add(d));
                model.entry(k).and_modify(|v| *v = v.wrapping_add(d));
            }
        }
    }
}

fn assert_matches_model(map: &SharingMap<u8, i32>, model: &BTreeMap<u8, i32>) {
    assert_eq!(map.size(), model.len());

    for (k, v) in model {
        assert_eq!(map.get(k), Some(v));
    }

    let mut view: View<'_, u8, i32> = View::new();
    map.get_view(&mut view);

    let mut pairs: Vec<(u8, i32)> = view.iter().map(|(k, v)| (**k, **v)).collect();
    pairs.sort_unstable();

    let model_pairs: Vec<(u8, i32)> = model.iter().map(|(k, v)| (*k, *v)).collect();

    assert_eq!(pairs, model_pairs);
}

proptest! {
    #[test]
    fn matches_a_model_map(
        (bits, chunk) in geometry_strategy(),
        actions in prop::collection::vec(action_strategy(), 1..200),
    ) {
        let mut map: SharingMap<u8, i32> = SharingMap::new_with_geometry(bits, chunk);
        let mut model: BTreeMap<u8, i32> = BTreeMap::new();

        for action in &actions {
            apply(&mut map, &mut model, action);

            prop_assert_eq!(map.size(), model.len());
        }

        assert_matches_model(&map, &model);
        check_invariants(&map);
    }

    #[test]
    fn forking_preserves_the_original_and_delta_views_are_sound(
        (bits, chunk) in geometry_strategy(),
        base_actions in prop::collection::vec(action_strategy(), 1..100),
        fork_actions in prop::collection::vec(action_strategy(), 1..100),
    ) {
        let mut base: SharingMap<u8, i32> = SharingMap::new_with_geometry(bits, chunk);
        let mut base_model: BTreeMap<u8, i32> = BTreeMap::new();

        for action in &base_actions {
            apply(&mut base, &mut base_model, action);
        }

        let mut fork = base.clone();
        let mut fork_model = base_model.clone();

        // A delta view between a map and its untouched clone is empty.
        {
            let mut delta: DeltaView<'_, u8, i32> = DeltaView::new();
            fork.get_delta_view(&base, &mut delta, false);
            prop_assert!(delta.is_empty());
        }

        for action in &fork_actions {
            apply(&mut fork, &mut fork_model, action);
        }

        // Mutating the fork leaves the original untouched.
        assert_matches_model(&base, &base_model);
        assert_matches_model(&fork, &fork_model);
        check_invariants(&base);
        check_invariants(&fork);

        let mut delta: DeltaView<'_, u8, i32> = DeltaView::new();
        fork.get_delta_view(&base, &mut delta, false);

        let mut reported: BTreeMap<u8, (i32, Option<i32>)> = BTreeMap::new();

        for item in &delta {
            // No key is reported twice.
            prop_assert!(
                reported.insert(*item.key, (*item.value, item.other_value.copied())).is_none()
            );
        }

        for (k, (value, other_value)) in &reported {
            // Every reported key is in the fork and carries the fork's value; the other value
            // mirrors the original map.
            prop_assert_eq!(fork_model.get(k), Some(value));
            prop_assert_eq!(base_model.get(k), other_value.as_ref());
        }

        // Every actual difference is reported; sharing may only over-approximate.
        for (k, v) in &fork_model {
            if base_model.get(k) != Some(v) {
                prop_assert!(reported.contains_key(k));
            }
        }

        // With `only_common` the reported keys are exactly the common ones of the set above.
        let mut common_delta: DeltaView<'_, u8, i32> = DeltaView::new();
        fork.get_delta_view(&base, &mut common_delta, true);

        let common_reported: Vec<u8> = {
            let mut keys: Vec<u8> = common_delta.iter().map(|item| *item.key).collect();
            keys.sort_unstable();
            keys
        };
        let expected_common: Vec<u8> = reported
            .iter()
            .filter(|(_, (_, other_value))| other_value.is_some())
            .map(|(k, _)| *k)
            .collect();

        prop_assert_eq!(common_reported, expected_common);
    }
}
