/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

#![cfg_attr(feature = "fatal-warnings", deny(warnings))]

//! # Sharing map
//!
//! A persistent associative container implemented as a fixed-height hash trie with
//! [structural sharing](https://en.wikipedia.org/wiki/Persistent_data_structure): cloning a map is
//! O(1), and after a clone is mutated the unchanged parts of the trie remain physically shared
//! between the two maps.
//!
//! Sharing is not just a memory optimization.  Because shared subtrees are *physically identical*,
//! two related maps can be compared by pruning every shared subtree in constant time, which makes
//! it cheap to enumerate the key-value pairs on which the maps differ (a "delta view").  This is
//! what makes the map suitable for workloads that fork state at a high rate and later need to know
//! what changed, such as the renaming tables of a symbolic-execution engine.
//!
//! # Example
//!
//! ```rust
//! use sharing_map::{DeltaView, SharingMap};
//!
//! let mut table = SharingMap::new();
//! table.insert_mut("x", 1);
//! table.insert_mut("y", 2);
//!
//! // O(1) snapshot; both maps share the whole trie.
//! let snapshot = table.clone();
//!
//! table.replace_mut("x", 3);
//!
//! // Enumerate the differences between the map and its snapshot.
//! let mut delta = DeltaView::new();
//! table.get_delta_view(&snapshot, &mut delta, true);
//!
//! assert_eq!(delta.len(), 1);
//! assert_eq!(delta[0].key, &"x");
//! assert_eq!(delta[0].value, &3);
//! assert_eq!(delta[0].other_value, Some(&1));
//! ```
//!
//! The map comes in two flavors: [`SharingMap`] is reference counted with
//! [`Rc`](std::rc::Rc) semantics, while [`SharingMapSync`] uses atomic reference counts and
//! implements `Send + Sync` when its keys and values do.

mod utils;

pub mod map;

pub use crate::map::entry::ValueCheck;
pub use crate::map::sharing_map::{
    DeltaView, DeltaViewItem, SharingMap, SharingMapSync, SharingStats, View,
};
