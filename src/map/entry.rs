/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

/// Change-detection hook used when the value of an [`Entry`] is replaced or updated.
///
/// With the `fail-if-equal` feature disabled (the default) every type qualifies and the hook does
/// nothing.  With the feature enabled the hook snapshots the previous value and reports whether
/// the operation changed it, which requires values to be `Clone + PartialEq`.  Replacing a value
/// with an equal one then panics: such a replacement copies the whole path to the leaf without
/// changing the map's contents, destroying sharing for no benefit.
pub trait ValueCheck {
    #[doc(hidden)]
    type Snapshot;

    #[doc(hidden)]
    fn snapshot(&self) -> Self::Snapshot;

    #[doc(hidden)]
    fn differs_from(&self, snapshot: &Self::Snapshot) -> bool;
}

#[cfg(not(feature = "fail-if-equal"))]
impl<T> ValueCheck for T {
    type Snapshot = ();

    #[inline]
    fn snapshot(&self) {}

    #[inline]
    fn differs_from(&self, _snapshot: &()) -> bool {
        true
    }
}

#[cfg(feature = "fail-if-equal")]
impl<T: Clone + PartialEq> ValueCheck for T {
    type Snapshot = T;

    fn snapshot(&self) -> T {
        self.clone()
    }

    fn differs_from(&self, snapshot: &T) -> bool {
        *self != *snapshot
    }
}

/// A key-value record.  Leaves of the trie hold these behind a shared pointer so that maps with a
/// common history point at the same record; a record is only written through
/// [`set_value`](Entry::set_value) or [`mutate_value`](Entry::mutate_value) once the copy-on-write
/// descent has made it uniquely owned.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Entry<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> Entry<K, V> {
    #[must_use]
    pub fn new(key: K, value: V) -> Entry<K, V> {
        Entry { key, value }
    }

    /// Replaces the value.
    ///
    /// # Panics
    ///
    /// With the `fail-if-equal` feature enabled, panics when the new value is equal to the old
    /// one.
    pub fn set_value(&mut self, value: V)
    where
        V: ValueCheck,
    {
        assert!(
            value.differs_from(&self.value.snapshot()),
            "a value must not be replaced with an equal value, as that needlessly breaks sharing"
        );

        self.value = value;
    }

    /// Applies `mutator` to the value in place.
    ///
    /// # Panics
    ///
    /// With the `fail-if-equal` feature enabled, panics when the mutator leaves the value
    /// unchanged.
    pub fn mutate_value<F>(&mut self, mutator: F)
    where
        V: ValueCheck,
        F: FnOnce(&mut V),
    {
        let snapshot = self.value.snapshot();

        mutator(&mut self.value);

        assert!(
            self.value.differs_from(&snapshot),
            "an update must change the value; check with a read-only lookup first when unsure"
        );
    }
}
