/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

mod sparse_array_usize;

use self::sparse_array_usize::SparseArrayUsize;
use crate::map::entry::{Entry, ValueCheck};
use crate::utils::DefaultBuildHasher;
use archery::{ArcTK, RcK, SharedPointer, SharedPointerKind};
use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::hash::{BuildHasher, Hash};
use std::iter::Peekable;
use std::mem::size_of;
use std::ops::Index;
use std::slice;

type HashValue = u64;

// TODO Use impl trait instead of this when available.
pub type Iter<'a, K, V, P> = std::iter::Map<
    IterPtr<'a, K, V, P>,
    fn(&'a SharedPointer<Entry<K, V>, P>) -> (&'a K, &'a V),
>;
pub type IterKeys<'a, K, V, P> = std::iter::Map<Iter<'a, K, V, P>, fn((&'a K, &V)) -> &'a K>;
pub type IterValues<'a, K, V, P> = std::iter::Map<Iter<'a, K, V, P>, fn((&K, &'a V)) -> &'a V>;

const DEFAULT_BITS: u8 = 30;
const DEFAULT_CHUNK: u8 = 3;

/// Creates a [`SharingMap`](crate::SharingMap) containing the given arguments:
///
/// ```
/// # use sharing_map::*;
/// #
/// let mut m = SharingMap::new();
/// m.insert_mut(1, "one");
/// m.insert_mut(2, "two");
/// m.insert_mut(3, "three");
///
/// assert_eq!(sharing_map![1 => "one", 2 => "two", 3 => "three"], m);
/// ```
///
/// The keys must be pairwise distinct, as with [`insert_mut`](crate::SharingMap::insert_mut).
#[macro_export]
macro_rules! sharing_map {
    ($($k:expr => $v:expr),*) => {
        {
            #[allow(unused_mut)]
            let mut m = $crate::SharingMap::new();
            $(
                m.insert_mut($k, $v);
            )*
            m
        }
    };
}

/// Creates a [`SharingMap`](crate::SharingMap) that implements `Sync`, containing the given
/// arguments:
///
/// ```
/// # use sharing_map::*;
/// #
/// let mut m = SharingMap::new_sync();
/// m.insert_mut(1, "one");
/// m.insert_mut(2, "two");
///
/// assert_eq!(sharing_map_sync![1 => "one", 2 => "two"], m);
///
/// fn is_sync() -> impl Sync {
///     sharing_map_sync![0 => 1, 1 => 2]
/// }
/// ```
#[macro_export]
macro_rules! sharing_map_sync {
    ($($k:expr => $v:expr),*) => {
        {
            #[allow(unused_mut)]
            let mut m = $crate::SharingMapSync::new_sync();
            $(
                m.insert_mut($k, $v);
            )*
            m
        }
    };
}

/// A map implemented as a fixed-height hash trie where subtrees can be physically shared between
/// different maps.
///
/// Cloning a map is O(1): the clone points at the same root node.  Mutations perform path
/// copying: every node from the root to the affected leaf that is still shared with another map
/// is copied before being written, so the untouched rest of the trie stays shared.  Physical
/// sharing is what [`get_delta_view`](SharingMap::get_delta_view) exploits to list the entries on
/// which two related maps differ while skipping their common subtrees in constant time.
///
/// Unlike a general-purpose map, the mutating operations have strict preconditions:
/// [`insert`](SharingMap::insert) requires the key to be absent, and
/// [`remove`](SharingMap::remove), [`replace`](SharingMap::replace) and
/// [`update`](SharingMap::update) require it to be present.  Violations are programmer errors and
/// panic.  This keeps every operation a deliberate choice about sharing: a blind
/// "insert-or-update" would silently copy paths for nothing.
///
/// # Complexity
///
/// Let *N* be the number of entries, *M* the longest collision chain in a leaf container, *H* the
/// trie height and *S* the fanout (*H* and *S* are configuration parameters, 10 and 8 by
/// default).
///
/// | Operation                  | Best case | Worst case      |
/// |:-------------------------- | ---------:| ---------------:|
/// | `new()`                    |      Θ(1) |            Θ(1) |
/// | `insert_mut()`             |      Θ(H) |    Θ(H·S + M)   |
/// | `remove_mut()`             |      Θ(H) |    Θ(H·S + M)   |
/// | `get()`                    |      Θ(H) | Θ(H·log(S) + M) |
/// | `size()`                   |      Θ(1) |            Θ(1) |
/// | `clone()`                  |      Θ(1) |            Θ(1) |
/// | `get_view()`               |  Θ(N + H) | Θ(N·H·log(S))   |
/// | `get_delta_view()`         |      Θ(1) | Θ(N·H·log(S)·M²)|
///
/// The best case of `get_delta_view` is reached when the two maps share their whole trie; the
/// worst case when they share nothing.
///
/// # Implementation details
///
/// See the `Node` documentation for the trie structure.
#[derive(Debug)]
pub struct SharingMap<K, V, P = RcK, H = DefaultBuildHasher>
where
    P: SharedPointerKind,
    H: BuildHasher,
{
    root: SharedPointer<Node<K, V, P>, P>,
    size: usize,
    geometry: Geometry,
    hasher_builder: H,
}

pub type SharingMapSync<K, V, H = DefaultBuildHasher> = SharingMap<K, V, ArcTK, H>;

/// Trie geometry: the number of significant hash bits and the number of bits consumed per level.
/// The derived height is `bits / chunk` and the fanout is `2^chunk`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Geometry {
    bits: u8,
    chunk: u8,
}

impl Geometry {
    fn new(bits: u8, chunk: u8) -> Geometry {
        let hash_bits = 8 * size_of::<HashValue>();
        let max_chunk = (8 * size_of::<usize>()).trailing_zeros() as u8;

        assert!(chunk >= 1, "chunk must be at least one bit");
        assert!(bits >= chunk, "bits must be at least chunk");
        assert!(bits as usize <= hash_bits, "bits must not exceed the hash width");
        assert!(bits % chunk == 0, "bits must be a multiple of chunk");
        assert!(chunk <= max_chunk, "fanout must not exceed the child array capacity");

        Geometry { bits, chunk }
    }

    #[inline]
    fn height(self) -> usize {
        (self.bits / self.chunk) as usize
    }

    #[inline]
    fn mask(self) -> HashValue {
        (1 << self.chunk) - 1
    }
}

/// The trie breaks the hash of a key into `chunk`-bit segments, used low bits first as child
/// indices on the way down.  The actual key-value pairs live in *container* nodes, which sit
/// below the internal node that consumed the last distinguishing segment.
///
/// Consider chunks of 3 bits and the following hashes:
///
/// | *key*   | *hash(key)*               |
/// | ------- | -------------------------:|
/// |   *A*   | `0b_···_001_101`          |
/// |   *B*   | `0b_···_011_101`          |
/// |   *C*   | `0b_···_000_010`          |
///
/// *C* is alone under index `0b010` of the root, so its container hangs right there.  *A* and *B*
/// share their first segment `0b101`, so an internal node is interposed and their containers hang
/// under its indices `0b001` and `0b011`.  Two keys whose hashes agree on *every* segment end up
/// chained in a single container at the maximum depth.
///
/// Invariants:
///
///   1. The root is the only internal node that can have zero children.
///   2. A container holds at least one entry, and exactly one unless it is at the maximum depth.
///   3. Within a container no two entries have equal keys.
///   4. The segments on the path to a container spell out the low bits of the hash of every key
///      stored in it.
///
/// Nodes are held behind shared pointers; a mutation copies every shared node on the path it
/// touches before writing (see `SharedPointer::make_mut`), which is what keeps other maps'
/// subtrees intact.
#[derive(Debug)]
enum Node<K, V, P>
where
    P: SharedPointerKind,
{
    Internal(SparseArrayUsize<SharedPointer<Node<K, V, P>, P>>),
    Container(Vec<EntryWithHash<K, V, P>>),
}

#[derive(Debug)]
struct EntryWithHash<K, V, P>
where
    P: SharedPointerKind,
{
    entry: SharedPointer<Entry<K, V>, P>,
    key_hash: HashValue,
}

mod node_utils {
    use super::{Geometry, HashValue};
    use archery::{SharedPointer, SharedPointerKind};
    use std::hash::{BuildHasher, Hash, Hasher};

    // Returns the child index for the given hash on depth `depth`.
    #[inline]
    pub fn chunk_from_hash(hash: HashValue, depth: usize, geometry: Geometry) -> usize {
        debug_assert!(depth < geometry.height(), "hash segments exhausted below the bottom level");

        let shift = depth as u32 * u32::from(geometry.chunk);

        ((hash >> shift) & geometry.mask()) as usize
    }

    pub fn hash<T: ?Sized + Hash, H: BuildHasher>(v: &T, hasher_builder: &H) -> HashValue {
        let mut hasher = hasher_builder.build_hasher();

        v.hash(&mut hasher);

        hasher.finish()
    }

    /// Physical-identity test: two handles share iff they point at the same allocation.
    #[inline]
    pub fn shares_with<T, P: SharedPointerKind>(
        a: &SharedPointer<T, P>,
        b: &SharedPointer<T, P>,
    ) -> bool {
        std::ptr::eq(a.as_ref(), b.as_ref())
    }

    #[inline]
    pub fn raw_address<T, P: SharedPointerKind>(ptr: &SharedPointer<T, P>) -> usize {
        ptr.as_ref() as *const T as usize
    }
}

impl<K, V, P> Node<K, V, P>
where
    K: Eq + Hash,
    P: SharedPointerKind,
{
    fn new_empty_internal() -> Node<K, V, P> {
        Node::Internal(SparseArrayUsize::new())
    }

    fn get<Q: ?Sized>(
        &self,
        key: &Q,
        key_hash: HashValue,
        depth: usize,
        geometry: Geometry,
    ) -> Option<&EntryWithHash<K, V, P>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        match self {
            Node::Internal(children) => {
                let index = node_utils::chunk_from_hash(key_hash, depth, geometry);

                children
                    .get(index)
                    .and_then(|child| child.get(key, key_hash, depth + 1, geometry))
            }
            Node::Container(leaves) => leaves.iter().find(|leaf| leaf.matches(key, key_hash)),
        }
    }

    /// Inserts an entry for a key that is not yet in the trie.  `self` must be an internal node;
    /// every shared node on the descent is copied first.
    fn insert(&mut self, entry: EntryWithHash<K, V, P>, depth: usize, geometry: Geometry) {
        let children = match self {
            Node::Internal(children) => children,
            Node::Container(_) => unreachable!("insertion only descends internal nodes"),
        };
        let index = node_utils::chunk_from_hash(entry.key_hash, depth, geometry);

        match children.get_mut(index) {
            None => {
                children.set(index, SharedPointer::new(Node::Container(vec![entry])));
            }
            Some(child) => {
                if matches!(child.as_ref(), Node::Internal(_)) {
                    SharedPointer::make_mut(child).insert(entry, depth + 1, geometry);
                } else if depth < geometry.height() - 1 {
                    // The occupied slot is a container above the bottom, so it holds a single
                    // entry whose hash path collides with the new key so far.  Push it down
                    // until the paths diverge.
                    let existing = SharedPointer::clone(child);

                    *child =
                        SharedPointer::new(Node::migrate(existing, entry, depth + 1, geometry));
                } else {
                    match SharedPointer::make_mut(child) {
                        Node::Container(leaves) => leaves.push(entry),
                        Node::Internal(_) => unreachable!("bottom slots hold containers"),
                    }
                }
            }
        }
    }

    /// Builds the internal spine that replaces a colliding container.  The spine follows the
    /// common hash-segment prefix of the existing entry and the new one; the existing container
    /// node is reused unchanged on its side of the split, so it keeps its identity in maps that
    /// share it.
    fn migrate(
        existing: SharedPointer<Node<K, V, P>, P>,
        entry: EntryWithHash<K, V, P>,
        depth: usize,
        geometry: Geometry,
    ) -> Node<K, V, P> {
        let existing_hash = match existing.as_ref() {
            Node::Container(leaves) => {
                debug_assert_eq!(leaves.len(), 1, "only bottom containers can chain entries");
                leaves[0].key_hash
            }
            Node::Internal(_) => unreachable!("only containers are migrated"),
        };

        let index_existing = node_utils::chunk_from_hash(existing_hash, depth, geometry);
        let index_new = node_utils::chunk_from_hash(entry.key_hash, depth, geometry);

        let mut children = SparseArrayUsize::new();

        if index_existing != index_new {
            children.set(index_existing, existing);
            children.set(index_new, SharedPointer::new(Node::Container(vec![entry])));
        } else if depth == geometry.height() - 1 {
            // The hashes agree on every segment: chain both entries at the bottom.
            let existing_leaf = match existing.as_ref() {
                Node::Container(leaves) => leaves[0].clone(),
                Node::Internal(_) => unreachable!(),
            };

            children.set(
                index_new,
                SharedPointer::new(Node::Container(vec![existing_leaf, entry])),
            );
        } else {
            children.set(
                index_new,
                SharedPointer::new(Node::migrate(existing, entry, depth + 1, geometry)),
            );
        }

        Node::Internal(children)
    }

    /// Removes the entry of `key`, which must be present.  Returns `true` when this node became
    /// empty and must be unlinked by its parent, which collapses the spine left behind by the
    /// removal.
    fn remove<Q: ?Sized>(
        &mut self,
        key: &Q,
        key_hash: HashValue,
        depth: usize,
        geometry: Geometry,
    ) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let children = match self {
            Node::Internal(children) => children,
            Node::Container(_) => unreachable!("removal only descends internal nodes"),
        };
        let index = node_utils::chunk_from_hash(key_hash, depth, geometry);

        let child = match children.get_mut(index) {
            Some(child) => child,
            None => panic!("removed key is not in the map"),
        };
        let child_node = SharedPointer::make_mut(child);

        let unlink_child = if let Node::Container(leaves) = child_node {
            match leaves.iter().position(|leaf| leaf.matches(key, key_hash)) {
                None => panic!("removed key is not in the map"),
                Some(_) if leaves.len() == 1 => true,
                Some(position) => {
                    leaves.swap_remove(position);
                    false
                }
            }
        } else {
            child_node.remove(key, key_hash, depth + 1, geometry)
        };

        if unlink_child {
            children.remove(index);
        }

        children.size() == 0
    }

    /// Descends to the entry of `key` copying every shared node on the way, so the caller can
    /// mutate the entry without affecting other maps.
    fn find_entry_mut<Q: ?Sized>(
        &mut self,
        key: &Q,
        key_hash: HashValue,
        depth: usize,
        geometry: Geometry,
    ) -> Option<&mut EntryWithHash<K, V, P>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        match self {
            Node::Internal(children) => {
                let index = node_utils::chunk_from_hash(key_hash, depth, geometry);

                children.get_mut(index).and_then(|child| {
                    SharedPointer::make_mut(child).find_entry_mut(key, key_hash, depth + 1, geometry)
                })
            }
            Node::Container(leaves) => {
                leaves.iter_mut().find(|leaf| leaf.matches(key, key_hash))
            }
        }
    }
}

impl<K, V, P> Clone for Node<K, V, P>
where
    P: SharedPointerKind,
{
    fn clone(&self) -> Node<K, V, P> {
        match self {
            Node::Internal(children) => Node::Internal(children.clone()),
            Node::Container(leaves) => Node::Container(leaves.clone()),
        }
    }
}

impl<K, V, P> EntryWithHash<K, V, P>
where
    K: Eq + Hash,
    P: SharedPointerKind,
{
    fn new<H: BuildHasher>(key: K, value: V, hasher_builder: &H) -> EntryWithHash<K, V, P> {
        let key_hash = node_utils::hash(&key, hasher_builder);

        EntryWithHash { entry: SharedPointer::new(Entry::new(key, value)), key_hash }
    }

    fn key(&self) -> &K {
        &self.entry.key
    }

    fn value(&self) -> &V {
        &self.entry.value
    }

    #[inline]
    fn matches<Q: ?Sized>(&self, key: &Q, key_hash: HashValue) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.key_hash == key_hash && self.key().borrow() == key
    }

    #[inline]
    fn shares_with(&self, other: &EntryWithHash<K, V, P>) -> bool {
        node_utils::shares_with(&self.entry, &other.entry)
    }
}

impl<K, V, P> Clone for EntryWithHash<K, V, P>
where
    P: SharedPointerKind,
{
    fn clone(&self) -> EntryWithHash<K, V, P> {
        EntryWithHash { entry: SharedPointer::clone(&self.entry), key_hash: self.key_hash }
    }
}

/// A view of the entries of a map: one `(key, value)` reference pair per entry, in unspecified
/// order.  The references stay valid until the map is mutated or dropped.
pub type View<'a, K, V> = Vec<(&'a K, &'a V)>;

/// One item of a delta view (see [`SharingMap::get_delta_view`]).  `key` and `value` refer to the
/// queried map; `other_value` refers to the compared map and is absent when the key only exists
/// in the queried one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeltaViewItem<'a, K, V> {
    pub key: &'a K,
    pub value: &'a V,
    pub other_value: Option<&'a V>,
}

impl<'a, K, V> DeltaViewItem<'a, K, V> {
    #[must_use]
    pub fn is_in_both_maps(&self) -> bool {
        self.other_value.is_some()
    }
}

/// A delta view of two maps: the entries that are not contained in subtrees shared by both maps.
pub type DeltaView<'a, K, V> = Vec<DeltaViewItem<'a, K, V>>;

/// Sharing statistics over a group of maps, as returned by
/// [`SharingMap::get_sharing_stats`].
///
/// `num_nodes` counts every reference-counted object (trie nodes and entry records) reachable
/// from the given maps, counting an object once per map that contains it; `num_unique_nodes`
/// counts each object once.  The leaf fields count only the entry records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SharingStats {
    pub num_nodes: usize,
    pub num_unique_nodes: usize,
    pub num_leaves: usize,
    pub num_unique_leaves: usize,
}

impl<K, V> SharingMap<K, V>
where
    K: Eq + Hash,
{
    #[must_use]
    pub fn new() -> SharingMap<K, V> {
        SharingMap::new_with_hasher_and_ptr_kind(DefaultBuildHasher::default())
    }

    /// Creates a map that uses `bits` hash bits, consuming `chunk` bits per trie level.
    ///
    /// # Panics
    ///
    /// Panics unless `1 <= chunk`, `chunk` divides `bits`, `bits` fits the hash width, and the
    /// fanout `2^chunk` fits the child arrays.
    #[must_use]
    pub fn new_with_geometry(bits: u8, chunk: u8) -> SharingMap<K, V> {
        SharingMap::new_with_hasher_and_geometry_and_ptr_kind(
            DefaultBuildHasher::default(),
            bits,
            chunk,
        )
    }
}

impl<K, V> SharingMapSync<K, V>
where
    K: Eq + Hash,
{
    #[must_use]
    pub fn new_sync() -> SharingMapSync<K, V> {
        SharingMap::new_with_hasher_and_ptr_kind(DefaultBuildHasher::default())
    }
}

impl<K, V, P, H> SharingMap<K, V, P, H>
where
    K: Eq + Hash,
    P: SharedPointerKind,
    H: BuildHasher,
{
    pub fn new_with_hasher_and_ptr_kind(hasher_builder: H) -> SharingMap<K, V, P, H> {
        SharingMap::new_with_hasher_and_geometry_and_ptr_kind(
            hasher_builder,
            DEFAULT_BITS,
            DEFAULT_CHUNK,
        )
    }

    pub fn new_with_hasher_and_geometry_and_ptr_kind(
        hasher_builder: H,
        bits: u8,
        chunk: u8,
    ) -> SharingMap<K, V, P, H> {
        SharingMap {
            root: SharedPointer::new(Node::new_empty_internal()),
            size: 0,
            geometry: Geometry::new(bits, chunk),
            hasher_builder,
        }
    }

    #[must_use]
    pub fn get<Q: ?Sized>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let key_hash = node_utils::hash(key, &self.hasher_builder);

        self.root.get(key, key_hash, 0, self.geometry).map(EntryWithHash::value)
    }

    #[must_use]
    pub fn get_key_value<Q: ?Sized>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let key_hash = node_utils::hash(key, &self.hasher_builder);

        self.root.get(key, key_hash, 0, self.geometry).map(|e| (e.key(), e.value()))
    }

    #[must_use]
    pub fn contains_key<Q: ?Sized>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.get(key).is_some()
    }

    /// Inserts an entry for a key that must not be in the map.  Inserting over an existing key is
    /// a programmer error (debug builds check this); callers that are unsure use
    /// [`contains_key`](SharingMap::contains_key) first.
    #[must_use]
    pub fn insert(&self, key: K, value: V) -> SharingMap<K, V, P, H>
    where
        H: Clone,
    {
        let mut new_map = self.clone();

        new_map.insert_mut(key, value);

        new_map
    }

    pub fn insert_mut(&mut self, key: K, value: V) {
        debug_assert!(!self.contains_key(&key), "inserted key is already in the map");

        let entry = EntryWithHash::new(key, value, &self.hasher_builder);

        SharedPointer::make_mut(&mut self.root).insert(entry, 0, self.geometry);
        self.size += 1;
    }

    /// Removes the entry of a key that must be in the map.
    ///
    /// # Panics
    ///
    /// Panics if the key is not in the map.
    #[must_use]
    pub fn remove<Q: ?Sized>(&self, key: &Q) -> SharingMap<K, V, P, H>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
        H: Clone,
    {
        let mut new_map = self.clone();

        new_map.remove_mut(key);

        new_map
    }

    pub fn remove_mut<Q: ?Sized>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let key_hash = node_utils::hash(key, &self.hasher_builder);

        SharedPointer::make_mut(&mut self.root).remove(key, key_hash, 0, self.geometry);
        self.size -= 1;
    }

    /// Removes the entry of `key` if there is one.
    #[must_use]
    pub fn remove_if_exists<Q: ?Sized>(&self, key: &Q) -> SharingMap<K, V, P, H>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
        H: Clone,
    {
        let mut new_map = self.clone();

        new_map.remove_if_exists_mut(key);

        new_map
    }

    /// Removes the entry of `key` if there is one.  Returns whether an entry was removed.
    pub fn remove_if_exists_mut<Q: ?Sized>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        if self.contains_key(key) {
            self.remove_mut(key);
            true
        } else {
            false
        }
    }

    /// Replaces the value of a key that must be in the map.
    ///
    /// # Panics
    ///
    /// Panics if the key is not in the map.  With the `fail-if-equal` feature enabled it also
    /// panics when the new value is equal to the old one, since such a replacement breaks sharing
    /// without changing the map.
    #[must_use]
    pub fn replace<Q: ?Sized>(&self, key: &Q, value: V) -> SharingMap<K, V, P, H>
    where
        K: Borrow<Q> + Clone,
        Q: Hash + Eq,
        V: Clone + ValueCheck,
        H: Clone,
    {
        let mut new_map = self.clone();

        new_map.replace_mut(key, value);

        new_map
    }

    pub fn replace_mut<Q: ?Sized>(&mut self, key: &Q, value: V)
    where
        K: Borrow<Q> + Clone,
        Q: Hash + Eq,
        V: Clone + ValueCheck,
    {
        let key_hash = node_utils::hash(key, &self.hasher_builder);
        let entry = SharedPointer::make_mut(&mut self.root)
            .find_entry_mut(key, key_hash, 0, self.geometry);
        let entry = match entry {
            Some(entry) => entry,
            None => panic!("replaced key is not in the map"),
        };

        SharedPointer::make_mut(&mut entry.entry).set_value(value);
    }

    /// Updates the value of a key that must be in the map by applying `mutator` in place.  This
    /// avoids a copy-out / edit / replace sequence without leaking a `&mut` reference.
    ///
    /// # Panics
    ///
    /// Panics if the key is not in the map.  With the `fail-if-equal` feature enabled it also
    /// panics when the mutator leaves the value unchanged; callers that are unsure check with
    /// [`get`](SharingMap::get) beforehand.
    #[must_use]
    pub fn update<Q: ?Sized, F>(&self, key: &Q, mutator: F) -> SharingMap<K, V, P, H>
    where
        K: Borrow<Q> + Clone,
        Q: Hash + Eq,
        V: Clone + ValueCheck,
        F: FnOnce(&mut V),
        H: Clone,
    {
        let mut new_map = self.clone();

        new_map.update_mut(key, mutator);

        new_map
    }

    pub fn update_mut<Q: ?Sized, F>(&mut self, key: &Q, mutator: F)
    where
        K: Borrow<Q> + Clone,
        Q: Hash + Eq,
        V: Clone + ValueCheck,
        F: FnOnce(&mut V),
    {
        let key_hash = node_utils::hash(key, &self.hasher_builder);
        let entry = SharedPointer::make_mut(&mut self.root)
            .find_entry_mut(key, key_hash, 0, self.geometry);
        let entry = match entry {
            Some(entry) => entry,
            None => panic!("updated key is not in the map"),
        };

        SharedPointer::make_mut(&mut entry.entry).mutate_value(mutator);
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&mut self) {
        self.root = SharedPointer::new(Node::new_empty_internal());
        self.size = 0;
    }

    pub fn swap(&mut self, other: &mut SharingMap<K, V, P, H>) {
        std::mem::swap(self, other);
    }

    /// Calls `f` for every entry of the map, in unspecified order.
    pub fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        if self.is_empty() {
            return;
        }

        Self::iterate_entries(&self.root, &mut |leaf| f(leaf.key(), leaf.value()));
    }

    /// Fills `view` with one `(key, value)` reference pair per entry, in unspecified order.
    ///
    /// # Panics
    ///
    /// Panics if `view` is not empty.
    pub fn get_view<'a>(&'a self, view: &mut View<'a, K, V>) {
        assert!(view.is_empty(), "the view buffer must be empty");

        if self.is_empty() {
            return;
        }

        Self::iterate_entries(&self.root, &mut |leaf| view.push((leaf.key(), leaf.value())));
    }

    /// Fills `delta_view` with the entries of `self` that are not in subtrees shared with
    /// `other`.
    ///
    /// For each produced item one of two things holds:
    ///
    /// - the key is in both maps, and the maps do not share the subtrees holding its entries
    ///   (that is, some mutation since the maps diverged touched the key's path), or
    /// - the key is only in `self`, and `only_common` is `false`.
    ///
    /// Keys that exist only in `other` are never reported; the operation is asymmetric.  Shared
    /// subtrees are skipped wholesale by a physical-identity test, so comparing a map with a
    /// lightly mutated clone of itself visits only the copied paths.
    ///
    /// Note that sharing is a conservative witness of equality: entries of `self` that happen to
    /// equal their counterpart in `other` without being physically shared (for example because
    /// the same insertions were replayed on both maps independently) are still reported.
    ///
    /// Both maps must use the same hasher.
    ///
    /// # Panics
    ///
    /// Panics if `delta_view` is not empty or the maps' geometries differ.
    pub fn get_delta_view<'a>(
        &'a self,
        other: &'a SharingMap<K, V, P, H>,
        delta_view: &mut DeltaView<'a, K, V>,
        only_common: bool,
    ) {
        assert!(delta_view.is_empty(), "the delta view buffer must be empty");
        assert!(
            self.geometry == other.geometry,
            "both maps must use the same trie geometry"
        );

        if self.is_empty() {
            return;
        }

        if other.is_empty() {
            if !only_common {
                Self::gather_all(&self.root, delta_view);
            }

            return;
        }

        if node_utils::shares_with(&self.root, &other.root) {
            return;
        }

        // A DFS in lockstep over both tries.  Each stack item pairs corresponding nodes of the
        // two maps together with their depth; the depth is `None` when the pair was produced by
        // the internal-versus-container case below, where the containers to be compared are not
        // reached by consuming further hash segments.
        let mut stack: Vec<(
            &'a SharedPointer<Node<K, V, P>, P>,
            &'a SharedPointer<Node<K, V, P>, P>,
            Option<usize>,
        )> = vec![(&self.root, &other.root, Some(0))];

        while let Some((a, b, level)) = stack.pop() {
            match (a.as_ref(), b.as_ref()) {
                (Node::Internal(a_children), Node::Container(_)) => {
                    // `b` holds a single entry: only bottom containers chain, and the bottom of
                    // the other map faces an internal node here, so `b` is above the bottom.
                    for (_, a_child) in a_children.iter_entries() {
                        if !node_utils::shares_with(a_child, b) {
                            stack.push((a_child, b, None));
                        }
                    }
                }
                (Node::Internal(a_children), Node::Internal(b_children)) => {
                    let level = level.expect("internal node pairs always carry a depth");

                    for (index, a_child) in a_children.iter_entries() {
                        match b_children.get(index) {
                            None => {
                                // The whole subtree exists only in the first map.
                                if !only_common {
                                    Self::gather_all(a_child, delta_view);
                                }
                            }
                            Some(b_child) => {
                                if !node_utils::shares_with(a_child, b_child) {
                                    stack.push((a_child, b_child, Some(level + 1)));
                                }
                            }
                        }
                    }
                }
                (Node::Container(a_leaves), Node::Internal(_)) => {
                    let level = level.expect("container/internal pairs always carry a depth");

                    Self::add_item_if_not_shared(
                        a,
                        a_leaves,
                        b,
                        level,
                        self.geometry,
                        delta_view,
                        only_common,
                    );
                }
                (Node::Container(a_leaves), Node::Container(b_leaves)) => {
                    for l1 in a_leaves {
                        match b_leaves.iter().find(|l2| l1.key() == l2.key()) {
                            Some(l2) => {
                                if !l1.shares_with(l2) {
                                    delta_view.push(DeltaViewItem {
                                        key: l1.key(),
                                        value: l1.value(),
                                        other_value: Some(l2.value()),
                                    });
                                }
                            }
                            None => {
                                if !only_common {
                                    delta_view.push(DeltaViewItem {
                                        key: l1.key(),
                                        value: l1.value(),
                                        other_value: None,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Adds a delta item for the single entry of `container` unless it is shared with the
    /// corresponding entry somewhere below `inner`.  `container` belongs to the queried map,
    /// `inner` to the other map, and both sit at depth `level` in their respective tries.
    fn add_item_if_not_shared<'a>(
        container: &'a SharedPointer<Node<K, V, P>, P>,
        leaves: &'a [EntryWithHash<K, V, P>],
        inner: &'a SharedPointer<Node<K, V, P>, P>,
        level: usize,
        geometry: Geometry,
        delta_view: &mut DeltaView<'a, K, V>,
        only_common: bool,
    ) {
        debug_assert_eq!(leaves.len(), 1, "only bottom containers can chain entries");

        let l1 = &leaves[0];
        let mut node = inner;
        let mut depth = level;

        loop {
            match node.as_ref() {
                Node::Internal(children) => {
                    let index = node_utils::chunk_from_hash(l1.key_hash, depth, geometry);

                    match children.get(index) {
                        None => {
                            // The key is only in the first map.
                            if !only_common {
                                delta_view.push(DeltaViewItem {
                                    key: l1.key(),
                                    value: l1.value(),
                                    other_value: None,
                                });
                            }

                            return;
                        }
                        Some(child) => {
                            node = child;
                            depth += 1;
                        }
                    }
                }
                Node::Container(other_leaves) => {
                    if node_utils::shares_with(container, node) {
                        return;
                    }

                    for l2 in other_leaves {
                        if l1.shares_with(l2) {
                            return;
                        }

                        if l1.key() == l2.key() {
                            delta_view.push(DeltaViewItem {
                                key: l1.key(),
                                value: l1.value(),
                                other_value: Some(l2.value()),
                            });

                            return;
                        }
                    }

                    if !only_common {
                        delta_view.push(DeltaViewItem {
                            key: l1.key(),
                            value: l1.value(),
                            other_value: None,
                        });
                    }

                    return;
                }
            }
        }
    }

    fn gather_all<'a>(
        node: &'a SharedPointer<Node<K, V, P>, P>,
        delta_view: &mut DeltaView<'a, K, V>,
    ) {
        Self::iterate_entries(node, &mut |leaf| {
            delta_view.push(DeltaViewItem {
                key: leaf.key(),
                value: leaf.value(),
                other_value: None,
            });
        });
    }

    fn iterate_entries<'a, F>(node: &'a SharedPointer<Node<K, V, P>, P>, f: &mut F)
    where
        F: FnMut(&'a EntryWithHash<K, V, P>),
    {
        let mut stack: Vec<&'a SharedPointer<Node<K, V, P>, P>> = vec![node];

        while let Some(node) = stack.pop() {
            match node.as_ref() {
                Node::Internal(children) => stack.extend(children.iter()),
                Node::Container(leaves) => {
                    for leaf in leaves {
                        f(leaf);
                    }
                }
            }
        }
    }

    /// Computes sharing statistics over a group of maps.  Intended for diagnosis: one traversal
    /// is made per statistic.
    pub fn get_sharing_stats<'a, I>(maps: I) -> SharingStats
    where
        I: IntoIterator<Item = &'a SharingMap<K, V, P, H>>,
        K: 'a,
        V: 'a,
        P: 'a,
        H: 'a,
    {
        let maps: Vec<&SharingMap<K, V, P, H>> = maps.into_iter().collect();
        let mut marked: BTreeSet<usize> = BTreeSet::new();
        let mut stats = SharingStats::default();

        for map in &maps {
            stats.num_nodes += map.count_unmarked_nodes(false, &mut marked, false);
        }

        debug_assert!(marked.is_empty());

        for map in &maps {
            stats.num_unique_nodes += map.count_unmarked_nodes(false, &mut marked, true);
        }

        marked.clear();

        for map in &maps {
            stats.num_leaves += map.count_unmarked_nodes(true, &mut marked, false);
        }

        debug_assert!(marked.is_empty());

        for map in &maps {
            stats.num_unique_leaves += map.count_unmarked_nodes(true, &mut marked, true);
        }

        stats
    }

    /// Counts the nodes (or just the entry records, with `leaves_only`) reachable from the root
    /// that are not in `marked`, stopping at marked subtrees.  With `mark` set, visited nodes are
    /// added to `marked` so that later walks skip them.
    fn count_unmarked_nodes(
        &self,
        leaves_only: bool,
        marked: &mut BTreeSet<usize>,
        mark: bool,
    ) -> usize {
        if self.is_empty() {
            return 0;
        }

        let mut count = 0;
        let mut stack: Vec<&SharedPointer<Node<K, V, P>, P>> = vec![&self.root];

        while let Some(node) = stack.pop() {
            let address = node_utils::raw_address(node);

            if marked.contains(&address) {
                continue;
            }

            if mark {
                marked.insert(address);
            }

            if !leaves_only {
                count += 1;
            }

            match node.as_ref() {
                Node::Internal(children) => stack.extend(children.iter()),
                Node::Container(leaves) => {
                    for leaf in leaves {
                        let leaf_address = node_utils::raw_address(&leaf.entry);

                        if marked.contains(&leaf_address) {
                            continue;
                        }

                        if mark {
                            marked.insert(leaf_address);
                        }

                        count += 1;
                    }
                }
            }
        }

        count
    }

    #[must_use]
    pub fn iter(&self) -> Iter<'_, K, V, P> {
        self.iter_ptr().map(|e| (&e.key, &e.value))
    }

    fn iter_ptr(&self) -> IterPtr<'_, K, V, P> {
        IterPtr::new(self)
    }

    #[must_use]
    pub fn keys(&self) -> IterKeys<'_, K, V, P> {
        self.iter().map(|(k, _)| k)
    }

    #[must_use]
    pub fn values(&self) -> IterValues<'_, K, V, P> {
        self.iter().map(|(_, v)| v)
    }
}

impl<'a, K, Q: ?Sized, V, P, H> Index<&'a Q> for SharingMap<K, V, P, H>
where
    K: Eq + Hash + Borrow<Q>,
    Q: Hash + Eq,
    P: SharedPointerKind,
    H: BuildHasher,
{
    type Output = V;

    fn index(&self, key: &Q) -> &V {
        self.get(key).expect("no entry found for key")
    }
}

impl<K, V, P, H> Clone for SharingMap<K, V, P, H>
where
    K: Eq + Hash,
    P: SharedPointerKind,
    H: BuildHasher + Clone,
{
    fn clone(&self) -> SharingMap<K, V, P, H> {
        SharingMap {
            root: SharedPointer::clone(&self.root),
            size: self.size,
            geometry: self.geometry,
            hasher_builder: self.hasher_builder.clone(),
        }
    }
}

impl<K, V, P, H> Default for SharingMap<K, V, P, H>
where
    K: Eq + Hash,
    P: SharedPointerKind,
    H: BuildHasher + Default,
{
    fn default() -> SharingMap<K, V, P, H> {
        SharingMap::new_with_hasher_and_ptr_kind(H::default())
    }
}

impl<K, V, P, PO, H, HO> PartialEq<SharingMap<K, V, PO, HO>> for SharingMap<K, V, P, H>
where
    K: Eq + Hash,
    V: PartialEq,
    P: SharedPointerKind,
    PO: SharedPointerKind,
    H: BuildHasher,
    HO: BuildHasher,
{
    fn eq(&self, other: &SharingMap<K, V, PO, HO>) -> bool {
        self.size() == other.size()
            && self.iter().all(|(key, value)| other.get(key).is_some_and(|v| *value == *v))
    }
}

impl<K, V, P, H> Eq for SharingMap<K, V, P, H>
where
    K: Eq + Hash,
    V: Eq,
    P: SharedPointerKind,
    H: BuildHasher,
{
}

impl<K, V, P, H> Display for SharingMap<K, V, P, H>
where
    K: Eq + Hash + Display,
    V: Display,
    P: SharedPointerKind,
    H: BuildHasher,
{
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;

        fmt.write_str("{")?;

        for (k, v) in self.iter() {
            if !first {
                fmt.write_str(", ")?;
            }
            k.fmt(fmt)?;
            fmt.write_str(": ")?;
            v.fmt(fmt)?;
            first = false;
        }

        fmt.write_str("}")
    }
}

impl<'a, K, V, P, H> IntoIterator for &'a SharingMap<K, V, P, H>
where
    K: Eq + Hash,
    P: SharedPointerKind,
    H: BuildHasher,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, P>;

    fn into_iter(self) -> Iter<'a, K, V, P> {
        self.iter()
    }
}

#[derive(Debug)]
pub struct IterPtr<'a, K, V, P>
where
    P: SharedPointerKind,
{
    stack: Vec<IterStackElement<'a, K, V, P>>,
    size: usize,
}

#[derive(Debug)]
enum IterStackElement<'a, K, V, P>
where
    P: SharedPointerKind,
{
    Internal(Peekable<slice::Iter<'a, SharedPointer<Node<K, V, P>, P>>>),
    Container(Peekable<slice::Iter<'a, EntryWithHash<K, V, P>>>),
}

impl<'a, K, V, P> IterStackElement<'a, K, V, P>
where
    K: Eq + Hash,
    P: SharedPointerKind,
{
    fn new(node: &'a SharedPointer<Node<K, V, P>, P>) -> IterStackElement<'a, K, V, P> {
        match node.as_ref() {
            Node::Internal(children) => IterStackElement::Internal(children.iter().peekable()),
            Node::Container(leaves) => IterStackElement::Container(leaves.iter().peekable()),
        }
    }

    fn current_elem(&mut self) -> &'a SharedPointer<Entry<K, V>, P> {
        match self {
            IterStackElement::Internal(_) => panic!("called current element of an internal node"),
            IterStackElement::Container(iter) => &iter.peek().unwrap().entry,
        }
    }

    /// Advance and returns `true` if finished.
    #[inline]
    fn advance(&mut self) -> bool {
        match self {
            IterStackElement::Internal(iter) => {
                iter.next();
                iter.peek().is_none()
            }
            IterStackElement::Container(iter) => {
                iter.next();
                iter.peek().is_none()
            }
        }
    }
}

impl<'a, K, V, P> IterPtr<'a, K, V, P>
where
    K: Eq + Hash,
    P: SharedPointerKind,
{
    fn new<H: BuildHasher>(map: &SharingMap<K, V, P, H>) -> IterPtr<'_, K, V, P> {
        let mut stack: Vec<IterStackElement<'_, K, V, P>> =
            Vec::with_capacity(map.geometry.height() + 1);

        if map.size() > 0 {
            stack.push(IterStackElement::new(&map.root));
        }

        let mut iter = IterPtr { stack, size: map.size() };

        iter.dig();

        iter
    }

    fn dig(&mut self) {
        let next_stack_elem: Option<IterStackElement<'a, K, V, P>> =
            self.stack.last_mut().and_then(|stack_top| match stack_top {
                IterStackElement::Internal(iter) => {
                    iter.peek().map(|node| IterStackElement::new(node))
                }
                IterStackElement::Container(_) => None,
            });

        if let Some(e) = next_stack_elem {
            self.stack.push(e);
            self.dig();
        }
    }

    fn advance(&mut self) {
        if let Some(mut stack_element) = self.stack.pop() {
            let finished = stack_element.advance();

            if finished {
                self.advance();
            } else {
                self.stack.push(stack_element);

                self.dig();
            }
        }
    }

    fn current(&mut self) -> Option<&'a SharedPointer<Entry<K, V>, P>> {
        self.stack.last_mut().map(IterStackElement::current_elem)
    }
}

impl<'a, K, V, P> Iterator for IterPtr<'a, K, V, P>
where
    K: Eq + Hash,
    P: SharedPointerKind,
{
    type Item = &'a SharedPointer<Entry<K, V>, P>;

    fn next(&mut self) -> Option<&'a SharedPointer<Entry<K, V>, P>> {
        let current = self.current();

        self.advance();

        if current.is_some() {
            self.size -= 1;
        }

        current
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.size, Some(self.size))
    }
}

impl<'a, K: Eq + Hash, V, P: SharedPointerKind> ExactSizeIterator for IterPtr<'a, K, V, P> {}

#[cfg(feature = "serde")]
pub mod serde {
    use super::*;
    use ::serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
    use ::serde::ser::{Serialize, Serializer};
    use std::fmt;
    use std::marker::PhantomData;

    impl<K, V, P, H> Serialize for SharingMap<K, V, P, H>
    where
        K: Eq + Hash + Serialize,
        V: Serialize,
        P: SharedPointerKind,
        H: BuildHasher,
    {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_map(self)
        }
    }

    impl<'de, K, V, P, H> Deserialize<'de> for SharingMap<K, V, P, H>
    where
        K: Eq + Hash + Deserialize<'de>,
        V: Deserialize<'de>,
        P: SharedPointerKind,
        H: BuildHasher + Default,
    {
        fn deserialize<D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<SharingMap<K, V, P, H>, D::Error> {
            deserializer.deserialize_map(SharingMapVisitor { phantom: PhantomData })
        }
    }

    struct SharingMapVisitor<K, V, P, H> {
        phantom: PhantomData<(K, V, P, H)>,
    }

    impl<'de, K, V, P, H> Visitor<'de> for SharingMapVisitor<K, V, P, H>
    where
        K: Eq + Hash + Deserialize<'de>,
        V: Deserialize<'de>,
        P: SharedPointerKind,
        H: BuildHasher + Default,
    {
        type Value = SharingMap<K, V, P, H>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a map")
        }

        fn visit_map<A>(self, mut map: A) -> Result<SharingMap<K, V, P, H>, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut sharing_map = SharingMap::new_with_hasher_and_ptr_kind(H::default());

            while let Some((k, v)) = map.next_entry()? {
                sharing_map.remove_if_exists_mut(&k);
                sharing_map.insert_mut(k, v);
            }

            Ok(sharing_map)
        }
    }
}

#[cfg(test)]
mod proptests;
