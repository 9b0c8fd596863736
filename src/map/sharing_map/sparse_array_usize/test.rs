/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

use super::*;
use pretty_assertions::assert_eq;

#[test]
fn test_map_index() {
    use sparse_array_usize_utils::map_index;

    assert_eq!(map_index(0b0, 0), None);
    assert_eq!(map_index(0b1, 0), Some(0));
    assert_eq!(map_index(0b10, 0), None);
    assert_eq!(map_index(0b10, 1), Some(0));
    assert_eq!(map_index(0b1011, 0), Some(0));
    assert_eq!(map_index(0b1011, 1), Some(1));
    assert_eq!(map_index(0b1011, 2), None);
    assert_eq!(map_index(0b1011, 3), Some(2));
    assert_eq!(map_index(0b1011, 60), None);
}

#[test]
fn test_set_and_get() {
    let mut array: SparseArrayUsize<char> = SparseArrayUsize::new();

    assert_eq!(array.size(), 0);
    assert_eq!(array.get(7), None);

    array.set(7, 'a');
    array.set(2, 'b');
    array.set(61, 'c');

    assert_eq!(array.size(), 3);
    assert_eq!(array.get(2), Some(&'b'));
    assert_eq!(array.get(7), Some(&'a'));
    assert_eq!(array.get(61), Some(&'c'));
    assert_eq!(array.get(0), None);
    assert_eq!(array.get(8), None);

    // Overwrite keeps the size.
    array.set(7, 'z');

    assert_eq!(array.size(), 3);
    assert_eq!(array.get(7), Some(&'z'));
}

#[test]
fn test_get_mut() {
    let mut array: SparseArrayUsize<char> = SparseArrayUsize::new();

    array.set(4, 'a');

    assert_eq!(array.get_mut(3), None);

    *array.get_mut(4).unwrap() = 'b';

    assert_eq!(array.get(4), Some(&'b'));
}

#[test]
fn test_remove() {
    let mut array: SparseArrayUsize<char> = SparseArrayUsize::new();

    array.set(2, 'a');
    array.set(5, 'b');

    assert_eq!(array.remove(3), None);
    assert_eq!(array.size(), 2);

    assert_eq!(array.remove(2), Some('a'));
    assert_eq!(array.size(), 1);
    assert_eq!(array.get(2), None);
    assert_eq!(array.get(5), Some(&'b'));

    assert_eq!(array.remove(5), Some('b'));
    assert_eq!(array.size(), 0);
}

#[test]
fn test_iter() {
    let mut array: SparseArrayUsize<u32> = SparseArrayUsize::new();

    array.set(9, 100);
    array.set(0, 200);
    array.set(63, 300);

    let values: Vec<u32> = array.iter().copied().collect();

    assert_eq!(values, vec![200, 100, 300]);
}

#[test]
fn test_iter_entries() {
    let mut array: SparseArrayUsize<u32> = SparseArrayUsize::new();

    assert_eq!(array.iter_entries().next(), None);

    array.set(9, 100);
    array.set(0, 200);
    array.set(63, 300);

    assert_eq!(array.iter_entries().size_hint(), (3, Some(3)));

    let entries: Vec<(usize, u32)> = array.iter_entries().map(|(i, v)| (i, *v)).collect();

    assert_eq!(entries, vec![(0, 200), (9, 100), (63, 300)]);
}

#[test]
fn test_clone() {
    let mut array: SparseArrayUsize<char> = SparseArrayUsize::new();

    array.set(2, 'a');
    array.set(60, 'b');

    let clone = array.clone();

    assert_eq!(clone, array);
    assert_eq!(clone.get(2), Some(&'a'));
    assert_eq!(clone.get(60), Some(&'b'));
}
