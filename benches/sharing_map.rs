/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

#![cfg_attr(feature = "fatal-warnings", deny(warnings))]

#[macro_use]
extern crate bencher;

use bencher::{black_box, Bencher};
use sharing_map::{DeltaView, SharingMap};

/// Shrinks the workload when `QUICK_BENCH` is set, so that CI can check that the benchmarks run
/// without paying their full cost.
fn scaled(n: usize) -> usize {
    if std::env::var_os("QUICK_BENCH").is_some_and(|v| v == "true") { 2 } else { n }
}

fn populated_map(size: usize) -> SharingMap<usize, isize> {
    let mut map = SharingMap::new();

    for i in 0..size {
        map.insert_mut(i, -(i as isize));
    }

    map
}

fn sharing_map_insert(bench: &mut Bencher) {
    let limit = scaled(10_000);

    // The built maps are kept alive so that their drop cost stays out of the measurement; they
    // are freed when the benchmark function returns.
    let mut keep_alive: Vec<SharingMap<usize, isize>> = Vec::with_capacity(1 << 20);

    bench.iter(|| {
        keep_alive.push(populated_map(limit));
    });
}

fn sharing_map_remove(bench: &mut Bencher) {
    let limit = scaled(10_000);
    let full_map = populated_map(limit);

    // Each iteration unshares the clone node by node and ends with an empty map, so there is no
    // deferred drop cost to keep out of the loop.
    bench.iter(|| {
        let mut map = full_map.clone();

        for i in 0..limit {
            map.remove_mut(&i);
        }

        map
    });
}

fn sharing_map_get(bench: &mut Bencher) {
    let limit = scaled(10_000);
    let map = populated_map(limit);

    bench.iter(|| {
        for i in 0..limit {
            black_box(map.get(&i));
        }
    });
}

fn sharing_map_iterate(bench: &mut Bencher) {
    let limit = scaled(10_000);
    let map = populated_map(limit);

    bench.iter(|| {
        let mut sum: isize = 0;

        map.iterate(|_, v| sum += *v);

        black_box(sum)
    });
}

fn sharing_map_delta_view_after_one_replace(bench: &mut Bencher) {
    let limit = scaled(10_000);
    let map = populated_map(limit);
    let mut fork = map.clone();

    fork.replace_mut(&(limit / 2), 1);

    bench.iter(|| {
        let mut delta: DeltaView<'_, usize, isize> = DeltaView::new();

        fork.get_delta_view(&map, &mut delta, true);

        black_box(delta.len())
    });
}

benchmark_group!(
    benches,
    sharing_map_insert,
    sharing_map_remove,
    sharing_map_get,
    sharing_map_iterate,
    sharing_map_delta_view_after_one_replace
);
benchmark_main!(benches);
