/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Property-based generators for coordinate buffers and kernel
//! regions.
//!
//! The generators keep coordinates inside a small box so that random
//! point clouds are dense enough for kernel maps to contain hits, and
//! batch indices small so that several points share a batch.
//!
//! This module is only included in test builds (`#[cfg(test)]`).

use proptest::prelude::*;

use crate::coordinate::Coord;
use crate::modes::RegionType;
use crate::region::KernelRegion;

/// A flat `N x (D + 1)` coordinate buffer with `N < max_rows`,
/// batches in `0..batches` and spatial components in
/// `-extent..extent`. Duplicates are likely and intended.
pub fn gen_coordinates(
    dimension: usize,
    max_rows: usize,
    batches: Coord,
    extent: Coord,
) -> BoxedStrategy<Vec<Coord>> {
    let row = (0..batches, prop::collection::vec(-extent..extent, dimension)).prop_map(
        |(batch, spatial)| {
            let mut row = Vec::with_capacity(spatial.len() + 1);
            row.push(batch);
            row.extend(spatial);
            row
        },
    );
    prop::collection::vec(row, 0..max_rows)
        .prop_map(|rows| rows.concat())
        .boxed()
}

/// A per-axis tensor stride multiplier in `1..=max`.
pub fn gen_multiplier(dimension: usize, max: u32) -> BoxedStrategy<Vec<u32>> {
    prop::collection::vec(1..=max, dimension).boxed()
}

/// A unit-stride hypercube or hypercross region.
pub fn gen_region(dimension: usize) -> BoxedStrategy<KernelRegion> {
    let cube = (
        prop::collection::vec(1u32..=4, dimension),
        prop::collection::vec(1u32..=2, dimension),
    )
        .prop_map(move |(size, dilation)| {
            KernelRegion::hypercube(size, vec![1; dimension], dilation).unwrap()
        });
    let cross = prop::collection::vec(prop::sample::select(vec![1u32, 3, 5]), dimension).prop_map(
        move |size| {
            KernelRegion::new(
                size,
                vec![1; dimension],
                vec![1; dimension],
                RegionType::HyperCross,
                vec![],
            )
            .unwrap()
        },
    );
    prop_oneof![3 => cube, 1 => cross].boxed()
}

mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::CoordinateMapManager;
    use crate::config::Config;
    use crate::kernel_map;
    use crate::map::CoordinateMap;
    use crate::modes::Algorithm;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128, ..ProptestConfig::default()
        })]

        #[test]
        fn insertion_mapping_is_consistent(coordinates in gen_coordinates(2, 64, 3, 4)) {
            let mut map = CoordinateMap::new(3, vec![1, 1]).unwrap();
            let result = map.insert(&coordinates).unwrap();
            let distinct: HashSet<&[Coord]> = coordinates.chunks(3).collect();
            prop_assert_eq!(map.len(), distinct.len());
            prop_assert_eq!(result.mapping.len(), map.len());
            for (position, chunk) in coordinates.chunks(3).enumerate() {
                let row = result.inverse_mapping[position];
                prop_assert_eq!(map.get(row).unwrap().as_slice(), chunk);
            }
            for (row, &position) in result.mapping.iter().enumerate() {
                prop_assert_eq!(result.inverse_mapping[position], row);
            }

            // Re-insertion creates nothing and returns the same rows.
            let again = map.insert(&coordinates).unwrap();
            prop_assert!(again.mapping.is_empty());
            prop_assert_eq!(again.inverse_mapping, result.inverse_mapping);
        }

        #[test]
        fn kernel_map_triples_round_trip(
            coordinates in gen_coordinates(2, 48, 2, 5),
            region in gen_region(2),
        ) {
            let map = CoordinateMap::from_coordinates(&coordinates, 3, vec![1, 1]).unwrap();
            let offsets = region.offsets(&[1, 1]).unwrap();
            let generated = kernel_map::generate(
                &map, &map, offsets.restart(), Algorithm::MemoryEfficient, usize::MAX,
            ).unwrap();
            for (in_row, out_row, k) in generated.triples() {
                let offset = offsets.offset_at(k).unwrap();
                let shifted = map.get(out_row).unwrap().shifted(&offset);
                prop_assert_eq!(shifted.as_ref(), map.get(in_row));
            }
            // Every row sees itself through the zero offset.
            prop_assert!(generated.len() >= map.len());
        }

        #[test]
        fn scan_algorithms_agree(
            coordinates in gen_coordinates(3, 48, 2, 3),
            region in gen_region(3),
        ) {
            let map = CoordinateMap::from_coordinates(&coordinates, 4, vec![1, 1, 1]).unwrap();
            let offsets = region.offsets(&[1, 1, 1]).unwrap();
            let slow = kernel_map::generate(
                &map, &map, offsets.restart(), Algorithm::MemoryEfficient, 0,
            ).unwrap();
            let fast = kernel_map::generate(
                &map, &map, offsets.restart(), Algorithm::SpeedOptimized, 0,
            ).unwrap();
            prop_assert_eq!(slow, fast);
        }

        #[test]
        fn stride_snaps_onto_lattice(
            coordinates in gen_coordinates(2, 64, 2, 9),
            multiplier in gen_multiplier(2, 4),
        ) {
            let map = CoordinateMap::from_coordinates(&coordinates, 3, vec![1, 1]).unwrap();
            let strided = map.stride(&multiplier).unwrap();
            prop_assert_eq!(strided.tensor_stride(), multiplier.as_slice());
            prop_assert!(strided.len() <= map.len());
            for (_, key) in strided.iter() {
                for (value, &s) in key.spatial().iter().zip(&multiplier) {
                    prop_assert_eq!(value.rem_euclid(s as Coord), 0);
                }
            }
            for (_, key) in map.iter() {
                let snapped = key.floor_to_lattice(&multiplier).unwrap();
                prop_assert!(strided.find(&snapped).is_some());
            }
        }

        #[test]
        fn managers_are_deterministic(
            coordinates in gen_coordinates(2, 48, 3, 6),
            multiplier in gen_multiplier(2, 3),
        ) {
            let run = |algorithm| {
                let config = Config {
                    algorithm: Some(algorithm),
                    ..Config::default()
                };
                let mut manager = CoordinateMapManager::with_config(3, config).unwrap();
                let key = manager.initialize(&coordinates, vec![1, 1], "").unwrap();
                let strided = manager.stride(&key, &multiplier).unwrap();
                let region = KernelRegion::hypercube(
                    multiplier.clone(), multiplier.clone(), vec![1, 1],
                ).unwrap();
                let kernel_map = manager.kernel_map(&key, &strided, &region, false).unwrap();
                let transposed = manager.kernel_map(&strided, &key, &region, true).unwrap();
                (
                    manager.get_coordinates(&strided).unwrap(),
                    (*kernel_map).clone(),
                    (*transposed).clone(),
                )
            };
            let (coords_a, forward_a, transposed_a) = run(Algorithm::MemoryEfficient);
            let (coords_b, forward_b, transposed_b) = run(Algorithm::SpeedOptimized);
            prop_assert_eq!(coords_a, coords_b);
            prop_assert_eq!(&forward_a, &forward_b);
            prop_assert_eq!(&transposed_a, &transposed_b);
            prop_assert_eq!(forward_a.transposed(), transposed_a);
        }
    }
}
