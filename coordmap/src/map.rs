/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Coordinate maps.
//!
//! A [`CoordinateMap`] assigns a dense row index `0..N` to every
//! distinct coordinate inserted into it, in order of first
//! insertion. Rows are stable: a coordinate keeps its row for the
//! lifetime of the map and nothing is ever removed. One map is one
//! tensor-stride level of a sparse tensor; derived levels (strided,
//! origin, union, pruned, region-expanded) are built as new maps by
//! the methods at the bottom of this module.

use std::collections::TryReserveError;
use std::fmt;
use std::iter::FusedIterator;

use ahash::AHashMap;
use itertools::Itertools;

use crate::coordinate::Coord;
use crate::coordinate::CoordinateKey;
use crate::error::CoordinateMapError;
use crate::region::KernelRegion;

/// Number of rows rendered by the `Display` impl before eliding.
const DISPLAY_ROWS: usize = 8;

/// Result of a bulk insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertionMapping {
    /// For each row created by the insertion, in row order, the input
    /// position of the coordinate that created it.
    pub mapping: Vec<usize>,
    /// For each input position, the row of its coordinate.
    pub inverse_mapping: Vec<usize>,
}

/// Key to row map over fixed-arity coordinates.
#[derive(Clone)]
pub struct CoordinateMap {
    coordinate_size: usize,
    tensor_stride: Vec<u32>,
    rows: AHashMap<CoordinateKey, usize>,
    keys: Vec<CoordinateKey>,
}

impl CoordinateMap {
    /// An empty map for coordinates of `coordinate_size = D + 1`
    /// components on a lattice of the given tensor stride.
    pub fn new(
        coordinate_size: usize,
        tensor_stride: Vec<u32>,
    ) -> Result<Self, CoordinateMapError> {
        if coordinate_size < 2 || tensor_stride.len() != coordinate_size - 1 {
            return Err(CoordinateMapError::InvalidDims {
                expected: coordinate_size.saturating_sub(1).max(1),
                got: tensor_stride.len(),
            });
        }
        Ok(Self {
            coordinate_size,
            tensor_stride,
            rows: AHashMap::new(),
            keys: Vec::new(),
        })
    }

    /// A map populated from a flat `N x (D + 1)` coordinate buffer.
    pub fn from_coordinates(
        coordinates: &[Coord],
        coordinate_size: usize,
        tensor_stride: Vec<u32>,
    ) -> Result<Self, CoordinateMapError> {
        let mut map = Self::new(coordinate_size, tensor_stride)?;
        map.insert(coordinates)?;
        Ok(map)
    }

    /// Number of components per coordinate, `D + 1`.
    #[inline]
    pub fn coordinate_size(&self) -> usize {
        self.coordinate_size
    }

    /// Spatial dimension `D`.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.coordinate_size - 1
    }

    #[inline]
    pub fn tensor_stride(&self) -> &[u32] {
        &self.tensor_stride
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Row of `key`, if present.
    #[inline]
    pub fn find(&self, key: &[Coord]) -> Option<usize> {
        self.rows.get(key).copied()
    }

    /// Coordinate stored at `row`.
    #[inline]
    pub fn get(&self, row: usize) -> Option<&CoordinateKey> {
        self.keys.get(row)
    }

    /// `(row, coordinate)` pairs in row order. Each call starts from
    /// the first row.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.keys.iter().enumerate(),
        }
    }

    /// Flat `N x (D + 1)` copy of every coordinate in row order.
    pub fn coordinates(&self) -> Vec<Coord> {
        let mut flat = Vec::with_capacity(self.len() * self.coordinate_size);
        for key in &self.keys {
            flat.extend_from_slice(key);
        }
        flat
    }

    /// Inserts a single coordinate, returning its row and whether it
    /// was newly created.
    pub fn insert_key(&mut self, key: CoordinateKey) -> Result<(usize, bool), CoordinateMapError> {
        self.check_arity(key.len())?;
        if let Some(&row) = self.rows.get(&key) {
            return Ok((row, false));
        }
        self.reserve(1)?;
        Ok((self.push_unchecked(key), true))
    }

    /// Bulk insertion of a flat `N x (D + 1)` buffer. Duplicates,
    /// within the batch or against existing rows, resolve to the row
    /// already assigned. Storage is reserved before the first
    /// insertion, so a failure leaves the map unchanged.
    pub fn insert(
        &mut self,
        coordinates: &[Coord],
    ) -> Result<InsertionMapping, CoordinateMapError> {
        if coordinates.len() % self.coordinate_size != 0 {
            return Err(CoordinateMapError::InvalidDims {
                expected: self.coordinate_size,
                got: coordinates.len() % self.coordinate_size,
            });
        }
        let count = coordinates.len() / self.coordinate_size;
        self.reserve(count)?;

        let mut mapping = Vec::new();
        let mut inverse_mapping = Vec::with_capacity(count);
        for (position, chunk) in coordinates.chunks_exact(self.coordinate_size).enumerate() {
            let row = match self.rows.get(chunk) {
                Some(&row) => row,
                None => {
                    mapping.push(position);
                    self.push_unchecked(CoordinateKey::from_parts(chunk[0], &chunk[1..]))
                }
            };
            inverse_mapping.push(row);
        }
        Ok(InsertionMapping {
            mapping,
            inverse_mapping,
        })
    }

    fn check_arity(&self, got: usize) -> Result<(), CoordinateMapError> {
        if got != self.coordinate_size {
            return Err(CoordinateMapError::InvalidDims {
                expected: self.coordinate_size,
                got,
            });
        }
        Ok(())
    }

    fn reserve(&mut self, additional: usize) -> Result<(), CoordinateMapError> {
        let failed = |_: TryReserveError| CoordinateMapError::Allocation {
            requested: additional,
        };
        self.keys.try_reserve(additional).map_err(failed)?;
        self.rows.try_reserve(additional).map_err(failed)?;
        Ok(())
    }

    fn push_unchecked(&mut self, key: CoordinateKey) -> usize {
        let row = self.keys.len();
        self.rows.insert(key.clone(), row);
        self.keys.push(key);
        row
    }

    /// Builds the map one tensor-stride level up: the output stride is
    /// `tensor_stride * multiplier` and every coordinate is snapped
    /// onto the output lattice, duplicates merged in row order.
    pub fn stride(&self, multiplier: &[u32]) -> Result<CoordinateMap, CoordinateMapError> {
        if multiplier.len() != self.dimension() {
            return Err(CoordinateMapError::InvalidDims {
                expected: self.dimension(),
                got: multiplier.len(),
            });
        }
        let out_stride = self
            .tensor_stride
            .iter()
            .zip(multiplier)
            .map(|(&s, &m)| s.checked_mul(m))
            .collect::<Option<Vec<u32>>>()
            .filter(|stride| !stride.contains(&0))
            .ok_or_else(|| CoordinateMapError::InvalidStride {
                stride: multiplier.to_vec(),
                reason: format!(
                    "cannot scale tensor stride [{}]",
                    self.tensor_stride.iter().join(", ")
                ),
            })?;

        let mut out = CoordinateMap::new(self.coordinate_size, out_stride)?;
        out.reserve(self.len())?;
        for key in &self.keys {
            let snapped = key.floor_to_lattice(&out.tensor_stride).ok_or_else(|| {
                CoordinateMapError::InvalidStride {
                    stride: out.tensor_stride.clone(),
                    reason: format!("{} has no representable lattice point", key),
                }
            })?;
            if !out.rows.contains_key(&snapped) {
                out.push_unchecked(snapped);
            }
        }
        Ok(out)
    }

    /// The origin map: one row per distinct batch index, in ascending
    /// batch order, with every spatial component zero. Its tensor
    /// stride is all zeros.
    pub fn origin(&self) -> CoordinateMap {
        let batches = self.keys.iter().map(CoordinateKey::batch).unique().sorted();
        let spatial = vec![0; self.dimension()];
        let mut out = CoordinateMap {
            coordinate_size: self.coordinate_size,
            tensor_stride: vec![0; self.dimension()],
            rows: AHashMap::new(),
            keys: Vec::new(),
        };
        for batch in batches {
            out.push_unchecked(CoordinateKey::from_parts(batch, &spatial));
        }
        out
    }

    /// The rows selected by `keep`, in row order. Also returns the
    /// input row of every output row.
    pub fn prune(&self, keep: &[bool]) -> Result<(CoordinateMap, Vec<usize>), CoordinateMapError> {
        if keep.len() != self.len() {
            return Err(CoordinateMapError::MaskLength {
                expected: self.len(),
                got: keep.len(),
            });
        }
        let mut out = CoordinateMap::new(self.coordinate_size, self.tensor_stride.clone())?;
        let kept: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter_map(|(row, &k)| k.then_some(row))
            .collect();
        out.reserve(kept.len())?;
        for &row in &kept {
            out.push_unchecked(self.keys[row].clone());
        }
        Ok((out, kept))
    }

    /// The union of `maps`, which must share coordinate size and
    /// tensor stride. Coordinates appear in the order they are first
    /// seen walking the inputs in order. The second component maps
    /// every row of every input onto its union row.
    pub fn union(
        maps: &[&CoordinateMap],
    ) -> Result<(CoordinateMap, Vec<Vec<usize>>), CoordinateMapError> {
        let Some(first) = maps.first() else {
            return Err(CoordinateMapError::InvalidDims {
                expected: 1,
                got: 0,
            });
        };
        for map in &maps[1..] {
            first.check_arity(map.coordinate_size)?;
            if map.tensor_stride != first.tensor_stride {
                return Err(CoordinateMapError::StrideMismatch {
                    expected: first.tensor_stride.clone(),
                    got: map.tensor_stride.clone(),
                });
            }
        }

        let mut out = CoordinateMap::new(first.coordinate_size, first.tensor_stride.clone())?;
        out.reserve(maps.iter().map(|m| m.len()).max().unwrap_or(0))?;
        let mut row_maps = Vec::with_capacity(maps.len());
        for map in maps {
            let mut rows = Vec::with_capacity(map.len());
            for key in &map.keys {
                let (row, _) = out.insert_key(key.clone())?;
                rows.push(row);
            }
            row_maps.push(rows);
        }
        Ok((out, row_maps))
    }

    /// Region expansion: every coordinate shifted by every offset of
    /// `region` on the `out_stride` lattice, in row-major then offset
    /// order. Used to generate the output coordinates of a transposed
    /// convolution.
    pub fn expand(
        &self,
        region: &KernelRegion,
        out_stride: Vec<u32>,
    ) -> Result<CoordinateMap, CoordinateMapError> {
        let offsets = region.offsets(&out_stride)?;
        let mut out = CoordinateMap::new(self.coordinate_size, out_stride.clone())?;
        out.reserve(self.len().saturating_mul(offsets.len()))?;
        for key in &self.keys {
            for offset in offsets.restart() {
                if let Some(shifted) = key.shifted(&offset) {
                    if !out.rows.contains_key(&shifted) {
                        out.push_unchecked(shifted);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for CoordinateMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinateMap")
            .field("coordinate_size", &self.coordinate_size)
            .field("tensor_stride", &self.tensor_stride)
            .field("len", &self.len())
            .finish()
    }
}

impl fmt::Display for CoordinateMap {
    /// Renders a summary line and the leading rows. The alternate form
    /// (`{:#}`) renders every row.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "CoordinateMap(size={}, tensor_stride=[{}])",
            self.len(),
            self.tensor_stride.iter().join(", ")
        )?;
        let limit = if f.alternate() { self.len() } else { DISPLAY_ROWS };
        for (row, key) in self.iter().take(limit) {
            writeln!(f, "  {}: {}", row, key)?;
        }
        if self.len() > limit {
            writeln!(f, "  ... {} more", self.len() - limit)?;
        }
        Ok(())
    }
}

/// Iterator over `(row, coordinate)` pairs of a [`CoordinateMap`].
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    inner: std::iter::Enumerate<std::slice::Iter<'a, CoordinateKey>>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (usize, &'a CoordinateKey);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Iter<'_> {}

impl FusedIterator for Iter<'_> {}

impl<'a> IntoIterator for &'a CoordinateMap {
    type Item = (usize, &'a CoordinateKey);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_1d(values: &[Coord]) -> CoordinateMap {
        let coordinates: Vec<Coord> = values.iter().flat_map(|&x| [0, x]).collect();
        CoordinateMap::from_coordinates(&coordinates, 2, vec![1]).unwrap()
    }

    #[test]
    fn test_insert_dedups_and_orders_rows() {
        let mut map = CoordinateMap::new(3, vec![1, 1]).unwrap();
        let result = map
            .insert(&[0, 1, 1, 0, 2, 2, 0, 1, 1, 1, 1, 1])
            .unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(result.mapping, vec![0, 1, 3]);
        assert_eq!(result.inverse_mapping, vec![0, 1, 0, 2]);
        assert_eq!(map.find(&[0, 2, 2]), Some(1));
        assert_eq!(map.find(&[1, 1, 1]), Some(2));
        assert_eq!(map.find(&[2, 1, 1]), None);
        assert_eq!(map.get(0).unwrap().as_slice(), &[0, 1, 1]);
    }

    #[test]
    fn test_reinsert_is_stable() {
        let mut map = map_1d(&[5, 3, 9]);
        let again = map.insert(&[0, 9, 0, 5, 0, 3]).unwrap();
        assert!(again.mapping.is_empty());
        assert_eq!(again.inverse_mapping, vec![2, 0, 1]);
        assert_eq!(map.len(), 3);

        // Streaming insertion appends after existing rows.
        let more = map.insert(&[0, 4, 0, 3]).unwrap();
        assert_eq!(more.mapping, vec![0]);
        assert_eq!(more.inverse_mapping, vec![3, 1]);
    }

    #[test]
    fn test_arity_mismatch() {
        let mut map = CoordinateMap::new(3, vec![1, 1]).unwrap();
        assert_eq!(
            map.insert(&[0, 1, 2, 3]),
            Err(CoordinateMapError::InvalidDims {
                expected: 3,
                got: 1
            })
        );
        assert!(map.is_empty());
        assert!(map
            .insert_key(CoordinateKey::new(&[0, 1]).unwrap())
            .is_err());
        assert!(CoordinateMap::new(3, vec![1]).is_err());
        assert!(CoordinateMap::new(1, vec![]).is_err());
    }

    #[test]
    fn test_empty_map() {
        let map = CoordinateMap::from_coordinates(&[], 4, vec![1, 1, 1]).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
        assert!(map.coordinates().is_empty());
        assert!(map.stride(&[2, 2, 2]).unwrap().is_empty());
        assert!(map.origin().is_empty());
    }

    #[test]
    fn test_iter_restartable() {
        let map = map_1d(&[7, 8, 9]);
        let first: Vec<_> = map.iter().map(|(row, key)| (row, key.clone())).collect();
        let second: Vec<_> = (&map).into_iter().map(|(row, key)| (row, key.clone())).collect();
        assert_eq!(first, second);
        assert_eq!(map.iter().len(), 3);
        assert_eq!(map.coordinates(), vec![0, 7, 0, 8, 0, 9]);
    }

    #[test]
    fn test_stride_merges_pairs() {
        let map = map_1d(&[0, 1, 2, 3]);
        let strided = map.stride(&[2]).unwrap();
        assert_eq!(strided.tensor_stride(), &[2]);
        assert_eq!(strided.len(), 2);
        assert_eq!(strided.coordinates(), vec![0, 0, 0, 2]);
    }

    #[test]
    fn test_stride_negative_coordinates() {
        let map = map_1d(&[-3, -2, -1, 1]);
        let strided = map.stride(&[2]).unwrap();
        assert_eq!(strided.coordinates(), vec![0, -4, 0, -2, 0, 0]);
    }

    #[test]
    fn test_stride_composes() {
        let map = map_1d(&[0, 1, 2, 3, 4, 5, 6, 7, 9]);
        let twice = map.stride(&[2]).unwrap().stride(&[2]).unwrap();
        let once = map.stride(&[4]).unwrap();
        assert_eq!(twice.tensor_stride(), once.tensor_stride());
        assert_eq!(twice.coordinates(), once.coordinates());
    }

    #[test]
    fn test_stride_invalid() {
        let map = map_1d(&[0]);
        assert!(map.stride(&[0]).is_err());
        assert!(map.stride(&[2, 2]).is_err());
        let wide = CoordinateMap::new(2, vec![u32::MAX]).unwrap();
        assert!(wide.stride(&[2]).is_err());
    }

    #[test]
    fn test_origin() {
        let map = CoordinateMap::from_coordinates(
            &[2, 1, 1, 0, 4, 4, 2, 3, 3, 1, 0, 0],
            3,
            vec![1, 1],
        )
        .unwrap();
        let origin = map.origin();
        assert_eq!(origin.tensor_stride(), &[0, 0]);
        assert_eq!(origin.coordinates(), vec![0, 0, 0, 1, 0, 0, 2, 0, 0]);
    }

    #[test]
    fn test_prune() {
        let map = map_1d(&[10, 20, 30, 40]);
        let (pruned, kept) = map.prune(&[true, false, false, true]).unwrap();
        assert_eq!(kept, vec![0, 3]);
        assert_eq!(pruned.coordinates(), vec![0, 10, 0, 40]);
        assert_eq!(
            map.prune(&[true]).unwrap_err(),
            CoordinateMapError::MaskLength {
                expected: 4,
                got: 1
            }
        );
    }

    #[test]
    fn test_union() {
        let a = map_1d(&[1, 2, 3]);
        let b = map_1d(&[3, 4]);
        let (union, rows) = CoordinateMap::union(&[&a, &b]).unwrap();
        assert_eq!(union.coordinates(), vec![0, 1, 0, 2, 0, 3, 0, 4]);
        assert_eq!(rows, vec![vec![0, 1, 2], vec![2, 3]]);

        let coarse = a.stride(&[2]).unwrap();
        assert!(matches!(
            CoordinateMap::union(&[&a, &coarse]),
            Err(CoordinateMapError::StrideMismatch { .. })
        ));
        assert!(CoordinateMap::union(&[]).is_err());
    }

    #[test]
    fn test_expand() {
        let coarse = CoordinateMap::from_coordinates(&[0, 0, 0, 4], 2, vec![4]).unwrap();
        let region = KernelRegion::cubic(1, 2, 2, 1).unwrap();
        let fine = coarse.expand(&region, vec![2]).unwrap();
        assert_eq!(fine.tensor_stride(), &[2]);
        assert_eq!(fine.coordinates(), vec![0, 0, 0, 2, 0, 4, 0, 6]);
    }

    #[test]
    fn test_display() {
        let map = map_1d(&[1, 2]);
        assert_eq!(
            map.to_string(),
            "CoordinateMap(size=2, tensor_stride=[1])\n  0: (0, 1)\n  1: (0, 2)\n"
        );
        let long = map_1d(&(0..10).collect::<Vec<_>>());
        assert!(long.to_string().ends_with("  ... 2 more\n"));
        assert!(!format!("{:#}", long).contains("more"));
    }
}
