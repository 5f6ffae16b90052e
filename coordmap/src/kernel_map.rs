/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Kernel maps and their generation.
//!
//! A kernel map lists, for every offset of a kernel region, which
//! input rows feed which output rows. It is stored grouped by offset
//! index as parallel `in_rows` / `out_rows` arrays, the layout the
//! numeric convolution and pooling kernels consume directly.
//!
//! Generation scans the output map: for every output coordinate and
//! every offset, the candidate input coordinate is the output
//! coordinate moved by the offset along the spatial axes. A hit in
//! the input map emits `(in_row, out_row, offset_index)`. Misses,
//! including offsets that would overflow a coordinate, are skipped.

use rayon::prelude::*;
use serde::Serialize;
use smallvec::SmallVec;

use crate::coordinate::Coord;
use crate::coordinate::Offset;
use crate::error::CoordinateMapError;
use crate::map::CoordinateMap;
use crate::modes::Algorithm;
use crate::region::RegionIter;

/// Input/output row pairs grouped by offset index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KernelMap {
    in_maps: Vec<Vec<usize>>,
    out_maps: Vec<Vec<usize>>,
}

impl KernelMap {
    /// An empty kernel map with `volume` offset groups.
    pub fn new(volume: usize) -> Self {
        Self {
            in_maps: vec![Vec::new(); volume],
            out_maps: vec![Vec::new(); volume],
        }
    }

    /// Number of offset groups.
    pub fn volume(&self) -> usize {
        self.in_maps.len()
    }

    /// Total number of pairs across all groups.
    pub fn len(&self) -> usize {
        self.in_maps.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.in_maps.iter().all(Vec::is_empty)
    }

    /// The `(in_rows, out_rows)` of offset group `k`.
    pub fn get(&self, k: usize) -> Option<(&[usize], &[usize])> {
        Some((self.in_maps.get(k)?.as_slice(), self.out_maps.get(k)?.as_slice()))
    }

    pub fn in_maps(&self) -> &[Vec<usize>] {
        &self.in_maps
    }

    pub fn out_maps(&self) -> &[Vec<usize>] {
        &self.out_maps
    }

    /// `(offset_index, in_rows, out_rows)` for every group, including
    /// empty ones.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (usize, &[usize], &[usize])> + '_ {
        self.in_maps
            .iter()
            .zip(&self.out_maps)
            .enumerate()
            .map(|(k, (ins, outs))| (k, ins.as_slice(), outs.as_slice()))
    }

    /// Every pair as an `(in_row, out_row, offset_index)` triple, group
    /// by group.
    pub fn triples(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.iter()
            .flat_map(|(k, ins, outs)| ins.iter().zip(outs).map(move |(&i, &o)| (i, o, k)))
    }

    /// This map with the input and output sides exchanged.
    pub fn transposed(self) -> Self {
        Self {
            in_maps: self.out_maps,
            out_maps: self.in_maps,
        }
    }

    fn push(&mut self, k: usize, in_row: usize, out_row: usize) {
        self.in_maps[k].push(in_row);
        self.out_maps[k].push(out_row);
    }
}

/// Hits found for one output row: `(offset_index, in_row)`.
type RowHits = SmallVec<[(usize, usize); 8]>;

/// Generates the kernel map between `input` and `output` over the
/// given offsets. `Algorithm::Default` selects the parallel scan once
/// `output` has at least `parallel_threshold` rows. Both scans produce
/// the same grouping, with pairs inside a group in output row order.
pub fn generate(
    input: &CoordinateMap,
    output: &CoordinateMap,
    offsets: RegionIter<'_>,
    algorithm: Algorithm,
    parallel_threshold: usize,
) -> Result<KernelMap, CoordinateMapError> {
    if input.coordinate_size() != output.coordinate_size() {
        return Err(CoordinateMapError::InvalidDims {
            expected: input.coordinate_size(),
            got: output.coordinate_size(),
        });
    }
    let volume = offsets.volume();
    let mut offset_table: Vec<Offset> = Vec::new();
    offset_table
        .try_reserve_exact(volume)
        .map_err(|_| CoordinateMapError::Allocation { requested: volume })?;
    offset_table.extend(offsets.restart());

    let algorithm = match algorithm {
        Algorithm::Default if output.len() >= parallel_threshold => Algorithm::SpeedOptimized,
        Algorithm::Default => Algorithm::MemoryEfficient,
        explicit => explicit,
    };
    tracing::trace!(
        %algorithm,
        volume,
        in_rows = input.len(),
        out_rows = output.len(),
        "scanning kernel map"
    );

    let kernel_map = match algorithm {
        Algorithm::SpeedOptimized => scan_rows_parallel(input, output, &offset_table),
        _ => scan_offsets(input, output, &offset_table),
    };
    tracing::trace!(pairs = kernel_map.len(), "kernel map scan complete");
    Ok(kernel_map)
}

fn scan_offsets(input: &CoordinateMap, output: &CoordinateMap, offsets: &[Offset]) -> KernelMap {
    let mut kernel_map = KernelMap::new(offsets.len());
    for (k, offset) in offsets.iter().enumerate() {
        for (out_row, key) in output.iter() {
            if let Some(in_row) = key.shifted(offset).and_then(|c| input.find(&c)) {
                kernel_map.push(k, in_row, out_row);
            }
        }
    }
    kernel_map
}

fn scan_rows_parallel(
    input: &CoordinateMap,
    output: &CoordinateMap,
    offsets: &[Offset],
) -> KernelMap {
    let hits: Vec<RowHits> = (0..output.len())
        .into_par_iter()
        .map(|out_row| {
            let mut row_hits = RowHits::new();
            if let Some(key) = output.get(out_row) {
                for (k, offset) in offsets.iter().enumerate() {
                    if let Some(in_row) = key.shifted(offset).and_then(|c| input.find(&c)) {
                        row_hits.push((k, in_row));
                    }
                }
            }
            row_hits
        })
        .collect();

    let mut kernel_map = KernelMap::new(offsets.len());
    for (out_row, row_hits) in hits.into_iter().enumerate() {
        for (k, in_row) in row_hits {
            kernel_map.push(k, in_row, out_row);
        }
    }
    kernel_map
}

/// The kernel map from a map to its origin map, plus per origin row
/// bookkeeping used by global pooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OriginMap {
    /// Single-group kernel map pairing every input row with the origin
    /// row of its batch.
    pub kernel_map: KernelMap,
    /// Batch index of every origin row.
    pub batch_indices: Vec<Coord>,
    /// Number of input rows reduced into every origin row.
    pub counts: Vec<usize>,
}

impl OriginMap {
    pub fn len(&self) -> usize {
        self.batch_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch_indices.is_empty()
    }
}

/// Pairs every row of `input` with the row of its batch in `origin`.
pub fn generate_origin(
    input: &CoordinateMap,
    origin: &CoordinateMap,
) -> Result<OriginMap, CoordinateMapError> {
    let mut kernel_map = KernelMap::new(1);
    let mut counts = vec![0; origin.len()];
    let spatial = vec![0; input.dimension()];
    let mut probe: Vec<Coord> = Vec::with_capacity(input.coordinate_size());
    for (in_row, key) in input.iter() {
        probe.clear();
        probe.push(key.batch());
        probe.extend_from_slice(&spatial);
        let out_row = origin
            .find(&probe)
            .ok_or(CoordinateMapError::MissingBatch(key.batch()))?;
        kernel_map.push(0, in_row, out_row);
        counts[out_row] += 1;
    }
    let batch_indices = origin.iter().map(|(_, key)| key.batch()).collect();
    Ok(OriginMap {
        kernel_map,
        batch_indices,
        counts,
    })
}
