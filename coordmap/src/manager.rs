/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The coordinate map manager.
//!
//! A [`CoordinateMapManager`] owns every coordinate map of one sparse
//! network, keyed by [`StrideKey`], together with the kernel maps and
//! origin maps computed between them. Derived maps (strided, origin,
//! union, pruned, region-expanded) are registered in the same registry
//! so that repeated requests resolve to the same map, and kernel maps
//! are cached by `(input, output, region, transpose)`.
//!
//! Callers never hold maps directly. They hold [`CoordinateMapKey`]
//! handles, which operations bind as a side effect of creating or
//! resolving a map.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use itertools::Itertools;
use serde::Serialize;

use crate::config;
use crate::config::Config;
use crate::coordinate::Coord;
use crate::coordinate::CoordinateKey;
use crate::error::CoordinateMapError;
use crate::kernel_map;
use crate::kernel_map::KernelMap;
use crate::kernel_map::OriginMap;
use crate::key::CoordinateMapKey;
use crate::key::StrideKey;
use crate::key::validate_stride;
use crate::map::CoordinateMap;
use crate::map::InsertionMapping;
use crate::modes::CoordinateMapBackend;
use crate::modes::PoolingMode;
use crate::region::KernelRegion;

/// Cache key of a kernel map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct KernelMapKey {
    in_key: StrideKey,
    out_key: StrideKey,
    region: KernelRegion,
    transpose: bool,
}

impl KernelMapKey {
    fn references(&self, key: &StrideKey) -> bool {
        self.in_key == *key || self.out_key == *key
    }
}

/// Counters of the work a manager has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Coordinate maps built and registered.
    pub maps_created: usize,
    /// Derivation requests answered by an already registered map.
    pub stride_cache_hits: usize,
    /// Kernel maps computed by scanning.
    pub kernel_map_scans: usize,
    /// Kernel map requests answered from the cache.
    pub kernel_map_cache_hits: usize,
}

/// The map driving a pooling kernel.
#[derive(Debug, Clone)]
pub enum PoolingMap {
    /// Local pooling reduces over a kernel region.
    Local(Arc<KernelMap>),
    /// Global pooling reduces every batch onto its origin row.
    Global(Arc<OriginMap>),
}

/// Registry of coordinate maps and the kernel maps between them.
pub struct CoordinateMapManager {
    coordinate_size: usize,
    config: Config,
    pool: Option<rayon::ThreadPool>,
    maps: BTreeMap<StrideKey, CoordinateMap>,
    kernel_maps: AHashMap<KernelMapKey, Arc<KernelMap>>,
    origin_maps: AHashMap<StrideKey, Arc<OriginMap>>,
    stats: ManagerStats,
    prune_count: usize,
}

impl CoordinateMapManager {
    /// A manager for coordinates of `coordinate_size = D + 1`
    /// components, configured from [`config::global`].
    pub fn new(coordinate_size: usize) -> Result<Self, CoordinateMapError> {
        Self::with_config(coordinate_size, config::global::get())
    }

    pub fn with_config(coordinate_size: usize, config: Config) -> Result<Self, CoordinateMapError> {
        if coordinate_size < 2 {
            return Err(CoordinateMapError::InvalidDims {
                expected: 2,
                got: coordinate_size,
            });
        }
        if config.backend() == CoordinateMapBackend::Cuda {
            return Err(CoordinateMapError::BackendUnavailable(
                config.backend().to_string(),
            ));
        }
        let pool = match config.num_threads() {
            0 => None,
            num_threads => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .thread_name(|i| format!("coordmap-{}", i))
                    .build()
                    .map_err(|err| CoordinateMapError::ThreadPool(err.to_string()))?,
            ),
        };
        tracing::debug!(coordinate_size, ?config, "created coordinate map manager");
        Ok(Self {
            coordinate_size,
            config,
            pool,
            maps: BTreeMap::new(),
            kernel_maps: AHashMap::new(),
            origin_maps: AHashMap::new(),
            stats: ManagerStats::default(),
            prune_count: 0,
        })
    }

    pub fn coordinate_size(&self) -> usize {
        self.coordinate_size
    }

    /// Spatial dimension `D`.
    pub fn dimension(&self) -> usize {
        self.coordinate_size - 1
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    /// Number of registered coordinate maps.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    fn resolve(
        &self,
        key: &CoordinateMapKey,
    ) -> Result<(&StrideKey, &CoordinateMap), CoordinateMapError> {
        if key.get_coordinate_size() != self.coordinate_size {
            return Err(CoordinateMapError::InvalidDims {
                expected: self.coordinate_size,
                got: key.get_coordinate_size(),
            });
        }
        let stride_key = key.get_key()?;
        self.maps
            .get_key_value(stride_key)
            .ok_or_else(|| CoordinateMapError::KeyNotFound(stride_key.clone()))
    }

    fn handle(&self, key: StrideKey) -> CoordinateMapKey {
        CoordinateMapKey::bound(self.coordinate_size, key)
    }

    /// Registered handle for `key`, counting a cache hit.
    fn hit(&mut self, key: StrideKey) -> CoordinateMapKey {
        tracing::debug!(key = %key, "coordinate map cache hit");
        self.stats.stride_cache_hits += 1;
        self.handle(key)
    }

    fn register(
        &mut self,
        key: StrideKey,
        map: CoordinateMap,
    ) -> Result<CoordinateMapKey, CoordinateMapError> {
        if self.maps.contains_key(&key) {
            return Err(CoordinateMapError::DuplicateKey(key));
        }
        tracing::debug!(key = %key, rows = map.len(), "registered coordinate map");
        self.stats.maps_created += 1;
        self.maps.insert(key.clone(), map);
        Ok(self.handle(key))
    }

    /// Origin maps are registered per input map, under
    /// `(0.., "origin(<input key>)")`. An origin map is its own origin.
    fn origin_key(&self, key: &StrideKey) -> StrideKey {
        if key.is_origin() {
            return key.clone();
        }
        StrideKey::new(vec![0; key.dimension()], format!("origin({})", key))
    }

    fn run<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    /// Inserts a flat `N x (D + 1)` coordinate buffer into the map
    /// registered under `(tensor_stride, tag)`, creating the map if
    /// needed. Coordinates already present keep their rows; new ones
    /// are appended, which drops every cached kernel map involving
    /// this map and refreshes its origin map.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(rows = coordinates.len() / self.coordinate_size, tag = %tag)
    )]
    pub fn insert_and_map(
        &mut self,
        coordinates: &[Coord],
        tensor_stride: Vec<u32>,
        tag: &str,
    ) -> Result<(CoordinateMapKey, InsertionMapping), CoordinateMapError> {
        validate_stride(&tensor_stride, self.dimension())?;
        let key = StrideKey::new(tensor_stride, tag);
        match self.maps.get_mut(&key) {
            Some(map) => {
                let mapping = map.insert(coordinates)?;
                if !mapping.mapping.is_empty() {
                    tracing::debug!(
                        key = %key,
                        added = mapping.mapping.len(),
                        "appended coordinates"
                    );
                    self.invalidate(&key)?;
                }
                Ok((self.handle(key), mapping))
            }
            None => {
                let mut map =
                    CoordinateMap::new(self.coordinate_size, key.tensor_stride().to_vec())?;
                let mapping = map.insert(coordinates)?;
                Ok((self.register(key, map)?, mapping))
            }
        }
    }

    /// [`insert_and_map`](Self::insert_and_map) without the mapping.
    pub fn initialize(
        &mut self,
        coordinates: &[Coord],
        tensor_stride: Vec<u32>,
        tag: &str,
    ) -> Result<CoordinateMapKey, CoordinateMapError> {
        Ok(self.insert_and_map(coordinates, tensor_stride, tag)?.0)
    }

    fn invalidate(&mut self, key: &StrideKey) -> Result<(), CoordinateMapError> {
        let origin_key = self.origin_key(key);
        let before = self.kernel_maps.len();
        self.kernel_maps
            .retain(|cached, _| !cached.references(key) && !cached.references(&origin_key));
        self.origin_maps.remove(key);
        self.origin_maps.remove(&origin_key);

        // Origin rows keep their numbering; new batches are appended.
        let batches: Vec<CoordinateKey> = match self.maps.get(key) {
            Some(source) => source.origin().iter().map(|(_, batch)| batch.clone()).collect(),
            None => Vec::new(),
        };
        if let Some(origin) = self.maps.get_mut(&origin_key) {
            let known = origin.len();
            for batch in batches {
                origin.insert_key(batch)?;
            }
            if origin.len() != known {
                tracing::debug!(
                    key = %origin_key,
                    added = origin.len() - known,
                    "extended origin map"
                );
            }
        }
        tracing::debug!(
            key = %key,
            dropped = before - self.kernel_maps.len(),
            "invalidated cached kernel maps"
        );
        Ok(())
    }

    /// The map one tensor-stride level up: output stride
    /// `tensor_stride * multiplier`, every coordinate floored onto the
    /// output lattice. Registered under the input's tag.
    #[tracing::instrument(level = "debug", skip_all, fields(?multiplier))]
    pub fn stride(
        &mut self,
        in_key: &CoordinateMapKey,
        multiplier: &[u32],
    ) -> Result<CoordinateMapKey, CoordinateMapError> {
        let (in_stride_key, map) = self.resolve(in_key)?;
        validate_stride(multiplier, self.dimension())?;
        let out_stride = scale(in_stride_key.tensor_stride(), multiplier)?;
        let out_key = StrideKey::new(out_stride, in_stride_key.tag());
        if self.maps.contains_key(&out_key) {
            return Ok(self.hit(out_key));
        }
        let derived = map.stride(multiplier)?;
        self.register(out_key, derived)
    }

    /// The origin map of `in_key`: one row per batch index, ascending
    /// when built. Batches added later by streaming insertion are
    /// appended.
    pub fn origin(
        &mut self,
        in_key: &CoordinateMapKey,
    ) -> Result<CoordinateMapKey, CoordinateMapError> {
        let (in_stride_key, map) = self.resolve(in_key)?;
        let out_key = self.origin_key(in_stride_key);
        if self.maps.contains_key(&out_key) {
            return Ok(self.hit(out_key));
        }
        let derived = map.origin();
        self.register(out_key, derived)
    }

    /// Every input coordinate shifted by every offset of `region` on
    /// the `out_stride` lattice. This is how a transposed convolution
    /// generates new output coordinates.
    pub fn stride_region(
        &mut self,
        in_key: &CoordinateMapKey,
        region: &KernelRegion,
        out_stride: Vec<u32>,
    ) -> Result<CoordinateMapKey, CoordinateMapError> {
        let (in_stride_key, map) = self.resolve(in_key)?;
        validate_stride(&out_stride, self.dimension())?;
        let out_key = StrideKey::new(out_stride, format!("{}@{}", in_stride_key.tag(), region));
        if self.maps.contains_key(&out_key) {
            return Ok(self.hit(out_key));
        }
        let derived = map.expand(region, out_key.tensor_stride().to_vec())?;
        self.register(out_key, derived)
    }

    /// The union of maps sharing one tensor stride. Also returns, per
    /// input map, the union row of each of its rows.
    pub fn union(
        &mut self,
        in_keys: &[CoordinateMapKey],
    ) -> Result<(CoordinateMapKey, Vec<Vec<usize>>), CoordinateMapError> {
        let inputs = in_keys
            .iter()
            .map(|key| self.resolve(key))
            .collect::<Result<Vec<_>, _>>()?;
        let Some((first, _)) = inputs.first() else {
            return Err(CoordinateMapError::InvalidDims {
                expected: 1,
                got: 0,
            });
        };
        if let Some((other, _)) = inputs
            .iter()
            .find(|(key, _)| key.tensor_stride() != first.tensor_stride())
        {
            return Err(CoordinateMapError::StrideMismatch {
                expected: first.tensor_stride().to_vec(),
                got: other.tensor_stride().to_vec(),
            });
        }
        let out_key = StrideKey::new(
            first.tensor_stride().to_vec(),
            format!("union({})", inputs.iter().map(|(key, _)| key.tag()).join(",")),
        );

        if let Some(existing) = self.maps.get(&out_key) {
            let rows = inputs
                .iter()
                .map(|(_, map)| {
                    map.iter()
                        .map(|(_, key)| {
                            existing
                                .find(key)
                                .ok_or_else(|| CoordinateMapError::KeyNotFound(out_key.clone()))
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok((self.hit(out_key), rows));
        }

        let maps: Vec<&CoordinateMap> = inputs.iter().map(|(_, map)| *map).collect();
        let (derived, rows) = CoordinateMap::union(&maps)?;
        Ok((self.register(out_key, derived)?, rows))
    }

    /// Keeps the rows of `in_key` selected by `keep`. Every call
    /// registers a new map under the next unused `"<tag>/pruned:<n>"`;
    /// the second component lists the kept input rows.
    pub fn prune(
        &mut self,
        in_key: &CoordinateMapKey,
        keep: &[bool],
    ) -> Result<(CoordinateMapKey, Vec<usize>), CoordinateMapError> {
        let (in_stride_key, map) = self.resolve(in_key)?;
        let (derived, kept) = map.prune(keep)?;
        let (tensor_stride, tag) = (
            in_stride_key.tensor_stride().to_vec(),
            in_stride_key.tag().to_string(),
        );
        let out_key = loop {
            self.prune_count += 1;
            let candidate = StrideKey::new(
                tensor_stride.clone(),
                format!("{}/pruned:{}", tag, self.prune_count),
            );
            if !self.maps.contains_key(&candidate) {
                break candidate;
            }
        };
        Ok((self.register(out_key, derived)?, kept))
    }

    /// Row count of the map behind `key`.
    pub fn size(&self, key: &CoordinateMapKey) -> Result<usize, CoordinateMapError> {
        Ok(self.resolve(key)?.1.len())
    }

    /// Flat `N x (D + 1)` snapshot of the map behind `key`.
    pub fn get_coordinates(
        &self,
        key: &CoordinateMapKey,
    ) -> Result<Vec<Coord>, CoordinateMapError> {
        Ok(self.resolve(key)?.1.coordinates())
    }

    pub fn coordinate_map(
        &self,
        key: &CoordinateMapKey,
    ) -> Result<&CoordinateMap, CoordinateMapError> {
        Ok(self.resolve(key)?.1)
    }

    /// Every registered key with the given tensor stride.
    pub fn get_coordinate_map_keys(&self, tensor_stride: &[u32]) -> Vec<CoordinateMapKey> {
        self.maps
            .keys()
            .filter(|key| key.tensor_stride() == tensor_stride)
            .map(|key| self.handle(key.clone()))
            .collect()
    }

    /// Renders every row of the map behind `key`.
    pub fn print_coordinate_map(
        &self,
        key: &CoordinateMapKey,
    ) -> Result<String, CoordinateMapError> {
        Ok(format!("{:#}", self.resolve(key)?.1))
    }

    /// The kernel map between two registered maps.
    ///
    /// A forward map requires `out.stride == in.stride * kernel_stride`
    /// and pairs every output coordinate with the input coordinates at
    /// `out + offset`. A transposed map requires
    /// `in.stride == out.stride * kernel_stride` and is the forward map
    /// from the output to the input with its sides exchanged.
    #[tracing::instrument(level = "debug", skip_all, fields(region = %region, transpose))]
    pub fn kernel_map(
        &mut self,
        in_key: &CoordinateMapKey,
        out_key: &CoordinateMapKey,
        region: &KernelRegion,
        transpose: bool,
    ) -> Result<Arc<KernelMap>, CoordinateMapError> {
        let (in_stride_key, in_map) = self.resolve(in_key)?;
        let (out_stride_key, out_map) = self.resolve(out_key)?;
        if region.dimension() != self.dimension() {
            return Err(CoordinateMapError::InvalidDims {
                expected: self.dimension(),
                got: region.dimension(),
            });
        }
        let (coarse, fine) = if transpose {
            (in_stride_key, out_stride_key)
        } else {
            (out_stride_key, in_stride_key)
        };
        let expected = scale(fine.tensor_stride(), region.kernel_stride())?;
        if coarse.tensor_stride() != expected.as_slice() {
            return Err(CoordinateMapError::StrideMismatch {
                expected,
                got: coarse.tensor_stride().to_vec(),
            });
        }

        let cache_key = KernelMapKey {
            in_key: in_stride_key.clone(),
            out_key: out_stride_key.clone(),
            region: region.clone(),
            transpose,
        };
        if let Some(cached) = self.kernel_maps.get(&cache_key) {
            let cached = cached.clone();
            self.stats.kernel_map_cache_hits += 1;
            tracing::debug!("kernel map cache hit");
            return Ok(cached);
        }

        let algorithm = self.config.algorithm();
        let threshold = self.config.parallel_threshold();
        let generated = if transpose {
            let offsets = region.offsets(out_stride_key.tensor_stride())?;
            self.run(|| kernel_map::generate(out_map, in_map, offsets, algorithm, threshold))?
                .transposed()
        } else {
            let offsets = region.offsets(in_stride_key.tensor_stride())?;
            self.run(|| kernel_map::generate(in_map, out_map, offsets, algorithm, threshold))?
        };
        tracing::debug!(
            input = %cache_key.in_key,
            output = %cache_key.out_key,
            pairs = generated.len(),
            "computed kernel map"
        );

        let generated = Arc::new(generated);
        self.stats.kernel_map_scans += 1;
        if self.config.kernel_map_cache() {
            self.kernel_maps.insert(cache_key, generated.clone());
        }
        Ok(generated)
    }

    /// Resolves an unset output handle the way a convolution does: the
    /// input strided by the kernel stride, or for a transposed
    /// convolution the existing map one level down (optionally
    /// generated by region expansion). A set handle is left alone.
    pub fn output_key(
        &mut self,
        in_key: &CoordinateMapKey,
        out_key: &mut CoordinateMapKey,
        region: &KernelRegion,
        transpose: bool,
        generate_new_coordinates: bool,
    ) -> Result<(), CoordinateMapError> {
        if out_key.is_key_set() {
            return Ok(());
        }
        if out_key.get_coordinate_size() != self.coordinate_size {
            return Err(CoordinateMapError::InvalidDims {
                expected: self.coordinate_size,
                got: out_key.get_coordinate_size(),
            });
        }
        let resolved = if !transpose {
            self.stride(in_key, region.kernel_stride())?
        } else {
            let (in_stride_key, _) = self.resolve(in_key)?;
            let out_stride = unscale(in_stride_key.tensor_stride(), region.kernel_stride())?;
            if generate_new_coordinates {
                self.stride_region(in_key, region, out_stride)?
            } else {
                let key = StrideKey::new(out_stride, in_stride_key.tag());
                if !self.maps.contains_key(&key) {
                    return Err(CoordinateMapError::KeyNotFound(key));
                }
                self.handle(key)
            }
        };
        out_key.bind(resolved.get_key()?.clone());
        Ok(())
    }

    /// The kernel map from `in_key` to its origin map. Cached.
    pub fn origin_map(
        &mut self,
        in_key: &CoordinateMapKey,
    ) -> Result<Arc<OriginMap>, CoordinateMapError> {
        let in_stride_key = self.resolve(in_key)?.0.clone();
        if let Some(cached) = self.origin_maps.get(&in_stride_key) {
            return Ok(cached.clone());
        }
        let origin_key = self.origin(in_key)?;
        let (_, in_map) = self.resolve(in_key)?;
        let (_, origin) = self.resolve(&origin_key)?;
        let generated = Arc::new(kernel_map::generate_origin(in_map, origin)?);
        tracing::debug!(key = %in_stride_key, batches = generated.len(), "computed origin map");
        self.origin_maps.insert(in_stride_key, generated.clone());
        Ok(generated)
    }

    /// Number of distinct batch indices in `in_key`.
    pub fn origin_map_size(
        &mut self,
        in_key: &CoordinateMapKey,
    ) -> Result<usize, CoordinateMapError> {
        let origin_key = self.origin(in_key)?;
        self.size(&origin_key)
    }

    /// The map a pooling layer runs on. Global modes bind an unset
    /// `out_key` to the origin map and reject a set one naming any
    /// other map; local modes resolve it as a convolution would.
    pub fn pooling_map(
        &mut self,
        in_key: &CoordinateMapKey,
        out_key: &mut CoordinateMapKey,
        mode: PoolingMode,
        region: &KernelRegion,
    ) -> Result<PoolingMap, CoordinateMapError> {
        if mode.is_global() {
            let origin_key = self.origin(in_key)?.get_key()?.clone();
            match out_key.get_key().ok().cloned() {
                None => out_key.bind(origin_key),
                Some(bound) if bound == origin_key => {}
                Some(bound) if bound.tensor_stride() != origin_key.tensor_stride() => {
                    return Err(CoordinateMapError::StrideMismatch {
                        expected: origin_key.tensor_stride().to_vec(),
                        got: bound.tensor_stride().to_vec(),
                    });
                }
                Some(bound) => return Err(CoordinateMapError::KeyNotFound(bound)),
            }
            return Ok(PoolingMap::Global(self.origin_map(in_key)?));
        }
        self.output_key(in_key, out_key, region, false, false)?;
        Ok(PoolingMap::Local(self.kernel_map(in_key, out_key, region, false)?))
    }
}

/// `stride * multiplier` per axis.
fn scale(stride: &[u32], multiplier: &[u32]) -> Result<Vec<u32>, CoordinateMapError> {
    stride
        .iter()
        .zip(multiplier)
        .map(|(&s, &m)| s.checked_mul(m))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| CoordinateMapError::InvalidStride {
            stride: stride.to_vec(),
            reason: format!("overflows when scaled by {:?}", multiplier),
        })
}

/// `stride / divisor` per axis; every axis must divide exactly.
fn unscale(stride: &[u32], divisor: &[u32]) -> Result<Vec<u32>, CoordinateMapError> {
    stride
        .iter()
        .zip(divisor)
        .map(|(&s, &d)| (d != 0 && s % d == 0 && s >= d).then(|| s / d))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| CoordinateMapError::InvalidStride {
            stride: stride.to_vec(),
            reason: format!("not divisible by kernel stride {:?}", divisor),
        })
}

impl fmt::Debug for CoordinateMapManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinateMapManager")
            .field("coordinate_size", &self.coordinate_size)
            .field("maps", &self.maps.len())
            .field("kernel_maps", &self.kernel_maps.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl fmt::Display for CoordinateMapManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CoordinateMapManager(")?;
        for (key, map) in &self.maps {
            writeln!(f, "  {}: {} rows", key, map.len())?;
        }
        write!(f, "  kernel maps: {}\n)", self.kernel_maps.len())
    }
}
