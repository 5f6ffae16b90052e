/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Coordinate maps and kernel-map generation for sparse tensor
//! convolution.
//!
//! A sparse tensor stores features only at a set of integer
//! coordinates `[batch, x_1, .., x_D]`. This crate assigns those
//! coordinates dense row indices ([`CoordinateMap`]), derives the
//! coordinate sets of coarser or finer tensor strides, and computes
//! kernel maps: the `(input row, output row, offset index)` pairings
//! a convolution, pooling or transposed convolution iterates over.
//! Everything is owned by a [`CoordinateMapManager`], which caches
//! derived maps and kernel maps.
//!
//! ```
//! use coordmap::Config;
//! use coordmap::CoordinateMapManager;
//! use coordmap::KernelRegion;
//!
//! let mut manager = CoordinateMapManager::with_config(3, Config::default()).unwrap();
//! let key = manager
//!     .initialize(&[0, 0, 0, 0, 1, 0, 0, 2, 0], vec![1, 1], "")
//!     .unwrap();
//! let region = KernelRegion::cubic(2, 3, 1, 1).unwrap();
//! let kernel_map = manager.kernel_map(&key, &key, &region, false).unwrap();
//! assert_eq!(kernel_map.volume(), 9);
//! assert_eq!(kernel_map.len(), 7);
//! ```

pub mod config;
mod coordinate;
mod error;
pub mod kernel_map;
mod key;
mod manager;
mod map;
mod modes;
mod region;

/// Property-based generators for randomized tests of coordinate maps
/// and kernel regions.
#[cfg(test)]
pub mod strategy;

pub use config::Config;
pub use coordinate::Coord;
pub use coordinate::CoordinateKey;
pub use coordinate::INLINE_COORDINATE_SIZE;
pub use coordinate::Offset;
pub use error::CoordinateMapError;
pub use kernel_map::KernelMap;
pub use kernel_map::OriginMap;
pub use key::CoordinateMapKey;
pub use key::StrideKey;
pub use manager::CoordinateMapManager;
pub use manager::ManagerStats;
pub use manager::PoolingMap;
pub use map::CoordinateMap;
pub use map::InsertionMapping;
pub use map::Iter;
pub use modes::Algorithm;
pub use modes::CoordinateMapBackend;
pub use modes::CudaKernelMapMode;
pub use modes::GlobalPoolingConvention;
pub use modes::GpuMemoryAllocator;
pub use modes::ParseModeError;
pub use modes::PoolingMode;
pub use modes::Reduction;
pub use modes::RegionType;
pub use region::KernelRegion;
pub use region::RegionIter;
