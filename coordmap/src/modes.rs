/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Enumerations exchanged with the consumers of kernel maps.
//!
//! These are values, not behavior: the numeric kernels that act on
//! them live outside this crate. Every enumeration prints as and
//! parses from a lowercase name so it can travel through environment
//! variables and command lines.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Error returned when a name does not match any variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseModeError {
    kind: &'static str,
    value: String,
}

macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $kind:literal {
            $(
                $(#[$vmeta:meta])*
                $variant:ident => $text:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $text)]
                $variant,
            )*
        }

        impl $name {
            /// All variants in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseModeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let lowered = s.trim().to_ascii_lowercase();
                match lowered.as_str() {
                    $($text => Ok($name::$variant),)*
                    _ => Err(ParseModeError {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

named_enum! {
    /// Kernel-map generation strategy. Both explicit strategies
    /// produce identical kernel maps; they differ only in how the
    /// scan is scheduled.
    #[derive(Default)]
    pub enum Algorithm: "algorithm" {
        /// Pick per request from the output map size.
        #[default]
        Default => "default",
        /// Scan offset by offset, appending straight into the groups.
        MemoryEfficient => "memory_efficient",
        /// Scan output rows in parallel and regroup afterwards.
        SpeedOptimized => "speed_optimized",
    }
}

named_enum! {
    /// Kernel-map layout hint for device backends.
    pub enum CudaKernelMapMode: "kernel map mode" {
        MemoryEfficient => "memory_efficient",
        SpeedOptimized => "speed_optimized",
    }
}

named_enum! {
    /// Where coordinate maps are stored.
    #[derive(Default)]
    pub enum CoordinateMapBackend: "backend" {
        #[default]
        Cpu => "cpu",
        Cuda => "cuda",
    }
}

named_enum! {
    /// Allocation strategy for device-resident coordinate storage.
    #[derive(Default)]
    pub enum GpuMemoryAllocator: "gpu allocator" {
        /// Allocations go through the host library's caching pool.
        #[default]
        Library => "library",
        /// Allocations go straight to the device driver.
        Direct => "direct",
    }
}

named_enum! {
    /// Region shape scanned around each output coordinate.
    #[derive(Default)]
    pub enum RegionType: "region type" {
        #[default]
        HyperCube => "hypercube",
        HyperCross => "hypercross",
        Custom => "custom",
    }
}

/// Reduction applied by a pooling kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reduction {
    Sum,
    Avg,
    Max,
}

/// How global pooling hands its map to the numeric kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GlobalPoolingConvention {
    /// Let the kernel choose.
    Default,
    /// Drive the reduction with the origin kernel map.
    Kernel,
    /// Drive the reduction with per-row batch indices.
    Index,
}

named_enum! {
    /// Pooling modes understood by the pooling kernels.
    pub enum PoolingMode: "pooling mode" {
        LocalSum => "local_sum",
        LocalAvg => "local_avg",
        LocalMax => "local_max",
        GlobalSumDefault => "global_sum_default",
        GlobalAvgDefault => "global_avg_default",
        GlobalMaxDefault => "global_max_default",
        GlobalSumKernel => "global_sum_kernel",
        GlobalAvgKernel => "global_avg_kernel",
        GlobalMaxKernel => "global_max_kernel",
        GlobalSumIndex => "global_sum_index",
        GlobalAvgIndex => "global_avg_index",
        GlobalMaxIndex => "global_max_index",
    }
}

impl PoolingMode {
    pub fn reduction(&self) -> Reduction {
        use PoolingMode::*;
        match self {
            LocalSum | GlobalSumDefault | GlobalSumKernel | GlobalSumIndex => Reduction::Sum,
            LocalAvg | GlobalAvgDefault | GlobalAvgKernel | GlobalAvgIndex => Reduction::Avg,
            LocalMax | GlobalMaxDefault | GlobalMaxKernel | GlobalMaxIndex => Reduction::Max,
        }
    }

    /// The global convention, or `None` for local pooling.
    pub fn global_convention(&self) -> Option<GlobalPoolingConvention> {
        use PoolingMode::*;
        match self {
            LocalSum | LocalAvg | LocalMax => None,
            GlobalSumDefault | GlobalAvgDefault | GlobalMaxDefault => {
                Some(GlobalPoolingConvention::Default)
            }
            GlobalSumKernel | GlobalAvgKernel | GlobalMaxKernel => {
                Some(GlobalPoolingConvention::Kernel)
            }
            GlobalSumIndex | GlobalAvgIndex | GlobalMaxIndex => {
                Some(GlobalPoolingConvention::Index)
            }
        }
    }

    pub fn is_global(&self) -> bool {
        self.global_convention().is_some()
    }
}
