/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use thiserror::Error;

use crate::coordinate::Coord;
use crate::key::StrideKey;

/// Errors raised by coordinate maps, regions and the map manager.
///
/// Every variant is a precondition violation or a resource failure.
/// Candidate coordinates missing from a map during kernel-map
/// generation are not errors and never surface here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoordinateMapError {
    #[error("invalid dims: expected {expected}, got {got}")]
    InvalidDims { expected: usize, got: usize },

    #[error("invalid tensor stride {stride:?}: {reason}")]
    InvalidStride { stride: Vec<u32>, reason: String },

    #[error("invalid kernel: {reason}")]
    InvalidKernel { reason: String },

    #[error("coordinate map key is not set")]
    KeyNotSet,

    #[error("coordinate map {0} not found")]
    KeyNotFound(StrideKey),

    #[error("coordinate map {0} already exists")]
    DuplicateKey(StrideKey),

    #[error("stride mismatch: expected {expected:?}, got {got:?}")]
    StrideMismatch { expected: Vec<u32>, got: Vec<u32> },

    #[error("mask length {got} does not match map size {expected}")]
    MaskLength { expected: usize, got: usize },

    #[error("batch {0} has no row in the origin map")]
    MissingBatch(Coord),

    #[error("backend {0} is not available in this build")]
    BackendUnavailable(String),

    #[error("failed to allocate storage for {requested} entries")]
    Allocation { requested: usize },

    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),
}
