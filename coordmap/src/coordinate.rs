/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fixed-arity integer coordinates.
//!
//! A coordinate is `[batch, x_1, .., x_D]`. The arity `D + 1` is
//! fixed per manager, so every key in a map has the same length and
//! equality and hashing reduce to a slice comparison. Keys up to
//! [`INLINE_COORDINATE_SIZE`] values live inline without a heap
//! allocation.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use itertools::Itertools;
use smallvec::SmallVec;

use crate::error::CoordinateMapError;

/// Integer type of a single coordinate component.
pub type Coord = i32;

/// Number of components stored inline by [`CoordinateKey`] and
/// [`Offset`].
pub const INLINE_COORDINATE_SIZE: usize = 8;

/// A spatial offset vector (no batch component).
pub type Offset = SmallVec<[Coord; INLINE_COORDINATE_SIZE]>;

/// An immutable coordinate: batch index followed by `D` spatial
/// components.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordinateKey(SmallVec<[Coord; INLINE_COORDINATE_SIZE]>);

impl CoordinateKey {
    /// Builds a key from `[batch, x_1, .., x_D]`. The slice must hold
    /// at least the batch component.
    pub fn new(values: &[Coord]) -> Result<Self, CoordinateMapError> {
        if values.is_empty() {
            return Err(CoordinateMapError::InvalidDims {
                expected: 1,
                got: 0,
            });
        }
        Ok(Self(SmallVec::from_slice(values)))
    }

    /// Builds a key from a batch index and its spatial components.
    pub fn from_parts(batch: Coord, spatial: &[Coord]) -> Self {
        let mut values = SmallVec::with_capacity(spatial.len() + 1);
        values.push(batch);
        values.extend_from_slice(spatial);
        Self(values)
    }

    /// Batch index.
    #[inline]
    pub fn batch(&self) -> Coord {
        self.0[0]
    }

    /// Spatial components `x_1 .. x_D`.
    #[inline]
    pub fn spatial(&self) -> &[Coord] {
        &self.0[1..]
    }

    /// Spatial dimension `D`.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.0.len() - 1
    }

    #[inline]
    pub fn as_slice(&self) -> &[Coord] {
        &self.0
    }

    /// This key moved by `offset` along the spatial axes. Returns
    /// `None` when a component overflows, which callers treat as a
    /// coordinate that cannot exist.
    #[inline]
    pub fn shifted(&self, offset: &[Coord]) -> Option<CoordinateKey> {
        debug_assert_eq!(offset.len(), self.dimension());
        let mut values = self.0.clone();
        for (value, delta) in values[1..].iter_mut().zip(offset) {
            *value = value.checked_add(*delta)?;
        }
        Some(Self(values))
    }

    /// Snaps every spatial component onto the lattice with the given
    /// per-axis spacing: `floor(x / s) * s`. A spacing of zero
    /// collapses the axis onto the origin. Returns `None` when the
    /// lattice point below a component is not representable.
    pub fn floor_to_lattice(&self, spacing: &[u32]) -> Option<CoordinateKey> {
        debug_assert_eq!(spacing.len(), self.dimension());
        let mut values = self.0.clone();
        for (value, &s) in values[1..].iter_mut().zip(spacing) {
            *value = if s == 0 {
                0
            } else {
                let s = i64::from(s);
                Coord::try_from(i64::from(*value).div_euclid(s) * s).ok()?
            };
        }
        Some(Self(values))
    }
}

impl Deref for CoordinateKey {
    type Target = [Coord];

    fn deref(&self) -> &[Coord] {
        &self.0
    }
}

impl Borrow<[Coord]> for CoordinateKey {
    fn borrow(&self) -> &[Coord] {
        &self.0
    }
}

impl AsRef<[Coord]> for CoordinateKey {
    fn as_ref(&self) -> &[Coord] {
        &self.0
    }
}

impl fmt::Debug for CoordinateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoordinateKey{}", self)
    }
}

impl fmt::Display for CoordinateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.iter().join(", "))
    }
}
