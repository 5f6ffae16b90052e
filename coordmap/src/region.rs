/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Kernel regions and their offset sequences.
//!
//! A [`KernelRegion`] describes the neighborhood scanned around each
//! output coordinate: kernel size, kernel stride, dilation, shape and
//! (for [`RegionType::Custom`]) an explicit offset table. Calling
//! [`KernelRegion::offsets`] with the tensor stride of the map being
//! searched yields a [`RegionIter`], a lazy, restartable and
//! random-access sequence of spatial offset vectors. The position of
//! an offset in that sequence is its *offset index*, which kernel maps
//! use to group their pairs.
//!
//! Per axis `i`, the lattice step is `dilation[i] * tensor_stride[i]`.
//!
//! - `HyperCube`: all `prod(kernel_size)` points of the box, with axis
//!   0 varying fastest. Odd sizes are centred at zero, even sizes
//!   start at zero.
//! - `HyperCross`: the origin followed, axis by axis, by the offsets
//!   `-r..-1, 1..r` where `r = (kernel_size[i] - 1) / 2`, giving
//!   `1 + sum(kernel_size[i] - 1)` offsets. Odd sizes only.
//! - `Custom`: the caller's offsets, verbatim.

use std::fmt;
use std::iter::FusedIterator;

use itertools::Itertools;

use crate::coordinate::Coord;
use crate::coordinate::Offset;
use crate::error::CoordinateMapError;
use crate::modes::RegionType;

/// A kernel region descriptor. Two descriptors are equal iff every
/// field is equal, which makes them usable as cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelRegion {
    kernel_size: Vec<u32>,
    kernel_stride: Vec<u32>,
    kernel_dilation: Vec<u32>,
    region_type: RegionType,
    // Flat `K x D` table, only for `RegionType::Custom`.
    offsets: Vec<Coord>,
}

impl KernelRegion {
    /// Builds a region descriptor. `offsets` is a flat `K x D` table
    /// read only for [`RegionType::Custom`]; it must be empty for the
    /// other shapes.
    pub fn new(
        kernel_size: Vec<u32>,
        kernel_stride: Vec<u32>,
        kernel_dilation: Vec<u32>,
        region_type: RegionType,
        offsets: Vec<Coord>,
    ) -> Result<Self, CoordinateMapError> {
        let dimension = kernel_size.len();
        for (name, values) in [("stride", &kernel_stride), ("dilation", &kernel_dilation)] {
            if values.len() != dimension {
                return Err(CoordinateMapError::InvalidKernel {
                    reason: format!(
                        "kernel {} has {} entries, kernel size has {}",
                        name,
                        values.len(),
                        dimension
                    ),
                });
            }
        }
        if dimension == 0 {
            return Err(CoordinateMapError::InvalidKernel {
                reason: "kernel must have at least one spatial axis".to_string(),
            });
        }
        for (name, values) in [
            ("size", &kernel_size),
            ("stride", &kernel_stride),
            ("dilation", &kernel_dilation),
        ] {
            if values.contains(&0) {
                return Err(CoordinateMapError::InvalidKernel {
                    reason: format!("kernel {} must be positive, got {:?}", name, values),
                });
            }
        }

        match region_type {
            RegionType::HyperCube => {
                if kernel_size
                    .iter()
                    .try_fold(1usize, |volume, &k| volume.checked_mul(k as usize))
                    .is_none()
                {
                    return Err(CoordinateMapError::InvalidKernel {
                        reason: format!("kernel volume of {:?} overflows", kernel_size),
                    });
                }
            }
            RegionType::HyperCross => {
                if let Some(size) = kernel_size.iter().find(|&&k| k % 2 == 0) {
                    return Err(CoordinateMapError::InvalidKernel {
                        reason: format!("hypercross requires odd kernel sizes, got {}", size),
                    });
                }
            }
            RegionType::Custom => {
                if offsets.is_empty() || offsets.len() % dimension != 0 {
                    return Err(CoordinateMapError::InvalidDims {
                        expected: dimension,
                        got: offsets.len(),
                    });
                }
            }
        }
        if region_type != RegionType::Custom && !offsets.is_empty() {
            return Err(CoordinateMapError::InvalidKernel {
                reason: format!("explicit offsets are only read by {}", RegionType::Custom),
            });
        }

        Ok(Self {
            kernel_size,
            kernel_stride,
            kernel_dilation,
            region_type,
            offsets,
        })
    }

    /// A hypercube region.
    pub fn hypercube(
        kernel_size: Vec<u32>,
        kernel_stride: Vec<u32>,
        kernel_dilation: Vec<u32>,
    ) -> Result<Self, CoordinateMapError> {
        Self::new(
            kernel_size,
            kernel_stride,
            kernel_dilation,
            RegionType::HyperCube,
            Vec::new(),
        )
    }

    /// A hypercube region with the same size, stride and dilation on
    /// every axis.
    pub fn cubic(
        dimension: usize,
        kernel_size: u32,
        kernel_stride: u32,
        kernel_dilation: u32,
    ) -> Result<Self, CoordinateMapError> {
        Self::hypercube(
            vec![kernel_size; dimension],
            vec![kernel_stride; dimension],
            vec![kernel_dilation; dimension],
        )
    }

    pub fn dimension(&self) -> usize {
        self.kernel_size.len()
    }

    pub fn kernel_size(&self) -> &[u32] {
        &self.kernel_size
    }

    pub fn kernel_stride(&self) -> &[u32] {
        &self.kernel_stride
    }

    pub fn kernel_dilation(&self) -> &[u32] {
        &self.kernel_dilation
    }

    pub fn region_type(&self) -> RegionType {
        self.region_type
    }

    /// Number of offsets the region produces.
    pub fn volume(&self) -> usize {
        match self.region_type {
            RegionType::HyperCube => self.kernel_size.iter().map(|&k| k as usize).product(),
            RegionType::HyperCross => {
                1 + self
                    .kernel_size
                    .iter()
                    .map(|&k| k as usize - 1)
                    .sum::<usize>()
            }
            RegionType::Custom => self.offsets.len() / self.dimension(),
        }
    }

    /// Whether the kernel stride is one on every axis.
    pub fn is_unit_stride(&self) -> bool {
        self.kernel_stride.iter().all(|&s| s == 1)
    }

    /// The offsets of this region on a lattice of the given tensor
    /// stride. Fails if an offset does not fit into a [`Coord`].
    pub fn offsets(&self, tensor_stride: &[u32]) -> Result<RegionIter<'_>, CoordinateMapError> {
        if tensor_stride.len() != self.dimension() {
            return Err(CoordinateMapError::InvalidDims {
                expected: self.dimension(),
                got: tensor_stride.len(),
            });
        }

        let mut lower = Offset::with_capacity(self.dimension());
        let mut step = Offset::with_capacity(self.dimension());
        for axis in 0..self.dimension() {
            let k = i128::from(self.kernel_size[axis]);
            let s = i128::from(self.kernel_dilation[axis]) * i128::from(tensor_stride[axis]);
            let lo = if k % 2 == 1 { -((k - 1) / 2) * s } else { 0 };
            let hi = lo + (k - 1) * s;
            let overflow = || CoordinateMapError::InvalidKernel {
                reason: format!(
                    "offsets on axis {} exceed the coordinate range (tensor stride {})",
                    axis, tensor_stride[axis]
                ),
            };
            if Coord::try_from(hi).is_err() || Coord::try_from(s).is_err() {
                return Err(overflow());
            }
            lower.push(Coord::try_from(lo).map_err(|_| overflow())?);
            step.push(s as Coord);
        }

        Ok(RegionIter {
            region: self,
            lower,
            step,
            front: 0,
            back: self.volume(),
        })
    }
}

impl fmt::Display for KernelRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(size=[{}], stride=[{}], dilation=[{}]",
            self.region_type,
            self.kernel_size.iter().join(", "),
            self.kernel_stride.iter().join(", "),
            self.kernel_dilation.iter().join(", "),
        )?;
        if self.region_type == RegionType::Custom {
            write!(
                f,
                ", offsets=[{}]",
                self.offsets
                    .chunks(self.dimension())
                    .map(|offset| format!("({})", offset.iter().join(", ")))
                    .join(", ")
            )?;
        }
        write!(f, ")")
    }
}

/// Lazy sequence of the offsets of a [`KernelRegion`].
#[derive(Debug, Clone)]
pub struct RegionIter<'a> {
    region: &'a KernelRegion,
    lower: Offset,
    step: Offset,
    front: usize,
    back: usize,
}

impl RegionIter<'_> {
    /// Total number of offsets, independent of iteration progress.
    pub fn volume(&self) -> usize {
        self.region.volume()
    }

    /// The offset with index `index`, or `None` past the end.
    pub fn offset_at(&self, index: usize) -> Option<Offset> {
        if index >= self.region.volume() {
            return None;
        }
        let dimension = self.region.dimension();
        let offset = match self.region.region_type {
            RegionType::HyperCube => {
                let mut rem = index;
                let mut offset = Offset::with_capacity(dimension);
                for axis in 0..dimension {
                    let k = self.region.kernel_size[axis] as usize;
                    let i = (rem % k) as i64;
                    rem /= k;
                    // Lies within [lower, upper], both checked to fit.
                    let value = i64::from(self.lower[axis]) + i * i64::from(self.step[axis]);
                    offset.push(value as Coord);
                }
                offset
            }
            RegionType::HyperCross => {
                let mut offset: Offset = smallvec::smallvec![0; dimension];
                if index > 0 {
                    let mut rem = index - 1;
                    for axis in 0..dimension {
                        let arms = self.region.kernel_size[axis] as usize - 1;
                        if rem < arms {
                            let r = (arms / 2) as Coord;
                            let i = rem as Coord;
                            // -r..-1 then 1..r
                            let j = if i < r { i - r } else { i - r + 1 };
                            offset[axis] = j * self.step[axis];
                            break;
                        }
                        rem -= arms;
                    }
                }
                offset
            }
            RegionType::Custom => {
                let start = index * dimension;
                Offset::from_slice(&self.region.offsets[start..start + dimension])
            }
        };
        Some(offset)
    }

    /// A fresh iterator over the same region from the first offset.
    pub fn restart(&self) -> Self {
        Self {
            front: 0,
            back: self.region.volume(),
            ..self.clone()
        }
    }
}

impl Iterator for RegionIter<'_> {
    type Item = Offset;

    fn next(&mut self) -> Option<Offset> {
        if self.front >= self.back {
            return None;
        }
        let offset = self.offset_at(self.front);
        self.front += 1;
        offset
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }

    fn nth(&mut self, n: usize) -> Option<Offset> {
        self.front = self.front.saturating_add(n).min(self.back);
        self.next()
    }
}

impl DoubleEndedIterator for RegionIter<'_> {
    fn next_back(&mut self) -> Option<Offset> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        self.offset_at(self.back)
    }
}

impl ExactSizeIterator for RegionIter<'_> {}

impl FusedIterator for RegionIter<'_> {}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn collect(region: &KernelRegion, tensor_stride: &[u32]) -> Vec<Vec<Coord>> {
        region
            .offsets(tensor_stride)
            .unwrap()
            .map(|o| o.to_vec())
            .collect()
    }

    #[test]
    fn test_hypercube_odd_centered() {
        let region = KernelRegion::cubic(2, 3, 1, 1).unwrap();
        assert_eq!(region.volume(), 9);
        let offsets = collect(&region, &[1, 1]);
        assert_eq!(offsets.len(), 9);
        // Axis 0 varies fastest.
        assert_eq!(offsets[0], vec![-1, -1]);
        assert_eq!(offsets[1], vec![0, -1]);
        assert_eq!(offsets[2], vec![1, -1]);
        assert_eq!(offsets[4], vec![0, 0]);
        assert_eq!(offsets[8], vec![1, 1]);
    }

    #[test]
    fn test_hypercube_even_starts_at_zero() {
        let region = KernelRegion::cubic(1, 2, 2, 1).unwrap();
        assert_eq!(collect(&region, &[1]), vec![vec![0], vec![1]]);
        assert_eq!(collect(&region, &[4]), vec![vec![0], vec![4]]);
    }

    #[test]
    fn test_hypercube_scaled_by_stride_and_dilation() {
        let region = KernelRegion::hypercube(vec![3, 1], vec![1, 1], vec![2, 1]).unwrap();
        assert_eq!(region.volume(), 3);
        assert_eq!(
            collect(&region, &[2, 2]),
            vec![vec![-4, 0], vec![0, 0], vec![4, 0]]
        );
    }

    #[test]
    fn test_hypercross() {
        let region = KernelRegion::new(
            vec![3, 5],
            vec![1, 1],
            vec![1, 1],
            RegionType::HyperCross,
            vec![],
        )
        .unwrap();
        assert_eq!(region.volume(), 1 + 2 + 4);
        assert_eq!(
            collect(&region, &[1, 1]),
            vec![
                vec![0, 0],
                vec![-1, 0],
                vec![1, 0],
                vec![0, -2],
                vec![0, -1],
                vec![0, 1],
                vec![0, 2],
            ]
        );
    }

    #[test]
    fn test_hypercross_rejects_even() {
        let err = KernelRegion::new(
            vec![2, 3],
            vec![1, 1],
            vec![1, 1],
            RegionType::HyperCross,
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, CoordinateMapError::InvalidKernel { .. }));
    }

    #[test]
    fn test_custom_verbatim() {
        let region = KernelRegion::new(
            vec![1, 1],
            vec![1, 1],
            vec![1, 1],
            RegionType::Custom,
            vec![0, 0, 5, -3, 1, 1],
        )
        .unwrap();
        assert_eq!(region.volume(), 3);
        // Custom offsets ignore the tensor stride.
        assert_eq!(
            collect(&region, &[4, 4]),
            vec![vec![0, 0], vec![5, -3], vec![1, 1]]
        );
    }

    #[test]
    fn test_custom_dimension_mismatch() {
        let err = KernelRegion::new(
            vec![1, 1],
            vec![1, 1],
            vec![1, 1],
            RegionType::Custom,
            vec![0, 0, 1],
        )
        .unwrap_err();
        assert_eq!(
            err,
            CoordinateMapError::InvalidDims {
                expected: 2,
                got: 3
            }
        );
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!(KernelRegion::hypercube(vec![3, 3], vec![1], vec![1, 1]).is_err());
        assert!(KernelRegion::hypercube(vec![0], vec![1], vec![1]).is_err());
        assert!(KernelRegion::hypercube(vec![], vec![], vec![]).is_err());
        assert!(
            KernelRegion::new(vec![3], vec![1], vec![1], RegionType::HyperCube, vec![1]).is_err()
        );
    }

    #[test]
    fn test_offsets_wrong_stride_dimension() {
        let region = KernelRegion::cubic(3, 3, 1, 1).unwrap();
        assert!(region.offsets(&[1, 1]).is_err());
    }

    #[test]
    fn test_offsets_overflow() {
        let region = KernelRegion::cubic(1, 5, 1, u32::MAX).unwrap();
        assert!(region.offsets(&[2]).is_err());
    }

    #[test]
    fn test_restartable_and_random_access() {
        let region = KernelRegion::cubic(3, 3, 1, 1).unwrap();
        let mut iter = region.offsets(&[1, 1, 1]).unwrap();
        assert_eq!(iter.len(), 27);
        let first: Vec<_> = iter.by_ref().take(5).collect();
        assert_eq!(iter.len(), 22);
        let again: Vec<_> = iter.restart().take(5).collect();
        assert_eq!(first, again);
        assert_eq!(iter.offset_at(13).unwrap().to_vec(), vec![0, 0, 0]);
        assert_eq!(iter.offset_at(27), None);

        let reversed: Vec<_> = iter.restart().rev().collect();
        let mut forward: Vec<_> = iter.restart().collect();
        forward.reverse();
        assert_eq!(reversed, forward);
    }

    #[test]
    fn test_offsets_are_distinct() {
        let region = KernelRegion::hypercube(vec![3, 2, 5], vec![1, 1, 1], vec![1, 2, 1]).unwrap();
        let offsets: HashSet<_> = region.offsets(&[1, 1, 1]).unwrap().collect();
        assert_eq!(offsets.len(), region.volume());
    }

    #[test]
    fn test_display() {
        let region = KernelRegion::cubic(2, 3, 2, 1).unwrap();
        assert_eq!(
            region.to_string(),
            "hypercube(size=[3, 3], stride=[2, 2], dilation=[1, 1])"
        );
        let custom = KernelRegion::new(
            vec![1, 1],
            vec![1, 1],
            vec![1, 1],
            RegionType::Custom,
            vec![0, 1, -2, 3],
        )
        .unwrap();
        assert_eq!(
            custom.to_string(),
            "custom(size=[1, 1], stride=[1, 1], dilation=[1, 1], offsets=[(0, 1), (-2, 3)])"
        );
    }

    #[test]
    fn test_volume_overflow() {
        assert!(matches!(
            KernelRegion::cubic(5, 65536, 1, 1),
            Err(CoordinateMapError::InvalidKernel { .. })
        ));
        assert_eq!(KernelRegion::cubic(4, 255, 1, 1).unwrap().volume(), 255usize.pow(4));
    }
}
