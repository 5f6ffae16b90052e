/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Registry keys for coordinate maps.
//!
//! A [`StrideKey`] names one coordinate map inside a manager: the
//! tensor stride of its lattice plus a free-form tag that separates
//! maps sharing a stride (for example a union or a region-expanded
//! map). A [`CoordinateMapKey`] is the handle callers hold; it starts
//! out unset and is bound to a `StrideKey` by the manager operations
//! that create or resolve maps.

use std::fmt;

use itertools::Itertools;
use serde::Deserialize;
use serde::Serialize;

use crate::error::CoordinateMapError;

/// Registry key: tensor stride plus tag. Two keys are equal iff both
/// fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrideKey {
    tensor_stride: Vec<u32>,
    tag: String,
}

impl StrideKey {
    pub fn new(tensor_stride: Vec<u32>, tag: impl Into<String>) -> Self {
        Self {
            tensor_stride,
            tag: tag.into(),
        }
    }

    pub fn tensor_stride(&self) -> &[u32] {
        &self.tensor_stride
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Spatial dimension `D`.
    pub fn dimension(&self) -> usize {
        self.tensor_stride.len()
    }

    /// Whether this key names an origin map (all-zero stride).
    pub fn is_origin(&self) -> bool {
        !self.tensor_stride.is_empty() && self.tensor_stride.iter().all(|&s| s == 0)
    }
}

impl fmt::Display for StrideKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.tensor_stride.iter().join(", "))?;
        if !self.tag.is_empty() {
            write!(f, " {:?}", self.tag)?;
        }
        Ok(())
    }
}

/// Checks that `tensor_stride` is a valid stride for `dimension`
/// spatial axes: one positive entry per axis.
pub(crate) fn validate_stride(
    tensor_stride: &[u32],
    dimension: usize,
) -> Result<(), CoordinateMapError> {
    if tensor_stride.len() != dimension {
        return Err(CoordinateMapError::InvalidDims {
            expected: dimension,
            got: tensor_stride.len(),
        });
    }
    if tensor_stride.contains(&0) {
        return Err(CoordinateMapError::InvalidStride {
            stride: tensor_stride.to_vec(),
            reason: "every component must be positive".to_string(),
        });
    }
    Ok(())
}

/// Caller-side handle to a coordinate map.
///
/// The handle is either unset (freshly constructed, naming nothing)
/// or set to a [`StrideKey`]. Operations that need an existing map
/// fail with [`CoordinateMapError::KeyNotSet`] on an unset handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoordinateMapKey {
    coordinate_size: usize,
    key: Option<StrideKey>,
}

impl CoordinateMapKey {
    /// An unset handle for coordinates of `coordinate_size = D + 1`
    /// components.
    pub fn new(coordinate_size: usize) -> Self {
        Self {
            coordinate_size,
            key: None,
        }
    }

    pub(crate) fn bound(coordinate_size: usize, key: StrideKey) -> Self {
        Self {
            coordinate_size,
            key: Some(key),
        }
    }

    pub fn is_key_set(&self) -> bool {
        self.key.is_some()
    }

    pub fn get_coordinate_size(&self) -> usize {
        self.coordinate_size
    }

    pub fn get_key(&self) -> Result<&StrideKey, CoordinateMapError> {
        self.key.as_ref().ok_or(CoordinateMapError::KeyNotSet)
    }

    pub fn get_tensor_stride(&self) -> Result<&[u32], CoordinateMapError> {
        Ok(self.get_key()?.tensor_stride())
    }

    /// Binds the handle to `(tensor_stride, tag)`.
    pub fn set_key(
        &mut self,
        tensor_stride: Vec<u32>,
        tag: impl Into<String>,
    ) -> Result<(), CoordinateMapError> {
        let dimension = self.coordinate_size.saturating_sub(1);
        if tensor_stride.len() != dimension {
            return Err(CoordinateMapError::InvalidDims {
                expected: dimension,
                got: tensor_stride.len(),
            });
        }
        self.key = Some(StrideKey::new(tensor_stride, tag));
        Ok(())
    }

    pub(crate) fn bind(&mut self, key: StrideKey) {
        self.key = Some(key);
    }
}

impl fmt::Display for CoordinateMapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "coordinate map key:{}", key),
            None => write!(f, "coordinate map key:unset"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_key_equality() {
        let a = StrideKey::new(vec![2, 2], "");
        let b = StrideKey::new(vec![2, 2], "");
        let c = StrideKey::new(vec![2, 2], "other");
        let d = StrideKey::new(vec![2, 4], "");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_stride_key_display() {
        assert_eq!(StrideKey::new(vec![1, 2, 4], "").to_string(), "[1, 2, 4]");
        assert_eq!(
            StrideKey::new(vec![2, 2], "union").to_string(),
            "[2, 2] \"union\""
        );
    }

    #[test]
    fn test_origin_key() {
        assert!(StrideKey::new(vec![0, 0], "").is_origin());
        assert!(!StrideKey::new(vec![1, 0], "").is_origin());
    }

    #[test]
    fn test_handle_state() {
        let mut key = CoordinateMapKey::new(4);
        assert!(!key.is_key_set());
        assert_eq!(key.get_key(), Err(CoordinateMapError::KeyNotSet));
        assert_eq!(key.to_string(), "coordinate map key:unset");

        key.set_key(vec![1, 1, 1], "").unwrap();
        assert!(key.is_key_set());
        assert_eq!(key.get_tensor_stride().unwrap(), &[1, 1, 1]);
        assert_eq!(key.get_coordinate_size(), 4);
        assert_eq!(key.to_string(), "coordinate map key:[1, 1, 1]");
    }

    #[test]
    fn test_set_key_rejects_wrong_dimension() {
        let mut key = CoordinateMapKey::new(3);
        assert_eq!(
            key.set_key(vec![1, 1, 1], ""),
            Err(CoordinateMapError::InvalidDims {
                expected: 2,
                got: 3
            })
        );
        assert!(!key.is_key_set());
    }

    #[test]
    fn test_validate_stride() {
        assert!(validate_stride(&[1, 2], 2).is_ok());
        assert!(matches!(
            validate_stride(&[1, 0], 2),
            Err(CoordinateMapError::InvalidStride { .. })
        ));
        assert!(matches!(
            validate_stride(&[1], 2),
            Err(CoordinateMapError::InvalidDims { .. })
        ));
    }
}
