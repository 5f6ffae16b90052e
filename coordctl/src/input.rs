/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Coordinate text files: one coordinate per line, `batch x_1 .. x_D`,
//! separated by whitespace or commas. `#` starts a comment.

use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use coordmap::Coord;

/// Parses `text` into a flat `N x coordinate_size` buffer.
pub fn parse_coordinates(text: &str, coordinate_size: usize) -> Result<Vec<Coord>> {
    let mut coordinates = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default();
        let values = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .map(|token| {
                token
                    .parse::<Coord>()
                    .with_context(|| format!("line {}: invalid coordinate `{}`", index + 1, token))
            })
            .collect::<Result<Vec<_>>>()?;
        if values.is_empty() {
            continue;
        }
        if values.len() != coordinate_size {
            bail!(
                "line {}: expected {} values (batch and {} spatial), got {}",
                index + 1,
                coordinate_size,
                coordinate_size - 1,
                values.len()
            );
        }
        coordinates.extend(values);
    }
    Ok(coordinates)
}

pub fn read_coordinates(path: &Path, coordinate_size: usize) -> Result<Vec<Coord>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_coordinates(&text, coordinate_size)
        .with_context(|| format!("failed to parse {}", path.display()))
}

/// Expands a per-axis argument: a single value applies to every axis.
pub fn per_axis(values: &[u32], dimension: usize, name: &str) -> Result<Vec<u32>> {
    match values.len() {
        0 => Ok(vec![1; dimension]),
        1 => Ok(vec![values[0]; dimension]),
        n if n == dimension => Ok(values.to_vec()),
        n => bail!("--{} has {} values, expected 1 or {}", name, n, dimension),
    }
}
