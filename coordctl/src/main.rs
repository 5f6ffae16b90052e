/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Inspect coordinate files with the coordinate map engine.
//!
//! ```text
//! coordctl info points.txt --dimension 3
//! coordctl stride points.txt --dimension 3 --stride 2
//! coordctl kernel-map points.txt --dimension 3 --kernel-size 3 --json
//! ```

mod input;

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use coordmap::Config;
use coordmap::CoordinateMapKey;
use coordmap::CoordinateMapManager;
use coordmap::KernelMap;
use coordmap::KernelRegion;
use coordmap::RegionType;
use coordmap::StrideKey;
use serde::Serialize;
use tabwriter::TabWriter;

#[derive(Parser, Debug)]
#[command(name = "coordctl", about = "Inspect sparse coordinate maps and kernel maps")]
struct Cli {
    /// JSON configuration file, merged over the COORDMAP_* environment
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Summarize a coordinate file
    Info(InputArgs),

    /// Derive the coordinate map at a coarser tensor stride
    Stride {
        #[command(flatten)]
        input: InputArgs,

        /// Stride multiplier, one value or one per axis
        #[arg(long, value_delimiter = ',', required = true)]
        stride: Vec<u32>,

        /// Print the map as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compute the kernel map of a convolution over the file
    KernelMap(KernelMapArgs),
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Coordinate file: `batch x_1 .. x_D` per line
    file: PathBuf,

    /// Spatial dimension D
    #[arg(short, long)]
    dimension: usize,

    /// Tensor stride of the coordinates in the file
    #[arg(long, value_delimiter = ',')]
    tensor_stride: Vec<u32>,
}

#[derive(Args, Debug)]
struct KernelMapArgs {
    #[command(flatten)]
    input: InputArgs,

    #[arg(long, value_delimiter = ',', required = true)]
    kernel_size: Vec<u32>,

    #[arg(long, value_delimiter = ',')]
    kernel_stride: Vec<u32>,

    #[arg(long, value_delimiter = ',')]
    dilation: Vec<u32>,

    /// hypercube or hypercross
    #[arg(long, default_value_t = RegionType::HyperCube)]
    region: RegionType,

    /// Map to a finer stride, generating the output coordinates
    #[arg(long)]
    transpose: bool,

    /// Print the full kernel map as JSON
    #[arg(long)]
    json: bool,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = coordmap::config::from_env();
    if let Some(path) = path {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let file: Config = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        coordmap::config::merge(&mut config, &file);
    }
    Ok(config)
}

/// A manager holding the file's coordinates.
fn load(
    input: &InputArgs,
    config: Config,
) -> Result<(CoordinateMapManager, CoordinateMapKey, usize)> {
    if input.dimension == 0 {
        anyhow::bail!("--dimension must be positive");
    }
    let coordinate_size = input.dimension + 1;
    let coordinates = input::read_coordinates(&input.file, coordinate_size)?;
    let tensor_stride = input::per_axis(&input.tensor_stride, input.dimension, "tensor-stride")?;
    let mut manager = CoordinateMapManager::with_config(coordinate_size, config)?;
    let key = manager.initialize(&coordinates, tensor_stride, "")?;
    tracing::info!(
        file = %input.file.display(),
        rows = coordinates.len() / coordinate_size,
        "loaded coordinates"
    );
    Ok((manager, key, coordinates.len() / coordinate_size))
}

#[derive(Serialize)]
struct MapReport<'a> {
    key: &'a StrideKey,
    size: usize,
    coordinates: Vec<Vec<coordmap::Coord>>,
}

#[derive(Serialize)]
struct KernelMapReport<'a> {
    input: &'a StrideKey,
    output: &'a StrideKey,
    region: String,
    transpose: bool,
    kernel_map: &'a KernelMap,
}

fn run(cli: Cli, out: &mut impl Write) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Info(input) => info(&input, config, out),
        Command::Stride {
            input,
            stride: multiplier,
            json,
        } => stride(&input, &multiplier, json, config, out),
        Command::KernelMap(args) => kernel_map(&args, config, out),
    }
}

fn info(input: &InputArgs, config: Config, out: &mut impl Write) -> Result<()> {
    let (mut manager, key, rows) = load(input, config)?;
    let unique = manager.size(&key)?;
    let batches = manager.origin_map_size(&key)?;
    let mut tw = TabWriter::new(out);
    writeln!(tw, "rows read:\t{}", rows)?;
    writeln!(tw, "unique rows:\t{}", unique)?;
    writeln!(tw, "batches:\t{}", batches)?;
    writeln!(tw, "dimension:\t{}", manager.dimension())?;
    writeln!(tw, "maps:\t{}", manager.len())?;
    tw.flush()?;
    Ok(())
}

fn stride(
    input: &InputArgs,
    multiplier: &[u32],
    json: bool,
    config: Config,
    out: &mut impl Write,
) -> Result<()> {
    let (mut manager, key, _) = load(input, config)?;
    let multiplier = input::per_axis(multiplier, manager.dimension(), "stride")?;
    let strided = manager.stride(&key, &multiplier)?;
    let map = manager.coordinate_map(&strided)?;
    if json {
        let report = MapReport {
            key: strided.get_key()?,
            size: map.len(),
            coordinates: map.iter().map(|(_, c)| c.to_vec()).collect(),
        };
        serde_json::to_writer_pretty(&mut *out, &report)?;
        writeln!(out)?;
        return Ok(());
    }
    write!(out, "{:#}", map)?;
    Ok(())
}

fn kernel_map(args: &KernelMapArgs, config: Config, out: &mut impl Write) -> Result<()> {
    let (mut manager, in_key, _) = load(&args.input, config)?;
    let dimension = manager.dimension();
    let region = KernelRegion::new(
        input::per_axis(&args.kernel_size, dimension, "kernel-size")?,
        input::per_axis(&args.kernel_stride, dimension, "kernel-stride")?,
        input::per_axis(&args.dilation, dimension, "dilation")?,
        args.region,
        Vec::new(),
    )?;
    let mut out_key = CoordinateMapKey::new(manager.coordinate_size());
    manager.output_key(&in_key, &mut out_key, &region, args.transpose, args.transpose)?;
    let kernel_map = manager.kernel_map(&in_key, &out_key, &region, args.transpose)?;
    tracing::debug!(stats = ?manager.stats(), "kernel map ready");

    if args.json {
        let report = KernelMapReport {
            input: in_key.get_key()?,
            output: out_key.get_key()?,
            region: region.to_string(),
            transpose: args.transpose,
            kernel_map: &kernel_map,
        };
        serde_json::to_writer_pretty(&mut *out, &report)?;
        writeln!(out)?;
        return Ok(());
    }

    let lattice = if args.transpose {
        out_key.get_tensor_stride()?
    } else {
        in_key.get_tensor_stride()?
    };
    let offsets = region.offsets(lattice)?;
    let mut tw = TabWriter::new(out);
    writeln!(tw, "{}", region)?;
    writeln!(
        tw,
        "input {} ({} rows) -> output {} ({} rows)",
        in_key.get_key()?,
        manager.size(&in_key)?,
        out_key.get_key()?,
        manager.size(&out_key)?
    )?;
    writeln!(tw, "INDEX\tOFFSET\tPAIRS")?;
    for ((k, ins, _), offset) in kernel_map.iter().zip(offsets) {
        writeln!(tw, "{}\t{:?}\t{}", k, offset.as_slice(), ins.len())?;
    }
    writeln!(tw, "total\t\t{}", kernel_map.len())?;
    tw.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    coordmap_telemetry::initialize_logging();
    let cli = Cli::parse();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run(cli, &mut out)
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;

    fn coordinate_file(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", text).unwrap();
        file
    }

    fn run_args(args: &[&str]) -> Result<String> {
        let cli = Cli::try_parse_from(std::iter::once("coordctl").chain(args.iter().copied()))?;
        let mut out = Vec::new();
        run(cli, &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn test_info() {
        let file = coordinate_file("0 0 0\n0 1 0\n0 0 0\n1 5 5\n");
        let path = file.path().to_str().unwrap();
        let output = run_args(&["info", path, "--dimension", "2"]).unwrap();
        assert!(output.contains("rows read:    4"), "{}", output);
        assert!(output.contains("unique rows:  3"), "{}", output);
        assert!(output.contains("batches:      2"), "{}", output);
    }

    #[test]
    fn test_stride() {
        let file = coordinate_file("0 0\n0 1\n0 2\n0 3\n");
        let path = file.path().to_str().unwrap();
        let output = run_args(&["stride", path, "-d", "1", "--stride", "2"]).unwrap();
        assert_eq!(
            output,
            "CoordinateMap(size=2, tensor_stride=[2])\n  0: (0, 0)\n  1: (0, 2)\n"
        );

        let json = run_args(&["stride", path, "-d", "1", "--stride", "2", "--json"]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["size"], 2);
        assert_eq!(value["key"]["tensor_stride"], serde_json::json!([2]));
        assert_eq!(value["coordinates"], serde_json::json!([[0, 0], [0, 2]]));
    }

    #[test]
    fn test_kernel_map_table() {
        let file = coordinate_file("0 0 0\n0 1 0\n0 2 0\n");
        let path = file.path().to_str().unwrap();
        let output =
            run_args(&["kernel-map", path, "-d", "2", "--kernel-size", "3,1"]).unwrap();
        assert!(output.starts_with("hypercube(size=[3, 1]"), "{}", output);
        assert!(output.contains("INDEX"), "{}", output);
        assert!(output.lines().last().unwrap().ends_with("7"), "{}", output);
    }

    #[test]
    fn test_kernel_map_json() {
        let file = coordinate_file("0 0\n0 4\n");
        let path = file.path().to_str().unwrap();
        let json = run_args(&[
            "kernel-map",
            path,
            "-d",
            "1",
            "--tensor-stride",
            "4",
            "--kernel-size",
            "2",
            "--kernel-stride",
            "2",
            "--transpose",
            "--json",
        ])
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["transpose"], true);
        assert_eq!(value["output"]["tensor_stride"], serde_json::json!([2]));
        assert_eq!(
            value["kernel_map"]["in_maps"],
            serde_json::json!([[0, 1], [0, 1]])
        );
    }

    #[test]
    fn test_config_file() {
        let file = coordinate_file("0 0\n");
        let path = file.path().to_str().unwrap();
        let config = coordinate_file(r#"{"backend": "cuda"}"#);
        let err = run_args(&[
            "info",
            path,
            "-d",
            "1",
            "--config",
            config.path().to_str().unwrap(),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cuda"), "{}", err);

        let broken = coordinate_file("{");
        let broken_path = broken.path().to_str().unwrap();
        assert!(run_args(&["info", path, "-d", "1", "--config", broken_path]).is_err());
    }

    #[test]
    fn test_invalid_arguments() {
        let file = coordinate_file("0 0 0\n");
        let path = file.path().to_str().unwrap();
        assert!(run_args(&["kernel-map", path, "-d", "2", "--kernel-size", "3,3,3"]).is_err());
        assert!(run_args(&["info", path, "-d", "0"]).is_err());
        assert!(run_args(&["info", path, "-d", "1"]).is_err());
        assert!(
            run_args(&[
                "kernel-map",
                path,
                "-d",
                "2",
                "--kernel-size",
                "2",
                "--region",
                "hypercross"
            ])
            .is_err()
        );
    }
}
