/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for coordinate map managers.
//!
//! A [`Config`] records only the values that were explicitly set; the
//! accessors fall back to documented defaults. Values come from
//! environment variables ([`from_env`]), from serialized files, or
//! from code, and are layered with [`merge`]. Managers built with
//! [`CoordinateMapManager::new`](crate::CoordinateMapManager::new)
//! read the process-wide configuration in [`global`].

use std::env;
use std::fmt::Display;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::modes::Algorithm;
use crate::modes::CoordinateMapBackend;
use crate::modes::GpuMemoryAllocator;

/// Output map size from which `Algorithm::Default` scans in parallel.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 4096;

pub const ALGORITHM_ENV: &str = "COORDMAP_ALGORITHM";
pub const NUM_THREADS_ENV: &str = "COORDMAP_NUM_THREADS";
pub const PARALLEL_THRESHOLD_ENV: &str = "COORDMAP_PARALLEL_THRESHOLD";
pub const KERNEL_MAP_CACHE_ENV: &str = "COORDMAP_KERNEL_MAP_CACHE";
pub const BACKEND_ENV: &str = "COORDMAP_BACKEND";
pub const GPU_ALLOCATOR_ENV: &str = "COORDMAP_GPU_ALLOCATOR";

/// Manager configuration. Unset fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<Algorithm>,
    /// Size of a dedicated thread pool; 0 uses the rayon global pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_threshold: Option<usize>,
    /// Whether kernel maps are cached per manager.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_map_cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<CoordinateMapBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_allocator: Option<GpuMemoryAllocator>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm.unwrap_or_default()
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads.unwrap_or(0)
    }

    pub fn parallel_threshold(&self) -> usize {
        self.parallel_threshold.unwrap_or(DEFAULT_PARALLEL_THRESHOLD)
    }

    pub fn kernel_map_cache(&self) -> bool {
        self.kernel_map_cache.unwrap_or(true)
    }

    pub fn backend(&self) -> CoordinateMapBackend {
        self.backend.unwrap_or_default()
    }

    pub fn gpu_allocator(&self) -> GpuMemoryAllocator {
        self.gpu_allocator.unwrap_or_default()
    }

    /// Whether no value has been set explicitly.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Reads every variable through `lookup`. Values that fail to
    /// parse are skipped with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            algorithm: parse_var(&lookup, ALGORITHM_ENV),
            num_threads: parse_var(&lookup, NUM_THREADS_ENV),
            parallel_threshold: parse_var(&lookup, PARALLEL_THRESHOLD_ENV),
            kernel_map_cache: parse_var::<Flag>(&lookup, KERNEL_MAP_CACHE_ENV).map(|f| f.0),
            backend: parse_var(&lookup, BACKEND_ENV),
            gpu_allocator: parse_var(&lookup, GPU_ALLOCATOR_ENV),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("ignoring {}={:?}: {}", name, raw, err);
            None
        }
    }
}

/// Boolean accepting the spellings commonly used in environment
/// variables.
struct Flag(bool);

impl FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Flag(true)),
            "0" | "false" | "no" | "off" => Ok(Flag(false)),
            _ => Err(format!("expected a boolean, got `{}`", s)),
        }
    }
}

/// Load configuration from environment variables.
pub fn from_env() -> Config {
    Config::from_lookup(|name| env::var(name).ok())
}

/// Merge with another configuration, with the other taking precedence.
pub fn merge(config: &mut Config, other: &Config) {
    if other.algorithm.is_some() {
        config.algorithm = other.algorithm;
    }
    if other.num_threads.is_some() {
        config.num_threads = other.num_threads;
    }
    if other.parallel_threshold.is_some() {
        config.parallel_threshold = other.parallel_threshold;
    }
    if other.kernel_map_cache.is_some() {
        config.kernel_map_cache = other.kernel_map_cache;
    }
    if other.backend.is_some() {
        config.backend = other.backend;
    }
    if other.gpu_allocator.is_some() {
        config.gpu_allocator = other.gpu_allocator;
    }
}

/// Global configuration functions
pub mod global {
    use std::sync::Arc;
    use std::sync::LazyLock;
    use std::sync::Mutex;
    use std::sync::MutexGuard;
    use std::sync::PoisonError;
    use std::sync::RwLock;

    use super::*;

    /// Global configuration instance, initialized from environment variables.
    static CONFIG: LazyLock<Arc<RwLock<Config>>> =
        LazyLock::new(|| Arc::new(RwLock::new(from_env())));

    /// Serializes tests that modify the global configuration.
    static LOCK: Mutex<()> = Mutex::new(());

    /// A snapshot of the global configuration.
    pub fn get() -> Config {
        CONFIG
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the global configuration.
    pub fn set(config: Config) {
        *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Reset the global configuration to defaults (for testing only)
    pub fn reset_to_defaults() {
        set(Config::default());
    }

    /// Acquire the global configuration lock for testing.
    pub fn lock() -> ConfigLock {
        ConfigLock {
            _guard: LOCK.lock().unwrap_or_else(PoisonError::into_inner),
            config: CONFIG.clone(),
        }
    }

    /// Exclusive access to the global configuration. Overrides made
    /// through the lock are undone when their guard drops.
    pub struct ConfigLock {
        _guard: MutexGuard<'static, ()>,
        config: Arc<RwLock<Config>>,
    }

    impl ConfigLock {
        /// Merges `overrides` into the global configuration until the
        /// returned guard is dropped.
        pub fn override_with(&self, overrides: &Config) -> ConfigValueGuard<'_> {
            let mut current = self.config.write().unwrap_or_else(PoisonError::into_inner);
            let previous = current.clone();
            merge(&mut current, overrides);
            ConfigValueGuard {
                lock: self,
                previous: Some(previous),
            }
        }
    }

    /// Restores the configuration in effect before an override.
    pub struct ConfigValueGuard<'a> {
        lock: &'a ConfigLock,
        previous: Option<Config>,
    }

    impl Drop for ConfigValueGuard<'_> {
        fn drop(&mut self) {
            if let Some(previous) = self.previous.take() {
                *self
                    .lock
                    .config
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = previous;
            }
        }
    }
}
