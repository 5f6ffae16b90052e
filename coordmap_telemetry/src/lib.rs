/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process-wide `tracing` setup for coordmap binaries.
//!
//! The `coordmap` library only emits events; binaries call
//! [`initialize_logging`] once to install a subscriber. The filter
//! is read from `COORDMAP_LOG` (env-filter syntax, default `info`)
//! and `COORDMAP_LOG_FORMAT=json` switches the output to one JSON
//! object per line.

use std::env;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;

/// Filter directives, in `EnvFilter` syntax.
pub const LOG_ENV: &str = "COORDMAP_LOG";
/// Output format: `plain` (default) or `json`.
pub const LOG_FORMAT_ENV: &str = "COORDMAP_LOG_FORMAT";

const DEFAULT_DIRECTIVE: &str = "info";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber. Later calls do nothing.
pub fn initialize_logging() {
    INITIALIZED.get_or_init(|| {
        let format = LogFormat::parse(env::var(LOG_FORMAT_ENV).ok().as_deref());
        let filter = env_filter(env::var(LOG_ENV).ok().as_deref());
        let subscriber = Registry::default().with(fmt_layer(format).with_filter(filter));
        if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("coordmap_telemetry: failed to install subscriber: {}", err);
        }
    });
}

/// The filter for `directives`, falling back to `info` when they are
/// absent or fail to parse.
pub fn env_filter(directives: Option<&str>) -> EnvFilter {
    match directives.map(EnvFilter::try_new) {
        Some(Ok(filter)) => filter,
        Some(Err(err)) => {
            eprintln!(
                "coordmap_telemetry: ignoring invalid {}: {}",
                LOG_ENV, err
            );
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }
        None => EnvFilter::new(DEFAULT_DIRECTIVE),
    }
}

/// A fmt layer writing to stderr in the requested format.
pub fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    match format {
        LogFormat::Plain => layer.boxed(),
        LogFormat::Json => layer.json().with_current_span(true).boxed(),
    }
}
