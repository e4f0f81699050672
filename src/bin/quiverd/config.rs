// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Configuration loading for the daemon.
//!
//! The configuration starts from the library defaults, is optionally
//! overlaid with a TOML file (whose keys mirror the [`Config`] field
//! names), and finally picks up any command-line overrides.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::debug;

use quiver::config::Config;

use crate::args::RunArgs;

/// Builds the effective configuration from the run arguments.
pub fn load(args: &RunArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => load_from_path(path)?,
        None => Config::default(),
    };

    if let Some(port) = args.udp_port {
        config.udp_listener_port = port;
    }
    if let Some(port) = args.tcp_port {
        config.tcp_listener_port = port;
    }
    if let Some(threads) = args.threads {
        config.process_thread_count = threads;
    }
    if let Some(path) = &args.query_log_path {
        config.query_log_path = path.clone();
    }
    if let Some(path) = &args.app_log_path {
        config.app_log_path = path.clone();
    }

    config
        .validate()
        .context("invalid configuration")?;
    debug!(
        "configuration loaded: {} shard(s), udp {}:{}, tcp {}:{}",
        config.process_thread_count,
        if config.udp_enable { "on" } else { "off" },
        config.udp_listener_port,
        if config.tcp_enable { "on" } else { "off" },
        config.tcp_listener_port,
    );
    Ok(config)
}

fn load_from_path(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read the configuration file {}", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse the configuration file {}", path.display()))
}
