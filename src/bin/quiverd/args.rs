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

//! Implements command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Parses the command line arguments.
pub fn parse() -> Args {
    Args::parse()
}

/// The Quiver authoritative DNS server
#[derive(Debug, Parser)]
#[command(author, version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server
    Run(RunArgs),
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Set the configuration file to use
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the UDP listener port
    #[arg(long, value_name = "PORT")]
    pub udp_port: Option<u16>,

    /// Override the TCP listener port
    #[arg(long, value_name = "PORT")]
    pub tcp_port: Option<u16>,

    /// Override the number of shard threads
    #[arg(long, value_name = "COUNT")]
    pub threads: Option<usize>,

    /// Override the directory holding the query logs
    #[arg(long, value_name = "DIR")]
    pub query_log_path: Option<PathBuf>,

    /// Override the directory holding the application log
    #[arg(long, value_name = "DIR")]
    pub app_log_path: Option<PathBuf>,
}
