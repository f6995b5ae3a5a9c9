/*
 * Copyright (C) 2024 The vmctl Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

/// Reconciles VirtualMachine resources against a compute backend.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct VmCtl {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the controller until interrupted
    Run(RunArgs),

    /// Print the current leader lease
    Lease(LeaseArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Base URL of the compute backend [env: VMCTL_BACKEND_URL]
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Number of parallel reconcile workers [env: VMCTL_WORKERS]
    #[arg(long)]
    pub workers: Option<usize>,

    /// File holding the leader lease, shared by all replicas [env: VMCTL_LEASE_PATH]
    #[arg(long)]
    pub lease_path: Option<PathBuf>,

    /// Directory of VirtualMachine manifests (*.json) [env: VMCTL_MANIFEST_DIR]
    #[arg(long)]
    pub manifest_dir: Option<PathBuf>,

    /// How often the manifest directory is rescanned
    #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,

    /// Serve /metrics and /healthz on this address
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,

    /// Identity used in the lease (defaults to <hostname>_<random>)
    #[arg(long)]
    pub identity: Option<String>,

    /// How long a lease stays valid without renewal
    #[arg(long, value_parser = humantime::parse_duration)]
    pub lease_duration: Option<Duration>,

    /// How long the leader keeps trying to renew before stepping down
    #[arg(long, value_parser = humantime::parse_duration)]
    pub renew_deadline: Option<Duration>,

    /// Pause between lease acquisition or renewal attempts
    #[arg(long, value_parser = humantime::parse_duration)]
    pub retry_period: Option<Duration>,

    /// How long to wait for the first manifest scan before giving up
    #[arg(long, value_parser = humantime::parse_duration)]
    pub cache_sync_timeout: Option<Duration>,

    /// Log output format: text or json [env: VMCTL_LOG_FORMAT]
    #[arg(long)]
    pub log_format: Option<String>,
}

#[derive(Args)]
pub struct LeaseArgs {
    /// File holding the leader lease [env: VMCTL_LEASE_PATH]
    #[arg(long)]
    pub lease_path: Option<PathBuf>,
}
