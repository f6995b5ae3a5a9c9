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

use std::error::Error;
use std::fs;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::vmctl::cli::args::RunArgs;
use crate::vmctl::cloud::HttpComputeBackend;
use crate::vmctl::config::{Config, ControllerConfig};
use crate::vmctl::controller::leader::{default_identity, FileLeaseStore, LeaderElector};
use crate::vmctl::controller::ControllerManager;
use crate::vmctl::k8s::event::InMemoryEventRecorder;
use crate::vmctl::k8s::manifest::ManifestSource;
use crate::vmctl::k8s::store::InMemoryResourceStore;
use crate::vmctl::logger::{self, log_info, log_warn, LogFormat, LogLevel};
use crate::vmctl::observability::metrics::PrometheusMetrics;
use crate::vmctl::observability::{http, tracing};
use crate::vmctl::util::{new_error, with_context};

const RUN_COMPONENT: &str = "controller";

pub(super) async fn handle_run(args: &RunArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let format: LogFormat = args
        .log_format
        .clone()
        .unwrap_or_else(|| Config::LogFormat.get())
        .parse()
        .map_err(new_error)?;
    logger::set_log_format(format);
    let level: LogLevel = Config::LogLevel.get().parse().map_err(new_error)?;
    logger::set_min_level(level);
    tracing::init();

    let config = controller_config(args)?;
    let backend_url = args
        .backend_url
        .clone()
        .unwrap_or_else(|| Config::BackendUrl.get());
    let backend = HttpComputeBackend::new(&backend_url, config.backend_timeout)
        .map_err(|e| with_context(e, "Failed to configure compute backend"))?;

    let manifest_dir = args
        .manifest_dir
        .clone()
        .unwrap_or_else(|| Config::ManifestDir.get_path());
    fs::create_dir_all(&manifest_dir).map_err(|e| {
        with_context(
            e,
            format!(
                "Failed to create manifest directory '{}'",
                manifest_dir.display()
            ),
        )
    })?;
    let lease_path = args
        .lease_path
        .clone()
        .unwrap_or_else(|| Config::LeasePath.get_path());
    let identity = args.identity.clone().unwrap_or_else(default_identity);

    let workers = config.workers.to_string();
    let manifest_dir_display = manifest_dir.display().to_string();
    let lease_path_display = lease_path.display().to_string();
    log_info(
        RUN_COMPONENT,
        "Starting vmctl",
        &[
            ("identity", identity.as_str()),
            ("backend", backend_url.as_str()),
            ("workers", workers.as_str()),
            ("manifests", manifest_dir_display.as_str()),
            ("lease", lease_path_display.as_str()),
        ],
    );

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    let store = InMemoryResourceStore::new();
    let source = ManifestSource::new(manifest_dir, store.clone());
    let feed = tokio::spawn(source.run(args.poll_interval, shutdown.clone()));

    let metrics_server = args.metrics_addr.map(|addr| {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = http::serve(addr, shutdown).await {
                let error = err.to_string();
                log_warn(
                    RUN_COMPONENT,
                    "Metrics endpoint stopped",
                    &[("error", error.as_str())],
                );
            }
        })
    });

    let (elector, leader_signals) = LeaderElector::new(
        identity,
        Arc::new(FileLeaseStore::new(lease_path)),
        config.lease,
    );
    let manager = ControllerManager::new(
        Arc::new(store),
        Arc::new(backend),
        Arc::new(InMemoryEventRecorder::new()),
        Arc::new(PrometheusMetrics),
        config,
    );
    let result = manager.run(elector, leader_signals, shutdown.clone()).await;

    shutdown.cancel();
    let _ = feed.await;
    if let Some(server) = metrics_server {
        let _ = server.await;
    }
    signals.abort();

    result.map_err(|e| with_context(e, "Controller exited with an error"))
}

fn controller_config(args: &RunArgs) -> Result<ControllerConfig, Box<dyn Error + Send + Sync>> {
    let mut config = ControllerConfig::from_env()?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(duration) = args.lease_duration {
        config.lease.lease_duration = duration;
    }
    if let Some(deadline) = args.renew_deadline {
        config.lease.renew_deadline = deadline;
    }
    if let Some(period) = args.retry_period {
        config.lease.retry_period = period;
    }
    if let Some(timeout) = args.cache_sync_timeout {
        config.cache_sync_timeout = timeout;
    }
    config.validate()?;
    Ok(config)
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            let error = err.to_string();
            log_warn(
                RUN_COMPONENT,
                "Could not install SIGTERM handler",
                &[("error", error.as_str())],
            );
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log_info(RUN_COMPONENT, "Received SIGINT", &[]),
        _ = terminate.recv() => log_info(RUN_COMPONENT, "Received SIGTERM", &[]),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
