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

use std::env;
use std::error::Error;
use std::path::{Component, PathBuf};
use std::time::Duration;

use crate::vmctl::cloud::client::DEFAULT_BACKEND_TIMEOUT;
use crate::vmctl::controller::leader::LeaseConfig;
use crate::vmctl::controller::queue::RetryPolicy;
use crate::vmctl::util::new_error;

/// Settings read from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    BackendUrl,
    Workers,
    LeasePath,
    ManifestDir,
    LogFormat,
    LogLevel,
}

impl Config {
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::BackendUrl => "VMCTL_BACKEND_URL",
            Config::Workers => "VMCTL_WORKERS",
            Config::LeasePath => "VMCTL_LEASE_PATH",
            Config::ManifestDir => "VMCTL_MANIFEST_DIR",
            Config::LogFormat => "VMCTL_LOG_FORMAT",
            Config::LogLevel => "VMCTL_LOG_LEVEL",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            Config::BackendUrl => "http://127.0.0.1:8080",
            Config::Workers => "2",
            Config::LeasePath => {
                #[cfg(test)]
                {
                    "/tmp/vmctl-test/leader.lease"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/vmctl/leader.lease"
                }
            }
            Config::ManifestDir => {
                #[cfg(test)]
                {
                    "/tmp/vmctl-test/manifests"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/vmctl/manifests"
                }
            }
            Config::LogFormat => "text",
            Config::LogLevel => "info",
        }
    }

    /// The environment value, or the default when unset or blank.
    pub fn get(&self) -> String {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_value().to_string())
    }

    pub fn get_path(&self) -> PathBuf {
        Self::normalize_path(&self.get())
    }

    /// Expands `~`, anchors relative paths at the working directory and
    /// collapses `.` / `..`.
    fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }
}

/// Tunables of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub lease: LeaseConfig,
    pub cache_sync_timeout: Duration,
    pub backend_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            retry: RetryPolicy::default(),
            lease: LeaseConfig::default(),
            cache_sync_timeout: Duration::from_secs(30),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let workers = parse_workers(&Config::Workers.get())?;
        Ok(Self {
            workers,
            ..Self::default()
        })
    }

    pub fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.workers == 0 {
            return Err(new_error("worker count must be at least 1"));
        }
        if self.lease.renew_deadline >= self.lease.lease_duration {
            return Err(new_error(
                "lease renew deadline must be shorter than the lease duration",
            ));
        }
        if self.lease.retry_period >= self.lease.renew_deadline {
            return Err(new_error(
                "lease retry period must be shorter than the renew deadline",
            ));
        }
        if self.retry.base.is_zero() || self.retry.base > self.retry.max {
            return Err(new_error("retry base delay must be non-zero and at most the max delay"));
        }
        Ok(())
    }
}

pub fn parse_workers(value: &str) -> Result<usize, Box<dyn Error + Send + Sync>> {
    let workers: usize = value
        .trim()
        .parse()
        .map_err(|_| new_error(format!("invalid worker count '{value}'")))?;
    if workers == 0 {
        return Err(new_error("worker count must be at least 1"));
    }
    Ok(workers)
}
