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

pub mod dispatch;
pub mod leader;
pub mod manager;
pub mod queue;
pub mod reconcile;
pub mod worker;

use std::fmt;
use std::time::Duration;

pub use dispatch::Dispatcher;
pub use leader::{
    FileLeaseStore, InMemoryLeaseStore, LeaderElector, LeaderSignal, LeaderState, LeaseConfig,
    LeaseRecord, LeaseStore,
};
pub use manager::ControllerManager;
pub use queue::{RetryPolicy, RetryQueue};
pub use reconcile::{ReconcileEngine, ReconcileOutcome, Reconciler};
pub use worker::WorkerPool;

/// Failures that stop the controller rather than a single reconcile.
#[derive(Debug)]
pub enum ControllerError {
    CacheSyncTimeout(Duration),
    Task(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::CacheSyncTimeout(timeout) => write!(
                f,
                "resource cache did not sync within {}",
                humantime::format_duration(*timeout)
            ),
            ControllerError::Task(message) => write!(f, "controller task failed: {message}"),
        }
    }
}

impl std::error::Error for ControllerError {}
