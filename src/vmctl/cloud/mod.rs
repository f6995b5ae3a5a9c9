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

//! Compute backend contract. The controller only ever talks to the backend
//! through [`ComputeBackend`]; [`client::HttpComputeBackend`] speaks the
//! JSON-over-HTTP protocol of the real service.

pub mod client;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

pub use client::HttpComputeBackend;

pub type BackendFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Classification returned by the name check endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckResult {
    Exists,
    Denied,
    Absent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerStatus {
    pub id: String,
    pub cpu_utilization: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The request never produced a response.
    Transport(String),
    UnexpectedStatus { operation: &'static str, status: u16 },
    Decode(String),
    ServerNotFound(String),
    InvalidUrl(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Transport(message) => write!(f, "compute backend unreachable: {message}"),
            BackendError::UnexpectedStatus { operation, status } => {
                write!(f, "compute backend {operation} returned status {status}")
            }
            BackendError::Decode(message) => {
                write!(f, "compute backend sent an invalid response: {message}")
            }
            BackendError::ServerNotFound(name) => {
                write!(f, "server '{name}' is not known to the compute backend")
            }
            BackendError::InvalidUrl(message) => write!(f, "invalid compute backend URL: {message}"),
        }
    }
}

impl std::error::Error for BackendError {}

pub trait ComputeBackend: Send + Sync {
    /// One round trip that answers both "is this name denied" and "does a
    /// server with this name exist".
    fn check<'a>(&'a self, name: &'a str) -> BackendFuture<'a, CheckResult>;

    fn list_servers<'a>(&'a self) -> BackendFuture<'a, Vec<ServerSummary>>;

    fn create_server<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ()>;

    /// Resolves `name` to its server id and reads the current utilization.
    fn server_status<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ServerStatus>;

    fn delete_server<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ()>;
}

/// Finds the id of the server registered under `name`.
pub fn find_server_id(servers: &[ServerSummary], name: &str) -> Result<String, BackendError> {
    servers
        .iter()
        .find(|server| server.name == name)
        .map(|server| server.id.clone())
        .ok_or_else(|| BackendError::ServerNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_server_id_matches_exact_name() {
        let servers = vec![
            ServerSummary {
                id: "1".to_string(),
                name: "alice-db".to_string(),
            },
            ServerSummary {
                id: "2".to_string(),
                name: "alice".to_string(),
            },
        ];
        assert_eq!(find_server_id(&servers, "alice").unwrap(), "2");
        assert_eq!(
            find_server_id(&servers, "bob"),
            Err(BackendError::ServerNotFound("bob".to_string()))
        );
    }
}
