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

//! Cached view of VirtualMachine resources.
//!
//! [`ResourceStore`] is the seam between the control loop and whatever keeps
//! the cluster state: reads come from a local cache, writes go through an
//! update call that replaces the stored object with a caller-supplied copy,
//! and changes fan out as [`Notification`]s. [`InMemoryResourceStore`] is the
//! in-process implementation fed by the manifest loader and the tests.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::vmctl::k8s::vm::VirtualMachine;
use crate::vmctl::logger::log_debug;

pub const DEFAULT_NAMESPACE: &str = "default";
const NOTIFICATION_BUFFER: usize = 256;
const STORE_COMPONENT: &str = "store";

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

pub fn normalize_namespace(namespace: Option<&str>) -> String {
    namespace
        .map(|ns| ns.trim())
        .filter(|ns| !ns.is_empty())
        .unwrap_or(DEFAULT_NAMESPACE)
        .to_string()
}

/// Stable `namespace/name` work key for a resource.
pub fn key_for(vm: &VirtualMachine) -> Result<String, StoreError> {
    let name = vm
        .name()
        .ok_or_else(|| StoreError::InvalidKey("object has no name".to_string()))?;
    Ok(format!("{}/{}", normalize_namespace(vm.namespace()), name))
}

/// Splits a work key. A bare `name` maps to the default namespace.
pub fn split_key(key: &str) -> Result<(String, String), StoreError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((DEFAULT_NAMESPACE.to_string(), name.to_string())),
        [namespace, name] if !name.is_empty() => {
            Ok((normalize_namespace(Some(namespace)), name.to_string()))
        }
        _ => Err(StoreError::InvalidKey(key.to_string())),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Added,
    Updated,
    Deleted,
}

impl NotificationKind {
    pub fn as_label(self) -> &'static str {
        match self {
            NotificationKind::Added => "added",
            NotificationKind::Updated => "updated",
            NotificationKind::Deleted => "deleted",
        }
    }
}

/// Change raised by the store.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    Added(VirtualMachine),
    Updated {
        old: VirtualMachine,
        new: VirtualMachine,
    },
    Deleted(VirtualMachine),
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::Added(_) => NotificationKind::Added,
            Notification::Updated { .. } => NotificationKind::Updated,
            Notification::Deleted(_) => NotificationKind::Deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    InvalidKey(String),
    NotFound {
        namespace: String,
        name: String,
    },
    Conflict {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidKey(key) => write!(f, "invalid resource key: {key}"),
            StoreError::NotFound { namespace, name } => {
                write!(f, "VirtualMachine {namespace}/{name} not found")
            }
            StoreError::Conflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "update of {key} conflicts: expected resourceVersion {}, found {}",
                expected.as_deref().unwrap_or("<none>"),
                actual.as_deref().unwrap_or("<none>")
            ),
            StoreError::Unavailable(message) => write!(f, "resource store unavailable: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub trait ResourceStore: Send + Sync {
    /// Reads the cached object. `Ok(None)` means not found.
    fn get(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, StoreError>;

    fn list(&self) -> Vec<VirtualMachine>;

    /// Replaces the stored object with `vm`. When `vm` carries a
    /// `resourceVersion` it must match the stored one.
    fn update<'a>(&'a self, vm: VirtualMachine) -> StoreFuture<'a, VirtualMachine>;

    fn subscribe(&self) -> broadcast::Receiver<Notification>;

    /// True once the initial listing has been loaded.
    fn has_synced(&self) -> bool;
}

#[derive(Clone)]
pub struct InMemoryResourceStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    cache: RwLock<HashMap<String, VirtualMachine>>,
    sender: broadcast::Sender<Notification>,
    synced: AtomicBool,
    next_version: AtomicU64,
}

impl Default for InMemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            inner: Arc::new(StoreInner {
                cache: RwLock::new(HashMap::new()),
                sender,
                synced: AtomicBool::new(false),
                next_version: AtomicU64::new(1),
            }),
        }
    }

    pub fn mark_synced(&self) {
        self.inner.synced.store(true, Ordering::SeqCst);
    }

    /// Creates or replaces the declared state of an object. Status is owned
    /// by the controller, so an existing status survives re-application.
    pub fn apply(&self, mut vm: VirtualMachine) -> Result<Notification, StoreError> {
        let key = key_for(&vm)?;
        vm.metadata.namespace = Some(normalize_namespace(vm.namespace()));
        vm.metadata.resource_version = Some(self.inner.bump_version());

        let notification = {
            let mut cache = self.inner.write_cache()?;
            match cache.get(&key).cloned() {
                Some(old) => {
                    vm.status = old.status.clone();
                    cache.insert(key.clone(), vm.clone());
                    Notification::Updated { old, new: vm }
                }
                None => {
                    cache.insert(key.clone(), vm.clone());
                    Notification::Added(vm)
                }
            }
        };

        self.inner.publish(&key, notification.clone());
        Ok(notification)
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, StoreError> {
        let key = format!("{}/{}", normalize_namespace(Some(namespace)), name);
        let removed = self.inner.write_cache()?.remove(&key);
        if let Some(vm) = removed.as_ref() {
            self.inner.publish(&key, Notification::Deleted(vm.clone()));
        }
        Ok(removed)
    }
}

impl StoreInner {
    fn bump_version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn write_cache(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, VirtualMachine>>, StoreError> {
        self.cache
            .write()
            .map_err(|_| StoreError::Unavailable("resource cache lock poisoned".to_string()))
    }

    fn publish(&self, key: &str, notification: Notification) {
        log_debug(
            STORE_COMPONENT,
            "Publishing resource notification",
            &[("key", key), ("kind", notification.kind().as_label())],
        );
        // No subscribers is not an error; the cache is still authoritative.
        let _ = self.sender.send(notification);
    }
}

impl ResourceStore for InMemoryResourceStore {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, StoreError> {
        let cache = self
            .inner
            .cache
            .read()
            .map_err(|_| StoreError::Unavailable("resource cache lock poisoned".to_string()))?;
        let key = format!("{}/{}", normalize_namespace(Some(namespace)), name);
        Ok(cache.get(&key).cloned())
    }

    fn list(&self) -> Vec<VirtualMachine> {
        match self.inner.cache.read() {
            Ok(cache) => cache.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn update<'a>(&'a self, mut vm: VirtualMachine) -> StoreFuture<'a, VirtualMachine> {
        Box::pin(async move {
            let key = key_for(&vm)?;
            let (namespace, name) = split_key(&key)?;
            let notification = {
                let mut cache = self.inner.write_cache()?;
                let old = cache
                    .get(&key)
                    .cloned()
                    .ok_or(StoreError::NotFound { namespace, name })?;
                if vm.metadata.resource_version.is_some()
                    && vm.metadata.resource_version != old.metadata.resource_version
                {
                    return Err(StoreError::Conflict {
                        key,
                        expected: vm.metadata.resource_version.clone(),
                        actual: old.metadata.resource_version.clone(),
                    });
                }
                vm.metadata.namespace = old.metadata.namespace.clone();
                vm.metadata.resource_version = Some(self.inner.bump_version());
                cache.insert(key.clone(), vm.clone());
                Notification::Updated {
                    old,
                    new: vm.clone(),
                }
            };
            self.inner.publish(&key, notification);
            Ok(vm)
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.sender.subscribe()
    }

    fn has_synced(&self) -> bool {
        self.inner.synced.load(Ordering::SeqCst)
    }
}
