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

//! Lease-based leader election.
//!
//! Replicas compete for a single [`LeaseRecord`] kept in a [`LeaseStore`].
//! Writes are compare-and-swap on the record version, so at most one replica
//! can move the record forward from any given state. A holder renews every
//! `retry_period` and steps down when no renewal has succeeded for
//! `renew_deadline`. Other replicas judge expiry from the moment *they*
//! last saw the record change, never from the timestamps written into it,
//! which keeps the protocol safe against clock skew between hosts.

use std::env;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::vmctl::logger::{log_debug, log_info, log_warn};
use crate::vmctl::observability::tracing::random_hex;

const LEADER_COMPONENT: &str = "leader";
const RELEASED_LEASE_SECONDS: u64 = 1;
const ACQUIRE_JITTER: f64 = 0.2;
const SIGNAL_BUFFER: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub holder_identity: String,
    pub lease_duration_seconds: u64,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub leader_transitions: u64,
}

impl LeaseRecord {
    pub fn is_released(&self) -> bool {
        self.holder_identity.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedLease {
    pub version: u64,
    pub record: LeaseRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// The record changed since it was read, or already exists on create.
    Conflict,
    Io(String),
    Corrupt(String),
    Unavailable(String),
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseError::Conflict => write!(f, "lease record was modified concurrently"),
            LeaseError::Io(message) => write!(f, "lease storage I/O failed: {message}"),
            LeaseError::Corrupt(message) => write!(f, "lease record is unreadable: {message}"),
            LeaseError::Unavailable(message) => write!(f, "lease store unavailable: {message}"),
        }
    }
}

impl std::error::Error for LeaseError {}

impl From<std::io::Error> for LeaseError {
    fn from(err: std::io::Error) -> Self {
        LeaseError::Io(err.to_string())
    }
}

pub type LeaseFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LeaseError>> + Send + 'a>>;

/// Coordination store holding the single lease record.
pub trait LeaseStore: Send + Sync {
    fn get(&self) -> LeaseFuture<'_, Option<VersionedLease>>;

    /// Creates the record. Fails with [`LeaseError::Conflict`] if one exists.
    fn create(&self, record: LeaseRecord) -> LeaseFuture<'_, VersionedLease>;

    /// Replaces the record if its version is still `expected_version`.
    fn update(&self, record: LeaseRecord, expected_version: u64)
        -> LeaseFuture<'_, VersionedLease>;
}

/// Lease shared by every elector holding a clone of the handle.
#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    slot: Arc<Mutex<Option<VersionedLease>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slot<T>(
        &self,
        op: impl FnOnce(&mut Option<VersionedLease>) -> Result<T, LeaseError>,
    ) -> Result<T, LeaseError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| LeaseError::Unavailable("lease slot lock poisoned".to_string()))?;
        op(&mut slot)
    }
}

impl LeaseStore for InMemoryLeaseStore {
    fn get(&self) -> LeaseFuture<'_, Option<VersionedLease>> {
        Box::pin(async move { self.with_slot(|slot| Ok(slot.clone())) })
    }

    fn create(&self, record: LeaseRecord) -> LeaseFuture<'_, VersionedLease> {
        Box::pin(async move { self.with_slot(|slot| create_in_slot(slot, record)) })
    }

    fn update(
        &self,
        record: LeaseRecord,
        expected_version: u64,
    ) -> LeaseFuture<'_, VersionedLease> {
        Box::pin(async move {
            self.with_slot(|slot| update_in_slot(slot, record, expected_version))
        })
    }
}

fn create_in_slot(
    slot: &mut Option<VersionedLease>,
    record: LeaseRecord,
) -> Result<VersionedLease, LeaseError> {
    if slot.is_some() {
        return Err(LeaseError::Conflict);
    }
    let lease = VersionedLease { version: 1, record };
    *slot = Some(lease.clone());
    Ok(lease)
}

fn update_in_slot(
    slot: &mut Option<VersionedLease>,
    record: LeaseRecord,
    expected_version: u64,
) -> Result<VersionedLease, LeaseError> {
    match slot.as_ref() {
        Some(current) if current.version == expected_version => {
            let lease = VersionedLease {
                version: current.version + 1,
                record,
            };
            *slot = Some(lease.clone());
            Ok(lease)
        }
        _ => Err(LeaseError::Conflict),
    }
}

/// Lease persisted as JSON on a filesystem shared by the replicas. Every
/// operation runs under an exclusive lock on a sibling `.lock` file.
#[derive(Clone, Debug)]
pub struct FileLeaseStore {
    path: PathBuf,
}

struct FileLock {
    file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl FileLeaseStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "lease".into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn read_slot(&self) -> Result<Option<VersionedLease>, LeaseError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(None),
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|err| LeaseError::Corrupt(err.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_slot(&self, lease: &VersionedLease) -> Result<(), LeaseError> {
        let payload = serde_json::to_vec_pretty(lease)
            .map_err(|err| LeaseError::Corrupt(err.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn locked<T>(
        &self,
        op: impl FnOnce(&Self, &mut Option<VersionedLease>) -> Result<T, LeaseError>,
    ) -> Result<T, LeaseError> {
        let _lock = FileLock::exclusive(&self.lock_path())?;
        let mut slot = self.read_slot()?;
        op(self, &mut slot)
    }

    /// Reads the record without going through the async interface.
    pub fn read_blocking(&self) -> Result<Option<VersionedLease>, LeaseError> {
        self.locked(|_, slot| Ok(slot.clone()))
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T, LeaseError>
    where
        T: Send + 'static,
        F: FnOnce(&FileLeaseStore) -> Result<T, LeaseError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| LeaseError::Unavailable(err.to_string()))?
    }
}

impl LeaseStore for FileLeaseStore {
    fn get(&self) -> LeaseFuture<'_, Option<VersionedLease>> {
        Box::pin(self.run_blocking(|store| store.read_blocking()))
    }

    fn create(&self, record: LeaseRecord) -> LeaseFuture<'_, VersionedLease> {
        Box::pin(self.run_blocking(move |store| {
            store.locked(|store, slot| {
                let lease = create_in_slot(slot, record)?;
                store.write_slot(&lease)?;
                Ok(lease)
            })
        }))
    }

    fn update(
        &self,
        record: LeaseRecord,
        expected_version: u64,
    ) -> LeaseFuture<'_, VersionedLease> {
        Box::pin(self.run_blocking(move |store| {
            store.locked(|store, slot| {
                let lease = update_in_slot(slot, record, expected_version)?;
                store.write_slot(&lease)?;
                Ok(lease)
            })
        }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseConfig {
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(5),
            renew_deadline: Duration::from_secs(2),
            retry_period: Duration::from_secs(1),
        }
    }
}

impl LeaseConfig {
    fn lease_seconds(&self) -> u64 {
        let secs = self.lease_duration.as_secs();
        if self.lease_duration.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderState {
    Idle,
    Acquiring,
    Leading,
    Standby,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderSignal {
    BecameLeader,
    LostLeadership,
    NewLeader(String),
}

/// `<hostname>_<16 hex>`, unique per process.
pub fn default_identity() -> String {
    let host = env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "vmctl".to_string());
    format!("{host}_{}", random_hex(8))
}

struct Observation {
    lease: VersionedLease,
    seen_at: Instant,
}

pub struct LeaderElector {
    identity: String,
    store: Arc<dyn LeaseStore>,
    config: LeaseConfig,
    state: watch::Sender<LeaderState>,
    signals: mpsc::Sender<LeaderSignal>,
    observed: Option<Observation>,
    reported_leader: Option<String>,
}

impl LeaderElector {
    pub fn new(
        identity: impl Into<String>,
        store: Arc<dyn LeaseStore>,
        config: LeaseConfig,
    ) -> (Self, mpsc::Receiver<LeaderSignal>) {
        let (signals, receiver) = mpsc::channel(SIGNAL_BUFFER);
        let (state, _) = watch::channel(LeaderState::Idle);
        let elector = Self {
            identity: identity.into(),
            store,
            config,
            state,
            signals,
            observed: None,
            reported_leader: None,
        };
        (elector, receiver)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    /// Campaigns for the lease until `cancel` fires. A held lease is released
    /// before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        log_info(
            LEADER_COMPONENT,
            "Starting leader election",
            &[("identity", self.identity.as_str())],
        );
        loop {
            if !self.acquire(&cancel).await {
                break;
            }
            self.set_state(LeaderState::Leading);
            log_info(
                LEADER_COMPONENT,
                "Acquired leadership",
                &[("identity", self.identity.as_str())],
            );
            self.signal(LeaderSignal::BecameLeader).await;

            if !self.hold(&cancel).await {
                self.release().await;
                break;
            }
            self.set_state(LeaderState::Standby);
            log_warn(
                LEADER_COMPONENT,
                "Lost leadership",
                &[("identity", self.identity.as_str())],
            );
            self.signal(LeaderSignal::LostLeadership).await;
        }
        self.set_state(LeaderState::Idle);
        log_info(
            LEADER_COMPONENT,
            "Leader election stopped",
            &[("identity", self.identity.as_str())],
        );
    }

    /// Retries until the lease is ours. Returns false when cancelled.
    async fn acquire(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            self.set_state(LeaderState::Acquiring);
            match self.attempt().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    let error = err.to_string();
                    log_warn(
                        LEADER_COMPONENT,
                        "Lease acquisition attempt failed",
                        &[("error", error.as_str())],
                    );
                }
            }
            self.set_state(LeaderState::Standby);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep(jittered(self.config.retry_period)) => {}
            }
        }
    }

    /// Renews while leading. Returns true when leadership was lost and false
    /// when cancelled.
    async fn hold(&mut self, cancel: &CancellationToken) -> bool {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep(self.config.retry_period) => {}
            }

            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(last_renewal.elapsed())
                .max(Duration::from_millis(1));
            match timeout(remaining, self.attempt()).await {
                Ok(Ok(true)) => {
                    last_renewal = Instant::now();
                    continue;
                }
                Ok(Ok(false)) => {
                    // Someone else moved the record; it is no longer ours.
                    return true;
                }
                Ok(Err(err)) => {
                    let error = err.to_string();
                    log_warn(
                        LEADER_COMPONENT,
                        "Lease renewal failed",
                        &[("error", error.as_str())],
                    );
                }
                Err(_) => log_warn(LEADER_COMPONENT, "Lease renewal timed out", &[]),
            }
            if last_renewal.elapsed() >= self.config.renew_deadline {
                return true;
            }
        }
    }

    /// One read-then-CAS round. `Ok(true)` means we hold the lease now.
    async fn attempt(&mut self) -> Result<bool, LeaseError> {
        let now = Utc::now();
        let current = match self.store.get().await? {
            Some(current) => current,
            None => {
                let record = LeaseRecord {
                    holder_identity: self.identity.clone(),
                    lease_duration_seconds: self.config.lease_seconds(),
                    acquire_time: now,
                    renew_time: now,
                    leader_transitions: 0,
                };
                return match self.store.create(record).await {
                    Ok(lease) => {
                        self.observe(lease).await;
                        Ok(true)
                    }
                    Err(LeaseError::Conflict) => Ok(false),
                    Err(err) => Err(err),
                };
            }
        };

        self.observe(current.clone()).await;
        let held_by_us = current.record.holder_identity == self.identity;
        if !held_by_us && !current.record.is_released() && !self.observed_expired() {
            return Ok(false);
        }

        let record = if held_by_us {
            LeaseRecord {
                lease_duration_seconds: self.config.lease_seconds(),
                renew_time: now,
                ..current.record.clone()
            }
        } else {
            LeaseRecord {
                holder_identity: self.identity.clone(),
                lease_duration_seconds: self.config.lease_seconds(),
                acquire_time: now,
                renew_time: now,
                leader_transitions: current.record.leader_transitions + 1,
            }
        };

        match self.store.update(record, current.version).await {
            Ok(lease) => {
                self.observe(lease).await;
                Ok(true)
            }
            Err(LeaseError::Conflict) => {
                log_debug(LEADER_COMPONENT, "Lost lease update race", &[]);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Gives the lease up if we still hold it.
    async fn release(&mut self) {
        let current = match self.store.get().await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(err) => {
                let error = err.to_string();
                log_warn(
                    LEADER_COMPONENT,
                    "Could not read lease for release",
                    &[("error", error.as_str())],
                );
                return;
            }
        };
        if current.record.holder_identity != self.identity {
            return;
        }

        let now = Utc::now();
        let record = LeaseRecord {
            holder_identity: String::new(),
            lease_duration_seconds: RELEASED_LEASE_SECONDS,
            acquire_time: now,
            renew_time: now,
            leader_transitions: current.record.leader_transitions,
        };
        match self.store.update(record, current.version).await {
            Ok(_) => log_info(
                LEADER_COMPONENT,
                "Released lease",
                &[("identity", self.identity.as_str())],
            ),
            Err(err) => {
                let error = err.to_string();
                log_warn(
                    LEADER_COMPONENT,
                    "Failed to release lease",
                    &[("error", error.as_str())],
                );
            }
        }
    }

    async fn observe(&mut self, lease: VersionedLease) {
        let changed = self
            .observed
            .as_ref()
            .map(|seen| seen.lease != lease)
            .unwrap_or(true);
        if changed {
            let holder = lease.record.holder_identity.clone();
            self.observed = Some(Observation {
                lease,
                seen_at: Instant::now(),
            });
            if !holder.is_empty() && self.reported_leader.as_deref() != Some(holder.as_str()) {
                self.reported_leader = Some(holder.clone());
                self.signal(LeaderSignal::NewLeader(holder)).await;
            }
        }
    }

    fn observed_expired(&self) -> bool {
        match self.observed.as_ref() {
            Some(seen) => {
                let ttl = Duration::from_secs(seen.lease.record.lease_duration_seconds);
                seen.seen_at.elapsed() >= ttl
            }
            None => true,
        }
    }

    fn set_state(&self, state: LeaderState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn signal(&self, signal: LeaderSignal) {
        // A closed receiver means the manager is gone; the election still
        // runs to completion so the lease gets released.
        let _ = self.signals.send(signal).await;
    }
}

fn jittered(period: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.0..=ACQUIRE_JITTER);
    period + period.mul_f64(factor)
}
