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

//! Feeds the in-memory store from a directory of JSON VirtualMachine
//! manifests. Each `*.json` file holds one object; files that appear,
//! change or disappear between scans become Added, Updated or Deleted
//! notifications. When several files declare the same object the first
//! one seen owns it and the others are skipped.

use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::vmctl::k8s::store::{key_for, split_key, InMemoryResourceStore};
use crate::vmctl::k8s::vm::VirtualMachine;
use crate::vmctl::logger::{log_info, log_warn};
use crate::vmctl::util::with_context;

const MANIFEST_COMPONENT: &str = "manifest";
const MANIFEST_EXTENSION: &str = "json";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub applied: usize,
    pub removed: usize,
    pub skipped: usize,
}

struct SeenManifest {
    key: String,
    contents: String,
}

pub struct ManifestSource {
    dir: PathBuf,
    store: InMemoryResourceStore,
    seen: HashMap<PathBuf, SeenManifest>,
}

impl ManifestSource {
    pub fn new(dir: impl Into<PathBuf>, store: InMemoryResourceStore) -> Self {
        Self {
            dir: dir.into(),
            store,
            seen: HashMap::new(),
        }
    }

    /// Scans the directory once and marks the store synced after the first
    /// successful pass.
    pub fn sync_once(&mut self) -> Result<ScanSummary, Box<dyn Error + Send + Sync>> {
        let mut summary = ScanSummary::default();

        let entries = fs::read_dir(&self.dir).map_err(|e| {
            with_context(
                e,
                format!("Failed to read manifest directory '{}'", self.dir.display()),
            )
        })?;

        let mut present = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if is_manifest(&path) {
                present.push(path);
            }
        }

        for path in &present {
            let contents = match fs::read_to_string(path) {
                Ok(contents) => contents,
                Err(err) => {
                    log_manifest_skip(path, &err.to_string());
                    summary.skipped += 1;
                    continue;
                }
            };
            if self
                .seen
                .get(path)
                .is_some_and(|seen| seen.contents == contents)
            {
                continue;
            }

            let vm: VirtualMachine = match serde_json::from_str(&contents) {
                Ok(vm) => vm,
                Err(err) => {
                    log_manifest_skip(path, &err.to_string());
                    summary.skipped += 1;
                    continue;
                }
            };
            let key = match key_for(&vm) {
                Ok(key) => key,
                Err(err) => {
                    log_manifest_skip(path, &err.to_string());
                    summary.skipped += 1;
                    continue;
                }
            };

            if let Some(owner) = self.owner_of(&key, path, &present) {
                let file = path.display().to_string();
                let owner = owner.display().to_string();
                log_warn(
                    MANIFEST_COMPONENT,
                    "Skipping duplicate manifest",
                    &[
                        ("path", file.as_str()),
                        ("key", key.as_str()),
                        ("declared_in", owner.as_str()),
                    ],
                );
                summary.skipped += 1;
                continue;
            }

            self.store.apply(vm)?;
            summary.applied += 1;
            let previous = self
                .seen
                .insert(path.clone(), SeenManifest { key, contents });

            // A file edited to describe another object retires the old one.
            if let Some(previous) = previous {
                if self.release_key(&previous.key)? {
                    summary.removed += 1;
                }
            }
        }

        let vanished: Vec<PathBuf> = self
            .seen
            .keys()
            .filter(|path| !present.contains(path))
            .cloned()
            .collect();
        for path in vanished {
            if let Some(seen) = self.seen.remove(&path) {
                if self.release_key(&seen.key)? {
                    summary.removed += 1;
                }
            }
        }

        self.store.mark_synced();
        Ok(summary)
    }

    /// Another file still present that already declares `key`.
    fn owner_of(&self, key: &str, path: &Path, present: &[PathBuf]) -> Option<PathBuf> {
        self.seen
            .iter()
            .find(|(other, seen)| {
                other.as_path() != path && seen.key == key && present.contains(*other)
            })
            .map(|(other, _)| other.clone())
    }

    /// Removes `key` from the store unless a tracked file still declares it.
    fn release_key(&self, key: &str) -> Result<bool, Box<dyn Error + Send + Sync>> {
        if self.seen.values().any(|seen| seen.key == key) {
            return Ok(false);
        }
        let (namespace, name) = split_key(key)?;
        self.store.remove(&namespace, &name)?;
        Ok(true)
    }

    /// Rescans every `interval` until `shutdown` fires.
    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        let dir = self.dir.display().to_string();
        log_info(
            MANIFEST_COMPONENT,
            "Watching manifest directory",
            &[("dir", dir.as_str())],
        );
        loop {
            match self.sync_once() {
                Ok(summary) if summary.applied > 0 || summary.removed > 0 => {
                    let applied = summary.applied.to_string();
                    let removed = summary.removed.to_string();
                    log_info(
                        MANIFEST_COMPONENT,
                        "Manifest scan applied changes",
                        &[("applied", applied.as_str()), ("removed", removed.as_str())],
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    let error = err.to_string();
                    log_warn(
                        MANIFEST_COMPONENT,
                        "Manifest scan failed",
                        &[("dir", dir.as_str()), ("error", error.as_str())],
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(interval) => {}
            }
        }
    }
}

fn is_manifest(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(MANIFEST_EXTENSION))
}

fn log_manifest_skip(path: &Path, error: &str) {
    let path = path.display().to_string();
    log_warn(
        MANIFEST_COMPONENT,
        "Skipping unreadable manifest",
        &[("path", path.as_str()), ("error", error)],
    );
}
