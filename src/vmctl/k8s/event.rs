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

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::vmctl::k8s::store::normalize_namespace;
use crate::vmctl::k8s::vm::VirtualMachine;
use crate::vmctl::logger::{log_info, log_warn};

const DEFAULT_EVENT_RETENTION: usize = 1024;
const EVENTS_COMPONENT: &str = "events";

pub const REASON_SYNCED: &str = "Synced";
pub const MESSAGE_SYNCED: &str = "VM synced successfully";
pub const REASON_CREATED: &str = "Created";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_PROHIBITED: &str = "Prohibited";
pub const REASON_CREATE_FAILED: &str = "CreateFailed";
pub const REASON_DELETE_FAILED: &str = "DeleteFailed";
pub const REASON_SYNC_FAILED: &str = "SyncFailed";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EventKind {
    Normal,
    Warning,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Normal => "Normal",
            EventKind::Warning => "Warning",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Annotation attached to a resource, modelled after core/v1 Event.
#[derive(Clone, Debug, Serialize)]
pub struct RecordedEvent {
    #[serde(rename = "involvedObject")]
    pub involved_object: ObjectReference,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
    pub count: u32,
    #[serde(rename = "firstTimestamp")]
    pub first_timestamp: DateTime<Utc>,
    #[serde(rename = "lastTimestamp")]
    pub last_timestamp: DateTime<Utc>,
}

pub trait EventRecorder: Send + Sync {
    fn record(&self, vm: &VirtualMachine, kind: EventKind, reason: &str, message: &str);
}

/// Keeps the most recent events in memory and mirrors them to the log.
/// Identical consecutive events for one object are folded into a count.
#[derive(Clone)]
pub struct InMemoryEventRecorder {
    events: Arc<Mutex<VecDeque<RecordedEvent>>>,
    retention: usize,
}

impl Default for InMemoryEventRecorder {
    fn default() -> Self {
        Self::with_retention(DEFAULT_EVENT_RETENTION)
    }
}

impl InMemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            retention: retention.max(1),
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.iter().cloned().collect()
    }

    pub fn events_for(&self, namespace: &str, name: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|event| {
                event.involved_object.namespace == namespace && event.involved_object.name == name
            })
            .collect()
    }
}

impl EventRecorder for InMemoryEventRecorder {
    fn record(&self, vm: &VirtualMachine, kind: EventKind, reason: &str, message: &str) {
        let reference = ObjectReference {
            kind: vm.kind.clone(),
            namespace: normalize_namespace(vm.namespace()),
            name: vm.name().unwrap_or_default().to_string(),
        };
        let object = format!("{}/{}", reference.namespace, reference.name);
        let metadata = [
            ("object", object.as_str()),
            ("type", kind.as_str()),
            ("reason", reason),
        ];
        match kind {
            EventKind::Normal => log_info(EVENTS_COMPONENT, message, &metadata),
            EventKind::Warning => log_warn(EVENTS_COMPONENT, message, &metadata),
        }

        let now = Utc::now();
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(last) = events.back_mut() {
            if last.involved_object == reference
                && last.kind == kind
                && last.reason == reason
                && last.message == message
            {
                last.count += 1;
                last.last_timestamp = now;
                return;
            }
        }

        events.push_back(RecordedEvent {
            involved_object: reference,
            kind,
            reason: reason.to_string(),
            message: message.to_string(),
            count: 1,
            first_timestamp: now,
            last_timestamp: now,
        });
        while events.len() > self.retention {
            events.pop_front();
        }
    }
}
