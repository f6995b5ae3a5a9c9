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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const VM_API_VERSION: &str = "vmctl.io/v1alpha1";
pub const VM_KIND: &str = "VirtualMachine";

/// Minimal representation of Kubernetes object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: Option<String>,
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Desired state declared by the resource owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineSpec {
    /// Identifier the compute backend provisions the server under.
    #[serde(rename = "backendName", alias = "name", default)]
    pub backend_name: String,
}

/// Observed state. Only the controller writes these fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineStatus {
    #[serde(rename = "backendID", alias = "vmId", default)]
    pub backend_id: String,
    #[serde(rename = "cpuUtilization", default)]
    pub cpu_utilization: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineSpec,
    #[serde(default)]
    pub status: VirtualMachineStatus,
}

fn default_api_version() -> String {
    VM_API_VERSION.to_string()
}

fn default_kind() -> String {
    VM_KIND.to_string()
}

impl VirtualMachine {
    pub fn new(namespace: &str, name: &str, backend_name: &str) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: VirtualMachineSpec {
                backend_name: backend_name.to_string(),
            },
            status: VirtualMachineStatus::default(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata.name.as_deref().filter(|name| !name.is_empty())
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    /// Returns a copy carrying the given observed status. `self` is untouched.
    pub fn with_status(&self, backend_id: &str, cpu_utilization: i64) -> Self {
        let mut copy = self.clone();
        copy.status = VirtualMachineStatus {
            backend_id: backend_id.to_string(),
            cpu_utilization,
        };
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_status_leaves_original_untouched() {
        let vm = VirtualMachine::new("default", "vm-a", "alice");
        let updated = vm.with_status("id-1", 42);

        assert_eq!(vm.status, VirtualMachineStatus::default());
        assert_eq!(updated.status.backend_id, "id-1");
        assert_eq!(updated.status.cpu_utilization, 42);
        assert_eq!(updated.spec, vm.spec);
        assert_eq!(updated.metadata, vm.metadata);
    }

    #[test]
    fn manifest_accepts_legacy_field_names() {
        let vm: VirtualMachine = serde_json::from_str(
            r#"{"metadata":{"name":"vm-a","namespace":"default"},"spec":{"name":"alice"},"status":{"vmId":"x","cpuUtilization":7}}"#,
        )
        .expect("decode manifest");

        assert_eq!(vm.kind, VM_KIND);
        assert_eq!(vm.api_version, VM_API_VERSION);
        assert_eq!(vm.spec.backend_name, "alice");
        assert_eq!(vm.status.backend_id, "x");
        assert_eq!(vm.status.cpu_utilization, 7);
    }

    #[test]
    fn serialises_camel_case_fields() {
        let vm = VirtualMachine::new("default", "vm-a", "alice").with_status("id-1", 3);
        let value = serde_json::to_value(&vm).expect("encode");
        assert_eq!(value["spec"]["backendName"], "alice");
        assert_eq!(value["status"]["backendID"], "id-1");
        assert_eq!(value["status"]["cpuUtilization"], 3);
        assert!(value["metadata"].get("labels").is_none());
    }

    #[test]
    fn empty_name_is_treated_as_missing() {
        let mut vm = VirtualMachine::new("default", "", "alice");
        assert!(vm.name().is_none());
        vm.metadata.name = None;
        assert!(vm.name().is_none());
    }
}
