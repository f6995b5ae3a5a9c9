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

use crate::vmctl::cli::args::LeaseArgs;
use crate::vmctl::config::Config;
use crate::vmctl::controller::leader::{FileLeaseStore, VersionedLease};
use crate::vmctl::util::with_context;

pub(super) fn handle_lease(args: &LeaseArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let path = args
        .lease_path
        .clone()
        .unwrap_or_else(|| Config::LeasePath.get_path());
    let store = FileLeaseStore::new(path.clone());
    let lease = store
        .read_blocking()
        .map_err(|e| with_context(e, format!("Failed to read lease '{}'", path.display())))?;
    println!("{}", render_lease(lease.as_ref())?);
    Ok(())
}

fn render_lease(lease: Option<&VersionedLease>) -> Result<String, Box<dyn Error + Send + Sync>> {
    match lease {
        Some(lease) => Ok(serde_json::to_string_pretty(lease)?),
        None => Ok("No lease has been recorded".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmctl::controller::leader::LeaseRecord;
    use chrono::Utc;

    #[test]
    fn renders_record_fields_in_camel_case() {
        let now = Utc::now();
        let lease = VersionedLease {
            version: 3,
            record: LeaseRecord {
                holder_identity: "node-a_0011".to_string(),
                lease_duration_seconds: 5,
                acquire_time: now,
                renew_time: now,
                leader_transitions: 2,
            },
        };
        let rendered = render_lease(Some(&lease)).expect("render");
        assert!(rendered.contains("\"holderIdentity\": \"node-a_0011\""));
        assert!(rendered.contains("\"leaderTransitions\": 2"));
        assert_eq!(
            render_lease(None).expect("render"),
            "No lease has been recorded"
        );
    }
}
