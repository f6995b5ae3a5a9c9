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

use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::vmctl::cloud::{
    find_server_id, BackendError, BackendFuture, CheckResult, ComputeBackend, ServerStatus,
    ServerSummary,
};
use crate::vmctl::logger::log_debug;

const CLOUD_COMPONENT: &str = "cloud";
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    cpu_utilization: i64,
}

/// REST client for the compute backend.
#[derive(Clone, Debug)]
pub struct HttpComputeBackend {
    client: Client,
    base_url: Url,
}

impl HttpComputeBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let base_url =
            Url::parse(base_url).map_err(|err| BackendError::InvalidUrl(err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(format!(
                "'{base_url}' cannot carry a path"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_from_segments(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|_| BackendError::InvalidUrl("base URL cannot carry a path".into()))?;
            parts.pop_if_empty();
            for segment in segments {
                parts.push(segment);
            }
        }
        Ok(url)
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: Url,
    ) -> Result<T, BackendError> {
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(BackendError::UnexpectedStatus {
                operation,
                status: status.as_u16(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }

    async fn do_check(&self, name: &str) -> Result<CheckResult, BackendError> {
        let url = self.url_from_segments(&["check", name])?;
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let result = match response.status() {
            StatusCode::OK => CheckResult::Exists,
            StatusCode::FORBIDDEN => CheckResult::Denied,
            _ => CheckResult::Absent,
        };
        log_debug(
            CLOUD_COMPONENT,
            "Checked server name",
            &[("name", name), ("result", check_label(result))],
        );
        Ok(result)
    }

    async fn do_list(&self) -> Result<Vec<ServerSummary>, BackendError> {
        let url = self.url_from_segments(&["servers"])?;
        self.fetch_json("list servers", url).await
    }

    async fn do_create(&self, name: &str) -> Result<(), BackendError> {
        let url = self.url_from_segments(&["servers"])?;
        let response = self
            .client
            .post(url)
            .json(&CreateServerRequest { name })
            .send()
            .await
            .map_err(transport_error)?;
        expect_status(response.status(), StatusCode::CREATED, "create server")?;
        log_debug(CLOUD_COMPONENT, "Created server", &[("name", name)]);
        Ok(())
    }

    async fn do_status(&self, name: &str) -> Result<ServerStatus, BackendError> {
        let servers = self.do_list().await?;
        let id = find_server_id(&servers, name)?;
        let url = self.url_from_segments(&["servers", &id, "status"])?;
        let status: StatusResponse = self.fetch_json("server status", url).await?;
        Ok(ServerStatus {
            id,
            cpu_utilization: status.cpu_utilization,
        })
    }

    async fn do_delete(&self, name: &str) -> Result<(), BackendError> {
        let servers = self.do_list().await?;
        let id = find_server_id(&servers, name)?;
        let url = self.url_from_segments(&["servers", &id])?;
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(transport_error)?;
        expect_status(response.status(), StatusCode::NO_CONTENT, "delete server")?;
        log_debug(
            CLOUD_COMPONENT,
            "Deleted server",
            &[("name", name), ("id", id.as_str())],
        );
        Ok(())
    }
}

impl ComputeBackend for HttpComputeBackend {
    fn check<'a>(&'a self, name: &'a str) -> BackendFuture<'a, CheckResult> {
        Box::pin(self.do_check(name))
    }

    fn list_servers<'a>(&'a self) -> BackendFuture<'a, Vec<ServerSummary>> {
        Box::pin(self.do_list())
    }

    fn create_server<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(self.do_create(name))
    }

    fn server_status<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ServerStatus> {
        Box::pin(self.do_status(name))
    }

    fn delete_server<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(self.do_delete(name))
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    BackendError::Transport(err.to_string())
}

fn expect_status(
    actual: StatusCode,
    expected: StatusCode,
    operation: &'static str,
) -> Result<(), BackendError> {
    if actual == expected {
        Ok(())
    } else {
        Err(BackendError::UnexpectedStatus {
            operation,
            status: actual.as_u16(),
        })
    }
}

fn check_label(result: CheckResult) -> &'static str {
    match result {
        CheckResult::Exists => "exists",
        CheckResult::Denied => "denied",
        CheckResult::Absent => "absent",
    }
}
