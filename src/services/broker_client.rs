//! HTTP client for service brokers speaking the asynchronous OSB contract
//!
//! Provision, update and deprovision requests are sent with
//! `accepts_incomplete=true`. A `202 Accepted` means the broker continues in
//! the background; completion is polled through `last_operation`.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;

use crate::error::ActionError;
use crate::services::resource_actions::ActionOutcome;

pub const BROKER_API_VERSION: &str = "2.16";
const API_VERSION_HEADER: &str = "X-Broker-API-Version";

/// Broker endpoint for one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub base_url: String,
    /// e.g. `/v2/service_instances/{id}`
    pub path: String,
}

impl BrokerTarget {
    pub fn instance(base_url: &str, instance_id: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            path: format!("/v2/service_instances/{}", instance_id),
        }
    }

    pub fn binding(base_url: &str, instance_id: &str, binding_id: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            path: format!(
                "/v2/service_instances/{}/service_bindings/{}",
                instance_id, binding_id
            ),
        }
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url, self.path)
    }
}

#[derive(Debug, Default, Deserialize)]
struct AsyncResponse {
    operation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LastOperationResponse {
    state: String,
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BrokerErrorResponse {
    error: Option<String>,
    description: Option<String>,
}

#[derive(Clone)]
pub struct BrokerClient {
    client: Client,
}

impl BrokerClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn provision(&self, target: &BrokerTarget) -> Result<ActionOutcome, ActionError> {
        self.send(Method::PUT, target).await
    }

    pub async fn update(&self, target: &BrokerTarget) -> Result<ActionOutcome, ActionError> {
        self.send(Method::PATCH, target).await
    }

    pub async fn deprovision(&self, target: &BrokerTarget) -> Result<ActionOutcome, ActionError> {
        self.send(Method::DELETE, target).await
    }

    /// Poll the state of an asynchronous broker operation
    pub async fn last_operation(
        &self,
        target: &BrokerTarget,
        handle: &str,
        deleting: bool,
    ) -> Result<ActionOutcome, ActionError> {
        let url = format!("{}/last_operation", target.url());
        let mut request = self
            .client
            .get(&url)
            .header(API_VERSION_HEADER, BROKER_API_VERSION);
        if !handle.is_empty() {
            request = request.query(&[("operation", handle)]);
        }

        let response = request.send().await.map_err(network_error)?;
        let status = response.status();
        let body = response.text().await.map_err(network_error)?;

        if status == StatusCode::GONE && deleting {
            return Ok(ActionOutcome::Succeeded);
        }
        if status != StatusCode::OK {
            return Err(classify_failure(status, &body));
        }

        let last: LastOperationResponse = serde_json::from_str(&body).map_err(|e| {
            ActionError::Transient(format!("unreadable last_operation response: {}", e))
        })?;

        match last.state.as_str() {
            "in progress" => Ok(ActionOutcome::StillRunning {
                handle: handle.to_string(),
            }),
            "succeeded" => Ok(ActionOutcome::Succeeded),
            "failed" => Ok(ActionOutcome::Failed {
                reason: last
                    .description
                    .unwrap_or_else(|| "broker reported failure".to_string()),
            }),
            other => Err(ActionError::Transient(format!(
                "unknown last_operation state '{}'",
                other
            ))),
        }
    }

    async fn send(&self, method: Method, target: &BrokerTarget) -> Result<ActionOutcome, ActionError> {
        let deleting = method == Method::DELETE;
        let mut request = self
            .client
            .request(method.clone(), target.url())
            .header(API_VERSION_HEADER, BROKER_API_VERSION)
            .query(&[("accepts_incomplete", "true")]);
        if !deleting {
            request = request.json(&serde_json::json!({}));
        }

        tracing::debug!("Broker request {} {}", method, target.url());
        let response = request.send().await.map_err(network_error)?;
        let status = response.status();
        let body = response.text().await.map_err(network_error)?;

        outcome_from_response(status, &body, deleting)
    }
}

/// Map a broker response for a side-effecting request to an action outcome
pub fn outcome_from_response(
    status: StatusCode,
    body: &str,
    deleting: bool,
) -> Result<ActionOutcome, ActionError> {
    match status {
        StatusCode::OK | StatusCode::CREATED => Ok(ActionOutcome::Succeeded),
        StatusCode::ACCEPTED => {
            let accepted: AsyncResponse = serde_json::from_str(body).unwrap_or_default();
            Ok(ActionOutcome::StillRunning {
                handle: accepted.operation.unwrap_or_default(),
            })
        }
        StatusCode::GONE if deleting => Ok(ActionOutcome::Succeeded),
        _ => Err(classify_failure(status, body)),
    }
}

fn classify_failure(status: StatusCode, body: &str) -> ActionError {
    let parsed: BrokerErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let detail = parsed
        .description
        .or(parsed.error)
        .unwrap_or_else(|| body.chars().take(200).collect());
    let message = format!("broker responded {}: {}", status.as_u16(), detail);

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ActionError::Transient(message)
    } else {
        ActionError::Permanent(message)
    }
}

fn network_error(err: reqwest::Error) -> ActionError {
    ActionError::Transient(format!("broker unreachable: {}", err))
}
