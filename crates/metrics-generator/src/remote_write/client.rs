// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for one remote-write endpoint.
//!
//! A batch is encoded once and then sent up to `max_attempts` times.
//! Network errors, `429` and `5xx` responses are retried with exponential
//! backoff; a `Retry-After` header can lengthen the wait but never past
//! `max_backoff`. Any other non-2xx status is a permanent rejection.
//! `Retry-After` is accepted both as delay-seconds and as an HTTP-date.
//!
//! Both the request and the backoff sleep give way to cancellation, so a
//! shutdown never waits out a retry schedule.

use super::proto;
use super::ExportError;
use crate::config::{BasicAuth, RemoteWriteConfig};
use crate::sample::ExportBatch;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER,
};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const REMOTE_WRITE_VERSION: &str = "0.1.0";
pub const TENANT_HEADER: &str = "X-Scope-OrgID";
const VERSION_HEADER: &str = "X-Prometheus-Remote-Write-Version";
const MAX_ERROR_BODY: usize = 256;

/// Outcome of a single failed attempt.
enum AttemptError {
    Retry {
        message: String,
        retry_after: Option<Duration>,
    },
    Fatal(ExportError),
}

#[derive(Debug, Clone)]
pub struct RemoteWriteClient {
    http: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    basic_auth: Option<BasicAuth>,
    external_labels: HashMap<String, String>,
    max_attempts: u32,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl RemoteWriteClient {
    pub fn new(config: &RemoteWriteConfig) -> Result<Self, ExportError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ExportError::Build(format!("failed to create HTTP client: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ExportError::Build(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ExportError::Build(format!("invalid value for header '{name}': {e}")))?;
            headers.insert(name, value);
        }
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("snappy"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));
        headers.insert(VERSION_HEADER, HeaderValue::from_static(REMOTE_WRITE_VERSION));

        Ok(RemoteWriteClient {
            http,
            endpoint: config.endpoint.clone(),
            headers,
            basic_auth: config.basic_auth.clone(),
            external_labels: config.external_labels.clone(),
            max_attempts: config.max_attempts.max(1),
            min_backoff: config.min_backoff(),
            max_backoff: config.max_backoff(),
        })
    }

    /// Delivers `batch` as one request, retrying transient failures, until
    /// `cancel` fires.
    pub async fn push(
        &self,
        batch: &ExportBatch,
        cancel: &CancellationToken,
    ) -> Result<(), ExportError> {
        let request = proto::write_request(batch, &self.external_labels);
        let body = proto::encode(&request)?;
        debug!(
            "Pushing {} series ({} bytes) for tenant {}",
            request.timeseries.len(),
            body.len(),
            batch.tenant
        );

        let mut attempts = 0;
        loop {
            attempts += 1;
            let start = Instant::now();
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ExportError::Cancelled { attempts }),
                outcome = self.send_once(&batch.tenant, body.clone()) => outcome,
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retry {
                    message,
                    retry_after,
                }) => {
                    if attempts >= self.max_attempts {
                        return Err(ExportError::RetriesExhausted {
                            attempts,
                            last: message,
                        });
                    }
                    let delay = self.backoff(attempts, retry_after);
                    warn!(
                        "Remote write attempt {attempts} for tenant {} failed after {} ms: {message}, retrying in {} ms",
                        batch.tenant,
                        start.elapsed().as_millis(),
                        delay.as_millis()
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(ExportError::Cancelled { attempts }),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Wait before attempt `attempts + 1`.
    #[must_use]
    pub fn backoff(&self, attempts: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempts.saturating_sub(1).min(30);
        let delay = self
            .min_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff);
        match retry_after {
            Some(hint) => delay.max(hint.min(self.max_backoff)),
            None => delay,
        }
    }

    async fn send_once(&self, tenant: &str, body: Vec<u8>) -> Result<(), AttemptError> {
        let tenant_value = HeaderValue::from_str(tenant).map_err(|e| {
            AttemptError::Fatal(ExportError::Build(format!("invalid tenant id '{tenant}': {e}")))
        })?;
        let mut request = self
            .http
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .header(TENANT_HEADER, tenant_value)
            .body(body);
        if let Some(auth) = &self.basic_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Err(AttemptError::Fatal(ExportError::Build(e.to_string())));
            }
            Err(e) => {
                return Err(AttemptError::Retry {
                    message: e.to_string(),
                    retry_after: None,
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }

        if is_transient(status) {
            Err(AttemptError::Retry {
                message: format!("{status}: {body}"),
                retry_after,
            })
        } else {
            Err(AttemptError::Fatal(ExportError::Rejected {
                status: status.as_u16(),
                message: body,
            }))
        }
    }
}

/// Reads a `Retry-After` value, either delay-seconds or an HTTP-date
/// relative to `now`. A date in the past means no extra wait.
#[must_use]
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        at.with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

/// Throttling and server errors are worth retrying; every other failure
/// status means the request itself is wrong.
#[must_use]
pub fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
