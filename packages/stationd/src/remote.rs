//! Client for the remote verification service.

use std::{future::Future, time::Duration};

use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snafu::Snafu;
use stationd_interface::OrderContext;
use tracing::{debug, trace};

use crate::config::RemoteConfig;

/// Failure reported by (or while reaching) the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("remote service error: {code}"))]
pub struct ServiceError {
    pub code: String,
}

impl ServiceError {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

/// Remote calls the station depends on.
pub trait RemoteService: Send + Sync + 'static {
    /// Issues the service tag printed on the unit being programmed.
    fn issue_service_tag(
        &self,
        order: &OrderContext,
    ) -> impl Future<Output = Result<String, ServiceError>> + Send;

    /// Checks a scanned unit and returns the identifier it matched.
    fn verify_scan(
        &self,
        order: &OrderContext,
        scan: &str,
    ) -> impl Future<Output = Result<String, ServiceError>> + Send;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckRequest<'a> {
    order_context: &'a OrderContext,
    scan_result: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceTagResponse {
    service_tag: String,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    nc12: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    code: String,
}

/// [`RemoteService`] over JSON/HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemoteService {
    client: Client,
    base_url: String,
}

impl HttpRemoteService {
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, ServiceError> {
        let url = format!("{}/{}", self.base_url, path);
        trace!(%url, "sending request to remote service");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e, %url, "remote service unreachable");
                if e.is_timeout() {
                    ServiceError::new("TIMEOUT")
                } else {
                    ServiceError::new("REMOTE_UNREACHABLE")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let code = match response.json::<ErrorResponse>().await {
                Ok(body) => body.code,
                Err(_) => format!("HTTP_{}", status.as_u16()),
            };
            return Err(ServiceError { code });
        }

        response
            .json()
            .await
            .map_err(|_| ServiceError::new("INVALID_RESPONSE"))
    }
}

impl RemoteService for HttpRemoteService {
    async fn issue_service_tag(&self, order: &OrderContext) -> Result<String, ServiceError> {
        let response: ServiceTagResponse = self.post("serviceTags", order).await?;
        Ok(response.service_tag)
    }

    async fn verify_scan(&self, order: &OrderContext, scan: &str) -> Result<String, ServiceError> {
        let request = CheckRequest {
            order_context: order,
            scan_result: scan,
        };
        let response: CheckResponse = self.post("hidLamps;check", &request).await?;
        Ok(response.nc12)
    }
}
