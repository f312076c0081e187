//! JSON request/response calls to the backend, gated on supervisor state.

use crate::error::{Result, SupervisorError};
use crate::process::Supervisor;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

#[derive(Clone)]
pub struct RequestGateway {
    supervisor: Supervisor,
}

impl RequestGateway {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    /// Sends `body` as JSON to `path` and parses the response as JSON.
    ///
    /// Fails with [`SupervisorError::NotRunning`] without touching the network
    /// unless the supervisor reports the backend as running.
    #[instrument(skip(self, body, headers))]
    pub async fn request<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        headers: Option<HeaderMap>,
    ) -> Result<Value>
    where
        B: Serialize + ?Sized,
    {
        self.request_as(method, path, body, headers).await
    }

    /// Like [`request`](Self::request), deserializing into `T`.
    pub async fn request_as<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        headers: Option<HeaderMap>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        if !self.supervisor.status().running {
            return Err(SupervisorError::NotRunning);
        }

        let mut merged = HeaderMap::new();
        merged.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(headers) = headers {
            // Caller headers win over the defaults.
            for (name, value) in headers.iter() {
                merged.insert(name.clone(), value.clone());
            }
        }

        let url = self.supervisor.config().url(path);
        let mut request = self
            .supervisor
            .client()
            .request(method, &url)
            .headers(merged);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, %url, "Backend request failed");
            return Err(SupervisorError::RequestFailed {
                status: status.as_u16(),
                body,
            });
        }
        debug!(%status, "Backend request succeeded");
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| SupervisorError::InvalidResponse(err.to_string()))
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request::<Value>(Method::GET, path, None, None).await
    }

    pub async fn post<B>(&self, path: &str, body: &B) -> Result<Value>
    where
        B: Serialize + ?Sized,
    {
        self.request(Method::POST, path, Some(body), None).await
    }
}
