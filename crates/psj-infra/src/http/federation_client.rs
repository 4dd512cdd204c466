use std::sync::Arc;
use std::time::Duration;

use psj_core::federation::x_matrix_authorization;
use psj_core::ports::ServerDirectory;
use psj_core::ServerName;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("cannot resolve server {0}")]
    Unresolvable(ServerName),

    #[error("request to {0} failed: {1}")]
    Transport(ServerName, #[source] reqwest::Error),

    #[error("{server} answered {status}: {body}")]
    Status {
        server: ServerName,
        status: StatusCode,
        body: String,
    },

    /// The peer answered 2xx with a body that does not have the expected shape.
    #[error("malformed response from {0}: {1}")]
    Malformed(ServerName, #[source] serde_json::Error),
}

/// Outbound server-server requests on behalf of `origin`.
#[derive(Clone)]
pub struct FederationClient {
    origin: ServerName,
    directory: Arc<dyn ServerDirectory>,
    http: reqwest::Client,
}

impl FederationClient {
    pub fn new(
        origin: ServerName,
        directory: Arc<dyn ServerDirectory>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            origin,
            directory,
            http,
        })
    }

    pub fn origin(&self) -> &ServerName {
        &self.origin
    }

    /// `path` must already be percent-encoded (see [`super::encode_path`]).
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        destination: &ServerName,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<T, FederationError> {
        let base = self
            .directory
            .base_url(destination)
            .ok_or_else(|| FederationError::Unresolvable(destination.clone()))?;

        let mut request = self
            .http
            .request(method.clone(), format!("{}{}", base, path))
            .header(
                reqwest::header::AUTHORIZATION,
                x_matrix_authorization(&self.origin),
            )
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        tracing::debug!(origin = %self.origin, destination = %destination, %method, path, "federation request");
        let response = request
            .send()
            .await
            .map_err(|e| FederationError::Transport(destination.clone(), e))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FederationError::Transport(destination.clone(), e))?;

        if !status.is_success() {
            return Err(FederationError::Status {
                server: destination.clone(),
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| FederationError::Malformed(destination.clone(), e))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        destination: &ServerName,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FederationError> {
        self.request(Method::GET, destination, path, query, None).await
    }

    pub async fn put<T: DeserializeOwned>(
        &self,
        destination: &ServerName,
        path: &str,
        query: &[(&str, &str)],
        body: &Value,
    ) -> Result<T, FederationError> {
        self.request(Method::PUT, destination, path, query, Some(body))
            .await
    }
}
