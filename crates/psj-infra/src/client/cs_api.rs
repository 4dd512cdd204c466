use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use psj_core::ports::ServerDirectory;
use psj_core::sync::SyncCheck;
use psj_core::{HarnessConfig, RoomId, RoomVersion, ServerName, UserId};
use reqwest::{Method, Response};
use serde_json::Value;

use crate::http::encode_path;

/// Long-poll timeout for the incremental syncs of [`CsApi::sync_until`].
const SYNC_UNTIL_POLL: Duration = Duration::from_millis(1000);

/// Parameters of one `/sync` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReq {
    /// Filter JSON, passed inline
    pub filter: Option<String>,
    pub since: Option<String>,
    /// Long-poll timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

impl SyncReq {
    pub fn with_filter(filter: String) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }
}

/// A logged-in user on one homeserver.
///
/// The homeserver's address is resolved on every request, so a handle stays
/// valid across restarts.
#[derive(Clone)]
pub struct CsApi {
    server_name: ServerName,
    user_id: UserId,
    access_token: String,
    directory: Arc<dyn ServerDirectory>,
    http: reqwest::Client,
    sync_until_bound: Duration,
}

impl CsApi {
    pub fn new(
        server_name: ServerName,
        user_id: UserId,
        access_token: String,
        directory: Arc<dyn ServerDirectory>,
        config: &HarnessConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.homeserver.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            server_name,
            user_id,
            access_token,
            directory,
            http,
            sync_until_bound: config.waits.sync_until(),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn server_name(&self) -> &ServerName {
        &self.server_name
    }

    /// Send a request and return the raw response whatever its status.
    ///
    /// `path` holds unencoded segments, e.g. `["_matrix", "client", "v3",
    /// "rooms", room_id, "members"]`.
    pub async fn do_request(
        &self,
        method: Method,
        path: &[&str],
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Response> {
        let base = self
            .directory
            .base_url(&self.server_name)
            .ok_or_else(|| anyhow!("{} is not reachable", self.server_name))?;
        let url = format!("{}{}", base, encode_path(path));

        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.access_token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        tracing::trace!(user = %self.user_id, %method, %url, "client request");
        request
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))
    }

    /// Like [`do_request`](Self::do_request), but non-2xx is an error and
    /// the body is parsed as JSON.
    pub async fn must_do_request(
        &self,
        method: Method,
        path: &[&str],
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let response = self.do_request(method.clone(), path, query, body).await?;
        let status = response.status();
        let text = response.text().await.context("Failed to read response body")?;
        if !status.is_success() {
            bail!("{} /{} returned {}: {}", method, path.join("/"), status, text);
        }
        serde_json::from_str(&text)
            .with_context(|| format!("{} /{} returned invalid JSON", method, path.join("/")))
    }

    pub async fn create_room(&self, body: Value) -> Result<RoomId> {
        let response = self
            .must_do_request(
                Method::POST,
                &["_matrix", "client", "v3", "createRoom"],
                &[],
                Some(&body),
            )
            .await?;
        room_id_of(&response)
    }

    /// Join by room id through any of `via`.
    pub async fn join_room(&self, room_id: &RoomId, via: &[ServerName]) -> Result<RoomId> {
        let query: Vec<(&str, &str)> = via.iter().map(|s| ("server_name", s.as_str())).collect();
        let response = self
            .must_do_request(
                Method::POST,
                &["_matrix", "client", "v3", "join", room_id.as_str()],
                &query,
                Some(&Value::Object(Default::default())),
            )
            .await
            .with_context(|| format!("{} failed to join {}", self.user_id, room_id))?;
        tracing::debug!(user = %self.user_id, room = %room_id, "join completed");
        room_id_of(&response)
    }

    /// One `/sync`; returns the response and its `next_batch`.
    pub async fn sync(&self, req: &SyncReq) -> Result<(Value, String)> {
        let timeout = req.timeout_ms.map(|ms| ms.to_string());
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(filter) = &req.filter {
            query.push(("filter", filter));
        }
        if let Some(since) = &req.since {
            query.push(("since", since));
        }
        if let Some(timeout) = &timeout {
            query.push(("timeout", timeout));
        }

        let response = self
            .must_do_request(Method::GET, &["_matrix", "client", "v3", "sync"], &query, None)
            .await?;
        let next_batch = response
            .get("next_batch")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("sync response has no next_batch"))?
            .to_string();
        Ok((response, next_batch))
    }

    /// Sync repeatedly until `check` passes on a response; returns that
    /// response's `next_batch`.
    ///
    /// The first sync uses `req` as given; later ones continue from the
    /// previous token with a long-poll timeout.
    pub async fn sync_until(&self, req: SyncReq, check: SyncCheck) -> Result<String> {
        let bound = self.sync_until_bound;
        let user_id = self.user_id.clone();
        // Survives the attempt being dropped on timeout.
        let last_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        let attempt = async {
            let mut req = req;
            loop {
                let (response, next_batch) = self.sync(&req).await?;
                match check(&user_id, &response) {
                    Ok(()) => return Ok::<_, anyhow::Error>(next_batch),
                    Err(err) => {
                        tracing::trace!(user = %user_id, reason = %err, "sync check not yet satisfied");
                        *last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                    }
                }
                req.since = Some(next_batch);
                req.timeout_ms = Some(SYNC_UNTIL_POLL.as_millis() as u64);
            }
        };
        let outcome = tokio::time::timeout(bound, attempt).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                let reason = last_error
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .map(|err| format!("{err:#}"))
                    .unwrap_or_else(|| "no sync response received".to_string());
                Err(anyhow!(
                    "{}: sync_until did not pass within {:?}: {}",
                    self.user_id,
                    bound,
                    reason
                ))
            }
        }
    }

    pub async fn default_room_version(&self) -> Result<RoomVersion> {
        let response = self
            .must_do_request(
                Method::GET,
                &["_matrix", "client", "v3", "capabilities"],
                &[],
                None,
            )
            .await?;
        response
            .pointer("/capabilities/m.room_versions/default")
            .and_then(Value::as_str)
            .map(RoomVersion::from)
            .ok_or_else(|| anyhow!("capabilities carry no default room version"))
    }
}

fn room_id_of(response: &Value) -> Result<RoomId> {
    response
        .get("room_id")
        .and_then(Value::as_str)
        .map(RoomId::from)
        .ok_or_else(|| anyhow!("response has no room_id: {}", response))
}
