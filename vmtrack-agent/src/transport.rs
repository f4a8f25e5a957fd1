//! Transport (C3, agent side) — authenticated request/reply against the manager.
//!
//! Per-event calls get a generous timeout and a handful of retries since
//! they're best-effort (the snapshot path is what actually guarantees
//! convergence). The heartbeat is intentionally unforgiving: a 5s
//! timeout and no retry, because a missed heartbeat is absorbed by the
//! very next tick rather than worth blocking on.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use vmtrack_wire::{
    ErrorReply, ForceSyncRequest, ForceSyncReply, HeartbeatReply, HeartbeatRequest,
    RegisterReply, RegisterRequest, VmStartReply, VmStartRequest, VmStopReply, VmStopRequest,
    VmStatesReply, VmStatesRequest,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_EVENT_RETRIES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to manager failed: {0}")]
    Connection(String),
    #[error("manager request timed out")]
    Timeout,
    #[error("manager rejected credentials (401/403)")]
    Auth,
    #[error("manager returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("failed to decode manager reply: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Client for the six `/api/ingest/*` endpoints exposed by the manager.
pub struct ManagerClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ManagerClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction never fails with these options");

        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Register this node, retrying with exponential backoff (capped at
    /// 60s) until it succeeds — a daemon with no manager to report to
    /// has nothing useful to do, so this blocks indefinitely.
    pub async fn register_with_retry(&self, req: &RegisterRequest) -> RegisterReply {
        let mut retry_delay = Duration::from_secs(1);
        let max_retry_delay = Duration::from_secs(60);

        loop {
            match self.register(req).await {
                Ok(reply) => return reply,
                Err(e) => {
                    warn!(error = %e, retry_in_secs = retry_delay.as_secs(), "registration failed, retrying");
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = std::cmp::min(retry_delay * 2, max_retry_delay);
                }
            }
        }
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterReply> {
        self.post_with_retries("/api/ingest/register", req, MAX_EVENT_RETRIES)
            .await
    }

    pub async fn vm_start(&self, req: &VmStartRequest) -> Result<VmStartReply> {
        self.post_with_retries("/api/ingest/vm-start", req, MAX_EVENT_RETRIES)
            .await
    }

    pub async fn vm_stop(&self, req: &VmStopRequest) -> Result<VmStopReply> {
        self.post_with_retries("/api/ingest/vm-stop", req, MAX_EVENT_RETRIES)
            .await
    }

    pub async fn vm_states(&self, req: &VmStatesRequest) -> Result<VmStatesReply> {
        self.post_with_retries("/api/ingest/vm-states", req, MAX_EVENT_RETRIES)
            .await
    }

    /// One-shot, no retry, short timeout — a missed heartbeat costs
    /// nothing since the next tick tries again.
    pub async fn heartbeat(&self, node: &str) -> Result<HeartbeatReply> {
        let req = HeartbeatRequest {
            node: node.to_string(),
            timestamp: Utc::now(),
        };
        self.post_once("/api/ingest/heartbeat", &req, HEARTBEAT_TIMEOUT)
            .await
    }

    pub async fn force_sync(&self, req: &ForceSyncRequest) -> Result<ForceSyncReply> {
        self.post_with_retries("/api/ingest/force-sync", req, MAX_EVENT_RETRIES)
            .await
    }

    async fn post_with_retries<Req, Rep>(&self, path: &str, req: &Req, max_retries: u32) -> Result<Rep>
    where
        Req: serde::Serialize,
        Rep: serde::de::DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            match self.post_once(path, req, EVENT_TIMEOUT).await {
                Ok(reply) => return Ok(reply),
                Err(TransportError::Auth) => return Err(TransportError::Auth),
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    debug!(path, attempt, error = %e, "retrying ingest call");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once<Req, Rep>(&self, path: &str, req: &Req, timeout: Duration) -> Result<Rep>
    where
        Req: serde::Serialize,
        Rep: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("X-API-Key", &self.api_key)
            .json(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Connection(e.to_string())
                }
            })?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED
            || resp.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(TransportError::Auth);
        }

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp
                .json::<ErrorReply>()
                .await
                .map(|e| e.error)
                .unwrap_or_else(|_| "<undecodable body>".to_string());
            return Err(TransportError::Rejected { status, body });
        }

        resp.json::<Rep>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}
