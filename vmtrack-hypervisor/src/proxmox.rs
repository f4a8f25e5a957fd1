//! Proxmox VE-backed implementation of [`HypervisorProbe`].
//!
//! Queries `/api2/json/nodes/{node}/qemu` and `/lxc` with
//! `PVEAPIToken=user!token_name=token_value` auth. Bounded by a 10s
//! timeout; a single request failure fails the whole `list_vms` call —
//! the agent state engine decides what to do next.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ProbeError, Result};
use crate::traits::HypervisorProbe;
use crate::types::{VmKind, VmState, VmStatus};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ProxmoxProbe {
    base_url: String,
    node: String,
    auth_header: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct RawVmEntry {
    vmid: serde_json::Value,
    name: Option<String>,
    status: String,
    uptime: Option<u64>,
}

impl ProxmoxProbe {
    pub fn new(
        host: &str,
        port: u16,
        user: &str,
        token_name: &str,
        token_value: &str,
        verify_ssl: bool,
        node: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: format!("https://{host}:{port}/api2/json"),
            node: node.into(),
            auth_header: format!("PVEAPIToken={user}!{token_name}={token_value}"),
            client,
        })
    }

    async fn fetch_kind(&self, kind: VmKind) -> Result<Vec<VmState>> {
        let type_path = match kind {
            VmKind::FullVm => "qemu",
            VmKind::Container => "lxc",
        };
        let url = format!("{}/nodes/{}/{}", self.base_url, self.node, type_path);

        let resp = self
            .client
            .get(&url)
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout(DEFAULT_TIMEOUT)
                } else {
                    ProbeError::Transport(e.to_string())
                }
            })?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED
            || resp.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ProbeError::Auth);
        }
        if !resp.status().is_success() {
            return Err(ProbeError::Transport(format!(
                "hypervisor API returned {}",
                resp.status()
            )));
        }

        let envelope: ApiEnvelope<Vec<RawVmEntry>> = resp
            .json()
            .await
            .map_err(|e| ProbeError::Decode(e.to_string()))?;

        Ok(envelope
            .data
            .into_iter()
            .map(|raw| {
                let vm_id = match &raw.vmid {
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::String(s) => s.clone(),
                    other => {
                        warn!(?other, "unexpected vmid shape in hypervisor reply");
                        String::new()
                    }
                };
                let status = VmStatus::from_hypervisor_str(&raw.status);
                if status == VmStatus::Unknown {
                    debug!(vm_id = %vm_id, raw_status = %raw.status, "unrecognized VM status, mapped to unknown");
                }
                VmState {
                    node: self.node.clone(),
                    vm_id,
                    kind,
                    name: raw.name,
                    status,
                    uptime_seconds: raw.uptime.unwrap_or(0),
                }
            })
            .collect())
    }
}

#[async_trait]
impl HypervisorProbe for ProxmoxProbe {
    async fn list_vms(&self, include_full_vm: bool, include_container: bool) -> Result<Vec<VmState>> {
        let mut vms = Vec::new();
        if include_full_vm {
            vms.extend(self.fetch_kind(VmKind::FullVm).await?);
        }
        if include_container {
            vms.extend(self.fetch_kind(VmKind::Container).await?);
        }
        Ok(vms)
    }
}
