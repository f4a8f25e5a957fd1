//! # vmtrack Hypervisor
//!
//! Hypervisor abstraction layer for the uptime-tracking agent.
//!
//! This crate defines the read-only probe contract an agent uses to
//! enumerate VMs and containers on its local node (`HypervisorProbe`),
//! plus two implementations:
//! - [`MockProbe`] — in-memory, used for tests and `--dev` runs.
//! - [`ProxmoxProbe`] — talks to a Proxmox VE node's REST API.
//!
//! The probe itself holds no session/uptime bookkeeping; that is the
//! agent state engine's job (`vmtrack-agent`). A probe failure is
//! reported as an error and never causes the caller to fabricate state.

pub mod error;
pub mod mock;
pub mod proxmox;
pub mod traits;
pub mod types;

pub use error::ProbeError;
pub use mock::MockProbe;
pub use proxmox::ProxmoxProbe;
pub use traits::HypervisorProbe;
pub use types::{VmKind, VmState, VmStatus};
