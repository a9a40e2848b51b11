//! NetworkManager boundary
//!
//! The kill switch only ever talks to NetworkManager through the [`NmClient`]
//! trait: add/delete/lookup of connection profiles plus two daemon-level
//! queries. The production implementation shells out to `nmcli` (and `busctl`
//! for the one D-Bus property nmcli does not expose); tests swap in a scripted
//! mock.

pub mod nmcli;

#[cfg(test)]
pub(crate) mod mock;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;

pub use nmcli::NmCli;

#[derive(Error, Debug)]
pub enum NmError {
    #[error("Failed to launch {tool}: {source}")]
    Launch {
        tool: &'static str,
        source: std::io::Error,
    },
    #[error("{command} failed (exit code {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("Connection not known to NetworkManager: {0}")]
    NotFound(String),
    #[error("NetworkManager is not running")]
    NotRunning,
    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
    #[error("Unexpected output from {command}: {output}")]
    UnexpectedOutput { command: String, output: String },
}

impl NmError {
    /// Whether retrying the same call can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NmError::CommandFailed { .. } | NmError::Timeout { .. }
        )
    }
}

/// Per-family IP settings of a dummy connection profile.
///
/// A present family is configured with method `manual`; an absent one is
/// disabled outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpFamilyConfig {
    pub addresses: Vec<IpNet>,
    pub gateway: Option<IpAddr>,
    pub dns: Vec<IpAddr>,
    pub dns_priority: i32,
    pub ignore_auto_dns: bool,
    pub route_metric: u32,
}

/// Everything NetworkManager needs to create a dummy connection profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    /// Human-readable connection id (`connection.id`).
    pub id: String,
    /// Interface name of the dummy device (`connection.interface-name`).
    pub interface: String,
    /// Whether the profile is written to disk or kept in memory only.
    pub persist: bool,
    pub ipv4: Option<IpFamilyConfig>,
    pub ipv6: Option<IpFamilyConfig>,
}

/// Opaque handle to a connection NetworkManager already knows about.
///
/// Existence of the handle is the only state the kill switch tracks; deletion
/// goes through the uuid because the daemon tolerates duplicate ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmConnection {
    pub id: String,
    pub uuid: String,
    pub interface: Option<String>,
}

/// Async client for NetworkManager's connection-management surface.
#[async_trait]
pub trait NmClient: Send + Sync {
    /// Create (and autoconnect) a connection profile.
    async fn add_connection(&self, spec: &ConnectionSpec) -> Result<(), NmError>;

    /// Delete a connection by uuid.
    async fn delete_connection(&self, uuid: &str) -> Result<(), NmError>;

    /// Look up a connection by its human-readable id.
    async fn get_connection(&self, id: &str) -> Result<Option<NmConnection>, NmError>;

    /// Whether the NetworkManager daemon is up.
    async fn is_running(&self) -> Result<bool, NmError>;

    /// Current value of the daemon's ConnectivityCheckEnabled property.
    async fn connectivity_check_enabled(&self) -> Result<bool, NmError>;

    /// Flip the daemon's ConnectivityCheckEnabled property.
    async fn set_connectivity_check(&self, enabled: bool) -> Result<(), NmError>;
}

/// The client used outside of tests.
pub fn system_client() -> Arc<dyn NmClient> {
    Arc::new(NmCli::new())
}
