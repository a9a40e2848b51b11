//! Kill switch connection management
//!
//! One handler method per well-known connection and direction. Mutations look
//! the connection up first: adding something that exists fails with
//! [`KillSwitchError::AlreadyExists`], removing something missing fails with
//! [`KillSwitchError::NotFound`]. The reconciling layer above decides when
//! those count as success.
//!
//! Transient daemon failures are retried a fixed number of times with a short
//! pause; everything else surfaces immediately.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::connection::{
    FULL_CONNECTION_ID, IPV6_CONNECTION_ID, KillSwitchConfig, ROUTED_CONNECTION_ID,
};
use crate::nm::{NmClient, NmError, system_client};

#[derive(Error, Debug)]
pub enum KillSwitchError {
    #[error("Kill switch connection already present: {0}")]
    AlreadyExists(String),
    #[error("Kill switch connection not found: {0}")]
    NotFound(String),
    #[error("Failed to start kill switch connection {id}: {source}")]
    Start { id: String, source: NmError },
    #[error("Failed to stop kill switch connection {id}: {source}")]
    Stop { id: String, source: NmError },
    #[error("Failed to disable connectivity checking: {source}")]
    ConnectivityCheck { source: NmError },
    #[error("NetworkManager is not running")]
    NotRunning,
}

/// Bounded retry for transient daemon failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

pub struct KillSwitchConnectionHandler {
    client: Arc<dyn NmClient>,
    retry: RetryPolicy,
}

impl KillSwitchConnectionHandler {
    pub fn new() -> Self {
        Self::with_client(system_client())
    }

    pub fn with_client(client: Arc<dyn NmClient>) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Blackhole both address families.
    pub async fn add_full_killswitch_connection(
        &self,
        permanent: bool,
    ) -> Result<(), KillSwitchError> {
        self.add(KillSwitchConfig::full_block(), permanent).await
    }

    pub async fn remove_full_killswitch_connection(&self) -> Result<(), KillSwitchError> {
        self.remove(FULL_CONNECTION_ID).await
    }

    /// Blackhole everything except `server_ip`.
    pub async fn add_routed_killswitch_connection(
        &self,
        server_ip: Ipv4Addr,
        permanent: bool,
    ) -> Result<(), KillSwitchError> {
        self.add(KillSwitchConfig::routed_block(server_ip), permanent)
            .await
    }

    pub async fn remove_routed_killswitch_connection(&self) -> Result<(), KillSwitchError> {
        self.remove(ROUTED_CONNECTION_ID).await
    }

    /// Re-point the routed exception at a new server. The daemon cannot edit
    /// the address list in place, so this is a remove (when present) plus add.
    pub async fn update_routed_killswitch_connection(
        &self,
        server_ip: Ipv4Addr,
        permanent: bool,
    ) -> Result<(), KillSwitchError> {
        match self.remove_routed_killswitch_connection().await {
            Ok(()) | Err(KillSwitchError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.add_routed_killswitch_connection(server_ip, permanent)
            .await
    }

    pub async fn add_ipv6_leak_protection(&self, permanent: bool) -> Result<(), KillSwitchError> {
        self.add(KillSwitchConfig::ipv6_leak_protection(), permanent)
            .await
    }

    pub async fn remove_ipv6_leak_protection(&self) -> Result<(), KillSwitchError> {
        self.remove(IPV6_CONNECTION_ID).await
    }

    pub async fn is_full_killswitch_active(&self) -> bool {
        self.connection_exists(FULL_CONNECTION_ID).await
    }

    pub async fn is_routed_killswitch_active(&self) -> bool {
        self.connection_exists(ROUTED_CONNECTION_ID).await
    }

    pub async fn is_ipv6_leak_protection_active(&self) -> bool {
        self.connection_exists(IPV6_CONNECTION_ID).await
    }

    pub async fn is_network_manager_running(&self) -> bool {
        match self.client.is_running().await {
            Ok(running) => running,
            Err(err) => {
                debug!("Could not query NetworkManager state: {}", err);
                false
            }
        }
    }

    pub async fn ensure_available(&self) -> Result<(), KillSwitchError> {
        if self.is_network_manager_running().await {
            Ok(())
        } else {
            Err(KillSwitchError::NotRunning)
        }
    }

    async fn add(&self, config: KillSwitchConfig, permanent: bool) -> Result<(), KillSwitchError> {
        let id = config.general.id.clone();

        let existing = self
            .client
            .get_connection(&id)
            .await
            .map_err(|source| KillSwitchError::Start {
                id: id.clone(),
                source,
            })?;
        if existing.is_some() {
            return Err(KillSwitchError::AlreadyExists(id));
        }

        self.disable_connectivity_check().await?;

        let spec = config.to_spec(permanent);
        info!(
            "Adding kill switch connection {} (permanent: {})",
            id, permanent
        );
        self.retrying(|| self.client.add_connection(&spec))
            .await
            .map_err(|source| KillSwitchError::Start {
                id: id.clone(),
                source,
            })?;

        debug!("Kill switch connection {} added", id);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), KillSwitchError> {
        let connection = self
            .client
            .get_connection(id)
            .await
            .map_err(|source| KillSwitchError::Stop {
                id: id.to_string(),
                source,
            })?
            .ok_or_else(|| KillSwitchError::NotFound(id.to_string()))?;

        info!("Removing kill switch connection {}", id);
        self.retrying(|| self.client.delete_connection(&connection.uuid))
            .await
            .map_err(|source| match source {
                NmError::NotFound(_) => KillSwitchError::NotFound(id.to_string()),
                source => KillSwitchError::Stop {
                    id: id.to_string(),
                    source,
                },
            })?;

        debug!("Kill switch connection {} removed", id);
        Ok(())
    }

    /// The daemon penalizes dummy-connection route metrics (pushed to 20000)
    /// while its connectivity check runs, which would defeat the block.
    async fn disable_connectivity_check(&self) -> Result<(), KillSwitchError> {
        let enabled = self
            .client
            .connectivity_check_enabled()
            .await
            .map_err(|source| KillSwitchError::ConnectivityCheck { source })?;
        if !enabled {
            return Ok(());
        }

        info!("Disabling NetworkManager connectivity checking");
        self.client
            .set_connectivity_check(false)
            .await
            .map_err(|source| KillSwitchError::ConnectivityCheck { source })
    }

    async fn connection_exists(&self, id: &str) -> bool {
        match self.client.get_connection(id).await {
            Ok(connection) => connection.is_some(),
            Err(err) => {
                debug!("Lookup of {} failed: {}", id, err);
                false
            }
        }
    }

    async fn retrying<T, F, Fut>(&self, mut call: F) -> Result<T, NmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NmError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry.attempts => {
                    warn!(
                        "{} (attempt {}/{}), retrying",
                        err, attempt, self.retry.attempts
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for KillSwitchConnectionHandler {
    fn default() -> Self {
        Self::new()
    }
}
