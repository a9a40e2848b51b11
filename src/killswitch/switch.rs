//! Kill switch orchestration
//!
//! [`NmKillSwitch`] reconciles the daemon's observed connection set with the
//! desired [`Enforcement`] shape. Transitions never leave a window where
//! traffic can leak: the full block goes up before the routed exception
//! replaces it, and comes down last.

use std::net::Ipv4Addr;

use serde::Serialize;
use tracing::{debug, info};

use super::handler::{KillSwitchConnectionHandler, KillSwitchError};
use super::state::{ConnectionEvent, Enforcement, KillSwitchState};

/// User-facing knobs, normally read from the config file.
#[derive(Debug, Clone, Copy)]
pub struct KillSwitchSettings {
    /// Keep blocking across disconnects, errors and reboots.
    pub permanent: bool,
    /// Maintain the standalone IPv6 blackhole while the switch is engaged.
    /// When off, shape changes never touch it and the `ipv6` toggle commands
    /// manage it by hand.
    pub ipv6_leak_protection: bool,
}

impl Default for KillSwitchSettings {
    fn default() -> Self {
        Self {
            permanent: false,
            ipv6_leak_protection: true,
        }
    }
}

/// Snapshot of what is currently installed, for `status` output.
#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchStatus {
    pub network_manager_running: bool,
    pub full_block_active: bool,
    pub routed_active: bool,
    pub ipv6_leak_protection_active: bool,
    pub state: KillSwitchState,
}

pub struct NmKillSwitch {
    handler: KillSwitchConnectionHandler,
    settings: KillSwitchSettings,
    state: KillSwitchState,
}

impl NmKillSwitch {
    pub fn new(settings: KillSwitchSettings) -> Self {
        Self::with_handler(KillSwitchConnectionHandler::new(), settings)
    }

    pub fn with_handler(
        handler: KillSwitchConnectionHandler,
        settings: KillSwitchSettings,
    ) -> Self {
        Self {
            handler,
            settings,
            state: KillSwitchState::Off,
        }
    }

    pub fn state(&self) -> KillSwitchState {
        self.state
    }

    /// Engage the kill switch: routed around `server_ip` when given (the
    /// shape used while a tunnel is being established), full block otherwise.
    pub async fn enable(&mut self, server_ip: Option<Ipv4Addr>) -> Result<(), KillSwitchError> {
        let shape = match server_ip {
            Some(ip) => Enforcement::Routed(ip),
            None => Enforcement::FullBlock,
        };
        self.apply(shape).await?;
        self.state = match server_ip {
            Some(_) => KillSwitchState::Connecting,
            None => KillSwitchState::On,
        };
        Ok(())
    }

    /// Remove every kill switch connection.
    pub async fn disable(&mut self) -> Result<(), KillSwitchError> {
        self.apply(Enforcement::Disabled).await?;
        self.state = KillSwitchState::Off;
        Ok(())
    }

    /// Re-point the routed exception at a new server, keeping the full block
    /// up while the swap happens.
    pub async fn update(&mut self, server_ip: Ipv4Addr) -> Result<(), KillSwitchError> {
        info!("Moving routed exception to {}", server_ip);
        self.enable(Some(server_ip)).await
    }

    /// React to a VPN connection lifecycle event.
    pub async fn handle_event(&mut self, event: ConnectionEvent) -> Result<(), KillSwitchError> {
        let permanent = self.settings.permanent;
        match event.plan(permanent) {
            Some(shape) => self.apply(shape).await?,
            None => debug!("No enforcement change for {:?}", event),
        }
        self.state = event.next_state(permanent);
        Ok(())
    }

    /// The IPv6 blackhole alone, independent of the IPv4 shape.
    pub async fn enable_ipv6_leak_protection(&self) -> Result<(), KillSwitchError> {
        self.handler.ensure_available().await?;
        tolerate_existing(
            self.handler
                .add_ipv6_leak_protection(self.settings.permanent)
                .await,
        )
    }

    pub async fn disable_ipv6_leak_protection(&self) -> Result<(), KillSwitchError> {
        self.handler.ensure_available().await?;
        tolerate_missing(self.handler.remove_ipv6_leak_protection().await)
    }

    pub async fn status(&self) -> KillSwitchStatus {
        KillSwitchStatus {
            network_manager_running: self.handler.is_network_manager_running().await,
            full_block_active: self.handler.is_full_killswitch_active().await,
            routed_active: self.handler.is_routed_killswitch_active().await,
            ipv6_leak_protection_active: self.handler.is_ipv6_leak_protection_active().await,
            state: self.state,
        }
    }

    async fn apply(&self, shape: Enforcement) -> Result<(), KillSwitchError> {
        self.handler.ensure_available().await?;
        info!("Applying kill switch shape: {}", shape);

        let permanent = self.settings.permanent;
        match shape {
            Enforcement::FullBlock => {
                tolerate_existing(self.handler.add_full_killswitch_connection(permanent).await)?;
                tolerate_missing(self.handler.remove_routed_killswitch_connection().await)?;
            }
            Enforcement::Routed(server_ip) => {
                // Cover the swap with the full block so no packet can slip
                // out while the routed profile is being recreated
                tolerate_existing(self.handler.add_full_killswitch_connection(permanent).await)?;
                tolerate_missing(self.handler.remove_routed_killswitch_connection().await)?;
                self.handler
                    .add_routed_killswitch_connection(server_ip, permanent)
                    .await?;
                tolerate_missing(self.handler.remove_full_killswitch_connection().await)?;
            }
            Enforcement::Disabled => {
                tolerate_missing(self.handler.remove_full_killswitch_connection().await)?;
                tolerate_missing(self.handler.remove_routed_killswitch_connection().await)?;
            }
        }

        // With the setting off, the standalone toggle is the only owner of
        // the IPv6 connection and shape changes leave it alone
        if self.settings.ipv6_leak_protection {
            if shape.blocks_traffic() {
                tolerate_existing(self.handler.add_ipv6_leak_protection(permanent).await)?;
            } else {
                tolerate_missing(self.handler.remove_ipv6_leak_protection().await)?;
            }
        }

        Ok(())
    }
}

fn tolerate_existing(result: Result<(), KillSwitchError>) -> Result<(), KillSwitchError> {
    match result {
        Err(KillSwitchError::AlreadyExists(id)) => {
            debug!("{} already present, keeping it", id);
            Ok(())
        }
        other => other,
    }
}

fn tolerate_missing(result: Result<(), KillSwitchError>) -> Result<(), KillSwitchError> {
    match result {
        Err(KillSwitchError::NotFound(id)) => {
            debug!("{} already absent", id);
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::killswitch::connection::{
        FULL_CONNECTION_ID, IPV6_CONNECTION_ID, KillSwitchConfig, ROUTED_CONNECTION_ID,
    };
    use crate::killswitch::handler::RetryPolicy;
    use crate::nm::mock::MockNm;
    use std::sync::Arc;
    use std::time::Duration;

    fn switch(client: Arc<MockNm>, settings: KillSwitchSettings) -> NmKillSwitch {
        let handler = KillSwitchConnectionHandler::with_client(client).with_retry(RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        });
        NmKillSwitch::with_handler(handler, settings)
    }

    fn no_ipv6() -> KillSwitchSettings {
        KillSwitchSettings {
            permanent: false,
            ipv6_leak_protection: false,
        }
    }

    fn server() -> Ipv4Addr {
        "185.159.157.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_enable_without_server_adds_full_block_only() {
        let client = Arc::new(MockNm::new());
        let mut ks = switch(client.clone(), no_ipv6());

        ks.enable(None).await.unwrap();

        assert_eq!(client.log(), vec![format!("add {}", FULL_CONNECTION_ID)]);
        assert_eq!(ks.state(), KillSwitchState::On);
    }

    #[tokio::test]
    async fn test_enable_with_server_swaps_under_cover() {
        let client = Arc::new(MockNm::new());
        let mut ks = switch(client.clone(), no_ipv6());

        ks.enable(Some(server())).await.unwrap();

        assert_eq!(
            client.log(),
            vec![
                format!("add {}", FULL_CONNECTION_ID),
                format!("add {}", ROUTED_CONNECTION_ID),
                format!("delete {}", FULL_CONNECTION_ID),
            ]
        );
        assert_eq!(ks.state(), KillSwitchState::Connecting);
        assert!(client.has_connection(ROUTED_CONNECTION_ID));
        assert!(!client.has_connection(FULL_CONNECTION_ID));
    }

    #[tokio::test]
    async fn test_enable_with_server_replaces_stale_exception() {
        let client = Arc::new(MockNm::new());
        client.seed_connection(KillSwitchConfig::full_block().to_spec(false));
        client.seed_connection(KillSwitchConfig::routed_block(server()).to_spec(false));
        let mut ks = switch(client.clone(), no_ipv6());

        ks.enable(Some("185.159.158.9".parse().unwrap()))
            .await
            .unwrap();

        assert_eq!(
            client.log(),
            vec![
                format!("delete {}", ROUTED_CONNECTION_ID),
                format!("add {}", ROUTED_CONNECTION_ID),
                format!("delete {}", FULL_CONNECTION_ID),
            ]
        );
    }

    #[tokio::test]
    async fn test_enable_is_idempotent() {
        let client = Arc::new(MockNm::new());
        let mut ks = switch(client.clone(), no_ipv6());

        ks.enable(None).await.unwrap();
        ks.enable(None).await.unwrap();

        // The second pass finds the full block in place and changes nothing
        assert_eq!(client.log(), vec![format!("add {}", FULL_CONNECTION_ID)]);
    }

    #[tokio::test]
    async fn test_disable_removes_whatever_is_installed() {
        let client = Arc::new(MockNm::new());
        client.seed_connection(KillSwitchConfig::full_block().to_spec(false));
        client.seed_connection(KillSwitchConfig::routed_block(server()).to_spec(false));
        let mut ks = switch(client.clone(), no_ipv6());

        ks.disable().await.unwrap();

        assert_eq!(
            client.log(),
            vec![
                format!("delete {}", FULL_CONNECTION_ID),
                format!("delete {}", ROUTED_CONNECTION_ID),
            ]
        );
        assert_eq!(ks.state(), KillSwitchState::Off);
    }

    #[tokio::test]
    async fn test_disable_on_clean_system_is_a_no_op() {
        let client = Arc::new(MockNm::new());
        let mut ks = switch(client.clone(), no_ipv6());

        ks.disable().await.unwrap();

        assert!(client.log().is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_follows_the_shape() {
        let client = Arc::new(MockNm::new());
        let mut ks = switch(client.clone(), KillSwitchSettings::default());

        ks.enable(None).await.unwrap();
        assert!(client.has_connection(IPV6_CONNECTION_ID));

        ks.disable().await.unwrap();
        assert!(!client.has_connection(IPV6_CONNECTION_ID));
        assert_eq!(
            client.log(),
            vec![
                format!("add {}", FULL_CONNECTION_ID),
                format!("add {}", IPV6_CONNECTION_ID),
                format!("delete {}", FULL_CONNECTION_ID),
                format!("delete {}", IPV6_CONNECTION_ID),
            ]
        );
    }

    #[tokio::test]
    async fn test_manual_ipv6_blackhole_survives_when_setting_off() {
        let client = Arc::new(MockNm::new());
        client.seed_connection(KillSwitchConfig::ipv6_leak_protection().to_spec(false));
        let mut ks = switch(client.clone(), no_ipv6());

        ks.enable(None).await.unwrap();
        ks.disable().await.unwrap();

        assert!(client.has_connection(IPV6_CONNECTION_ID));
        assert_eq!(
            client.log(),
            vec![
                format!("add {}", FULL_CONNECTION_ID),
                format!("delete {}", FULL_CONNECTION_ID),
            ]
        );
    }

    #[tokio::test]
    async fn test_event_disconnected_tears_down_non_permanent() {
        let client = Arc::new(MockNm::new());
        client.seed_connection(KillSwitchConfig::full_block().to_spec(false));
        let mut ks = switch(client.clone(), no_ipv6());

        ks.handle_event(ConnectionEvent::Disconnected).await.unwrap();

        assert!(!client.has_connection(FULL_CONNECTION_ID));
        assert_eq!(ks.state(), KillSwitchState::Off);
    }

    #[tokio::test]
    async fn test_event_disconnected_keeps_permanent_blocking() {
        let client = Arc::new(MockNm::new());
        let settings = KillSwitchSettings {
            permanent: true,
            ipv6_leak_protection: false,
        };
        let mut ks = switch(client.clone(), settings);

        ks.handle_event(ConnectionEvent::Disconnected).await.unwrap();

        let spec = client.connection_spec(FULL_CONNECTION_ID).unwrap();
        assert!(spec.persist);
        assert_eq!(ks.state(), KillSwitchState::On);
    }

    #[tokio::test]
    async fn test_event_error_leaves_shape_alone() {
        let client = Arc::new(MockNm::new());
        client.seed_connection(KillSwitchConfig::routed_block(server()).to_spec(false));
        let mut ks = switch(client.clone(), no_ipv6());

        ks.handle_event(ConnectionEvent::Error).await.unwrap();

        assert!(client.log().is_empty());
        assert!(client.has_connection(ROUTED_CONNECTION_ID));
        assert_eq!(ks.state(), KillSwitchState::Error);
    }

    #[tokio::test]
    async fn test_event_connecting_routes_around_server() {
        let client = Arc::new(MockNm::new());
        let mut ks = switch(client.clone(), no_ipv6());

        ks.handle_event(ConnectionEvent::Connecting {
            server_ip: Some(server()),
        })
        .await
        .unwrap();

        assert!(client.has_connection(ROUTED_CONNECTION_ID));
        assert_eq!(ks.state(), KillSwitchState::Connecting);
    }

    #[tokio::test]
    async fn test_event_connected_collapses_to_full_block() {
        let client = Arc::new(MockNm::new());
        client.seed_connection(KillSwitchConfig::routed_block(server()).to_spec(false));
        let mut ks = switch(client.clone(), no_ipv6());

        ks.handle_event(ConnectionEvent::Connected).await.unwrap();

        assert!(client.has_connection(FULL_CONNECTION_ID));
        assert!(!client.has_connection(ROUTED_CONNECTION_ID));
        assert_eq!(ks.state(), KillSwitchState::Connected);
    }

    #[tokio::test]
    async fn test_mutations_require_the_daemon() {
        let client = Arc::new(MockNm::new());
        client.set_running(false);
        let mut ks = switch(client.clone(), no_ipv6());

        let result = ks.enable(None).await;

        assert!(matches!(result, Err(KillSwitchError::NotRunning)));
        assert!(client.log().is_empty());
        assert_eq!(ks.state(), KillSwitchState::Off);
    }

    #[tokio::test]
    async fn test_ipv6_leak_protection_standalone_is_idempotent() {
        let client = Arc::new(MockNm::new());
        let ks = switch(client.clone(), KillSwitchSettings::default());

        ks.enable_ipv6_leak_protection().await.unwrap();
        ks.enable_ipv6_leak_protection().await.unwrap();
        assert_eq!(client.log(), vec![format!("add {}", IPV6_CONNECTION_ID)]);

        ks.disable_ipv6_leak_protection().await.unwrap();
        ks.disable_ipv6_leak_protection().await.unwrap();
        assert!(!client.has_connection(IPV6_CONNECTION_ID));
    }

    #[tokio::test]
    async fn test_status_reflects_installed_connections() {
        let client = Arc::new(MockNm::new());
        client.seed_connection(KillSwitchConfig::full_block().to_spec(false));
        let ks = switch(client.clone(), KillSwitchSettings::default());

        let status = ks.status().await;

        assert!(status.network_manager_running);
        assert!(status.full_block_active);
        assert!(!status.routed_active);
        assert!(!status.ipv6_leak_protection_active);
        assert_eq!(status.state, KillSwitchState::Off);
    }

    #[tokio::test]
    async fn test_status_with_daemon_down() {
        let client = Arc::new(MockNm::new());
        client.set_running(false);
        let ks = switch(client.clone(), KillSwitchSettings::default());

        let status = ks.status().await;

        assert!(!status.network_manager_running);
        assert!(!status.full_block_active);
    }
}
