//! Kill switch state machine
//!
//! Pure decision logic: a connection lifecycle event plus the `permanent`
//! setting yield the shape the dummy connections should take next. Applying
//! the shape is the orchestrator's job.

use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;

/// Tracked position in the kill switch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchState {
    Off,
    On,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl fmt::Display for KillSwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KillSwitchState::Off => "off",
            KillSwitchState::On => "on",
            KillSwitchState::Connecting => "connecting",
            KillSwitchState::Connected => "connected",
            KillSwitchState::Disconnecting => "disconnecting",
            KillSwitchState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Lifecycle notification from the VPN client driving us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Disconnected,
    Connecting { server_ip: Option<Ipv4Addr> },
    Connected,
    Disconnecting,
    Error,
}

/// Shape the dummy connections should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// No kill switch connections installed.
    Disabled,
    /// Both address families blackholed.
    FullBlock,
    /// Blackholed except for one server address.
    Routed(Ipv4Addr),
}

impl Enforcement {
    pub fn blocks_traffic(&self) -> bool {
        !matches!(self, Enforcement::Disabled)
    }
}

impl fmt::Display for Enforcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Enforcement::Disabled => f.write_str("disabled"),
            Enforcement::FullBlock => f.write_str("full block"),
            Enforcement::Routed(ip) => write!(f, "routed via {}", ip),
        }
    }
}

impl ConnectionEvent {
    /// Desired shape after this event, `None` meaning keep whatever is in
    /// place. A permanent switch never opens up on disconnect or error;
    /// a non-permanent one is torn down once the user is deliberately
    /// disconnected but left alone on errors so a dropped tunnel cannot leak.
    pub fn plan(&self, permanent: bool) -> Option<Enforcement> {
        match self {
            ConnectionEvent::Connecting {
                server_ip: Some(ip),
            } => Some(Enforcement::Routed(*ip)),
            ConnectionEvent::Connecting { server_ip: None } => Some(Enforcement::FullBlock),
            ConnectionEvent::Connected => Some(Enforcement::FullBlock),
            ConnectionEvent::Disconnecting => None,
            ConnectionEvent::Disconnected if permanent => Some(Enforcement::FullBlock),
            ConnectionEvent::Disconnected => Some(Enforcement::Disabled),
            ConnectionEvent::Error if permanent => Some(Enforcement::FullBlock),
            ConnectionEvent::Error => None,
        }
    }

    /// State the switch records after this event.
    pub fn next_state(&self, permanent: bool) -> KillSwitchState {
        match self {
            ConnectionEvent::Connecting { .. } => KillSwitchState::Connecting,
            ConnectionEvent::Connected => KillSwitchState::Connected,
            ConnectionEvent::Disconnecting => KillSwitchState::Disconnecting,
            ConnectionEvent::Disconnected if permanent => KillSwitchState::On,
            ConnectionEvent::Disconnected => KillSwitchState::Off,
            ConnectionEvent::Error => KillSwitchState::Error,
        }
    }
}
