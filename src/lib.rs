//! nmguard - NetworkManager-based VPN kill switch for Linux
//!
//! This crate blocks all non-VPN traffic by installing dummy NetworkManager
//! connections whose routing priority beats every physical interface while
//! staying below the VPN tunnel. If the tunnel drops, nothing leaks: packets
//! fall into the dummy blackhole instead of the default route.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `nm`: NetworkManager boundary (nmcli/busctl behind a trait)
//! - `killswitch`: connection descriptors, handler, state machine and
//!   orchestration
//!
//! # Usage
//!
//! From a VPN client's lifecycle hook:
//! ```bash
//! sudo nmguard event connecting --server-ip 185.159.157.1
//! sudo nmguard event connected
//! sudo nmguard event disconnected
//! ```

pub mod config;
pub mod killswitch;
pub mod nm;

pub use config::Config;
pub use killswitch::{
    ConnectionEvent, KillSwitchError, KillSwitchSettings, KillSwitchState, NmKillSwitch,
};
