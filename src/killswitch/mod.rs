//! Kill switch core
//!
//! Dummy NetworkManager connections with a route metric of 97 outrank every
//! physical interface, so while one of them is installed the only way out of
//! the machine is an interface with a better metric, i.e. the VPN tunnel.
//!
//! # Shapes
//!
//! The switch is always in one of three shapes:
//! - `FullBlock`: both address families blackholed
//! - `Routed`: blackholed except for one server IP, used while the tunnel to
//!   that server is being established
//! - `Disabled`: nothing installed
//!
//! Transitions between shapes are ordered so no window exists in which
//! traffic can leak.

pub mod connection;
pub mod handler;
pub mod state;
pub mod switch;

pub use connection::{KillSwitchConfig, KillSwitchGeneralConfig, subnets_excluding};
pub use handler::{KillSwitchConnectionHandler, KillSwitchError, RetryPolicy};
pub use state::{ConnectionEvent, Enforcement, KillSwitchState};
pub use switch::{KillSwitchSettings, KillSwitchStatus, NmKillSwitch};
