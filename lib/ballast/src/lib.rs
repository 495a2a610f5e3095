//! Support crate shared by the framework and the service daemons: logging,
//! time helpers, INI configuration and host information.

pub mod config;
pub mod logging;
pub mod sysinfo;
pub mod time;
