//! The on-instance half of the lease system: keeps the lease, enforces it,
//! and reports liveness to the external watchdog.

pub mod api;
pub mod config;
pub mod db;
pub mod heartbeat;
pub mod keeper;
pub mod monitor;
pub mod probe;
pub mod terminate;
