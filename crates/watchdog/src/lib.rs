//! The out-of-band half of the lease system: collects heartbeats, keeps the
//! termination audit log, and sweeps the fleet for silent instances.

pub mod api;
pub mod config;
pub mod events;
pub mod heartbeats;
pub mod store;
pub mod sweep;
