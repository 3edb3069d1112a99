//! `dist_server`
//!
//! Server-side systems:
//! - Fixed timestep tick loop decoupled from frame rate
//! - Authoritative networked-object directory (id pool, zone index)
//! - Per-client interest management (explicit + owned-object zones)
//! - Delta-compressed snapshot replication with bounded frame history
//! - Connection/session state machine (unverified -> verified)
//!
//! Networking model:
//! - One reliable ordered channel per client (handshake, interest traffic,
//!   generates/deletes, and tick snapshots all share it).
//! - All mutable state is owned by the single tick task; reader tasks only
//!   forward decoded frames into its inbound queue.

pub mod clock;
pub mod directory;
pub mod interest;
pub mod server;
pub mod snapshot;

pub use server::ObjectServer;
