//! `dist_client`
//!
//! Client-side protocol implementation:
//! - Hello handshake (password, schema hash, requested rates)
//! - Interest add/remove/set requests with completion tracking
//! - Object table reconstruction from generate/delete messages and
//!   full/delta tick snapshots

pub mod client;

pub use client::NetClient;
