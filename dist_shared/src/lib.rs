//! `dist_shared`
//!
//! Shared libraries used by both the object server and clients.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (net, schema, config).
//! - Explicit, versionable serialization.
//! - No `unsafe`.

pub mod config;
pub mod net;
pub mod schema;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::net::*;
    pub use crate::schema::*;
}
