//! WgKeeper - WireGuard Interface Reconciliation Daemon
//!
//! A Rust daemon that keeps a host's WireGuard interfaces converged
//! onto desired state stored in PostgreSQL. Interface and peer rows are
//! the single source of truth; WgKeeper materializes them into
//! configuration files and live OS interfaces, and reacts to row
//! changes pushed over LISTEN/NOTIFY.
//!
//! # Architecture
//!
//! One daemon instance runs per server, identified by `server.name`.
//! At startup the controller performs a full reconciliation pass, then
//! a durable change feed delivers typed row-change events into a
//! bounded queue consumed by the single reconciliation loop. Peer-only
//! changes are hot-synced into live interfaces without a restart;
//! interface-level changes force one.
//!
//! # Features
//!
//! - Event-driven convergence over PostgreSQL LISTEN/NOTIFY
//! - Fingerprint-gated configuration writes and restarts
//! - IPv4 address allocation from per-interface private ranges
//! - Validate/derive/persist write pipeline with key generation
//! - Client configuration rendering for newly created peers

pub mod config;
pub mod controller;
pub mod error;
pub mod feed;
pub mod ipalloc;
pub mod process;
pub mod render;
pub mod store;
pub mod wg;

pub use config::WgKeeperConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WgKeeperConfig;
    pub use crate::controller::InterfaceController;
    pub use crate::error::{Error, Result};
    pub use crate::feed::{ChangeEvent, ChangeFeed};
    pub use crate::store::{Interface, Peer, PgStore, StateStore};
    pub use crate::wg::WgCli;
}
