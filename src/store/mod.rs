//! State Store
//!
//! Typed access to the `interface` and `peer` tables. Reads go through
//! the [`StateStore`] trait so the controller can be tested against an
//! in-memory double; writes (used by the API layer) run through an
//! explicit validate → derive → persist → side-effect pipeline.

pub mod model;
pub mod pg;
pub mod pipeline;

pub use model::{Interface, InterfaceDraft, Peer, PeerDraft};
pub use pg::{migrate, Page, PgStore, StateStore};
pub use pipeline::{
    create_interface, create_peer, delete_interface, delete_peer, update_interface,
    update_peer, CreatedPeer,
};
