//! Registries shared by every session of a server.
//!
//! - [`ElementRegistry`] maps qualified element names to the typed shape the
//!   decoder builds for them. It is fixed once the server starts.
//! - [`SessionRegistry`] tracks bound sessions by full JID so stanzas can be
//!   routed between them.
//!
//! ```text
//! Session (alice@example.com/home) --> SessionRegistry --> Session (bob@example.com/work)
//!                                            |
//!                                  DashMap<FullJid, SessionEntry>
//! ```

mod element_registry;
mod session_registry;

pub use element_registry::{ElementRegistry, Shape};
pub use session_registry::{SendResult, SessionEntry, SessionRegistry};
