//! # parley-xmpp
//!
//! XMPP stream protocol engine.
//!
//! This crate implements the stream layer of RFC 6120: the incremental XML
//! decoder, stream negotiation (STARTTLS, SASL, resource binding) and the
//! per-connection session that ties them together. Stanzas on bound streams
//! are handed to a pluggable handler; the default one routes between
//! sessions bound on the same server.
//!
//! ## Architecture
//!
//! - **Decoder**: async pull parser over `quick-xml`, yielding typed [`Packet`]s
//! - **Element Registry**: qualified name to packet shape, consulted by the decoder
//! - **Dispatcher**: per-category LIFO handler chains
//! - **SASL**: mechanism registry plus a per-session negotiation slot
//! - **Session**: one read task and one writer task per connection
//! - **Session Registry**: bound full JIDs to outbound mailboxes
//!
//! ## Protocol Support
//!
//! - RFC 6120 streams, STARTTLS, SASL and resource binding
//! - SASL PLAIN (RFC 4616) and SCRAM-SHA-256 (RFC 7677)
//! - RFC 3921 session establishment
//! - XEP-0138 compression negotiation elements (always refused)
//! - XEP-0199 ping to the server

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod negotiation;
pub mod packet;
pub mod parser;
pub mod registry;
pub mod routing;
pub mod server;
pub mod stream;
pub mod tls;

mod error;
mod types;

pub use auth::{Authenticator, Credentials, MechanismRegistry, StaticAuthenticator};
pub use client::{ClientConfig, ClientStream};
pub use config::StreamConfig;
pub use connection::{Session, StreamContext};
pub use dispatcher::{classify, DispatchOutcome, Dispatcher, EventCategory};
pub use error::{
    DecodeError, SaslCondition, StanzaErrorCondition, StanzaErrorType, StreamErrorCondition,
    XmppError,
};
pub use packet::{Packet, Stanza, StreamFeatures};
pub use parser::{ns, Decoder, QName, StreamHeader};
pub use routing::{LocalRouter, StanzaContext, StanzaHandler};
pub use server::{ServerContext, ServerContextBuilder, XmppServer};
pub use stream::{BoxedIo, Transport};
pub use tls::{RustlsAcceptor, RustlsConnector, SecureChannel};
pub use types::*;
