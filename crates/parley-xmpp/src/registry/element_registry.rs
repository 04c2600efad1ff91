//! Element registry implementation.

use std::collections::HashMap;

use crate::parser::{ns, QName};

/// The typed form a registered element is decoded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Features,
    StreamError,
    StartTls,
    TlsProceed,
    TlsFailure,
    TlsAbort,
    SaslAuth,
    SaslChallenge,
    SaslResponse,
    SaslSuccess,
    SaslFailure,
    SaslAbort,
    Iq,
    Message,
    Presence,
    Compress,
    Compressed,
    CompressFailure,
}

/// Maps top-level element names to shapes.
///
/// Names that are not registered decode to [`crate::Packet::Custom`].
#[derive(Debug, Clone, Default)]
pub struct ElementRegistry {
    shapes: HashMap<QName, Shape>,
}

impl ElementRegistry {
    /// A registry that knows nothing; every element decodes as custom.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The core RFC 6120 elements plus stream compression.
    pub fn standard() -> Self {
        let mut registry = Self::empty();

        registry.register(QName::new(ns::STREAM, "features"), Shape::Features);
        registry.register(QName::new(ns::STREAM, "error"), Shape::StreamError);

        registry.register(QName::new(ns::TLS, "starttls"), Shape::StartTls);
        registry.register(QName::new(ns::TLS, "proceed"), Shape::TlsProceed);
        registry.register(QName::new(ns::TLS, "failure"), Shape::TlsFailure);
        registry.register(QName::new(ns::TLS, "abort"), Shape::TlsAbort);

        registry.register(QName::new(ns::SASL, "auth"), Shape::SaslAuth);
        registry.register(QName::new(ns::SASL, "challenge"), Shape::SaslChallenge);
        registry.register(QName::new(ns::SASL, "response"), Shape::SaslResponse);
        registry.register(QName::new(ns::SASL, "success"), Shape::SaslSuccess);
        registry.register(QName::new(ns::SASL, "failure"), Shape::SaslFailure);
        registry.register(QName::new(ns::SASL, "abort"), Shape::SaslAbort);

        for content_ns in [ns::JABBER_CLIENT, ns::JABBER_SERVER] {
            registry.register(QName::new(content_ns, "iq"), Shape::Iq);
            registry.register(QName::new(content_ns, "message"), Shape::Message);
            registry.register(QName::new(content_ns, "presence"), Shape::Presence);
        }

        registry.register(QName::new(ns::COMPRESS, "compress"), Shape::Compress);
        registry.register(QName::new(ns::COMPRESS, "compressed"), Shape::Compressed);
        registry.register(QName::new(ns::COMPRESS, "failure"), Shape::CompressFailure);

        registry
    }

    /// Map `name` to `shape`, replacing any earlier mapping.
    pub fn register(&mut self, name: QName, shape: Shape) {
        self.shapes.insert(name, shape);
    }

    /// Remove a mapping so the element decodes as custom.
    pub fn unregister(&mut self, name: &QName) -> Option<Shape> {
        self.shapes.remove(name)
    }

    pub fn lookup(&self, name: &QName) -> Option<Shape> {
        self.shapes.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}
