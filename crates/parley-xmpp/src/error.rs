//! Error types for the XMPP stream engine.

use std::str::FromStr;

use thiserror::Error;

/// XMPP engine errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The inbound byte stream could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A string did not parse as an XMPP address
    #[error("Invalid address '{input}': {reason}")]
    InvalidAddress {
        /// The rejected input
        input: String,
        /// Why the address was rejected
        reason: String,
    },

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// SASL negotiation ended with a failure condition
    #[error("SASL failure: {condition}")]
    Sasl {
        /// Failure condition
        condition: SaslCondition,
        /// Optional text supplied by the peer
        text: Option<String>,
    },

    /// Stream-level error, either received from or sent to the peer
    #[error("Stream error: {condition}")]
    Stream {
        /// Error condition
        condition: StreamErrorCondition,
        /// Optional text description
        text: Option<String>,
    },

    /// The peer sent something the negotiation did not expect
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The session has been closed and accepts no more output
    #[error("Session closed")]
    SessionClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Stanza error (for error replies)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl XmppError {
    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an address error for `input`.
    pub fn invalid_address(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidAddress {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a stream error.
    pub fn stream(condition: StreamErrorCondition, text: Option<String>) -> Self {
        Self::Stream { condition, text }
    }

    /// Create a stanza error for 'not-authorized'.
    pub fn not_authorized(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::NotAuthorized,
            error_type: StanzaErrorType::Auth,
            text,
        }
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::BadRequest,
            error_type: StanzaErrorType::Modify,
            text,
        }
    }

    /// Create a stanza error for 'not-allowed'.
    pub fn not_allowed(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::NotAllowed,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Create a stanza error for 'feature-not-implemented'.
    pub fn feature_not_implemented(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::FeatureNotImplemented,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::ServiceUnavailable,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// The stanza error an application error is reported as.
    ///
    /// Anything that is not already a stanza error surfaces as
    /// `internal-server-error` so internal details never reach the wire.
    pub fn to_stanza_error(&self) -> (StanzaErrorCondition, StanzaErrorType, Option<String>) {
        match self {
            Self::Stanza {
                condition,
                error_type,
                text,
            } => (*condition, *error_type, text.clone()),
            Self::InvalidAddress { .. } => (
                StanzaErrorCondition::JidMalformed,
                StanzaErrorType::Modify,
                None,
            ),
            _ => (
                StanzaErrorCondition::InternalServerError,
                StanzaErrorType::Wait,
                None,
            ),
        }
    }
}

/// Errors surfaced by the stream decoder.
///
/// Every variant is terminal for the decoder instance that produced it.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The transport failed underneath the tokenizer
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-whitespace character data where an element was expected
    #[error("unexpected character data at stream level: {0:?}")]
    BadFormat(String),

    /// An end tag that closes nothing the decoder opened
    #[error("unexpected end of element </{0}>")]
    UnexpectedEndOfElement(String),

    /// Comments, processing instructions and DTDs are not allowed on a stream
    #[error("restricted XML: {0}")]
    RestrictedXml(&'static str),

    /// An element uses a prefix with no namespace declaration in scope
    #[error("unbound namespace prefix '{0}'")]
    BadNamespacePrefix(String),

    /// The tokenizer rejected the input
    #[error("not well-formed: {0}")]
    NotWellFormed(String),

    /// `next()` was called again after a terminal error
    #[error("decoder used after a terminal error")]
    Poisoned,
}

impl DecodeError {
    /// The stream error condition reported to the peer, if any.
    ///
    /// Transport failures have none: nothing can be written back.
    pub fn condition(&self) -> Option<StreamErrorCondition> {
        match self {
            Self::Io(_) | Self::Poisoned => None,
            Self::BadFormat(_) => Some(StreamErrorCondition::BadFormat),
            Self::UnexpectedEndOfElement(_) | Self::NotWellFormed(_) => {
                Some(StreamErrorCondition::NotWellFormed)
            }
            Self::RestrictedXml(_) => Some(StreamErrorCondition::RestrictedXml),
            Self::BadNamespacePrefix(_) => Some(StreamErrorCondition::BadNamespacePrefix),
        }
    }
}

impl From<quick_xml::Error> for DecodeError {
    fn from(err: quick_xml::Error) -> Self {
        use quick_xml::errors::IllFormedError;

        match err {
            quick_xml::Error::Io(io) => Self::Io(std::io::Error::new(io.kind(), io.to_string())),
            quick_xml::Error::IllFormed(IllFormedError::MismatchedEndTag { found, .. })
            | quick_xml::Error::IllFormed(IllFormedError::UnmatchedEndTag(found)) => {
                Self::UnexpectedEndOfElement(found)
            }
            other => Self::NotWellFormed(other.to_string()),
        }
    }
}

impl From<quick_xml::events::attributes::AttrError> for DecodeError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Self::NotWellFormed(err.to_string())
    }
}

macro_rules! condition_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Get the element name for this condition.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = XmppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(XmppError::protocol(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

condition_enum! {
    /// Stream error conditions (RFC 6120 Section 4.9.3).
    StreamErrorCondition {
        /// Bad format
        BadFormat => "bad-format",
        /// Bad namespace prefix
        BadNamespacePrefix => "bad-namespace-prefix",
        /// Conflict (a newer stream replaced this one)
        Conflict => "conflict",
        /// Connection timeout
        ConnectionTimeout => "connection-timeout",
        /// Host gone
        HostGone => "host-gone",
        /// Host unknown
        HostUnknown => "host-unknown",
        /// Improper addressing
        ImproperAddressing => "improper-addressing",
        /// Internal server error
        InternalServerError => "internal-server-error",
        /// Invalid from
        InvalidFrom => "invalid-from",
        /// Invalid namespace
        InvalidNamespace => "invalid-namespace",
        /// Invalid XML
        InvalidXml => "invalid-xml",
        /// Not authorized
        NotAuthorized => "not-authorized",
        /// Not well-formed
        NotWellFormed => "not-well-formed",
        /// Policy violation
        PolicyViolation => "policy-violation",
        /// Remote connection failed
        RemoteConnectionFailed => "remote-connection-failed",
        /// Reset
        Reset => "reset",
        /// Resource constraint
        ResourceConstraint => "resource-constraint",
        /// Restricted XML
        RestrictedXml => "restricted-xml",
        /// See other host
        SeeOtherHost => "see-other-host",
        /// System shutdown
        SystemShutdown => "system-shutdown",
        /// Undefined condition
        UndefinedCondition => "undefined-condition",
        /// Unsupported encoding
        UnsupportedEncoding => "unsupported-encoding",
        /// Unsupported feature
        UnsupportedFeature => "unsupported-feature",
        /// Unsupported stanza type
        UnsupportedStanzaType => "unsupported-stanza-type",
        /// Unsupported version
        UnsupportedVersion => "unsupported-version",
    }
}

condition_enum! {
    /// SASL failure conditions (RFC 6120 Section 6.5).
    SaslCondition {
        /// The initiating entity aborted the exchange
        Aborted => "aborted",
        /// Account disabled
        AccountDisabled => "account-disabled",
        /// Credentials expired
        CredentialsExpired => "credentials-expired",
        /// The mechanism requires an encrypted channel
        EncryptionRequired => "encryption-required",
        /// Data was not valid base64
        IncorrectEncoding => "incorrect-encoding",
        /// Invalid authorization identity
        InvalidAuthzid => "invalid-authzid",
        /// Unknown or disabled mechanism
        InvalidMechanism => "invalid-mechanism",
        /// Malformed request
        MalformedRequest => "malformed-request",
        /// Mechanism too weak
        MechanismTooWeak => "mechanism-too-weak",
        /// Bad credentials
        NotAuthorized => "not-authorized",
        /// Temporary failure
        TemporaryAuthFailure => "temporary-auth-failure",
    }
}

condition_enum! {
    /// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
    StanzaErrorCondition {
        /// Bad request (malformed XML, etc.)
        BadRequest => "bad-request",
        /// Conflict (e.g., resource already bound)
        Conflict => "conflict",
        /// Feature not implemented
        FeatureNotImplemented => "feature-not-implemented",
        /// Forbidden (permission denied)
        Forbidden => "forbidden",
        /// Gone (entity no longer available)
        Gone => "gone",
        /// Internal server error
        InternalServerError => "internal-server-error",
        /// Item not found
        ItemNotFound => "item-not-found",
        /// JID malformed
        JidMalformed => "jid-malformed",
        /// Not acceptable
        NotAcceptable => "not-acceptable",
        /// Not allowed
        NotAllowed => "not-allowed",
        /// Not authorized
        NotAuthorized => "not-authorized",
        /// Policy violation
        PolicyViolation => "policy-violation",
        /// Recipient unavailable
        RecipientUnavailable => "recipient-unavailable",
        /// Redirect
        Redirect => "redirect",
        /// Registration required
        RegistrationRequired => "registration-required",
        /// Remote server not found
        RemoteServerNotFound => "remote-server-not-found",
        /// Remote server timeout
        RemoteServerTimeout => "remote-server-timeout",
        /// Resource constraint
        ResourceConstraint => "resource-constraint",
        /// Service unavailable
        ServiceUnavailable => "service-unavailable",
        /// Subscription required
        SubscriptionRequired => "subscription-required",
        /// Undefined condition
        UndefinedCondition => "undefined-condition",
        /// Unexpected request
        UnexpectedRequest => "unexpected-request",
    }
}

condition_enum! {
    /// XMPP stanza error types (RFC 6120 Section 8.3.2).
    StanzaErrorType {
        /// Retry after providing credentials
        Auth => "auth",
        /// Do not retry (unrecoverable error)
        Cancel => "cancel",
        /// Retry after changing the data sent
        Modify => "modify",
        /// Retry after waiting (temporary error)
        Wait => "wait",
    }
}
