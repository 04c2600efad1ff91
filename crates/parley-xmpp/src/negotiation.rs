//! Default stream negotiation handlers.
//!
//! [`standard_dispatcher`] wires the handlers that carry a client stream from
//! the opening header through STARTTLS, SASL and resource binding, and then
//! hand stanzas to the configured [`StanzaHandler`]. Applications layer their
//! own handlers on top; the most recently registered one runs first.

use std::sync::Arc;

use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::auth::{SaslOutcome, SaslStatus};
use crate::config::StreamConfig;
use crate::connection::{Pending, StreamContext};
use crate::dispatcher::{Dispatcher, EventCategory};
use crate::error::SaslCondition;
use crate::packet::{Packet, Stanza, StreamFeatures};
use crate::parser::{ns, StreamHeader};
use crate::registry::SessionEntry;
use crate::routing::{StanzaContext, StanzaHandler};
use crate::types::{IqType, StreamRole, StreamVersion, TlsPolicy};
use crate::{StanzaErrorCondition, StanzaErrorType, StreamErrorCondition, XmppError};

/// Dispatcher with the built-in handlers registered.
pub fn standard_dispatcher() -> Dispatcher<StreamContext> {
    let mut dispatcher = Dispatcher::new();
    dispatcher.add_handler(EventCategory::StreamOpen, on_stream_open);
    dispatcher.add_handler(EventCategory::StreamClose, on_stream_close);
    dispatcher.add_handler(EventCategory::StreamError, on_stream_error);
    dispatcher.add_handler(EventCategory::SecureChannel, on_starttls);
    dispatcher.add_handler(EventCategory::Auth, on_sasl);

    // Tried bind first, then session, then the stanza handler.
    dispatcher.add_handler(EventCategory::InfoQuery, on_iq);
    dispatcher.add_handler(EventCategory::InfoQuery, on_session);
    dispatcher.add_handler(EventCategory::InfoQuery, on_bind);

    dispatcher.add_handler(EventCategory::Message, on_message);
    dispatcher.add_handler(EventCategory::Presence, on_presence);
    dispatcher
}

/// Check an incoming stream header against `config`.
///
/// Returns the version both sides will speak, or the stream error to close with.
pub fn validate_stream_header(
    header: &StreamHeader,
    config: &StreamConfig,
) -> Result<StreamVersion, (StreamErrorCondition, String)> {
    let version = header.version().map_err(|_| {
        (
            StreamErrorCondition::UnsupportedVersion,
            format!("unparsable version {:?}", header.version.as_deref().unwrap_or_default()),
        )
    })?;
    if version > config.version {
        return Err((
            StreamErrorCondition::UnsupportedVersion,
            format!("version {version} is not supported, highest is {}", config.version),
        ));
    }

    let expected = config.role.content_namespace();
    if header.default_ns.as_deref() != Some(expected) {
        return Err((
            StreamErrorCondition::InvalidNamespace,
            format!("default namespace must be {expected}"),
        ));
    }
    if header.stream_ns.as_deref() != Some(ns::STREAM) {
        return Err((
            StreamErrorCondition::InvalidNamespace,
            format!("stream namespace must be {}", ns::STREAM),
        ));
    }

    match config.role {
        StreamRole::Client => {
            if let Some(from) = &header.from {
                let jid = Jid::new(from)
                    .map_err(|e| (StreamErrorCondition::InvalidFrom, format!("'{from}': {e}")))?;
                let to = header.to.as_deref().unwrap_or(&config.domain);
                if !jid.domain().as_str().eq_ignore_ascii_case(to) {
                    return Err((
                        StreamErrorCondition::InvalidFrom,
                        format!("'{from}' does not belong to {to}"),
                    ));
                }
            }
        }
        StreamRole::Server => {
            for (name, value) in [("from", &header.from), ("to", &header.to)] {
                let Some(value) = value else {
                    return Err((StreamErrorCondition::InvalidFrom, format!("missing '{name}'")));
                };
                Jid::new(value)
                    .map_err(|e| (StreamErrorCondition::InvalidFrom, format!("'{value}': {e}")))?;
            }
        }
    }

    if let Some(to) = &header.to {
        if !to.eq_ignore_ascii_case(&config.domain) {
            return Err((
                StreamErrorCondition::HostUnknown,
                format!("this server does not serve {to}"),
            ));
        }
    }

    Ok(version)
}

/// Features offered on a freshly opened stream.
pub(crate) fn features_for(ctx: &StreamContext) -> StreamFeatures {
    let config = &ctx.shared.config;
    let mut features = StreamFeatures::default();

    if ctx.state.authenticated {
        features.bind = true;
        features.session = true;
        return features;
    }

    let tls_available = config.tls != TlsPolicy::Disabled && ctx.shared.secure_channel.is_some();
    if !ctx.state.secure && tls_available {
        if config.tls == TlsPolicy::Required {
            features.starttls = Some(true);
            return features;
        }
        features.starttls = Some(false);
    }

    features.mechanisms = ctx.shared.mechanisms.server_mechanisms();
    features
}

#[instrument(name = "xmpp.session.open", skip_all)]
fn on_stream_open(ctx: &mut StreamContext, packet: &Packet) -> bool {
    let Packet::StreamOpen(header) = packet else {
        return false;
    };

    let version = match validate_stream_header(header, &ctx.shared.config) {
        Ok(version) => version,
        Err((condition, text)) => {
            debug!(condition = %condition, text = %text, "Rejected stream header");
            ctx.fail(condition, Some(text));
            return true;
        }
    };

    let version = version.min(ctx.shared.config.version);
    ctx.send_header(header.from.clone(), version);
    ctx.state.started = true;

    let features = features_for(ctx);
    debug!(
        stream_id = ?ctx.stream_id,
        starttls = ?features.starttls,
        mechanisms = ?features.mechanisms,
        bind = features.bind,
        "Stream opened"
    );
    ctx.send(&Packet::Features(features));
    true
}

fn on_stream_close(ctx: &mut StreamContext, _packet: &Packet) -> bool {
    debug!("Peer closed the stream");
    ctx.close();
    true
}

fn on_stream_error(ctx: &mut StreamContext, packet: &Packet) -> bool {
    if let Packet::StreamError(error) = packet {
        warn!(condition = %error.condition, text = ?error.text, "Peer sent a stream error");
    }
    ctx.close();
    true
}

#[instrument(name = "xmpp.session.starttls_request", skip_all)]
fn on_starttls(ctx: &mut StreamContext, packet: &Packet) -> bool {
    if !matches!(packet, Packet::StartTls) {
        return false;
    }

    let available = ctx.shared.config.tls != TlsPolicy::Disabled
        && ctx.shared.secure_channel.is_some();
    if !available || ctx.state.secure || ctx.state.authenticated {
        debug!(secure = ctx.state.secure, "Refusing STARTTLS");
        ctx.send(&Packet::TlsFailure);
        ctx.close();
        return true;
    }

    if ctx.send(&Packet::TlsProceed) {
        ctx.pending = Some(Pending::UpgradeTls);
    }
    true
}

#[instrument(name = "xmpp.session.sasl", skip_all)]
fn on_sasl(ctx: &mut StreamContext, packet: &Packet) -> bool {
    let outcome = match packet {
        Packet::SaslAuth(auth) => {
            if ctx.shared.config.tls == TlsPolicy::Required && !ctx.state.secure {
                debug!(mechanism = %auth.mechanism, "Authentication attempted before TLS");
                ctx.send(&Packet::sasl_failure(SaslCondition::EncryptionRequired));
                return true;
            }
            if ctx.state.authenticated {
                ctx.send(&Packet::sasl_failure(SaslCondition::MalformedRequest));
                return true;
            }
            debug!(mechanism = %auth.mechanism, "SASL auth requested");
            ctx.sasl
                .auth(&ctx.shared.mechanisms, &auth.mechanism, &auth.payload)
        }
        Packet::SaslResponse(payload) => ctx.sasl.response(payload),
        Packet::SaslAbort => ctx.sasl.abort(),
        _ => return false,
    };

    apply_sasl_outcome(ctx, outcome);
    true
}

fn apply_sasl_outcome(ctx: &mut StreamContext, outcome: SaslOutcome) {
    match outcome.status {
        SaslStatus::Continue => {
            ctx.send(&outcome.reply);
        }
        SaslStatus::Succeeded(identity) => {
            let jid = match account_jid(&identity, &ctx.shared.config.domain) {
                Ok(jid) => jid,
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Authenticated identity is unusable");
                    ctx.send(&Packet::sasl_failure(SaslCondition::NotAuthorized));
                    return;
                }
            };
            if !ctx.send(&outcome.reply) {
                return;
            }
            info!(jid = %jid, "Authenticated");
            ctx.identity = Some(jid);
            ctx.state.authenticated = true;
            ctx.restart_stream();
            ctx.pending = Some(Pending::Restart);
        }
        SaslStatus::Failed(error) => {
            ctx.send(&outcome.reply);
            let failures = ctx.sasl.failures();
            debug!(error = %error, failures, "SASL attempt failed");
            if failures >= ctx.shared.config.max_auth_attempts {
                ctx.fail(
                    StreamErrorCondition::PolicyViolation,
                    Some("too many failed authentication attempts".to_string()),
                );
            }
        }
    }
}

/// The account an authenticated SASL identity maps to.
fn account_jid(identity: &str, domain: &str) -> Result<BareJid, XmppError> {
    let raw = if identity.contains('@') {
        identity.to_string()
    } else {
        format!("{identity}@{domain}")
    };
    let jid = BareJid::new(&raw).map_err(|e| XmppError::invalid_address(&raw, e))?;
    if !jid.domain().as_str().eq_ignore_ascii_case(domain) {
        return Err(XmppError::invalid_address(raw, "foreign domain"));
    }
    Ok(jid)
}

#[instrument(name = "xmpp.session.bind", skip_all)]
fn on_bind(ctx: &mut StreamContext, packet: &Packet) -> bool {
    let Packet::Iq(iq) = packet else {
        return false;
    };
    let Some(bind) = iq.payload_child("bind", ns::BIND) else {
        return false;
    };

    if iq.iq_type() != Some(IqType::Set) {
        reply_error(ctx, iq, StanzaErrorCondition::BadRequest, StanzaErrorType::Modify);
        return true;
    }
    if ctx.bound.is_some() {
        reply_error(ctx, iq, StanzaErrorCondition::NotAllowed, StanzaErrorType::Cancel);
        return true;
    }
    let (Some(identity), Some(mailbox)) = (ctx.identity.clone(), ctx.outbound.mailbox()) else {
        reply_error(ctx, iq, StanzaErrorCondition::NotAuthorized, StanzaErrorType::Auth);
        return true;
    };

    let requested = bind
        .get_child("resource", ns::BIND)
        .map(|resource| resource.text().trim().to_string())
        .filter(|resource| !resource.is_empty());
    let candidates = match requested {
        Some(resource) => vec![resource.clone(), format!("{resource}-{}", short_id())],
        None => vec![format!("parley-{}", short_id())],
    };

    for resource in candidates {
        let full = match identity.with_resource_str(&resource) {
            Ok(full) => full,
            Err(e) => {
                debug!(resource = %resource, error = %e, "Invalid resource requested");
                reply_error(ctx, iq, StanzaErrorCondition::BadRequest, StanzaErrorType::Modify);
                return true;
            }
        };

        let entry = SessionEntry {
            mailbox: mailbox.clone(),
            stream_id: ctx.stream_id.clone().unwrap_or_default(),
            conn_id: ctx.conn_id(),
        };
        if !ctx.shared.sessions.try_register(full.clone(), entry) {
            debug!(jid = %full, "Resource in use, trying another");
            continue;
        }

        ctx.span.record("jid", tracing::field::display(&full));
        info!(jid = %full, "Resource bound");

        let payload = Element::builder("bind", ns::BIND)
            .append(
                Element::builder("jid", ns::BIND)
                    .append(minidom::Node::Text(full.to_string()))
                    .build(),
            )
            .build();
        ctx.bound = Some(full);
        ctx.send(&Packet::Iq(iq.result_reply(Some(payload))));
        return true;
    }

    reply_error(ctx, iq, StanzaErrorCondition::Conflict, StanzaErrorType::Cancel);
    true
}

fn on_session(ctx: &mut StreamContext, packet: &Packet) -> bool {
    let Packet::Iq(iq) = packet else {
        return false;
    };
    if iq.payload_child("session", ns::SESSION).is_none() {
        return false;
    }
    if iq.iq_type() != Some(IqType::Set) {
        reply_error(ctx, iq, StanzaErrorCondition::BadRequest, StanzaErrorType::Modify);
        return true;
    }
    ctx.send(&Packet::Iq(iq.result_reply(None)));
    true
}

fn on_iq(ctx: &mut StreamContext, packet: &Packet) -> bool {
    let Packet::Iq(iq) = packet else {
        return false;
    };
    deliver(ctx, iq, Packet::Iq, |handler, stanza, sctx| {
        handler.handle_iq(stanza, sctx)
    })
}

fn on_message(ctx: &mut StreamContext, packet: &Packet) -> bool {
    let Packet::Message(message) = packet else {
        return false;
    };
    deliver(ctx, message, Packet::Message, |handler, stanza, sctx| {
        handler.handle_message(stanza, sctx)
    })
}

fn on_presence(ctx: &mut StreamContext, packet: &Packet) -> bool {
    let Packet::Presence(presence) = packet else {
        return false;
    };
    deliver(ctx, presence, Packet::Presence, |handler, stanza, sctx| {
        handler.handle_presence(stanza, sctx)
    })
}

type HandlerCall =
    fn(&dyn StanzaHandler, &Stanza, &StanzaContext<'_>) -> Result<Option<Packet>, XmppError>;

/// Stamp `from` and run the stanza handler, answering errors in place.
fn deliver(
    ctx: &mut StreamContext,
    stanza: &Stanza,
    wrap: fn(Stanza) -> Packet,
    call: HandlerCall,
) -> bool {
    let is_request = stanza.iq_type().is_some_and(|t| t.is_request());

    let Some(jid) = ctx.bound.clone() else {
        if is_request {
            let reply = stanza.error_reply(
                StanzaErrorCondition::NotAuthorized,
                StanzaErrorType::Auth,
                Some("bind a resource first"),
            );
            ctx.send(&wrap(reply));
        }
        return true;
    };

    let mut stamped = stanza.clone();
    stamped.from = Some(jid.to_string());

    let shared = Arc::clone(&ctx.shared);
    let sctx = StanzaContext {
        jid: &jid,
        domain: &shared.config.domain,
        sessions: &shared.sessions,
    };

    match call(shared.stanza_handler.as_ref(), &stamped, &sctx) {
        Ok(Some(reply)) => {
            ctx.send(&reply);
            true
        }
        // An unanswered request falls through to service-unavailable.
        Ok(None) => !is_request,
        Err(e) => {
            if !stamped.is_error() {
                let (condition, error_type, text) = e.to_stanza_error();
                debug!(id = ?stamped.id, condition = %condition, error = %e, "Stanza rejected");
                ctx.send(&wrap(stamped.error_reply(condition, error_type, text.as_deref())));
            }
            true
        }
    }
}

fn reply_error(
    ctx: &mut StreamContext,
    iq: &Stanza,
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
) {
    ctx.send(&Packet::Iq(iq.error_reply(condition, error_type, None)));
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
