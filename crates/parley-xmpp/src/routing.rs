//! Stanza handling after resource binding.
//!
//! Every IQ, message and presence received on a bound stream is handed to a
//! [`StanzaHandler`] with its `from` set to the sender's full JID. The default
//! handler, [`LocalRouter`], answers pings addressed to the server and
//! delivers everything else to locally bound recipients through the
//! [`SessionRegistry`].
//!
//! # Routing Logic
//!
//! 1. No `to`, or `to` is the server domain: the server answers itself
//! 2. Full JID: the one session bound to it
//! 3. Bare JID: every bound resource of the account
//! 4. Any other domain: `remote-server-not-found`, there is no federation

use jid::{FullJid, Jid};
use tracing::{debug, instrument};

use crate::packet::{Packet, Stanza};
use crate::parser::ns;
use crate::registry::{SendResult, SessionRegistry};
use crate::types::IqType;
use crate::{StanzaErrorCondition, StanzaErrorType, XmppError};

/// What a stanza handler can see of the sending session.
pub struct StanzaContext<'a> {
    /// The sender's bound JID
    pub jid: &'a FullJid,
    /// Domain served by this server
    pub domain: &'a str,
    pub sessions: &'a SessionRegistry,
}

/// Application hook for stanzas on bound streams.
///
/// A returned packet is sent back on the sender's stream. An error becomes a
/// stanza error reply, except for stanzas that are errors themselves. An IQ
/// request answered with `Ok(None)` gets `service-unavailable`.
pub trait StanzaHandler: Send + Sync {
    fn handle_iq(&self, _iq: &Stanza, _ctx: &StanzaContext<'_>) -> Result<Option<Packet>, XmppError> {
        Ok(None)
    }

    fn handle_message(
        &self,
        _message: &Stanza,
        _ctx: &StanzaContext<'_>,
    ) -> Result<Option<Packet>, XmppError> {
        Ok(None)
    }

    fn handle_presence(
        &self,
        _presence: &Stanza,
        _ctx: &StanzaContext<'_>,
    ) -> Result<Option<Packet>, XmppError> {
        Ok(None)
    }
}

/// Where a stanza is headed.
#[derive(Debug)]
enum Destination {
    Server,
    Local(Jid),
    Remote(String),
}

/// Delivers stanzas between sessions bound on this server.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRouter;

impl LocalRouter {
    pub fn new() -> Self {
        Self
    }

    fn destination(stanza: &Stanza, domain: &str) -> Result<Destination, XmppError> {
        let Some(to) = &stanza.to else {
            return Ok(Destination::Server);
        };
        let jid = Jid::new(to).map_err(|e| XmppError::invalid_address(to, e))?;

        if !jid.domain().as_str().eq_ignore_ascii_case(domain) {
            return Ok(Destination::Remote(jid.domain().as_str().to_string()));
        }
        if jid.node().is_none() && jid.resource().is_none() {
            return Ok(Destination::Server);
        }
        Ok(Destination::Local(jid))
    }

    /// Deliver to a local JID. Returns whether anyone received it.
    fn deliver(jid: Jid, packet: &Packet, sessions: &SessionRegistry) -> bool {
        match jid.try_into_full() {
            Ok(full) => sessions.send_to(&full, packet) == SendResult::Sent,
            Err(bare) => sessions.route_bare(&bare, packet) > 0,
        }
    }

    fn route(
        stanza: &Stanza,
        packet: Packet,
        ctx: &StanzaContext<'_>,
    ) -> Result<Option<Packet>, XmppError> {
        match Self::destination(stanza, ctx.domain)? {
            Destination::Server => Ok(None),
            Destination::Remote(domain) => {
                debug!(domain = %domain, "No route to remote domain");
                Err(XmppError::Stanza {
                    condition: StanzaErrorCondition::RemoteServerNotFound,
                    error_type: StanzaErrorType::Cancel,
                    text: None,
                })
            }
            Destination::Local(jid) => {
                if Self::deliver(jid, &packet, ctx.sessions) {
                    Ok(None)
                } else {
                    debug!(to = ?stanza.to, "Recipient is offline");
                    Err(XmppError::service_unavailable(None))
                }
            }
        }
    }
}

impl StanzaHandler for LocalRouter {
    #[instrument(skip_all, fields(to = ?iq.to, id = ?iq.id))]
    fn handle_iq(&self, iq: &Stanza, ctx: &StanzaContext<'_>) -> Result<Option<Packet>, XmppError> {
        if let Destination::Server = Self::destination(iq, ctx.domain)? {
            if iq.iq_type() == Some(IqType::Get) && iq.payload_child("ping", ns::PING).is_some() {
                let mut pong = iq.result_reply(None);
                pong.from = Some(ctx.domain.to_string());
                return Ok(Some(Packet::Iq(pong)));
            }
            return Ok(None);
        }
        Self::route(iq, Packet::Iq(iq.clone()), ctx)
    }

    #[instrument(skip_all, fields(to = ?message.to, msg_type = ?message.stanza_type))]
    fn handle_message(
        &self,
        message: &Stanza,
        ctx: &StanzaContext<'_>,
    ) -> Result<Option<Packet>, XmppError> {
        Self::route(message, Packet::Message(message.clone()), ctx)
    }

    #[instrument(skip_all, fields(to = ?presence.to))]
    fn handle_presence(
        &self,
        presence: &Stanza,
        ctx: &StanzaContext<'_>,
    ) -> Result<Option<Packet>, XmppError> {
        if presence.to.is_none() {
            // Broadcast presence needs a roster, which this server does not keep.
            debug!("Ignoring broadcast presence");
            return Ok(None);
        }
        // Undeliverable presence is dropped silently.
        match Self::route(presence, Packet::Presence(presence.clone()), ctx) {
            Err(XmppError::Stanza { .. }) => Ok(None),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::registry::SessionEntry;
    use crate::stream::Mailbox;

    fn jid(s: &str) -> FullJid {
        s.parse().unwrap()
    }

    fn bind(sessions: &SessionRegistry, full: &FullJid) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(sessions.try_register(
            full.clone(),
            SessionEntry {
                mailbox: Mailbox::new(tx),
                stream_id: "s".to_string(),
                conn_id: Uuid::new_v4(),
            },
        ));
        rx
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Option<String> {
        rx.try_recv().ok().map(|bytes| String::from_utf8(bytes).unwrap())
    }

    fn message(to: &str) -> Stanza {
        let mut message = Stanza::new(ns::JABBER_CLIENT).with_type("chat").with_to(to);
        message.from = Some("alice@example.com/home".to_string());
        message
    }

    #[test]
    fn test_message_to_full_jid() {
        let sessions = SessionRegistry::new();
        let sender = jid("alice@example.com/home");
        let mut rx = bind(&sessions, &jid("bob@example.com/phone"));
        let ctx = StanzaContext {
            jid: &sender,
            domain: "example.com",
            sessions: &sessions,
        };

        let reply = LocalRouter
            .handle_message(&message("bob@example.com/phone"), &ctx)
            .unwrap();
        assert!(reply.is_none());

        let delivered = received(&mut rx).unwrap();
        assert!(delivered.contains("from='alice@example.com/home'"));
        assert!(delivered.contains("to='bob@example.com/phone'"));
    }

    #[test]
    fn test_message_to_bare_jid_reaches_all_resources() {
        let sessions = SessionRegistry::new();
        let sender = jid("alice@example.com/home");
        let mut phone = bind(&sessions, &jid("bob@example.com/phone"));
        let mut desk = bind(&sessions, &jid("bob@example.com/desk"));
        let ctx = StanzaContext {
            jid: &sender,
            domain: "example.com",
            sessions: &sessions,
        };

        LocalRouter
            .handle_message(&message("bob@example.com"), &ctx)
            .unwrap();
        assert!(received(&mut phone).is_some());
        assert!(received(&mut desk).is_some());
    }

    #[test]
    fn test_offline_recipient_is_service_unavailable() {
        let sessions = SessionRegistry::new();
        let sender = jid("alice@example.com/home");
        let ctx = StanzaContext {
            jid: &sender,
            domain: "example.com",
            sessions: &sessions,
        };

        let err = LocalRouter
            .handle_message(&message("bob@example.com"), &ctx)
            .unwrap_err();
        assert_eq!(err.to_stanza_error().0, StanzaErrorCondition::ServiceUnavailable);

        // Presence to the same recipient is dropped without an error.
        let mut presence = Stanza::new(ns::JABBER_CLIENT).with_to("bob@example.com");
        presence.from = Some(sender.to_string());
        assert!(LocalRouter.handle_presence(&presence, &ctx).unwrap().is_none());
    }

    #[test]
    fn test_remote_domain_is_not_routed() {
        let sessions = SessionRegistry::new();
        let sender = jid("alice@example.com/home");
        let ctx = StanzaContext {
            jid: &sender,
            domain: "example.com",
            sessions: &sessions,
        };

        let err = LocalRouter
            .handle_message(&message("carol@example.org"), &ctx)
            .unwrap_err();
        assert_eq!(err.to_stanza_error().0, StanzaErrorCondition::RemoteServerNotFound);

        let err = LocalRouter
            .handle_message(&message("not a jid@"), &ctx)
            .unwrap_err();
        assert_eq!(err.to_stanza_error().0, StanzaErrorCondition::JidMalformed);
    }

    #[test]
    fn test_ping_to_server() {
        let sessions = SessionRegistry::new();
        let sender = jid("alice@example.com/home");
        let ctx = StanzaContext {
            jid: &sender,
            domain: "example.com",
            sessions: &sessions,
        };

        let mut ping = Stanza::new(ns::JABBER_CLIENT)
            .with_type("get")
            .with_id("p1")
            .with_to("example.com")
            .with_payload(minidom::Element::builder("ping", ns::PING).build());
        ping.from = Some(sender.to_string());

        let Some(Packet::Iq(pong)) = LocalRouter.handle_iq(&ping, &ctx).unwrap() else {
            panic!("expected a pong");
        };
        assert_eq!(pong.iq_type(), Some(IqType::Result));
        assert_eq!(pong.id.as_deref(), Some("p1"));
        assert_eq!(pong.to.as_deref(), Some("alice@example.com/home"));
        assert_eq!(pong.from.as_deref(), Some("example.com"));

        // Other requests to the server are left unanswered here.
        let mut query = Stanza::new(ns::JABBER_CLIENT).with_type("get").with_id("q1");
        query.from = Some(sender.to_string());
        assert!(LocalRouter.handle_iq(&query, &ctx).unwrap().is_none());
    }
}
