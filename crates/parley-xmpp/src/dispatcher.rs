//! Event classification and handler dispatch.
//!
//! Every decoded [`Packet`] falls into exactly one [`EventCategory`]. Handlers
//! are registered per category and tried most-recently-registered first; the
//! first one that returns `true` claims the event.

use std::collections::HashMap;
use std::fmt;

use crate::packet::Packet;

/// Closed set of event kinds a session reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    StreamOpen,
    StreamClose,
    StreamError,
    Features,
    /// STARTTLS negotiation
    SecureChannel,
    /// SASL negotiation
    Auth,
    InfoQuery,
    Message,
    Presence,
    /// XEP-0138 stream compression negotiation
    Compression,
    Unrecognized,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StreamOpen => "stream-open",
            Self::StreamClose => "stream-close",
            Self::StreamError => "stream-error",
            Self::Features => "features",
            Self::SecureChannel => "secure-channel",
            Self::Auth => "auth",
            Self::InfoQuery => "iq",
            Self::Message => "message",
            Self::Presence => "presence",
            Self::Compression => "compression",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The category `packet` is dispatched under.
pub fn classify(packet: &Packet) -> EventCategory {
    match packet {
        Packet::StreamOpen(_) => EventCategory::StreamOpen,
        Packet::StreamClose => EventCategory::StreamClose,
        Packet::StreamError(_) => EventCategory::StreamError,
        Packet::Features(_) => EventCategory::Features,
        Packet::StartTls | Packet::TlsProceed | Packet::TlsFailure | Packet::TlsAbort => {
            EventCategory::SecureChannel
        }
        Packet::SaslAuth(_)
        | Packet::SaslChallenge(_)
        | Packet::SaslResponse(_)
        | Packet::SaslSuccess(_)
        | Packet::SaslFailure(_)
        | Packet::SaslAbort => EventCategory::Auth,
        Packet::Iq(_) => EventCategory::InfoQuery,
        Packet::Message(_) => EventCategory::Message,
        Packet::Presence(_) => EventCategory::Presence,
        Packet::Compress(_) | Packet::Compressed | Packet::CompressFailure(_) => {
            EventCategory::Compression
        }
        Packet::Custom(_) => EventCategory::Unrecognized,
    }
}

/// Whether any handler claimed an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler claimed the event. Not an error in itself.
    Ignored,
}

/// An event handler. Returns `true` when it handled the event.
pub type Handler<C> = Box<dyn Fn(&mut C, &Packet) -> bool + Send + Sync>;

/// Per-category LIFO handler chains over a session context `C`.
pub struct Dispatcher<C> {
    handlers: HashMap<EventCategory, Vec<Handler<C>>>,
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` ahead of every handler already registered for `category`.
    pub fn add_handler<F>(&mut self, category: EventCategory, handler: F)
    where
        F: Fn(&mut C, &Packet) -> bool + Send + Sync + 'static,
    {
        self.handlers
            .entry(category)
            .or_default()
            .insert(0, Box::new(handler));
    }

    /// Run the chain for `category` until a handler claims the event.
    pub fn dispatch(&self, category: EventCategory, ctx: &mut C, packet: &Packet) -> DispatchOutcome {
        let Some(chain) = self.handlers.get(&category) else {
            return DispatchOutcome::Ignored;
        };

        for handler in chain {
            if handler(ctx, packet) {
                return DispatchOutcome::Handled;
            }
        }
        DispatchOutcome::Ignored
    }

    pub fn handler_count(&self, category: EventCategory) -> usize {
        self.handlers.get(&category).map_or(0, Vec::len)
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self
            .handlers
            .iter()
            .map(|(category, chain)| (category.as_str(), chain.len()))
            .collect();
        f.debug_struct("Dispatcher").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{SaslPayload, Stanza, StreamFeatures};
    use crate::parser::{ns, StreamHeader};

    #[derive(Default)]
    struct Trace {
        calls: Vec<&'static str>,
    }

    #[test]
    fn test_classify_is_total() {
        let cases = [
            (Packet::StreamOpen(StreamHeader::default()), EventCategory::StreamOpen),
            (Packet::StreamClose, EventCategory::StreamClose),
            (Packet::Features(StreamFeatures::default()), EventCategory::Features),
            (Packet::StartTls, EventCategory::SecureChannel),
            (Packet::TlsProceed, EventCategory::SecureChannel),
            (Packet::SaslResponse(SaslPayload::default()), EventCategory::Auth),
            (Packet::SaslAbort, EventCategory::Auth),
            (Packet::Iq(Stanza::new(ns::JABBER_CLIENT)), EventCategory::InfoQuery),
            (Packet::Message(Stanza::new(ns::JABBER_CLIENT)), EventCategory::Message),
            (Packet::Presence(Stanza::new(ns::JABBER_SERVER)), EventCategory::Presence),
            (Packet::Compressed, EventCategory::Compression),
            (
                Packet::Custom(minidom::Element::builder("r", "urn:xmpp:sm:3").build()),
                EventCategory::Unrecognized,
            ),
        ];
        for (packet, category) in cases {
            assert_eq!(classify(&packet), category, "{packet:?}");
        }
    }

    #[test]
    fn test_last_registered_wins() {
        let mut dispatcher = Dispatcher::<Trace>::new();
        dispatcher.add_handler(EventCategory::Message, |trace, _| {
            trace.calls.push("h1");
            true
        });
        dispatcher.add_handler(EventCategory::Message, |trace, _| {
            trace.calls.push("h2");
            true
        });

        let mut trace = Trace::default();
        let packet = Packet::Message(Stanza::new(ns::JABBER_CLIENT));
        let outcome = dispatcher.dispatch(EventCategory::Message, &mut trace, &packet);

        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(trace.calls, vec!["h2"]);
    }

    #[test]
    fn test_declining_handler_falls_through() {
        let mut dispatcher = Dispatcher::<Trace>::new();
        dispatcher.add_handler(EventCategory::Presence, |trace, _| {
            trace.calls.push("default");
            true
        });
        dispatcher.add_handler(EventCategory::Presence, |trace, _| {
            trace.calls.push("filter");
            false
        });

        let mut trace = Trace::default();
        let packet = Packet::Presence(Stanza::new(ns::JABBER_CLIENT));
        dispatcher.dispatch(EventCategory::Presence, &mut trace, &packet);
        assert_eq!(trace.calls, vec!["filter", "default"]);
    }

    #[test]
    fn test_unclaimed_event_is_ignored() {
        let mut dispatcher = Dispatcher::<Trace>::new();
        dispatcher.add_handler(EventCategory::Message, |_, _| false);

        let mut trace = Trace::default();
        let packet = Packet::Message(Stanza::new(ns::JABBER_CLIENT));
        assert_eq!(
            dispatcher.dispatch(EventCategory::Message, &mut trace, &packet),
            DispatchOutcome::Ignored
        );
        assert_eq!(
            dispatcher.dispatch(EventCategory::Presence, &mut trace, &packet),
            DispatchOutcome::Ignored
        );
        assert_eq!(dispatcher.handler_count(EventCategory::Message), 1);
        assert_eq!(dispatcher.handler_count(EventCategory::Presence), 0);
    }
}
