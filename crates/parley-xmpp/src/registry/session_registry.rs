//! Session registry implementation.
//!
//! Tracks bound sessions by their full JID for stanza routing.

use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::{BareJid, FullJid};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::packet::Packet;
use crate::stream::Mailbox;

/// A bound session as seen by other sessions.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// Output queue of the session
    pub mailbox: Mailbox,
    /// Stream id the resource was bound on
    pub stream_id: String,
    /// Connection that owns the binding
    pub conn_id: Uuid,
}

/// Result of attempting to deliver a packet to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Packet was queued for delivery
    Sent,
    /// The recipient is not bound
    NotConnected,
    /// The recipient's queue is closed; the stale entry was removed
    ChannelClosed,
}

/// Registry of bound sessions.
///
/// Thread-safe map of full JIDs to session entries. Uses DashMap for
/// concurrent access without explicit locking.
pub struct SessionRegistry {
    sessions: DashMap<FullJid, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        info!("Creating session registry");
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Bind `jid` to a session unless another session already holds it.
    ///
    /// Returns `false` when the resource is taken by a live session. A stale
    /// entry whose queue is closed is replaced.
    #[instrument(skip(self, entry), fields(jid = %jid))]
    pub fn try_register(&self, jid: FullJid, entry: SessionEntry) -> bool {
        match self.sessions.entry(jid) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().mailbox.is_closed() {
                    debug!("Resource already bound");
                    return false;
                }
                debug!("Replaced stale session registration");
                occupied.insert(entry);
                true
            }
            Entry::Vacant(vacant) => {
                debug!("Registered session");
                vacant.insert(entry);
                true
            }
        }
    }

    /// Remove the binding for `jid` if it still belongs to `conn_id`.
    #[instrument(skip(self), fields(jid = %jid))]
    pub fn unregister(&self, jid: &FullJid, conn_id: Uuid) -> Option<SessionEntry> {
        let removed = self
            .sessions
            .remove_if(jid, |_, entry| entry.conn_id == conn_id)
            .map(|(_, entry)| entry);
        if removed.is_some() {
            debug!("Unregistered session");
        }
        removed
    }

    pub fn is_bound(&self, jid: &FullJid) -> bool {
        self.sessions.contains_key(jid)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// All bound resources of `bare`.
    pub fn resources_of(&self, bare: &BareJid) -> Vec<FullJid> {
        self.sessions
            .iter()
            .filter(|entry| entry.key().to_bare() == *bare)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Queue `packet` on the session bound to `jid`.
    #[instrument(skip(self, packet), fields(to = %jid))]
    pub fn send_to(&self, jid: &FullJid, packet: &Packet) -> SendResult {
        let entry = match self.sessions.get(jid) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!("Recipient not bound");
                return SendResult::NotConnected;
            }
        };
        self.deliver(jid, &entry, packet)
    }

    /// Queue `packet` on a looked-up entry, evicting only that entry if its
    /// queue is gone. The resource may have been rebound since the lookup.
    fn deliver(&self, jid: &FullJid, entry: &SessionEntry, packet: &Packet) -> SendResult {
        if entry.mailbox.deliver(packet).is_ok() {
            debug!("Packet queued for delivery");
            return SendResult::Sent;
        }

        debug!("Outbound queue closed, session may have dropped");
        self.sessions
            .remove_if(jid, |_, current| current.conn_id == entry.conn_id);
        SendResult::ChannelClosed
    }

    /// Queue `packet` on every bound resource of `bare`.
    ///
    /// Returns the number of sessions it was delivered to.
    pub fn route_bare(&self, bare: &BareJid, packet: &Packet) -> usize {
        self.resources_of(bare)
            .iter()
            .filter(|jid| self.send_to(jid, packet) == SendResult::Sent)
            .count()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("session_count", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::packet::Stanza;
    use crate::parser::ns;

    fn test_jid(user: &str, resource: &str) -> FullJid {
        format!("{user}@example.com/{resource}").parse().unwrap()
    }

    fn entry(conn_id: Uuid) -> (SessionEntry, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SessionEntry {
                mailbox: Mailbox::new(tx),
                stream_id: "s1".to_string(),
                conn_id,
            },
            rx,
        )
    }

    fn message() -> Packet {
        Packet::Message(Stanza::new(ns::JABBER_CLIENT).with_type("chat"))
    }

    #[test]
    fn test_register_conflict() {
        let registry = SessionRegistry::new();
        let jid = test_jid("alice", "home");
        let (first, _rx1) = entry(Uuid::new_v4());
        let (second, _rx2) = entry(Uuid::new_v4());

        assert!(registry.try_register(jid.clone(), first));
        assert!(!registry.try_register(jid.clone(), second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_entry_is_replaced() {
        let registry = SessionRegistry::new();
        let jid = test_jid("alice", "home");
        let (first, rx1) = entry(Uuid::new_v4());
        let (second, _rx2) = entry(Uuid::new_v4());

        assert!(registry.try_register(jid.clone(), first));
        drop(rx1);
        assert!(registry.try_register(jid, second));
    }

    #[test]
    fn test_unregister_checks_owner() {
        let registry = SessionRegistry::new();
        let jid = test_jid("alice", "home");
        let owner = Uuid::new_v4();
        let (first, _rx) = entry(owner);
        registry.try_register(jid.clone(), first);

        assert!(registry.unregister(&jid, Uuid::new_v4()).is_none());
        assert!(registry.is_bound(&jid));
        assert!(registry.unregister(&jid, owner).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_to() {
        let registry = SessionRegistry::new();
        let jid = test_jid("bob", "work");
        let (bob, mut rx) = entry(Uuid::new_v4());
        registry.try_register(jid.clone(), bob);

        assert_eq!(registry.send_to(&jid, &message()), SendResult::Sent);
        let bytes = rx.try_recv().unwrap();
        assert!(String::from_utf8(bytes).unwrap().starts_with("<message"));

        assert_eq!(
            registry.send_to(&test_jid("carol", "x"), &message()),
            SendResult::NotConnected
        );

        drop(rx);
        assert_eq!(registry.send_to(&jid, &message()), SendResult::ChannelClosed);
        assert!(!registry.is_bound(&jid));
    }

    #[test]
    fn test_stale_delivery_keeps_rebound_session() {
        let registry = SessionRegistry::new();
        let jid = test_jid("alice", "home");
        let (first, rx1) = entry(Uuid::new_v4());
        let stale = first.clone();
        registry.try_register(jid.clone(), first);

        // The first session goes away and the resource is bound again.
        drop(rx1);
        let second_conn = Uuid::new_v4();
        let (second, mut rx2) = entry(second_conn);
        assert!(registry.try_register(jid.clone(), second));

        // A sender still holding the old entry fails without evicting the new one.
        assert_eq!(
            registry.deliver(&jid, &stale, &message()),
            SendResult::ChannelClosed
        );
        assert!(registry.is_bound(&jid));
        assert_eq!(registry.send_to(&jid, &message()), SendResult::Sent);
        assert!(rx2.try_recv().is_ok());
        assert!(registry.unregister(&jid, second_conn).is_some());
    }

    #[test]
    fn test_route_bare() {
        let registry = SessionRegistry::new();
        let (home, mut rx_home) = entry(Uuid::new_v4());
        let (work, mut rx_work) = entry(Uuid::new_v4());
        let (other, mut rx_other) = entry(Uuid::new_v4());
        registry.try_register(test_jid("alice", "home"), home);
        registry.try_register(test_jid("alice", "work"), work);
        registry.try_register(test_jid("bob", "home"), other);

        let bare: BareJid = "alice@example.com".parse().unwrap();
        assert_eq!(registry.resources_of(&bare).len(), 2);
        assert_eq!(registry.route_bare(&bare, &message()), 2);
        assert!(rx_home.try_recv().is_ok());
        assert!(rx_work.try_recv().is_ok());
        assert!(rx_other.try_recv().is_err());
    }
}
