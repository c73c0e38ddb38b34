//! Per-client-id session state: subscriptions, the inbound exactly-once
//! table and the outbound mailbox.
//!
//! The session outlives any single connection when the client connects with
//! `clean_session = false`; the backend stores it between connections.

use std::num::NonZeroU16;

use crate::collections::HashMap;
use crate::message::Message;
use crate::packet::QoS;
use crate::topic::Filter;

mod inbound;
mod mailbox;

pub use inbound::{IncomingPublishes, StoredPacketError};
pub use mailbox::{
    AckError, MailSender, Mailbox, OpenMailbox, OrderedMail, Release, UnorderedMail,
};

/// A nonzero MQTT packet identifier.
///
/// Packet ID 0 is never valid on the wire, which lets `Option<PacketId>`
/// represent "no packet ID" for free.
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash, Debug)]
pub struct PacketId(NonZeroU16);

impl PacketId {
    pub const START: PacketId = PacketId(NonZeroU16::MIN);

    pub fn new(id: u16) -> Option<PacketId> {
        NonZeroU16::new(id).map(Self)
    }

    pub fn get(self) -> u16 {
        self.0.get()
    }

    /// Increment `self` or wrap around to 1, returning the previous value.
    pub fn wrapping_increment(&mut self) -> Self {
        let ret = *self;
        *self = PacketId(self.0.checked_add(1).unwrap_or(NonZeroU16::MIN));
        ret
    }
}

/// The session's record of its own subscriptions, kept in sync with the
/// backend's shared subscription tree.
pub type Subscriptions = HashMap<Filter, QoS>;

/// Session state for one client ID.
pub struct Session {
    /// The clean-session flag the session was created with. Clean sessions
    /// are discarded on disconnect instead of being stored.
    pub clean: bool,

    /// Active subscriptions and their granted QoS.
    pub subscriptions: Subscriptions,

    /// Inbound QoS 2 publishes awaiting their PUBREL.
    pub incoming: IncomingPublishes,

    /// The outbound pipeline; see [`Mailbox`].
    pub mailbox: Mailbox,

    /// The will recorded at CONNECT. Cleared by a clean DISCONNECT; published
    /// on any other kind of connection loss.
    pub will: Option<Message>,
}

impl Session {
    pub fn new(clean: bool) -> Self {
        Session {
            clean,
            subscriptions: HashMap::new(),
            incoming: IncomingPublishes::default(),
            mailbox: Mailbox::default(),
            will: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_id_wraps_past_zero() {
        let mut id = PacketId::new(u16::MAX).unwrap();
        assert_eq!(id.wrapping_increment().get(), u16::MAX);
        assert_eq!(id, PacketId::START);
    }

    #[test]
    fn zero_is_not_a_packet_id() {
        assert_eq!(PacketId::new(0), None);
    }
}
