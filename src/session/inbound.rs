use crate::collections::FnvHashMap;
use crate::message::Message;

use super::PacketId;

/// Inbound QoS 2 publishes, keyed by packet ID.
///
/// A QoS 2 message is stored here when its PUBLISH arrives and is only handed
/// to the backend when the matching PUBREL releases it, which is what makes
/// the flow exactly-once: a duplicate PUBLISH with the same ID finds the
/// entry and is answered with another PUBREC without being stored again.
#[derive(Debug, Default)]
pub struct IncomingPublishes {
    packets: FnvHashMap<PacketId, Message>,
}

#[derive(Debug, thiserror::Error)]
#[error("{packet_id:?} is already stored")]
pub struct StoredPacketError {
    pub packet_id: PacketId,
}

impl IncomingPublishes {
    pub fn contains(&self, packet_id: PacketId) -> bool {
        self.packets.contains_key(&packet_id)
    }

    /// Store a message until its PUBREL arrives.
    ///
    /// Refusing duplicates instead of overwriting makes a missed `contains`
    /// check at the call site loud rather than silently double-storing.
    pub fn store(&mut self, packet_id: PacketId, message: Message) -> Result<(), StoredPacketError> {
        match self.packets.insert(packet_id, message) {
            None => Ok(()),
            Some(replaced) => {
                self.packets.insert(packet_id, replaced);
                Err(StoredPacketError { packet_id })
            }
        }
    }

    /// Take the message out in response to a PUBREL.
    pub fn release(&mut self, packet_id: PacketId) -> Option<Message> {
        self.packets.remove(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::packet::QoS;

    use super::*;

    #[test]
    fn store_release_cycle() {
        let mut incoming = IncomingPublishes::default();
        let id = PacketId::new(7).unwrap();
        let message = Message::new("a/b", Bytes::from_static(b"hi"), QoS::ExactlyOnce);

        incoming.store(id, message.clone()).unwrap();
        assert!(incoming.contains(id));

        // A duplicate store must not clobber the original.
        incoming
            .store(id, Message::new("x", Bytes::new(), QoS::ExactlyOnce))
            .unwrap_err();

        assert_eq!(incoming.release(id), Some(message));
        assert_eq!(incoming.release(id), None);
        assert!(incoming.is_empty());
    }
}
