//! The outbound half of a session.
//!
//! Publishes fanned out by the backend land here through a [`MailSender`];
//! the connection task drains them through an [`OpenMailbox`]. The mailbox
//! owns the outbound packet-id allocator and the QoS 1/2 bookkeeping, so the
//! whole outbound state survives a reconnect with `clean_session = false` and
//! unacknowledged publishes are replayed with the DUP flag set.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::{cmp, future};

use tokio::sync::mpsc;

use crate::collections::FnvHashSet;
use crate::message::Message;
use crate::packet::QoS;

use super::PacketId;

pub struct MailSender {
    shared: Arc<MailboxShared>,
}

pub struct Mailbox {
    shared: Arc<MailboxShared>,
    delivery_rx: mpsc::UnboundedReceiver<Delivery>,
    /// QoS 1 and 2 publishes in delivery order. Entries before `next_unread`
    /// of the open mailbox have been written to the wire and await their
    /// acknowledgement.
    ordered_mail: VecDeque<OrderedMail>,
    next_packet_id: PacketId,
    /// QoS 2 packet IDs that have had their PUBREL sent, but no PUBCOMP has
    /// been received yet.
    released_ids: FnvHashSet<PacketId>,
    /// Every packet ID currently owned by an unfinished outbound publish.
    /// The allocator must not hand these out again [MQTT-2.3.1-4].
    in_flight: FnvHashSet<PacketId>,
}

struct MailboxShared {
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    accepting_mail: AtomicBool,
}

pub struct OpenMailbox<'a> {
    mailbox: &'a mut Mailbox,
    next_unread: usize,
    // QoS 0 messages are kept separately: there is no obligation to deliver
    // them in order with the acknowledged flows, or to buffer them at all
    // while the client is away.
    unordered_mail: VecDeque<UnorderedMail>,
}

/// A QoS 1 or 2 PUBLISH.
///
/// QoS 1 and 2 PUBLISHes are delivered in a strict ordering, and their
/// acknowledgements must come back in the same order [MQTT-4.6.0-2].
pub struct OrderedMail {
    pub packet_id: PacketId,
    /// Set once the entry has been written to the wire; a later send of the
    /// same entry is a re-delivery and carries DUP on the wire.
    pub dup: bool,
    /// The effective QoS: `min(subscription QoS, publish QoS)`.
    pub qos: QoS,
    pub retain: bool,
    pub message: Message,
}

/// A QoS 0 PUBLISH.
pub struct UnorderedMail {
    pub retain: bool,
    pub message: Message,
}

/// Send a `PUBREL` for the given packet.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "must send `PUBREL` to the client"]
pub struct Release(pub PacketId);

struct Delivery {
    qos: QoS,
    retain: bool,
    message: Message,
}

impl Mailbox {
    pub fn sender(&self) -> MailSender {
        MailSender {
            shared: self.shared.clone(),
        }
    }

    pub fn open(&mut self) -> OpenMailbox<'_> {
        self.shared.accepting_mail.store(true, Ordering::Release);

        OpenMailbox {
            mailbox: self,
            // When a new connection opens the mailbox, all pending mail is
            // unread again and will be re-sent.
            next_unread: 0,
            unordered_mail: VecDeque::new(),
        }
    }

    /// Packet IDs whose PUBREL must be re-sent after a reconnect: the PUBREL
    /// went out on a previous connection but its PUBCOMP never arrived.
    pub fn pending_releases(&self) -> Vec<PacketId> {
        let mut ids: Vec<PacketId> = self.released_ids.iter().copied().collect();
        ids.sort();
        ids
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        Mailbox {
            shared: Arc::new(MailboxShared {
                delivery_tx,
                accepting_mail: AtomicBool::new(false),
            }),
            delivery_rx,
            ordered_mail: VecDeque::new(),
            next_packet_id: PacketId::START,
            released_ids: FnvHashSet::default(),
            in_flight: FnvHashSet::default(),
        }
    }
}

impl MailSender {
    /// Queue a PUBLISH for the session this mailbox belongs to.
    ///
    /// Returns `false` if the session is gone for good and the caller should
    /// drop its sender. Note that this is different from the mailbox not
    /// currently being open: a disconnected client with a stored session
    /// still accumulates QoS 1 and 2 mail for a later reconnect.
    pub fn deliver(&self, subscription_qos: QoS, retain: bool, message: Message) -> bool {
        let effective_qos = cmp::min(subscription_qos, message.qos);

        // There is no responsibility to buffer QoS 0 publishes for
        // disconnected clients.
        if effective_qos == QoS::AtMostOnce
            && !self.shared.accepting_mail.load(Ordering::Acquire)
        {
            tracing::trace!("discarding QoS 0 publish because client is not accepting mail");
            return !self.shared.delivery_tx.is_closed();
        }

        self.shared
            .delivery_tx
            .send(Delivery {
                qos: effective_qos,
                retain,
                message,
            })
            .is_ok()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    #[error("unknown {0:?}")]
    UnknownPacket(PacketId),
    #[error("invalid operation {op} for {packet_id:?} at {qos:?}")]
    InvalidOperation {
        op: &'static str,
        packet_id: PacketId,
        qos: QoS,
    },
}

impl OpenMailbox<'_> {
    /// A fan-out handle for queueing additional mail, e.g. retained messages
    /// on a fresh subscription.
    pub fn sender(&self) -> MailSender {
        self.mailbox.sender()
    }

    /// Receive any pending mail. Returns once at least one delivery was
    /// processed.
    pub async fn process_deliveries(&mut self) {
        // Consume as many deliveries as possible before returning.
        let mut received = false;
        future::poll_fn(|cx| {
            loop {
                // This will return `Pending` when the task has consumed its
                // coop budget, so this cannot spin forever even if producers
                // outpace the connection.
                let delivery = match self.mailbox.delivery_rx.poll_recv(cx) {
                    Poll::Ready(Some(delivery)) => delivery,
                    Poll::Ready(None) => unreachable!(
                        "BUG: `delivery_rx` cannot close while the mailbox holds a sender"
                    ),
                    Poll::Pending => {
                        return if received {
                            Poll::Ready(())
                        } else {
                            Poll::Pending
                        };
                    }
                };

                match delivery.qos {
                    QoS::AtMostOnce => self.unordered_mail.push_back(UnorderedMail {
                        retain: delivery.retain,
                        message: delivery.message,
                    }),
                    QoS::AtLeastOnce | QoS::ExactlyOnce => self.push_ordered(delivery),
                }

                received = true;
            }
        })
        .await;
    }

    fn push_ordered(&mut self, delivery: Delivery) {
        debug_assert_ne!(delivery.qos, QoS::AtMostOnce);

        let packet_id = self.allocate_packet_id();

        self.mailbox.ordered_mail.push_back(OrderedMail {
            packet_id,
            dup: false,
            qos: delivery.qos,
            retain: delivery.retain,
            message: delivery.message,
        });
    }

    fn allocate_packet_id(&mut self) -> PacketId {
        // Never hand out an ID that still belongs to an unacknowledged
        // publish. With 2^16 - 1 usable IDs this terminates long before the
        // queue could plausibly grow that large.
        loop {
            let id = self.mailbox.next_packet_id.wrapping_increment();
            if self.mailbox.in_flight.insert(id) {
                return id;
            }
        }
    }

    pub fn pop_unordered(&mut self) -> Option<UnorderedMail> {
        self.unordered_mail.pop_front()
    }

    pub fn next_ordered_unread(&self) -> Option<&OrderedMail> {
        self.mailbox.ordered_mail.get(self.next_unread)
    }

    pub fn mark_ordered_read(&mut self) {
        if let Some(mail) = self.mailbox.ordered_mail.get_mut(self.next_unread) {
            mail.dup = true;
        }

        self.next_unread = cmp::min(self.next_unread + 1, self.mailbox.ordered_mail.len());
    }

    /// Packet IDs needing a PUBREL after resuming a stored session.
    pub fn pending_releases(&self) -> Vec<PacketId> {
        self.mailbox.pending_releases()
    }

    fn pop(&mut self) {
        self.mailbox.ordered_mail.pop_front();
        self.next_unread = self.next_unread.saturating_sub(1);
    }

    pub fn puback(&mut self, packet_id: PacketId) -> Result<(), AckError> {
        // Clients must acknowledge publishes in the order they received them
        // [MQTT-4.6.0-2].
        let front = self
            .mailbox
            .ordered_mail
            .front()
            .filter(|mail| mail.packet_id == packet_id)
            .ok_or(AckError::UnknownPacket(packet_id))?;

        if front.qos != QoS::AtLeastOnce {
            return Err(AckError::InvalidOperation {
                op: "PUBACK",
                packet_id,
                qos: front.qos,
            });
        }

        self.pop();
        self.mailbox.in_flight.remove(&packet_id);

        Ok(())
    }

    pub fn pubrec(&mut self, packet_id: PacketId) -> Result<Release, AckError> {
        let front = self
            .mailbox
            .ordered_mail
            .front()
            .filter(|mail| mail.packet_id == packet_id)
            .ok_or(AckError::UnknownPacket(packet_id))?;

        if front.qos != QoS::ExactlyOnce {
            return Err(AckError::InvalidOperation {
                op: "PUBREC",
                packet_id,
                qos: front.qos,
            });
        }

        self.pop();

        // The ID stays in flight until the PUBCOMP closes the handshake.
        self.mailbox.released_ids.insert(packet_id);

        Ok(Release(packet_id))
    }

    pub fn pubcomp(&mut self, packet_id: PacketId) -> Result<(), AckError> {
        if !self.mailbox.released_ids.remove(&packet_id) {
            return Err(AckError::UnknownPacket(packet_id));
        }

        self.mailbox.in_flight.remove(&packet_id);

        Ok(())
    }
}

impl Drop for OpenMailbox<'_> {
    fn drop(&mut self) {
        self.mailbox
            .shared
            .accepting_mail
            .store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn message(qos: QoS) -> Message {
        Message::new("a/b", Bytes::from_static(b"hi"), qos)
    }

    #[tokio::test]
    async fn qos1_flow_assigns_ids_and_clears_on_puback() {
        let mut mailbox = Mailbox::default();
        let sender = mailbox.sender();

        let mut open = mailbox.open();
        assert!(sender.deliver(QoS::AtLeastOnce, false, message(QoS::AtLeastOnce)));
        open.process_deliveries().await;

        let mail = open.next_ordered_unread().unwrap();
        let id = mail.packet_id;
        assert!(!mail.dup);
        open.mark_ordered_read();

        assert_eq!(open.puback(id), Ok(()));
        assert!(open.next_ordered_unread().is_none());
    }

    #[tokio::test]
    async fn qos2_flow_requires_pubrec_then_pubcomp() {
        let mut mailbox = Mailbox::default();
        let sender = mailbox.sender();

        let mut open = mailbox.open();
        assert!(sender.deliver(QoS::ExactlyOnce, false, message(QoS::ExactlyOnce)));
        open.process_deliveries().await;

        let id = open.next_ordered_unread().unwrap().packet_id;
        open.mark_ordered_read();

        // PUBACK is the wrong acknowledgement for a QoS 2 publish.
        assert_eq!(
            open.puback(id),
            Err(AckError::InvalidOperation {
                op: "PUBACK",
                packet_id: id,
                qos: QoS::ExactlyOnce,
            })
        );

        assert_eq!(open.pubrec(id), Ok(Release(id)));
        assert_eq!(open.pubrec(id), Err(AckError::UnknownPacket(id)));
        assert_eq!(open.pubcomp(id), Ok(()));
        assert_eq!(open.pubcomp(id), Err(AckError::UnknownPacket(id)));
    }

    #[tokio::test]
    async fn unread_mail_is_replayed_with_dup_after_reopen() {
        let mut mailbox = Mailbox::default();
        let sender = mailbox.sender();

        let first_id = {
            let mut open = mailbox.open();
            assert!(sender.deliver(QoS::AtLeastOnce, false, message(QoS::AtLeastOnce)));
            open.process_deliveries().await;

            let id = open.next_ordered_unread().unwrap().packet_id;
            open.mark_ordered_read();
            // Connection dies before the PUBACK arrives.
            id
        };

        let mut open = mailbox.open();
        let mail = open.next_ordered_unread().unwrap();
        assert_eq!(mail.packet_id, first_id);
        assert!(mail.dup, "replayed mail must carry the DUP flag");
    }

    #[tokio::test]
    async fn packet_ids_skip_in_flight_entries() {
        let mut mailbox = Mailbox::default();
        let sender = mailbox.sender();

        let mut open = mailbox.open();
        for _ in 0..3 {
            assert!(sender.deliver(QoS::AtLeastOnce, false, message(QoS::AtLeastOnce)));
        }
        open.process_deliveries().await;

        let mut ids = Vec::new();
        while let Some(mail) = open.next_ordered_unread() {
            ids.push(mail.packet_id);
            open.mark_ordered_read();
        }

        assert_eq!(ids.len(), 3);
        ids.dedup();
        assert_eq!(ids.len(), 3, "all in-flight ids must be distinct");
    }

    #[tokio::test]
    async fn effective_qos_is_capped_by_the_subscription() {
        let mut mailbox = Mailbox::default();
        let sender = mailbox.sender();

        let mut open = mailbox.open();
        assert!(sender.deliver(QoS::AtMostOnce, false, message(QoS::ExactlyOnce)));
        open.process_deliveries().await;

        // Capped to QoS 0, so it lands in the unordered queue.
        assert!(open.next_ordered_unread().is_none());
        assert!(open.pop_unordered().is_some());
    }

    #[tokio::test]
    async fn qos0_mail_is_dropped_while_closed() {
        let mut mailbox = Mailbox::default();
        let sender = mailbox.sender();

        assert!(sender.deliver(QoS::AtMostOnce, false, message(QoS::AtMostOnce)));
        assert!(sender.deliver(QoS::AtLeastOnce, false, message(QoS::AtLeastOnce)));

        let mut open = mailbox.open();
        open.process_deliveries().await;

        assert!(open.pop_unordered().is_none());
        assert!(open.next_ordered_unread().is_some());
    }

    #[tokio::test]
    async fn pending_releases_survive_reopen() {
        let mut mailbox = Mailbox::default();
        let sender = mailbox.sender();

        let id = {
            let mut open = mailbox.open();
            assert!(sender.deliver(QoS::ExactlyOnce, false, message(QoS::ExactlyOnce)));
            open.process_deliveries().await;

            let id = open.next_ordered_unread().unwrap().packet_id;
            open.mark_ordered_read();
            let Release(id) = open.pubrec(id).unwrap();
            // Connection dies before the PUBCOMP arrives.
            id
        };

        let open = mailbox.open();
        assert_eq!(open.pending_releases(), [id]);
    }
}
