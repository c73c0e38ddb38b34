use std::error::Error;
use std::sync::Arc;

use crate::message::Message;
use crate::packet::Packet;
use crate::ClientId;

/// Events surfaced through the [`Logger`] callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A client came online.
    NewConnection,
    /// A packet has been received.
    PacketReceived,
    /// A message has been published.
    MessagePublished,
    /// A message has been acknowledged.
    MessageAcknowledged,
    /// A message has been forwarded to a subscriber.
    MessageForwarded,
    /// A packet has been sent.
    PacketSent,
    /// A client disconnected cleanly.
    ClientDisconnected,
    /// An underlying transport error occurred.
    TransportError,
    /// A call to the session failed.
    SessionError,
    /// A call to the backend failed.
    BackendError,
    /// The client violated the protocol.
    ClientError,
    /// The connection has been terminated.
    LostConnection,
}

/// Observer callback for per-connection activity.
///
/// The callback runs on the connection task, so it must not block; a host
/// that needs buffering or I/O hands the event off to its own channel.
pub type Logger = Arc<
    dyn Fn(
            LogEvent,
            Option<ClientId>,
            Option<&Packet>,
            Option<&Message>,
            Option<&(dyn Error + 'static)>,
        ) + Send
        + Sync,
>;

pub(crate) fn noop() -> Logger {
    Arc::new(|_, _, _, _, _| {})
}
