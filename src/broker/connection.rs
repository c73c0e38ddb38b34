//! The per-connection protocol engine.
//!
//! A connection moves through `Connecting` (waiting for CONNECT under the
//! connect timeout), `Connected` (the packet loop below) and finally closes.
//! All durable state lives in the [`Session`] the backend vends at attach;
//! this task owns it until the connection ends.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, DetachReason};
use crate::broker::engine::Shared;
use crate::broker::log::LogEvent;
use crate::keep_alive::KeepAlive;
use crate::message::Message;
use crate::packet::{
    self, ConnAck, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    SubAck, Subscribe, SubscribeReasonCode, UnsubAck, Unsubscribe,
};
use crate::session::{
    IncomingPublishes, OpenMailbox, PacketId, Release, Session, Subscriptions,
};
use crate::topic::{Filter, TopicName};
use crate::transport::Transport;
use crate::ClientId;

pub(crate) struct Connection<B, T> {
    remote_addr: SocketAddr,

    client_id: Option<ClientId>,

    stream: T,
    read_buf: BytesMut,
    write_buf: Vec<u8>,

    token: CancellationToken,
    shared: Arc<Shared<B>>,

    keep_alive: KeepAlive,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(
        #[from]
        #[source]
        packet::Error,
    ),
    #[error("protocol violation: {0}")]
    Violation(String),
    #[error("connection closed by peer")]
    PeerClosed,
    #[error("keep alive expired")]
    KeepAliveTimeout,
    #[error("error reading from transport: {0}")]
    Read(crate::Error),
    #[error("error writing to transport: {0}")]
    Write(crate::Error),
    #[error("backend error: {0}")]
    Backend(crate::Error),
}

impl ConnectionError {
    fn log_event(&self) -> LogEvent {
        match self {
            ConnectionError::Protocol(_) | ConnectionError::Violation(_) => LogEvent::ClientError,
            ConnectionError::Backend(_) => LogEvent::BackendError,
            ConnectionError::PeerClosed
            | ConnectionError::KeepAliveTimeout
            | ConnectionError::Read(_)
            | ConnectionError::Write(_) => LogEvent::TransportError,
        }
    }
}

/// How the packet loop ended.
enum Exit {
    /// The client sent DISCONNECT.
    Clean,
    /// The connection token fired: engine shutdown or session takeover.
    Cancelled,
}

enum Flow {
    Continue,
    Disconnect,
}

macro_rules! violation (
    ($($message:tt)*) => {
        return Err(ConnectionError::Violation(format!($($message)*)))
    };
);

impl<B: Backend, T: Transport> Connection<B, T> {
    pub(crate) fn new(stream: T, token: CancellationToken, shared: Arc<Shared<B>>) -> Self {
        Connection {
            remote_addr: stream.remote_addr(),
            client_id: None,
            read_buf: BytesMut::with_capacity(shared.read_buffer),
            write_buf: Vec::with_capacity(shared.write_buffer),
            stream,
            token,
            shared,
            keep_alive: KeepAlive::default(),
        }
    }

    #[tracing::instrument(name = "Connection::run", skip_all, fields(remote_addr = %self.remote_addr))]
    pub(crate) async fn run(mut self) {
        self.log(LogEvent::NewConnection, None, None, None);

        // Connecting: the first packet must arrive within the connect timeout
        // and must be a CONNECT. Failures before CONNACK close silently.
        let first = match tokio::time::timeout(self.shared.connect_timeout, self.recv()).await {
            Ok(Ok(Some(packet))) => packet,
            Ok(Ok(None)) => {
                tracing::debug!("connection closed before CONNECT");
                self.log(LogEvent::LostConnection, None, None, None);
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!("error reading CONNECT: {e}");
                self.log(LogEvent::ClientError, None, None, Some(&e));
                let _ = self.stream.shutdown().await;
                self.log(LogEvent::LostConnection, None, None, None);
                return;
            }
            Err(_elapsed) => {
                tracing::debug!("connect timeout expired");
                let _ = self.stream.shutdown().await;
                self.log(LogEvent::LostConnection, None, None, None);
                return;
            }
        };

        let (client_id, mut session) = match self.handshake(first).await {
            Ok(Some(accepted)) => accepted,
            Ok(None) => {
                // Refused with the appropriate CONNACK code (or silently).
                self.log(LogEvent::LostConnection, None, None, None);
                return;
            }
            Err(e) => {
                self.log(e.log_event(), None, None, Some(&e));
                let _ = self.stream.shutdown().await;
                self.log(LogEvent::LostConnection, None, None, None);
                return;
            }
        };

        match self.run_session(client_id, &mut session).await {
            Ok(Exit::Clean) => {
                let _ = self.stream.shutdown().await;
                self.log(LogEvent::ClientDisconnected, None, None, None);
                self.detach(client_id, session, DetachReason::Clean).await;
            }
            Ok(Exit::Cancelled) => {
                // Shutting down: send nothing further, close, hand the
                // session back with its clean semantics preserved.
                let _ = self.stream.shutdown().await;

                let reason = if self.shared.shutdown.is_cancelled() {
                    DetachReason::Lost
                } else {
                    DetachReason::TakenOver
                };

                self.log(LogEvent::LostConnection, None, None, None);
                self.detach(client_id, session, reason).await;
            }
            Err(e) => {
                self.log(e.log_event(), None, None, Some(&e));
                let _ = self.stream.shutdown().await;

                // An abrupt end publishes the will [MQTT-3.1.2-8].
                if let Some(will) = session.will.take() {
                    if let Err(e) = self.shared.backend.publish(will).await {
                        self.log(LogEvent::BackendError, None, None, Some(as_std_error(&e)));
                    }
                }

                self.log(LogEvent::LostConnection, None, None, None);
                self.detach(client_id, session, DetachReason::Lost).await;
            }
        }
    }

    /// Process the CONNECT packet. Returns `Ok(None)` if the connection was
    /// refused (the refusal response, if any, has been sent).
    async fn handshake(
        &mut self,
        packet: Packet,
    ) -> Result<Option<(ClientId, Session)>, ConnectionError> {
        let Packet::Connect(connect) = packet else {
            // The spec recommends not responding at all before a valid
            // CONNECT, to avoid advertising the broker to port scanners.
            tracing::debug!(packet_type = ?packet.packet_type(), "expected CONNECT packet");
            let _ = self.stream.shutdown().await;
            return Ok(None);
        };

        tracing::trace!(?connect, "received");

        if connect.protocol_name != "MQTT" || connect.protocol_level != 4 {
            self.refuse(
                ConnectReturnCode::RefusedProtocolVersion,
                format!(
                    "unsupported protocol {:?} level {}",
                    connect.protocol_name, connect.protocol_level
                ),
            )
            .await?;

            return Ok(None);
        }

        let client_id = if connect.client_id.is_empty() {
            // An empty client ID is only allowed together with a clean
            // session [MQTT-3.1.3-7]; the broker assigns one.
            if !connect.clean_session {
                self.refuse(
                    ConnectReturnCode::BadClientId,
                    "empty client ID requires a clean session",
                )
                .await?;

                return Ok(None);
            }

            let assigned = ClientId::generate(&mut rand::thread_rng(), 16);
            tracing::debug!(%assigned, "assigned client ID");
            assigned
        } else {
            match connect.client_id.parse::<ClientId>() {
                Ok(client_id) => client_id,
                Err(e) => {
                    self.refuse(ConnectReturnCode::BadClientId, e).await?;
                    return Ok(None);
                }
            }
        };

        self.client_id = Some(client_id);

        match self
            .shared
            .backend
            .authenticate(client_id, connect.login.as_ref())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                let code = if connect.login.is_some() {
                    ConnectReturnCode::BadUserNamePassword
                } else {
                    ConnectReturnCode::NotAuthorized
                };

                self.refuse(code, "authentication failed").await?;
                return Ok(None);
            }
            Err(e) => {
                self.log(LogEvent::BackendError, None, None, Some(as_std_error(&e)));
                self.refuse(ConnectReturnCode::ServiceUnavailable, "backend unavailable")
                    .await?;

                return Ok(None);
            }
        }

        if let Some(will) = &connect.last_will {
            if TopicName::parse(&will.topic).is_err() {
                violation!("invalid will topic: {:?}", will.topic);
            }
        }

        let attached = match self
            .shared
            .backend
            .attach(client_id, connect.clean_session, self.token.clone())
            .await
        {
            Ok(attached) => attached,
            Err(e) => {
                self.log(LogEvent::BackendError, None, None, Some(as_std_error(&e)));
                self.refuse(ConnectReturnCode::ServiceUnavailable, "backend unavailable")
                    .await?;

                return Ok(None);
            }
        };

        let mut session = attached.session;
        session.will = connect.last_will.map(Message::from);

        self.keep_alive = KeepAlive::from_seconds(connect.keep_alive);

        let connack = self
            .send(Packet::ConnAck(ConnAck {
                session_present: attached.session_present,
                code: ConnectReturnCode::Success,
            }))
            .await;

        if let Err(e) = connack {
            // The session is attached by now; hand it back before bailing so
            // the client ID is not wedged.
            self.detach(client_id, session, DetachReason::Lost).await;
            return Err(e);
        }

        tracing::info!(
            %client_id,
            clean_session = connect.clean_session,
            session_present = attached.session_present,
            "client connected"
        );

        Ok(Some((client_id, session)))
    }

    #[tracing::instrument(skip_all, fields(%client_id))]
    async fn run_session(
        &mut self,
        client_id: ClientId,
        session: &mut Session,
    ) -> Result<Exit, ConnectionError> {
        let Session {
            subscriptions,
            incoming,
            mailbox,
            will,
            ..
        } = session;

        let pending_releases = mailbox.pending_releases();
        let mut mailbox = mailbox.open();

        // Cloned so the cancellation arm below does not borrow `self`.
        let token = self.token.clone();

        // Resume interrupted QoS 2 handshakes: the PUBREL went out on a
        // previous connection but its PUBCOMP never arrived.
        for packet_id in pending_releases {
            self.send(Packet::PubRel(PubRel {
                pkid: packet_id.get(),
            }))
            .await?;
        }

        // Replay anything still unread from a previous connection.
        self.drain_mail(&mut mailbox).await?;

        let mut deadline = next_deadline(self.keep_alive);

        loop {
            tokio::select! {
                () = token.cancelled() => return Ok(Exit::Cancelled),
                () = keep_alive_expired(deadline) => {
                    // Treated like a network failure [MQTT-3.1.2-22].
                    return Err(ConnectionError::KeepAliveTimeout);
                }
                res = self.stream_recv() => {
                    let Some(packet) = res? else {
                        return Err(ConnectionError::PeerClosed);
                    };

                    deadline = next_deadline(self.keep_alive);

                    let flow = self
                        .handle_packet(client_id, subscriptions, incoming, will, &mut mailbox, packet)
                        .await?;

                    if let Flow::Disconnect = flow {
                        return Ok(Exit::Clean);
                    }
                }
                () = mailbox.process_deliveries() => {}
            }

            self.drain_mail(&mut mailbox).await?;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_packet(
        &mut self,
        client_id: ClientId,
        subscriptions: &mut Subscriptions,
        incoming: &mut IncomingPublishes,
        will: &mut Option<Message>,
        mailbox: &mut OpenMailbox<'_>,
        packet: Packet,
    ) -> Result<Flow, ConnectionError> {
        match packet {
            Packet::PingReq => {
                self.send(Packet::PingResp).await?;
            }
            Packet::Publish(publish) => {
                self.handle_publish(incoming, publish).await?;
            }
            Packet::PubAck(PubAck { pkid }) => {
                let packet_id = nonzero_packet_id(pkid)?;

                if let Err(e) = mailbox.puback(packet_id) {
                    violation!("invalid PUBACK: {e}");
                }

                self.log(LogEvent::MessageAcknowledged, None, None, None);
            }
            Packet::PubRec(PubRec { pkid }) => {
                let packet_id = nonzero_packet_id(pkid)?;

                let release = match mailbox.pubrec(packet_id) {
                    Ok(release) => release,
                    Err(e) => violation!("invalid PUBREC: {e}"),
                };

                let Release(packet_id) = release;
                self.send(Packet::PubRel(PubRel {
                    pkid: packet_id.get(),
                }))
                .await?;
            }
            Packet::PubComp(PubComp { pkid }) => {
                let packet_id = nonzero_packet_id(pkid)?;

                if let Err(e) = mailbox.pubcomp(packet_id) {
                    violation!("invalid PUBCOMP: {e}");
                }

                self.log(LogEvent::MessageAcknowledged, None, None, None);
            }
            Packet::PubRel(PubRel { pkid }) => {
                let packet_id = nonzero_packet_id(pkid)?;

                // The release hands the stored message to the backend; an
                // unknown ID still gets its PUBCOMP so a retrying client can
                // make progress.
                if let Some(message) = incoming.release(packet_id) {
                    self.publish_to_backend(message).await?;
                }

                self.send(Packet::PubComp(PubComp { pkid })).await?;
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(client_id, subscriptions, mailbox, subscribe)
                    .await?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, subscriptions, unsubscribe)
                    .await?;
            }
            Packet::Disconnect => {
                // A clean disconnect discards the will [MQTT-3.1.2-10].
                *will = None;
                return Ok(Flow::Disconnect);
            }
            Packet::Connect(_) => {
                // [MQTT-3.1.0-2]
                violation!("second CONNECT packet");
            }
            Packet::ConnAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp => {
                violation!("unexpected {:?} from client", packet.packet_type());
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_publish(
        &mut self,
        incoming: &mut IncomingPublishes,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        if TopicName::parse(&publish.topic).is_err() {
            violation!("invalid publish topic: {:?}", publish.topic);
        }

        let qos = publish.qos;
        let pkid = publish.pkid;

        match qos {
            QoS::AtMostOnce => {
                self.publish_to_backend(Message::from(publish)).await?;
            }
            QoS::AtLeastOnce => {
                // Deliver, then acknowledge. A duplicate can only arrive
                // after the PUBACK went out, which is at-least-once working
                // as intended.
                self.publish_to_backend(Message::from(publish)).await?;
                self.send(Packet::PubAck(PubAck { pkid })).await?;
            }
            QoS::ExactlyOnce => {
                let packet_id = nonzero_packet_id(pkid)?;

                if incoming.contains(packet_id) {
                    // Duplicate delivery of an unreleased publish: repeat the
                    // PUBREC, do not store again.
                    self.send(Packet::PubRec(PubRec { pkid })).await?;
                    return Ok(());
                }

                incoming
                    .store(packet_id, Message::from(publish))
                    .expect("BUG: checked `contains()` above");

                self.send(Packet::PubRec(PubRec { pkid })).await?;
            }
        }

        Ok(())
    }

    async fn handle_subscribe(
        &mut self,
        client_id: ClientId,
        subscriptions: &mut Subscriptions,
        mailbox: &mut OpenMailbox<'_>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let sender = mailbox.sender();
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());

        for filter in subscribe.filters {
            let Ok(parsed) = filter.path.parse::<Filter>() else {
                return_codes.push(SubscribeReasonCode::Failure);
                continue;
            };

            let retained = self
                .shared
                .backend
                .subscribe(client_id, subscriptions, parsed, filter.qos)
                .await
                .map_err(ConnectionError::Backend)?;

            return_codes.push(SubscribeReasonCode::Success(filter.qos));

            // Queued now, written after the SUBACK below; the retain flag
            // stays set and the QoS is capped by the subscription.
            for message in retained {
                sender.deliver(filter.qos, true, message);
            }
        }

        self.send(Packet::SubAck(SubAck {
            pkid: subscribe.pkid,
            return_codes,
        }))
        .await?;

        Ok(())
    }

    async fn handle_unsubscribe(
        &mut self,
        client_id: ClientId,
        subscriptions: &mut Subscriptions,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in unsubscribe.filters {
            let Ok(parsed) = filter.parse::<Filter>() else {
                continue;
            };

            self.shared
                .backend
                .unsubscribe(client_id, subscriptions, &parsed)
                .await
                .map_err(ConnectionError::Backend)?;
        }

        self.send(Packet::UnsubAck(UnsubAck {
            pkid: unsubscribe.pkid,
        }))
        .await?;

        Ok(())
    }

    async fn publish_to_backend(&mut self, message: Message) -> Result<(), ConnectionError> {
        self.shared
            .backend
            .publish(message.clone())
            .await
            .map_err(ConnectionError::Backend)?;

        self.log(LogEvent::MessagePublished, None, Some(&message), None);

        Ok(())
    }

    /// Write out everything the mailbox has ready: QoS 0 mail immediately,
    /// then the unread prefix of the ordered queue.
    async fn drain_mail(&mut self, mailbox: &mut OpenMailbox<'_>) -> Result<(), ConnectionError> {
        while let Some(mail) = mailbox.pop_unordered() {
            let message = mail.message;

            self.send(Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: mail.retain,
                topic: message.topic.clone(),
                pkid: 0,
                payload: message.payload.clone(),
            }))
            .await?;

            self.log(LogEvent::MessageForwarded, None, Some(&message), None);
        }

        loop {
            let Some(mail) = mailbox.next_ordered_unread() else {
                break;
            };

            let packet = Packet::Publish(Publish {
                dup: mail.dup,
                qos: mail.qos,
                retain: mail.retain,
                topic: mail.message.topic.clone(),
                pkid: mail.packet_id.get(),
                payload: mail.message.payload.clone(),
            });
            let message = mail.message.clone();

            self.send(packet).await?;
            mailbox.mark_ordered_read();

            self.log(LogEvent::MessageForwarded, None, Some(&message), None);
        }

        Ok(())
    }

    /// Decode the next packet, reading from the transport as needed.
    ///
    /// Returns `None` when the peer closed the stream.
    async fn stream_recv(&mut self) -> Result<Option<Packet>, ConnectionError> {
        loop {
            match packet::read_mut(&mut self.read_buf, self.shared.max_packet_size) {
                Ok(packet) => {
                    tracing::trace!(?packet, "received");
                    self.log(LogEvent::PacketReceived, Some(&packet), None, None);
                    return Ok(Some(packet));
                }
                Err(e) if e.is_incomplete() => {}
                Err(e) => return Err(e.into()),
            }

            let read = self
                .stream
                .read(&mut self.read_buf)
                .await
                .map_err(ConnectionError::Read)?;

            if read == 0 {
                tracing::debug!("connection closed by remote peer");
                return Ok(None);
            }
        }
    }

    /// `stream_recv` for the pre-CONNECT state, where cancellation just
    /// closes the stream.
    async fn recv(&mut self) -> Result<Option<Packet>, ConnectionError> {
        let token = self.token.clone();

        tokio::select! {
            res = self.stream_recv() => res,
            () = token.cancelled() => Ok(None),
        }
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        tracing::trace!(?packet, "sending");

        packet::write(&packet, &mut self.write_buf)?;

        self.stream
            .write_take_all(&mut self.write_buf)
            .await
            .map_err(ConnectionError::Write)?;

        self.log(LogEvent::PacketSent, Some(&packet), None, None);

        Ok(())
    }

    /// Refuse the CONNECT with the given return code and close.
    async fn refuse(
        &mut self,
        code: ConnectReturnCode,
        reason: impl Display,
    ) -> Result<(), ConnectionError> {
        tracing::debug!(?code, "refusing connection: {reason}");

        self.send(Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        }))
        .await?;

        let _ = self.stream.shutdown().await;

        Ok(())
    }

    async fn detach(&self, client_id: ClientId, session: Session, reason: DetachReason) {
        if let Err(e) = self
            .shared
            .backend
            .detach(client_id, session, reason)
            .await
        {
            tracing::error!(?e, "failed to detach session");
            self.log(LogEvent::SessionError, None, None, Some(as_std_error(&e)));
        }
    }

    fn log(
        &self,
        event: LogEvent,
        packet: Option<&Packet>,
        message: Option<&Message>,
        error: Option<&(dyn std::error::Error + 'static)>,
    ) {
        (self.shared.logger)(event, self.client_id, packet, message, error);
    }
}

/// View an `eyre` report as a plain error for the log callback.
fn as_std_error(e: &crate::Error) -> &(dyn std::error::Error + 'static) {
    &**e
}

fn nonzero_packet_id(pkid: u16) -> Result<PacketId, ConnectionError> {
    PacketId::new(pkid).ok_or_else(|| ConnectionError::Violation("packet ID cannot be zero".into()))
}

fn next_deadline(keep_alive: KeepAlive) -> Option<Instant> {
    keep_alive.as_timeout().map(|timeout| Instant::now() + timeout)
}

async fn keep_alive_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        // A keep alive of zero disables the timeout entirely.
        None => std::future::pending().await,
    }
}
