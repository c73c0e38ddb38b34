//! The peer-side client library.
//!
//! [`Client`] speaks the same codec and QoS flows as the broker, from the
//! other end: a background task owns the transport and the packet-id tables,
//! while the handle sends it commands and awaits the matching
//! acknowledgements.

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_rustls::rustls::ServerName;
use tokio_rustls::TlsConnector;

use crate::collections::FnvHashMap;
use crate::keep_alive::KeepAlive;
use crate::message::Message;
use crate::packet::{
    self, ConnAck, Connect, ConnectReturnCode, LastWill, Packet, PacketType, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, SubscribeFilter, SubscribeReasonCode,
    UnsubAck, Unsubscribe,
};
use crate::session::{IncomingPublishes, PacketId};
use crate::transport::{self, AnyTransport, DirectSocket, Transport};

mod helpers;
mod options;

pub use helpers::{clear_retained, clear_session, publish_message, receive_message};
pub use options::{ConnectOptions, TlsClientConfig};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection refused: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("protocol error: {0}")]
    Protocol(
        #[from]
        #[source]
        packet::Error,
    ),
    #[error("unexpected {0:?} from broker")]
    Unexpected(PacketType),
    #[error("transport error: {0}")]
    Transport(crate::Error),
    #[error("connection closed")]
    Closed,
}

/// Handle to a connected client. Cheap to clone; dropping every handle shuts
/// the connection down.
#[derive(Clone)]
pub struct Client {
    command_tx: mpsc::Sender<Command>,
}

/// Stream of messages delivered for the client's subscriptions.
pub struct Messages {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Messages {
    /// The next inbound message, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

enum Command {
    Publish {
        message: Message,
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    Subscribe {
        filters: Vec<SubscribeFilter>,
        done: oneshot::Sender<Result<Vec<SubscribeReasonCode>, ClientError>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

impl Client {
    /// Connect over an established transport: send CONNECT, await CONNACK,
    /// then spawn the background task.
    pub async fn connect<T: Transport>(
        stream: T,
        options: ConnectOptions,
    ) -> Result<(Client, Messages), ClientError> {
        let mut task = ClientTask {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: Vec::with_capacity(8192),
            next_packet_id: PacketId::START,
            pending: FnvHashMap::default(),
            incoming: IncomingPublishes::default(),
            keep_alive: options.keep_alive,
        };

        task.send(Packet::Connect(Connect {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            clean_session: options.clean_session,
            keep_alive: options.keep_alive.as_seconds(),
            client_id: options.client_id.clone(),
            last_will: options.will.map(|will| LastWill {
                topic: will.topic,
                message: will.payload,
                qos: will.qos,
                retain: will.retain,
            }),
            login: options.login,
        }))
        .await?;

        match task.recv().await? {
            Some(Packet::ConnAck(ConnAck {
                code: ConnectReturnCode::Success,
                ..
            })) => {}
            Some(Packet::ConnAck(ConnAck { code, .. })) => {
                return Err(ClientError::Refused(code));
            }
            Some(other) => return Err(ClientError::Unexpected(other.packet_type())),
            None => return Err(ClientError::Closed),
        }

        let (command_tx, command_rx) = mpsc::channel(16);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        tokio::spawn(task.run(command_rx, messages_tx));

        Ok((Client { command_tx }, Messages { rx: messages_rx }))
    }

    /// Connect to a `tcp://`, `tls://` or `ws://` URL.
    pub async fn connect_url(
        url: &str,
        options: ConnectOptions,
    ) -> Result<(Client, Messages), ClientError> {
        let (scheme, addr) = transport::split_url(url).map_err(ClientError::Transport)?;

        if scheme == "tls" {
            let tls = options
                .tls
                .clone()
                .ok_or_else(|| ClientError::Transport(crate::Error::msg("tls:// requires a TLS configuration")))?;

            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| ClientError::Transport(e.into()))?;

            let remote_addr = stream
                .peer_addr()
                .map_err(|e| ClientError::Transport(e.into()))?;

            let server_name = ServerName::try_from(tls.server_name.as_str())
                .map_err(|e| ClientError::Transport(crate::Error::msg(e.to_string())))?;

            let stream = TlsConnector::from(tls.config)
                .connect(server_name, stream)
                .await
                .map_err(|e| ClientError::Transport(e.into()))?;

            let transport = AnyTransport::Tls(DirectSocket::new(remote_addr, stream.into()));

            return Self::connect(transport, options).await;
        }

        let transport = transport::dial(url).await.map_err(ClientError::Transport)?;

        Self::connect(transport, options).await
    }

    /// Publish a message, resolving when the QoS handshake completes (QoS 0
    /// resolves as soon as the packet is written).
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        let mut message = Message::new(topic, payload, qos);
        message.retain = retain;

        self.publish_message(message).await
    }

    pub async fn publish_message(&self, message: Message) -> Result<(), ClientError> {
        let (done, rx) = oneshot::channel();

        self.command(Command::Publish { message, done }).await?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Subscribe to a single filter, returning the granted return code.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
    ) -> Result<SubscribeReasonCode, ClientError> {
        let codes = self
            .subscribe_many(vec![SubscribeFilter {
                path: filter.into(),
                qos,
            }])
            .await?;

        codes.into_iter().next().ok_or(ClientError::Closed)
    }

    pub async fn subscribe_many(
        &self,
        filters: Vec<SubscribeFilter>,
    ) -> Result<Vec<SubscribeReasonCode>, ClientError> {
        let (done, rx) = oneshot::channel();

        self.command(Command::Subscribe { filters, done }).await?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    pub async fn unsubscribe(&self, filter: impl Into<String>) -> Result<(), ClientError> {
        let (done, rx) = oneshot::channel();

        self.command(Command::Unsubscribe {
            filters: vec![filter.into()],
            done,
        })
        .await?;

        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Cleanly disconnect: DISCONNECT is sent (suppressing any will) and the
    /// connection closes.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        let (done, rx) = oneshot::channel();

        self.command(Command::Disconnect { done }).await?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    async fn command(&self, command: Command) -> Result<(), ClientError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }
}

/// What the task is waiting on for an outstanding packet ID.
enum Pending {
    /// QoS 1 publish awaiting PUBACK.
    PubAck(oneshot::Sender<Result<(), ClientError>>),
    /// QoS 2 publish awaiting PUBREC.
    PubRec(oneshot::Sender<Result<(), ClientError>>),
    /// QoS 2 publish awaiting PUBCOMP (PUBREL has been sent).
    PubComp(oneshot::Sender<Result<(), ClientError>>),
    SubAck(oneshot::Sender<Result<Vec<SubscribeReasonCode>, ClientError>>),
    UnsubAck(oneshot::Sender<Result<(), ClientError>>),
}

struct ClientTask<T> {
    stream: T,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    next_packet_id: PacketId,
    pending: FnvHashMap<PacketId, Pending>,
    /// Inbound QoS 2 publishes awaiting their PUBREL, exactly as on the
    /// broker side.
    incoming: IncomingPublishes,
    keep_alive: KeepAlive,
}

impl<T: Transport> ClientTask<T> {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        messages_tx: mpsc::UnboundedSender<Message>,
    ) {
        let mut ping = self.keep_alive.as_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            interval.reset();
            interval
        });

        let result = self.run_inner(&mut command_rx, &messages_tx, &mut ping).await;

        if let Err(e) = &result {
            tracing::debug!("client connection ended: {e}");
        }

        // Anyone still waiting gets a `Closed` error via the dropped oneshot.
        self.pending.clear();
        let _ = self.stream.shutdown().await;
    }

    async fn run_inner(
        &mut self,
        command_rx: &mut mpsc::Receiver<Command>,
        messages_tx: &mpsc::UnboundedSender<Message>,
        ping: &mut Option<Interval>,
    ) -> Result<(), ClientError> {
        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        // Every handle is gone; nothing can wait on the
                        // outcome anymore, so just drop the connection.
                        return Ok(());
                    };

                    if self.handle_command(command).await? {
                        return Ok(());
                    }
                }
                res = recv_packet(&mut self.stream, &mut self.read_buf) => {
                    let Some(packet) = res? else {
                        return Err(ClientError::Closed);
                    };

                    self.handle_packet(packet, messages_tx).await?;
                }
                () = ping_tick(ping) => {
                    self.send(Packet::PingReq).await?;
                }
            }
        }
    }

    /// Returns `true` when the client asked to disconnect.
    async fn handle_command(&mut self, command: Command) -> Result<bool, ClientError> {
        match command {
            Command::Publish { message, done } => {
                let qos = message.qos;
                let pkid = match qos {
                    QoS::AtMostOnce => 0,
                    _ => self.allocate_packet_id().get(),
                };

                let result = self
                    .send(Packet::Publish(Publish {
                        dup: false,
                        qos,
                        retain: message.retain,
                        topic: message.topic,
                        pkid,
                        payload: message.payload,
                    }))
                    .await;

                match (result, qos) {
                    (Err(e), _) => {
                        let _ = done.send(Err(ClientError::Closed));
                        return Err(e);
                    }
                    (Ok(()), QoS::AtMostOnce) => {
                        let _ = done.send(Ok(()));
                    }
                    (Ok(()), QoS::AtLeastOnce) => {
                        self.pending.insert(
                            PacketId::new(pkid).expect("BUG: allocated packet ID cannot be zero"),
                            Pending::PubAck(done),
                        );
                    }
                    (Ok(()), QoS::ExactlyOnce) => {
                        self.pending.insert(
                            PacketId::new(pkid).expect("BUG: allocated packet ID cannot be zero"),
                            Pending::PubRec(done),
                        );
                    }
                }
            }
            Command::Subscribe { filters, done } => {
                let packet_id = self.allocate_packet_id();

                let result = self
                    .send(Packet::Subscribe(Subscribe {
                        pkid: packet_id.get(),
                        filters,
                    }))
                    .await;

                if let Err(e) = result {
                    let _ = done.send(Err(ClientError::Closed));
                    return Err(e);
                }

                self.pending.insert(packet_id, Pending::SubAck(done));
            }
            Command::Unsubscribe { filters, done } => {
                let packet_id = self.allocate_packet_id();

                let result = self
                    .send(Packet::Unsubscribe(Unsubscribe {
                        pkid: packet_id.get(),
                        filters,
                    }))
                    .await;

                if let Err(e) = result {
                    let _ = done.send(Err(ClientError::Closed));
                    return Err(e);
                }

                self.pending.insert(packet_id, Pending::UnsubAck(done));
            }
            Command::Disconnect { done } => {
                let result = self.send(Packet::Disconnect).await;
                let _ = done.send(());
                result?;

                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn handle_packet(
        &mut self,
        packet: Packet,
        messages_tx: &mpsc::UnboundedSender<Message>,
    ) -> Result<(), ClientError> {
        match packet {
            Packet::Publish(publish) => {
                let qos = publish.qos;
                let pkid = publish.pkid;

                match qos {
                    QoS::AtMostOnce => {
                        let _ = messages_tx.send(Message::from(publish));
                    }
                    QoS::AtLeastOnce => {
                        let _ = messages_tx.send(Message::from(publish));
                        self.send(Packet::PubAck(PubAck { pkid })).await?;
                    }
                    QoS::ExactlyOnce => {
                        let packet_id =
                            PacketId::new(pkid).ok_or(packet::Error::PacketIdZero)?;

                        if !self.incoming.contains(packet_id) {
                            self.incoming
                                .store(packet_id, Message::from(publish))
                                .expect("BUG: checked `contains()` above");
                        }

                        self.send(Packet::PubRec(PubRec { pkid })).await?;
                    }
                }
            }
            Packet::PubRel(PubRel { pkid }) => {
                if let Some(packet_id) = PacketId::new(pkid) {
                    if let Some(message) = self.incoming.release(packet_id) {
                        let _ = messages_tx.send(message);
                    }
                }

                self.send(Packet::PubComp(PubComp { pkid })).await?;
            }
            Packet::PubAck(PubAck { pkid }) => {
                if let Some(Pending::PubAck(done)) = self.take_pending(pkid) {
                    let _ = done.send(Ok(()));
                }
            }
            Packet::PubRec(PubRec { pkid }) => {
                if let Some(Pending::PubRec(done)) = self.take_pending(pkid) {
                    self.send(Packet::PubRel(PubRel { pkid })).await?;

                    let packet_id =
                        PacketId::new(pkid).expect("BUG: pending packet IDs cannot be zero");
                    self.pending.insert(packet_id, Pending::PubComp(done));
                }
            }
            Packet::PubComp(PubComp { pkid }) => {
                if let Some(Pending::PubComp(done)) = self.take_pending(pkid) {
                    let _ = done.send(Ok(()));
                }
            }
            Packet::SubAck(SubAck { pkid, return_codes }) => {
                if let Some(Pending::SubAck(done)) = self.take_pending(pkid) {
                    let _ = done.send(Ok(return_codes));
                }
            }
            Packet::UnsubAck(UnsubAck { pkid }) => {
                if let Some(Pending::UnsubAck(done)) = self.take_pending(pkid) {
                    let _ = done.send(Ok(()));
                }
            }
            Packet::PingResp => {}
            other => return Err(ClientError::Unexpected(other.packet_type())),
        }

        Ok(())
    }

    fn take_pending(&mut self, pkid: u16) -> Option<Pending> {
        let packet_id = PacketId::new(pkid)?;
        self.pending.remove(&packet_id)
    }

    fn allocate_packet_id(&mut self) -> PacketId {
        loop {
            let id = self.next_packet_id.wrapping_increment();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    async fn recv(&mut self) -> Result<Option<Packet>, ClientError> {
        recv_packet(&mut self.stream, &mut self.read_buf).await
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ClientError> {
        tracing::trace!(?packet, "sending");

        packet::write(&packet, &mut self.write_buf)?;

        self.stream
            .write_take_all(&mut self.write_buf)
            .await
            .map_err(ClientError::Transport)
    }
}

async fn recv_packet<T: Transport>(
    stream: &mut T,
    read_buf: &mut BytesMut,
) -> Result<Option<Packet>, ClientError> {
    loop {
        match packet::read_mut(read_buf, packet::MAX_REMAINING_LENGTH) {
            Ok(packet) => {
                tracing::trace!(?packet, "received");
                return Ok(Some(packet));
            }
            Err(e) if e.is_incomplete() => {}
            Err(e) => return Err(e.into()),
        }

        let read = stream
            .read(read_buf)
            .await
            .map_err(ClientError::Transport)?;

        if read == 0 {
            return Ok(None);
        }
    }
}

async fn ping_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
