use std::mem;
use std::net::SocketAddr;

use bytes::BytesMut;
use color_eyre::eyre;
use color_eyre::eyre::WrapErr;
use futures::{SinkExt, TryStreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{set_nodelay, AsyncStream, TlsConfig, Transport};

pub struct WebsocketAcceptor {
    listener: TcpListener,
    /// Present for `wss://`; the TLS handshake runs before the upgrade.
    tls: Option<tokio_rustls::TlsAcceptor>,
    // To not block the acceptor loop, we spawn tasks to complete Websocket upgrades.
    handshaking: JoinSet<eyre::Result<WebsocketTransport>>,
}

pub struct WebsocketTransport {
    remote_addr: SocketAddr,
    stream: WebSocketStream<Box<dyn AsyncStream>>,
}

impl WebsocketAcceptor {
    pub async fn bind(addr: SocketAddr, tls: Option<TlsConfig>) -> eyre::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("failed to bind websockets_addr: {addr}"))?;

        Ok(Self {
            listener,
            tls: tls.map(TlsConfig::into_acceptor).transpose()?,
            handshaking: JoinSet::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn accept(&mut self) -> eyre::Result<WebsocketTransport> {
        loop {
            tokio::select! {
                res = self.listener.accept() => {
                    let (stream, addr) = res.wrap_err("error from TcpListener.accept()")?;

                    self.accepted(addr, stream);
                }
                Some(res) = self.handshaking.join_next() => {
                    match res {
                        Ok(Ok(socket)) => return Ok(socket),
                        // Error is logged by `handshake()`
                        Ok(Err(_)) => (),
                        Err(e) => {
                            tracing::debug!("error from handshake: {e}");
                        }
                    }
                }
            }
        }
    }

    fn accepted(&mut self, remote_addr: SocketAddr, stream: TcpStream) {
        tracing::debug!(%remote_addr, "accepted new connection");

        self.handshaking
            .spawn(handshake(remote_addr, stream, self.tls.clone()));
    }
}

impl Transport for WebsocketTransport {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn read(&mut self, buf: &mut BytesMut) -> eyre::Result<usize> {
        let message = self.stream.try_next().await?;

        let Some(message) = message else { return Ok(0) };

        match message {
            Message::Binary(bytes) => {
                buf.extend_from_slice(&bytes);
                Ok(bytes.len())
            }
            // MQTT Control Packets MUST be sent in WebSocket binary data frames.
            // If any other type of data frame is received the recipient MUST
            // close the Network Connection [MQTT-6.0.0-1].
            _ => Err(eyre::eyre!("unexpected Websocket message: {message:?}")),
        }
    }

    async fn write_take_all(&mut self, buf: &mut Vec<u8>) -> eyre::Result<()> {
        // `tokio-tungstenite` _only_ works with `Vec<u8>`.
        // To avoid copying, we just take the whole buffer and send it.
        self.stream.send(Message::Binary(mem::take(buf))).await?;

        Ok(())
    }

    async fn shutdown(&mut self) -> eyre::Result<()> {
        self.stream.close(None).await?;

        Ok(())
    }
}

#[tracing::instrument(skip(stream, tls), err(level = tracing::Level::DEBUG))]
async fn handshake(
    remote_addr: SocketAddr,
    stream: TcpStream,
    tls: Option<tokio_rustls::TlsAcceptor>,
) -> eyre::Result<WebsocketTransport> {
    set_nodelay(&stream);

    let stream: Box<dyn AsyncStream> = match tls {
        Some(acceptor) => Box::new(
            acceptor
                .accept(stream)
                .await
                .wrap_err("error from TlsAcceptor.accept()")?,
        ),
        None => Box::new(stream),
    };

    let stream = tokio_tungstenite::accept_async(stream)
        .await
        .wrap_err("error from accept_async")?;

    Ok(WebsocketTransport {
        remote_addr,
        stream,
    })
}

/// Client-side WebSocket connect.
pub(super) async fn dial(url: &str, addr: &str) -> eyre::Result<WebsocketTransport> {
    let stream = TcpStream::connect(addr)
        .await
        .wrap_err_with(|| format!("failed to connect to {addr}"))?;

    set_nodelay(&stream);
    let remote_addr = stream.peer_addr()?;

    let stream: Box<dyn AsyncStream> = Box::new(stream);
    let (stream, _response) = tokio_tungstenite::client_async(url, stream)
        .await
        .wrap_err("error from client_async")?;

    Ok(WebsocketTransport {
        remote_addr,
        stream,
    })
}
