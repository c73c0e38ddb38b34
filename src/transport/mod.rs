//! Byte-stream transports.
//!
//! The protocol engine is transport-agnostic: it reads and writes whole
//! packets through [`Transport`] and never interprets TCP, TLS or WebSocket
//! framing itself. Listeners for each scheme produce the same [`AnyTransport`]
//! so the acceptor loop has a single surface.

use std::future::Future;
use std::net::SocketAddr;

use bytes::BytesMut;
use color_eyre::eyre::{self, bail, WrapErr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

mod tls;
mod websocket;

pub use tls::{TlsAcceptor, TlsConfig};
pub use websocket::{WebsocketAcceptor, WebsocketTransport};

/// Object-safe alias for the byte streams the transports wrap.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<S: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for S {}

pub trait Transport: Send + Sync + Unpin + 'static {
    fn remote_addr(&self) -> SocketAddr;

    /// Read into `buf`.
    ///
    /// The capacity of `buf` should be greater than or equal to the expected packet size.
    ///
    /// Whether the read is allowed to exceed the capacity of `buf` or not is implementation-defined.
    fn read(&mut self, buf: &mut BytesMut) -> impl Future<Output = eyre::Result<usize>> + Send;

    /// Write the contents of `buf` to the transport and clear it.
    ///
    /// `buf` may or may not retain its original capacity.
    fn write_take_all(
        &mut self,
        buf: &mut Vec<u8>,
    ) -> impl Future<Output = eyre::Result<()>> + Send;

    fn shutdown(&mut self) -> impl Future<Output = eyre::Result<()>> + Send;
}

pub struct DirectSocket<S> {
    remote_addr: SocketAddr,
    stream: S,
}

impl<S> DirectSocket<S> {
    pub fn new(remote_addr: SocketAddr, stream: S) -> Self {
        Self {
            remote_addr,
            stream,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static> Transport for DirectSocket<S> {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn read(&mut self, buf: &mut BytesMut) -> eyre::Result<usize> {
        Ok(self.stream.read_buf(buf).await?)
    }

    async fn write_take_all(&mut self, buf: &mut Vec<u8>) -> eyre::Result<()> {
        self.stream.write_all(buf).await?;
        buf.clear();
        Ok(())
    }

    async fn shutdown(&mut self) -> eyre::Result<()> {
        Ok(self.stream.shutdown().await?)
    }
}

/// A connection produced by [`Listener::accept`], whatever the scheme.
pub enum AnyTransport {
    Tcp(DirectSocket<TcpStream>),
    Tls(DirectSocket<tokio_rustls::TlsStream<TcpStream>>),
    Ws(WebsocketTransport),
}

impl Transport for AnyTransport {
    fn remote_addr(&self) -> SocketAddr {
        match self {
            AnyTransport::Tcp(t) => t.remote_addr(),
            AnyTransport::Tls(t) => t.remote_addr(),
            AnyTransport::Ws(t) => t.remote_addr(),
        }
    }

    async fn read(&mut self, buf: &mut BytesMut) -> eyre::Result<usize> {
        match self {
            AnyTransport::Tcp(t) => t.read(buf).await,
            AnyTransport::Tls(t) => t.read(buf).await,
            AnyTransport::Ws(t) => t.read(buf).await,
        }
    }

    async fn write_take_all(&mut self, buf: &mut Vec<u8>) -> eyre::Result<()> {
        match self {
            AnyTransport::Tcp(t) => t.write_take_all(buf).await,
            AnyTransport::Tls(t) => t.write_take_all(buf).await,
            AnyTransport::Ws(t) => t.write_take_all(buf).await,
        }
    }

    async fn shutdown(&mut self) -> eyre::Result<()> {
        match self {
            AnyTransport::Tcp(t) => t.shutdown().await,
            AnyTransport::Tls(t) => t.shutdown().await,
            AnyTransport::Ws(t) => t.shutdown().await,
        }
    }
}

/// A bound server socket for one of the supported schemes.
///
/// Tokio sockets only close on drop, so a listener that has been handed off
/// to an acceptor loop carries its own close signal; see
/// [`Listener::closer`].
pub struct Listener {
    kind: ListenerKind,
    closed: CancellationToken,
}

enum ListenerKind {
    Tcp(TcpListener),
    Tls(TlsAcceptor),
    Ws(WebsocketAcceptor),
}

/// Closes the [`Listener`] it was taken from: the pending and all future
/// `accept` calls fail, letting whoever holds the listener wind down.
#[derive(Clone)]
pub struct ListenerCloser(CancellationToken);

impl ListenerCloser {
    pub fn close(&self) {
        self.0.cancel();
    }
}

impl Listener {
    fn new(kind: ListenerKind) -> Self {
        Self {
            kind,
            closed: CancellationToken::new(),
        }
    }

    /// A handle for closing this listener from elsewhere.
    pub fn closer(&self) -> ListenerCloser {
        ListenerCloser(self.closed.clone())
    }

    pub async fn accept(&mut self) -> eyre::Result<AnyTransport> {
        tokio::select! {
            () = self.closed.cancelled() => bail!("listener closed"),
            res = self.kind.accept() => res,
        }
    }

    pub fn local_addr(&self) -> eyre::Result<SocketAddr> {
        let addr = match &self.kind {
            ListenerKind::Tcp(listener) => listener.local_addr()?,
            ListenerKind::Tls(acceptor) => acceptor.local_addr()?,
            ListenerKind::Ws(acceptor) => acceptor.local_addr()?,
        };

        Ok(addr)
    }
}

impl ListenerKind {
    async fn accept(&mut self) -> eyre::Result<AnyTransport> {
        match self {
            ListenerKind::Tcp(listener) => {
                let (stream, remote_addr) = listener
                    .accept()
                    .await
                    .wrap_err("error from TcpListener.accept()")?;

                set_nodelay(&stream);

                Ok(AnyTransport::Tcp(DirectSocket::new(remote_addr, stream)))
            }
            ListenerKind::Tls(acceptor) => Ok(AnyTransport::Tls(acceptor.accept().await?)),
            ListenerKind::Ws(acceptor) => Ok(AnyTransport::Ws(acceptor.accept().await?)),
        }
    }
}

/// Bind a listener from a `scheme://host:port` URL.
///
/// `tcp://` and `ws://` need no extra configuration; `tls://` and `wss://`
/// require a certificate chain and key.
pub async fn launch(url: &str, tls: Option<TlsConfig>) -> eyre::Result<Listener> {
    let (scheme, addr) = split_url(url)?;

    let kind = match scheme {
        "tcp" => ListenerKind::Tcp(bind_tcp(addr).await?),
        "tls" => {
            ListenerKind::Tls(TlsAcceptor::bind(addr.parse()?, require_tls(tls, scheme)?).await?)
        }
        "ws" => ListenerKind::Ws(WebsocketAcceptor::bind(addr.parse()?, None).await?),
        "wss" => ListenerKind::Ws(
            WebsocketAcceptor::bind(addr.parse()?, Some(require_tls(tls, scheme)?)).await?,
        ),
        other => bail!("unsupported listener scheme: {other}"),
    };

    Ok(Listener::new(kind))
}

/// Connect a client transport to a `scheme://host:port` URL.
///
/// Only the plaintext schemes are handled here; TLS clients build their own
/// `rustls` config and wrap the stream themselves.
pub async fn dial(url: &str) -> eyre::Result<AnyTransport> {
    let (scheme, addr) = split_url(url)?;

    match scheme {
        "tcp" => {
            let stream = TcpStream::connect(addr)
                .await
                .wrap_err_with(|| format!("failed to connect to {addr}"))?;

            set_nodelay(&stream);
            let remote_addr = stream.peer_addr()?;

            Ok(AnyTransport::Tcp(DirectSocket::new(remote_addr, stream)))
        }
        "ws" => Ok(AnyTransport::Ws(websocket::dial(url, addr).await?)),
        other => bail!("unsupported client scheme: {other}"),
    }
}

pub(crate) fn split_url(url: &str) -> eyre::Result<(&str, &str)> {
    let Some((scheme, rest)) = url.split_once("://") else {
        bail!("URL has no scheme: {url}");
    };

    // Strip any path; only the WebSocket handshake cares about it.
    let addr = rest.split('/').next().unwrap_or(rest);

    Ok((scheme, addr))
}

async fn bind_tcp(addr: &str) -> eyre::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind listen_addr: {addr}"))
}

fn require_tls(tls: Option<TlsConfig>, scheme: &str) -> eyre::Result<TlsConfig> {
    tls.ok_or_else(|| eyre::eyre!("{scheme}:// listener requires a TLS configuration"))
}

pub(crate) fn set_nodelay(stream: &TcpStream) {
    // Disable Nagle's algorithm since we always send complete packets.
    // https://en.wikipedia.org/wiki/Nagle's_algorithm
    if let Err(e) = stream.set_nodelay(true) {
        // It's unclear how this could actually fail and what it means when it does.
        tracing::debug!(?e, "error setting TCP_NODELAY on socket");
    }
}
