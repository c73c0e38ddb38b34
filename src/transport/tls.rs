use std::net::SocketAddr;
use std::sync::Arc;

use color_eyre::eyre;
use color_eyre::eyre::WrapErr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::rustls::{Certificate, PrivateKey};

use super::{set_nodelay, DirectSocket};

/// Certificate material for a `tls://` or `wss://` listener.
pub struct TlsConfig {
    pub cert_chain: Vec<Certificate>,
    pub key: PrivateKey,
}

impl TlsConfig {
    pub(super) fn into_acceptor(self) -> eyre::Result<tokio_rustls::TlsAcceptor> {
        let config = tokio_rustls::rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain, self.key)?;

        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
    }
}

pub struct TlsAcceptor {
    acceptor: tokio_rustls::TlsAcceptor,
    listener: TcpListener,
    // To not block the acceptor loop, we spawn tasks to complete TLS handshakes.
    handshaking: JoinSet<eyre::Result<TlsTransport>>,
}

pub type TlsTransport = DirectSocket<tokio_rustls::TlsStream<TcpStream>>;

impl TlsAcceptor {
    pub async fn bind(listen_addr: SocketAddr, config: TlsConfig) -> eyre::Result<Self> {
        let acceptor = config.into_acceptor()?;

        let listener = TcpListener::bind(listen_addr)
            .await
            .wrap_err_with(|| format!("failed to bind listen_addr: {listen_addr}"))?;

        Ok(Self {
            acceptor,
            listener,
            handshaking: JoinSet::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn accept(&mut self) -> eyre::Result<TlsTransport> {
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

        // Uses `Arc` internally so clones are cheap
        let acceptor = self.acceptor.clone();

        self.handshaking
            .spawn(handshake(remote_addr, stream, acceptor));
    }
}

#[tracing::instrument(skip(stream, acceptor), err(level = tracing::Level::DEBUG))]
async fn handshake(
    remote_addr: SocketAddr,
    stream: TcpStream,
    acceptor: tokio_rustls::TlsAcceptor,
) -> eyre::Result<TlsTransport> {
    set_nodelay(&stream);

    let stream = acceptor
        .accept(stream)
        .await
        .wrap_err("error from TlsAcceptor.accept()")?;

    Ok(DirectSocket::new(remote_addr, stream.into()))
}
