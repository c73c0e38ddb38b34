use std::sync::Arc;

use crate::keep_alive::KeepAlive;
use crate::message::Message;
use crate::packet::Login;

/// Options for [`Client::connect`](super::Client::connect).
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// The client ID to present; empty asks the broker to assign one (which
    /// also requires `clean_session`).
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: KeepAlive,
    pub login: Option<Login>,
    pub will: Option<Message>,
    /// TLS material for `tls://` URLs.
    pub tls: Option<TlsClientConfig>,
}

#[derive(Clone)]
pub struct TlsClientConfig {
    pub config: Arc<tokio_rustls::rustls::ClientConfig>,
    /// The name to verify the server certificate against.
    pub server_name: String,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        ConnectOptions {
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: KeepAlive::from_seconds(30),
            ..Default::default()
        }
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = KeepAlive::from_seconds(seconds);
        self
    }

    pub fn login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = Some(Login {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn will(mut self, will: Message) -> Self {
        self.will = Some(will);
        self
    }

    pub fn tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}
