use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::{fs, io};

use color_eyre::eyre::{eyre, WrapErr};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_rustls::rustls::{Certificate, PrivateKey};

use crate::broker::EngineOptions;
use crate::transport::TlsConfig;

fn read_toml<T: DeserializeOwned>(name: &str, path: &Path) -> crate::Result<T> {
    let config_toml = if path == Path::new("-") {
        io::read_to_string(io::stdin().lock()).wrap_err("error reading from stdin")?
    } else {
        fs::read_to_string(path)
            .wrap_err_with(|| format!("error reading from {}", path.display()))?
    };

    toml::from_str(&config_toml)
        .wrap_err_with(|| format!("error parsing {name} from {}", path.display()))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Listener URLs: `tcp://`, `tls://`, `ws://` or `wss://`.
    #[serde(default = "default_listeners")]
    pub listeners: Vec<String>,

    /// Seconds a fresh connection may take to produce its CONNECT packet.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Cap on the remaining length of any single inbound packet.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    #[serde(default = "default_buffer_size")]
    pub read_buffer: usize,

    #[serde(default = "default_buffer_size")]
    pub write_buffer: usize,

    /// Certificate material, required by `tls://` and `wss://` listeners.
    pub tls: Option<TlsFiles>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

fn default_listeners() -> Vec<String> {
    vec!["tcp://0.0.0.0:1883".into()]
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_packet_size() -> usize {
    crate::packet::MAX_REMAINING_LENGTH
}

fn default_buffer_size() -> usize {
    8192
}

impl BrokerConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        read_toml("broker config", path)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            connect_timeout: std::time::Duration::from_secs(self.connect_timeout_secs),
            max_packet_size: self.max_packet_size,
            read_buffer: self.read_buffer,
            write_buffer: self.write_buffer,
            ..EngineOptions::default()
        }
    }

    /// Load the certificate chain and key from disk, if configured.
    pub fn tls_config(&self) -> crate::Result<Option<TlsConfig>> {
        let Some(files) = &self.tls else {
            return Ok(None);
        };

        let cert_chain = {
            let mut reader = BufReader::new(
                File::open(&files.cert_file)
                    .wrap_err_with(|| format!("error opening {}", files.cert_file.display()))?,
            );

            rustls_pemfile::certs(&mut reader)
                .wrap_err("error parsing certificate chain")?
                .into_iter()
                .map(Certificate)
                .collect::<Vec<_>>()
        };

        if cert_chain.is_empty() {
            return Err(eyre!("no certificates in {}", files.cert_file.display()));
        }

        let key = {
            let mut reader = BufReader::new(
                File::open(&files.key_file)
                    .wrap_err_with(|| format!("error opening {}", files.key_file.display()))?,
            );

            let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
                .wrap_err("error parsing private key")?;

            keys.pop()
                .map(PrivateKey)
                .ok_or_else(|| eyre!("no PKCS#8 private key in {}", files.key_file.display()))?
        };

        Ok(Some(TlsConfig { cert_chain, key }))
    }
}
