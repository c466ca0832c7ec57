//! Listener configuration.
//!
//! Raw `mqtt.tcp.*` settings are validated here, before anything is handed
//! to the server, so that incomplete TLS material or a malformed port never
//! surfaces as a bind failure.

pub mod tls;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::auth::AuthManager;
use crate::config::TcpSection;

/// Standard plaintext MQTT-over-TCP port.
pub const DEFAULT_TCP_PORT: u16 = 1883;

pub const DEFAULT_HOST: &str = "0.0.0.0";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid tcp port `{value}`: {reason}")]
    InvalidPort { value: String, reason: String },

    #[error("tcp ssl enabled, but ssl cert file is not set")]
    MissingCertFile,

    #[error("tcp ssl enabled, but ssl cert key file is not set")]
    MissingKeyFile,

    #[error("tls setup failed: {0}")]
    Tls(String),
}

impl TransportError {
    /// True for partial TLS material in the configuration.
    pub fn is_invalid_tls(&self) -> bool {
        matches!(
            self,
            TransportError::MissingCertFile | TransportError::MissingKeyFile
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// A validated network entry point.
#[derive(Clone)]
pub struct ListenerConfig {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsMaterial>,
    pub auth: Arc<AuthManager>,
}

impl ListenerConfig {
    pub fn scheme(&self) -> &'static str {
        match (self.kind, self.tls.is_some()) {
            (TransportKind::Tcp, false) => "tcp",
            (TransportKind::Tcp, true) => "ssl",
        }
    }

    /// Identifier reported through the server's status callback.
    pub fn id(&self) -> String {
        format!("{}:{}", self.scheme(), self.port)
    }

    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

// Only an unset port falls back to the default; anything else must parse as is.
fn parse_port(raw: &str) -> Result<u16, TransportError> {
    if raw.is_empty() {
        return Ok(DEFAULT_TCP_PORT);
    }
    raw.parse::<u16>().map_err(|e| TransportError::InvalidPort {
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Build the TCP listener described by `section`.
pub fn configure_tcp(
    section: &TcpSection,
    auth: Arc<AuthManager>,
) -> Result<ListenerConfig, TransportError> {
    let port = parse_port(&section.port)?;

    let tls = if section.ssl_enable {
        if section.ssl_cert_file.is_empty() {
            return Err(TransportError::MissingCertFile);
        }
        if section.ssl_cert_key_file.is_empty() {
            return Err(TransportError::MissingKeyFile);
        }
        Some(TlsMaterial {
            cert_file: PathBuf::from(&section.ssl_cert_file),
            key_file: PathBuf::from(&section.ssl_cert_key_file),
        })
    } else {
        None
    };

    let host = if section.host.is_empty() {
        DEFAULT_HOST.to_string()
    } else {
        section.host.clone()
    };

    Ok(ListenerConfig {
        kind: TransportKind::Tcp,
        host,
        port,
        tls,
        auth,
    })
}
