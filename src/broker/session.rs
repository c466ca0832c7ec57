use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthManager;

/// Byte stream of an accepted connection, TLS already terminated.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Deployment policy flags forwarded to the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Accept a second connection with an already connected client id.
    pub allow_duplicates: bool,
    /// Queue QoS 0 messages for offline persistent sessions.
    pub offline_qos0: bool,
    /// Deliver once per matching subscription instead of once per client.
    pub allow_overlapping_subscriptions: bool,
}

/// One accepted connection handed to the protocol engine.
pub struct Session {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub listener_id: String,
    pub auth: Arc<AuthManager>,
    pub policy: SessionPolicy,
    pub stream: Box<dyn SessionStream>,
    /// Flips to `true` when the server starts closing.
    pub shutdown: watch::Receiver<bool>,
}

/// The protocol engine seam: everything past the accepted socket.
///
/// Implementations authenticate through `session.auth` and must deny the
/// connection on anything but [`AuthStatus::Allow`](crate::auth::AuthStatus).
pub trait SessionHandler: Send + Sync + 'static {
    fn handle(&self, session: Session) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Handler used when no protocol engine is attached: logs and hangs up.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectSessions;

impl SessionHandler for RejectSessions {
    fn handle(&self, mut session: Session) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            info!(
                session = %session.id,
                peer = %session.peer,
                listener = %session.listener_id,
                "no protocol engine attached, closing session"
            );
            session.stream.shutdown().await?;
            Ok(())
        })
    }
}
