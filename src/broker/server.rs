//! Broker server lifecycle: listeners, live sessions, persistence ownership.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::session::{Session, SessionHandler, SessionPolicy, SessionStream};
use crate::auth::AuthManager;
use crate::persistence::{Persistence, PersistenceError};
use crate::transport::{tls, ListenerConfig, TransportError};

/// Observer for listener state changes: `(listener id, status)`.
pub type TransportStatus = Arc<dyn Fn(&str, &str) + Send + Sync>;

pub const STATUS_STARTED: &str = "started";
pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_FAILED: &str = "failed";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid server configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TransportError),

    #[error("server is closed")]
    Closed,

    #[error("server already closed")]
    AlreadyClosed,

    #[error("failed to release persistence: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Everything needed to construct a [`Server`].
pub struct ServerConfig {
    pub allow_duplicates: bool,
    pub offline_qos0: bool,
    pub allow_overlapping_subscriptions: bool,
    /// Auth provider names listeners are expected to authenticate against.
    pub authenticators: Vec<String>,
    pub transport_status: Option<TransportStatus>,
    pub persistence: Option<Persistence>,
    pub handler: Arc<dyn SessionHandler>,
}

impl ServerConfig {
    pub fn new(handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            allow_duplicates: true,
            offline_qos0: false,
            allow_overlapping_subscriptions: false,
            authenticators: Vec::new(),
            transport_status: None,
            persistence: None,
            handler,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("allow_duplicates", &self.allow_duplicates)
            .field("offline_qos0", &self.offline_qos0)
            .field(
                "allow_overlapping_subscriptions",
                &self.allow_overlapping_subscriptions,
            )
            .field("authenticators", &self.authenticators)
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

struct ListenerHandle {
    id: String,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

struct SessionEntry {
    peer: SocketAddr,
    abort: AbortHandle,
}

type SessionTable = Arc<DashMap<Uuid, SessionEntry>>;

/// A running broker instance.
pub struct Server {
    policy: SessionPolicy,
    authenticators: Vec<String>,
    status: Option<TransportStatus>,
    handler: Arc<dyn SessionHandler>,
    persistence: Mutex<Option<Persistence>>,
    listeners: Mutex<Vec<ListenerHandle>>,
    sessions: SessionTable,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let persistence = config
            .persistence
            .ok_or_else(|| ServerError::Config("persistence backend not set".to_string()))?;
        if config.authenticators.is_empty() {
            return Err(ServerError::Config(
                "no authenticators configured".to_string(),
            ));
        }

        let (shutdown_tx, _) = watch::channel(false);

        info!(
            backend = ?persistence.backend_kind(),
            authenticators = ?config.authenticators,
            allow_duplicates = config.allow_duplicates,
            offline_qos0 = config.offline_qos0,
            "broker server created"
        );

        Ok(Self {
            policy: SessionPolicy {
                allow_duplicates: config.allow_duplicates,
                offline_qos0: config.offline_qos0,
                allow_overlapping_subscriptions: config.allow_overlapping_subscriptions,
            },
            authenticators: config.authenticators,
            status: config.transport_status,
            handler: config.handler,
            persistence: Mutex::new(Some(persistence)),
            listeners: Mutex::new(Vec::new()),
            sessions: Arc::new(DashMap::new()),
            shutdown_tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn authenticators(&self) -> &[String] {
        &self.authenticators
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .lock()
            .await
            .iter()
            .map(|l| l.local_addr)
            .collect()
    }

    fn report(&self, id: &str, status: &str) {
        if let Some(cb) = &self.status {
            cb(id, status);
        }
    }

    /// Bind `config` and start accepting connections on a background task.
    ///
    /// Returns once the socket is bound, with the bound address.
    pub async fn listen_and_serve(
        &self,
        config: ListenerConfig,
    ) -> Result<SocketAddr, ServerError> {
        if self.is_closed() {
            return Err(ServerError::Closed);
        }

        let addr = config.bind_addr();
        let acceptor = match config.tls.as_ref().map(tls::load_acceptor).transpose() {
            Ok(acceptor) => acceptor,
            Err(e) => {
                self.report(&config.id(), STATUS_FAILED);
                return Err(e.into());
            }
        };

        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.report(&config.id(), STATUS_FAILED);
                return Err(ServerError::Bind { addr, source });
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        let id = format!("{}:{}", config.scheme(), local_addr.port());
        let ctx = Arc::new(ListenerContext {
            id: id.clone(),
            acceptor,
            auth: Arc::clone(&config.auth),
            policy: self.policy,
            handler: Arc::clone(&self.handler),
            sessions: Arc::clone(&self.sessions),
            shutdown: self.shutdown_tx.subscribe(),
        });

        let task = tokio::spawn(accept_loop(listener, ctx));

        self.listeners.lock().await.push(ListenerHandle {
            id: id.clone(),
            local_addr,
            task,
        });

        info!(listener = %id, addr = %local_addr, "listener started");
        self.report(&id, STATUS_STARTED);
        Ok(local_addr)
    }

    /// Stop every listener, drop live sessions and release persistence.
    ///
    /// Only the first call does any work; later calls return
    /// [`ServerError::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), ServerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyClosed);
        }
        self.shutdown_tx.send_replace(true);

        let listeners: Vec<ListenerHandle> = self.listeners.lock().await.drain(..).collect();
        for listener in listeners {
            if let Err(e) = listener.task.await {
                warn!(listener = %listener.id, error = %e, "accept loop ended abnormally");
            }
            info!(listener = %listener.id, "listener stopped");
            self.report(&listener.id, STATUS_STOPPED);
        }

        let aborted = abort_sessions(&self.sessions);
        if aborted > 0 {
            info!(sessions = aborted, "dropped live sessions");
        }

        match self.persistence.lock().await.take() {
            Some(persistence) => persistence.release()?,
            None => debug!("persistence already released"),
        }

        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.shutdown_tx.send_replace(true);
            abort_sessions(&self.sessions);
        }
    }
}

fn abort_sessions(sessions: &SessionTable) -> usize {
    let mut aborted = 0;
    sessions.retain(|id, entry| {
        debug!(session = %id, peer = %entry.peer, "aborting session");
        entry.abort.abort();
        aborted += 1;
        false
    });
    aborted
}

struct ListenerContext {
    id: String,
    acceptor: Option<TlsAcceptor>,
    auth: Arc<AuthManager>,
    policy: SessionPolicy,
    handler: Arc<dyn SessionHandler>,
    sessions: SessionTable,
    shutdown: watch::Receiver<bool>,
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ListenerContext>) {
    let mut shutdown = ctx.shutdown.clone();
    if *shutdown.borrow() {
        return;
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => spawn_session(&ctx, socket, peer),
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    error!(listener = %ctx.id, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    debug!(listener = %ctx.id, "accept loop finished");
}

fn spawn_session(ctx: &Arc<ListenerContext>, socket: TcpStream, peer: SocketAddr) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "set_nodelay failed");
    }

    let id = Uuid::new_v4();
    let task_ctx = Arc::clone(ctx);
    // Held until the entry is in the table, so the task's own removal
    // always comes after the insert.
    let (registered_tx, registered_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        if registered_rx.await.is_err() {
            return;
        }
        let stream: Box<dyn SessionStream> = match &task_ctx.acceptor {
            Some(acceptor) => match acceptor.accept(socket).await {
                Ok(tls) => Box::new(tls),
                Err(e) => {
                    warn!(listener = %task_ctx.id, peer = %peer, error = %e, "tls handshake failed");
                    task_ctx.sessions.remove(&id);
                    return;
                }
            },
            None => Box::new(socket),
        };

        let session = Session {
            id,
            peer,
            listener_id: task_ctx.id.clone(),
            auth: Arc::clone(&task_ctx.auth),
            policy: task_ctx.policy,
            stream,
            shutdown: task_ctx.shutdown.clone(),
        };

        if let Err(e) = task_ctx.handler.handle(session).await {
            warn!(session = %id, peer = %peer, error = %e, "session ended with error");
        }
        task_ctx.sessions.remove(&id);
    });

    ctx.sessions.insert(
        id,
        SessionEntry {
            peer,
            abort: handle.abort_handle(),
        },
    );
    let _ = registered_tx.send(());
    debug!(listener = %ctx.id, session = %id, peer = %peer, "session accepted");
}
