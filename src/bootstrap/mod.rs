//! Broker startup pipeline.
//!
//! Steps run strictly in order and stop at the first failure:
//!
//! 1. load credentials into the credential store
//! 2. register the `internal` auth provider
//! 3. open persistence
//! 4. construct the server (fixed deployment policy)
//! 5. resolve the auth manager listeners authenticate against
//! 6. validate listener configuration
//! 7. start listening
//!
//! Everything up to and including step 6 is fatal: the caller is expected to
//! exit the process. A listen failure is reported as non-fatal so the caller
//! can unwind normally and let its own cleanup run.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::auth::{AuthError, AuthManager, CredentialStore, ProviderRegistry, INTERNAL_PROVIDER};
use crate::broker::{Server, ServerConfig, ServerError, SessionHandler, TransportStatus};
use crate::config::Config;
use crate::persistence::{self, PersistenceError};
use crate::shutdown::{self, ShutdownCoordinator, ShutdownReport, Signal};
use crate::transport::{self, ListenerConfig, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    InstallSignals,
    LoadCredentials,
    RegisterAuth,
    OpenPersistence,
    CreateServer,
    ResolveAuthManager,
    ConfigureListener,
    Listen,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::InstallSignals => "install_signals",
            Stage::LoadCredentials => "load_credentials",
            Stage::RegisterAuth => "register_auth",
            Stage::OpenPersistence => "open_persistence",
            Stage::CreateServer => "create_server",
            Stage::ResolveAuthManager => "resolve_auth_manager",
            Stage::ConfigureListener => "configure_listener",
            Stage::Listen => "listen",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("signal handler: {0}")]
    Signal(#[from] io::Error),
}

#[derive(Debug, Error)]
#[error("{stage}: {source}")]
pub struct BootstrapError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl BootstrapError {
    fn new(stage: Stage, source: impl Into<StageError>) -> Self {
        let err = Self {
            stage,
            source: source.into(),
        };
        error!(stage = %err.stage, error = %err.source, "bootstrap step failed");
        err
    }

    /// Fatal errors happen before anything is exposed to the network; the
    /// process should exit. Listener start-up failures are not fatal.
    pub fn is_fatal(&self) -> bool {
        self.stage != Stage::Listen
    }

    pub fn is_invalid_tls(&self) -> bool {
        matches!(&self.source, StageError::Transport(e) if e.is_invalid_tls())
    }
}

/// Deployment policy the server is always built with.
pub fn base_server_config(handler: Arc<dyn SessionHandler>) -> ServerConfig {
    let listener_status: TransportStatus = Arc::new(|id: &str, status: &str| {
        info!(id, status, "Listener status");
    });

    let mut config = ServerConfig::new(handler);
    config.offline_qos0 = true;
    config.transport_status = Some(listener_status);
    config.allow_duplicates = false;
    config.authenticators = vec![INTERNAL_PROVIDER.to_string()];
    config.allow_overlapping_subscriptions = true;
    config
}

/// A bootstrapped broker, serving on every configured listener.
pub struct Running {
    server: Server,
    auth: Arc<AuthManager>,
    listeners: Vec<ListenerConfig>,
    local_addrs: Vec<SocketAddr>,
}

impl Running {
    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn auth_manager(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn listeners(&self) -> &[ListenerConfig] {
        &self.listeners
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Block until the first signal on `signals`, then close the server.
    pub async fn wait_for_shutdown(self, signals: mpsc::Receiver<Signal>) -> ShutdownReport {
        ShutdownCoordinator::new(signals).run(&self.server).await
    }
}

impl fmt::Debug for Running {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Running")
            .field("auth", &self.auth)
            .field("listeners", &self.listeners)
            .field("local_addrs", &self.local_addrs)
            .finish_non_exhaustive()
    }
}

// Past server construction a failed step must still release persistence.
async fn abort(server: Server, stage: Stage, source: impl Into<StageError>) -> BootstrapError {
    let err = BootstrapError::new(stage, source);
    if let Err(e) = server.close().await {
        warn!(stage = %stage, error = %e, "cleanup after failed bootstrap step");
    }
    err
}

fn listener_configs(
    config: &Config,
    auth: &Arc<AuthManager>,
) -> Result<Vec<ListenerConfig>, TransportError> {
    Ok(vec![transport::configure_tcp(
        &config.mqtt.tcp,
        Arc::clone(auth),
    )?])
}

/// Run the startup pipeline against `registry`.
pub async fn start(
    config: &Config,
    registry: &mut ProviderRegistry,
    handler: Arc<dyn SessionHandler>,
) -> Result<Running, BootstrapError> {
    info!("Initializing configs");

    let store = CredentialStore::load(&config.mqtt.auth.internal);
    info!(stage = %Stage::LoadCredentials, users = store.len(), "credentials loaded");

    registry
        .register(INTERNAL_PROVIDER, store)
        .map_err(|e| BootstrapError::new(Stage::RegisterAuth, e))?;

    let mut server_config = base_server_config(handler);

    let persistence = persistence::open(&config.persistence)
        .map_err(|e| BootstrapError::new(Stage::OpenPersistence, e))?;
    server_config.persistence = Some(persistence);

    let server =
        Server::new(server_config).map_err(|e| BootstrapError::new(Stage::CreateServer, e))?;

    let auth = match registry.resolve_manager(server.authenticators()) {
        Ok(manager) => Arc::new(manager),
        Err(e) => return Err(abort(server, Stage::ResolveAuthManager, e).await),
    };

    let listeners = match listener_configs(config, &auth) {
        Ok(listeners) => listeners,
        Err(e) => return Err(abort(server, Stage::ConfigureListener, e).await),
    };

    let mut local_addrs = Vec::with_capacity(listeners.len());
    for listener in &listeners {
        let addr = server
            .listen_and_serve(listener.clone())
            .await
            .map_err(|e| BootstrapError::new(Stage::Listen, e))?;
        local_addrs.push(addr);
    }

    info!(listeners = ?local_addrs, "broker running");
    Ok(Running {
        server,
        auth,
        listeners,
        local_addrs,
    })
}

/// Bootstrap with a fresh registry and serve until SIGINT or SIGTERM.
pub async fn run(
    config: Config,
    handler: Arc<dyn SessionHandler>,
) -> Result<ShutdownReport, BootstrapError> {
    let signals =
        shutdown::os_signals().map_err(|e| BootstrapError::new(Stage::InstallSignals, e))?;

    let mut registry = ProviderRegistry::new();
    let running = start(&config, &mut registry, handler).await?;
    Ok(running.wait_for_shutdown(signals).await)
}
