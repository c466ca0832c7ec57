//! Signal-driven shutdown.
//!
//! The coordinator consumes exactly one termination signal and then closes
//! the server exactly once:
//!
//! ```text
//! Running -> SignalReceived -> Closing -> Closed
//! ```

use std::io;

use futures::future::BoxFuture;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::broker::{Server, ServerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    SignalReceived,
    Closing,
    Closed,
}

/// Something the coordinator can close.
pub trait Closeable: Send + Sync {
    fn close(&self) -> BoxFuture<'_, Result<(), ServerError>>;
}

impl Closeable for Server {
    fn close(&self) -> BoxFuture<'_, Result<(), ServerError>> {
        Box::pin(Server::close(self))
    }
}

/// Outcome of one shutdown run.
#[derive(Debug)]
pub struct ShutdownReport {
    /// `None` when the signal source went away without delivering a signal.
    pub signal: Option<Signal>,
    pub close: Result<(), ServerError>,
}

/// Forward SIGINT and SIGTERM into a channel.
///
/// The forwarding task ends once the receiver is dropped.
pub fn os_signals() -> io::Result<mpsc::Receiver<Signal>> {
    let (tx, rx) = mpsc::channel(4);

    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};

        let mut interrupt = unix_signal(SignalKind::interrupt())?;
        let mut terminate = unix_signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = interrupt.recv() => Signal::Interrupt,
                    Some(()) = terminate.recv() => Signal::Terminate,
                    else => break,
                };
                if tx.send(received).await.is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        while signal::ctrl_c().await.is_ok() {
            if tx.send(Signal::Interrupt).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

pub struct ShutdownCoordinator {
    signals: mpsc::Receiver<Signal>,
    state: watch::Sender<ShutdownState>,
}

impl ShutdownCoordinator {
    pub fn new(signals: mpsc::Receiver<Signal>) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self { signals, state }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ShutdownState) {
        self.state.send_replace(next);
    }

    /// Block until the first signal, then close `server`.
    ///
    /// Consumes the coordinator, so `close` can never run twice. Signals that
    /// arrive after the first are left unread.
    pub async fn run<C>(mut self, server: &C) -> ShutdownReport
    where
        C: Closeable + ?Sized,
    {
        let received = self.signals.recv().await;
        match received {
            Some(sig) => {
                info!(signal = sig.name(), "Received signal...starting shutdown...");
            }
            None => warn!("signal source closed, starting shutdown"),
        }
        self.transition(ShutdownState::SignalReceived);
        // Stop queueing further signals.
        self.signals.close();

        self.transition(ShutdownState::Closing);
        let close = server.close().await;
        match &close {
            Ok(()) => info!("🏁 Server shut down."),
            Err(e) => error!(error = %e, "Couldn't shutdown server"),
        }
        self.transition(ShutdownState::Closed);

        ShutdownReport {
            signal: received,
            close,
        }
    }
}
