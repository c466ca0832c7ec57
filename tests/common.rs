#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use futures::future::BoxFuture;
use relaymq::auth::AuthStatus;
use relaymq::broker::{Session, SessionHandler};
use relaymq::config::{Config, CredentialEntry, LogConfig};
use relaymq::persistence::PersistenceConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        relaymq::logging::init_logging(&LogConfig {
            level: "debug".to_string(),
            enable_trace: false,
        });
    });
}

/// Fresh persistence path, unique per test binary and name.
pub fn temp_db(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("relaymq_it_{}_{name}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

/// Plaintext config bound to an ephemeral loopback port.
pub fn test_config(db: &Path, creds: &[(&str, &str)]) -> Config {
    let mut cfg = Config::default();
    cfg.mqtt.auth.internal = creds
        .iter()
        .map(|(user, password)| CredentialEntry {
            user: user.to_string(),
            password: password.to_string(),
        })
        .collect();
    cfg.mqtt.tcp.host = "127.0.0.1".to_string();
    cfg.mqtt.tcp.port = "0".to_string();
    cfg.persistence = PersistenceConfig::file(db);
    cfg.diagnostics.enable = false;
    cfg
}

/// Test protocol: each line is `user:secret`, answered with ALLOW or DENY.
#[derive(Default)]
pub struct LineAuthHandler {
    pub sessions: AtomicUsize,
}

impl SessionHandler for LineAuthHandler {
    fn handle(&self, session: Session) -> BoxFuture<'static, anyhow::Result<()>> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let auth = Arc::clone(&session.auth);
            let mut reader = BufReader::new(session.stream);
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                let (user, secret) = line
                    .trim_end_matches('\n')
                    .split_once(':')
                    .unwrap_or(("", ""));
                let reply: &[u8] = match auth.check(user, secret) {
                    AuthStatus::Allow => b"ALLOW\n",
                    AuthStatus::Deny => b"DENY\n",
                };
                reader.get_mut().write_all(reply).await?;
                reader.get_mut().flush().await?;
            }
        })
    }
}

/// Holds every session open until the server drops it.
pub struct ParkingHandler;

impl SessionHandler for ParkingHandler {
    fn handle(&self, session: Session) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            let _stream = session.stream;
            std::future::pending::<()>().await;
            Ok(())
        })
    }
}
