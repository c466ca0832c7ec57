//! Best-effort diagnostics endpoint.
//!
//! Runs as a detached task; nothing supervises it. A bind or accept failure
//! is logged and the endpoint is simply gone for the rest of the process.

use std::sync::OnceLock;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static STARTED: OnceLock<Instant> = OnceLock::new();

fn uptime_secs() -> u64 {
    STARTED.get_or_init(Instant::now).elapsed().as_secs()
}

/// Spawn the endpoint on `bind_addr` and forget about it.
pub fn spawn(bind_addr: String) -> JoinHandle<()> {
    STARTED.get_or_init(Instant::now);
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(addr = %bind_addr, error = %e, "diagnostics endpoint unavailable");
                return;
            }
        };
        info!(addr = %bind_addr, "📊 diagnostics endpoint started");
        if let Err(e) = serve(listener).await {
            warn!(error = %e, "diagnostics endpoint stopped");
        }
    })
}

pub async fn serve(listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = handle_request(stream).await {
                debug!(error = %e, "diagnostics request failed");
            }
        });
    }
}

fn render(request: &str) -> (&'static str, &'static str, String) {
    if request.starts_with("GET /debug/status") {
        let workers = tokio::runtime::Handle::try_current()
            .map(|h| h.metrics().num_workers())
            .unwrap_or(0);
        let body = format!(
            "version {}\npid {}\nuptime_seconds {}\nruntime_workers {}\n",
            env!("CARGO_PKG_VERSION"),
            std::process::id(),
            uptime_secs(),
            workers,
        );
        ("200 OK", "text/plain", body)
    } else if request.starts_with("GET /health") {
        ("200 OK", "text/plain", "ok\n".to_string())
    } else {
        ("404 Not Found", "text/plain", "Not Found".to_string())
    }
}

async fn handle_request(mut stream: TcpStream) -> anyhow::Result<()> {
    let mut buffer = [0; 1024];
    let n = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    let (status, content_type, body) = render(&request);
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
