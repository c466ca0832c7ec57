#[path = "common.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use relaymq::auth::{AuthError, AuthStatus, CredentialStore, ProviderRegistry, INTERNAL_PROVIDER};
use relaymq::bootstrap::{self, Stage, StageError};
use relaymq::broker::{RejectSessions, ServerError};
use relaymq::persistence::{self, PersistenceConfig, PersistenceError};
use relaymq::shutdown::Signal;
use relaymq::transport::{self, DEFAULT_TCP_PORT};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use common::{init_logging, temp_db, test_config, LineAuthHandler};

#[tokio::test]
async fn plaintext_bootstrap_serves_and_checks_credentials() {
    init_logging();
    let db = temp_db("plaintext");
    let cfg = test_config(&db, &[("a", "p")]);
    let mut registry = ProviderRegistry::new();

    let running = bootstrap::start(&cfg, &mut registry, Arc::new(RejectSessions))
        .await
        .expect("bootstrap should succeed");

    assert!(registry.contains(INTERNAL_PROVIDER));
    assert_eq!(running.local_addrs().len(), 1);
    assert!(running.listeners()[0].tls.is_none());

    let auth = running.auth_manager();
    assert_eq!(auth.check("a", "p"), AuthStatus::Allow);
    assert_eq!(auth.check("a", "wrong"), AuthStatus::Deny);
    assert_eq!(auth.check("A", "p"), AuthStatus::Deny);

    let policy = running.server().policy();
    assert!(!policy.allow_duplicates);
    assert!(policy.offline_qos0);
    assert!(policy.allow_overlapping_subscriptions);

    running.server().close().await.unwrap();
    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn empty_port_resolves_to_the_standard_port() {
    let db = temp_db("default_port");
    let mut cfg = test_config(&db, &[("a", "p")]);
    cfg.mqtt.tcp.port = String::new();

    let mut registry = ProviderRegistry::new();
    registry
        .register(INTERNAL_PROVIDER, CredentialStore::load(&cfg.mqtt.auth.internal))
        .unwrap();
    let auth = Arc::new(registry.resolve_manager([INTERNAL_PROVIDER]).unwrap());

    let listener = transport::configure_tcp(&cfg.mqtt.tcp, auth).unwrap();
    assert_eq!(listener.port, DEFAULT_TCP_PORT);

    cfg.mqtt.tcp.port = "2883".to_string();
    let auth = Arc::new(registry.resolve_manager([INTERNAL_PROVIDER]).unwrap());
    assert_eq!(transport::configure_tcp(&cfg.mqtt.tcp, auth).unwrap().port, 2883);
}

#[tokio::test]
async fn duplicate_usernames_keep_the_last_secret() {
    let db = temp_db("dupes");
    let cfg = test_config(&db, &[("a", "one"), ("b", "x"), ("a", "two")]);
    let mut registry = ProviderRegistry::new();

    let running = bootstrap::start(&cfg, &mut registry, Arc::new(RejectSessions))
        .await
        .unwrap();

    let auth = running.auth_manager();
    assert_eq!(auth.check("a", "one"), AuthStatus::Deny);
    assert_eq!(auth.check("a", "two"), AuthStatus::Allow);
    assert_eq!(auth.check("b", "x"), AuthStatus::Allow);

    running.server().close().await.unwrap();
    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn sessions_authenticate_through_the_listener_auth_manager() {
    init_logging();
    let db = temp_db("sessions");
    let cfg = test_config(&db, &[("a", "p")]);
    let mut registry = ProviderRegistry::new();
    let handler = Arc::new(LineAuthHandler::default());

    let running = bootstrap::start(&cfg, &mut registry, handler.clone())
        .await
        .unwrap();
    let addr = running.local_addrs()[0];

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut conn = BufReader::new(stream);
    let mut reply = String::new();

    conn.get_mut().write_all(b"a:p\n").await.unwrap();
    conn.read_line(&mut reply).await.unwrap();
    assert_eq!(reply, "ALLOW\n");

    reply.clear();
    conn.get_mut().write_all(b"a:wrong\n").await.unwrap();
    conn.read_line(&mut reply).await.unwrap();
    assert_eq!(reply, "DENY\n");

    assert_eq!(
        handler.sessions.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    running.server().close().await.unwrap();
    let _ = std::fs::remove_file(&db);
}

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

fn trusting_fixture_cert() -> TlsConnector {
    let pem = std::fs::read(fixture("server.pem")).unwrap();
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder_with_provider(Arc::new(
        tokio_rustls::rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn tls_listener_authenticates_over_an_encrypted_session() {
    init_logging();
    let db = temp_db("tls_ok");
    let mut cfg = test_config(&db, &[("a", "p")]);
    cfg.mqtt.tcp.ssl_enable = true;
    cfg.mqtt.tcp.ssl_cert_file = fixture("server.pem");
    cfg.mqtt.tcp.ssl_cert_key_file = fixture("server.key");
    let mut registry = ProviderRegistry::new();

    let running = bootstrap::start(&cfg, &mut registry, Arc::new(LineAuthHandler::default()))
        .await
        .unwrap();
    assert!(running.listeners()[0].tls.is_some());
    assert_eq!(running.listeners()[0].scheme(), "ssl");
    let addr = running.local_addrs()[0];

    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let tls = trusting_fixture_cert().connect(name, tcp).await.unwrap();
    let mut conn = BufReader::new(tls);
    let mut reply = String::new();

    conn.get_mut().write_all(b"a:p\n").await.unwrap();
    conn.get_mut().flush().await.unwrap();
    conn.read_line(&mut reply).await.unwrap();
    assert_eq!(reply, "ALLOW\n");

    running.server().close().await.unwrap();
    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn missing_cert_aborts_and_releases_persistence() {
    init_logging();
    let db = temp_db("tls_no_cert");
    let mut cfg = test_config(&db, &[("a", "p")]);
    cfg.mqtt.tcp.ssl_enable = true;
    cfg.mqtt.tcp.ssl_cert_file = String::new();
    cfg.mqtt.tcp.ssl_cert_key_file = "server.key".to_string();

    let mut registry = ProviderRegistry::new();
    let err = bootstrap::start(&cfg, &mut registry, Arc::new(RejectSessions))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::ConfigureListener);
    assert!(err.is_invalid_tls());
    assert!(err.is_fatal());

    // The lock is gone: the store can be opened again right away.
    persistence::open(&PersistenceConfig::file(&db))
        .expect("persistence must be released after a fatal listener error")
        .release()
        .unwrap();
    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn missing_key_aborts_at_listener_configuration() {
    let db = temp_db("tls_no_key");
    let mut cfg = test_config(&db, &[("a", "p")]);
    cfg.mqtt.tcp.ssl_enable = true;
    cfg.mqtt.tcp.ssl_cert_file = "server.pem".to_string();

    let mut registry = ProviderRegistry::new();
    let err = bootstrap::start(&cfg, &mut registry, Arc::new(RejectSessions))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::ConfigureListener);
    assert!(err.is_invalid_tls());
    persistence::open(&PersistenceConfig::file(&db))
        .unwrap()
        .release()
        .unwrap();
    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn duplicate_provider_aborts_before_persistence() {
    let db = temp_db("dup_provider");
    let cfg = test_config(&db, &[("a", "p")]);
    let mut registry = ProviderRegistry::new();
    registry
        .register(INTERNAL_PROVIDER, CredentialStore::default())
        .unwrap();

    let err = bootstrap::start(&cfg, &mut registry, Arc::new(RejectSessions))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::RegisterAuth);
    assert!(err.is_fatal());
    assert!(matches!(
        err.source,
        StageError::Auth(AuthError::DuplicateProvider(ref name)) if name == INTERNAL_PROVIDER
    ));
    assert!(!db.exists(), "persistence must not be opened");
}

#[tokio::test]
async fn locked_persistence_aborts_before_server_construction() {
    let db = temp_db("locked");
    let holder = persistence::open(&PersistenceConfig::file(&db)).unwrap();
    let cfg = test_config(&db, &[("a", "p")]);
    let mut registry = ProviderRegistry::new();

    let err = bootstrap::start(&cfg, &mut registry, Arc::new(RejectSessions))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::OpenPersistence);
    assert!(err.is_fatal());
    assert!(matches!(
        err.source,
        StageError::Persistence(PersistenceError::Locked(_))
    ));

    holder.release().unwrap();
    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn listen_failure_is_reported_but_not_fatal() {
    init_logging();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let db = temp_db("listen_fail");
    let mut cfg = test_config(&db, &[("a", "p")]);
    cfg.mqtt.tcp.port = port.to_string();
    let mut registry = ProviderRegistry::new();

    let err = bootstrap::start(&cfg, &mut registry, Arc::new(RejectSessions))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Listen);
    assert!(!err.is_fatal());
    assert!(matches!(
        err.source,
        StageError::Server(ServerError::Bind { .. })
    ));

    // Unwinding dropped the server, which released persistence.
    persistence::open(&PersistenceConfig::file(&db))
        .unwrap()
        .release()
        .unwrap();
    drop(taken);
    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn unreadable_tls_material_fails_at_listen() {
    let db = temp_db("tls_unreadable");
    let mut cfg = test_config(&db, &[("a", "p")]);
    cfg.mqtt.tcp.ssl_enable = true;
    cfg.mqtt.tcp.ssl_cert_file = "/nonexistent/relaymq/server.pem".to_string();
    cfg.mqtt.tcp.ssl_cert_key_file = "/nonexistent/relaymq/server.key".to_string();
    let mut registry = ProviderRegistry::new();

    let err = bootstrap::start(&cfg, &mut registry, Arc::new(RejectSessions))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Listen);
    assert!(!err.is_fatal());
    assert!(!err.is_invalid_tls());
    let _ = std::fs::remove_file(&db);
}

#[tokio::test]
async fn termination_signal_closes_exactly_once() {
    init_logging();
    let db = temp_db("signals");
    let cfg = test_config(&db, &[("a", "p")]);
    let mut registry = ProviderRegistry::new();

    let running = bootstrap::start(&cfg, &mut registry, Arc::new(RejectSessions))
        .await
        .unwrap();
    let addr = running.local_addrs()[0];

    let (tx, rx) = mpsc::channel(4);
    tx.send(Signal::Terminate).await.unwrap();
    tx.send(Signal::Interrupt).await.unwrap();

    let report = running.wait_for_shutdown(rx).await;
    assert_eq!(report.signal, Some(Signal::Terminate));
    report.close.expect("close should succeed");

    // The listener is gone and persistence is free again.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(TcpStream::connect(addr).await.is_err());
    persistence::open(&PersistenceConfig::file(&db))
        .unwrap()
        .release()
        .unwrap();
    let _ = std::fs::remove_file(&db);
}
