//! Loopback handshake tests: a blocking rustls server on one thread, the
//! engine on the other.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use rustls::ServerConfig;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use webgrab_tls::{
    MemoryHpkpDb, MemoryOcspDb, OcspDb, OcspStats, PinVerdict, SessionCache, Timeout, TlsConfig,
    TlsEngine, TlsError, TlsStats, certificate_fingerprint,
};

struct TestIdentity {
    ca_pem: String,
    leaf_der: Vec<u8>,
    server_config: ServerConfig,
}

fn test_identity(hosts: &[&str]) -> TestIdentity {
    let ca_key = rcgen::KeyPair::generate().expect("ca key");
    let mut ca_params = rcgen::CertificateParams::new(Vec::new()).expect("ca params");
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "webgrab test CA");
    let ca_cert = ca_params.clone().self_signed(&ca_key).expect("ca cert");
    let issuer = rcgen::Issuer::new(ca_params, ca_key);

    let leaf_key = rcgen::KeyPair::generate().expect("leaf key");
    let leaf_params =
        rcgen::CertificateParams::new(hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>())
            .expect("leaf params");
    let leaf_cert = leaf_params.signed_by(&leaf_key, &issuer).expect("leaf cert");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server_config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .expect("versions")
        .with_no_client_auth()
        .with_single_cert(
            vec![leaf_cert.der().clone(), ca_cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        )
        .expect("server config");

    TestIdentity {
        ca_pem: ca_cert.pem(),
        leaf_der: leaf_cert.der().to_vec(),
        server_config,
    }
}

/// Writes the CA certificate into a fresh directory the trust loader can
/// scan.
fn ca_dir(tag: &str, ca_pem: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("webgrab-hs-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create ca dir");
    std::fs::write(dir.join("ca.pem"), ca_pem).expect("write ca pem");
    dir
}

fn base_config(tag: &str, ca_pem: &str) -> TlsConfig {
    let dir = ca_dir(tag, ca_pem);
    let mut config = TlsConfig::default();
    config.set_str("ca-directory", dir.to_str().expect("utf-8 path"));
    config.set_flag("ocsp", false);
    config.set_flag("ocsp-stapling", false);
    config
}

/// Accepts `accepts` connections; sends a greeting, optionally echoes one
/// read, then closes. Handshakes the client aborts just move on to the
/// next accept.
fn run_server(
    listener: std::net::TcpListener,
    config: Arc<ServerConfig>,
    accepts: usize,
    echo: bool,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for _ in 0..accepts {
            let Ok((mut sock, _)) = listener.accept() else {
                return;
            };
            let Ok(mut conn) = rustls::ServerConnection::new(config.clone()) else {
                return;
            };
            let mut tls = rustls::Stream::new(&mut conn, &mut sock);
            if tls.write_all(b"hello\n").is_err() {
                continue;
            }
            let _ = tls.flush();
            if echo {
                let mut buf = [0u8; 128];
                if let Ok(n) = tls.read(&mut buf) {
                    if n > 0 {
                        let _ = tls.write_all(&buf[..n]);
                        let _ = tls.flush();
                    }
                }
            }
            conn.send_close_notify();
            let _ = conn.complete_io(&mut sock);
        }
    })
}

fn listen() -> (std::net::TcpListener, SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    (listener, addr)
}

async fn connect(addr: SocketAddr) -> tokio::net::TcpStream {
    tokio::net::TcpStream::connect(addr).await.expect("tcp connect")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_reports_stats_and_transfers_data() {
    let identity = test_identity(&["localhost"]);
    let (listener, addr) = listen();
    let server = run_server(listener, Arc::new(identity.server_config), 1, true);

    let seen: Arc<Mutex<Option<TlsStats>>> = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let config = base_config("stats", &identity.ca_pem).with_tls_stats_callback(Arc::new(
        move |stats: &TlsStats| {
            *sink.lock().expect("lock") = Some(stats.clone());
        },
    ));
    let engine = TlsEngine::new(config).expect("engine");

    let mut channel = engine
        .open(connect(addr).await, "localhost", Some(Duration::from_secs(5)))
        .await
        .expect("handshake");

    let stats = seen.lock().expect("lock").clone().expect("stats fired");
    assert_eq!(stats.hostname, "localhost");
    assert_eq!(stats.version, 5);
    assert!(!stats.resumed);
    assert_eq!(stats.cert_chain_size, 2);
    assert_eq!(stats.http_protocol, webgrab_tls::HttpProtocol::Http11);
    assert!(stats.alpn_protocol.is_none());
    assert_eq!(channel.hpkp(), PinVerdict::NoPin);

    // greeting, then echo
    let mut buf = [0u8; 64];
    let n = channel
        .read(&mut buf, Timeout::In(Duration::from_secs(5)))
        .await
        .expect("read greeting");
    assert_eq!(&buf[..n], b"hello\n");

    assert_eq!(channel.write(b"ping", Timeout::Unbounded).await.expect("write"), 4);
    let n = channel
        .read(&mut buf, Timeout::In(Duration::from_secs(5)))
        .await
        .expect("read echo");
    assert_eq!(&buf[..n], b"ping");

    // zero-length and zero-timeout reads return 0
    assert_eq!(channel.read(&mut [], Timeout::Unbounded).await.expect("empty"), 0);
    assert_eq!(channel.write(&[], Timeout::Unbounded).await.expect("empty"), 0);
    assert_eq!(
        channel.read(&mut buf, Timeout::Zero).await.expect("nonblocking"),
        0
    );

    channel.close().await;
    server.join().expect("server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alpn_negotiates_http2() {
    let identity = test_identity(&["localhost"]);
    let mut server_config = identity.server_config;
    server_config.alpn_protocols = vec![b"h2".to_vec()];
    let (listener, addr) = listen();
    let server = run_server(listener, Arc::new(server_config), 1, false);

    let mut config = base_config("alpn", &identity.ca_pem);
    config.set_str("alpn", "h2,http/1.1");
    let engine = TlsEngine::new(config).expect("engine");

    let channel = engine
        .open(connect(addr).await, "localhost", Some(Duration::from_secs(5)))
        .await
        .expect("handshake");

    assert_eq!(channel.http_protocol(), webgrab_tls::HttpProtocol::Http2);
    assert_eq!(channel.alpn_protocol(), Some("h2"));
    channel.close().await;
    server.join().expect("server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hostname_mismatch_respects_the_check_flag() {
    let identity = test_identity(&["localhost"]);
    let (listener, addr) = listen();
    let server = run_server(listener, Arc::new(identity.server_config), 2, false);

    // checking on (default): subject mismatch aborts with a certificate error
    let engine = TlsEngine::new(base_config("host-on", &identity.ca_pem)).expect("engine");
    let err = engine
        .open(connect(addr).await, "wrong.example", Some(Duration::from_secs(5)))
        .await
        .expect_err("must fail");
    assert!(matches!(err, TlsError::Certificate(_)), "got {err:?}");

    // checking off: the mismatch alone does not fail the handshake
    let mut config = base_config("host-off", &identity.ca_pem);
    config.set_flag("check-hostname", false);
    let engine = TlsEngine::new(config).expect("engine");
    let channel = engine
        .open(connect(addr).await, "wrong.example", Some(Duration::from_secs(5)))
        .await
        .expect("tolerated handshake");
    channel.close().await;

    server.join().expect("server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cached_ocsp_revocation_aborts_the_handshake() {
    let identity = test_identity(&["localhost"]);
    let (listener, addr) = listen();
    let server = run_server(listener, Arc::new(identity.server_config), 1, false);

    let cache = Arc::new(MemoryOcspDb::new());
    cache.add(
        &certificate_fingerprint(&identity.leaf_der),
        SystemTime::now() + Duration::from_secs(3600),
        false,
    );

    let seen: Arc<Mutex<Option<OcspStats>>> = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let mut config = base_config("revoked", &identity.ca_pem)
        .with_ocsp_cache(cache)
        .with_ocsp_stats_callback(Arc::new(move |stats: &OcspStats| {
            *sink.lock().expect("lock") = Some(stats.clone());
        }));
    config.set_flag("ocsp", true);

    let engine = TlsEngine::new(config).expect("engine");
    let err = engine
        .open(connect(addr).await, "localhost", Some(Duration::from_secs(5)))
        .await
        .expect_err("revoked cert must fail");
    assert!(matches!(err, TlsError::Certificate(_)), "got {err:?}");

    let stats = seen.lock().expect("lock").clone().expect("ocsp stats fired");
    assert_eq!(stats.nrevoked, 1);
    assert!(!stats.stapling);

    server.join().expect("server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cached_ocsp_validity_passes_the_chain() {
    let identity = test_identity(&["localhost"]);
    let (listener, addr) = listen();
    let server = run_server(listener, Arc::new(identity.server_config), 1, false);

    let cache = Arc::new(MemoryOcspDb::new());
    cache.add(
        &certificate_fingerprint(&identity.leaf_der),
        SystemTime::now() + Duration::from_secs(3600),
        true,
    );

    let seen: Arc<Mutex<Option<OcspStats>>> = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let mut config = base_config("valid", &identity.ca_pem)
        .with_ocsp_cache(cache)
        .with_ocsp_stats_callback(Arc::new(move |stats: &OcspStats| {
            *sink.lock().expect("lock") = Some(stats.clone());
        }));
    config.set_flag("ocsp", true);

    let engine = TlsEngine::new(config).expect("engine");
    let channel = engine
        .open(connect(addr).await, "localhost", Some(Duration::from_secs(5)))
        .await
        .expect("handshake");
    channel.close().await;

    let stats = seen.lock().expect("lock").clone().expect("ocsp stats fired");
    assert_eq!(stats.nvalid, 1);
    assert_eq!(stats.nrevoked, 0);

    server.join().expect("server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pinning_verdict_gates_the_handshake() {
    let identity = test_identity(&["localhost"]);
    let (listener, addr) = listen();
    let server = run_server(listener, Arc::new(identity.server_config), 2, false);

    // a pin that matches nothing in the chain
    let pins = Arc::new(MemoryHpkpDb::new());
    pins.add_pin("localhost", [0u8; 32]);
    let engine = TlsEngine::new(base_config("pin-bad", &identity.ca_pem).with_hpkp_cache(pins))
        .expect("engine");
    let err = engine
        .open(connect(addr).await, "localhost", Some(Duration::from_secs(5)))
        .await
        .expect_err("mismatched pin must fail");
    assert!(matches!(err, TlsError::Certificate(_)), "got {err:?}");

    // pinning the leaf's key passes and is reported
    let pins = Arc::new(MemoryHpkpDb::new());
    pins.pin_certificate("localhost", &identity.leaf_der).expect("pin");
    let engine = TlsEngine::new(base_config("pin-good", &identity.ca_pem).with_hpkp_cache(pins))
        .expect("engine");
    let channel = engine
        .open(connect(addr).await, "localhost", Some(Duration::from_secs(5)))
        .await
        .expect("pinned handshake");
    assert_eq!(channel.hpkp(), PinVerdict::Match);
    channel.close().await;

    server.join().expect("server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_resume_through_the_cache() {
    let identity = test_identity(&["localhost"]);
    let (listener, addr) = listen();
    let server = run_server(listener, Arc::new(identity.server_config), 2, false);

    let sessions = Arc::new(SessionCache::new());
    let engine = TlsEngine::new(
        base_config("resume", &identity.ca_pem).with_session_cache(sessions.clone()),
    )
    .expect("engine");

    let mut channel = engine
        .open(connect(addr).await, "localhost", Some(Duration::from_secs(5)))
        .await
        .expect("first handshake");
    assert!(!channel.is_resumed());

    // reading the greeting also processes the server's session tickets
    let mut buf = [0u8; 16];
    let _ = channel
        .read(&mut buf, Timeout::In(Duration::from_secs(5)))
        .await
        .expect("greeting");
    channel.close().await;

    assert!(sessions.contains("localhost"));

    let channel = engine
        .open(connect(addr).await, "localhost", Some(Duration::from_secs(5)))
        .await
        .expect("second handshake");
    assert!(channel.is_resumed());
    assert!(channel.stats().resumed);
    channel.close().await;

    server.join().expect("server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_server_times_out() {
    let identity = test_identity(&["localhost"]);
    // bound but never accepted: the kernel completes the TCP handshake and
    // then nothing ever arrives
    let (listener, addr) = listen();

    let engine = TlsEngine::new(base_config("timeout", &identity.ca_pem)).expect("engine");
    let started = Instant::now();
    let err = engine
        .open(connect(addr).await, "localhost", Some(Duration::from_millis(100)))
        .await
        .expect_err("must time out");
    assert!(matches!(err, TlsError::Timeout), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));

    drop(listener);
}
