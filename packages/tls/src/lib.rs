//! # Webgrab TLS client engine
//!
//! The secure-transport layer of the webgrab transfer library: establishes
//! TLS tunnels over connected sockets, validates server identity against
//! configurable trust material, runs revocation checks through OCSP
//! (stapled and live) and HTTP public key pinning, persists sessions for
//! resumption, and exposes a timeout-aware read/write interface.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use webgrab_tls::{MemoryOcspDb, SessionCache, Timeout, TlsConfig, TlsEngine};
//!
//! # async fn run() -> Result<(), webgrab_tls::TlsError> {
//! let config = TlsConfig::default()
//!     .with_session_cache(Arc::new(SessionCache::new()))
//!     .with_ocsp_cache(Arc::new(MemoryOcspDb::new()));
//! let engine = TlsEngine::new(config)?;
//!
//! let tcp = tokio::net::TcpStream::connect(("example.org", 443)).await
//!     .map_err(|e| webgrab_tls::TlsError::Unknown(e.to_string()))?;
//! let mut channel = engine
//!     .open(tcp, "example.org", Some(std::time::Duration::from_secs(10)))
//!     .await?;
//!
//! channel.write(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n", Timeout::Unbounded).await?;
//! let mut buf = [0u8; 4096];
//! let n = channel.read(&mut buf, Timeout::In(std::time::Duration::from_secs(10))).await?;
//! println!("read {n} bytes over {:?}", channel.stats().http_protocol);
//! channel.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! A process-wide default engine with counted [`init`]/[`deinit`] is kept
//! for applications that configure TLS globally; [`configure`] mutates its
//! configuration and [`open`] connects through it.

pub mod config;
pub mod conn;
pub mod db;
pub mod engine;
pub mod error;
pub mod ocsp;
pub mod pins;
pub mod resume;
pub mod stats;

mod cert;
mod trust;
mod verify;

pub use config::{CertFormat, SecureProtocol, TlsConfig};
pub use conn::{ConnectOptions, Timeout, TlsChannel};
pub use db::{HpkpDb, MemoryHpkpDb, MemoryOcspDb, OcspDb};
pub use engine::{TlsEngine, configure, deinit, init, initialized, open};
pub use error::TlsError;
pub use ocsp::{
    OCSP_MAX_REDIRECTS, OcspHttpRequest, OcspHttpResponse, OcspTransport, certificate_fingerprint,
};
pub use pins::PinVerdict;
pub use resume::SessionCache;
pub use stats::{HttpProtocol, OcspStats, OcspStatsCallback, TlsStats, TlsStatsCallback};
