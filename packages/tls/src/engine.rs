//! Engine lifecycle
//!
//! A [`TlsEngine`] is built once from a [`TlsConfig`] and shared by every
//! connection it opens: it owns the trust material, the protocol policy and
//! the handles to the external databases. Multiple engines may coexist in
//! one process. A process-wide default engine with counted `init`/`deinit`
//! is kept as a thin compatibility layer.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use once_cell::sync::Lazy;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::config::{SecureProtocol, TlsConfig, parse_alpn};
use crate::conn::TlsChannel;
use crate::error::TlsError;
use crate::trust;
use crate::verify::{HandshakeState, InsecureVerifier, RevocationVerifier};

pub(crate) struct EngineShared {
    pub(crate) config: TlsConfig,
    pub(crate) provider: Arc<CryptoProvider>,
    pub(crate) versions: Vec<&'static SupportedProtocolVersion>,
    /// Inherited-status verifier. Absent when no trust anchors could be
    /// loaded; every chain fails verification until that changes.
    pub(crate) webpki: Option<Arc<WebPkiServerVerifier>>,
    pub(crate) alpn: Vec<Vec<u8>>,
}

impl EngineShared {
    /// Builds the per-connection backend config, installing a verifier that
    /// carries this connection's handshake state.
    pub(crate) fn client_config(
        self: &Arc<Self>,
        state: &Arc<HandshakeState>,
    ) -> Result<Arc<ClientConfig>, TlsError> {
        let verifier: Arc<dyn rustls::client::danger::ServerCertVerifier> =
            if self.config.check_certificate {
                Arc::new(RevocationVerifier::new(self.clone(), state.clone()))
            } else {
                Arc::new(InsecureVerifier::new(self.provider.clone()))
            };

        let mut config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&self.versions)
            .map_err(|e| TlsError::Unknown(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        config.alpn_protocols = self.alpn.clone();
        config.resumption = match &self.config.tls_session_cache {
            Some(cache) => rustls::client::Resumption::store(cache.clone()),
            None => rustls::client::Resumption::disabled(),
        };

        Ok(Arc::new(config))
    }
}

/// The TLS client engine.
#[derive(Clone)]
pub struct TlsEngine {
    shared: Arc<EngineShared>,
}

impl TlsEngine {
    /// Builds an engine from a configuration snapshot.
    ///
    /// Loads trust material and CRLs, resolves the protocol policy and
    /// prepares the verification pipeline. A CRL file that cannot be loaded
    /// and an invalid priority string are fatal; an empty trust store is
    /// not (verification will simply fail for untrusted chains).
    pub fn new(config: TlsConfig) -> Result<Self, TlsError> {
        let (provider, versions) = resolve_policy(&config.secure_protocol)?;

        let mut webpki = None;
        if config.check_certificate {
            let mut roots = RootCertStore::empty();
            trust::load_trust_material(&mut roots, &config);

            let crls = match &config.crl_file {
                Some(path) => {
                    let crls = trust::load_crls(std::path::Path::new(path))?;
                    debug!("loaded {} revocation lists from '{path}'", crls.len());
                    crls
                }
                None => Vec::new(),
            };

            if !roots.is_empty() {
                let builder =
                    WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone());
                let builder = if crls.is_empty() {
                    builder
                } else {
                    builder.with_crls(crls)
                };
                webpki = Some(builder.build().map_err(|e| {
                    TlsError::Unknown(format!("could not build certificate verifier: {e}"))
                })?);
            }
        } else {
            info!("certificate check disabled, peer's certificate will NOT be checked");
        }

        let alpn = config.alpn.as_deref().map(parse_alpn).unwrap_or_default();

        debug!("TLS engine initialized");
        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                provider,
                versions,
                webpki,
                alpn,
            }),
        })
    }

    pub fn config(&self) -> &TlsConfig {
        &self.shared.config
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }
}

impl fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEngine")
            .field("config", &self.shared.config)
            .field("trusted", &self.shared.webpki.is_some())
            .finish()
    }
}

/// Maps the protocol policy onto the backend: protocol versions plus the
/// cipher suite selection. The backend ships nothing below TLS 1.2 and no
/// non-forward-secret key exchange, so the legacy names clamp upwards and
/// `PFS` equals the hardened default.
fn resolve_policy(
    protocol: &SecureProtocol,
) -> Result<(Arc<CryptoProvider>, Vec<&'static SupportedProtocolVersion>), TlsError> {
    let base = rustls::crypto::ring::default_provider();
    let all_versions = vec![&rustls::version::TLS12, &rustls::version::TLS13];

    Ok(match protocol {
        SecureProtocol::Auto | SecureProtocol::Pfs | SecureProtocol::TlsV1_2 => {
            (Arc::new(base), all_versions)
        }
        SecureProtocol::Ssl | SecureProtocol::TlsV1 | SecureProtocol::TlsV1_1 => {
            info!("protocols below TLS 1.2 are not supported by the TLS backend, using TLS 1.2 instead");
            (Arc::new(base), all_versions)
        }
        SecureProtocol::TlsV1_3 => (Arc::new(base), vec![&rustls::version::TLS13]),
        SecureProtocol::Priority(list) => {
            let mut suites = Vec::new();
            for name in list.split([':', ',']).filter(|name| !name.is_empty()) {
                match base
                    .cipher_suites
                    .iter()
                    .copied()
                    .find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(name))
                {
                    Some(suite) => suites.push(suite),
                    None => debug!("unknown cipher suite '{name}' in priority string"),
                }
            }
            if suites.is_empty() {
                error!("invalid priority string '{list}'");
                return Err(TlsError::Invalid("priority string selects no cipher suites"));
            }
            let provider = CryptoProvider {
                cipher_suites: suites,
                ..base
            };
            (Arc::new(provider), all_versions)
        }
    })
}

struct DefaultEngine {
    config: TlsConfig,
    engine: Option<TlsEngine>,
    init_count: usize,
}

static DEFAULT_ENGINE: Lazy<Mutex<DefaultEngine>> = Lazy::new(|| {
    Mutex::new(DefaultEngine {
        config: TlsConfig::default(),
        engine: None,
        init_count: 0,
    })
});

fn lock_default() -> MutexGuard<'static, DefaultEngine> {
    DEFAULT_ENGINE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Adjusts the configuration of the process-wide default engine. Changes
/// apply when the engine is (re)initialized.
pub fn configure(apply: impl FnOnce(&mut TlsConfig)) {
    apply(&mut lock_default().config);
}

/// Initializes the process-wide default engine. Only the first successful
/// call constructs it; later calls increment a counter. A failed
/// construction is logged and leaves the engine uninitialized, to be
/// retried by the next `init` or `open`.
pub fn init() {
    let mut guard = lock_default();
    if guard.init_count == 0 {
        match TlsEngine::new(guard.config.clone()) {
            Ok(engine) => {
                guard.engine = Some(engine);
                guard.init_count = 1;
            }
            Err(err) => error!("could not initialize the TLS engine: {err}"),
        }
    } else {
        guard.init_count += 1;
    }
}

/// Counterpart of [`init`]. The last matching call tears the default
/// engine down; surplus calls do nothing.
pub fn deinit() {
    let mut guard = lock_default();
    if guard.init_count == 1 {
        guard.engine = None;
    }
    if guard.init_count > 0 {
        guard.init_count -= 1;
    }
}

pub fn initialized() -> bool {
    lock_default().init_count > 0
}

/// Opens a connection through the process-wide default engine,
/// initializing it first if needed.
pub async fn open(
    stream: TcpStream,
    hostname: &str,
    connect_timeout: Option<Duration>,
) -> Result<TlsChannel, TlsError> {
    let engine = {
        let mut guard = lock_default();
        match &guard.engine {
            Some(engine) => engine.clone(),
            None => {
                let engine = TlsEngine::new(guard.config.clone())?;
                guard.engine = Some(engine.clone());
                guard.init_count = 1;
                engine
            }
        }
    };
    engine.open(stream, hostname, connect_timeout).await
}
