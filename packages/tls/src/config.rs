//! Engine configuration
//!
//! A [`TlsConfig`] carries every tunable of the engine: protocol policy,
//! trust material locations, revocation switches, and the handles to the
//! external databases and callbacks. Scalar options can also be set through
//! string-keyed setters; an unknown key is logged and ignored.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error};

use crate::db::{HpkpDb, OcspDb};
use crate::ocsp::OcspTransport;
use crate::resume::SessionCache;
use crate::stats::{OcspStatsCallback, TlsStatsCallback};

/// Protocol/cipher policy selector.
///
/// The fixed names select a minimum protocol version; anything else is taken
/// verbatim as a backend priority string listing cipher suites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecureProtocol {
    Ssl,
    TlsV1,
    TlsV1_1,
    TlsV1_2,
    TlsV1_3,
    Auto,
    Pfs,
    Priority(String),
}

impl SecureProtocol {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("SSL") {
            SecureProtocol::Ssl
        } else if value.eq_ignore_ascii_case("TLSv1") {
            SecureProtocol::TlsV1
        } else if value.eq_ignore_ascii_case("TLSv1_1") {
            SecureProtocol::TlsV1_1
        } else if value.eq_ignore_ascii_case("TLSv1_2") {
            SecureProtocol::TlsV1_2
        } else if value.eq_ignore_ascii_case("TLSv1_3") {
            SecureProtocol::TlsV1_3
        } else if value.eq_ignore_ascii_case("AUTO") {
            SecureProtocol::Auto
        } else if value.eq_ignore_ascii_case("PFS") {
            SecureProtocol::Pfs
        } else {
            SecureProtocol::Priority(value.to_string())
        }
    }
}

/// Encoding of certificate and key files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertFormat {
    #[default]
    Pem,
    Der,
}

/// Process configuration of the TLS engine.
#[derive(Clone)]
pub struct TlsConfig {
    pub secure_protocol: SecureProtocol,
    /// Root certificate directory; the literal `"system"` selects the
    /// platform default paths.
    pub ca_directory: String,
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub crl_file: Option<String>,
    /// Overrides the responder URI read from certificates.
    pub ocsp_server: Option<String>,
    /// Comma-separated ALPN offering, e.g. `"h2,http/1.1"`.
    pub alpn: Option<String>,
    pub ca_type: CertFormat,
    pub cert_type: CertFormat,
    pub key_type: CertFormat,
    pub check_certificate: bool,
    pub check_hostname: bool,
    pub print_info: bool,
    pub ocsp: bool,
    pub ocsp_stapling: bool,
    pub ocsp_nonce: bool,
    /// Reject OCSP responses older than 3 days.
    pub ocsp_date: bool,
    pub ocsp_cert_cache: Option<Arc<dyn OcspDb>>,
    pub tls_session_cache: Option<Arc<SessionCache>>,
    pub hpkp_cache: Option<Arc<dyn HpkpDb>>,
    /// HTTP capability used to POST OCSP requests.
    pub ocsp_transport: Option<Arc<dyn OcspTransport>>,
    pub tls_stats: Option<TlsStatsCallback>,
    pub ocsp_stats: Option<OcspStatsCallback>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            secure_protocol: SecureProtocol::Auto,
            ca_directory: "system".to_string(),
            ca_file: None,
            cert_file: None,
            key_file: None,
            crl_file: None,
            ocsp_server: None,
            alpn: None,
            ca_type: CertFormat::Pem,
            cert_type: CertFormat::Pem,
            key_type: CertFormat::Pem,
            check_certificate: true,
            check_hostname: true,
            print_info: false,
            ocsp: true,
            ocsp_stapling: true,
            ocsp_nonce: true,
            ocsp_date: false,
            ocsp_cert_cache: None,
            tls_session_cache: None,
            hpkp_cache: None,
            ocsp_transport: None,
            tls_stats: None,
            ocsp_stats: None,
        }
    }
}

impl TlsConfig {
    /// Sets a string-valued option by key. Unknown keys are logged and
    /// ignored; they do not harm the engine.
    pub fn set_str(&mut self, key: &str, value: &str) {
        match key {
            "secure-protocol" => self.secure_protocol = SecureProtocol::parse(value),
            "ca-directory" => self.ca_directory = value.to_string(),
            "ca-file" => self.ca_file = non_empty(value),
            "cert-file" => self.cert_file = non_empty(value),
            "key-file" => self.key_file = non_empty(value),
            "crl-file" => self.crl_file = non_empty(value),
            "ocsp-server" => self.ocsp_server = non_empty(value),
            "alpn" => self.alpn = non_empty(value),
            _ => error!("unknown configuration key '{key}' (maybe this config value should be of another type?)"),
        }
    }

    /// Sets a boolean option by key. Unknown keys are logged and ignored.
    pub fn set_flag(&mut self, key: &str, value: bool) {
        match key {
            "check-certificate" => self.check_certificate = value,
            "check-hostname" => self.check_hostname = value,
            "print-info" => self.print_info = value,
            "ocsp" => self.ocsp = value,
            "ocsp-stapling" => self.ocsp_stapling = value,
            "ocsp-nonce" => self.ocsp_nonce = value,
            "ocsp-date" => self.ocsp_date = value,
            _ => error!("unknown configuration key '{key}' (maybe this config value should be of another type?)"),
        }
    }

    /// Sets a certificate/key encoding option by key. Unknown keys are
    /// logged and ignored.
    pub fn set_format(&mut self, key: &str, value: CertFormat) {
        match key {
            "ca-type" => self.ca_type = value,
            "cert-type" => self.cert_type = value,
            "key-type" => self.key_type = value,
            _ => error!("unknown configuration key '{key}' (maybe this config value should be of another type?)"),
        }
    }

    pub fn with_session_cache(mut self, cache: Arc<SessionCache>) -> Self {
        self.tls_session_cache = Some(cache);
        self
    }

    pub fn with_ocsp_cache(mut self, cache: Arc<dyn OcspDb>) -> Self {
        self.ocsp_cert_cache = Some(cache);
        self
    }

    pub fn with_hpkp_cache(mut self, cache: Arc<dyn HpkpDb>) -> Self {
        self.hpkp_cache = Some(cache);
        self
    }

    pub fn with_ocsp_transport(mut self, transport: Arc<dyn OcspTransport>) -> Self {
        self.ocsp_transport = Some(transport);
        self
    }

    pub fn with_tls_stats_callback(mut self, callback: TlsStatsCallback) -> Self {
        self.tls_stats = Some(callback);
        self
    }

    pub fn with_ocsp_stats_callback(mut self, callback: OcspStatsCallback) -> Self {
        self.ocsp_stats = Some(callback);
        self
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("secure_protocol", &self.secure_protocol)
            .field("ca_directory", &self.ca_directory)
            .field("ca_file", &self.ca_file)
            .field("crl_file", &self.crl_file)
            .field("ocsp_server", &self.ocsp_server)
            .field("alpn", &self.alpn)
            .field("check_certificate", &self.check_certificate)
            .field("check_hostname", &self.check_hostname)
            .field("ocsp", &self.ocsp)
            .field("ocsp_stapling", &self.ocsp_stapling)
            .field("ocsp_nonce", &self.ocsp_nonce)
            .field("ocsp_date", &self.ocsp_date)
            .field("ocsp_cert_cache", &self.ocsp_cert_cache.is_some())
            .field("tls_session_cache", &self.tls_session_cache.is_some())
            .field("hpkp_cache", &self.hpkp_cache.is_some())
            .field("ocsp_transport", &self.ocsp_transport.is_some())
            .finish_non_exhaustive()
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Splits a comma-separated ALPN offering into wire protocols. Empty tokens
/// and tokens longer than 64 bytes are dropped.
pub(crate) fn parse_alpn(list: &str) -> Vec<Vec<u8>> {
    let mut protocols = Vec::new();
    for token in list.split(',') {
        if token.is_empty() {
            continue;
        }
        if token.len() > 64 {
            debug!("ALPN protocol too long {token}");
            continue;
        }
        debug!("ALPN offering {token}");
        protocols.push(token.as_bytes().to_vec());
    }
    protocols
}
