//! Statistics payloads reported after handshakes and OCSP chain checks

use std::sync::Arc;

use rustls::ProtocolVersion;

/// Application protocol selected for the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpProtocol {
    #[default]
    Http11,
    Http2,
}

/// Snapshot of a completed handshake, delivered to the TLS stats callback.
#[derive(Debug, Clone)]
pub struct TlsStats {
    pub hostname: String,
    /// Protocol accepted by the server via ALPN, if any.
    pub alpn_protocol: Option<String>,
    /// Negotiated TLS version: SSL3=1, TLS1.0=2, TLS1.1=3, TLS1.2=4,
    /// TLS1.3=5, unknown=-1.
    pub version: i8,
    pub false_start: bool,
    pub tcp_fast_open: bool,
    /// Whether the handshake resumed a previously negotiated session.
    pub resumed: bool,
    pub http_protocol: HttpProtocol,
    /// Number of certificates the server presented.
    pub cert_chain_size: usize,
}

/// Outcome of one OCSP chain walk, delivered to the OCSP stats callback.
#[derive(Debug, Clone)]
pub struct OcspStats {
    pub hostname: String,
    pub nvalid: usize,
    pub nrevoked: usize,
    pub nignored: usize,
    /// True when the numbers come from a stapled response rather than live
    /// responder queries.
    pub stapling: bool,
}

pub type TlsStatsCallback = Arc<dyn Fn(&TlsStats) + Send + Sync>;
pub type OcspStatsCallback = Arc<dyn Fn(&OcspStats) + Send + Sync>;

pub(crate) fn tls_version_id(version: Option<ProtocolVersion>) -> i8 {
    match version {
        Some(ProtocolVersion::SSLv3) => 1,
        Some(ProtocolVersion::TLSv1_0) => 2,
        Some(ProtocolVersion::TLSv1_1) => 3,
        Some(ProtocolVersion::TLSv1_2) => 4,
        Some(ProtocolVersion::TLSv1_3) => 5,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ids_follow_the_reporting_scale() {
        assert_eq!(tls_version_id(Some(ProtocolVersion::SSLv3)), 1);
        assert_eq!(tls_version_id(Some(ProtocolVersion::TLSv1_0)), 2);
        assert_eq!(tls_version_id(Some(ProtocolVersion::TLSv1_1)), 3);
        assert_eq!(tls_version_id(Some(ProtocolVersion::TLSv1_2)), 4);
        assert_eq!(tls_version_id(Some(ProtocolVersion::TLSv1_3)), 5);
        assert_eq!(tls_version_id(None), -1);
        assert_eq!(tls_version_id(Some(ProtocolVersion::SSLv2)), -1);
    }
}
