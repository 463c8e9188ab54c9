//! TLS-specific error types for detailed error handling

/// Error kinds surfaced by the TLS engine.
///
/// Every fallible operation in this crate reports one of these kinds.
/// Conditions that only reduce assurance (an unreadable trust file, an
/// unreachable OCSP responder, an unparseable cached session) are logged and
/// degraded instead of being returned.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// A caller-supplied argument was unusable. No side effects took place.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A readiness wait did not complete within the deadline.
    #[error("operation timed out")]
    Timeout,
    /// The backend reported a fatal protocol error.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    /// Certificate validation failed (chain, hostname, pinning or OCSP).
    #[error("certificate verification failed: {0}")]
    Certificate(String),
    /// A resource could not be acquired.
    #[error("out of memory")]
    Memory,
    /// Anything the other kinds do not cover.
    #[error("TLS error: {0}")]
    Unknown(String),
}

/// Maps a backend error to the caller-facing kind. The backend flags every
/// verification failure as `InvalidCertificate`; everything else that aborts
/// a handshake is a protocol error.
pub(crate) fn map_backend_error(err: rustls::Error) -> TlsError {
    match &err {
        rustls::Error::InvalidCertificate(_) => TlsError::Certificate(err.to_string()),
        _ => TlsError::Handshake(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_verify_failures_map_to_certificate() {
        let err = rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer);
        assert!(matches!(map_backend_error(err), TlsError::Certificate(_)));
    }

    #[test]
    fn other_backend_errors_map_to_handshake() {
        let err = rustls::Error::AlertReceived(rustls::AlertDescription::HandshakeFailure);
        assert!(matches!(map_backend_error(err), TlsError::Handshake(_)));
    }
}
