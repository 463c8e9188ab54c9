//! Custom chain verification: inherited backend checks plus pinning and
//! OCSP revocation
//!
//! The backend invokes [`RevocationVerifier`] once per handshake with the
//! presented chain and the inherited webpki verdict. The verifier only ever
//! tightens that verdict: pinning mismatches, stapled-response failures and
//! live OCSP revocations turn a pass into a fail.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::SystemTime;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error as BackendError, SignatureScheme};
use tokio::runtime::RuntimeFlavor;
use tracing::{debug, error};

use crate::cert::parse_chain_cert;
use crate::engine::EngineShared;
use crate::ocsp;
use crate::pins::{PinVerdict, check_chain_pins};

/// Verification state of one handshake. Allocated per connection and shared
/// with the verifier installed into that connection's backend config; never
/// attached to state shared between handshakes.
#[derive(Debug)]
pub(crate) struct HandshakeState {
    pub(crate) hostname: String,
    revocation_exempt: bool,
    cert_chain_size: AtomicUsize,
    hpkp: AtomicU8,
    ocsp_checked: AtomicBool,
    verifying_ocsp: AtomicBool,
}

impl HandshakeState {
    pub(crate) fn new(hostname: &str, revocation_exempt: bool) -> Self {
        Self {
            hostname: hostname.to_string(),
            revocation_exempt,
            cert_chain_size: AtomicUsize::new(0),
            hpkp: AtomicU8::new(PinVerdict::NoPin.as_u8()),
            ocsp_checked: AtomicBool::new(false),
            verifying_ocsp: AtomicBool::new(false),
        }
    }

    pub(crate) fn chain_size(&self) -> usize {
        self.cert_chain_size.load(Ordering::Acquire)
    }

    fn set_chain_size(&self, size: usize) {
        self.cert_chain_size.store(size, Ordering::Release);
    }

    pub(crate) fn hpkp(&self) -> PinVerdict {
        PinVerdict::from_u8(self.hpkp.load(Ordering::Acquire))
    }

    fn set_hpkp(&self, verdict: PinVerdict) {
        self.hpkp.store(verdict.as_u8(), Ordering::Release);
    }

    pub(crate) fn ocsp_checked(&self) -> bool {
        self.ocsp_checked.load(Ordering::Acquire)
    }

    fn set_ocsp_checked(&self) {
        self.ocsp_checked.store(true, Ordering::Release);
    }

    fn verifying_ocsp(&self) -> bool {
        self.verifying_ocsp.load(Ordering::Acquire)
    }

    fn set_verifying_ocsp(&self, value: bool) {
        self.verifying_ocsp.store(value, Ordering::Release);
    }
}

/// Bridges the async OCSP client into the backend's synchronous callback.
fn run_blocking<F: std::future::Future>(future: F) -> F::Output {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(future))
        }
        _ => futures::executor::block_on(future),
    }
}

pub(crate) struct RevocationVerifier {
    shared: Arc<EngineShared>,
    state: Arc<HandshakeState>,
}

impl RevocationVerifier {
    pub(crate) fn new(shared: Arc<EngineShared>, state: Arc<HandshakeState>) -> Self {
        Self { shared, state }
    }
}

impl fmt::Debug for RevocationVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevocationVerifier")
            .field("hostname", &self.state.hostname)
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for RevocationVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, BackendError> {
        let inherited = match &self.shared.webpki {
            Some(verifier) => verifier
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map(|_| ()),
            None => Err(BackendError::InvalidCertificate(
                CertificateError::UnknownIssuer,
            )),
        };

        if let Err(err) = inherited {
            let name_mismatch = matches!(
                &err,
                BackendError::InvalidCertificate(
                    CertificateError::NotValidForName
                        | CertificateError::NotValidForNameContext { .. }
                )
            );
            if name_mismatch && !self.shared.config.check_hostname {
                debug!("ignoring server name mismatch, host name check is disabled");
            } else {
                return Err(err);
            }
        }

        // OCSP sub-handshakes must not re-enter the revocation pipeline
        if self.state.revocation_exempt || self.state.verifying_ocsp() {
            return Ok(ServerCertVerified::assertion());
        }

        let chain_len = 1 + intermediates.len();
        self.state.set_chain_size(chain_len);

        let run_pins = self.shared.config.hpkp_cache.is_some();
        let staple_present = self.shared.config.ocsp_stapling && !ocsp_response.is_empty();
        let run_live = self.shared.config.ocsp && !self.state.ocsp_checked();
        if !(run_pins || staple_present || run_live) {
            return Ok(ServerCertVerified::assertion());
        }

        let mut certs = Vec::with_capacity(chain_len);
        for der in std::iter::once(end_entity).chain(intermediates.iter()) {
            match parse_chain_cert(der.as_ref()) {
                Ok(cert) => certs.push(cert),
                Err(err) => {
                    error!("could not parse presented certificate: {err}");
                    return Err(BackendError::InvalidCertificate(
                        CertificateError::BadEncoding,
                    ));
                }
            }
        }

        if let Some(db) = &self.shared.config.hpkp_cache {
            let (verdict, pass) = check_chain_pins(db.as_ref(), &self.state.hostname, &certs);
            self.state.set_hpkp(verdict);
            if !pass {
                error!(
                    "public key pinning mismatch for host '{}'",
                    self.state.hostname
                );
                return Err(BackendError::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ));
            }
        }

        if self.shared.config.ocsp_stapling {
            if ocsp_response.is_empty() {
                debug!("no stapled OCSP response was received, continuing");
            } else {
                let peer_keys: Vec<Vec<u8>> =
                    certs.iter().map(|cert| cert.public_key.clone()).collect();
                let opts = ocsp::VerifyOpts {
                    check_time: self.shared.config.ocsp_date,
                    expected_nonce: None,
                    now: SystemTime::now(),
                };
                match ocsp::verify_ocsp_response(ocsp_response, &peer_keys, &opts) {
                    Ok(()) => debug!(
                        "got a stapled OCSP response, length {}, status ok",
                        ocsp_response.len()
                    ),
                    Err(err) => {
                        error!("could not verify stapled OCSP response: {err}");
                        return Err(BackendError::InvalidCertificate(
                            CertificateError::ApplicationVerificationFailure,
                        ));
                    }
                }
            }
        }

        // the stapled path above intentionally leaves the latch untouched;
        // live responder checks run in addition when both are configured
        if run_live {
            self.state.set_verifying_ocsp(true);
            let passed = run_blocking(ocsp::check_chain(
                &self.shared,
                &self.state.hostname,
                &certs,
            ));
            self.state.set_verifying_ocsp(false);
            self.state.set_ocsp_checked();
            if !passed {
                error!("certificate revoked by OCSP");
                return Err(BackendError::InvalidCertificate(CertificateError::Revoked));
            }
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, BackendError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.shared.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, BackendError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.shared.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.shared
            .provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Accepts any certificate. Installed when `check_certificate` is off.
#[derive(Debug)]
pub(crate) struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl InsecureVerifier {
    pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, BackendError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, BackendError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, BackendError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
