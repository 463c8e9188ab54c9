//! OCSP (Online Certificate Status Protocol) client
//!
//! Builds requests for each certificate/issuer pair of a presented chain,
//! POSTs them through the external HTTP capability, verifies the responses
//! (signature, status, freshness, nonce) and caches definitive verdicts in
//! the OCSP database keyed by certificate fingerprint.

use std::fmt;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode};
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Method};
use rand::Rng;
use tracing::{debug, error, warn};
use url::Url;
use x509_cert::ext::Extension;
use x509_cert::ext::pkix::CrlReason;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_ocsp::{
    BasicOcspResponse, CertId, CertStatus, OcspRequest, OcspResponse, OcspResponseStatus, Request,
    TbsRequest, Version,
};

use crate::cert::{ChainCert, fingerprint_hex};
use crate::engine::EngineShared;
use crate::error::TlsError;
use crate::stats::OcspStats;

const OID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
const OID_OCSP_NONCE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1.2");

/// Redirect budget for responder queries.
pub const OCSP_MAX_REDIRECTS: usize = 5;

/// Definitive verdicts stay cached for one hour.
const OCSP_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Responses older than this are rejected when freshness checking is on.
const MAX_RESPONSE_AGE: Duration = Duration::from_secs(3 * 24 * 3600);

/// HTTP request handed to the external transport capability.
#[derive(Debug, Clone)]
pub struct OcspHttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The transport follows at most this many redirects.
    pub max_redirects: usize,
}

/// What the transport capability returns.
#[derive(Debug, Clone)]
pub struct OcspHttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// External HTTP capability used to reach OCSP responders.
///
/// Implementations must not run revocation checks on connections they open
/// for these requests; a transport that dials HTTPS through this engine
/// opens its connections with `ConnectOptions::revocation_exempt`.
pub trait OcspTransport: Send + Sync {
    fn execute(&self, request: OcspHttpRequest) -> BoxFuture<'_, Result<OcspHttpResponse, TlsError>>;
}

/// SHA-256 fingerprint of a DER-encoded certificate as 64 lowercase hex
/// characters; the OCSP cache key.
pub fn certificate_fingerprint(der: &[u8]) -> String {
    fingerprint_hex(der)
}

/// Why an OCSP response was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OcspVerifyError {
    Malformed(String),
    BadStatus(&'static str),
    MissingResponseBytes,
    BadSignature,
    Revoked(&'static str),
    UnknownStatus,
    Stale,
    NonceMismatch,
}

impl fmt::Display for OcspVerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcspVerifyError::Malformed(detail) => {
                write!(f, "could not parse OCSP response: {detail}")
            }
            OcspVerifyError::BadStatus(name) => write!(f, "unsuccessful OCSP response: {name}"),
            OcspVerifyError::MissingResponseBytes => {
                write!(f, "no response bytes in OCSP response")
            }
            OcspVerifyError::BadSignature => {
                write!(f, "could not verify OCSP response signature")
            }
            OcspVerifyError::Revoked(reason) => {
                write!(f, "certificate revoked (reason: {reason})")
            }
            OcspVerifyError::UnknownStatus => write!(f, "certificate status unknown"),
            OcspVerifyError::Stale => write!(f, "OCSP response is too old"),
            OcspVerifyError::NonceMismatch => write!(f, "OCSP nonce does not match"),
        }
    }
}

pub(crate) struct VerifyOpts {
    pub(crate) check_time: bool,
    pub(crate) expected_nonce: Option<Vec<u8>>,
    pub(crate) now: SystemTime,
}

/// Serializes an OCSP request for (subject, issuer). The CertID hashes the
/// issuer's subject name and public key with SHA-256.
pub(crate) fn build_ocsp_request(
    subject: &ChainCert,
    issuer: &ChainCert,
    nonce: Option<&[u8]>,
) -> Result<Vec<u8>, TlsError> {
    let issuer_name_hash = ring::digest::digest(&ring::digest::SHA256, &issuer.subject_der);
    let issuer_key_hash = ring::digest::digest(&ring::digest::SHA256, &issuer.public_key);

    let serial = SerialNumber::new(&subject.serial)
        .map_err(|e| TlsError::Unknown(format!("invalid serial number: {e}")))?;

    let cert_id = CertId {
        hash_algorithm: AlgorithmIdentifierOwned {
            oid: OID_SHA256,
            parameters: None,
        },
        issuer_name_hash: OctetString::new(issuer_name_hash.as_ref())
            .map_err(|e| TlsError::Unknown(format!("failed to create issuer name hash: {e}")))?,
        issuer_key_hash: OctetString::new(issuer_key_hash.as_ref())
            .map_err(|e| TlsError::Unknown(format!("failed to create issuer key hash: {e}")))?,
        serial_number: serial,
    };

    let request_extensions = match nonce {
        Some(nonce) => Some(vec![nonce_extension(nonce)?]),
        None => None,
    };

    let request = OcspRequest {
        tbs_request: TbsRequest {
            version: Version::V1,
            requestor_name: None,
            request_list: vec![Request {
                req_cert: cert_id,
                single_request_extensions: None,
            }],
            request_extensions,
        },
        optional_signature: None,
    };

    request
        .to_der()
        .map_err(|e| TlsError::Unknown(format!("failed to encode OCSP request: {e}")))
}

fn nonce_extension(nonce: &[u8]) -> Result<Extension, TlsError> {
    // the extension value carries a DER OCTET STRING of the nonce bytes
    let inner = OctetString::new(nonce)
        .and_then(|wrapped| wrapped.to_der())
        .map_err(|e| TlsError::Unknown(format!("failed to encode OCSP nonce: {e}")))?;
    Ok(Extension {
        extn_id: OID_OCSP_NONCE,
        critical: false,
        extn_value: OctetString::new(inner)
            .map_err(|e| TlsError::Unknown(format!("failed to encode OCSP nonce: {e}")))?,
    })
}

pub(crate) fn generate_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; 16];
    rand::rng().fill(&mut nonce[..]);
    nonce
}

/// Parses and verifies a DER-encoded OCSP response (the stapled path).
pub(crate) fn verify_ocsp_response(
    der: &[u8],
    peer_keys: &[Vec<u8>],
    opts: &VerifyOpts,
) -> Result<(), OcspVerifyError> {
    let response =
        OcspResponse::from_der(der).map_err(|e| OcspVerifyError::Malformed(e.to_string()))?;
    verify_decoded(&response, peer_keys, opts)
}

/// Verifies a decoded OCSP response: successful status, signature against
/// the embedded or presented certificates, a good verdict at index 0,
/// freshness, and the request nonce.
pub(crate) fn verify_decoded(
    response: &OcspResponse,
    peer_keys: &[Vec<u8>],
    opts: &VerifyOpts,
) -> Result<(), OcspVerifyError> {
    if response.response_status != OcspResponseStatus::Successful {
        return Err(OcspVerifyError::BadStatus(response_status_name(
            &response.response_status,
        )));
    }

    let response_bytes = response
        .response_bytes
        .as_ref()
        .ok_or(OcspVerifyError::MissingResponseBytes)?;
    let basic = BasicOcspResponse::from_der(response_bytes.response.as_bytes())
        .map_err(|e| OcspVerifyError::Malformed(e.to_string()))?;

    verify_signature(&basic, peer_keys)?;

    let single = basic
        .tbs_response_data
        .responses
        .first()
        .ok_or_else(|| OcspVerifyError::Malformed("no single response".to_string()))?;

    match &single.cert_status {
        CertStatus::Good(_) => debug!("OCSP cert status: good"),
        CertStatus::Revoked(info) => {
            let reason = revocation_reason_name(info.revocation_reason);
            debug!("OCSP cert status: revoked, reason: {reason}");
            return Err(OcspVerifyError::Revoked(reason));
        }
        CertStatus::Unknown(_) => {
            debug!("OCSP cert status: unknown");
            return Err(OcspVerifyError::UnknownStatus);
        }
    }

    if opts.check_time {
        let this_update = SystemTime::UNIX_EPOCH + single.this_update.0.to_unix_duration();
        if response_is_stale(this_update, opts.now) {
            return Err(OcspVerifyError::Stale);
        }
    }

    if let Some(expected) = &opts.expected_nonce
        && let Some(ext) = basic
            .tbs_response_data
            .response_extensions
            .as_ref()
            .and_then(|exts| exts.iter().find(|ext| ext.extn_id == OID_OCSP_NONCE))
        && !nonce_matches(ext.extn_value.as_bytes(), expected)
    {
        // a response without the extension is tolerated; a different nonce
        // is not
        return Err(OcspVerifyError::NonceMismatch);
    }

    Ok(())
}

fn verify_signature(basic: &BasicOcspResponse, peer_keys: &[Vec<u8>]) -> Result<(), OcspVerifyError> {
    let message = basic
        .tbs_response_data
        .to_der()
        .map_err(|e| OcspVerifyError::Malformed(e.to_string()))?;
    let signature = basic
        .signature
        .as_bytes()
        .ok_or(OcspVerifyError::BadSignature)?;
    let Some(algorithms) = verification_algorithms(&basic.signature_algorithm.oid) else {
        warn!(
            "unsupported OCSP signature algorithm {}",
            basic.signature_algorithm.oid
        );
        return Err(OcspVerifyError::BadSignature);
    };

    let mut candidates: Vec<Vec<u8>> = Vec::new();
    if let Some(certs) = &basic.certs {
        for cert in certs {
            if let Some(key) = cert
                .tbs_certificate
                .subject_public_key_info
                .subject_public_key
                .as_bytes()
            {
                candidates.push(key.to_vec());
            }
        }
    }
    candidates.extend(peer_keys.iter().cloned());

    for key in &candidates {
        for algorithm in algorithms {
            if ring::signature::UnparsedPublicKey::new(*algorithm, key)
                .verify(&message, signature)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
    Err(OcspVerifyError::BadSignature)
}

fn verification_algorithms(
    oid: &ObjectIdentifier,
) -> Option<&'static [&'static dyn ring::signature::VerificationAlgorithm]> {
    use ring::signature as sig;
    static RSA_SHA256: [&dyn sig::VerificationAlgorithm; 1] = [&sig::RSA_PKCS1_2048_8192_SHA256];
    static RSA_SHA384: [&dyn sig::VerificationAlgorithm; 1] = [&sig::RSA_PKCS1_2048_8192_SHA384];
    static RSA_SHA512: [&dyn sig::VerificationAlgorithm; 1] = [&sig::RSA_PKCS1_2048_8192_SHA512];
    static ECDSA_SHA256: [&dyn sig::VerificationAlgorithm; 1] = [&sig::ECDSA_P256_SHA256_ASN1];
    static ECDSA_SHA384: [&dyn sig::VerificationAlgorithm; 1] = [&sig::ECDSA_P384_SHA384_ASN1];
    static ED25519: [&dyn sig::VerificationAlgorithm; 1] = [&sig::ED25519];

    match oid.to_string().as_str() {
        "1.2.840.113549.1.1.11" => Some(&RSA_SHA256),
        "1.2.840.113549.1.1.12" => Some(&RSA_SHA384),
        "1.2.840.113549.1.1.13" => Some(&RSA_SHA512),
        "1.2.840.10045.4.3.2" => Some(&ECDSA_SHA256),
        "1.2.840.10045.4.3.3" => Some(&ECDSA_SHA384),
        "1.3.101.112" => Some(&ED25519),
        _ => None,
    }
}

fn nonce_matches(found: &[u8], expected: &[u8]) -> bool {
    if found == expected {
        return true;
    }
    // responders differ on whether the inner OCTET STRING wrapper is echoed
    OctetString::new(expected)
        .and_then(|wrapped| wrapped.to_der())
        .map(|wrapped| wrapped == found)
        .unwrap_or(false)
}

/// A response whose thisUpdate lies 3 or more days in the past is stale.
pub(crate) fn response_is_stale(this_update: SystemTime, now: SystemTime) -> bool {
    match now.duration_since(this_update) {
        Ok(age) => age >= MAX_RESPONSE_AGE,
        Err(_) => false,
    }
}

pub(crate) fn response_status_name(status: &OcspResponseStatus) -> &'static str {
    match status {
        OcspResponseStatus::Successful => "successful",
        OcspResponseStatus::MalformedRequest => "malformed request",
        OcspResponseStatus::InternalError => "internal error",
        OcspResponseStatus::TryLater => "try later",
        OcspResponseStatus::SigRequired => "signature required",
        OcspResponseStatus::Unauthorized => "unauthorized",
        _ => "unknown status code",
    }
}

pub(crate) fn revocation_reason_name(reason: Option<CrlReason>) -> &'static str {
    match reason {
        None => "not given",
        Some(CrlReason::Unspecified) => "unspecified",
        Some(CrlReason::KeyCompromise) => "key compromise",
        Some(CrlReason::CaCompromise) => "CA compromise",
        Some(CrlReason::AffiliationChanged) => "affiliation changed",
        Some(CrlReason::Superseded) => "superseded",
        Some(CrlReason::CessationOfOperation) => "cessation of operation",
        Some(CrlReason::CertificateHold) => "certificate hold",
        Some(CrlReason::RemoveFromCRL) => "remove from CRL",
        Some(CrlReason::PrivilegeWithdrawn) => "privilege withdrawn",
        Some(CrlReason::AaCompromise) => "AA compromise",
        Some(_) => "unknown reason",
    }
}

enum ResponderVerdict {
    Good,
    Rejected,
    Unreachable,
}

/// Walks the chain pairwise and checks each certificate against the cache
/// or its responder. Fires the OCSP stats callback afterwards. The chain
/// passes iff nothing was found revoked.
pub(crate) async fn check_chain(
    shared: &EngineShared,
    hostname: &str,
    certs: &[ChainCert],
) -> bool {
    let mut nvalid = 0usize;
    let mut nrevoked = 0usize;
    let mut nignored = 0usize;

    for pair in certs.windows(2) {
        let (cert, issuer) = (&pair[0], &pair[1]);
        let fingerprint = fingerprint_hex(&cert.der);

        if let Some(cache) = &shared.config.ocsp_cert_cache
            && let Some(revoked) = cache.lookup(&fingerprint)
        {
            if revoked {
                debug!("certificate {fingerprint} has been revoked (cached response)");
                nrevoked += 1;
            } else {
                debug!("certificate {fingerprint} is valid (cached response)");
                nvalid += 1;
            }
            continue;
        }

        let Some(uri) = shared
            .config
            .ocsp_server
            .clone()
            .or_else(|| cert.ocsp_uri.clone())
        else {
            debug!("OCSP URI not given and not found in certificate, skipping OCSP check");
            nignored += 1;
            continue;
        };

        debug!("contacting OCSP server at {uri}");
        match query_responder(shared, &uri, cert, issuer, certs).await {
            ResponderVerdict::Good => {
                nvalid += 1;
                if let Some(cache) = &shared.config.ocsp_cert_cache {
                    cache.add(&fingerprint, SystemTime::now() + OCSP_CACHE_TTL, true);
                }
            }
            ResponderVerdict::Rejected => {
                nrevoked += 1;
                if let Some(cache) = &shared.config.ocsp_cert_cache {
                    cache.add(&fingerprint, SystemTime::now() + OCSP_CACHE_TTL, false);
                }
            }
            ResponderVerdict::Unreachable => {}
        }
    }

    if let Some(callback) = &shared.config.ocsp_stats {
        callback(&OcspStats {
            hostname: hostname.to_string(),
            nvalid,
            nrevoked,
            nignored,
            stapling: false,
        });
    }

    nrevoked == 0
}

async fn query_responder(
    shared: &EngineShared,
    uri: &str,
    cert: &ChainCert,
    issuer: &ChainCert,
    chain: &[ChainCert],
) -> ResponderVerdict {
    let Some(transport) = &shared.config.ocsp_transport else {
        warn!("no OCSP transport configured, skipping responder query");
        return ResponderVerdict::Unreachable;
    };

    let url = match Url::parse(uri) {
        Ok(url) => url,
        Err(err) => {
            warn!("invalid OCSP URI '{uri}': {err}");
            return ResponderVerdict::Unreachable;
        }
    };

    let nonce = shared.config.ocsp_nonce.then(generate_nonce);
    let body = match build_ocsp_request(cert, issuer, nonce.as_deref()) {
        Ok(body) => body,
        Err(err) => {
            warn!("could not build OCSP request: {err}");
            return ResponderVerdict::Unreachable;
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(http::header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/ocsp-request"),
    );
    headers.insert(
        http::header::ACCEPT,
        HeaderValue::from_static("application/ocsp-response"),
    );

    let request = OcspHttpRequest {
        method: Method::POST,
        url,
        headers,
        body: Bytes::from(body),
        max_redirects: OCSP_MAX_REDIRECTS,
    };

    let response = match transport.execute(request).await {
        Ok(response) => response,
        Err(err) => {
            warn!("OCSP query failed for {uri}: {err}");
            return ResponderVerdict::Unreachable;
        }
    };
    if !(200..300).contains(&response.status) {
        warn!("OCSP responder at {uri} answered with status {}", response.status);
        return ResponderVerdict::Unreachable;
    }

    let decoded = match OcspResponse::from_der(&response.body) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!("could not decode OCSP response from {uri}: {err}");
            return ResponderVerdict::Unreachable;
        }
    };

    let peer_keys: Vec<Vec<u8>> = chain.iter().map(|c| c.public_key.clone()).collect();
    let opts = VerifyOpts {
        check_time: shared.config.ocsp_date,
        expected_nonce: nonce,
        now: SystemTime::now(),
    };
    match verify_decoded(&decoded, &peer_keys, &opts) {
        Ok(()) => ResponderVerdict::Good,
        Err(err) => {
            error!("OCSP verification failed: {err}");
            ResponderVerdict::Rejected
        }
    }
}
