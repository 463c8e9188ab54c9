//! Chain-side certificate parsing for the revocation pipeline

use der::asn1::ObjectIdentifier;
use der::{Decode, Encode, Tag, TagNumber, Tagged};
use x509_cert::Certificate;

use crate::error::TlsError;

const OID_AUTHORITY_INFO_ACCESS: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.1");
const OID_AD_OCSP: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1");

/// The parts of a presented certificate the revocation pipeline needs:
/// identifiers for CertID construction, the SPKI for pinning, and the OCSP
/// responder location.
#[derive(Debug, Clone)]
pub(crate) struct ChainCert {
    /// Raw DER encoding, the fingerprint input.
    pub(crate) der: Vec<u8>,
    pub(crate) serial: Vec<u8>,
    /// DER-encoded subject Name.
    pub(crate) subject_der: Vec<u8>,
    /// DER-encoded SubjectPublicKeyInfo.
    pub(crate) spki_der: Vec<u8>,
    /// Contents of the public key BIT STRING.
    pub(crate) public_key: Vec<u8>,
    /// First OCSP URI from the authorityInfoAccess extension.
    pub(crate) ocsp_uri: Option<String>,
}

pub(crate) fn parse_chain_cert(der_bytes: &[u8]) -> Result<ChainCert, TlsError> {
    let cert = Certificate::from_der(der_bytes)
        .map_err(|e| TlsError::Certificate(format!("X.509 parsing failed: {e}")))?;
    let tbs = &cert.tbs_certificate;

    let subject_der = tbs
        .subject
        .to_der()
        .map_err(|e| TlsError::Certificate(format!("failed to encode subject: {e}")))?;
    let spki_der = tbs
        .subject_public_key_info
        .to_der()
        .map_err(|e| TlsError::Certificate(format!("failed to encode public key: {e}")))?;
    let public_key = tbs
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| TlsError::Certificate("public key has unused bits".to_string()))?
        .to_vec();

    let ocsp_uri = tbs.extensions.as_ref().and_then(|exts| {
        exts.iter()
            .find(|ext| ext.extn_id == OID_AUTHORITY_INFO_ACCESS)
            .and_then(|ext| parse_ocsp_uri(ext.extn_value.as_bytes()))
    });

    Ok(ChainCert {
        der: der_bytes.to_vec(),
        serial: tbs.serial_number.as_bytes().to_vec(),
        subject_der,
        spki_der,
        public_key,
        ocsp_uri,
    })
}

/// Extracts the first OCSP responder URI from an authorityInfoAccess
/// extension body (a SEQUENCE OF AccessDescription).
fn parse_ocsp_uri(extension_bytes: &[u8]) -> Option<String> {
    #[derive(der::Sequence)]
    struct AccessDescription {
        access_method: ObjectIdentifier,
        access_location: der::Any,
    }

    let descriptions = Vec::<AccessDescription>::from_der(extension_bytes).ok()?;
    for description in descriptions {
        if description.access_method != OID_AD_OCSP {
            continue;
        }
        // uniformResourceIdentifier [6] IMPLICIT IA5String
        let uri_tag = Tag::ContextSpecific {
            constructed: false,
            number: TagNumber::N6,
        };
        if description.access_location.tag() != uri_tag {
            continue;
        }
        if let Ok(uri) = std::str::from_utf8(description.access_location.value())
            && (uri.starts_with("http://") || uri.starts_with("https://"))
        {
            return Some(uri.to_string());
        }
    }
    None
}

/// SHA-256 over the DER-encoded certificate, as lowercase hex.
pub(crate) fn fingerprint_hex(der_bytes: &[u8]) -> String {
    hex::encode(ring::digest::digest(&ring::digest::SHA256, der_bytes).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_der() -> Vec<u8> {
        let key = rcgen::KeyPair::generate().expect("key");
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).expect("params");
        params.self_signed(&key).expect("cert").der().to_vec()
    }

    #[test]
    fn fingerprint_is_64_lowercase_hex_chars_and_deterministic() {
        let der = leaf_der();
        let fp = fingerprint_hex(&der);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(fp, fingerprint_hex(&der));
        assert_ne!(fp, fingerprint_hex(b"other input"));
    }

    #[test]
    fn parses_identifiers_from_a_real_certificate() {
        let der = leaf_der();
        let cert = parse_chain_cert(&der).expect("parse");
        assert!(!cert.serial.is_empty());
        assert!(!cert.subject_der.is_empty());
        assert!(!cert.spki_der.is_empty());
        assert!(!cert.public_key.is_empty());
        // SPKI wraps the public key bit string
        assert!(cert.spki_der.len() > cert.public_key.len());
        assert!(cert.ocsp_uri.is_none());
    }

    #[test]
    fn extracts_ocsp_uri_from_authority_info_access() {
        // SEQUENCE { SEQUENCE { id-ad-ocsp, [6] "http://ocsp.test" } }
        let mut aia = vec![
            0x30, 0x1e, 0x30, 0x1c, 0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01,
            0x86, 0x10,
        ];
        aia.extend_from_slice(b"http://ocsp.test");
        assert_eq!(parse_ocsp_uri(&aia), Some("http://ocsp.test".to_string()));
    }

    #[test]
    fn garbage_extension_yields_no_uri() {
        assert_eq!(parse_ocsp_uri(b"not der"), None);
    }
}
