//! External database capabilities: OCSP verdict cache and pin store
//!
//! The engine consumes these through trait handles so applications can back
//! them with whatever persistence they run. The in-memory implementations
//! below provide the standalone behavior and double as test fixtures.

use std::fmt;
use std::time::SystemTime;

use dashmap::DashMap;

use crate::cert::parse_chain_cert;
use crate::error::TlsError;
use crate::pins::PinVerdict;

/// Cache of OCSP verdicts keyed by certificate fingerprint.
pub trait OcspDb: Send + Sync {
    /// Returns `Some(revoked)` when a live entry exists for the fingerprint.
    fn lookup(&self, fingerprint: &str) -> Option<bool>;
    /// Records a verdict. Later writes overwrite earlier ones.
    fn add(&self, fingerprint: &str, expiry: SystemTime, valid: bool);
}

/// Host-to-pinned-public-key store.
pub trait HpkpDb: Send + Sync {
    /// Checks a DER-encoded SubjectPublicKeyInfo against the pins recorded
    /// for `host`.
    fn check(&self, host: &str, spki_der: &[u8]) -> PinVerdict;
}

/// In-memory [`OcspDb`].
#[derive(Default)]
pub struct MemoryOcspDb {
    entries: DashMap<String, (bool, SystemTime)>,
}

impl MemoryOcspDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl OcspDb for MemoryOcspDb {
    fn lookup(&self, fingerprint: &str) -> Option<bool> {
        let revoked = {
            let entry = self.entries.get(fingerprint)?;
            let (revoked, expiry) = *entry;
            if expiry <= SystemTime::now() {
                None
            } else {
                Some(revoked)
            }
        };
        if revoked.is_none() {
            self.entries.remove(fingerprint);
        }
        revoked
    }

    fn add(&self, fingerprint: &str, expiry: SystemTime, valid: bool) {
        self.entries.insert(fingerprint.to_string(), (!valid, expiry));
    }
}

impl fmt::Debug for MemoryOcspDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryOcspDb")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// In-memory [`HpkpDb`] holding SHA-256 pins of SubjectPublicKeyInfo
/// structures, keyed by hostname.
#[derive(Default)]
pub struct MemoryHpkpDb {
    pins: DashMap<String, Vec<[u8; 32]>>,
}

impl MemoryHpkpDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a raw SHA-256 pin for a host.
    pub fn add_pin(&self, host: &str, pin: [u8; 32]) {
        let mut entry = self.pins.entry(host.to_string()).or_default();
        if !entry.contains(&pin) {
            entry.push(pin);
        }
    }

    /// Pins the given DER-encoded SubjectPublicKeyInfo for a host.
    pub fn pin_spki(&self, host: &str, spki_der: &[u8]) {
        self.add_pin(host, spki_digest(spki_der));
    }

    /// Pins the public key of a DER-encoded certificate for a host.
    pub fn pin_certificate(&self, host: &str, cert_der: &[u8]) -> Result<(), TlsError> {
        let cert = parse_chain_cert(cert_der)?;
        self.pin_spki(host, &cert.spki_der);
        Ok(())
    }
}

impl HpkpDb for MemoryHpkpDb {
    fn check(&self, host: &str, spki_der: &[u8]) -> PinVerdict {
        match self.pins.get(host) {
            None => PinVerdict::NoPin,
            Some(pins) => {
                if pins.contains(&spki_digest(spki_der)) {
                    PinVerdict::Match
                } else {
                    PinVerdict::Mismatch
                }
            }
        }
    }
}

impl fmt::Debug for MemoryHpkpDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHpkpDb")
            .field("hosts", &self.pins.len())
            .finish()
    }
}

fn spki_digest(spki_der: &[u8]) -> [u8; 32] {
    let digest = ring::digest::digest(&ring::digest::SHA256, spki_der);
    let mut pin = [0u8; 32];
    pin.copy_from_slice(digest.as_ref());
    pin
}
