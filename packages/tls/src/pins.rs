//! Public key pinning checks against a pin database

use tracing::debug;

use crate::cert::ChainCert;
use crate::db::HpkpDb;

/// Outcome of looking up one public key in the pin database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinVerdict {
    /// The key is among the pins recorded for the host.
    Match,
    /// The database holds no pins for the host.
    #[default]
    NoPin,
    /// Pins exist for the host and this key is not among them.
    Mismatch,
    /// The lookup itself failed.
    Error,
}

impl PinVerdict {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            PinVerdict::Match => 0,
            PinVerdict::NoPin => 1,
            PinVerdict::Mismatch => 2,
            PinVerdict::Error => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => PinVerdict::Match,
            2 => PinVerdict::Mismatch,
            3 => PinVerdict::Error,
            _ => PinVerdict::NoPin,
        }
    }
}

/// Walks the presented chain against the pin database.
///
/// Any single matching key passes the whole chain. A missing pin for a
/// particular certificate is pass-like. The chain fails only when at least
/// one key mismatched and no certificate produced a pass-like outcome.
///
/// Returns the verdict to record in the handshake state and whether the
/// chain passed.
pub(crate) fn check_chain_pins(
    db: &dyn HpkpDb,
    hostname: &str,
    certs: &[ChainCert],
) -> (PinVerdict, bool) {
    let mut recorded = PinVerdict::NoPin;
    let mut pass_like = false;
    let mut mismatched = false;

    for cert in certs {
        let verdict = db.check(hostname, &cert.spki_der);
        recorded = verdict;
        match verdict {
            PinVerdict::Match => {
                debug!("matching public key pinning found for host '{hostname}'");
                return (verdict, true);
            }
            PinVerdict::NoPin => {
                debug!("no public key pinning found for host '{hostname}'");
                pass_like = true;
            }
            PinVerdict::Mismatch => {
                debug!("public key for host '{hostname}' does not match");
                mismatched = true;
            }
            PinVerdict::Error => {
                debug!("could not check public key pinning for host '{hostname}'");
            }
        }
    }

    (recorded, !(mismatched && !pass_like))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::cert::parse_chain_cert;

    /// Replays a scripted verdict per chain certificate, in order.
    struct ScriptedDb(Mutex<VecDeque<PinVerdict>>);

    impl ScriptedDb {
        fn new(verdicts: &[PinVerdict]) -> Self {
            Self(Mutex::new(verdicts.iter().copied().collect()))
        }
    }

    impl HpkpDb for ScriptedDb {
        fn check(&self, _host: &str, _spki_der: &[u8]) -> PinVerdict {
            self.0.lock().expect("lock").pop_front().unwrap_or(PinVerdict::Error)
        }
    }

    fn chain(len: usize) -> Vec<ChainCert> {
        (0..len)
            .map(|i| {
                let key = rcgen::KeyPair::generate().expect("key");
                let params =
                    rcgen::CertificateParams::new(vec![format!("cert{i}.example")]).expect("params");
                let cert = params.self_signed(&key).expect("cert");
                parse_chain_cert(cert.der()).expect("parse")
            })
            .collect()
    }

    #[test]
    fn first_match_passes_and_stops() {
        let db = ScriptedDb::new(&[PinVerdict::Match, PinVerdict::Mismatch]);
        let (recorded, pass) = check_chain_pins(&db, "example.org", &chain(2));
        assert_eq!(recorded, PinVerdict::Match);
        assert!(pass);
    }

    #[test]
    fn all_mismatches_fail() {
        let db = ScriptedDb::new(&[PinVerdict::Mismatch, PinVerdict::Mismatch]);
        let (recorded, pass) = check_chain_pins(&db, "example.org", &chain(2));
        assert_eq!(recorded, PinVerdict::Mismatch);
        assert!(!pass);
    }

    #[test]
    fn match_anywhere_in_the_chain_overrides_a_mismatch() {
        let db = ScriptedDb::new(&[PinVerdict::Mismatch, PinVerdict::Match]);
        let (recorded, pass) = check_chain_pins(&db, "example.org", &chain(2));
        assert_eq!(recorded, PinVerdict::Match);
        assert!(pass);
    }

    #[test]
    fn no_pins_anywhere_passes() {
        let db = ScriptedDb::new(&[PinVerdict::NoPin, PinVerdict::NoPin]);
        let (recorded, pass) = check_chain_pins(&db, "example.org", &chain(2));
        assert_eq!(recorded, PinVerdict::NoPin);
        assert!(pass);
    }

    #[test]
    fn lookup_errors_alone_do_not_fail() {
        let db = ScriptedDb::new(&[PinVerdict::Error, PinVerdict::Error]);
        let (_, pass) = check_chain_pins(&db, "example.org", &chain(2));
        assert!(pass);
    }

    #[test]
    fn verdict_encoding_round_trips() {
        for verdict in [
            PinVerdict::Match,
            PinVerdict::NoPin,
            PinVerdict::Mismatch,
            PinVerdict::Error,
        ] {
            assert_eq!(PinVerdict::from_u8(verdict.as_u8()), verdict);
        }
    }
}
