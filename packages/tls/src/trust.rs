//! Trust material loading: CA directories, CA files and CRLs

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer};
use tracing::{debug, error, info, warn};

use crate::config::{CertFormat, TlsConfig};
use crate::error::TlsError;

const SYSTEM_FALLBACK_DIR: &str = "/etc/ssl/certs";

/// Fills the root store from `ca_directory` and `ca_file`. Returns the
/// number of sources loaded from the directory. Zero is not fatal here;
/// chains will simply fail verification later.
pub(crate) fn load_trust_material(roots: &mut RootCertStore, config: &TlsConfig) -> usize {
    let mut loaded = 0;

    if !config.ca_directory.is_empty() {
        loaded = if config.ca_directory == "system" {
            load_system_roots(roots)
        } else {
            load_directory(roots, Path::new(&config.ca_directory))
        };
    }

    if let Some(ca_file) = &config.ca_file {
        match load_cert_file(roots, Path::new(ca_file), config.ca_type) {
            Ok(count) => debug!("loaded {count} certificates from '{ca_file}'"),
            Err(err) => warn!("could not load CA certificate from file '{ca_file}': {err}"),
        }
    }

    loaded
}

/// Loads the platform's default trust anchors, falling back to scanning
/// `/etc/ssl/certs` when nothing could be loaded.
fn load_system_roots(roots: &mut RootCertStore) -> usize {
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        warn!("certificate load error: {err}");
    }

    let mut added = 0;
    for cert in result.certs {
        match roots.add(cert) {
            Ok(()) => added += 1,
            Err(err) => warn!("failed to add system certificate: {err}"),
        }
    }

    if added > 0 {
        debug!("loaded {added} system certificates");
        return added;
    }

    info!("could not load certificates from default paths, falling back to '{SYSTEM_FALLBACK_DIR}'");
    load_directory(roots, Path::new(SYSTEM_FALLBACK_DIR))
}

/// Scans a directory for `.pem` files (case-insensitive, dot files skipped)
/// and loads each as a verify location. Returns the number of files that
/// contributed at least one certificate.
pub(crate) fn load_directory(roots: &mut RootCertStore, dir: &Path) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            error!(
                "could not open directory '{}', no certificates were loaded: {err}",
                dir.display()
            );
            return 0;
        }
    };

    let mut loaded = 0;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        if !name.to_ascii_lowercase().ends_with(".pem") {
            continue;
        }
        match load_pem_certs(roots, &entry.path()) {
            Ok(count) if count > 0 => loaded += 1,
            Ok(_) => {}
            Err(err) => debug!("skipping '{}': {err}", entry.path().display()),
        }
    }

    if loaded == 0 {
        error!(
            "no certificates could be loaded from directory '{}'",
            dir.display()
        );
    } else {
        debug!("loaded {loaded} certificates from '{}'", dir.display());
    }
    loaded
}

fn load_pem_certs(roots: &mut RootCertStore, path: &Path) -> std::io::Result<usize> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert?;
        if roots.add(cert).is_ok() {
            added += 1;
        }
    }
    Ok(added)
}

fn load_cert_file(
    roots: &mut RootCertStore,
    path: &Path,
    format: CertFormat,
) -> Result<usize, TlsError> {
    match format {
        CertFormat::Pem => {
            load_pem_certs(roots, path).map_err(|e| TlsError::Unknown(e.to_string()))
        }
        CertFormat::Der => {
            let bytes = std::fs::read(path).map_err(|e| TlsError::Unknown(e.to_string()))?;
            roots
                .add(CertificateDer::from(bytes))
                .map_err(|e| TlsError::Unknown(e.to_string()))?;
            Ok(1)
        }
    }
}

/// Loads revocation lists from a CRL file, PEM first with a DER fallback.
/// Failing to load a configured CRL file is fatal to engine construction.
pub(crate) fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>, TlsError> {
    let bytes = std::fs::read(path).map_err(|e| {
        TlsError::Unknown(format!("could not load CRL from '{}': {e}", path.display()))
    })?;

    if bytes.starts_with(b"-----BEGIN") {
        let mut reader = BufReader::new(bytes.as_slice());
        let crls: Vec<_> = rustls_pemfile::crls(&mut reader)
            .collect::<Result<_, _>>()
            .map_err(|e| {
                TlsError::Unknown(format!("could not load CRL from '{}': {e}", path.display()))
            })?;
        if crls.is_empty() {
            return Err(TlsError::Unknown(format!(
                "no revocation list found in '{}'",
                path.display()
            )));
        }
        Ok(crls)
    } else {
        Ok(vec![CertificateRevocationListDer::from(bytes)])
    }
}
