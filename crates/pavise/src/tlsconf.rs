//! TLS configuration from the certificate directory layout.
//!
//! The listener certificate lives in `ssl_certificate_dir` as
//! `ssl_crt.pem` + `ssl_key.pem`.  A `ssl_crt.pwd` file marks an
//! encrypted key, which the TLS backend cannot decrypt; `ssl_dh.pem` is
//! tolerated but meaningless here (the backend picks its own key
//! exchange).  Upstream verification roots come from `ssl_cacert_dir`, a
//! directory of PEM files, falling back to the bundled web PKI roots.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::{debug, warn};

/// Load the listener's TLS configuration.
///
/// `Ok(None)` when the directory (or the certificate pair) is absent:
/// the listener then simply cannot unwrap TLS clients.
pub(crate) fn load_server_config(dir: Option<&Path>) -> Result<Option<Arc<ServerConfig>>> {
    let Some(dir) = dir else {
        return Ok(None);
    };
    let cert_path = dir.join("ssl_crt.pem");
    let key_path = dir.join("ssl_key.pem");
    if !cert_path.exists() || !key_path.exists() {
        debug!("no certificate pair under {}; TLS disabled", dir.display());
        return Ok(None);
    }
    if dir.join("ssl_crt.pwd").exists() {
        bail!(
            "{} exists but password-protected keys are not supported; \
             store ssl_key.pem unencrypted",
            dir.join("ssl_crt.pwd").display()
        );
    }

    let certs = read_certs(&cert_path)?;
    if certs.is_empty() {
        bail!("no certificates in {}", cert_path.display());
    }
    let key = read_key(&key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .with_context(|| format!("bad certificate/key pair in {}", dir.display()))?;
    Ok(Some(Arc::new(config)))
}

/// Build the client-side TLS configuration used toward upstream proxies.
pub(crate) fn client_config(cacert_dir: Option<&Path>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();

    match cacert_dir {
        Some(dir) if dir.is_dir() => {
            for entry in std::fs::read_dir(dir)
                .with_context(|| format!("cannot read {}", dir.display()))?
            {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                match read_certs(&path) {
                    Ok(certs) => {
                        let (added, _) = roots.add_parsable_certificates(certs);
                        debug!("loaded {} roots from {}", added, path.display());
                    }
                    Err(e) => warn!("skipping {}: {}", path.display(), e),
                }
            }
            if roots.is_empty() {
                bail!("no usable CA certificates in {}", dir.display());
            }
        }
        _ => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    Ok(Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}

/// Read all certificates from a PEM file.
fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
    );
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("cannot parse {}", path.display()))
}

/// Read the first private key from a PEM file.
fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("cannot parse {}", path.display()))?
        .with_context(|| format!("no private key in {}", path.display()))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn missing_dir_means_no_tls() {
        assert!(load_server_config(None).unwrap().is_none());
        let dir = tempfile::tempdir().unwrap();
        assert!(load_server_config(Some(dir.path())).unwrap().is_none());
    }

    #[test]
    fn password_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ssl_crt.pem"), "x").unwrap();
        std::fs::write(dir.path().join("ssl_key.pem"), "x").unwrap();
        std::fs::write(dir.path().join("ssl_crt.pwd"), "secret").unwrap();
        assert!(load_server_config(Some(dir.path())).is_err());
    }

    #[test]
    fn default_client_roots_load() {
        let config = client_config(None).unwrap();
        // The web PKI bundle is definitely not empty.
        drop(config);
    }
}
