//! TLS client configuration loaded from PEM files.

use anyhow::{Context, Result};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, Error as TlsError, PrivateKey, RootCertStore, ServerName};
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Paths to the PEM material used for `--secure` connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl TlsFiles {
    pub fn has_client_identity(&self) -> bool {
        self.client_cert.is_some() && self.client_key.is_some()
    }
}

/// Build a rustls client config. Server certificates are accepted without
/// hostname or chain checks, matching how the broker fleet is deployed with
/// self-signed certificates.
pub fn build_tls_config(files: &TlsFiles) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    if let Some(ca_path) = &files.ca_cert {
        let ca_certs = load_certs(ca_path).context("parse CA certificates")?;
        let (added, _) = root_store.add_parsable_certificates(&ca_certs);
        if added == 0 {
            anyhow::bail!("no CA certificates loaded from {}", ca_path.display());
        }
    }

    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store);

    let mut config = match (&files.client_cert, &files.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let chain = load_certs(cert_path).context("parse client certificate chain")?;
            if chain.is_empty() {
                anyhow::bail!("no certificates found in {}", cert_path.display());
            }
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(chain, key)
                .context("build TLS client config")?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => anyhow::bail!("--client-cert and --client-key must be given together"),
    };

    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoHostnameVerifier));

    Ok(config)
}

/// Read a CA bundle as text, for backends that take PEM directly.
pub fn read_ca_pem(path: &Path) -> Result<String> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("read CA cert: {}", path.display()))?;
    let mut reader = Cursor::new(pem.as_bytes());
    let found = certs(&mut reader).context("parse CA certificates")?;
    if found.is_empty() {
        anyhow::bail!("no CA certificates loaded from {}", path.display());
    }
    Ok(pem)
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let reader = &mut BufReader::new(
        File::open(path).with_context(|| format!("open certificate: {}", path.display()))?,
    );
    let der = certs(reader)?;
    Ok(der.into_iter().map(Certificate).collect())
}

/// Load the first PKCS#8, RSA or SEC1 key found in `path`.
pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read key file: {}", path.display()))?;
    let mut cursor = Cursor::new(&bytes);

    if let Some(key) = pkcs8_private_keys(&mut cursor)
        .context("parse PKCS#8 private key")?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }

    cursor.set_position(0);
    if let Some(key) = rsa_private_keys(&mut cursor)
        .context("parse RSA private key")?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }

    cursor.set_position(0);
    if let Some(key) = ec_private_keys(&mut cursor)
        .context("parse EC private key")?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }

    anyhow::bail!("no supported private key found in {}", path.display());
}

struct NoHostnameVerifier;

impl ServerCertVerifier for NoHostnameVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}
