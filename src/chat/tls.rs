//! TLS material for the relay.
//!
//! On first run a self-signed certificate for `localhost` is generated and
//! written as PEM next to its key; later runs load the same files. Clients
//! trust the server by pinning that certificate as their only root.

use anyhow::{Context, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Host name the generated certificate is issued for
pub const CERT_HOST: &str = "localhost";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Generate a self-signed certificate unless both files already exist
///
/// Returns whether new material was written.
pub fn ensure_certificate(cert_path: &Path, key_path: &Path) -> Result<bool> {
    if cert_path.exists() && key_path.exists() {
        return Ok(false);
    }

    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create TLS directory {:?}", parent))?;
        }
    }

    let certified = rcgen::generate_simple_self_signed(vec![CERT_HOST.to_string()])
        .context("Failed to generate self-signed certificate")?;

    fs::write(cert_path, certified.cert.pem())
        .with_context(|| format!("Failed to write certificate {:?}", cert_path))?;
    fs::write(key_path, certified.key_pair.serialize_pem())
        .with_context(|| format!("Failed to write private key {:?}", key_path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))
            .context("Failed to restrict private key permissions")?;
    }

    Ok(true)
}

/// Read every certificate from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path).with_context(|| format!("Failed to read certificate {:?}", path))?;

    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;

    if certs.is_empty() {
        anyhow::bail!("No certificate found in {:?}", path);
    }
    Ok(certs)
}

/// Read the first private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).with_context(|| format!("Failed to read private key {:?}", path))?;

    rustls_pemfile::private_key(&mut &pem[..])
        .context("Failed to parse private key")?
        .with_context(|| format!("No private key found in {:?}", path))
}

/// Server-side TLS configuration from PEM files
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("Unsupported TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS certificate or key")?;

    Ok(Arc::new(config))
}

/// Acceptor wrapping accepted TCP streams in TLS
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(server_config(cert_path, key_path)?))
}

/// Client configuration trusting only the certificates in `ca_path`
pub fn client_config(ca_path: &Path) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(cert).context("Failed to trust server certificate")?;
    }

    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("Unsupported TLS protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Connector for clients pinning the server certificate
pub fn connector(ca_path: &Path) -> Result<TlsConnector> {
    Ok(TlsConnector::from(client_config(ca_path)?))
}

/// Parse the name the server certificate is checked against
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).with_context(|| format!("Invalid server name {}", host))
}
