use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

/// Make sure a certificate and key exist at the configured paths, generating
/// a self-signed pair if either file is missing.
pub fn ensure_certificate(cert_path: &Path, key_path: &Path) -> Result<()> {
    if cert_path.exists() && key_path.exists() {
        return Ok(());
    }
    info!(
        cert = %cert_path.display(),
        "TLS certificate or key missing, generating self-signed certificate"
    );
    let (cert_pem, key_pem) = generate_self_signed()?;

    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    write_file(cert_path, cert_pem.as_bytes(), 0o644)?;
    write_file(key_path, key_pem.as_bytes(), 0o600)?;
    Ok(())
}

fn write_file(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Self-signed certificate for this host, localhost and the loopback
/// addresses. Returns `(cert_pem, key_pem)`.
fn generate_self_signed() -> Result<(String, String)> {
    let mut names = vec!["localhost".to_string()];
    if let Ok(raw) = nix::unistd::gethostname()
        && let Some(host) = raw.to_str()
        && !host.is_empty()
        && host != "localhost"
    {
        names.push(host.to_string());
    }

    let mut params =
        CertificateParams::new(names).context("Failed to create certificate params")?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(std::net::IpAddr::V4(
            std::net::Ipv4Addr::LOCALHOST,
        )));
    params
        .subject_alt_names
        .push(SanType::IpAddress(std::net::IpAddr::V6(
            std::net::Ipv6Addr::LOCALHOST,
        )));

    let key_pair = KeyPair::generate().context("Failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to generate self-signed certificate")?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Build a rustls server config from PEM files on disk.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read TLS cert: {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("Failed to read TLS key: {}", key_path.display()))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificate PEM")?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in {}", cert_path.display());
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("Failed to parse TLS private key PEM")?
        .context("No private key found in PEM file")?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;
    info!(cert = %cert_path.display(), "Loaded TLS certificate");
    Ok(config)
}

pub fn make_acceptor(config: ServerConfig) -> tokio_rustls::TlsAcceptor {
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}
