use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;
use tracing::info;

use crate::config::{Config, TlsFiles};

/// Acceptor for the configured certificate pair, or `None` for plaintext.
pub fn acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    let Some(files) = &config.tls else {
        return Ok(None);
    };
    let server_config = server_config(files)?;
    info!("TLS certificate loaded from {}", files.cert.display());
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

fn server_config(files: &TlsFiles) -> io::Result<ServerConfig> {
    let certs = rustls_pemfile::certs(&mut open(&files.cert)?).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(invalid(format!("no certificates in {}", files.cert.display())));
    }
    let key = rustls_pemfile::private_key(&mut open(&files.key)?)?
        .ok_or_else(|| invalid(format!("no private key in {}", files.key.display())))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| invalid(format!("{}: {e}", files.cert.display())))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];
    Ok(config)
}

fn open(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

fn invalid(message: String) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, message)
}
