use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::config::Config;

/// Build the TLS acceptor from the configured PEM files. Plaintext when
/// neither file is configured.
pub fn acceptor_from_config(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both STAYD_TLS_CERT and STAYD_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(open(cert_path)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates found in {cert_path}"),
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(open(key_path)?))?.ok_or_else(
        || io::Error::new(ErrorKind::InvalidInput, format!("no private key found in {key_path}")),
    )?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

fn open(path: &str) -> io::Result<File> {
    File::open(path).map_err(|e| io::Error::new(e.kind(), format!("{path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(cert: Option<&str>, key: Option<&str>) -> Config {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.tls_cert = cert.map(String::from);
        config.tls_key = key.map(String::from);
        config
    }

    #[test]
    fn plaintext_when_unconfigured() {
        assert!(acceptor_from_config(&config(None, None)).unwrap().is_none());
    }

    #[test]
    fn half_configured_is_rejected() {
        let err = acceptor_from_config(&config(Some("cert.pem"), None)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("STAYD_TLS_KEY"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = acceptor_from_config(&config(Some("/nonexistent/stayd.crt"), Some("/nonexistent/stayd.key")))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("/nonexistent/stayd.crt"));
    }

    #[test]
    fn empty_cert_file_is_rejected() {
        let dir = std::env::temp_dir().join("stayd_test_tls");
        fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.crt");
        let key = dir.join("empty.key");
        fs::write(&cert, "").unwrap();
        fs::write(&key, "").unwrap();

        let err = acceptor_from_config(&config(cert.to_str(), key.to_str())).err().unwrap();
        assert!(err.to_string().contains("no certificates"));
    }
}
