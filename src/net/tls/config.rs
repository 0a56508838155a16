//! Certificate bundle configuration
//!
//! A certificate bundle is a named set of trust/certificate/key material
//! associated with one hostname pattern; the literal `*` is the fallback
//! entry. Every PEM item can be supplied either as a file path or as an
//! in-memory blob.

use crate::net::{Result, SocketError};
use std::path::PathBuf;

/// PEM material supplied as a file path or inline bytes
#[derive(Debug, Clone)]
pub enum PemSource {
    File(PathBuf),
    Data(Vec<u8>),
}

impl PemSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        PemSource::File(path.into())
    }

    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        PemSource::Data(data.into())
    }

    /// Loads the PEM bytes, reading the file if necessary
    pub(crate) fn load(&self) -> Result<Vec<u8>> {
        match self {
            PemSource::Data(data) => Ok(data.clone()),
            PemSource::File(path) => std::fs::read(path).map_err(|e| {
                SocketError::Tls(format!("could not load \"{}\": {}", path.display(), e))
            }),
        }
    }
}

/// Trust, certificate and key material for one hostname pattern.
///
/// For a server bundle, `cert` and `key` are the presented identity and are
/// required; `ca` is the trust material used to verify client certificates.
/// For a client bundle, `ca` is the trust anchor set and `cert`/`key` are
/// the optional client identity.
#[derive(Debug, Clone, Default)]
pub struct CertificateBundle {
    pub ca: Option<PemSource>,
    pub cert: Option<PemSource>,
    pub key: Option<PemSource>,
}

impl CertificateBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca(mut self, source: PemSource) -> Self {
        self.ca = Some(source);
        self
    }

    pub fn cert(mut self, source: PemSource) -> Self {
        self.cert = Some(source);
        self
    }

    pub fn key(mut self, source: PemSource) -> Self {
        self.key = Some(source);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ca.is_none() && self.cert.is_none() && self.key.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_pem_source_data() {
        let source = PemSource::data(b"hello".to_vec());
        assert_eq!(source.load().unwrap(), b"hello");
    }

    #[test]
    fn test_pem_source_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"pem bytes").unwrap();
        let source = PemSource::file(file.path());
        assert_eq!(source.load().unwrap(), b"pem bytes");
    }

    #[test]
    fn test_pem_source_missing_file() {
        let source = PemSource::file("/nonexistent/certificate.pem");
        assert!(matches!(source.load(), Err(SocketError::Tls(_))));
    }

    #[test]
    fn test_bundle_builder() {
        let bundle = CertificateBundle::new()
            .ca(PemSource::data(b"ca".to_vec()))
            .cert(PemSource::data(b"cert".to_vec()))
            .key(PemSource::data(b"key".to_vec()));
        assert!(!bundle.is_empty());
        assert!(bundle.ca.is_some());

        assert!(CertificateBundle::new().is_empty());
    }
}
