//! TLS material for the secure transport mode.
//!
//! A server built without [`ServerCredentials`] binds a plaintext listener.
//! With credentials, every transport instance is configured with a
//! [`ServerTlsConfig`] derived from the same PEM material, so a restarted
//! server keeps its identity.

use std::path::Path;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tradegate_core::{Error, Result};

/// PEM-encoded server identity and optional client CA.
#[derive(Clone)]
pub struct ServerCredentials {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    client_ca_pem: Option<Vec<u8>>,
}

impl ServerCredentials {
    /// Builds credentials from an in-memory certificate chain and key.
    pub fn from_pem(cert: impl AsRef<[u8]>, key: impl AsRef<[u8]>) -> Self {
        Self {
            cert_pem: cert.as_ref().to_vec(),
            key_pem: key.as_ref().to_vec(),
            client_ca_pem: None,
        }
    }

    /// Reads the certificate chain, key and optional client CA from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if any file cannot be read.
    pub fn from_files(cert: &Path, key: &Path, client_ca: Option<&Path>) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| Error::Tls {
                reason: format!("failed to read {}: {e}", path.display()),
            })
        };

        let mut credentials = Self::from_pem(read(cert)?, read(key)?);
        if let Some(ca) = client_ca {
            credentials = credentials.with_client_ca(read(ca)?);
        }
        Ok(credentials)
    }

    /// Requires clients to present a certificate signed by `ca`.
    #[must_use]
    pub fn with_client_ca(mut self, ca: impl AsRef<[u8]>) -> Self {
        self.client_ca_pem = Some(ca.as_ref().to_vec());
        self
    }

    pub fn requires_client_auth(&self) -> bool {
        self.client_ca_pem.is_some()
    }

    pub(crate) fn tls_config(&self) -> ServerTlsConfig {
        let identity = Identity::from_pem(&self.cert_pem, &self.key_pem);
        let config = ServerTlsConfig::new().identity(identity);
        match &self.client_ca_pem {
            Some(ca) => config.client_ca_root(Certificate::from_pem(ca)),
            None => config,
        }
    }
}

impl core::fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .field("client_auth", &self.requires_client_auth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_never_contains_the_key() {
        let credentials = ServerCredentials::from_pem("CERT", "SECRET-KEY");
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("SECRET-KEY"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn missing_files_are_tls_errors() {
        let err = ServerCredentials::from_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Tls { .. }));
    }

    #[test]
    fn client_ca_enables_client_auth() {
        let credentials = ServerCredentials::from_pem("CERT", "KEY");
        assert!(!credentials.requires_client_auth());
        assert!(credentials.with_client_ca("CA").requires_client_auth());
    }
}
