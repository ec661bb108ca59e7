// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.


//! Trust material for broker connections
//!
//! The broker trust anchor and the optional client identity are kept as PEM
//! blobs in the key-value store. Building an actual TLS client configuration
//! requires the `tls` feature flag.

use log::debug;

use crate::store::KeyValueStore;

/// Active broker root certificate
pub const MQTT_ROOT_CA: &str = "mqtt_root_ca.pem";
/// Staged broker root certificate awaiting its trial connection
pub const MQTT_ROOT_CA_STAGED: &str = "mqtt_root_ca.tmp";
/// Client certificate for mutual TLS
pub const MQTT_CLIENT_CERT: &str = "mqtt_client.crt";
/// Client private key for mutual TLS
pub const MQTT_CLIENT_KEY: &str = "mqtt_client.key";
/// Generic root certificate (HTTPS and other services)
pub const ROOT_CA: &str = "root_ca.pem";

/// PEM blobs used when connecting to the broker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustMaterial {
    /// Root authority; `None` falls back to the bundled web roots
    pub root_ca: Option<Vec<u8>>,
    /// Client certificate chain
    pub client_cert: Option<Vec<u8>>,
    /// Client private key
    pub client_key: Option<Vec<u8>>,
}

impl TrustMaterial {
    /// Empty trust material
    pub fn new() -> Self {
        Self::default()
    }

    /// Load whatever blobs exist in `store`
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let read = |key: &str| match store.read(key) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) => {
                debug!("No trust blob {}: {}", key, e);
                None
            }
        };
        Self {
            root_ca: read(MQTT_ROOT_CA),
            client_cert: read(MQTT_CLIENT_CERT),
            client_key: read(MQTT_CLIENT_KEY),
        }
    }

    /// Replace the root authority
    pub fn with_root_ca(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.root_ca = Some(pem.into());
        self
    }

    /// Set the client identity
    pub fn with_client_identity(mut self, cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        self.client_cert = Some(cert.into());
        self.client_key = Some(key.into());
        self
    }

    /// Whether both halves of the client identity are present
    pub fn has_client_identity(&self) -> bool {
        self.client_cert.is_some() && self.client_key.is_some()
    }
}

#[cfg(feature = "tls")]
mod client {
    use std::io::BufReader;
    use std::sync::Arc;
    use std::time::SystemTime;

    use rustls::client::{ServerCertVerified, ServerCertVerifier};
    use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerName};

    use super::TrustMaterial;
    use crate::error::TransportError;

    struct AcceptAnyServerCert;

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _end_entity: &Certificate,
            _intermediates: &[Certificate],
            _server_name: &ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: SystemTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }
    }

    fn tls_error(e: impl std::fmt::Display) -> TransportError {
        TransportError::Tls(e.to_string())
    }

    fn certificates(pem: &[u8]) -> Result<Vec<Certificate>, TransportError> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(pem)).map_err(tls_error)?;
        if certs.is_empty() {
            return Err(TransportError::Tls("no certificate in PEM".to_string()));
        }
        Ok(certs.into_iter().map(Certificate).collect())
    }

    fn private_key(pem: &[u8]) -> Result<PrivateKey, TransportError> {
        let mut reader = BufReader::new(pem);
        loop {
            match rustls_pemfile::read_one(&mut reader).map_err(tls_error)? {
                Some(rustls_pemfile::Item::PKCS8Key(key))
                | Some(rustls_pemfile::Item::RSAKey(key))
                | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(PrivateKey(key)),
                Some(_) => continue,
                None => return Err(TransportError::Tls("no private key in PEM".to_string())),
            }
        }
    }

    impl TrustMaterial {
        /// rustls client configuration; `insecure` skips server verification
        pub fn client_config(&self, insecure: bool) -> Result<Arc<ClientConfig>, TransportError> {
            let mut roots = RootCertStore::empty();
            match &self.root_ca {
                Some(pem) => {
                    for cert in certificates(pem)? {
                        roots.add(&cert).map_err(tls_error)?;
                    }
                }
                None => roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                    OwnedTrustAnchor::from_subject_spki_name_constraints(
                        ta.subject,
                        ta.spki,
                        ta.name_constraints,
                    )
                })),
            }

            let builder = ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots);
            let mut config = match (&self.client_cert, &self.client_key) {
                (Some(cert), Some(key)) => builder
                    .with_client_auth_cert(certificates(cert)?, private_key(key)?)
                    .map_err(tls_error)?,
                _ => builder.with_no_client_auth(),
            };
            if insecure {
                config
                    .dangerous()
                    .set_certificate_verifier(Arc::new(AcceptAnyServerCert));
            }
            Ok(Arc::new(config))
        }
    }
}
