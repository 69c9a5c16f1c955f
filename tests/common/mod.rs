//! Shared fixtures: a throwaway CA, leaf certificates and channel pairs
//! over in-memory pipes.

#![allow(dead_code)]

use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::RootCertStore;
use tokio::io::{duplex, DuplexStream};

use securexfer::{
    CertificateMaterial, CertificateStore, ChannelConfig, Result, SecureChannelFactory,
    SecuredChannel, VerifyMode,
};

pub const PIPE_CAPACITY: usize = 256 * 1024;

/// A CA that signs leaf certificates for one test.
pub struct TestPki {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

/// PEM encoded certificate and key of a leaf.
pub struct LeafPem {
    pub cert: String,
    pub key: String,
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "sxfer test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = params.self_signed(&ca_key).unwrap();

        Self { ca_cert, ca_key }
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    pub fn roots(&self) -> RootCertStore {
        CertificateStore::trust_roots_from_pem(&self.ca_pem()).unwrap()
    }

    /// Leaf certificate for `name`, usable for both server and client auth.
    pub fn leaf_pem(&self, name: &str) -> LeafPem {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        LeafPem {
            cert: cert.pem(),
            key: key.serialize_pem(),
        }
    }

    pub fn leaf(&self, name: &str) -> CertificateMaterial {
        let pem = self.leaf_pem(name);
        CertificateStore::from_pem(&pem.cert, &pem.key).unwrap()
    }
}

/// Server factory for `localhost` that does not ask for client certificates.
pub fn plain_server(pki: &TestPki) -> SecureChannelFactory {
    let config = ChannelConfig::builder(VerifyMode::None).build().unwrap();
    SecureChannelFactory::server(Arc::new(config), &pki.leaf("localhost")).unwrap()
}

/// Client factory that validates the server chain and the name `localhost`.
pub fn verifying_client(pki: &TestPki) -> SecureChannelFactory {
    let config = ChannelConfig::builder(VerifyMode::CheckChainAndHostname)
        .trust_roots(pki.roots())
        .expected_hostname("localhost")
        .build()
        .unwrap();
    SecureChannelFactory::client(Arc::new(config), None).unwrap()
}

/// Run both handshakes concurrently over an in-memory pipe.
pub async fn handshake(
    server: &SecureChannelFactory,
    client: &SecureChannelFactory,
) -> (
    Result<SecuredChannel<DuplexStream>>,
    Result<SecuredChannel<DuplexStream>>,
) {
    let (server_end, client_end) = duplex(PIPE_CAPACITY);
    tokio::join!(server.establish(server_end), client.establish(client_end))
}

/// Established `(server, client)` channel pair with default policies.
pub async fn connected_pair(
    pki: &TestPki,
) -> (SecuredChannel<DuplexStream>, SecuredChannel<DuplexStream>) {
    let (server, client) = handshake(&plain_server(pki), &verifying_client(pki)).await;
    (server.unwrap(), client.unwrap())
}
