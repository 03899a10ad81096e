//! Private key and certificate encoding
//!
//! Keys are persisted in a canonical DER form tagged with a [`KeyType`]:
//! SEC1 for elliptic-curve keys and PKCS#1 for RSA keys. PKCS#8 input is only
//! accepted by [`parse_private_key_auto`] and comes back out in one of the two
//! canonical forms.

use crate::error::TlsError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use ::pem::{EncodeConfig, LineEnding, Pem};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, PrivateKeyInfo};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivateSec1KeyDer};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use x509_parser::prelude::*;

pub const PEM_CERTIFICATE: &str = "CERTIFICATE";
pub const PEM_CERTIFICATE_REQUEST: &str = "CERTIFICATE REQUEST";
const PEM_EC_PRIVATE_KEY: &str = "EC PRIVATE KEY";
const PEM_RSA_PRIVATE_KEY: &str = "RSA PRIVATE KEY";

/// Storage tag for a marshalled private key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Elliptic-curve key, SEC1 DER
    Ec,
    /// RSA key, PKCS#1 DER
    Pkcs1,
}

/// A decoded private key
#[derive(Debug, Clone, PartialEq)]
pub enum PrivateKey {
    P256(p256::SecretKey),
    P384(p384::SecretKey),
    Rsa(RsaPrivateKey),
}

impl PrivateKey {
    /// Generate a fresh P-256 key
    pub fn generate_ec() -> Self {
        PrivateKey::P256(p256::SecretKey::random(&mut rand::rngs::OsRng))
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            PrivateKey::P256(_) | PrivateKey::P384(_) => KeyType::Ec,
            PrivateKey::Rsa(_) => KeyType::Pkcs1,
        }
    }

    /// PEM form of the canonical DER encoding
    pub fn to_pem(&self) -> Result<Vec<u8>, TlsError> {
        let (der, key_type) = marshal_private_key(self)?;
        let tag = match key_type {
            KeyType::Ec => PEM_EC_PRIVATE_KEY,
            KeyType::Pkcs1 => PEM_RSA_PRIVATE_KEY,
        };
        Ok(pem_encode(tag, &der))
    }

    /// PKCS#8 DER, the form CSR signers take
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, TlsError> {
        let document = match self {
            PrivateKey::P256(k) => k.to_pkcs8_der(),
            PrivateKey::P384(k) => k.to_pkcs8_der(),
            PrivateKey::Rsa(k) => k.to_pkcs8_der(),
        }
        .map_err(|e| TlsError::KeyDecode(format!("encoding PKCS#8 key: {}", e)))?;
        Ok(document.as_bytes().to_vec())
    }

    /// RFC 7638 thumbprint of the public half, base64url without padding
    pub fn jwk_thumbprint(&self) -> Result<String, TlsError> {
        match self {
            PrivateKey::P256(key) => {
                let point = key.public_key().to_encoded_point(false);
                ec_jwk_thumbprint(
                    "P-256",
                    point.x().map(|x| x.as_slice()),
                    point.y().map(|y| y.as_slice()),
                )
            }
            PrivateKey::P384(key) => {
                let point = key.public_key().to_encoded_point(false);
                ec_jwk_thumbprint(
                    "P-384",
                    point.x().map(|x| x.as_slice()),
                    point.y().map(|y| y.as_slice()),
                )
            }
            PrivateKey::Rsa(key) => Ok(rsa_jwk_thumbprint(
                &key.n().to_bytes_be(),
                &key.e().to_bytes_be(),
            )),
        }
    }
}

fn ec_jwk_thumbprint(crv: &str, x: Option<&[u8]>, y: Option<&[u8]>) -> Result<String, TlsError> {
    let (Some(x), Some(y)) = (x, y) else {
        return Err(TlsError::KeyDecode("public key point is the identity".to_string()));
    };
    // Members in lexicographic order, no whitespace
    let jwk = format!(
        r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
        crv,
        URL_SAFE_NO_PAD.encode(x),
        URL_SAFE_NO_PAD.encode(y)
    );
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(jwk.as_bytes())))
}

pub(crate) fn rsa_jwk_thumbprint(n: &[u8], e: &[u8]) -> String {
    let jwk = format!(
        r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
        URL_SAFE_NO_PAD.encode(e),
        URL_SAFE_NO_PAD.encode(n)
    );
    URL_SAFE_NO_PAD.encode(Sha256::digest(jwk.as_bytes()))
}

/// Parse a key whose storage tag is known
pub fn parse_private_key(der: &[u8], key_type: KeyType) -> Result<PrivateKey, TlsError> {
    match key_type {
        KeyType::Ec => parse_sec1(der)
            .ok_or_else(|| TlsError::KeyDecode("invalid SEC1 elliptic-curve key".to_string())),
        KeyType::Pkcs1 => RsaPrivateKey::from_pkcs1_der(der)
            .map(PrivateKey::Rsa)
            .map_err(|e| TlsError::KeyDecode(format!("invalid PKCS#1 RSA key: {}", e))),
    }
}

/// Detect the encoding of a key: PKCS#1, then PKCS#8, then SEC1
pub fn parse_private_key_auto(der: &[u8]) -> Result<(PrivateKey, KeyType), TlsError> {
    if let Ok(key) = RsaPrivateKey::from_pkcs1_der(der) {
        return Ok((PrivateKey::Rsa(key), KeyType::Pkcs1));
    }

    if PrivateKeyInfo::try_from(der).is_ok() {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
            return Ok((PrivateKey::Rsa(key), KeyType::Pkcs1));
        }
        if let Ok(key) = p256::SecretKey::from_pkcs8_der(der) {
            return Ok((PrivateKey::P256(key), KeyType::Ec));
        }
        if let Ok(key) = p384::SecretKey::from_pkcs8_der(der) {
            return Ok((PrivateKey::P384(key), KeyType::Ec));
        }
        return Err(TlsError::KeyDecode(
            "found unknown private key type in PKCS#8 wrapping".to_string(),
        ));
    }

    if let Some(key) = parse_sec1(der) {
        return Ok((key, KeyType::Ec));
    }

    Err(TlsError::KeyDecode("failed to parse private key".to_string()))
}

fn parse_sec1(der: &[u8]) -> Option<PrivateKey> {
    if let Ok(key) = p256::SecretKey::from_sec1_der(der) {
        return Some(PrivateKey::P256(key));
    }
    p384::SecretKey::from_sec1_der(der).ok().map(PrivateKey::P384)
}

/// Canonical DER bytes and storage tag for a key
pub fn marshal_private_key(key: &PrivateKey) -> Result<(Vec<u8>, KeyType), TlsError> {
    let der = match key {
        PrivateKey::P256(k) => k.to_sec1_der().map(|d| d.to_vec()),
        PrivateKey::P384(k) => k.to_sec1_der().map(|d| d.to_vec()),
        PrivateKey::Rsa(k) => {
            return k
                .to_pkcs1_der()
                .map(|d| (d.as_bytes().to_vec(), KeyType::Pkcs1))
                .map_err(|e| TlsError::KeyDecode(format!("marshaling RSA key: {}", e)));
        }
    }
    .map_err(|e| TlsError::KeyDecode(format!("marshaling EC key: {}", e)))?;

    Ok((der, KeyType::Ec))
}

fn pem_config() -> EncodeConfig {
    EncodeConfig::new().set_line_ending(LineEnding::LF)
}

pub fn pem_encode(tag: &str, der: &[u8]) -> Vec<u8> {
    ::pem::encode_config(&Pem::new(tag, der.to_vec()), pem_config()).into_bytes()
}

pub fn pem_encode_many(tag: &str, ders: &[Vec<u8>]) -> Vec<u8> {
    let blocks: Vec<Pem> = ders.iter().map(|der| Pem::new(tag, der.clone())).collect();
    ::pem::encode_many_config(&blocks, pem_config()).into_bytes()
}

/// Contents of the first PEM block, if any
pub fn pem_decode(bundle: &[u8]) -> Option<Vec<u8>> {
    ::pem::parse(bundle).ok().map(Pem::into_contents)
}

/// Contents of every PEM block, in order
pub fn pem_decode_many(bundle: &[u8]) -> Vec<Vec<u8>> {
    ::pem::parse_many(bundle)
        .map(|blocks| blocks.into_iter().map(Pem::into_contents).collect())
        .unwrap_or_default()
}

/// Decode a PEM certificate chain meant to be served, leaf first
pub fn decode_certificate_chain(bundle: &[u8]) -> Result<Vec<Vec<u8>>, TlsError> {
    let chain: Vec<Vec<u8>> = ::pem::parse_many(bundle)
        .map_err(|e| TlsError::CertificateError(format!("failed to parse PEM: {}", e)))?
        .into_iter()
        .filter(|block| block.tag() == PEM_CERTIFICATE)
        .map(Pem::into_contents)
        .collect();

    let Some(leaf) = chain.first() else {
        return Err(TlsError::CertificateError(
            "no certificates were found while parsing the bundle".to_string(),
        ));
    };
    ensure_leaf(leaf)?;

    Ok(chain)
}

/// Fields of an X.509 certificate the proxy cares about
#[derive(Debug, Clone)]
pub struct CertificateSummary {
    pub is_ca: bool,
    pub not_after: DateTime<Utc>,
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl CertificateSummary {
    /// Lower-cased CN, then sorted DNS names, then IPs, joined by commas
    pub fn san_key(&self) -> String {
        let cn = self.common_name.as_deref().unwrap_or("");
        let mut sans = Vec::new();
        if !cn.is_empty() {
            sans.push(cn.to_lowercase());
        }

        let mut dns_names = self.dns_names.clone();
        dns_names.sort();
        for name in dns_names {
            if name != cn {
                sans.push(name.to_lowercase());
            }
        }

        for ip in &self.ip_addresses {
            let ip = ip.to_string();
            if ip != cn {
                sans.push(ip);
            }
        }

        sans.join(",")
    }

    /// Identifiers to request when re-issuing this certificate
    pub fn identifiers(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(cn) = &self.common_name {
            names.push(cn.clone());
        }
        for name in &self.dns_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

pub fn inspect_certificate(der: &[u8]) -> Result<CertificateSummary, TlsError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| TlsError::CertificateError(format!("failed to parse X509: {:?}", e)))?;

    let is_ca = cert
        .basic_constraints()
        .ok()
        .flatten()
        .map(|bc| bc.value.ca)
        .unwrap_or(false);

    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| TlsError::CertificateError("notAfter out of range".to_string()))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                GeneralName::IPAddress(raw) => {
                    if let Some(ip) = ip_from_bytes(raw) {
                        ip_addresses.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    Ok(CertificateSummary {
        is_ca,
        not_after,
        common_name,
        dns_names,
        ip_addresses,
    })
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(raw).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

/// Reject a certificate that declares itself a CA
pub fn ensure_leaf(der: &[u8]) -> Result<CertificateSummary, TlsError> {
    let summary = inspect_certificate(der)?;
    if summary.is_ca {
        return Err(TlsError::CertificateError(
            "bundle starts with a CA certificate".to_string(),
        ));
    }
    Ok(summary)
}

/// A PEM bundle decoded into a servable chain and key
#[derive(Debug, Clone)]
pub struct LoadedCertificate {
    pub chain: Vec<Vec<u8>>,
    pub key: PrivateKey,
    pub summary: CertificateSummary,
}

/// Decode a bundle holding certificate blocks and exactly one private key
pub fn load_certificate_bundle(raw: &[u8]) -> Result<LoadedCertificate, TlsError> {
    let blocks = ::pem::parse_many(raw)
        .map_err(|e| TlsError::CertificateError(format!("failed to parse PEM: {}", e)))?;

    let mut chain = Vec::new();
    let mut key = None;
    for block in blocks {
        if block.tag() == PEM_CERTIFICATE {
            chain.push(block.into_contents());
        } else if block.tag().ends_with("PRIVATE KEY") {
            let (parsed, _) = parse_private_key_auto(block.contents())
                .map_err(|e| e.context("failure reading private key"))?;
            key = Some(parsed);
        }
    }

    let Some(leaf) = chain.first() else {
        return Err(TlsError::CertificateError("no certificate found".to_string()));
    };
    let Some(key) = key else {
        return Err(TlsError::CertificateError("no private key found".to_string()));
    };
    let summary = ensure_leaf(leaf)?;

    Ok(LoadedCertificate { chain, key, summary })
}

/// Chain and key handed to a TLS handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDescriptor {
    pub chain: Vec<Vec<u8>>,
    pub private_key: Vec<u8>,
    pub key_type: KeyType,
}

impl CertificateDescriptor {
    pub fn from_key(chain: Vec<Vec<u8>>, key: &PrivateKey) -> Result<Self, TlsError> {
        let (private_key, key_type) = marshal_private_key(key)?;
        Ok(Self {
            chain,
            private_key,
            key_type,
        })
    }

    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        match self.key_type {
            KeyType::Ec => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(self.private_key.clone())),
            KeyType::Pkcs1 => {
                PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(self.private_key.clone()))
            }
        }
    }

    /// Build the rustls signing material for this chain
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, TlsError> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&self.private_key_der())
            .map_err(|e| TlsError::CertificateError(e.to_string()))?;
        let certs = self
            .chain
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect();

        Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
    }
}
