//! Test fixtures: an in-process CA, a fake ACME backend and scripted collaborators

use crate::acme::{AcmeAccount, CaBackend, CertificateResource};
use crate::codec::{self, CertificateDescriptor, PrivateKey, PEM_CERTIFICATE};
use crate::error::TlsError;
use crate::sni::DomainResolver;
use crate::storage::{CertificateRecord, RefreshOptions};
use crate::verify::{DomainVerifier, VerifyError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Self-signed CA issuing leaves valid until 2030-01-01
pub(crate) struct TestCa {
    cert: Certificate,
    key: KeyPair,
}

impl TestCa {
    pub(crate) fn new() -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "Test CA");
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub(crate) fn der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    /// Leaf for `domains`; the first one is the Common Name
    pub(crate) fn issue(&self, domains: &[&str]) -> IssuedCert {
        self.issue_with_key(domains, KeyPair::generate().unwrap())
    }

    pub(crate) fn issue_with_key(&self, domains: &[&str], key: KeyPair) -> IssuedCert {
        let names: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        let mut params = CertificateParams::new(names).unwrap();
        params.distinguished_name.push(DnType::CommonName, domains[0]);
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2030, 1, 1);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf = params.signed_by(&key, &self.cert, &self.key).unwrap();

        IssuedCert {
            leaf_der: leaf.der().to_vec(),
            ca_der: self.der(),
            chain_pem: format!("{}{}", leaf.pem(), self.cert.pem()),
            key_pem: key.serialize_pem(),
        }
    }
}

pub(crate) struct IssuedCert {
    pub(crate) leaf_der: Vec<u8>,
    pub(crate) ca_der: Vec<u8>,
    /// Leaf followed by the CA
    pub(crate) chain_pem: String,
    pub(crate) key_pem: String,
}

impl IssuedCert {
    pub(crate) fn descriptor(&self) -> CertificateDescriptor {
        let der = codec::pem_decode(self.key_pem.as_bytes()).unwrap();
        let (key, _) = codec::parse_private_key_auto(&der).unwrap();
        CertificateDescriptor::from_key(vec![self.leaf_der.clone(), self.ca_der.clone()], &key)
            .unwrap()
    }

    pub(crate) fn resource(&self, domain: &str) -> CertificateResource {
        CertificateResource {
            domain: domain.to_string(),
            cert_url: format!("https://ca.test/cert/{}", domain),
            cert_stable_url: format!("https://ca.test/cert/{}", domain),
            private_key: self.key_pem.clone().into_bytes(),
            certificate: self.chain_pem.clone().into_bytes(),
            issuer_certificate: codec::pem_encode(PEM_CERTIFICATE, &self.ca_der),
            csr: Vec::new(),
        }
    }
}

/// Expiry of every leaf issued by [`TestCa`]
pub(crate) fn leaf_not_after() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
}

/// Not yet inserted record for `domain`
pub(crate) fn record(ca: &TestCa, domain: &str) -> CertificateRecord {
    let resource = ca.issue(&[domain]).resource(domain);
    CertificateRecord::from_resource(&resource, RefreshOptions::default()).unwrap()
}

enum FakeMode {
    Issue,
    Nothing,
    NoKey,
    Fail(String),
}

struct FakeState {
    registrations: usize,
    issued: Vec<Vec<String>>,
    mode: FakeMode,
    delay: Duration,
}

/// [`CaBackend`] that signs with a local [`TestCa`]
pub(crate) struct FakeCa {
    ca: TestCa,
    state: Mutex<FakeState>,
}

impl FakeCa {
    pub(crate) fn new() -> Self {
        Self {
            ca: TestCa::new(),
            state: Mutex::new(FakeState {
                registrations: 0,
                issued: Vec::new(),
                mode: FakeMode::Issue,
                delay: Duration::ZERO,
            }),
        }
    }

    pub(crate) fn registrations(&self) -> usize {
        self.state.lock().registrations
    }

    /// Domain lists of every order placed
    pub(crate) fn issued(&self) -> Vec<Vec<String>> {
        self.state.lock().issued.clone()
    }

    pub(crate) fn respond_with_nothing(&self) {
        self.state.lock().mode = FakeMode::Nothing;
    }

    pub(crate) fn respond_without_key(&self) {
        self.state.lock().mode = FakeMode::NoKey;
    }

    pub(crate) fn fail_with(&self, message: &str) {
        self.state.lock().mode = FakeMode::Fail(message.to_string());
    }

    /// Make every order take `delay` before it is answered
    pub(crate) fn respond_after(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }
}

#[async_trait]
impl CaBackend for FakeCa {
    async fn register(&self, email: &str) -> Result<(PrivateKey, serde_json::Value), TlsError> {
        let mut state = self.state.lock();
        state.registrations += 1;
        let registration = serde_json::json!({
            "id": format!("https://ca.test/acct/{}", state.registrations),
            "contact": [format!("mailto:{}", email)],
        });
        Ok((PrivateKey::generate_ec(), registration))
    }

    async fn obtain(
        &self,
        _account: &AcmeAccount,
        domains: &[String],
        key: Option<&PrivateKey>,
    ) -> Result<Option<CertificateResource>, TlsError> {
        let delay = self.state.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.issued.push(domains.to_vec());

        let names: Vec<&str> = domains.iter().map(String::as_str).collect();
        let issue = || {
            let key_pair = match key {
                Some(key) => KeyPair::try_from(key.to_pkcs8_der().unwrap().as_slice()).unwrap(),
                None => KeyPair::generate().unwrap(),
            };
            self.ca.issue_with_key(&names, key_pair).resource(&domains[0])
        };
        match &state.mode {
            FakeMode::Issue => Ok(Some(issue())),
            FakeMode::Nothing => Ok(None),
            FakeMode::NoKey => {
                let mut resource = issue();
                resource.private_key.clear();
                Ok(Some(resource))
            }
            FakeMode::Fail(message) => Err(TlsError::Acme(message.clone())),
        }
    }
}

/// Verifier passing every domain except the ones told to fail
#[derive(Default)]
pub(crate) struct ScriptedVerifier {
    failures: Mutex<HashMap<String, VerifyError>>,
    calls: Mutex<Vec<(String, Duration)>>,
}

impl ScriptedVerifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail(&self, domain: &str, error: VerifyError) {
        self.failures.lock().insert(domain.to_string(), error);
    }

    pub(crate) fn pass(&self, domain: &str) {
        self.failures.lock().remove(domain);
    }

    /// Verified domains with the timeout each got
    pub(crate) fn calls(&self) -> Vec<(String, Duration)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DomainVerifier for ScriptedVerifier {
    async fn verify(&self, domain: &str, timeout: Duration) -> Result<(), VerifyError> {
        self.calls.lock().push((domain.to_string(), timeout));
        match self.failures.lock().get(domain) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// In-memory [`DomainResolver`] counting lookups
#[derive(Default)]
pub(crate) struct MapResolver {
    entries: Mutex<HashMap<String, CertificateDescriptor>>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl MapResolver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, domain: &str, descriptor: CertificateDescriptor) {
        self.entries.lock().insert(domain.to_string(), descriptor);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DomainResolver for MapResolver {
    async fn resolve(&self, domain: &str) -> Result<Option<CertificateDescriptor>, TlsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TlsError::Storage("resolver unavailable".to_string()));
        }
        Ok(self.entries.lock().get(domain).cloned())
    }
}
