//! In-memory upstream for tests.
//!
//! Each card answers from a table of canned replies. Cards given
//! certificates also emulate the certificate list and certificate files the
//! inventory walk reads, or the single certificate file of a QSCD card.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509, X509Builder, X509NameBuilder};

use crate::upstream::{UpstreamError, UpstreamProvider, UpstreamSession};

const STATUS_OK: &str = "9000";
const RECORD_NOT_FOUND: &str = "6A83";
const CHUNK: usize = 256;

/// One command seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub token: String,
    pub apdu: Option<String>,
    pub reset: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockCard {
    atr: String,
    exact: HashMap<String, Vec<String>>,
    prefixes: Vec<(String, Vec<String>)>,
    certificates: Vec<Vec<u8>>,
    selected: Option<usize>,
    certificate_file: Option<Vec<u8>>,
}

impl MockCard {
    pub fn new(atr: &str) -> Self {
        Self {
            atr: atr.to_string(),
            ..Self::default()
        }
    }

    /// Reply for an exact APDU.
    pub fn respond(mut self, apdu: &str, reply: &[&str]) -> Self {
        self.exact
            .insert(apdu.to_string(), reply.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Reply for any APDU starting with `prefix`. Earlier rules win.
    pub fn respond_prefix(mut self, prefix: &str, reply: &[&str]) -> Self {
        self.prefixes
            .push((prefix.to_string(), reply.iter().map(|s| s.to_string()).collect()));
        self
    }

    /// DER certificates stored on the card, in record order.
    pub fn with_certificates(mut self, certificates: Vec<Vec<u8>>) -> Self {
        self.certificates = certificates;
        self
    }

    /// DER certificate served by offset reads (`00B0` + offset + length).
    pub fn with_certificate_file(mut self, der: Vec<u8>) -> Self {
        self.certificate_file = Some(der);
        self
    }

    fn answer(&mut self, apdu: &str) -> Vec<String> {
        let apdu = apdu.to_ascii_uppercase();
        if let Some(reply) = self.exact.get(&apdu) {
            return reply.clone();
        }
        if let Some(reply) = self.certificate_files(&apdu) {
            return vec![reply];
        }
        if let Some((_, reply)) = self.prefixes.iter().find(|(p, _)| apdu.starts_with(p)) {
            return reply.clone();
        }
        vec![STATUS_OK.to_string()]
    }

    fn certificate_files(&mut self, apdu: &str) -> Option<String> {
        let arg = |at: usize| apdu.get(at..at + 2).and_then(|h| u8::from_str_radix(h, 16).ok());

        if let Some(der) = &self.certificate_file {
            if apdu.len() == 10 && apdu.starts_with("00B0") {
                let offset = (usize::from(arg(4)?) << 8) | usize::from(arg(6)?);
                let end = (offset + usize::from(arg(8)?)).min(der.len());
                let chunk = der.get(offset..end)?;
                return Some(format!("{}{STATUS_OK}", hex::encode_upper(chunk)));
            }
        }

        if apdu.len() == 10 && apdu.starts_with("00B2") && apdu.ends_with("0400") {
            let record = usize::from(arg(4)?);
            let Some(der) = record.checked_sub(1).and_then(|i| self.certificates.get(i)) else {
                return Some(RECORD_NOT_FOUND.to_string());
            };
            let length = u32::try_from(der.len()).ok()?.to_be_bytes();
            let mut descriptor = vec![0x01, 0x0C, 0x10, 0x04, 0x3F, 0x20, 0x02, record as u8];
            descriptor.extend_from_slice(&[0x12, 0x04]);
            descriptor.extend_from_slice(&length);
            return Some(format!("{}{STATUS_OK}", hex::encode_upper(descriptor)));
        }
        if apdu.len() == 14 && apdu.starts_with("00A4020C0202") {
            let index = usize::from(arg(12)?).checked_sub(1)?;
            self.selected = (index < self.certificates.len()).then_some(index);
            return Some(STATUS_OK.to_string());
        }
        if apdu.len() == 10 && apdu.starts_with("00B0") && apdu.ends_with("0000") {
            let der = self.certificates.get(self.selected?)?;
            let start = usize::from(arg(4)?) * CHUNK;
            let chunk = der.get(start..(start + CHUNK).min(der.len()))?;
            return Some(format!("{}{STATUS_OK}", hex::encode_upper(chunk)));
        }
        None
    }
}

#[derive(Debug, Default)]
struct Inner {
    cards: HashMap<String, MockCard>,
    calls: Vec<MockCall>,
    down: bool,
    delay: Duration,
}

/// Upstream serving a fixed set of mock cards.
#[derive(Debug, Clone, Default)]
pub struct MockUpstream {
    inner: Arc<Mutex<Inner>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_card(&self, reader: &str, card: MockCard) {
        self.lock().cards.insert(reader.to_string(), card);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn set_up(&self, up: bool) {
        self.lock().down = !up;
    }

    /// Delay applied to every command.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }
}

#[async_trait::async_trait]
impl UpstreamSession for MockUpstream {
    async fn cmd(
        &self,
        apdu: Option<&str>,
        token: &str,
        reset: bool,
    ) -> Result<Vec<String>, UpstreamError> {
        let delay = {
            let mut inner = self.lock();
            inner.calls.push(MockCall {
                token: token.to_string(),
                apdu: apdu.map(str::to_string),
                reset,
            });
            inner.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if inner.down {
            return Err(UpstreamError::Unreachable("mock upstream is down".into()));
        }
        let Some(card) = inner.cards.get_mut(token) else {
            return Err(UpstreamError::Rejected(format!("unknown reader {token}")));
        };
        match apdu {
            Some(apdu) => Ok(card.answer(apdu)),
            None if reset => Ok(vec![card.atr.clone()]),
            None => Ok(Vec::new()),
        }
    }

    async fn inventory(&self) -> Result<Vec<String>, UpstreamError> {
        let inner = self.lock();
        if inner.down {
            return Err(UpstreamError::Unreachable("mock upstream is down".into()));
        }
        let mut readers: Vec<String> = inner
            .cards
            .iter()
            .map(|(reader, card)| format!("{reader} {}", card.atr))
            .collect();
        readers.sort();
        Ok(readers)
    }
}

#[async_trait::async_trait]
impl UpstreamProvider for MockUpstream {
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>, UpstreamError> {
        if self.lock().down {
            return Err(UpstreamError::Unreachable("mock upstream is down".into()));
        }
        Ok(Box::new(self.clone()))
    }

    async fn close(&self, _session: Box<dyn UpstreamSession>) {}

    async fn is_up(&self) -> bool {
        !self.lock().down
    }
}

/// Issue a P-256 certificate for `common_name` with `notBefore` at
/// `issued_at` (Unix seconds). Self-signed when `issuer` is `None`.
pub fn issue_certificate(
    common_name: &str,
    issuer: Option<(&X509, &PKey<Private>)>,
    ca: bool,
    issued_at: i64,
) -> (X509, PKey<Private>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("curve");
    let key = PKey::from_ec_key(EcKey::generate(&group).expect("ec key")).expect("pkey");

    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_nid(Nid::COUNTRYNAME, "CZ").expect("country");
    name.append_entry_by_nid(Nid::COMMONNAME, common_name).expect("cn");
    let name = name.build();

    let mut builder = X509Builder::new().expect("x509 builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32((issued_at as u32) ^ common_name.len() as u32).expect("serial");
    let serial = Asn1Integer::from_bn(&serial).expect("asn1 serial");
    builder.set_serial_number(&serial).expect("set serial");
    builder.set_subject_name(&name).expect("subject");
    match issuer {
        Some((cert, _)) => builder.set_issuer_name(cert.subject_name()).expect("issuer"),
        None => builder.set_issuer_name(&name).expect("issuer"),
    }
    builder.set_pubkey(&key).expect("pubkey");
    let not_before = Asn1Time::from_unix(issued_at).expect("not before");
    let not_after = Asn1Time::from_unix(issued_at + 10 * 365 * 86_400).expect("not after");
    builder.set_not_before(&not_before).expect("set not before");
    builder.set_not_after(&not_after).expect("set not after");
    if ca {
        let constraints = BasicConstraints::new().critical().ca().build().expect("constraints");
        builder.append_extension(constraints).expect("extension");
    }
    let signing_key = issuer.map(|(_, key)| key).unwrap_or(&key);
    builder.sign(signing_key, MessageDigest::sha256()).expect("sign");
    (builder.build(), key)
}
