//! Builds the reader index by reading certificates off every attached card.
//!
//! Each card is read by its own task over its own upstream session. A card
//! stores certificate descriptors as records in `3F00/3F50/3F10/5630`; each
//! descriptor names the certificate file and its length. CA certificates are
//! kept per card to build chains, and only the most recently issued
//! end-entity certificate is used as the card's signing identity.

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use openssl::asn1::Asn1Time;
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::x509::{X509, X509NameRef};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::csp::check_response;
use crate::error::FoxyError;
use crate::storage::{CertificateRecord, Inventory, ReaderRecord, TokenRecord};
use crate::upstream::{UpstreamError, UpstreamProvider, UpstreamSession};

const SELECT_MF: &str = "00A4000C023F00";
const SELECT_APP: &str = "00A4010C023F50";
const SELECT_OBJECTS: &str = "00A4010C023F10";
const SELECT_KEY_LIST: &str = "00A4020C025660";
const SELECT_CERT_LIST: &str = "00A4020C025630";
const RESET_TO_MF: &str = "00A40004023F0000";
const SELECT_QSCD_APP: &str = "00A4040010A0000000770103000610000000000002";
const SELECT_QSCD_FOLDER: &str = "00A408000410001003";
const READ_CARD_ID: &str = "00B0000010";
/// Certificate store of a QSCD card; also guards its signing PIN.
pub(crate) const SELECT_QSCD_STORE: &str = "00A408000614009001200200";
const READ_QSCD_HEADER: &str = "00B0000004";
const QSCD_CHUNK: usize = 100;
const STATUS_OK: &str = "9000";
const ATR_PREFIX: &str = "3B";

const DER_BOOLEAN: u8 = 0x01;
const DER_OCTET_STRING: u8 = 0x04;
const DER_OID: u8 = 0x06;
const DER_SEQUENCE: u8 = 0x30;
const DER_EXTENSIONS: u8 = 0xA3;
/// 2.5.29.19
const BASIC_CONSTRAINTS_OID: [u8; 3] = [0x55, 0x1D, 0x13];

/// How a provider's cards store their certificates.
#[derive(Debug, Clone)]
pub enum CardLayout {
    /// Object list pointing at one file per certificate.
    Ica,
    /// One user certificate file; CA certificates come from a fixed list.
    Qscd { cas: Arc<[CertificateRecord]> },
}

/// Where a certificate lives on the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CertificateLocation {
    folder: [u8; 2],
    file: [u8; 2],
    length: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum DescriptorError {
    UnknownFormat,
    NoLocation,
}

/// Fields of an X.509 certificate the index cares about.
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    pub subject: String,
    pub issuer: String,
    pub common_name: Option<String>,
    pub is_ca: bool,
    /// `notBefore` as seconds since the Unix epoch.
    pub issued_at: i64,
    /// Base64 of the DER encoding.
    pub encoded: String,
}

/// What one card contributes to the index.
#[derive(Debug)]
struct CardInventory {
    reader: String,
    end_entity: Option<ParsedCertificate>,
    cas: Vec<CertificateRecord>,
}

impl CardInventory {
    fn new(reader: String) -> Self {
        Self {
            reader,
            end_entity: None,
            cas: Vec::new(),
        }
    }

    fn add_certificate(&mut self, cert: ParsedCertificate) {
        let name = cert.common_name.as_deref().unwrap_or("?");
        if cert.is_ca {
            debug!(reader = %self.reader, name, "CA certificate found");
            self.cas.push(CertificateRecord {
                name: cert.subject,
                issuer: cert.issuer,
                cert: cert.encoded,
            });
            return;
        }
        let newest_kept = self
            .end_entity
            .as_ref()
            .is_some_and(|current| current.issued_at >= cert.issued_at);
        if newest_kept {
            info!(reader = %self.reader, name, "user certificate is older than the one kept");
            return;
        }
        if self.end_entity.is_some() {
            info!(reader = %self.reader, name, "user certificate replaces an older one");
        } else {
            info!(reader = %self.reader, name, "user certificate found");
        }
        self.end_entity = Some(cert);
    }

    fn merge_into(self, inventory: &mut Inventory) {
        let mut record = ReaderRecord::default();
        match self.end_entity {
            Some(cert) => {
                let (chain, rooted) = build_chain(&cert.issuer, &self.cas);
                if !rooted {
                    warn!(reader = %self.reader, "certificate chain does not reach a root");
                }
                record.subject = cert.common_name.clone();
                record.cert = Some(cert.encoded);
                record.chain = chain;
                inventory.insert_token(TokenRecord::new(
                    cert.subject,
                    cert.common_name,
                    self.reader.clone(),
                ));
            }
            None => warn!(reader = %self.reader, "no user certificate on this card"),
        }
        inventory.insert_card_cas(self.reader.clone(), self.cas);
        inventory.insert_reader(self.reader, record);
    }
}

/// Read every attached card and assemble a fresh index.
pub async fn build(
    provider: Arc<dyn UpstreamProvider>,
    previous: &Inventory,
    max_enum_readers: usize,
    layout: &CardLayout,
) -> Result<Inventory, FoxyError> {
    let session = provider.connect().await?;
    let listing = session.inventory().await;
    provider.close(session).await;
    let readers: Vec<String> = listing?.iter().map(|entry| strip_atr(entry)).collect();

    let mut known: HashSet<String> = previous.reader_names().into_iter().collect();
    let mut new_cards = 0;
    for reader in &readers {
        if known.remove(reader) {
            info!(reader = %reader, "known chip found again");
        } else {
            info!(reader = %reader, "found a new chip");
            new_cards += 1;
        }
    }
    for reader in &known {
        info!(reader = %reader, "chip was removed or cannot be found");
    }
    if readers.is_empty() {
        error!("no chips found");
    } else {
        info!(
            total = readers.len(),
            new = new_cards,
            removed = known.len(),
            "inspecting certificates"
        );
    }

    let mut inventory = Inventory::with_max_enum_readers(max_enum_readers);
    let mut tasks = JoinSet::new();
    for reader in readers {
        inventory.insert_reader(reader.clone(), ReaderRecord::default());
        tasks.spawn(read_card(Arc::clone(&provider), reader, layout.clone()));
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(card) => {
                debug!(reader = %card.reader, remaining = tasks.len(), "card processed");
                card.merge_into(&mut inventory);
            }
            Err(err) => error!("card task failed: {err}"),
        }
    }

    for token in inventory.tokens() {
        info!(
            reader = %token.reader,
            user = token.short_name.as_deref().unwrap_or("-"),
            name = %token.name,
            "certificate entry"
        );
    }
    Ok(inventory)
}

/// Inventory entries may end with the card's ATR; keep the reader name only.
pub fn strip_atr(entry: &str) -> String {
    let entry = entry.trim();
    match entry.rsplit_once(char::is_whitespace) {
        Some((reader, last)) if last.to_ascii_uppercase().starts_with(ATR_PREFIX) => {
            reader.trim().to_string()
        }
        _ => entry.to_string(),
    }
}

async fn read_card(
    provider: Arc<dyn UpstreamProvider>,
    reader: String,
    layout: CardLayout,
) -> CardInventory {
    debug!(reader = %reader, "card processing started");
    let mut card = CardInventory::new(reader);
    let session = match provider.connect().await {
        Ok(session) => session,
        Err(err) => {
            warn!(reader = %card.reader, "no upstream session for card: {err}");
            return card;
        }
    };
    match layout {
        CardLayout::Ica => walk_card(session.as_ref(), &mut card).await,
        CardLayout::Qscd { cas } => {
            card.cas.extend(cas.iter().cloned());
            read_certificate_file(session.as_ref(), &mut card).await;
        }
    }
    provider.close(session).await;
    card
}

/// Read the single user certificate of a QSCD card. Its length comes from
/// the DER header in the first four bytes.
async fn read_certificate_file(session: &dyn UpstreamSession, card: &mut CardInventory) {
    let reader = card.reader.clone();

    let mut usable = true;
    for apdu in [SELECT_QSCD_APP, SELECT_QSCD_FOLDER, READ_CARD_ID, SELECT_QSCD_STORE] {
        usable &= status_ok(&session.cmd(Some(apdu), &reader, false).await);
    }
    let header = ok_line(&session.cmd(Some(READ_QSCD_HEADER), &reader, false).await)
        .and_then(|line| hex::decode(&line[..line.len() - 4]).ok());
    let Some(mut der) = header else {
        error!(reader = %reader, "certificate file cannot be read, card skipped");
        return;
    };
    let Some((_, header_len, content_len)) = der_header(&der) else {
        error!(reader = %reader, "certificate file does not start with a DER header");
        return;
    };
    let total = header_len + content_len;

    while usable && der.len() < total {
        let count = (total - der.len()).min(QSCD_CHUNK);
        let apdu = format!("00B0{:04X}{count:02X}", der.len());
        let chunk = ok_line(&session.cmd(Some(&apdu), &reader, false).await)
            .and_then(|line| hex::decode(&line[..line.len() - 4]).ok());
        match chunk {
            Some(chunk) if !chunk.is_empty() => der.extend_from_slice(&chunk),
            _ => usable = false,
        }
    }
    let _ = session.cmd(Some(RESET_TO_MF), &reader, false).await;
    if der.len() < total {
        error!(reader = %reader, read = der.len(), total, "certificate read incomplete");
        return;
    }
    der.truncate(total);

    match parse_certificate(&der) {
        Ok(cert) => card.add_certificate(cert),
        Err(err) => warn!(reader = %reader, "unreadable certificate: {err}"),
    }
}

async fn walk_card(session: &dyn UpstreamSession, card: &mut CardInventory) {
    let reader = card.reader.clone();

    let mut usable = true;
    for apdu in [SELECT_MF, SELECT_APP, SELECT_OBJECTS, SELECT_KEY_LIST] {
        usable &= status_ok(&session.cmd(Some(apdu), &reader, false).await);
    }
    if usable {
        let mut records = 0u8;
        while records < u8::MAX {
            let apdu = format!("00B2{:02X}0400", records + 1);
            if !status_ok(&session.cmd(Some(&apdu), &reader, false).await) {
                break;
            }
            records += 1;
        }
        debug!(reader = %reader, records, "key records found");
    }

    let _ = session.cmd(Some(RESET_TO_MF), &reader, true).await;

    for record_id in 1..=u8::MAX {
        for apdu in [SELECT_MF, SELECT_APP, SELECT_OBJECTS] {
            let _ = session.cmd(Some(apdu), &reader, false).await;
        }
        let reply = session.cmd(Some(SELECT_CERT_LIST), &reader, false).await;
        if check_response(&reply, &reader, "selecting certificate list failed", 0).is_some() {
            break;
        }

        let apdu = format!("00B2{record_id:02X}0400");
        let reply = session.cmd(Some(&apdu), &reader, false).await;
        let Some(line) = ok_line(&reply) else {
            break;
        };
        if line.len() < 8 {
            error!(reader = %reader, line = %line, "short descriptor, certificate may have been deleted");
            continue;
        }
        let raw = match hex::decode(&line[..line.len() - 4]) {
            Ok(raw) => raw,
            Err(err) => {
                error!(reader = %reader, "descriptor is not hex: {err}");
                break;
            }
        };
        let location = match parse_descriptor(&raw) {
            Ok(location) => location,
            Err(DescriptorError::UnknownFormat) => {
                error!(reader = %reader, line = %line, "unexpected certificate descriptor format");
                break;
            }
            Err(DescriptorError::NoLocation) => {
                error!(reader = %reader, line = %line, "certificate descriptor names no file");
                continue;
            }
        };

        let Some(der) = read_certificate(session, &reader, location).await else {
            continue;
        };
        match parse_certificate(&der) {
            Ok(cert) => card.add_certificate(cert),
            Err(err) => error!(reader = %reader, "unreadable certificate: {err}"),
        }
    }
}

fn parse_descriptor(raw: &[u8]) -> Result<CertificateLocation, DescriptorError> {
    let mut rest = match raw.first() {
        Some(0x01) => raw.get(2..),
        Some(0x02) => raw.get(3..),
        _ => None,
    }
    .ok_or(DescriptorError::UnknownFormat)?;

    let mut file_id: Option<[u8; 4]> = None;
    let mut length = 0usize;
    while rest.len() > 2 && (file_id.is_none() || length == 0) {
        let value = rest.get(2..6);
        match (rest[0], value) {
            (0x10, Some(value)) => file_id = Some([value[0], value[1], value[2], value[3]]),
            (0x12, Some(value)) => {
                length = u32::from_be_bytes([value[0], value[1], value[2], value[3]]) as usize;
            }
            _ => {}
        }
        let skip = 2 + usize::from(rest[1]);
        rest = rest.get(skip..).unwrap_or_default();
    }

    match file_id {
        Some(id) if length > 0 => Ok(CertificateLocation {
            folder: [id[0], id[1]],
            file: [id[2], id[3]],
            length,
        }),
        _ => Err(DescriptorError::NoLocation),
    }
}

async fn read_certificate(
    session: &dyn UpstreamSession,
    reader: &str,
    location: CertificateLocation,
) -> Option<Vec<u8>> {
    let _ = session.cmd(Some(SELECT_MF), reader, false).await;
    let _ = session.cmd(Some(SELECT_APP), reader, false).await;
    let folder = format!("00A4010C02{}", hex::encode_upper(location.folder));
    let _ = session.cmd(Some(&folder), reader, false).await;
    let file = format!("00A4020C02{}", hex::encode_upper(location.file));
    let reply = session.cmd(Some(&file), reader, false).await;
    if !status_ok(&reply) {
        error!(reader = %reader, apdu = %file, "certificate file selection failed");
        return None;
    }

    let mut remaining = location.length as i64;
    let mut data = String::new();
    for block in 0..=u8::MAX {
        if remaining <= 0 {
            break;
        }
        let apdu = format!("00B0{block:02X}0000");
        let Some(line) = ok_line(&session.cmd(Some(&apdu), reader, false).await) else {
            break;
        };
        data.push_str(&line[..line.len() - 4]);
        remaining -= (line.len() / 2) as i64 - 2;
    }
    if remaining > 0 {
        error!(reader = %reader, apdu = %file, "certificate read incomplete");
        return None;
    }
    match hex::decode(&data) {
        Ok(der) => Some(der),
        Err(err) => {
            error!(reader = %reader, "certificate data is not hex: {err}");
            None
        }
    }
}

/// First reply line, if it ends with the success status.
fn ok_line(reply: &Result<Vec<String>, UpstreamError>) -> Option<String> {
    let line = reply.as_ref().ok()?.first()?;
    let ok = line.len() >= 4 && line.is_ascii() && line.ends_with(STATUS_OK);
    ok.then(|| line.clone())
}

fn status_ok(reply: &Result<Vec<String>, UpstreamError>) -> bool {
    ok_line(reply).is_some()
}

pub fn parse_certificate(der: &[u8]) -> Result<ParsedCertificate, ErrorStack> {
    let cert = X509::from_der(der)?;
    let (subject, common_name) = describe_name(cert.subject_name())?;
    let (issuer, _) = describe_name(cert.issuer_name())?;
    let is_ca = basic_constraints_ca(&cert.to_der()?);
    let since_epoch = Asn1Time::from_unix(0)?.diff(cert.not_before())?;
    let issued_at = i64::from(since_epoch.days) * 86_400 + i64::from(since_epoch.secs);
    Ok(ParsedCertificate {
        subject,
        issuer,
        common_name,
        is_ca,
        issued_at,
        encoded: STANDARD.encode(der),
    })
}

/// Tag, header length and content length of the DER element `input`
/// starts with. Only the header has to be present.
fn der_header(input: &[u8]) -> Option<(u8, usize, usize)> {
    let tag = *input.first()?;
    let first = *input.get(1)?;
    if first & 0x80 == 0 {
        return Some((tag, 2, usize::from(first)));
    }
    let count = usize::from(first & 0x7F);
    if count == 0 || count > 4 {
        return None;
    }
    let length = input
        .get(2..2 + count)?
        .iter()
        .fold(0usize, |length, &byte| (length << 8) | usize::from(byte));
    Some((tag, 2 + count, length))
}

/// One DER element as `(tag, content, rest)`.
fn der_element(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (tag, header, length) = der_header(input)?;
    let end = header.checked_add(length)?;
    let content = input.get(header..end)?;
    Some((tag, content, &input[end..]))
}

fn der_children(mut input: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    std::iter::from_fn(move || {
        let (tag, content, rest) = der_element(input)?;
        input = rest;
        Some((tag, content))
    })
}

/// The `cA` flag of the basicConstraints extension. Absent means end entity.
fn basic_constraints_ca(der: &[u8]) -> bool {
    let Some((DER_SEQUENCE, certificate, _)) = der_element(der) else {
        return false;
    };
    let Some((DER_SEQUENCE, tbs, _)) = der_element(certificate) else {
        return false;
    };
    let Some((_, explicit)) = der_children(tbs).find(|(tag, _)| *tag == DER_EXTENSIONS) else {
        return false;
    };
    let Some((DER_SEQUENCE, extensions, _)) = der_element(explicit) else {
        return false;
    };
    for (tag, extension) in der_children(extensions) {
        if tag != DER_SEQUENCE {
            continue;
        }
        let mut fields = der_children(extension);
        if fields.next() != Some((DER_OID, &BASIC_CONSTRAINTS_OID[..])) {
            continue;
        }
        let Some((_, value)) = fields.find(|(tag, _)| *tag == DER_OCTET_STRING) else {
            return false;
        };
        let Some((DER_SEQUENCE, constraints, _)) = der_element(value) else {
            return false;
        };
        return matches!(
            der_children(constraints).next(),
            Some((DER_BOOLEAN, [flag])) if *flag != 0
        );
    }
    false
}

/// Sorted `label: value` pairs joined by `, `, plus the common name.
fn describe_name(name: &X509NameRef) -> Result<(String, Option<String>), ErrorStack> {
    let mut parts = Vec::new();
    let mut common_name = None;
    for entry in name.entries() {
        let nid = entry.object().nid();
        let label = match nid.long_name() {
            Ok(label) => label.to_string(),
            Err(_) => entry.object().to_string(),
        };
        let value = entry.data().as_utf8()?.to_string();
        if nid == Nid::COMMONNAME {
            common_name = Some(value.clone());
        }
        parts.push(format!("{label}: {value}"));
    }
    parts.sort();
    Ok((parts.join(", "), common_name))
}

/// Walk issuer names through the card's CA list. Returns the chain and
/// whether it ended at a self-issued certificate.
fn build_chain(issuer: &str, cas: &[CertificateRecord]) -> (Vec<CertificateRecord>, bool) {
    let mut chain: Vec<CertificateRecord> = Vec::new();
    let mut next = issuer.to_string();
    while chain.len() < cas.len() {
        let Some(ca) = cas.iter().find(|ca| ca.name == next) else {
            return (chain, false);
        };
        chain.push(ca.clone());
        if ca.name == ca.issuer {
            return (chain, true);
        }
        next = ca.issuer.clone();
    }
    (chain, false)
}
