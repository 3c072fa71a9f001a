//! Token service for PostSignum QSCD cards.
//!
//! The card signs a complete PKCS#1 v1.5 block, sent in two chained halves.
//! CA certificates are not stored on the card; chains are built from a
//! fixed PostSignum list.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use foxy_protocol::ErrorCode;
use tracing::{error, warn};

use super::{
    CspConfig, InventoryCell, TokenService, check_response, first_line, pin_marker, response_data,
};
use crate::error::FoxyError;
use crate::inventory::{self, CardLayout, SELECT_QSCD_STORE, parse_certificate};
use crate::storage::{CertificateRecord, Inventory, TokenRecord};
use crate::upstream::{UpstreamProvider, UpstreamSession};

/// Base64 DER, one certificate per line.
const POSTSIGNUM_CERTIFICATES: &str = include_str!("postsignum_cas.txt");
const RESTORE_SECURITY_ENV: &str = "0022F303";
const SET_SIGNING_KEY: &str = "0022F1B80383010E";
const PIN_REFERENCE: &str = "10";
const MAX_PIN_BYTES: usize = 0xFF;
/// Modulus length in bytes.
const BLOCK_BYTES: usize = 256;

pub struct PostSignumService {
    config: CspConfig,
    cas: Arc<[CertificateRecord]>,
    storage: InventoryCell,
}

impl PostSignumService {
    pub fn new(config: CspConfig) -> Self {
        Self::with_cas(config, fixed_cas())
    }

    /// Service chaining cards to `cas` instead of the PostSignum list.
    pub fn with_cas(config: CspConfig, cas: Vec<CertificateRecord>) -> Self {
        let inventory = Inventory::with_max_enum_readers(config.max_enum_readers);
        Self {
            config,
            cas: Arc::from(cas),
            storage: InventoryCell::new(inventory),
        }
    }

    /// Replace the inventory snapshot.
    pub fn install(&self, inventory: Inventory) {
        self.storage.store(inventory);
    }

    async fn verify_pin(
        &self,
        session: &dyn UpstreamSession,
        token: &TokenRecord,
        password: &str,
        marker: String,
    ) -> Option<String> {
        let reader = token.reader.as_str();
        if password.len() > MAX_PIN_BYTES {
            return Some(ErrorCode::WrongData.into());
        }
        let _ = session.cmd(Some(SELECT_QSCD_STORE), reader, false).await;
        let apdu = format!(
            "002000{PIN_REFERENCE}{:02X}{}",
            password.len(),
            hex::encode_upper(password.as_bytes())
        );
        let reply = session.cmd(Some(&apdu), reader, false).await;
        match check_response(&reply, reader, "PIN verification failed", 0) {
            None => {
                token.update(|state| state.wrong_pin = None);
                None
            }
            Some(status) if status.starts_with("63C") => {
                error!(
                    reader,
                    remaining = &status[3..],
                    "incorrect PIN, blocking its reuse"
                );
                token.update(|state| state.wrong_pin = Some(marker));
                Some(ErrorCode::WrongPin.into())
            }
            Some(_) => Some(ErrorCode::WrongPin.into()),
        }
    }
}

/// DER `DigestInfo` prefix for a hex digest of this length.
fn digest_info(digest: &str) -> Option<&'static str> {
    match digest.len() {
        40 => Some("3021300906052B0E03021A05000414"),
        64 => Some("3031300D060960864801650304020105000420"),
        96 => Some("3041300D060960864801650304020205000430"),
        128 => Some("3051300D060960864801650304020305000440"),
        _ => None,
    }
}

/// EMSA-PKCS1-v1_5 encoding of `digest` for a 2048-bit key, as hex.
fn pkcs1_block(prefix: &str, digest: &str) -> String {
    let payload = prefix.len() / 2 + digest.len() / 2;
    let fill = BLOCK_BYTES - 3 - payload;
    format!("0001{}00{prefix}{}", "FF".repeat(fill), digest.to_ascii_uppercase())
}

fn fixed_cas() -> Vec<CertificateRecord> {
    POSTSIGNUM_CERTIFICATES
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let der = STANDARD
                .decode(line)
                .map_err(|err| warn!("bundled certificate is not base64: {err}"))
                .ok()?;
            let cert = parse_certificate(&der)
                .map_err(|err| warn!("bundled certificate does not parse: {err}"))
                .ok()?;
            cert.is_ca.then(|| CertificateRecord {
                name: cert.subject,
                issuer: cert.issuer,
                cert: cert.encoded,
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl TokenService for PostSignumService {
    fn inventory(&self) -> Arc<Inventory> {
        self.storage.load()
    }

    async fn init(&self, provider: Arc<dyn UpstreamProvider>) -> Result<(), FoxyError> {
        let previous = self.inventory();
        let layout = CardLayout::Qscd {
            cas: Arc::clone(&self.cas),
        };
        let next =
            inventory::build(provider, &previous, self.config.max_enum_readers, &layout).await?;
        self.install(next);
        Ok(())
    }

    async fn apdu(&self, session: &dyn UpstreamSession, token: &str, command: &str) -> String {
        let reply = session.cmd(Some(command.trim()), token, false).await;
        first_line(reply, token)
    }

    async fn sign(
        &self,
        session: &dyn UpstreamSession,
        alias: &str,
        digest: &str,
        password: Option<&str>,
    ) -> String {
        let Some(prefix) = digest_info(digest) else {
            warn!(alias, length = digest.len(), "digest has unsupported length");
            return ErrorCode::WrongData.into();
        };
        if hex::decode(digest).is_err() {
            warn!(alias, "digest is not hex");
            return ErrorCode::WrongData.into();
        }
        let tokens = self.find_tokens(alias);
        let token = match tokens.as_slice() {
            [token] => Arc::clone(token),
            [] => return ErrorCode::ReaderNotFound.into(),
            _ => return ErrorCode::VagueName.into(),
        };
        let reader = token.reader.as_str();

        let marker = password.map(pin_marker);
        if let Some(marker) = &marker {
            if token.state().wrong_pin.as_ref() == Some(marker) {
                error!(reader, "blocked repeated use of an incorrect PIN");
                return ErrorCode::WrongPin.into();
            }
        }
        if let (Some(password), Some(marker)) = (password, marker) {
            if let Some(status) = self.verify_pin(session, &token, password, marker).await {
                return status;
            }
        }

        for (apdu, context) in [
            (RESTORE_SECURITY_ENV, "restoring security environment failed"),
            (SET_SIGNING_KEY, "selecting signing key failed"),
        ] {
            let reply = session.cmd(Some(apdu), reader, false).await;
            if let Some(status) = check_response(&reply, reader, context, 0) {
                return status;
            }
        }

        let block = pkcs1_block(prefix, digest);
        let (first, last) = block.split_at(block.len() / 2);
        let reply = session
            .cmd(Some(&format!("102A80868100{first}00")), reader, false)
            .await;
        if let Some(status) = check_response(&reply, reader, "sending first block failed", 0) {
            return status;
        }
        let reply = session
            .cmd(Some(&format!("002A808680{last}00")), reader, false)
            .await;
        match check_response(&reply, reader, "signing failed", 0) {
            None => response_data(&reply).unwrap_or_else(|| ErrorCode::InternalError.into()),
            Some(status) => status,
        }
    }

    async fn reset(&self, session: &dyn UpstreamSession, token: &str) -> String {
        let reply = session.cmd(None, token, true).await;
        first_line(reply, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCard, MockUpstream, issue_certificate};
    use crate::storage::ReaderRecord;

    const ATR: &str = "3BDF18FF81F1FE43003F03834D494641524520506C7573";
    const SHA256: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn service_with_token(reader: &str, name: &str) -> PostSignumService {
        let service = PostSignumService::with_cas(CspConfig::default(), Vec::new());
        let mut inventory = Inventory::default();
        inventory.insert_reader(reader.to_string(), ReaderRecord::default());
        inventory.insert_token(TokenRecord::new(name.to_string(), None, reader.to_string()));
        service.install(inventory);
        service
    }

    fn sent(upstream: &MockUpstream) -> Vec<String> {
        upstream.calls().into_iter().filter_map(|c| c.apdu).collect()
    }

    #[tokio::test]
    async fn sign_sends_a_padded_block_in_two_halves() {
        let upstream = MockUpstream::new();
        upstream.add_card(
            "T1",
            MockCard::new(ATR).respond_prefix("002A808680", &["ABCDEF9000"]),
        );
        let service = service_with_token("T1", "commonName: Jana Dvorak");

        let signature = service.sign(&upstream, "Dvorak", SHA256, Some("1234")).await;
        assert_eq!(signature, "ABCDEF");

        let sent = sent(&upstream);
        assert_eq!(sent[0], SELECT_QSCD_STORE);
        assert_eq!(sent[1], "002000100431323334");
        assert_eq!(sent[2], RESTORE_SECURITY_ENV);
        assert_eq!(sent[3], SET_SIGNING_KEY);

        let first = sent[4].strip_prefix("102A80868100").unwrap();
        let last = sent[5].strip_prefix("002A808680").unwrap();
        let block = format!(
            "{}{}",
            first.strip_suffix("00").unwrap(),
            last.strip_suffix("00").unwrap()
        );
        assert_eq!(block.len(), 512);
        assert!(block.starts_with("0001FFFF"));
        assert!(block.ends_with(&format!(
            "003031300D060960864801650304020105000420{}",
            SHA256.to_ascii_uppercase()
        )));
    }

    #[tokio::test]
    async fn every_supported_digest_fills_the_block() {
        for length in [40, 64, 96, 128] {
            let digest = "c".repeat(length);
            let block = pkcs1_block(digest_info(&digest).unwrap(), &digest);
            assert_eq!(block.len(), 2 * BLOCK_BYTES);
        }

        let upstream = MockUpstream::new();
        upstream.add_card("T1", MockCard::new(ATR));
        let service = service_with_token("T1", "commonName: Jana Dvorak");
        let digests = [String::new(), "abcd".to_string(), "a".repeat(63), "z".repeat(64)];
        for digest in &digests {
            assert_eq!(service.sign(&upstream, "T1", digest, None).await, "WrongData");
        }
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn wrong_pin_sets_marker_and_short_circuits() {
        let upstream = MockUpstream::new();
        upstream.add_card("T1", MockCard::new(ATR).respond_prefix("00200010", &["63C2"]));
        let service = service_with_token("T1", "commonName: Jana Dvorak");

        assert_eq!(service.sign(&upstream, "T1", SHA256, Some("0000")).await, "WrongPin");
        let token = service.inventory().token_for_reader("T1").unwrap();
        assert_eq!(token.state().wrong_pin, Some(pin_marker("0000")));
        assert!(!sent(&upstream).iter().any(|apdu| apdu.starts_with("0022")));

        upstream.clear_calls();
        assert_eq!(service.sign(&upstream, "T1", SHA256, Some("0000")).await, "WrongPin");
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn blocked_pin_is_not_remembered() {
        let upstream = MockUpstream::new();
        upstream.add_card("T1", MockCard::new(ATR).respond_prefix("00200010", &["6983"]));
        let service = service_with_token("T1", "commonName: Jana Dvorak");

        assert_eq!(service.sign(&upstream, "T1", SHA256, Some("0000")).await, "WrongPin");
        let token = service.inventory().token_for_reader("T1").unwrap();
        assert_eq!(token.state().wrong_pin, None);
    }

    #[tokio::test]
    async fn security_environment_failure_is_returned() {
        let upstream = MockUpstream::new();
        upstream.add_card("T1", MockCard::new(ATR).respond(SET_SIGNING_KEY, &["6A88"]));
        let service = service_with_token("T1", "commonName: Jana Dvorak");

        assert_eq!(service.sign(&upstream, "T1", SHA256, None).await, "6A88");
        assert!(!sent(&upstream).iter().any(|apdu| apdu.contains("2A8086")));
    }

    #[tokio::test]
    async fn apdu_and_reset_pass_through() {
        let upstream = MockUpstream::new();
        upstream.add_card("T1", MockCard::new(ATR).respond("00B0000010", &["01029000"]));
        let service = service_with_token("T1", "commonName: Jana Dvorak");

        assert_eq!(service.apdu(&upstream, "T1", " 00B0000010 ").await, "01029000");
        assert_eq!(service.reset(&upstream, "T1").await, ATR);
        assert_eq!(service.reset(&upstream, "T9").await, "InternalError");
    }

    #[test]
    fn bundled_list_holds_only_cas() {
        let cas = fixed_cas();
        assert_eq!(cas.len(), 10);
        assert!(cas.iter().all(|ca| !ca.name.is_empty() && !ca.cert.is_empty()));
    }

    #[tokio::test]
    async fn init_chains_cards_to_the_configured_cas() {
        let (root, root_key) = issue_certificate("QSCD Root", None, true, 1_500_000_000);
        let (user, _) =
            issue_certificate("Jana Dvorak", Some((&root, &root_key)), false, 1_600_000_000);
        let root = parse_certificate(&root.to_der().unwrap()).unwrap();
        let ca = CertificateRecord {
            name: root.subject,
            issuer: root.issuer,
            cert: root.encoded,
        };

        let upstream = MockUpstream::new();
        upstream.add_card(
            "Reader 01",
            MockCard::new(ATR).with_certificate_file(user.to_der().unwrap()),
        );
        let service = PostSignumService::with_cas(CspConfig::default(), vec![ca.clone()]);
        service.init(Arc::new(upstream)).await.unwrap();

        assert_eq!(service.chain("Dvorak").split(':').count(), 2);
        assert!(service.chain("Dvorak").ends_with(&ca.cert));
    }
}
