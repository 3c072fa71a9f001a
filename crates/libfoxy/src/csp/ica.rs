//! Token service for I.CA smart cards.

use std::sync::Arc;

use foxy_protocol::ErrorCode;
use tracing::{error, info, warn};

use super::{
    InventoryCell, TokenService, check_response, first_line, pin_marker, response_data,
};
use crate::error::FoxyError;
use crate::inventory::{self, CardLayout};
use crate::storage::{DEFAULT_MAX_ENUM_READERS, Inventory, TokenRecord};
use crate::upstream::{UpstreamError, UpstreamProvider, UpstreamSession};

/// Op-codes whose length byte may or may not be followed by `Le`.
const TRAILING_LE_OPS: [&str; 5] = ["0082", "0C46", "0CB0", "0CA4", "0C22"];
const WRONG_LENGTH: &str = "6700";
const SELECT_MF: &str = "00A4000C023F00";
const SELECT_PIN_FILE: &str = "00A4010C020604";
/// PIN references, tried in order. Card generations differ in which one
/// unlocks signing.
const PIN_REFERENCES: [&str; 2] = ["86", "81"];
const COMPUTE_SIGNATURE: &str = "002A9E9A00";
const MAX_PIN_BYTES: usize = 0xFF;

#[derive(Debug, Clone)]
pub struct CspConfig {
    /// Highest private key file id tried while the id is unknown.
    pub key_id_limit: u8,
    pub max_enum_readers: usize,
}

impl Default for CspConfig {
    fn default() -> Self {
        Self {
            key_id_limit: 15,
            max_enum_readers: DEFAULT_MAX_ENUM_READERS,
        }
    }
}

pub struct IcaService {
    config: CspConfig,
    storage: InventoryCell,
}

impl IcaService {
    pub fn new(config: CspConfig) -> Self {
        let inventory = Inventory::with_max_enum_readers(config.max_enum_readers);
        Self {
            config,
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
        let encoded = hex::encode_upper(password.as_bytes());
        for reference in PIN_REFERENCES {
            let apdu = format!("002000{reference}{:02X}{encoded}", password.len());
            let reply = session.cmd(Some(&apdu), reader, false).await;
            match check_response(&reply, reader, "PIN verification failed", 0) {
                None => token.update(|state| state.wrong_pin = None),
                Some(status) if status.starts_with("63C") => {
                    error!(
                        reader,
                        remaining = &status[3..],
                        "incorrect PIN, blocking its reuse"
                    );
                    token.update(|state| state.wrong_pin = Some(marker));
                    return Some(ErrorCode::WrongPin.into());
                }
                Some(status) => return Some(status),
            }
        }
        None
    }

    /// Sign with the cached key file id, or search for it from the
    /// configured ceiling down when it is not known yet.
    async fn compute_signature(
        &self,
        session: &dyn UpstreamSession,
        token: &TokenRecord,
        digest: &str,
        hash_id: &str,
    ) -> String {
        let reader = token.reader.as_str();
        let known = token.state().file_id;
        let mut file_id = if known == 0 {
            self.config.key_id_limit
        } else {
            known
        };
        let mut attempts_left = self.config.key_id_limit;
        let digest_len = digest.len() / 2;

        loop {
            let hash_apdu = format!("002241AA04890214{hash_id}");
            let _ = session.cmd(Some(&hash_apdu), reader, false).await;
            let key_apdu = format!("002241B60A840380{file_id:02X}0089031323{hash_id}");
            let reply = session.cmd(Some(&key_apdu), reader, false).await;
            let mut status = check_response(&reply, reader, "MSE set key failed", 0);

            if status.is_none() {
                let digest_apdu = format!(
                    "002A90A0{:02X}90{:02X}{digest}",
                    digest_len + 2,
                    digest_len
                );
                let reply = session.cmd(Some(&digest_apdu), reader, false).await;
                status = check_response(&reply, reader, "sending digest failed", 0);
            }

            if status.is_none() {
                let reply = session.cmd(Some(COMPUTE_SIGNATURE), reader, false).await;
                match check_response(&reply, reader, "signing failed", 0) {
                    None => {
                        if known == 0 {
                            info!(reader, file_id, "private key file id discovered");
                            token.update(|state| state.file_id = file_id);
                        }
                        return response_data(&reply)
                            .unwrap_or_else(|| ErrorCode::InternalError.into());
                    }
                    Some(failed) => status = Some(failed),
                }
            }

            let status = status.unwrap_or_else(|| ErrorCode::InternalError.into());
            if known != 0 || attempts_left == 0 || !is_retryable(&status) {
                warn!(reader, file_id, %status, "signing gave up");
                return status;
            }
            attempts_left -= 1;
            file_id = file_id.saturating_sub(1);
        }
    }
}

/// Device statuses keep the key search going; proxy error codes (no usable
/// upstream reply) end it.
fn is_retryable(status: &str) -> bool {
    ErrorCode::from_wire(status).is_none()
}

fn hash_id(digest: &str) -> Option<&'static str> {
    match digest.len() {
        40 => Some("10"),
        64 => Some("30"),
        _ => None,
    }
}

/// Whether `command` carries a length byte that exactly covers its data,
/// in which case the card may expect a trailing `Le`.
fn expects_trailing_le(command: &str) -> Result<bool, hex::FromHexError> {
    let op = command.get(..4).map(str::to_ascii_uppercase);
    if command.len() <= 4 || !op.is_some_and(|op| TRAILING_LE_OPS.contains(&op.as_str())) {
        return Ok(false);
    }
    let bytes = hex::decode(command)?;
    Ok(bytes.len() > 4 && bytes.len() == usize::from(bytes[4]) + 5)
}

fn is_wrong_length(reply: &Result<Vec<String>, UpstreamError>) -> bool {
    matches!(reply, Ok(lines) if lines.first().is_some_and(|line| line == WRONG_LENGTH))
}

#[async_trait::async_trait]
impl TokenService for IcaService {
    fn inventory(&self) -> Arc<Inventory> {
        self.storage.load()
    }

    async fn init(&self, provider: Arc<dyn UpstreamProvider>) -> Result<(), FoxyError> {
        let previous = self.inventory();
        let next = inventory::build(
            provider,
            &previous,
            self.config.max_enum_readers,
            &CardLayout::Ica,
        )
        .await?;
        self.install(next);
        Ok(())
    }

    async fn apdu(&self, session: &dyn UpstreamSession, token: &str, command: &str) -> String {
        let command = command.trim();
        let append_first = match expects_trailing_le(command) {
            Ok(append) => append,
            Err(err) => {
                warn!(token, command, "APDU is not hex: {err}");
                return ErrorCode::WrongData.into();
            }
        };
        let (first, second) = if append_first {
            (format!("{command}00"), command.to_string())
        } else {
            (command.to_string(), format!("{command}00"))
        };

        let mut reply = session.cmd(Some(&first), token, false).await;
        if is_wrong_length(&reply) {
            reply = session.cmd(Some(&second), token, false).await;
        }
        first_line(reply, token)
    }

    async fn sign(
        &self,
        session: &dyn UpstreamSession,
        alias: &str,
        digest: &str,
        password: Option<&str>,
    ) -> String {
        let Some(hash_id) = hash_id(digest) else {
            warn!(alias, length = digest.len(), "digest has unsupported length");
            return ErrorCode::WrongData.into();
        };
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

        let _ = session.cmd(Some(SELECT_MF), reader, true).await;
        let reply = session.cmd(Some(SELECT_PIN_FILE), reader, false).await;
        if let Some(status) = check_response(&reply, reader, "selection before signing failed", 0)
        {
            return status;
        }

        if let (Some(password), Some(marker)) = (password, marker) {
            if let Some(status) = self.verify_pin(session, &token, password, marker).await {
                return status;
            }
        }

        self.compute_signature(session, &token, digest, hash_id).await
    }

    async fn reset(&self, session: &dyn UpstreamSession, token: &str) -> String {
        let reply = session.cmd(None, token, true).await;
        first_line(reply, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCard, MockUpstream};
    use crate::storage::ReaderRecord;

    const ATR: &str = "3BFF1300FF8131FE45";
    const SHA1: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn service_with_token(reader: &str, name: &str) -> IcaService {
        let service = IcaService::new(CspConfig::default());
        let mut inventory = Inventory::default();
        inventory.insert_reader(reader.to_string(), ReaderRecord::default());
        inventory.insert_token(TokenRecord::new(name.to_string(), None, reader.to_string()));
        service.install(inventory);
        service
    }

    #[tokio::test]
    async fn sign_rejects_bad_digest_without_upstream_contact() {
        let upstream = MockUpstream::new();
        upstream.add_card("T1", MockCard::new(ATR));
        let service = service_with_token("T1", "commonName: alice");

        let digests = [String::new(), "abcd".to_string(), "a".repeat(41), "a".repeat(63)];
        for digest in &digests {
            assert_eq!(service.sign(&upstream, "T1", digest, None).await, "WrongData");
        }
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn sign_resolves_aliases() {
        let upstream = MockUpstream::new();
        let service = IcaService::new(CspConfig::default());
        let mut inventory = Inventory::default();
        inventory.insert_token(TokenRecord::new("commonName: Jan Novak".into(), None, "T1".into()));
        inventory.insert_token(TokenRecord::new("commonName: Eva Novak".into(), None, "T2".into()));
        service.install(inventory);

        assert_eq!(service.sign(&upstream, "Carol", SHA1, None).await, "ReaderNotFound");
        assert_eq!(service.sign(&upstream, "Novak", SHA1, None).await, "VagueName");
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn wrong_pin_sets_marker_and_short_circuits() {
        let upstream = MockUpstream::new();
        upstream.add_card(
            "T1",
            MockCard::new(ATR).respond_prefix("00200086", &["63C1"]),
        );
        let service = service_with_token("T1", "commonName: alice");

        let first = service.sign(&upstream, "T1", SHA1, Some("BADPIN")).await;
        assert_eq!(first, "WrongPin");
        let token = service.inventory().token_for_reader("T1").expect("token");
        assert_eq!(token.state().wrong_pin, Some(pin_marker("BADPIN")));

        upstream.clear_calls();
        let second = service.sign(&upstream, "T1", SHA1, Some("BADPIN")).await;
        assert_eq!(second, "WrongPin");
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn correct_pin_clears_marker() {
        let upstream = MockUpstream::new();
        upstream.add_card(
            "T1",
            MockCard::new(ATR).respond(COMPUTE_SIGNATURE, &["C0FFEE9000"]),
        );
        let service = service_with_token("T1", "commonName: alice");
        let token = service.inventory().token_for_reader("T1").expect("token");
        token.update(|state| {
            state.wrong_pin = Some(pin_marker("1111"));
            state.file_id = 3;
        });

        assert_eq!(service.sign(&upstream, "T1", SHA1, Some("1234")).await, "C0FFEE");
        assert_eq!(token.state().wrong_pin, None);
        let sent: Vec<_> = upstream.calls().into_iter().filter_map(|c| c.apdu).collect();
        assert!(sent.contains(&"002000860431323334".to_string()));
        assert!(sent.contains(&"002000810431323334".to_string()));
    }

    #[tokio::test]
    async fn key_search_discovers_and_caches_file_id() {
        let upstream = MockUpstream::new();
        upstream.add_card(
            "T1",
            MockCard::new(ATR)
                .respond("002241B60A8403800C008903132330", &["9000"])
                .respond_prefix("002241B6", &["6A88"])
                .respond(COMPUTE_SIGNATURE, &["5151519000"]),
        );
        let service = service_with_token("T1", "commonName: alice");
        let digest = "b".repeat(64);

        assert_eq!(service.sign(&upstream, "alice", &digest, None).await, "515151");
        let token = service.inventory().token_for_reader("T1").expect("token");
        assert_eq!(token.state().file_id, 0x0C);
        let key_attempts = upstream
            .calls()
            .iter()
            .filter(|c| c.apdu.as_deref().is_some_and(|a| a.starts_with("002241B6")))
            .count();
        assert_eq!(key_attempts, 4);

        upstream.clear_calls();
        assert_eq!(service.sign(&upstream, "alice", &digest, None).await, "515151");
        let key_attempts: Vec<_> = upstream
            .calls()
            .into_iter()
            .filter_map(|c| c.apdu)
            .filter(|a| a.starts_with("002241B6"))
            .collect();
        assert_eq!(key_attempts, vec!["002241B60A8403800C008903132330".to_string()]);
    }

    #[tokio::test]
    async fn key_search_is_bounded_and_reports_last_status() {
        let upstream = MockUpstream::new();
        upstream.add_card("T1", MockCard::new(ATR).respond_prefix("002241B6", &["6A88"]));
        let service = service_with_token("T1", "commonName: alice");

        assert_eq!(service.sign(&upstream, "T1", SHA1, None).await, "6A88");
        let key_attempts = upstream
            .calls()
            .iter()
            .filter(|c| c.apdu.as_deref().is_some_and(|a| a.starts_with("002241B6")))
            .count();
        assert_eq!(key_attempts, 16);
        let token = service.inventory().token_for_reader("T1").expect("token");
        assert_eq!(token.state().file_id, 0);
    }

    #[tokio::test]
    async fn key_search_stops_without_upstream_reply() {
        let upstream = MockUpstream::new();
        upstream.add_card("T1", MockCard::new(ATR).respond_prefix("002241B6", &[]));
        let service = service_with_token("T1", "commonName: alice");

        assert_eq!(service.sign(&upstream, "T1", SHA1, None).await, "InternalError");
        let key_attempts = upstream
            .calls()
            .iter()
            .filter(|c| c.apdu.as_deref().is_some_and(|a| a.starts_with("002241B6")))
            .count();
        assert_eq!(key_attempts, 1);
    }

    #[tokio::test]
    async fn apdu_retries_on_wrong_length() {
        let upstream = MockUpstream::new();
        upstream.add_card(
            "T1",
            MockCard::new(ATR)
                .respond("00B0000000", &["6700"])
                .respond("00B000000000", &["0102039000"]),
        );
        let service = service_with_token("T1", "commonName: alice");

        assert_eq!(service.apdu(&upstream, "T1", "00B0000000").await, "0102039000");
        let sent: Vec<_> = upstream.calls().into_iter().filter_map(|c| c.apdu).collect();
        assert_eq!(sent, vec!["00B0000000".to_string(), "00B000000000".to_string()]);
    }

    #[tokio::test]
    async fn apdu_with_exact_length_sends_le_first() {
        let upstream = MockUpstream::new();
        upstream.add_card(
            "T1",
            MockCard::new(ATR).respond("0CA4020C02563000", &["6700"]),
        );
        let service = service_with_token("T1", "commonName: alice");

        assert_eq!(service.apdu(&upstream, "T1", "0CA4020C025630").await, "9000");
        let sent: Vec<_> = upstream.calls().into_iter().filter_map(|c| c.apdu).collect();
        assert_eq!(
            sent,
            vec!["0CA4020C02563000".to_string(), "0CA4020C025630".to_string()]
        );
        assert_eq!(service.apdu(&upstream, "T1", "0CA4ZZ").await, "WrongData");
    }

    #[tokio::test]
    async fn reset_returns_atr() {
        let upstream = MockUpstream::new();
        upstream.add_card("T1", MockCard::new(ATR));
        let service = service_with_token("T1", "commonName: alice");

        assert_eq!(service.reset(&upstream, "T1").await, ATR);
        assert_eq!(service.reset(&upstream, "T9").await, "InternalError");
    }
}
