//! Token services: the operations a provider offers on its tokens.
//!
//! Provider specific work (talking to a card) is left to each implementation.
//! Everything that only needs the inventory is implemented here once.

pub mod ica;
pub mod postsignum;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use foxy_protocol::reader::{decode_reader, encode_reader, encode_reader_b64};
use foxy_protocol::ErrorCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::FoxyError;
use crate::storage::{Inventory, TokenRecord};
use crate::upstream::{UpstreamError, UpstreamProvider, UpstreamSession};

pub use ica::{CspConfig, IcaService};
pub use postsignum::PostSignumService;

const STATUS_OK: &str = "9000";

/// Card family served by the proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Ica,
    PostSignum,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown provider {0:?}, expected ica or postsignum")]
pub struct UnknownProvider(String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ica" => Ok(Provider::Ica),
            "postsignum" => Ok(Provider::PostSignum),
            _ => Err(UnknownProvider(raw.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Ica => f.write_str("ica"),
            Provider::PostSignum => f.write_str("postsignum"),
        }
    }
}

/// Token service for `provider`.
pub fn token_service(provider: Provider, config: CspConfig) -> Arc<dyn TokenService> {
    match provider {
        Provider::Ica => Arc::new(IcaService::new(config)),
        Provider::PostSignum => Arc::new(PostSignumService::new(config)),
    }
}

/// Inventory snapshot of a service, swapped as a whole.
pub(crate) struct InventoryCell(RwLock<Arc<Inventory>>);

impl InventoryCell {
    pub(crate) fn new(inventory: Inventory) -> Self {
        Self(RwLock::new(Arc::new(inventory)))
    }

    pub(crate) fn load(&self) -> Arc<Inventory> {
        match self.0.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub(crate) fn store(&self, inventory: Inventory) {
        let inventory = Arc::new(inventory);
        match self.0.write() {
            Ok(mut guard) => *guard = inventory,
            Err(poisoned) => *poisoned.into_inner() = inventory,
        }
    }
}

#[async_trait::async_trait]
pub trait TokenService: Send + Sync {
    /// Current inventory snapshot.
    fn inventory(&self) -> Arc<Inventory>;

    /// Rebuild the inventory from the upstream and swap it in.
    async fn init(&self, provider: Arc<dyn UpstreamProvider>) -> Result<(), FoxyError>;

    async fn apdu(&self, session: &dyn UpstreamSession, token: &str, command: &str) -> String;

    async fn sign(
        &self,
        session: &dyn UpstreamSession,
        alias: &str,
        digest: &str,
        password: Option<&str>,
    ) -> String;

    async fn reset(&self, session: &dyn UpstreamSession, token: &str) -> String;

    /// Tokens whose reader is `alias` or whose certificate name contains it.
    fn find_tokens(&self, alias: &str) -> Vec<Arc<TokenRecord>> {
        if alias.is_empty() {
            return Vec::new();
        }
        let reader = decode_reader(alias);
        let inventory = self.inventory();
        let found: Vec<_> = inventory
            .tokens()
            .iter()
            .filter(|token| token.reader == reader || token.name.contains(alias))
            .cloned()
            .collect();
        debug!(
            alias,
            tested = inventory.tokens().len(),
            found = found.len(),
            "token lookup"
        );
        found
    }

    /// `cert[:caCert]*` for the single token matching `alias`.
    fn chain(&self, alias: &str) -> String {
        let tokens = self.find_tokens(alias);
        match tokens.as_slice() {
            [token] => self
                .inventory()
                .reader(&token.reader)
                .map(|record| record.chain_response())
                .unwrap_or_default(),
            [] => ErrorCode::ReaderNotFound.into(),
            _ => ErrorCode::VagueName.into(),
        }
    }

    /// Base64 of every known certificate name.
    fn aliases(&self) -> Vec<String> {
        self.inventory()
            .tokens()
            .iter()
            .map(|token| STANDARD.encode(&token.name))
            .collect()
    }

    /// Readers holding a certificate that matches `filter`, most recently
    /// prioritized first. `maximum` of 0 (or above the configured bound)
    /// falls back to the configured bound.
    fn enumerate(&self, filter: &str, maximum: Option<&str>) -> Vec<String> {
        let inventory = self.inventory();
        let bound = inventory.max_enum_readers();
        let mut maximum = maximum
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if (maximum == 0 || maximum > bound) && bound > 0 {
            maximum = bound;
        }

        let mut matches: Vec<(u64, String)> = inventory
            .tokens()
            .iter()
            .filter_map(|token| {
                let name = encode_reader(&token.reader);
                let hit = filter.is_empty()
                    || filter == "*"
                    || name.contains(filter)
                    || token.name.contains(filter);
                if !hit {
                    return None;
                }
                let priority = inventory
                    .reader(&token.reader)
                    .map(|record| record.priority())
                    .unwrap_or_default();
                Some((priority, STANDARD.encode(name)))
            })
            .collect();
        matches.sort_by(|a, b| b.0.cmp(&a.0));
        if maximum > 0 {
            matches.truncate(maximum);
        }
        matches.into_iter().map(|(_, name)| name).collect()
    }

    /// All readers, most recently prioritized first, bounded by the
    /// configured maximum. `subset` 1 keeps readers holding a certificate,
    /// 2 keeps readers without one; anything else keeps all.
    fn list(&self, filter: &str, source: Option<&str>, subset: Option<&str>) -> Vec<String> {
        let subset = subset
            .and_then(|raw| raw.trim().parse::<u8>().ok())
            .unwrap_or(0);
        debug!(
            filter,
            source = source.unwrap_or("unknown"),
            subset,
            "listing readers"
        );
        ordered_readers(&self.inventory(), subset)
            .into_iter()
            .map(|reader| encode_reader_b64(&reader))
            .collect()
    }

    /// Move readers whose client name ends with `name` to the top of the
    /// listings and make `limit` the listing bound. A `limit` of 0 changes
    /// nothing and returns the current listing.
    fn prioritize(&self, name: &str, limit: usize) -> Vec<String> {
        let inventory = self.inventory();
        if limit == 0 {
            return ordered_readers(&inventory, 0)
                .iter()
                .map(|reader| encode_reader(reader))
                .collect();
        }

        inventory.set_max_enum_readers(limit);
        let mut updated = Vec::new();
        if name.is_empty() {
            return updated;
        }
        for (reader, record) in inventory.readers() {
            let terminal = encode_reader(reader);
            if !terminal.ends_with(name) {
                continue;
            }
            let priority = inventory.bump_priority();
            record
                .priority
                .store(priority, std::sync::atomic::Ordering::Relaxed);
            let user = record.subject.as_deref().unwrap_or("---");
            updated.insert(0, format!("{terminal} ({user})"));
        }
        updated
    }
}

fn ordered_readers(inventory: &Inventory, subset: u8) -> Vec<String> {
    let mut ordered: Vec<(&String, u64)> = inventory
        .readers()
        .filter(|(_, record)| match subset {
            1 => record.cert.is_some(),
            2 => record.cert.is_none(),
            _ => true,
        })
        .map(|(reader, record)| (reader, record.priority()))
        .collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1));
    let bound = inventory.max_enum_readers();
    if bound > 0 {
        ordered.truncate(bound);
    }
    ordered.into_iter().map(|(reader, _)| reader.clone()).collect()
}

/// Inspect line `index` of an upstream reply. `None` means success,
/// otherwise the status (or error code) to hand back to the client.
pub fn check_response(
    reply: &Result<Vec<String>, UpstreamError>,
    token: &str,
    message: &str,
    index: usize,
) -> Option<String> {
    let lines = match reply {
        Ok(lines) => lines,
        Err(err) => {
            error!(token, "{message}: {err}");
            return Some(ErrorCode::InternalError.into());
        }
    };
    let Some(line) = lines.get(index) else {
        error!(token, "{message}: reply has no line {index} ({lines:?})");
        return Some(ErrorCode::InternalError.into());
    };
    let Some(status) = line.len().checked_sub(4).and_then(|start| line.get(start..)) else {
        error!(token, "{message}: code {line}");
        return Some(ErrorCode::InternalError.into());
    };
    let status = status.to_ascii_uppercase();
    if status != STATUS_OK {
        debug!(token, "{message}: code {line}");
        return Some(status);
    }
    None
}

/// What is remembered of a PIN the card rejected.
pub(crate) fn pin_marker(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// First reply line as is, `InternalError` without one.
pub(crate) fn first_line(reply: Result<Vec<String>, UpstreamError>, token: &str) -> String {
    match reply {
        Ok(lines) => lines
            .into_iter()
            .next()
            .unwrap_or_else(|| ErrorCode::InternalError.into()),
        Err(err) => {
            warn!(token, "upstream command failed: {err}");
            ErrorCode::InternalError.into()
        }
    }
}

/// Response data of the first reply line with the status word removed.
pub fn response_data(reply: &Result<Vec<String>, UpstreamError>) -> Option<String> {
    let line = reply.as_ref().ok()?.first()?;
    line.get(..line.len().saturating_sub(4)).map(str::to_string)
}
