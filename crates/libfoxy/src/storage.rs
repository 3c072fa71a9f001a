//! Reader index shared by the token services and the dispatcher.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const DEFAULT_MAX_ENUM_READERS: usize = 2;

/// A certificate as stored in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub name: String,
    pub issuer: String,
    /// Base64 of the DER encoding.
    pub cert: String,
}

/// Everything known about one attached reader.
#[derive(Debug, Default)]
pub struct ReaderRecord {
    pub subject: Option<String>,
    pub cert: Option<String>,
    pub chain: Vec<CertificateRecord>,
    pub priority: AtomicU64,
}

impl ReaderRecord {
    pub fn priority(&self) -> u64 {
        self.priority.load(Ordering::Relaxed)
    }

    /// `cert[:caCert]*`, or empty when the reader holds no certificate.
    pub fn chain_response(&self) -> String {
        let Some(cert) = &self.cert else {
            return String::new();
        };
        let mut parts = vec![cert.as_str()];
        parts.extend(self.chain.iter().map(|ca| ca.cert.as_str()));
        parts.join(":")
    }
}

/// Mutable per-token state. Only touched while holding the token's lock.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TokenState {
    /// Hash of the last PIN the device rejected.
    pub wrong_pin: Option<String>,
    /// Private key file id, 0 while unknown.
    pub file_id: u8,
}

/// A signing identity found on a reader.
#[derive(Debug)]
pub struct TokenRecord {
    pub name: String,
    pub short_name: Option<String>,
    pub reader: String,
    state: Mutex<TokenState>,
}

impl TokenRecord {
    pub fn new(name: String, short_name: Option<String>, reader: String) -> Self {
        Self {
            name,
            short_name,
            reader,
            state: Mutex::new(TokenState::default()),
        }
    }

    pub fn state(&self) -> TokenState {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut TokenState) -> R) -> R {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// Snapshot of the upstream inventory. Replaced as a whole on rebuild.
#[derive(Debug)]
pub struct Inventory {
    readers: BTreeMap<String, ReaderRecord>,
    tokens: Vec<Arc<TokenRecord>>,
    names: HashMap<String, String>,
    card_cas: HashMap<String, Vec<CertificateRecord>>,
    last_priority: AtomicU64,
    max_enum_readers: AtomicUsize,
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            readers: BTreeMap::new(),
            tokens: Vec::new(),
            names: HashMap::new(),
            card_cas: HashMap::new(),
            last_priority: AtomicU64::new(0),
            max_enum_readers: AtomicUsize::new(DEFAULT_MAX_ENUM_READERS),
        }
    }
}

impl Inventory {
    pub fn with_max_enum_readers(max_enum_readers: usize) -> Self {
        let inventory = Self::default();
        inventory
            .max_enum_readers
            .store(max_enum_readers, Ordering::Relaxed);
        inventory
    }

    pub fn insert_reader(&mut self, reader: String, record: ReaderRecord) {
        self.readers.insert(reader, record);
    }

    pub fn insert_token(&mut self, token: TokenRecord) {
        self.names.insert(token.name.clone(), token.reader.clone());
        self.tokens.push(Arc::new(token));
    }

    pub fn insert_card_cas(&mut self, reader: String, cas: Vec<CertificateRecord>) {
        self.card_cas.insert(reader, cas);
    }

    pub fn contains_reader(&self, reader: &str) -> bool {
        self.readers.contains_key(reader)
    }

    pub fn reader(&self, reader: &str) -> Option<&ReaderRecord> {
        self.readers.get(reader)
    }

    pub fn readers(&self) -> impl Iterator<Item = (&String, &ReaderRecord)> {
        self.readers.iter()
    }

    pub fn reader_names(&self) -> Vec<String> {
        self.readers.keys().cloned().collect()
    }

    pub fn tokens(&self) -> &[Arc<TokenRecord>] {
        &self.tokens
    }

    pub fn reader_for_name(&self, name: &str) -> Option<&str> {
        self.names.get(name).map(String::as_str)
    }

    pub fn card_cas(&self, reader: &str) -> &[CertificateRecord] {
        self.card_cas.get(reader).map(Vec::as_slice).unwrap_or_default()
    }

    /// Token whose reader is exactly `reader`.
    pub fn token_for_reader(&self, reader: &str) -> Option<Arc<TokenRecord>> {
        self.tokens
            .iter()
            .find(|token| token.reader == reader)
            .cloned()
    }

    pub fn max_enum_readers(&self) -> usize {
        self.max_enum_readers.load(Ordering::Relaxed)
    }

    pub fn set_max_enum_readers(&self, value: usize) {
        self.max_enum_readers.store(value, Ordering::Relaxed);
    }

    /// Next value of the priority counter, used to move a reader to the top.
    pub fn bump_priority(&self) -> u64 {
        self.last_priority.fetch_add(1, Ordering::Relaxed) + 1
    }
}
