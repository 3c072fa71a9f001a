//! Units passed between the front ends and the worker pool.

use foxy_protocol::{Command, ResponseLine};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::storage::TokenState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkKind {
    Process,
    SelectTerminal { name: String, max_readers: usize },
    Kill,
}

/// Where the request came from and where its answer must go.
#[derive(Debug)]
pub enum Origin {
    Tcp(TcpStream),
    Service,
}

/// Which result channel receives the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Shared channel drained by the TCP responder.
    Primary,
    /// Handed straight to the synchronous caller waiting on the item.
    Alternate,
}

#[derive(Debug)]
pub struct WorkItem {
    pub ticket: u64,
    pub kind: WorkKind,
    pub origin: Origin,
    /// Reader or alias as sent by the client.
    pub reader: String,
    /// Resolved token, set by the dispatcher. `None` for administrative work.
    pub token: Option<String>,
    pub password: Option<String>,
    pub commands: Vec<Command>,
    pub routing: Routing,
    /// Waiting caller of an alternate item, set by the dispatcher.
    pub(crate) reply: Option<oneshot::Sender<WorkResult>>,
}

impl WorkItem {
    pub fn process(
        reader: impl Into<String>,
        password: Option<String>,
        commands: Vec<Command>,
        origin: Origin,
        routing: Routing,
    ) -> Self {
        Self {
            ticket: 0,
            kind: WorkKind::Process,
            origin,
            reader: reader.into(),
            token: None,
            password,
            commands,
            routing,
            reply: None,
        }
    }

    pub fn select_terminal(
        name: impl Into<String>,
        max_readers: usize,
        origin: Origin,
        routing: Routing,
    ) -> Self {
        Self {
            ticket: 0,
            kind: WorkKind::SelectTerminal {
                name: name.into(),
                max_readers,
            },
            origin,
            reader: String::new(),
            token: None,
            password: None,
            commands: Vec::new(),
            routing,
            reply: None,
        }
    }

    pub(crate) fn kill() -> Self {
        Self {
            ticket: 0,
            kind: WorkKind::Kill,
            origin: Origin::Service,
            reader: String::new(),
            token: None,
            password: None,
            commands: Vec::new(),
            routing: Routing::Primary,
            reply: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Batch contained a signature; carries the token state after it ran.
    PinInfo,
    /// Terminal listing.
    Priority,
    Generic,
}

#[derive(Debug)]
pub struct WorkResult {
    pub worker_id: u64,
    pub ticket: u64,
    pub kind: ResultKind,
    pub lines: Vec<ResponseLine>,
    pub origin: Origin,
    pub token_state: Option<TokenState>,
}

/// Acknowledgement sent by a worker's intake before the item is queued for
/// execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub worker_id: u64,
    pub ticket: u64,
}
