pub mod reader;
pub mod service;
pub mod tcp;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use reader::{decode_reader, encode_reader};

/// Maximum accepted size of one request, in bytes.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Command name that terminates a TCP request explicitly.
pub const EMPTY_LINE_COMMAND: &str = "EMPTYLINE";

/// Reply of the `CLIENT` liveness command.
pub const CLIENT_OK: &str = "OK";

/// One command of a request batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: String,
    pub name: String,
    pub data: Option<String>,
    pub object: Option<String>,
}

impl Command {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data: None,
            object: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    pub fn kind(&self) -> CommandKind {
        CommandKind::parse(&self.name)
    }
}

/// Command names understood by the proxy. Matching is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Apdu,
    Chain,
    Alias,
    Enum,
    List,
    Sign,
    Reset,
    Client,
    Unknown,
}

impl CommandKind {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "APDU" => Self::Apdu,
            "CHAIN" => Self::Chain,
            "ALIAS" => Self::Alias,
            "ENUM" => Self::Enum,
            "LIST" => Self::List,
            "SIGN" => Self::Sign,
            "RESET" => Self::Reset,
            "CLIENT" => Self::Client,
            _ => Self::Unknown,
        }
    }

    /// Whether the command talks to a particular token.
    pub fn needs_token(self) -> bool {
        matches!(self, Self::Apdu | Self::Chain | Self::Sign | Self::Reset)
    }
}

/// Error codes returned to clients in place of a command response.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ReaderNotFound,
    VagueName,
    WrongData,
    WrongPin,
    InternalError,
    Unsupported,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReaderNotFound => "ReaderNotFound",
            Self::VagueName => "VagueName",
            Self::WrongData => "WrongData",
            Self::WrongPin => "WrongPin",
            Self::InternalError => "InternalError",
            Self::Unsupported => "Unsupported",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        [
            Self::ReaderNotFound,
            Self::VagueName,
            Self::WrongData,
            Self::WrongPin,
            Self::InternalError,
            Self::Unsupported,
        ]
        .into_iter()
        .find(|code| code.as_str() == value)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

/// Response to one command, keyed by the command id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub id: String,
    pub line: String,
}

impl ResponseLine {
    pub fn new(id: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            line: line.into(),
        }
    }

    /// One line per command, each carrying the same error code.
    pub fn error_for(commands: &[Command], code: ErrorCode) -> Vec<Self> {
        commands
            .iter()
            .map(|command| Self::new(command.id.clone(), code))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_kind_is_case_insensitive() {
        assert_eq!(CommandKind::parse("sign"), CommandKind::Sign);
        assert_eq!(CommandKind::parse("Reset"), CommandKind::Reset);
        assert_eq!(CommandKind::parse(" APDU "), CommandKind::Apdu);
        assert_eq!(CommandKind::parse("FORMAT"), CommandKind::Unknown);
    }

    #[test]
    fn token_independent_commands() {
        for kind in [
            CommandKind::Alias,
            CommandKind::Enum,
            CommandKind::List,
            CommandKind::Client,
        ] {
            assert!(!kind.needs_token(), "{kind:?}");
        }
        assert!(CommandKind::Sign.needs_token());
    }

    #[test]
    fn error_codes_use_their_names_on_the_wire() {
        assert_eq!(ErrorCode::WrongPin.to_string(), "WrongPin");
        assert_eq!(
            serde_json::to_string(&ErrorCode::ReaderNotFound).unwrap(),
            "\"ReaderNotFound\""
        );
        assert_eq!(ErrorCode::from_wire("VagueName"), Some(ErrorCode::VagueName));
        assert_eq!(ErrorCode::from_wire("9000"), None);
    }

    #[test]
    fn error_for_keeps_command_ids() {
        let commands = vec![Command::new("1", "SIGN"), Command::new("7", "CHAIN")];
        let lines = ResponseLine::error_for(&commands, ErrorCode::ReaderNotFound);
        assert_eq!(
            lines,
            vec![
                ResponseLine::new("1", "ReaderNotFound"),
                ResponseLine::new("7", "ReaderNotFound"),
            ]
        );
    }
}
