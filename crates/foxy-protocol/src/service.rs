//! JSON request/response protocol used by service clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{Command, ResponseLine};

const SEPARATOR: char = ':';
const MAX_LINE_PARTS: usize = 3;

/// Raw service request as received.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ServiceRequest {
    #[serde(default)]
    pub reader: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub command: Option<ServiceCommand>,
    #[serde(default)]
    pub commands: Option<Vec<ServiceCommand>>,
}

/// One `{id, line}` item. Ids may be strings or numbers.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ServiceCommand {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub line: Option<String>,
}

/// Validated service request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBatch {
    pub reader: String,
    pub password: Option<String>,
    pub commands: Vec<Command>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceResponse {
    pub response: Vec<ResponseLine>,
}

#[derive(Debug, Error)]
pub enum ServiceParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request carries no reader")]
    NoReader,
    #[error("request carries no commands")]
    NoCommands,
    #[error("command line has too many parts: {0}")]
    TooManyParts(String),
}

impl ServiceRequest {
    /// Accepts both a bare request and the `{"data": {...}}` envelope.
    pub fn from_json(body: &str) -> Result<Self, ServiceParseError> {
        let mut value: Value = serde_json::from_str(body)?;
        if let Some(inner) = value.get_mut("data").filter(|inner| inner.is_object()) {
            value = inner.take();
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn into_batch(self) -> Result<ServiceBatch, ServiceParseError> {
        let reader = self.reader.ok_or(ServiceParseError::NoReader)?;
        let items = match (self.command, self.commands) {
            (Some(single), _) => vec![single],
            (None, Some(list)) => list,
            (None, None) => return Err(ServiceParseError::NoCommands),
        };

        let mut commands = Vec::with_capacity(items.len());
        for item in items {
            let (Some(id), Some(line)) = (item.id, item.line) else {
                continue;
            };
            commands.push(parse_line(id_to_string(&id), &line)?);
        }
        if commands.is_empty() {
            return Err(ServiceParseError::NoCommands);
        }

        Ok(ServiceBatch {
            reader,
            password: self.password.filter(|password| !password.is_empty()),
            commands,
        })
    }
}

impl ServiceResponse {
    pub fn new(response: Vec<ResponseLine>) -> Self {
        Self { response }
    }
}

fn parse_line(id: String, line: &str) -> Result<Command, ServiceParseError> {
    let parts: Vec<&str> = line.trim().split(SEPARATOR).collect();
    if parts.len() > MAX_LINE_PARTS {
        return Err(ServiceParseError::TooManyParts(line.to_string()));
    }
    let mut command = Command::new(id, parts[0]);
    command.data = parts.get(1).map(|part| part.to_string());
    command.object = parts.get(2).map(|part| part.to_string());
    Ok(command)
}

fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
