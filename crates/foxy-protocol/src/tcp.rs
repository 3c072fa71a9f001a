//! Line protocol spoken by TCP clients.
//!
//! ```text
//! >reader[:password]|
//! >id:NAME[:hexBytes[:object]]|
//! >EMPTYLINE|          (or a blank line)
//! ```
//!
//! Responses are `>id:response#\n` per command.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::{Command, EMPTY_LINE_COMMAND, MAX_REQUEST_BYTES, ResponseLine};

const LINE_START: char = '>';
const LINE_END: char = '|';
const SEPARATOR: char = ':';
const RESPONSE_END: char = '#';
const COMMENT: char = '#';
const MAX_COMMAND_PARTS: usize = 4;

/// A complete request read from a TCP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpRequest {
    Batch {
        reader: String,
        password: Option<String>,
        commands: Vec<Command>,
    },
    SelectTerminal {
        name: String,
        max_readers: usize,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TcpParseError {
    #[error("no reader line received")]
    NoReader,
    #[error("no commands received for reader {0}")]
    NoCommands(String),
    #[error("command line has too many parts: {0}")]
    TooManyParts(String),
    #[error("invalid terminal selection: {0}")]
    InvalidSelection(String),
    #[error("request exceeds {MAX_REQUEST_BYTES} bytes")]
    TooLarge,
}

/// Incremental parser fed with whatever the socket returns.
#[derive(Debug, Default)]
pub struct TcpRequestParser {
    pending: Vec<u8>,
    received: usize,
    reader: Option<String>,
    password: Option<String>,
    commands: Vec<Command>,
    selection: Option<(String, usize)>,
    error: Option<TcpParseError>,
    complete: bool,
}

impl TcpRequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw input. Returns true once the request is complete
    /// (successfully or not) and no more input should be read.
    ///
    /// Bytes are buffered until a newline, so a UTF-8 sequence split across
    /// two reads is decoded intact.
    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> bool {
        let chunk = chunk.as_ref();
        if self.complete {
            return true;
        }
        self.received += chunk.len();
        if self.received > MAX_REQUEST_BYTES {
            self.fail(TcpParseError::TooLarge);
            return true;
        }

        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.handle_line(&String::from_utf8_lossy(&line));
            if self.complete {
                self.pending.clear();
                break;
            }
        }
        self.complete
    }

    /// Consume the parser after the last chunk (or end of stream).
    pub fn finish(mut self) -> Result<TcpRequest, TcpParseError> {
        if !self.complete && !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.handle_line(&String::from_utf8_lossy(&rest));
        }
        if let Some(err) = self.error {
            return Err(err);
        }
        if let Some((name, max_readers)) = self.selection {
            return Ok(TcpRequest::SelectTerminal { name, max_readers });
        }
        let reader = self.reader.ok_or(TcpParseError::NoReader)?;
        if self.commands.is_empty() {
            return Err(TcpParseError::NoCommands(reader));
        }
        Ok(TcpRequest::Batch {
            reader,
            password: self.password,
            commands: self.commands,
        })
    }

    fn fail(&mut self, err: TcpParseError) {
        self.error = Some(err);
        self.complete = true;
    }

    fn handle_line(&mut self, raw: &str) {
        let line = raw.trim();
        if line.is_empty() {
            if !self.commands.is_empty() {
                self.complete = true;
            }
            return;
        }
        if line.starts_with(COMMENT) {
            return;
        }
        let Some(line) = line.strip_prefix(LINE_START) else {
            return;
        };
        let mut line = line.trim();
        if let Some(end) = line.rfind(LINE_END) {
            line = &line[..end];
        }

        if self.reader.is_none() {
            self.handle_reader_line(line);
            return;
        }

        let parts: Vec<&str> = line.split(SEPARATOR).collect();
        match parts.len() {
            1 if parts[0].trim().eq_ignore_ascii_case(EMPTY_LINE_COMMAND) => {
                if !self.commands.is_empty() {
                    self.complete = true;
                }
            }
            1 => self.reader = Some(parts[0].to_string()),
            n if n > MAX_COMMAND_PARTS => self.fail(TcpParseError::TooManyParts(line.to_string())),
            _ => {
                if parts[1].eq_ignore_ascii_case(EMPTY_LINE_COMMAND) {
                    self.complete = true;
                    return;
                }
                let mut command = Command::new(parts[0], parts[1]);
                command.data = parts.get(2).map(|part| part.to_string());
                command.object = parts.get(3).map(|part| part.to_string());
                self.commands.push(command);
            }
        }
    }

    fn handle_reader_line(&mut self, line: &str) {
        if let Some((name, limit)) = line.split_once(LINE_END) {
            match parse_selection(name, limit) {
                Ok(selection) => {
                    self.selection = Some(selection);
                    self.complete = true;
                }
                Err(err) => self.fail(err),
            }
            return;
        }
        let mut parts = line.splitn(2, SEPARATOR);
        self.reader = parts.next().map(|reader| reader.trim().to_string());
        self.password = parts
            .next()
            .filter(|password| !password.is_empty())
            .map(str::to_string);
    }
}

fn parse_selection(name: &str, limit: &str) -> Result<(String, usize), TcpParseError> {
    let invalid = || TcpParseError::InvalidSelection(format!("{name}|{limit}"));
    let raw = STANDARD.decode(name.trim()).map_err(|_| invalid())?;
    let name = String::from_utf8(raw).map_err(|_| invalid())?;
    let max_readers = limit.trim().parse::<usize>().map_err(|_| invalid())?;
    Ok((name, max_readers))
}

/// Parse a whole request held in memory.
pub fn parse_request(text: &str) -> Result<TcpRequest, TcpParseError> {
    let mut parser = TcpRequestParser::new();
    parser.push(text);
    parser.finish()
}

/// Render response lines in wire format, ready to be written in one go.
pub fn render_response(lines: &[ResponseLine]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push(LINE_START);
        out.push_str(&line.id);
        out.push(SEPARATOR);
        out.push_str(&line.line);
        out.push(RESPONSE_END);
        out.push('\n');
    }
    out
}

/// Client-side counterpart of [`render_response`].
pub fn parse_response(text: &str) -> Vec<ResponseLine> {
    text.lines()
        .filter_map(|line| {
            let line = line.strip_prefix(LINE_START)?;
            let line = line.strip_suffix(RESPONSE_END).unwrap_or(line);
            let (id, payload) = line.split_once(SEPARATOR)?;
            Some(ResponseLine::new(id, payload))
        })
        .collect()
}
