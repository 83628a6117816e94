//! Message protocol definitions
//!
//! Line-oriented protocol: one command per `\n`-terminated frame.
//!
//! Text format (default):
//! - `CONNECT <alias>` registers an alias
//! - `MESSAGE <content>` broadcasts content under the registered alias
//! - broadcasts go out as `<alias>: <content>\n`
//!
//! The JSON format carries the same commands as one object per line, using
//! numeric command types (`0` connect, `1` message).
//!
//! Content is not escaped in the text format. A broadcast whose content
//! contains `\n` therefore reaches clients as more than one line.

use std::str::FromStr;

use serde::Deserialize;
use serde_json::json;

use crate::error::{ConfigError, ParseError};

/// Client → Server command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register an alias (only valid before registration)
    Connect { alias: String },
    /// Broadcast content to every registered client
    Message { content: String },
    /// Any other verb
    Unknown { verb: String },
}

impl Command {
    fn from_parts(verb: &str, payload: String) -> Self {
        if verb.eq_ignore_ascii_case("connect") {
            Command::Connect { alias: payload }
        } else if verb.eq_ignore_ascii_case("message") {
            Command::Message { content: payload }
        } else {
            Command::Unknown {
                verb: verb.to_string(),
            }
        }
    }

    /// Verb name used when the command is rejected
    pub fn verb(&self) -> &str {
        match self {
            Command::Connect { .. } => "CONNECT",
            Command::Message { .. } => "MESSAGE",
            Command::Unknown { verb } => verb,
        }
    }
}

/// Wire encoding selected for the whole server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// Plain text lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl WireFormat {
    /// Decode one frame (without its trailing delimiter)
    pub fn decode(self, frame: &str) -> Result<Command, ParseError> {
        match self {
            WireFormat::Text => decode_text(frame),
            WireFormat::Json => decode_json(frame),
        }
    }

    /// Encode a broadcast line, delimiter included
    pub fn encode(self, from: &str, content: &str) -> String {
        match self {
            WireFormat::Text => format!("{}: {}\n", from, content),
            WireFormat::Json => {
                let mut line = json!({ "from": from, "content": content }).to_string();
                line.push('\n');
                line
            }
        }
    }

    /// Encode an error reply line, delimiter included
    pub fn encode_error(self, message: &str) -> String {
        match self {
            WireFormat::Text => format!("{}\n", message),
            WireFormat::Json => {
                let mut line = json!({ "error": message }).to_string();
                line.push('\n');
                line
            }
        }
    }
}

impl FromStr for WireFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(WireFormat::Text),
            "json" => Ok(WireFormat::Json),
            _ => Err(ConfigError::Invalid {
                key: "CHAT_WIRE_FORMAT",
                value: s.to_string(),
            }),
        }
    }
}

/// Split off the first token as the verb and rejoin the rest with single spaces
fn decode_text(frame: &str) -> Result<Command, ParseError> {
    let mut tokens = frame.split_whitespace();
    let verb = tokens.next().ok_or(ParseError::Empty)?;
    let payload = tokens.collect::<Vec<_>>().join(" ");
    Ok(Command::from_parts(verb, payload))
}

/// Numeric command types used by JSON clients
const JSON_CONNECT: i64 = 0;
const JSON_MESSAGE: i64 = 1;

/// `{"commandType": 0|1, "from": "...", "content": "..."}`
///
/// Older clients send the payload as `msg` instead of `content`.
#[derive(Debug, Deserialize)]
struct JsonCommand {
    #[serde(rename = "commandType")]
    command_type: i64,
    #[serde(default)]
    from: String,
    #[serde(default, alias = "msg")]
    content: String,
}

/// Connect takes its alias from `from`; Message ignores `from` in favour of
/// the alias already registered on the connection
fn decode_json(frame: &str) -> Result<Command, ParseError> {
    if frame.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let cmd: JsonCommand =
        serde_json::from_str(frame).map_err(|e| ParseError::Malformed(e.to_string()))?;

    Ok(match cmd.command_type {
        JSON_CONNECT => Command::Connect { alias: cmd.from },
        JSON_MESSAGE => Command::Message {
            content: cmd.content,
        },
        other => Command::Unknown {
            verb: other.to_string(),
        },
    })
}
