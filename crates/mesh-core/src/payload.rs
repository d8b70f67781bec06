//! Request and response payloads

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Maximum accepted text payload in bytes
pub const MAX_TEXT_BYTES: usize = 1_000_000;

/// Maximum accepted binary payload in bytes
pub const MAX_BINARY_BYTES: usize = 100_000_000;

/// Input or output data of a single request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
    /// Token ids, the common variable-length input for sequence models
    Tokens(Vec<u32>),
}

impl Payload {
    /// Check the payload is acceptable for admission
    pub fn validate(&self) -> Result<()> {
        match self {
            Payload::Text(text) => {
                if text.is_empty() {
                    return Err(Error::validation("text input cannot be empty"));
                }
                if text.len() > MAX_TEXT_BYTES {
                    return Err(Error::validation(format!(
                        "text input too large: {} bytes (max {})",
                        text.len(),
                        MAX_TEXT_BYTES
                    )));
                }
            }
            Payload::Binary(bytes) => {
                if bytes.is_empty() {
                    return Err(Error::validation("binary input cannot be empty"));
                }
                if bytes.len() > MAX_BINARY_BYTES {
                    return Err(Error::validation(format!(
                        "binary input too large: {} bytes (max {})",
                        bytes.len(),
                        MAX_BINARY_BYTES
                    )));
                }
            }
            Payload::Json(value) => {
                if value.is_null() {
                    return Err(Error::validation("json input cannot be null"));
                }
            }
            Payload::Tokens(tokens) => {
                if tokens.is_empty() {
                    return Err(Error::validation("token input cannot be empty"));
                }
            }
        }
        Ok(())
    }

    /// Sequence length for variable-length payloads, `None` for the rest
    pub fn seq_len(&self) -> Option<usize> {
        match self {
            Payload::Binary(bytes) => Some(bytes.len()),
            Payload::Tokens(tokens) => Some(tokens.len()),
            Payload::Text(_) | Payload::Json(_) => None,
        }
    }

    /// Extend a variable-length payload to `len`. Token inputs are padded
    /// with `pad_token`, binary inputs with `pad_byte`.
    pub fn pad_to(&mut self, len: usize, pad_token: u32, pad_byte: u8) {
        match self {
            Payload::Binary(bytes) if bytes.len() < len => {
                bytes.resize(len, pad_byte);
            }
            Payload::Tokens(tokens) if tokens.len() < len => {
                tokens.resize(len, pad_token);
            }
            _ => {}
        }
    }

    /// Cut a variable-length payload back to its original length
    pub fn truncate(&mut self, len: usize) {
        match self {
            Payload::Binary(bytes) => bytes.truncate(len),
            Payload::Tokens(tokens) => tokens.truncate(len),
            Payload::Text(_) | Payload::Json(_) => {}
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Binary(_) => "binary",
            Payload::Json(_) => "json",
            Payload::Tokens(_) => "tokens",
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u32>> for Payload {
    fn from(tokens: Vec<u32>) -> Self {
        Payload::Tokens(tokens)
    }
}
