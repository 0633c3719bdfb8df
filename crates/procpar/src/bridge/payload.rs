//! Payload codec: `InvocationPayload` to and from a single argv token.
//!
//! Two layers, kept separate:
//! - **inner** (`encode` / `decode`): payload ↔ JSON object text
//! - **transport** (`to_token` / `from_token`): JSON text ↔ JSON string literal,
//!   so the whole payload travels as one command-line token
//!
//! A shell launcher strips the transport layer itself; a direct `execve`
//! (what `std::process::Command` does) delivers it intact. `from_token`
//! therefore only unwraps tokens that still look like a string literal.

use std::borrow::Cow;

use super::protocol::InvocationPayload;

pub fn encode(payload: &InvocationPayload) -> Result<String, serde_json::Error> {
    serde_json::to_string(payload)
}

pub fn decode(text: &str) -> Result<InvocationPayload, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn to_token(text: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(text)
}

pub fn from_token(token: &str) -> Result<Cow<'_, str>, serde_json::Error> {
    if token.starts_with('"') {
        Ok(Cow::Owned(serde_json::from_str::<String>(token)?))
    } else {
        Ok(Cow::Borrowed(token))
    }
}

/// Both layers: payload → argv token.
pub fn encode_token(payload: &InvocationPayload) -> Result<String, serde_json::Error> {
    to_token(&encode(payload)?)
}

/// Both layers: argv token → payload.
pub fn decode_token(token: &str) -> Result<InvocationPayload, serde_json::Error> {
    decode(&from_token(token)?)
}
