//! Application messages exchanged over the pairing data channel.
//!
//! Every frame is an ASCII string of the form `TYPE::PAYLOAD`. Only the first
//! `::` separates the type from the payload, so tokens may contain the
//! separator themselves.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const SEPARATOR: &str = "::";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed data channel message: {0}")]
    Malformed(String),
    #[error("unknown data channel message type: {0}")]
    UnknownType(String),
    #[error("unknown {kind} payload: {payload}")]
    UnknownPayload { kind: &'static str, payload: String },
    #[error("pairing code must be non-empty and contain no whitespace")]
    InvalidCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Cancel,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Complete,
}

impl PeerEvent {
    fn as_str(&self) -> &'static str {
        match self {
            PeerEvent::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelMessage {
    Action(Action),
    Token(String),
    Event(PeerEvent),
}

impl DataChannelMessage {
    pub fn add() -> Self {
        DataChannelMessage::Action(Action::Add)
    }

    pub fn cancel() -> Self {
        DataChannelMessage::Action(Action::Cancel)
    }

    pub fn complete() -> Self {
        DataChannelMessage::Event(PeerEvent::Complete)
    }

    pub fn token(value: impl Into<String>) -> Self {
        DataChannelMessage::Token(value.into())
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if !raw.is_ascii() {
            return Err(ProtocolError::Malformed("non-ascii frame".into()));
        }
        let (kind, payload) = raw
            .split_once(SEPARATOR)
            .ok_or_else(|| ProtocolError::Malformed(raw.to_string()))?;
        match kind {
            "action" => match payload {
                "add" => Ok(DataChannelMessage::Action(Action::Add)),
                "cancel" => Ok(DataChannelMessage::Action(Action::Cancel)),
                other => Err(ProtocolError::UnknownPayload {
                    kind: "action",
                    payload: other.to_string(),
                }),
            },
            "event" => match payload {
                "complete" => Ok(DataChannelMessage::Event(PeerEvent::Complete)),
                other => Err(ProtocolError::UnknownPayload {
                    kind: "event",
                    payload: other.to_string(),
                }),
            },
            "token" => {
                if payload.is_empty() {
                    Err(ProtocolError::Malformed("empty token".into()))
                } else {
                    Ok(DataChannelMessage::Token(payload.to_string()))
                }
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for DataChannelMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataChannelMessage::Action(action) => write!(f, "action{SEPARATOR}{}", action.as_str()),
            DataChannelMessage::Token(token) => write!(f, "token{SEPARATOR}{token}"),
            DataChannelMessage::Event(event) => write!(f, "event{SEPARATOR}{}", event.as_str()),
        }
    }
}

impl FromStr for DataChannelMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataChannelMessage::parse(s)
    }
}

/// Rendezvous room name handed out by the relay.
///
/// The relay decides what a code looks like; the only canonicalization is
/// trimming surrounding whitespace and upper-casing, so a code typed as
/// ` ab12 ` joins room `AB12`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairingCode(String);

impl PairingCode {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(ProtocolError::InvalidCode);
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PairingCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PairingCode::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_wire_frames() {
        assert_eq!(DataChannelMessage::add().encode(), "action::add");
        assert_eq!(DataChannelMessage::cancel().encode(), "action::cancel");
        assert_eq!(DataChannelMessage::complete().encode(), "event::complete");
        assert_eq!(DataChannelMessage::token("XYZ").encode(), "token::XYZ");
    }

    #[test]
    fn token_payload_keeps_embedded_separators() {
        let parsed = DataChannelMessage::parse("token::abc::def").unwrap();
        assert_eq!(parsed, DataChannelMessage::Token("abc::def".into()));
    }

    #[test]
    fn rejects_unknown_types_and_payloads() {
        assert_eq!(
            DataChannelMessage::parse("ping::now"),
            Err(ProtocolError::UnknownType("ping".into()))
        );
        assert!(matches!(
            DataChannelMessage::parse("action::remove"),
            Err(ProtocolError::UnknownPayload { kind: "action", .. })
        ));
        assert!(matches!(
            DataChannelMessage::parse("event::started"),
            Err(ProtocolError::UnknownPayload { kind: "event", .. })
        ));
    }

    #[test]
    fn rejects_frames_without_separator_or_token() {
        assert!(matches!(
            DataChannelMessage::parse("action"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            DataChannelMessage::parse("token::"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            DataChannelMessage::parse("token::é"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn pairing_code_is_canonicalized() {
        let code = PairingCode::parse("  ab12 ").unwrap();
        assert_eq!(code.as_str(), "AB12");
        assert_eq!(code, "AB12".parse().unwrap());
    }

    #[test]
    fn pairing_code_rejects_empty_and_inner_whitespace() {
        assert_eq!(PairingCode::parse("   "), Err(ProtocolError::InvalidCode));
        assert_eq!(PairingCode::parse("AB 12"), Err(ProtocolError::InvalidCode));
    }

    #[test]
    fn pairing_code_keeps_relay_punctuation() {
        assert_eq!(PairingCode::parse("ab-12").unwrap().as_str(), "AB-12");
        assert_eq!(PairingCode::parse(" ab_12\n").unwrap().as_str(), "AB_12");
    }
}
