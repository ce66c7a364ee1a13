// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The line-oriented wire protocol (§4.1): `NICK`, `USER`, `JOIN`, `PART`,
//! `PRIVMSG`, `PING`/`PONG`, `QUIT`. Decoded at the boundary into a typed
//! enum per the Design Notes' "decode into a strongly-typed message enum"
//! guidance, while the bytes on the wire stay CRLF-terminated text.

use std::fmt;

/// A single decoded protocol line. `Privmsg.sender` is only populated when
/// parsing an *incoming* line carrying an IRC `:nick!user@host` prefix; it
/// is not present on outgoing messages we construct ourselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcMessage {
    Nick { nick: String },
    User { nick: String },
    Join { channel: String },
    Part { channel: String },
    Privmsg { sender: Option<String>, target: String, payload: String },
    Ping { token: String },
    Pong { token: String },
    Quit { reason: String },
}

impl fmt::Display for IrcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrcMessage::Nick { nick } => write!(f, "NICK {nick}"),
            IrcMessage::User { nick } => write!(f, "USER {nick} 0 * :Agent {nick}"),
            IrcMessage::Join { channel } => write!(f, "JOIN {channel}"),
            IrcMessage::Part { channel } => write!(f, "PART {channel}"),
            IrcMessage::Privmsg { target, payload, .. } => {
                write!(f, "PRIVMSG {target} :{}", escape_payload(payload))
            }
            IrcMessage::Ping { token } => write!(f, "PING {token}"),
            IrcMessage::Pong { token } => write!(f, "PONG {token}"),
            IrcMessage::Quit { reason } => write!(f, "QUIT :{reason}"),
        }
    }
}

impl IrcMessage {
    /// Render the wire line including the trailing CRLF.
    pub fn to_wire(&self) -> String {
        format!("{self}\r\n")
    }

    /// Parse a single CRLF-stripped line. Malformed frames are ignored by
    /// callers (§4.1 failure semantics), so this returns `None` rather than
    /// an error on anything it doesn't recognize.
    pub fn parse(line: &str) -> Option<IrcMessage> {
        // Incoming server-relayed lines are prefixed with ":nick!user@host ".
        let (prefix, rest) = if let Some(stripped) = line.strip_prefix(':') {
            let mut parts = stripped.splitn(2, ' ');
            let prefix = parts.next()?;
            let rest = parts.next()?;
            let nick = prefix.split('!').next().unwrap_or(prefix).to_string();
            (Some(nick), rest)
        } else {
            (None, line)
        };

        let mut parts = rest.splitn(2, ' ');
        let cmd = parts.next()?;
        let tail = parts.next().unwrap_or("");

        match cmd {
            "NICK" => Some(IrcMessage::Nick { nick: tail.trim().to_string() }),
            "USER" => Some(IrcMessage::User { nick: tail.split_whitespace().next()?.to_string() }),
            "JOIN" => Some(IrcMessage::Join { channel: tail.trim().to_string() }),
            "PART" => Some(IrcMessage::Part { channel: tail.trim().to_string() }),
            "PING" => Some(IrcMessage::Ping { token: tail.trim().to_string() }),
            "PONG" => Some(IrcMessage::Pong { token: tail.trim().to_string() }),
            "QUIT" => {
                let reason = tail.strip_prefix(':').unwrap_or(tail).to_string();
                Some(IrcMessage::Quit { reason })
            }
            "PRIVMSG" => {
                let mut pm = tail.splitn(2, " :");
                let target = pm.next()?.trim().to_string();
                let payload_raw = pm.next().unwrap_or("");
                Some(IrcMessage::Privmsg {
                    sender: prefix,
                    target,
                    payload: unescape_payload(payload_raw),
                })
            }
            _ => None,
        }
    }
}

/// Escape embedded CR/LF before sending so a multi-line payload can't be
/// split across wire frames (§4.1). `|` is the application-level field
/// separator and is passed through untouched; JSON fragments ride verbatim.
pub fn escape_payload(payload: &str) -> String {
    payload.replace('\r', "\\r").replace('\n', "\\n")
}

/// Inverse of `escape_payload`.
pub fn unescape_payload(payload: &str) -> String {
    payload.replace("\\r", "\r").replace("\\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        let raw = "line one\nline two\r\nline three";
        let escaped = escape_payload(raw);
        assert!(!escaped.contains('\n') && !escaped.contains('\r'));
        assert_eq!(unescape_payload(&escaped), raw);
    }

    #[test]
    fn parse_privmsg_with_prefix() {
        let msg = IrcMessage::parse(":agent_1!agent@host PRIVMSG #agents :NOGO|SEGMENT|agent_1|0xa000|0xb000").unwrap();
        match msg {
            IrcMessage::Privmsg { sender, target, payload } => {
                assert_eq!(sender.as_deref(), Some("agent_1"));
                assert_eq!(target, "#agents");
                assert_eq!(payload, "NOGO|SEGMENT|agent_1|0xa000|0xb000");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parse_privmsg_without_prefix() {
        let msg = IrcMessage::parse("PRIVMSG #results :AGENT_RESULT|{\"agent_id\":\"agent_1\"}").unwrap();
        match msg {
            IrcMessage::Privmsg { sender, target, payload } => {
                assert!(sender.is_none());
                assert_eq!(target, "#results");
                assert_eq!(payload, "AGENT_RESULT|{\"agent_id\":\"agent_1\"}");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parse_ping_pong() {
        assert_eq!(IrcMessage::parse("PING abc123").unwrap(), IrcMessage::Ping { token: "abc123".into() });
        assert_eq!(IrcMessage::parse("PONG abc123").unwrap(), IrcMessage::Pong { token: "abc123".into() });
    }

    #[test]
    fn parse_malformed_returns_none() {
        assert!(IrcMessage::parse("").is_none());
        assert!(IrcMessage::parse("GARBAGE").is_none());
    }

    #[test]
    fn privmsg_round_trips_through_wire_encoding() {
        let msg = IrcMessage::Privmsg {
            sender: None,
            target: "#agents".into(),
            payload: "multi\nline\rpayload".into(),
        };
        let wire = msg.to_wire();
        assert!(wire.ends_with("\r\n"));
        let line = wire.trim_end_matches("\r\n");
        let reparsed = IrcMessage::parse(line).unwrap();
        match reparsed {
            IrcMessage::Privmsg { payload, .. } => assert_eq!(payload, "multi\nline\rpayload"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
