// Letters and the reserved control payloads exchanged over a session

use crate::hub::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const ECHO_PREFIX: &str = "Echo";
pub const KEEP_ALIVE_PREFIX: &str = "Keep-Alive";
pub const READY: &str = "YouAreGoodToGo";
pub const ACQUIRE_BAGS_PREFIX: &str = "AcquireBags-";

/// Audit-trail entry appended each time a letter passes a component.
/// Serialized as a `[name, time]` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station(pub String, pub f64);

impl Station {
    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn time(&self) -> f64 {
        self.1
    }
}

/// An addressed, timestamped message routed between clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Letter {
    pub uid: String,
    pub src: String,
    pub dst: String,
    pub content: String,
    /// Expressed in the clock of whoever currently holds the letter
    #[serde(rename = "_timestamp")]
    pub timestamp: f64,
    #[serde(rename = "_stations", default)]
    pub stations: Vec<Station>,
    #[serde(rename = "_fail_reason", default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
}

impl Letter {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parsed destination of this letter
    pub fn destination(&self) -> Destination {
        Destination::parse(&self.dst)
    }

    pub fn push_station(&mut self, name: impl Into<String>, time: f64) {
        self.stations.push(Station(name.into(), time));
    }

    /// Turn the letter around: it goes back to its sender under the same uid
    pub fn reply(mut self, from: impl Into<String>) -> Self {
        self.dst = std::mem::replace(&mut self.src, from.into());
        self
    }
}

/// Two-level address `"path?uid"`; an empty uid matches any instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub path: String,
    pub uid: String,
}

impl Destination {
    pub fn parse(dst: &str) -> Self {
        match dst.split_once('?') {
            Some((path, uid)) => Self {
                path: path.to_string(),
                uid: uid.to_string(),
            },
            None => Self {
                path: dst.to_string(),
                uid: String::new(),
            },
        }
    }

    pub fn matches(&self, path: &str, uid: &str) -> bool {
        self.path == path && (self.uid.is_empty() || self.uid == uid)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?{}", self.path, self.uid)
    }
}

/// Classification of a decoded frame body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<'a> {
    /// `Echo,<t1>` probe or `Echo,<t1>,<t2>` reply, fields unparsed
    Echo(&'a str),
    KeepAlive,
    Ready,
    /// `AcquireBags-<bag name>`
    AcquireBags(&'a str),
    /// `<bag name>:<json>` answer to an acquire request
    BagReport { bag: &'a str, dump: &'a str },
    /// A JSON object, expected to be a letter
    Letter(&'a str),
    Unknown(&'a str),
}

impl<'a> Payload<'a> {
    pub fn classify(text: &'a str, bag_names: &[&'a str]) -> Self {
        if let Some(rest) = text.strip_prefix(ECHO_PREFIX) {
            return Payload::Echo(rest.strip_prefix(',').unwrap_or(rest));
        }
        if text.starts_with(KEEP_ALIVE_PREFIX) {
            return Payload::KeepAlive;
        }
        if text == READY {
            return Payload::Ready;
        }
        if let Some(bag) = text.strip_prefix(ACQUIRE_BAGS_PREFIX) {
            return Payload::AcquireBags(bag);
        }
        if text.starts_with('{') {
            return Payload::Letter(text);
        }
        for &name in bag_names {
            if let Some(dump) = text.strip_prefix(name).and_then(|r| r.strip_prefix(':')) {
                return Payload::BagReport { bag: name, dump };
            }
        }
        Payload::Unknown(text)
    }
}

/// Shorten a payload for log lines
pub fn preview(text: &str) -> &str {
    match text.char_indices().nth(40) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Letter {
        Letter {
            uid: "s-0".to_string(),
            src: "/a?a1".to_string(),
            dst: "/b?b1".to_string(),
            content: "ssvep_chunk_start, 13.3".to_string(),
            timestamp: 100.0,
            stations: vec![Station("origin".to_string(), 99.5)],
            fail_reason: None,
        }
    }

    #[test]
    fn test_letter_wire_field_names() {
        let json = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["_timestamp"], 100.0);
        assert_eq!(value["_stations"][0][0], "origin");
        assert_eq!(value["_stations"][0][1], 99.5);
        assert!(value.get("_fail_reason").is_none());
    }

    #[test]
    fn test_letter_parses_foreign_json() {
        let text = r#"{"content": "x", "src": "/a?1", "dst": "/b?", "uid": "u-3",
            "_stations": [["origin", 1.0], ["ControlCenter", 2.0]], "_timestamp": 1.0}"#;
        let letter = Letter::from_json(text).unwrap();
        assert_eq!(letter.stations.len(), 2);
        assert_eq!(letter.stations[1].name(), "ControlCenter");
        assert_eq!(letter.destination(), Destination::parse("/b"));
    }

    #[test]
    fn test_letter_missing_fields_rejected() {
        assert!(Letter::from_json(r#"{"dst": "/eeg/monitor", "content": "x"}"#).is_err());
    }

    #[test]
    fn test_reply_swaps_addresses() {
        let reply = sample().reply("/b?b1");
        assert_eq!(reply.dst, "/a?a1");
        assert_eq!(reply.src, "/b?b1");
        assert_eq!(reply.uid, "s-0");
    }

    #[test]
    fn test_destination_matching() {
        let any = Destination::parse("/b?");
        assert!(any.matches("/b", "b1"));
        assert!(any.matches("/b", "b2"));
        assert!(!any.matches("/c", "b1"));

        let exact = Destination::parse("/b?b1");
        assert!(exact.matches("/b", "b1"));
        assert!(!exact.matches("/b", "b2"));
    }

    #[test]
    fn test_payload_classification() {
        let bags = ["Bag-Pending"];
        assert_eq!(Payload::classify("Echo,1.5,2.5", &bags), Payload::Echo("1.5,2.5"));
        assert_eq!(Payload::classify("Keep-Alive, 17.0", &bags), Payload::KeepAlive);
        assert_eq!(Payload::classify(READY, &bags), Payload::Ready);
        assert_eq!(
            Payload::classify("AcquireBags-Bag-Pending", &bags),
            Payload::AcquireBags("Bag-Pending")
        );
        assert_eq!(
            Payload::classify("Bag-Pending:{}", &bags),
            Payload::BagReport { bag: "Bag-Pending", dump: "{}" }
        );
        assert!(matches!(Payload::classify("{\"a\":1}", &bags), Payload::Letter(_)));
        assert!(matches!(Payload::classify("hello", &bags), Payload::Unknown(_)));
    }

    #[test]
    fn test_preview_is_char_safe() {
        let long = "é".repeat(100);
        assert_eq!(preview(&long).chars().count(), 40);
        assert_eq!(preview("short"), "short");
    }
}
