//! Wire envelope codec.
//!
//! Every frame in both directions has the shape
//! `[{"relays": [url, ...]}, [VERB, arg, ...]]`. Inbound frames name the
//! relays a request targets; outbound frames name the single relay a
//! response came from, or none for gateway notices.

use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use thiserror::Error;

/// Notice text sent when a frame is not valid JSON.
pub const PARSE_NOTICE: &str = "Unable to parse message";
/// Notice text sent when a frame is JSON but not an envelope.
pub const READ_NOTICE: &str = "Unable to read message";
/// Notice text sent for a verb the gateway does not route.
pub const HANDLE_NOTICE: &str = "Unable to handle message";

/// Envelope decode failure
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Frame is not JSON
    #[error("invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// Frame is JSON but does not have the envelope shape
    #[error("malformed envelope: {0}")]
    Read(String),
}

impl DecodeError {
    /// Client-facing notice text for this failure.
    pub fn notice(&self) -> &'static str {
        match self {
            DecodeError::Parse(_) => PARSE_NOTICE,
            DecodeError::Read(_) => READ_NOTICE,
        }
    }
}

/// Protocol verbs the gateway routes upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// REQ subscription_id filter...
    Req,
    /// CLOSE subscription_id
    Close,
    /// EVENT event
    Event,
    /// AUTH event
    Auth,
    /// COUNT subscription_id filter...
    Count,
}

impl Verb {
    /// Look up a verb by its wire name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "REQ" => Some(Verb::Req),
            "CLOSE" => Some(Verb::Close),
            "EVENT" => Some(Verb::Event),
            "AUTH" => Some(Verb::Auth),
            "COUNT" => Some(Verb::Count),
            _ => None,
        }
    }

    /// Wire name of the verb
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Req => "REQ",
            Verb::Close => "CLOSE",
            Verb::Event => "EVENT",
            Verb::Auth => "AUTH",
            Verb::Count => "COUNT",
        }
    }
}

#[derive(Deserialize)]
struct Header {
    relays: Vec<String>,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Target relays, duplicates removed, first occurrence kept
    pub relays: Vec<String>,
    /// Verb name as sent; `None` when the message array is empty or its
    /// first element is not a string
    pub verb: Option<String>,
    /// Positional arguments following the verb
    pub args: Vec<Value>,
}

/// A client request with its arguments checked
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Open or replace a subscription
    Req {
        sub_id: String,
        filters: Vec<Value>,
    },
    /// Close a subscription
    Close { sub_id: String },
    /// Publish an event
    Event(Value),
    /// Publish an authentication event
    Auth(Value),
    /// Open or replace a count request
    Count {
        sub_id: String,
        filters: Vec<Value>,
    },
    /// A verb the gateway does not route
    Unhandled(Option<String>),
}

impl Envelope {
    /// The routed verb, if the name is one the gateway handles.
    pub fn routed_verb(&self) -> Option<Verb> {
        self.verb.as_deref().and_then(Verb::parse)
    }

    /// Check the arguments of a routed verb.
    ///
    /// A routed verb with missing or mistyped arguments is a read failure;
    /// an unknown verb is not an error.
    pub fn into_request(self) -> Result<(Vec<String>, Request), DecodeError> {
        let Some(verb) = self.routed_verb() else {
            return Ok((self.relays, Request::Unhandled(self.verb)));
        };

        let mut args = self.args.into_iter();
        let request = match verb {
            Verb::Req => Request::Req {
                sub_id: sub_id(verb, args.next())?,
                filters: args.collect(),
            },
            Verb::Count => Request::Count {
                sub_id: sub_id(verb, args.next())?,
                filters: args.collect(),
            },
            Verb::Close => Request::Close {
                sub_id: sub_id(verb, args.next())?,
            },
            Verb::Event => Request::Event(event(verb, args.next())?),
            Verb::Auth => Request::Auth(event(verb, args.next())?),
        };

        Ok((self.relays, request))
    }
}

fn sub_id(verb: Verb, arg: Option<Value>) -> Result<String, DecodeError> {
    match arg {
        Some(Value::String(sub_id)) => Ok(sub_id),
        _ => Err(DecodeError::Read(format!(
            "{} requires a string subscription id",
            verb.as_str()
        ))),
    }
}

fn event(verb: Verb, arg: Option<Value>) -> Result<Value, DecodeError> {
    match arg {
        Some(event @ Value::Object(_)) => Ok(event),
        _ => Err(DecodeError::Read(format!(
            "{} requires an event object",
            verb.as_str()
        ))),
    }
}

/// Decode one client frame.
pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(text)?;

    let mut parts = match value {
        Value::Array(parts) => parts,
        _ => return Err(DecodeError::Read("envelope must be an array".into())),
    };

    if parts.len() != 2 {
        return Err(DecodeError::Read(format!(
            "envelope must have 2 elements, got {}",
            parts.len()
        )));
    }

    let message = parts.pop().unwrap_or(Value::Null);
    let header = parts.pop().unwrap_or(Value::Null);

    let header: Header = serde_json::from_value(header)
        .map_err(|e| DecodeError::Read(format!("bad relays header: {}", e)))?;

    let mut message = match message {
        Value::Array(items) => items.into_iter(),
        _ => return Err(DecodeError::Read("message must be an array".into())),
    };

    let verb = match message.next() {
        Some(Value::String(verb)) => Some(verb),
        _ => None,
    };

    Ok(Envelope {
        relays: dedup_relays(header.relays),
        verb,
        args: message.collect(),
    })
}

/// Encode an outbound frame attributed to `relays`.
pub fn encode<S: AsRef<str>>(relays: &[S], message: Value) -> String {
    let relays: Vec<&str> = relays.iter().map(AsRef::as_ref).collect();
    json!([{ "relays": relays }, message]).to_string()
}

/// Encode a gateway notice with an empty subscription id and no relays.
pub fn notice(text: &str) -> String {
    encode::<&str>(&[], json!(["NOTICE", "", text]))
}

fn dedup_relays(relays: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(relays.len());
    relays
        .into_iter()
        .filter(|url| seen.insert(url.clone()))
        .collect()
}
