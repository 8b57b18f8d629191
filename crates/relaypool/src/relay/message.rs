use crate::{Error, Result, SubId};
use ewebsock::{WsEvent, WsMessage};
use nostr::{Event, EventId};
use serde_json::Value;

/// A relay's answer to a published event (NIP-20 `OK`).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandResult {
    pub event_id: EventId,
    pub accepted: bool,
    pub message: String,
}

/// Messages sent by relays, received by clients
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: SubId, event: Box<Event> },
    Ok(CommandResult),
    Eose(SubId),
    Notice(String),
    Count {
        sub_id: SubId,
        count: u64,
        approximate: bool,
    },
    Closed { sub_id: SubId, message: String },
    Auth(String),
}

#[derive(Debug)]
pub enum RelayEvent<'a> {
    Opened,
    Closed,
    Other(&'a WsMessage),
    Error(Error),
    Message(RelayMessage),
}

impl<'a> From<&'a WsEvent> for RelayEvent<'a> {
    fn from(event: &'a WsEvent) -> RelayEvent<'a> {
        match event {
            WsEvent::Opened => RelayEvent::Opened,
            WsEvent::Closed => RelayEvent::Closed,
            WsEvent::Message(ref ws_msg) => ws_msg.into(),
            WsEvent::Error(s) => RelayEvent::Error(Error::Generic(s.to_owned())),
        }
    }
}

impl<'a> From<&'a WsMessage> for RelayEvent<'a> {
    fn from(wsmsg: &'a WsMessage) -> RelayEvent<'a> {
        match wsmsg {
            WsMessage::Text(s) => match RelayMessage::from_json(s) {
                Ok(msg) => RelayEvent::Message(msg),
                Err(err) => RelayEvent::Error(err),
            },
            wsmsg => RelayEvent::Other(wsmsg),
        }
    }
}

impl RelayMessage {
    pub fn eose(sub_id: impl Into<SubId>) -> Self {
        RelayMessage::Eose(sub_id.into())
    }

    pub fn notice(msg: impl Into<String>) -> Self {
        RelayMessage::Notice(msg.into())
    }

    pub fn ok(event_id: EventId, accepted: bool, message: impl Into<String>) -> Self {
        RelayMessage::Ok(CommandResult {
            event_id,
            accepted,
            message: message.into(),
        })
    }

    pub fn event(sub_id: impl Into<SubId>, event: Event) -> Self {
        RelayMessage::Event {
            sub_id: sub_id.into(),
            event: Box::new(event),
        }
    }

    pub fn count(sub_id: impl Into<SubId>, count: u64) -> Self {
        RelayMessage::Count {
            sub_id: sub_id.into(),
            count,
            approximate: false,
        }
    }

    pub fn closed(sub_id: impl Into<SubId>, message: impl Into<String>) -> Self {
        RelayMessage::Closed {
            sub_id: sub_id.into(),
            message: message.into(),
        }
    }

    /// The subscription this message belongs to, if any.
    pub fn sub_id(&self) -> Option<&SubId> {
        match self {
            RelayMessage::Event { sub_id, .. }
            | RelayMessage::Eose(sub_id)
            | RelayMessage::Count { sub_id, .. }
            | RelayMessage::Closed { sub_id, .. } => Some(sub_id),
            RelayMessage::Ok(_) | RelayMessage::Notice(_) | RelayMessage::Auth(_) => None,
        }
    }

    /// Decode one text frame. Anything that isn't a well formed relay
    /// message is an error; callers drop those frames.
    pub fn from_json(msg: &str) -> Result<RelayMessage> {
        if msg.trim().is_empty() {
            return Err(Error::Empty);
        }

        let Value::Array(parts) = serde_json::from_str::<Value>(msg)
            .map_err(|e| Error::DecodeFailed(format!("invalid json: {e}")))?
        else {
            return Err(Error::DecodeFailed("message is not an array".into()));
        };

        let mut parts = parts.into_iter();
        let tag = match parts.next() {
            Some(Value::String(tag)) => tag,
            _ => return Err(Error::DecodeFailed("missing message type".into())),
        };

        match tag.as_str() {
            // ["EVENT", <subscription id>, <event JSON>]
            "EVENT" => {
                let sub_id = next_str(&mut parts, "EVENT subscription id")?;
                let raw = parts
                    .next()
                    .ok_or_else(|| Error::DecodeFailed("Invalid EVENT format".into()))?;
                let event: Event = serde_json::from_value(raw)
                    .map_err(|e| Error::DecodeFailed(format!("invalid event: {e}")))?;
                Ok(Self::event(sub_id, event))
            }

            // ["OK", <event_id>, <true|false>, <message>]
            "OK" => {
                let id = next_str(&mut parts, "OK event id")?;
                let event_id = EventId::from_hex(&id)
                    .map_err(|_| Error::DecodeFailed(format!("bad event id '{id}'")))?;
                let accepted = match parts.next() {
                    Some(Value::Bool(b)) => b,
                    _ => return Err(Error::DecodeFailed("bad boolean value".into())),
                };
                let message = match parts.next() {
                    Some(Value::String(s)) => s,
                    _ => String::new(),
                };
                Ok(Self::ok(event_id, accepted, message))
            }

            // ["EOSE", <subscription_id>]
            "EOSE" => Ok(Self::eose(next_str(&mut parts, "EOSE subscription id")?)),

            // ["NOTICE", <message>]
            "NOTICE" => Ok(Self::notice(next_str(&mut parts, "NOTICE message")?)),

            // ["COUNT", <subscription_id>, {"count": <n>, "approximate": <bool>}]
            "COUNT" => {
                let sub_id = next_str(&mut parts, "COUNT subscription id")?;
                let body = parts
                    .next()
                    .ok_or_else(|| Error::DecodeFailed("missing COUNT body".into()))?;
                let count = body
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::DecodeFailed("bad count value".into()))?;
                let approximate = body
                    .get("approximate")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Ok(RelayMessage::Count {
                    sub_id: sub_id.into(),
                    count,
                    approximate,
                })
            }

            // ["CLOSED", <subscription_id>, <message>]
            "CLOSED" => {
                let sub_id = next_str(&mut parts, "CLOSED subscription id")?;
                let message = match parts.next() {
                    Some(Value::String(s)) => s,
                    _ => String::new(),
                };
                Ok(Self::closed(sub_id, message))
            }

            // ["AUTH", <challenge>]
            "AUTH" => Ok(RelayMessage::Auth(next_str(&mut parts, "AUTH challenge")?)),

            other => Err(Error::DecodeFailed(format!(
                "unrecognized message type: '{other}'"
            ))),
        }
    }
}

fn next_str(parts: &mut impl Iterator<Item = Value>, what: &str) -> Result<String> {
    match parts.next() {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(Error::DecodeFailed(format!("{what} is not a string"))),
        None => Err(Error::DecodeFailed(format!("missing {what}"))),
    }
}
