use crate::{Error, SubId};
use nostr::{Event, Filter};
use serde_json::{json, Value};

/// Messages sent by clients, received by relays
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req {
        sub_id: SubId,
        filters: Vec<Filter>,
    },
    Close {
        sub_id: SubId,
    },
    Count {
        sub_id: SubId,
        filters: Vec<Filter>,
    },
    Raw(String),
}

impl ClientMessage {
    pub fn event(event: Event) -> Self {
        ClientMessage::Event(Box::new(event))
    }

    pub fn raw(raw: String) -> Self {
        ClientMessage::Raw(raw)
    }

    pub fn req(sub_id: SubId, filters: Vec<Filter>) -> Self {
        ClientMessage::Req { sub_id, filters }
    }

    pub fn close(sub_id: SubId) -> Self {
        ClientMessage::Close { sub_id }
    }

    pub fn count(sub_id: SubId, filters: Vec<Filter>) -> Self {
        ClientMessage::Count { sub_id, filters }
    }

    /// REQ and CLOSE are replayed by the subscription registry when a relay
    /// (re)connects, so they are never worth buffering for a dead socket.
    pub fn is_subscription_control(&self) -> bool {
        matches!(self, ClientMessage::Req { .. } | ClientMessage::Close { .. })
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(match self {
            Self::Event(event) => serde_json::to_string(&("EVENT", event))?,
            Self::Raw(raw) => raw.clone(),
            Self::Req { sub_id, filters } => filter_command("REQ", sub_id, filters)?,
            Self::Count { sub_id, filters } => filter_command("COUNT", sub_id, filters)?,
            Self::Close { sub_id } => json!(["CLOSE", sub_id.as_str()]).to_string(),
        })
    }
}

fn filter_command(tag: &str, sub_id: &SubId, filters: &[Filter]) -> Result<String, Error> {
    let mut parts = Vec::with_capacity(filters.len() + 2);
    parts.push(Value::from(tag));
    parts.push(Value::from(sub_id.as_str()));
    if filters.is_empty() {
        parts.push(json!({}));
    }
    for filter in filters {
        parts.push(serde_json::to_value(filter)?);
    }
    Ok(Value::Array(parts).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Kind;

    #[test]
    fn req_carries_every_filter() {
        let msg = ClientMessage::req(
            SubId::from("sub1"),
            vec![
                Filter::new().kind(Kind::TextNote).limit(10),
                Filter::new().kind(Kind::Metadata),
            ],
        );
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json[0], "REQ");
        assert_eq!(json[1], "sub1");
        assert_eq!(json[2]["kinds"], json!([1]));
        assert_eq!(json[2]["limit"], 10);
        assert_eq!(json[3]["kinds"], json!([0]));
        assert_eq!(json.as_array().unwrap().len(), 4);
    }

    #[test]
    fn empty_filter_list_sends_match_all() {
        let msg = ClientMessage::count(SubId::from("c"), vec![]);
        assert_eq!(msg.to_json().unwrap(), r#"["COUNT","c",{}]"#);
    }

    #[test]
    fn close_message() {
        let msg = ClientMessage::close(SubId::from("sub1"));
        assert_eq!(msg.to_json().unwrap(), r#"["CLOSE","sub1"]"#);
        assert!(msg.is_subscription_control());
    }

    #[test]
    fn event_message_embeds_the_event() {
        let keys = nostr::Keys::generate();
        let event = nostr::EventBuilder::text_note("hello")
            .sign_with_keys(&keys)
            .unwrap();
        let json: Value =
            serde_json::from_str(&ClientMessage::event(event.clone()).to_json().unwrap()).unwrap();
        assert_eq!(json[0], "EVENT");
        assert_eq!(json[1]["id"], event.id.to_hex());
        assert_eq!(json[1]["content"], "hello");
    }
}
