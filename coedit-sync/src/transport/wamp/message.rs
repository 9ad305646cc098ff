//! WAMP v2 JSON message codec (basic profile, pub/sub roles only).
//!
//! Each frame is a JSON array whose first element is the message code:
//!
//! ```text
//! [HELLO, Realm|uri, Details|dict]                                 1
//! [WELCOME, Session|id, Details|dict]                              2
//! [ABORT, Details|dict, Reason|uri]                                3
//! [GOODBYE, Details|dict, Reason|uri]                              6
//! [ERROR, REQUEST.Type|int, REQUEST.Request|id, Details|dict, Error|uri]   8
//! [PUBLISH, Request|id, Options|dict, Topic|uri, Arguments|list]   16
//! [PUBLISHED, PUBLISH.Request|id, Publication|id]                  17
//! [SUBSCRIBE, Request|id, Options|dict, Topic|uri]                 32
//! [SUBSCRIBED, SUBSCRIBE.Request|id, Subscription|id]              33
//! [UNSUBSCRIBE, Request|id, SUBSCRIBED.Subscription|id]            34
//! [UNSUBSCRIBED, UNSUBSCRIBE.Request|id]                           35
//! [EVENT, SUBSCRIBED.Subscription|id, PUBLISHED.Publication|id, Details|dict, Arguments|list]  36
//! ```

use serde_json::{json, Value};

use crate::transport::TransportError;

/// WebSocket subprotocol for JSON serialization.
pub const SUBPROTOCOL: &str = "wamp.2.json";

pub const HELLO: u64 = 1;
pub const WELCOME: u64 = 2;
pub const ABORT: u64 = 3;
pub const GOODBYE: u64 = 6;
pub const ERROR: u64 = 8;
pub const PUBLISH: u64 = 16;
pub const PUBLISHED: u64 = 17;
pub const SUBSCRIBE: u64 = 32;
pub const SUBSCRIBED: u64 = 33;
pub const UNSUBSCRIBE: u64 = 34;
pub const UNSUBSCRIBED: u64 = 35;
pub const EVENT: u64 = 36;

#[derive(Debug, Clone, PartialEq)]
pub enum WampMessage {
    Hello {
        realm: String,
        details: Value,
    },
    Welcome {
        session: u64,
        details: Value,
    },
    Abort {
        details: Value,
        reason: String,
    },
    Goodbye {
        details: Value,
        reason: String,
    },
    Error {
        request_type: u64,
        request: u64,
        details: Value,
        error: String,
    },
    Publish {
        request: u64,
        options: Value,
        topic: String,
        args: Vec<Value>,
    },
    Published {
        request: u64,
        publication: u64,
    },
    Subscribe {
        request: u64,
        options: Value,
        topic: String,
    },
    Subscribed {
        request: u64,
        subscription: u64,
    },
    Unsubscribe {
        request: u64,
        subscription: u64,
    },
    Unsubscribed {
        request: u64,
    },
    Event {
        subscription: u64,
        publication: u64,
        details: Value,
        args: Vec<Value>,
    },
}

impl WampMessage {
    /// HELLO announcing the publisher and subscriber roles.
    pub fn hello(realm: impl Into<String>) -> Self {
        WampMessage::Hello {
            realm: realm.into(),
            details: json!({
                "agent": concat!("coedit-sync/", env!("CARGO_PKG_VERSION")),
                "roles": { "publisher": {}, "subscriber": {} }
            }),
        }
    }

    pub fn goodbye(reason: impl Into<String>) -> Self {
        WampMessage::Goodbye {
            details: json!({}),
            reason: reason.into(),
        }
    }

    pub fn abort(reason: impl Into<String>, message: impl Into<String>) -> Self {
        WampMessage::Abort {
            details: json!({ "message": message.into() }),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> u64 {
        match self {
            WampMessage::Hello { .. } => HELLO,
            WampMessage::Welcome { .. } => WELCOME,
            WampMessage::Abort { .. } => ABORT,
            WampMessage::Goodbye { .. } => GOODBYE,
            WampMessage::Error { .. } => ERROR,
            WampMessage::Publish { .. } => PUBLISH,
            WampMessage::Published { .. } => PUBLISHED,
            WampMessage::Subscribe { .. } => SUBSCRIBE,
            WampMessage::Subscribed { .. } => SUBSCRIBED,
            WampMessage::Unsubscribe { .. } => UNSUBSCRIBE,
            WampMessage::Unsubscribed { .. } => UNSUBSCRIBED,
            WampMessage::Event { .. } => EVENT,
        }
    }

    pub fn to_value(&self) -> Value {
        let code = self.code();
        match self {
            WampMessage::Hello { realm, details } => json!([code, realm, details]),
            WampMessage::Welcome { session, details } => json!([code, session, details]),
            WampMessage::Abort { details, reason } | WampMessage::Goodbye { details, reason } => {
                json!([code, details, reason])
            }
            WampMessage::Error {
                request_type,
                request,
                details,
                error,
            } => json!([code, request_type, request, details, error]),
            WampMessage::Publish {
                request,
                options,
                topic,
                args,
            } => json!([code, request, options, topic, args]),
            WampMessage::Published {
                request,
                publication,
            } => json!([code, request, publication]),
            WampMessage::Subscribe {
                request,
                options,
                topic,
            } => json!([code, request, options, topic]),
            WampMessage::Subscribed {
                request,
                subscription,
            } => json!([code, request, subscription]),
            WampMessage::Unsubscribe {
                request,
                subscription,
            } => json!([code, request, subscription]),
            WampMessage::Unsubscribed { request } => json!([code, request]),
            WampMessage::Event {
                subscription,
                publication,
                details,
                args,
            } => json!([code, subscription, publication, details, args]),
        }
    }

    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    pub fn decode(text: &str) -> Result<Self, TransportError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| TransportError::Malformed(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, TransportError> {
        let items = value
            .as_array()
            .ok_or_else(|| malformed("frame is not an array"))?;
        let fields = Fields(items);
        let code = fields.id(0, "code")?;

        let message = match code {
            HELLO => WampMessage::Hello {
                realm: fields.string(1, "realm")?,
                details: fields.dict(2, "details")?,
            },
            WELCOME => WampMessage::Welcome {
                session: fields.id(1, "session")?,
                details: fields.dict(2, "details")?,
            },
            ABORT => WampMessage::Abort {
                details: fields.dict(1, "details")?,
                reason: fields.string(2, "reason")?,
            },
            GOODBYE => WampMessage::Goodbye {
                details: fields.dict(1, "details")?,
                reason: fields.string(2, "reason")?,
            },
            ERROR => WampMessage::Error {
                request_type: fields.id(1, "request type")?,
                request: fields.id(2, "request")?,
                details: fields.dict(3, "details")?,
                error: fields.string(4, "error")?,
            },
            PUBLISH => WampMessage::Publish {
                request: fields.id(1, "request")?,
                options: fields.dict(2, "options")?,
                topic: fields.string(3, "topic")?,
                args: fields.list(4)?,
            },
            PUBLISHED => WampMessage::Published {
                request: fields.id(1, "request")?,
                publication: fields.id(2, "publication")?,
            },
            SUBSCRIBE => WampMessage::Subscribe {
                request: fields.id(1, "request")?,
                options: fields.dict(2, "options")?,
                topic: fields.string(3, "topic")?,
            },
            SUBSCRIBED => WampMessage::Subscribed {
                request: fields.id(1, "request")?,
                subscription: fields.id(2, "subscription")?,
            },
            UNSUBSCRIBE => WampMessage::Unsubscribe {
                request: fields.id(1, "request")?,
                subscription: fields.id(2, "subscription")?,
            },
            UNSUBSCRIBED => WampMessage::Unsubscribed {
                request: fields.id(1, "request")?,
            },
            EVENT => WampMessage::Event {
                subscription: fields.id(1, "subscription")?,
                publication: fields.id(2, "publication")?,
                details: fields.dict(3, "details")?,
                args: fields.list(4)?,
            },
            other => return Err(malformed(format!("unsupported message code {other}"))),
        };
        Ok(message)
    }
}

fn malformed(message: impl Into<String>) -> TransportError {
    TransportError::Malformed(message.into())
}

struct Fields<'a>(&'a [Value]);

impl Fields<'_> {
    fn get(&self, index: usize, name: &str) -> Result<&Value, TransportError> {
        self.0
            .get(index)
            .ok_or_else(|| malformed(format!("missing {name}")))
    }

    fn id(&self, index: usize, name: &str) -> Result<u64, TransportError> {
        self.get(index, name)?
            .as_u64()
            .ok_or_else(|| malformed(format!("{name} is not an id")))
    }

    fn string(&self, index: usize, name: &str) -> Result<String, TransportError> {
        self.get(index, name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| malformed(format!("{name} is not a string")))
    }

    fn dict(&self, index: usize, name: &str) -> Result<Value, TransportError> {
        match self.get(index, name)? {
            Value::Object(map) => Ok(Value::Object(map.clone())),
            _ => Err(malformed(format!("{name} is not a dict"))),
        }
    }

    /// Positional arguments are optional and default to an empty list.
    fn list(&self, index: usize) -> Result<Vec<Value>, TransportError> {
        match self.0.get(index) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(_) => Err(malformed("arguments is not a list")),
        }
    }
}

/// Read a boolean option from a WAMP options/details dict.
pub fn option_flag(options: &Value, key: &str) -> Option<bool> {
    options.get(key).and_then(Value::as_bool)
}
