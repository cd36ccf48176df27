//! Classification and construction of JSON-RPC 2.0 messages.

use serde_json::{Map, Value};

use crate::{ErrorObject, VERSION};

/// A request or notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Name of the method to invoke.
    pub method: String,

    /// Raw params as received. Shape is checked by the dispatcher, not here.
    pub params: Option<Value>,

    /// Request id. `None` marks a notification, which never gets a reply.
    pub id: Option<Value>,
}

impl Request {
    /// Create a request expecting a reply.
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self {
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    /// Create a one-way notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            id: None,
        }
    }

    /// True when no reply is expected.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Render the wire form.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_owned(), Value::from(VERSION));
        object.insert("method".to_owned(), Value::from(self.method.clone()));
        if let Some(params) = &self.params {
            object.insert("params".to_owned(), params.clone());
        }
        if let Some(id) = &self.id {
            object.insert("id".to_owned(), id.clone());
        }
        Value::Object(object)
    }
}

/// A reply to an earlier request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request being answered (`null` if it could not be read).
    pub id: Value,

    /// The `result` member on success, the `error` member otherwise.
    pub outcome: Result<Value, ErrorObject>,
}

impl Response {
    /// Successful reply.
    pub fn success(id: Value, result: Value) -> Self {
        Self { id, outcome: Ok(result) }
    }

    /// Error reply.
    pub fn failure(id: Value, error: ErrorObject) -> Self {
        Self { id, outcome: Err(error) }
    }

    /// Render the wire form.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_owned(), Value::from(VERSION));
        match &self.outcome {
            Ok(result) => {
                object.insert("result".to_owned(), result.clone());
            }
            Err(error) => {
                // ErrorObject only holds plain JSON, so this cannot fail.
                let error = serde_json::to_value(error).unwrap_or(Value::Null);
                object.insert("error".to_owned(), error);
            }
        }
        object.insert("id".to_owned(), self.id.clone());
        Value::Object(object)
    }
}

/// One complete, already parsed message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Has a `method` member.
    Request(Request),

    /// Has `result` or `error` plus an `id`.
    Response(Response),

    /// Anything else. `id` is the request id when it could be recovered so
    /// the error reply can still be correlated.
    Invalid {
        /// Id to echo back in the error reply.
        id: Value,
        /// Why the message was rejected.
        reason: &'static str,
    },
}

impl Message {
    /// Classify a single (non-batch) JSON value.
    pub fn classify(value: Value) -> Self {
        let Value::Object(mut object) = value else {
            return Self::invalid(Value::Null, "message is not an object");
        };

        let id = object.remove("id");
        let id_valid = matches!(id, None | Some(Value::Null | Value::String(_) | Value::Number(_)));
        let echo_id = match (&id, id_valid) {
            (Some(id), true) => id.clone(),
            _ => Value::Null,
        };

        if object.get("jsonrpc").and_then(Value::as_str) != Some(VERSION) {
            return Self::invalid(echo_id, "missing or unsupported jsonrpc version");
        }
        if !id_valid {
            return Self::invalid(echo_id, "id must be a string, number or null");
        }

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Self::invalid(echo_id, "method is not a string");
            };
            return Self::Request(Request {
                method,
                params: object.remove("params"),
                id,
            });
        }

        if id.is_none() {
            return Self::invalid(echo_id, "response without an id");
        }

        match (object.remove("result"), object.remove("error")) {
            (Some(result), None) => Self::Response(Response::success(echo_id, result)),
            (None, Some(error)) => match serde_json::from_value::<ErrorObject>(error) {
                Ok(error) => Self::Response(Response::failure(echo_id, error)),
                Err(_) => Self::invalid(echo_id, "malformed error object"),
            },
            _ => Self::invalid(echo_id, "neither a request nor a response"),
        }
    }

    fn invalid(id: Value, reason: &'static str) -> Self {
        Self::Invalid { id, reason }
    }
}
