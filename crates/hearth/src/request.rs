//! # Request Protocol
//!
//! The HTTP-shaped protocol callers speak to actor instances: a method and
//! path, an optional JSON body and query map, answered by a status code and
//! JSON body. The shapes are transport-agnostic; an HTTP front end maps
//! onto them one-to-one, and tests drive them directly.
//!
//! A [`RequestContext`] is constructed once per inbound call after routing
//! and is immutable from the handler's point of view.

use crate::error::{ErrorEnvelope, HearthError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Request methods supported by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        };
        write!(f, "{s}")
    }
}

/// An inbound request as sent by a caller stub.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: HashMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

/// Everything a handler can learn about one inbound call. Built by the
/// runtime after route matching; path parameters are extracted positionally
/// as strings, and handlers are responsible for parsing them further.
#[derive(Debug)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
}

impl RequestContext {
    pub fn new(request: Request, params: HashMap<String, String>) -> Self {
        Self {
            method: request.method,
            path: request.path,
            params,
            query: request.query,
            body: request.body,
        }
    }

    /// Path parameter by name, as extracted by the router.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Parses the JSON body into a typed value. A missing body or a shape
    /// mismatch is the caller's fault; handlers usually answer it with
    /// [`Response::bad_request`].
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, HearthError> {
        let body = self
            .body
            .clone()
            .ok_or_else(|| HearthError::ResponseShape("missing request body".into()))?;
        serde_json::from_value(body)
            .map_err(|err| HearthError::ResponseShape(err.to_string()))
    }
}

/// Status code plus JSON body. Failure responses always carry an
/// [`ErrorEnvelope`] body.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::json(200, body)
    }

    pub fn error(status: u16, code: &str, description: &str) -> Self {
        let envelope = ErrorEnvelope::new(code, description);
        Self::json(
            status,
            serde_json::to_value(envelope).unwrap_or(Value::Null),
        )
    }

    pub fn bad_request(code: &str, description: &str) -> Self {
        Self::error(400, code, description)
    }

    pub fn not_found() -> Self {
        Self::error(404, "not_found", "No route matches the request path")
    }

    pub fn method_not_allowed() -> Self {
        Self::error(
            405,
            "method_not_allowed",
            "The path exists but not for this method",
        )
    }

    pub fn conflict(code: &str, description: &str) -> Self {
        Self::error(409, code, description)
    }

    /// Opaque 500 response. The real cause is logged by the runtime, never
    /// shipped to the caller.
    pub fn internal_error(code: &str) -> Self {
        Self::error(500, code, "Internal error")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the error envelope of a failure response. Falls back to an
    /// `unknown_error` envelope when the body is not well-formed, so callers
    /// always get a usable envelope.
    pub fn error_envelope(&self) -> ErrorEnvelope {
        serde_json::from_value(self.body.clone()).unwrap_or_else(|_| {
            ErrorEnvelope::new("unknown_error", "Malformed error response body")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_responses_carry_well_formed_envelopes() {
        let resp = Response::not_found();
        assert_eq!(resp.status, 404);
        let envelope = resp.error_envelope();
        assert_eq!(envelope.error_code, "not_found");

        let resp = Response::method_not_allowed();
        assert_eq!(resp.status, 405);
        assert_eq!(resp.error_envelope().error_code, "method_not_allowed");
    }

    #[test]
    fn internal_error_is_opaque() {
        let resp = Response::internal_error("handler_error");
        let envelope = resp.error_envelope();
        assert_eq!(envelope.error_code, "handler_error");
        assert_eq!(envelope.error_description, "Internal error");
    }

    #[test]
    fn body_as_rejects_shape_mismatch() {
        #[derive(serde::Deserialize)]
        struct Expected {
            #[allow(dead_code)]
            count: u32,
        }

        let ctx = RequestContext::new(
            Request::post("/x").with_body(json!({"count": "not a number"})),
            HashMap::new(),
        );
        assert!(ctx.body_as::<Expected>().is_err());

        let ctx = RequestContext::new(Request::post("/x"), HashMap::new());
        assert!(ctx.body_as::<Expected>().is_err());
    }
}
