//! # Stub Harness
//!
//! A scriptable [`InstanceStub`] for unit-testing caller-side logic without
//! spawning an instance runtime. Expectations are queued in order; a
//! background task answers each inbound request with its canned response
//! and panics on a method/path mismatch or an unexpected request.
//!
//! Use this to test code *around* a stub (typed decoding, error-envelope
//! handling, orchestration across several actors). Testing an actor itself
//! wants a real [`Factory`](crate::factory::Factory).

use crate::factory::InstanceStub;
use crate::message::Envelope;
use crate::request::{Method, Response};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct Expectation {
    method: Method,
    path: String,
    response: Response,
}

/// Scripted stand-in for one instance.
///
/// ```ignore
/// let mut harness = StubHarness::new();
/// harness.expect(Method::Get, "/status").respond(Response::ok(json!({"phase": "Complete"})));
/// let stub = harness.stub();
/// // drive the code under test with `stub` ...
/// harness.verify();
/// ```
pub struct StubHarness {
    stub: InstanceStub,
    expectations: Arc<Mutex<VecDeque<Expectation>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl Default for StubHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl StubHarness {
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::channel::<Envelope>(16);
        let expectations: Arc<Mutex<VecDeque<Expectation>>> =
            Arc::new(Mutex::new(VecDeque::new()));
        let queue = expectations.clone();

        let handle = tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                match envelope {
                    Envelope::Invoke {
                        request,
                        respond_to,
                    } => {
                        let expectation = queue
                            .lock()
                            .expect("harness queue poisoned")
                            .pop_front()
                            .unwrap_or_else(|| {
                                panic!(
                                    "unexpected request: {} {}",
                                    request.method, request.path
                                )
                            });
                        assert_eq!(
                            (request.method, request.path.as_str()),
                            (expectation.method, expectation.path.as_str()),
                            "request does not match the next expectation",
                        );
                        let _ = respond_to.send(expectation.response);
                    }
                    Envelope::Hibernate { respond_to } => {
                        let _ = respond_to.send(());
                    }
                    other => panic!("harness only scripts requests, got {other:?}"),
                }
            }
        });

        Self {
            stub: InstanceStub::from_mailbox(sender),
            expectations,
            _handle: handle,
        }
    }

    /// Queues an expected request. Call [`ExpectationBuilder::respond`] to
    /// set its canned response.
    pub fn expect(&mut self, method: Method, path: impl Into<String>) -> ExpectationBuilder {
        ExpectationBuilder {
            method,
            path: path.into(),
            expectations: self.expectations.clone(),
        }
    }

    /// The scripted stub for use in tests.
    pub fn stub(&self) -> InstanceStub {
        self.stub.clone()
    }

    /// Panics if any queued expectation went unused.
    pub fn verify(&self) {
        let remaining = self
            .expectations
            .lock()
            .expect("harness queue poisoned")
            .len();
        if remaining > 0 {
            panic!("{remaining} expectation(s) were never requested");
        }
    }
}

pub struct ExpectationBuilder {
    method: Method,
    path: String,
    expectations: Arc<Mutex<VecDeque<Expectation>>>,
}

impl ExpectationBuilder {
    pub fn respond(self, response: Response) {
        self.expectations
            .lock()
            .expect("harness queue poisoned")
            .push_back(Expectation {
                method: self.method,
                path: self.path,
                response,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HearthError;
    use crate::request::Request;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Status {
        phase: String,
    }

    #[tokio::test]
    async fn scripted_responses_come_back_in_order() {
        let mut harness = StubHarness::new();
        harness
            .expect(Method::Post, "/start")
            .respond(Response::ok(json!({"phase": "Querying"})));
        harness
            .expect(Method::Get, "/status")
            .respond(Response::ok(json!({"phase": "Complete"})));

        let stub = harness.stub();
        let first: Status = stub.send_json(Request::post("/start")).await.unwrap();
        assert_eq!(first.phase, "Querying");
        let second: Status = stub.send_json(Request::get("/status")).await.unwrap();
        assert_eq!(second.phase, "Complete");
        harness.verify();
    }

    #[tokio::test]
    async fn typed_decode_rejects_error_envelopes() {
        let mut harness = StubHarness::new();
        harness
            .expect(Method::Get, "/status")
            .respond(Response::conflict("job_active", "A job is already running"));

        let err = harness
            .stub()
            .send_json::<Status>(Request::get("/status"))
            .await
            .unwrap_err();
        match err {
            HearthError::RemoteStatus { status, code, .. } => {
                assert_eq!(status, 409);
                assert_eq!(code, "job_active");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn typed_decode_rejects_mis_shaped_bodies() {
        let mut harness = StubHarness::new();
        harness
            .expect(Method::Get, "/status")
            .respond(Response::ok(json!({"unrelated": true})));

        let err = harness
            .stub()
            .send_json::<Status>(Request::get("/status"))
            .await
            .unwrap_err();
        assert!(matches!(err, HearthError::ResponseShape(_)));
    }
}
