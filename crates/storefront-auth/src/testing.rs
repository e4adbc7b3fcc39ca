//! Test doubles shared by the unit tests in this crate

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::BoxFuture;
use crate::error::{AuthError, Result};
use crate::store::SecretStore;
use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

enum Reply {
    Answer(std::result::Result<HttpResponse, TransportError>),
    Panic,
}

/// Transport that replays queued responses in order and records requests.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    responses: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(self, status: u16, body: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Reply::Answer(Ok(HttpResponse::new(status, body))));
        self
    }

    pub(crate) fn fail(self, message: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Reply::Answer(Err(TransportError(message.to_owned()))));
        self
    }

    /// Panic inside the send future, killing whatever task awaits it.
    pub(crate) fn panic(self) -> Self {
        self.responses.lock().unwrap().push_back(Reply::Panic);
        self
    }

    /// Sleep before answering each request.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn request(&self, index: usize) -> HttpRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'_, std::result::Result<HttpResponse, TransportError>> {
        self.requests.lock().unwrap().push(request);
        let next = match self.responses.lock().unwrap().pop_front() {
            Some(Reply::Answer(next)) => next,
            Some(Reply::Panic) => return Box::pin(panicking_send()),
            None => Err(TransportError("no scripted response".into())),
        };
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            next
        })
    }
}

async fn panicking_send() -> std::result::Result<HttpResponse, TransportError> {
    panic!("scripted transport panic")
}

/// Store whose every operation fails.
pub(crate) struct FailingStore;

impl SecretStore for FailingStore {
    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async { Err(AuthError::Storage("store offline".into())) })
    }

    fn set<'a>(&'a self, _key: &'a str, _secret: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Err(AuthError::Storage("store offline".into())) })
    }

    fn delete<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Err(AuthError::Storage("store offline".into())) })
    }
}

/// JSON success body from the token endpoint.
pub(crate) fn token_body(access: &str, refresh: Option<&str>, expires_in: u64) -> String {
    let mut body = serde_json::json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": expires_in,
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = refresh.into();
    }
    body.to_string()
}

#[tokio::test]
async fn unscripted_request_is_a_transport_error() {
    let transport = ScriptedTransport::new();
    let err = transport
        .send(HttpRequest::get("http://x"))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError("no scripted response".into()));
    assert_eq!(transport.request_count(), 1);
}
