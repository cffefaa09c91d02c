//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use hashbrown::HashMap;
use http::StatusCode;
use peppi_net::{Fetcher, NetError, Request, Response};
use url::Url;

pub const ORIGIN: &str = "https://peppi.test/";

/// Absolute URL on the test origin.
pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

#[derive(Clone)]
enum Outcome {
    Status(u16, String),
    Fail,
}

/// Fetcher answering from a fixed table and counting calls per URL.
/// Unknown URLs fail like an unreachable host.
#[derive(Default)]
pub struct ScriptedFetcher {
    outcomes: Mutex<HashMap<String, Outcome>>,
    calls: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, path: &str, status: u16, body: &str) -> Self {
        self.set(path, Outcome::Status(status, body.to_string()));
        self
    }

    pub fn fail(self, path: &str) -> Self {
        self.set(path, Outcome::Fail);
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self, path: &str) -> usize {
        let key = url(path).to_string();
        self.calls.lock().unwrap().get(&key).copied().unwrap_or(0)
    }

    fn set(&self, path: &str, outcome: Outcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(url(path).to_string(), outcome);
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let key = request.url.to_string();
        *self.calls.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(key));
        }

        let outcome = self.outcomes.lock().unwrap().get(&key).cloned();
        match outcome {
            Some(Outcome::Status(status, body)) => Ok(Response::new(
                request.url.clone(),
                StatusCode::from_u16(status).unwrap(),
            )
            .with_body(body)),
            Some(Outcome::Fail) | None => Err(NetError::Offline(key)),
        }
    }
}
