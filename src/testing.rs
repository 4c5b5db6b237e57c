//! Test doubles shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::HostConfig;
use crate::protocol::{ProtocolClient, ProtocolError, ProtocolRequest, ProtocolResponse};

/// One call seen by a [`ScriptedClient`].
#[derive(Debug, Clone)]
pub(crate) struct CallRecord {
    pub request: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Protocol client answering from a script keyed by the request's display
/// form (e.g. `snmpGet 1.3.6.1`).
#[derive(Default)]
pub(crate) struct ScriptedClient {
    responses: HashMap<String, Result<ProtocolResponse, String>>,
    delay: Duration,
    calls: Mutex<Vec<CallRecord>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn respond(mut self, request: &str, text: &str) -> Self {
        self.responses
            .insert(request.to_string(), Ok(ProtocolResponse::Text(text.to_string())));
        self
    }

    pub fn respond_rows(mut self, request: &str, rows: &[&[&str]]) -> Self {
        let rows = rows
            .iter()
            .map(|row| row.iter().map(|cell| cell.to_string()).collect())
            .collect();
        self.responses
            .insert(request.to_string(), Ok(ProtocolResponse::Rows(rows)));
        self
    }

    pub fn fail(mut self, request: &str, message: &str) -> Self {
        self.responses
            .insert(request.to_string(), Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, request: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.request == request)
            .count()
    }
}

#[async_trait::async_trait]
impl ProtocolClient for ScriptedClient {
    async fn execute(
        &self,
        request: &ProtocolRequest,
        _host: &HostConfig,
        _timeout: Duration,
    ) -> Result<ProtocolResponse, ProtocolError> {
        let key = request.to_string();
        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.lock().unwrap().push(CallRecord {
            request: key.clone(),
            started,
            finished: Instant::now(),
        });

        match self.responses.get(&key) {
            Some(Ok(response)) => Ok(response.clone()),
            Some(Err(message)) => Err(ProtocolError::Unreachable(message.clone())),
            None => Err(ProtocolError::Failed(format!("no scripted response for '{}'", key))),
        }
    }
}

/// Protocol client answering successive calls with successive scripted
/// responses, whatever the request.
#[derive(Default)]
pub(crate) struct SequenceClient {
    responses: Mutex<VecDeque<Result<ProtocolResponse, String>>>,
}

impl SequenceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_rows(self, rows: &[&[&str]]) -> Self {
        let rows = rows
            .iter()
            .map(|row| row.iter().map(|cell| cell.to_string()).collect())
            .collect();
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(ProtocolResponse::Rows(rows)));
        self
    }

    pub fn then_fail(self, message: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }
}

#[async_trait::async_trait]
impl ProtocolClient for SequenceClient {
    async fn execute(
        &self,
        request: &ProtocolRequest,
        _host: &HostConfig,
        _timeout: Duration,
    ) -> Result<ProtocolResponse, ProtocolError> {
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(ProtocolError::Unreachable(message)),
            None => Err(ProtocolError::Failed(format!("script exhausted at '{}'", request))),
        }
    }
}
