//! Oracle node agent
//!
//! A `NodeAgent` owns one oracle identity. It watches the ledger for
//! `Pending` requests, fetches each one it serves with bounded retries and
//! posts a signed response through a [`ResponseSink`]. It never touches
//! request state; silence after exhausted retries is a valid outcome.
//! Job bookkeeping for a request is dropped once the request is terminal.

mod signer;

pub use signer::{
    response_digest, Ed25519Signer, NodeRegistry, ResponseSigner, SignatureVerifier,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{AgentError, FetchError, SubmitError};
use crate::fetcher::Fetcher;
use crate::ledger::{LedgerEvent, RequestLedger};
use crate::models::{NodeId, OracleValue, Receipt, Request, RequestId, RequestState, SignedResponse};
use crate::time::SharedClock;

/// Transport from a node to the coordinator
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn post(&self, response: SignedResponse) -> Result<Receipt, SubmitError>;
}

/// Per-request job progress inside one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Watching,
    Fetching,
    Submitted,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObserveOutcome {
    /// Not pending, or not a source this node serves
    Ignored,
    /// A job for this request already exists
    AlreadyTracking,
    Submitted(Receipt),
    /// Every fetch attempt failed or the deadline passed; nothing was posted
    Silent,
}

#[derive(Default)]
struct Jobs {
    states: HashMap<RequestId, JobState>,
    submitted: HashSet<RequestId>,
}

pub struct NodeAgent {
    config: NodeConfig,
    signer: Arc<dyn ResponseSigner>,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn ResponseSink>,
    clock: SharedClock,
    jobs: Mutex<Jobs>,
}

impl NodeAgent {
    pub fn new(
        config: NodeConfig,
        signer: Arc<dyn ResponseSigner>,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn ResponseSink>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            signer,
            fetcher,
            sink,
            clock,
            jobs: Mutex::new(Jobs::default()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.signer.node_id()
    }

    pub fn serves(&self, request: &Request) -> bool {
        self.config.serves(&request.payload.source)
    }

    pub fn job_state(&self, id: RequestId) -> Option<JobState> {
        self.jobs.lock().states.get(&id).copied()
    }

    /// Handle a newly seen request: fetch it and post a response if this
    /// node serves its source.
    pub async fn observe(&self, request: &Request) -> Result<ObserveOutcome, AgentError> {
        if request.state != RequestState::Pending || !self.serves(request) {
            debug!(node_id = %self.node_id(), request_id = %request.id, "request ignored");
            return Ok(ObserveOutcome::Ignored);
        }

        {
            let mut jobs = self.jobs.lock();
            if jobs.states.contains_key(&request.id) {
                return Ok(ObserveOutcome::AlreadyTracking);
            }
            jobs.states.insert(request.id, JobState::Watching);
        }

        self.set_state(request.id, JobState::Fetching);
        let Some(value) = self.fetch_with_retry(request).await else {
            self.set_state(request.id, JobState::Done);
            return Ok(ObserveOutcome::Silent);
        };

        match self.submit_response(request.id, value).await {
            Ok(receipt) => Ok(ObserveOutcome::Submitted(receipt)),
            Err(err) => {
                self.set_state(request.id, JobState::Done);
                Err(err)
            }
        }
    }

    /// Sign and post a response. Fails with `AlreadySubmitted` when this
    /// node already has a counted response for `id`.
    pub async fn submit_response(
        &self,
        id: RequestId,
        value: OracleValue,
    ) -> Result<Receipt, AgentError> {
        if self.jobs.lock().submitted.contains(&id) {
            return Err(AgentError::AlreadySubmitted(id));
        }

        let signed = self.signer.sign(id, value, self.clock.utc_now());
        let receipt = self.post_with_retry(signed).await?;

        {
            let mut jobs = self.jobs.lock();
            jobs.submitted.insert(id);
            jobs.states.insert(id, JobState::Submitted);
        }

        match receipt {
            Receipt::Duplicate => Err(AgentError::AlreadySubmitted(id)),
            receipt => {
                info!(node_id = %self.node_id(), request_id = %id, ?receipt, "response submitted");
                Ok(receipt)
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.jobs.lock().states.len()
    }

    /// Serve every request the ledger holds in `Pending`, then follow ledger
    /// events until the channel closes. Requests that arrived without an
    /// event (restored, or skipped while lagging) are picked up by rescanning.
    pub async fn run(self: Arc<Self>, ledger: Arc<RequestLedger>) {
        let mut events = ledger.subscribe();
        info!(node_id = %self.node_id(), "node agent started");
        self.catch_up(&ledger);

        loop {
            match events.recv().await {
                Ok(LedgerEvent::Submitted(request)) => self.spawn_job(&ledger, request),
                Ok(LedgerEvent::Transitioned { id, to, .. }) if to.is_terminal() => self.forget(id),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(node_id = %self.node_id(), skipped, "node agent lagged behind ledger events; rescanning");
                    self.catch_up(&ledger);
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!(node_id = %self.node_id(), "node agent stopped");
    }

    fn catch_up(self: &Arc<Self>, ledger: &Arc<RequestLedger>) {
        let pending = ledger.list(Some(RequestState::Pending));
        if !pending.is_empty() {
            info!(node_id = %self.node_id(), pending = pending.len(), "serving pending requests");
        }
        for request in pending {
            self.spawn_job(ledger, request);
        }
    }

    fn spawn_job(self: &Arc<Self>, ledger: &Arc<RequestLedger>, request: Request) {
        let agent = self.clone();
        let ledger = ledger.clone();
        tokio::spawn(async move {
            match agent.observe(&request).await {
                Ok(_) => {}
                Err(AgentError::AlreadySubmitted(_)) => {
                    debug!(request_id = %request.id, "response already submitted")
                }
                Err(err) => {
                    warn!(node_id = %agent.node_id(), request_id = %request.id, error = %err, "response not accepted")
                }
            }
            // the terminal event may have been handled while this job ran
            let closed = ledger
                .get(request.id)
                .map_or(true, |current| current.state.is_terminal());
            if closed {
                agent.forget(request.id);
            }
        });
    }

    fn forget(&self, id: RequestId) {
        let mut jobs = self.jobs.lock();
        jobs.states.remove(&id);
        jobs.submitted.remove(&id);
    }

    async fn fetch_with_retry(&self, request: &Request) -> Option<OracleValue> {
        let node_id = self.node_id();
        let retry = self.config.retry;
        let mut attempt = 0;

        loop {
            let remaining = match (request.deadline - self.clock.utc_now()).to_std() {
                Ok(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    info!(node_id = %node_id, request_id = %request.id, attempt, "deadline passed; abandoning fetch");
                    return None;
                }
            };

            attempt += 1;
            let timeout = self.config.fetch_timeout.min(remaining);
            let outcome =
                tokio::time::timeout(timeout, self.fetcher.fetch(&request.payload, timeout))
                    .await
                    .unwrap_or_else(|_| Err(FetchError::Timeout(timeout.as_millis() as u64)));
            match outcome {
                Ok(value) => return Some(value),
                Err(err) if err.is_transient() && retry.allows_retry(attempt) => {
                    let delay = retry.delay(attempt);
                    warn!(
                        node_id = %node_id,
                        request_id = %request.id,
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(node_id = %node_id, request_id = %request.id, attempt, error = %err, "fetch failed; staying silent");
                    return None;
                }
            }
        }
    }

    async fn post_with_retry(&self, signed: SignedResponse) -> Result<Receipt, SubmitError> {
        let retry = self.config.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.sink.post(signed.clone()).await {
                Err(SubmitError::Transport(reason)) if retry.allows_retry(attempt) => {
                    let delay = retry.delay(attempt);
                    warn!(
                        request_id = %signed.response.request_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "response post failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    fn set_state(&self, id: RequestId, state: JobState) {
        if let Some(current) = self.jobs.lock().states.get_mut(&id) {
            *current = state;
        }
    }
}
