//! Response aggregation
//!
//! The aggregator collates responses per request and emits exactly one
//! [`Decision`] per request. It never changes request state itself beyond
//! signalling `Pending -> Collecting` on the first response; terminal
//! transitions belong to the fulfillment gateway.

mod consensus;

pub use consensus::{decide, median, within_deviation, Agreement, ConsensusPolicy};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{AggregationError, LedgerError, SubmitError};
use crate::ledger::RequestLedger;
use crate::models::{
    ConsensusResult, Decision, FailureReason, NodeId, Receipt, RequestId, RequestState, Response,
    ResponsesView,
};
use crate::time::SharedClock;

/// Late responses kept per decided round; later ones are only logged
pub const MAX_AUDIT_RESPONSES: usize = 64;

/// What happened to one incoming response
#[derive(Debug, Clone, PartialEq)]
pub struct Intake {
    pub receipt: Receipt,
    /// Set only on the response that completed the request
    pub decision: Option<Decision>,
}

#[derive(Debug)]
struct Round {
    counted: BTreeMap<NodeId, Response>,
    audit: Vec<Response>,
    first_response_at: DateTime<Utc>,
    decision: Option<Decision>,
}

pub struct Aggregator {
    policy: ConsensusPolicy,
    ledger: Arc<RequestLedger>,
    clock: SharedClock,
    rounds: RwLock<HashMap<RequestId, Arc<Mutex<Round>>>>,
}

impl Aggregator {
    pub fn new(policy: ConsensusPolicy, ledger: Arc<RequestLedger>, clock: SharedClock) -> Self {
        Self {
            policy,
            ledger,
            clock,
            rounds: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &ConsensusPolicy {
        &self.policy
    }

    /// Fold one verified response into its request's round.
    pub fn on_response(&self, response: Response) -> Result<Intake, SubmitError> {
        let id = response.request_id;
        let request = self.ledger.get(id).map_err(|_| SubmitError::UnknownRequest(id))?;

        if let Some(round) = self.round(id) {
            let mut round = round.lock();
            if round.decision.is_some() {
                round.keep_for_audit(response);
                return Ok(Intake {
                    receipt: Receipt::Audited,
                    decision: None,
                });
            }
        }

        if request.state.is_terminal() {
            debug!(request_id = %id, state = %request.state, "response for closed request");
            return Err(SubmitError::RequestClosed {
                id,
                state: request.state,
            });
        }

        // Collecting must be reached before any decision can be delivered
        if request.state == RequestState::Pending {
            match self
                .ledger
                .transition(id, RequestState::Pending, RequestState::Collecting)
            {
                Ok(_) | Err(LedgerError::StaleTransition { .. }) => {}
                Err(err) => warn!(request_id = %id, error = %err, "could not start collecting"),
            }
        }

        let now = self.clock.utc_now();
        let round = self.round_or_insert(id, now);
        let mut round = round.lock();

        if round.decision.is_some() {
            round.keep_for_audit(response);
            return Ok(Intake {
                receipt: Receipt::Audited,
                decision: None,
            });
        }

        if round.counted.contains_key(&response.node_id) {
            debug!(request_id = %id, node_id = %response.node_id, "duplicate response");
            return Ok(Intake {
                receipt: Receipt::Duplicate,
                decision: None,
            });
        }

        if round.counted.is_empty() {
            round.first_response_at = now;
        }
        debug!(request_id = %id, node_id = %response.node_id, value = %response.value, "response counted");
        round.counted.insert(response.node_id.clone(), response);
        let responders = round.counted.len();

        let decision = if responders >= self.policy.quorum_size {
            Some(self.conclude(id, &mut round, now))
        } else {
            None
        };

        Ok(Intake {
            receipt: Receipt::Counted { responders },
            decision,
        })
    }

    /// Decide every undecided round whose quorum timeout has elapsed.
    pub fn evaluate_timeouts(&self, now: DateTime<Utc>) -> Vec<Decision> {
        let timeout = match chrono::Duration::from_std(self.policy.quorum_timeout) {
            Ok(timeout) => timeout,
            Err(_) => return Vec::new(),
        };

        let rounds: Vec<(RequestId, Arc<Mutex<Round>>)> = self
            .rounds
            .read()
            .iter()
            .map(|(id, round)| (*id, round.clone()))
            .collect();

        let mut decisions = Vec::new();
        for (id, round) in rounds {
            let mut round = round.lock();
            if round.decision.is_some() || round.counted.is_empty() {
                continue;
            }
            if now - round.first_response_at < timeout {
                continue;
            }
            match self.ledger.get(id) {
                Ok(request) if !request.state.is_terminal() => {}
                _ => continue,
            }

            let received = round.counted.len();
            if received < self.policy.minimum_responses {
                warn!(
                    request_id = %id,
                    received,
                    required = self.policy.minimum_responses,
                    "quorum timeout with insufficient responses"
                );
                let decision = Decision::Failed {
                    request_id: id,
                    reason: FailureReason::InsufficientResponses,
                };
                round.decision = Some(decision.clone());
                decisions.push(decision);
            } else {
                info!(request_id = %id, received, "quorum timeout; deciding with responses at hand");
                decisions.push(self.conclude(id, &mut round, now));
            }
        }
        decisions
    }

    pub fn decision(&self, id: RequestId) -> Option<Decision> {
        self.round(id).and_then(|round| round.lock().decision.clone())
    }

    pub fn result(&self, id: RequestId) -> Option<ConsensusResult> {
        match self.decision(id)? {
            Decision::Consensus(result) => Some(result),
            Decision::Failed { .. } => None,
        }
    }

    pub fn responses(&self, id: RequestId) -> ResponsesView {
        match self.round(id) {
            Some(round) => {
                let round = round.lock();
                ResponsesView {
                    counted: round.counted.values().cloned().collect(),
                    audit: round.audit.clone(),
                }
            }
            None => ResponsesView::default(),
        }
    }

    /// Drop the rounds of requests the ledger no longer holds.
    pub fn forget(&self, ids: &[RequestId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut rounds = self.rounds.write();
        let forgotten = ids.iter().filter(|id| rounds.remove(id).is_some()).count();
        debug!(forgotten, remaining = rounds.len(), "rounds forgotten");
        forgotten
    }

    pub fn round_count(&self) -> usize {
        self.rounds.read().len()
    }

    fn conclude(&self, id: RequestId, round: &mut Round, now: DateTime<Utc>) -> Decision {
        let responses: Vec<Response> = round.counted.values().cloned().collect();
        let decision = match decide(&self.policy, &responses) {
            Ok(agreement) => {
                info!(
                    request_id = %id,
                    value = %agreement.value,
                    method = %self.policy.method,
                    responders = responses.len(),
                    contributing = agreement.contributing.len(),
                    "consensus reached"
                );
                Decision::Consensus(ConsensusResult {
                    request_id: id,
                    value: agreement.value,
                    contributing_nodes: agreement.contributing,
                    method: self.policy.method,
                    responders: responses.len(),
                    decided_at: now,
                })
            }
            Err(err) => {
                warn!(request_id = %id, error = %err, "consensus failed");
                Decision::Failed {
                    request_id: id,
                    reason: failure_reason(&err),
                }
            }
        };

        round.decision = Some(decision.clone());
        decision
    }

    fn round(&self, id: RequestId) -> Option<Arc<Mutex<Round>>> {
        self.rounds.read().get(&id).cloned()
    }

    fn round_or_insert(&self, id: RequestId, now: DateTime<Utc>) -> Arc<Mutex<Round>> {
        if let Some(round) = self.round(id) {
            return round;
        }
        self.rounds
            .write()
            .entry(id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Round {
                    counted: BTreeMap::new(),
                    audit: Vec::new(),
                    first_response_at: now,
                    decision: None,
                }))
            })
            .clone()
    }
}

impl Round {
    fn keep_for_audit(&mut self, response: Response) {
        if self.audit.len() >= MAX_AUDIT_RESPONSES {
            debug!(request_id = %response.request_id, node_id = %response.node_id, "audit history full; late response dropped");
            return;
        }
        debug!(request_id = %response.request_id, node_id = %response.node_id, "late response kept for audit");
        self.audit.push(response);
    }
}

fn failure_reason(err: &AggregationError) -> FailureReason {
    match err {
        AggregationError::NoMajority => FailureReason::NoMajority,
        AggregationError::InsufficientResponses { .. } => FailureReason::InsufficientResponses,
        AggregationError::NonNumericValues => FailureReason::NonNumericValues,
    }
}
