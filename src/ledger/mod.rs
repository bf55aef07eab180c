//! Request ledger
//!
//! Single source of truth for request lifecycle. Every state change goes
//! through [`RequestLedger::transition`], a compare-and-swap guarded by a
//! per-request lock; there is no ledger-wide lock on the mutation path.

mod snapshot;

pub use snapshot::{load_snapshot, persist_snapshot, LedgerSnapshot};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::models::{
    Amount, FailureReason, Request, RequestId, RequestPayload, RequestState,
};
use crate::time::SharedClock;
use crate::treasury::{refund_escrow, Treasury};

const EVENT_CAPACITY: usize = 1024;

/// Ledger notifications consumed by node agents and observers
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    Submitted(Request),
    Transitioned {
        id: RequestId,
        from: RequestState,
        to: RequestState,
    },
}

pub struct RequestLedger {
    entries: RwLock<HashMap<RequestId, Arc<Mutex<Request>>>>,
    minimum_fee: Amount,
    clock: SharedClock,
    treasury: Arc<dyn Treasury>,
    events: broadcast::Sender<LedgerEvent>,
}

impl RequestLedger {
    pub fn new(minimum_fee: Amount, clock: SharedClock, treasury: Arc<dyn Treasury>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            minimum_fee,
            clock,
            treasury,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Record a new request in `Pending`.
    pub fn submit(
        &self,
        payload: RequestPayload,
        requester: impl Into<String>,
        callback: impl Into<String>,
        fee: Amount,
        deadline: DateTime<Utc>,
    ) -> Result<RequestId, LedgerError> {
        if fee < self.minimum_fee {
            return Err(LedgerError::InsufficientFee {
                offered: fee,
                minimum: self.minimum_fee,
            });
        }

        let now = self.clock.utc_now();
        if deadline <= now {
            return Err(LedgerError::InvalidDeadline { deadline });
        }

        payload.check().map_err(LedgerError::InvalidPayload)?;

        let request = Request {
            id: RequestId::new(),
            payload,
            requester: requester.into(),
            callback: callback.into(),
            fee_reserved: fee,
            state: RequestState::Pending,
            deadline,
            created_at: now,
            updated_at: now,
            failure_reason: None,
        };
        let id = request.id;

        self.entries
            .write()
            .insert(id, Arc::new(Mutex::new(request.clone())));

        info!(
            request_id = %id,
            requester = %request.requester,
            fee,
            deadline = %deadline,
            "request submitted"
        );
        let _ = self.events.send(LedgerEvent::Submitted(request));

        Ok(id)
    }

    pub fn get(&self, id: RequestId) -> Result<Request, LedgerError> {
        let entry = self.entry(id)?;
        let request = entry.lock().clone();
        Ok(request)
    }

    /// All requests, oldest first, optionally restricted to one state.
    pub fn list(&self, state: Option<RequestState>) -> Vec<Request> {
        let entries: Vec<Arc<Mutex<Request>>> = self.entries.read().values().cloned().collect();
        let mut requests: Vec<Request> = entries
            .iter()
            .map(|entry| entry.lock().clone())
            .filter(|request| state.map_or(true, |wanted| request.state == wanted))
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        requests
    }

    /// Conditional state change: succeeds only if the request is currently
    /// in `from`. Returns the updated request.
    pub fn transition(
        &self,
        id: RequestId,
        from: RequestState,
        to: RequestState,
    ) -> Result<Request, LedgerError> {
        self.transition_with_reason(id, from, to, None)
    }

    pub fn transition_with_reason(
        &self,
        id: RequestId,
        from: RequestState,
        to: RequestState,
        reason: Option<FailureReason>,
    ) -> Result<Request, LedgerError> {
        if !from.can_transition_to(to) {
            return Err(LedgerError::IllegalTransition { from, to });
        }

        let entry = self.entry(id)?;
        let updated = {
            let mut request = entry.lock();
            if request.state != from {
                debug!(
                    request_id = %id,
                    expected = %from,
                    actual = %request.state,
                    "stale transition"
                );
                return Err(LedgerError::StaleTransition {
                    id,
                    expected: from,
                    actual: request.state,
                });
            }

            request.state = to;
            request.updated_at = self.clock.utc_now();
            if matches!(to, RequestState::Failed | RequestState::Expired) {
                request.failure_reason = reason.or(Some(FailureReason::DeadlinePassed));
            }
            request.clone()
        };

        info!(request_id = %id, from = %from, to = %to, "request transitioned");
        let _ = self.events.send(LedgerEvent::Transitioned { id, from, to });

        Ok(updated)
    }

    /// Expire every non-terminal request whose deadline is before `now` and
    /// refund its escrow. Requests already terminal are skipped, so
    /// concurrent or repeated sweeps never expire or refund twice.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<Request> {
        let entries: Vec<Arc<Mutex<Request>>> = self.entries.read().values().cloned().collect();

        let mut expired = Vec::new();
        for entry in entries {
            let transitioned = {
                let mut request = entry.lock();
                if request.state.is_terminal() || request.deadline >= now {
                    None
                } else {
                    let from = request.state;
                    debug_assert!(from.can_transition_to(RequestState::Expired));
                    request.state = RequestState::Expired;
                    request.updated_at = now;
                    request.failure_reason = Some(FailureReason::DeadlinePassed);
                    Some((from, request.clone()))
                }
            };

            if let Some((from, request)) = transitioned {
                warn!(request_id = %request.id, from = %from, deadline = %request.deadline, "request expired");
                let _ = self.events.send(LedgerEvent::Transitioned {
                    id: request.id,
                    from,
                    to: RequestState::Expired,
                });
                expired.push(request);
            }
        }

        for request in &expired {
            refund_escrow(self.treasury.as_ref(), request).await;
        }

        expired
    }

    /// Remove terminal requests last updated before `before`. Returns the
    /// removed ids so dependent state can be dropped with them.
    pub fn purge_terminal(&self, before: DateTime<Utc>) -> Vec<RequestId> {
        let mut purged = Vec::new();
        self.entries.write().retain(|id, entry| {
            let request = entry.lock();
            let keep = !request.state.is_terminal() || request.updated_at >= before;
            if !keep {
                purged.push(*id);
            }
            keep
        });
        if !purged.is_empty() {
            info!(purged = purged.len(), before = %before, "terminal requests purged");
        }
        purged
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            taken_at: self.clock.utc_now(),
            requests: self.list(None),
        }
    }

    /// Load requests from a snapshot, replacing entries with the same id.
    pub fn restore(&self, snapshot: LedgerSnapshot) -> usize {
        let mut entries = self.entries.write();
        let restored = snapshot.requests.len();
        for request in snapshot.requests {
            entries.insert(request.id, Arc::new(Mutex::new(request)));
        }
        info!(restored, taken_at = %snapshot.taken_at, "ledger restored from snapshot");
        restored
    }

    fn entry(&self, id: RequestId) -> Result<Arc<Mutex<Request>>, LedgerError> {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))
    }
}
