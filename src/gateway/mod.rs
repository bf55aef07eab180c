//! Fulfillment gateway
//!
//! Only the caller that wins the ledger's `Collecting -> Fulfilled`
//! compare-and-swap invokes the callback, so each request is delivered at
//! most once no matter how many concurrent `deliver` calls race.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::callback::{CallbackDispatcher, Delivery};
use crate::error::{CallbackError, GatewayError, LedgerError};
use crate::ledger::RequestLedger;
use crate::models::{Amount, ConsensusResult, FailureReason, RequestId, RequestState};
use crate::retry::RetryPolicy;
use crate::treasury::{refund_escrow, settle_fulfilled, Treasury};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// Another caller won the transition, or the request already ended
    AlreadyHandled,
    /// Retries exhausted; the request is now `Failed` and refunded
    Failed { attempts: u32, reason: String },
}

pub struct FulfillmentGateway {
    ledger: Arc<RequestLedger>,
    dispatcher: Arc<dyn CallbackDispatcher>,
    treasury: Arc<dyn Treasury>,
    retry: RetryPolicy,
    delivery_timeout: Duration,
    node_fee_share: Amount,
}

impl FulfillmentGateway {
    pub fn new(
        ledger: Arc<RequestLedger>,
        dispatcher: Arc<dyn CallbackDispatcher>,
        treasury: Arc<dyn Treasury>,
        retry: RetryPolicy,
        delivery_timeout: Duration,
        node_fee_share: Amount,
    ) -> Self {
        Self {
            ledger,
            dispatcher,
            treasury,
            retry,
            delivery_timeout,
            node_fee_share,
        }
    }

    /// Deliver a consensus result to its requester exactly once.
    pub async fn deliver(&self, result: &ConsensusResult) -> Result<DeliveryOutcome, GatewayError> {
        let id = result.request_id;
        let request = match self
            .ledger
            .transition(id, RequestState::Collecting, RequestState::Fulfilled)
        {
            Ok(request) => request,
            Err(LedgerError::StaleTransition { actual, .. }) => {
                info!(request_id = %id, state = %actual, "delivery already handled");
                return Ok(DeliveryOutcome::AlreadyHandled);
            }
            Err(err) => return Err(err.into()),
        };

        let delivery = Delivery::new(&request, result);
        let mut attempt = 0;
        let last_error = loop {
            attempt += 1;
            let outcome =
                tokio::time::timeout(self.delivery_timeout, self.dispatcher.dispatch(&delivery))
                    .await
                    .unwrap_or(Err(CallbackError::Timeout));

            match outcome {
                Ok(()) => {
                    info!(request_id = %id, attempts = attempt, value = %result.value, "request fulfilled");
                    settle_fulfilled(
                        self.treasury.as_ref(),
                        &request,
                        &result.contributing_nodes,
                        self.node_fee_share,
                    )
                    .await;
                    return Ok(DeliveryOutcome::Delivered { attempts: attempt });
                }
                // a rejection is final; transport failures and timeouts are retried
                Err(err)
                    if !matches!(err, CallbackError::Rejected(_))
                        && self.retry.allows_retry(attempt) =>
                {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        request_id = %id,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "callback failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break err,
            }
        };

        error!(request_id = %id, attempts = attempt, error = %last_error, "delivery failed; giving up");
        let failed = self.ledger.transition_with_reason(
            id,
            RequestState::Fulfilled,
            RequestState::Failed,
            Some(FailureReason::DeliveryFailed),
        )?;
        refund_escrow(self.treasury.as_ref(), &failed).await;

        Ok(DeliveryOutcome::Failed {
            attempts: attempt,
            reason: last_error.to_string(),
        })
    }

    /// Move a request that could not reach consensus to `Failed` and refund
    /// its fee. Returns `false` when the request had already ended.
    pub async fn fail(&self, id: RequestId, reason: FailureReason) -> Result<bool, GatewayError> {
        for from in [RequestState::Collecting, RequestState::Pending] {
            match self
                .ledger
                .transition_with_reason(id, from, RequestState::Failed, Some(reason))
            {
                Ok(request) => {
                    warn!(request_id = %id, reason = %reason, "request failed");
                    refund_escrow(self.treasury.as_ref(), &request).await;
                    return Ok(true);
                }
                Err(LedgerError::StaleTransition { actual, .. }) if !actual.is_terminal() => continue,
                Err(LedgerError::StaleTransition { .. }) => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConsensusMethod, DataSource, NodeId, OracleValue, RequestPayload};
    use crate::time::ManualClock;
    use crate::treasury::{InMemoryTreasury, TransferKind};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyDispatcher {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyDispatcher {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CallbackDispatcher for FlakyDispatcher {
        async fn dispatch(&self, _delivery: &Delivery) -> Result<(), CallbackError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            // give concurrent deliver calls a chance to interleave
            tokio::task::yield_now().await;
            if call < self.failures {
                Err(CallbackError::Transport("relay down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    struct Fixture {
        ledger: Arc<RequestLedger>,
        treasury: Arc<InMemoryTreasury>,
        dispatcher: Arc<FlakyDispatcher>,
        gateway: Arc<FulfillmentGateway>,
    }

    fn fixture(failures: usize, max_attempts: u32) -> Fixture {
        let clock = Arc::new(ManualClock::new(t0()));
        let treasury = Arc::new(InMemoryTreasury::new());
        let ledger = Arc::new(RequestLedger::new(1, clock, treasury.clone()));
        let dispatcher = Arc::new(FlakyDispatcher::new(failures));
        let gateway = Arc::new(FulfillmentGateway::new(
            ledger.clone(),
            dispatcher.clone(),
            treasury.clone(),
            RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2)),
            Duration::from_secs(1),
            30,
        ));
        Fixture {
            ledger,
            treasury,
            dispatcher,
            gateway,
        }
    }

    fn collecting_request(ledger: &RequestLedger, fee: Amount) -> RequestId {
        let id = ledger
            .submit(
                RequestPayload::new(DataSource::Inline {
                    body: serde_json::json!(1),
                }),
                "contract",
                "on_value",
                fee,
                t0() + chrono::Duration::seconds(60),
            )
            .unwrap();
        ledger
            .transition(id, RequestState::Pending, RequestState::Collecting)
            .unwrap();
        id
    }

    fn result(id: RequestId, nodes: &[&str]) -> ConsensusResult {
        ConsensusResult {
            request_id: id,
            value: OracleValue::from(101),
            contributing_nodes: nodes
                .iter()
                .map(|node| NodeId::from(*node))
                .collect::<BTreeSet<_>>(),
            method: ConsensusMethod::Median,
            responders: nodes.len(),
            decided_at: t0(),
        }
    }

    #[tokio::test]
    async fn test_delivery_pays_nodes_and_refunds_remainder() {
        let f = fixture(0, 3);
        let id = collecting_request(&f.ledger, 100);

        let outcome = f.gateway.deliver(&result(id, &["a", "b", "c"])).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });
        assert_eq!(f.ledger.get(id).unwrap().state, RequestState::Fulfilled);

        assert_eq!(f.treasury.balance("a"), 30);
        assert_eq!(f.treasury.balance("b"), 30);
        assert_eq!(f.treasury.balance("c"), 30);
        assert_eq!(f.treasury.balance("contract"), 10);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_invoke_callback_once() {
        let f = fixture(0, 3);
        let id = collecting_request(&f.ledger, 100);
        let consensus = result(id, &["a"]);

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let gateway = f.gateway.clone();
                let consensus = consensus.clone();
                tokio::spawn(async move { gateway.deliver(&consensus).await.unwrap() })
            })
            .collect();

        let mut delivered = 0;
        for handle in attempts {
            match handle.await.unwrap() {
                DeliveryOutcome::Delivered { .. } => delivered += 1,
                DeliveryOutcome::AlreadyHandled => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(delivered, 1);
        assert_eq!(f.dispatcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.treasury.transfers_for(id).len(), 2);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let f = fixture(2, 3);
        let id = collecting_request(&f.ledger, 100);

        let outcome = f.gateway.deliver(&result(id, &["a"])).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
    }

    #[tokio::test]
    async fn test_exhausted_delivery_fails_and_refunds() {
        let f = fixture(usize::MAX, 3);
        let id = collecting_request(&f.ledger, 100);

        let outcome = f.gateway.deliver(&result(id, &["a", "b"])).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 3, .. }));

        let request = f.ledger.get(id).unwrap();
        assert_eq!(request.state, RequestState::Failed);
        assert_eq!(request.failure_reason, Some(FailureReason::DeliveryFailed));

        let transfers = f.treasury.transfers_for(id);
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].kind, TransferKind::Refund);
        assert_eq!(f.treasury.balance("contract"), 100);
        assert_eq!(f.treasury.balance("a"), 0);
    }

    struct RejectingDispatcher;

    #[async_trait]
    impl CallbackDispatcher for RejectingDispatcher {
        async fn dispatch(&self, _delivery: &Delivery) -> Result<(), CallbackError> {
            Err(CallbackError::Rejected("HTTP 400".into()))
        }
    }

    #[tokio::test]
    async fn test_rejected_callback_is_not_retried() {
        let f = fixture(0, 3);
        let gateway = FulfillmentGateway::new(
            f.ledger.clone(),
            Arc::new(RejectingDispatcher),
            f.treasury.clone(),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
            Duration::from_secs(1),
            30,
        );
        let id = collecting_request(&f.ledger, 40);

        let outcome = gateway.deliver(&result(id, &["a"])).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 1, .. }));
        assert_eq!(f.ledger.get(id).unwrap().state, RequestState::Failed);
        assert_eq!(f.treasury.balance("contract"), 40);
    }

    #[tokio::test]
    async fn test_fail_refunds_and_is_idempotent() {
        let f = fixture(0, 3);
        let id = collecting_request(&f.ledger, 50);

        assert!(f.gateway.fail(id, FailureReason::NoMajority).await.unwrap());
        assert!(!f.gateway.fail(id, FailureReason::NoMajority).await.unwrap());

        assert_eq!(f.ledger.get(id).unwrap().failure_reason, Some(FailureReason::NoMajority));
        assert_eq!(f.treasury.balance("contract"), 50);
        assert_eq!(f.treasury.transfers_for(id).len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_after_expiry_is_a_no_op() {
        let f = fixture(0, 3);
        let id = collecting_request(&f.ledger, 50);
        f.ledger
            .transition(id, RequestState::Collecting, RequestState::Expired)
            .unwrap();

        let outcome = f.gateway.deliver(&result(id, &["a"])).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::AlreadyHandled);
        assert_eq!(f.dispatcher.calls.load(Ordering::SeqCst), 0);
    }
}
