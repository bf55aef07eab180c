//! Coordinator wiring
//!
//! Joins the ledger, aggregator, gateway and node registry. Responses flow
//! verify -> aggregate -> deliver or fail; a maintenance loop expires
//! overdue requests, resolves quorum timeouts and purges settled requests
//! once their retention has passed.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::aggregator::Aggregator;
use crate::callback::CallbackDispatcher;
use crate::config::CoordinatorConfig;
use crate::error::{LedgerError, SubmitError};
use crate::gateway::{DeliveryOutcome, FulfillmentGateway};
use crate::ledger::{persist_snapshot, RequestLedger};
use crate::models::{Amount, Decision, Receipt, RequestId, RequestPayload, SignedResponse};
use crate::node::{NodeRegistry, ResponseSink, SignatureVerifier};
use crate::time::SharedClock;
use crate::treasury::Treasury;

/// Work done by one maintenance pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub expired: usize,
    pub decided: usize,
    pub purged: usize,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    clock: SharedClock,
    ledger: Arc<RequestLedger>,
    aggregator: Aggregator,
    gateway: Arc<FulfillmentGateway>,
    registry: Arc<NodeRegistry>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        clock: SharedClock,
        treasury: Arc<dyn Treasury>,
        dispatcher: Arc<dyn CallbackDispatcher>,
    ) -> Self {
        let ledger = Arc::new(RequestLedger::new(
            config.minimum_fee,
            clock.clone(),
            treasury.clone(),
        ));
        let aggregator = Aggregator::new(config.consensus_policy(), ledger.clone(), clock.clone());
        let gateway = FulfillmentGateway::new(
            ledger.clone(),
            dispatcher,
            treasury,
            config.delivery_retry(),
            config.delivery_timeout,
            config.node_fee_share,
        );

        Self {
            config,
            clock,
            ledger,
            aggregator,
            gateway: Arc::new(gateway),
            registry: Arc::new(NodeRegistry::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<RequestLedger> {
        &self.ledger
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn submit(
        &self,
        payload: RequestPayload,
        requester: impl Into<String>,
        callback: impl Into<String>,
        fee: Amount,
        deadline: DateTime<Utc>,
    ) -> Result<RequestId, LedgerError> {
        self.ledger.submit(payload, requester, callback, fee, deadline)
    }

    /// Verify, count and, if it completes the request, settle one response.
    pub async fn ingest(&self, signed: SignedResponse) -> Result<Receipt, SubmitError> {
        self.registry.verify(&signed)?;

        let intake = self.aggregator.on_response(signed.response)?;
        if let Some(decision) = intake.decision {
            // settlement outlives this future if the caller goes away
            if let Err(err) = self.spawn_settle(decision).await {
                error!(error = %err, "settlement task failed");
            }
        }
        Ok(intake.receipt)
    }

    /// Expire overdue requests, resolve quorum timeouts, then purge requests
    /// settled longer than the retention period ago.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let expired = self.ledger.expire_overdue(now).await.len();

        let decisions = self.aggregator.evaluate_timeouts(now);
        let decided = decisions.len();
        let settlements: Vec<JoinHandle<()>> = decisions
            .into_iter()
            .map(|decision| self.spawn_settle(decision))
            .collect();
        for outcome in join_all(settlements).await {
            if let Err(err) = outcome {
                error!(error = %err, "settlement task failed");
            }
        }

        let purged = match chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        {
            Some(cutoff) => {
                let ids = self.ledger.purge_terminal(cutoff);
                self.aggregator.forget(&ids);
                ids.len()
            }
            None => 0,
        };

        if expired > 0 || decided > 0 || purged > 0 {
            info!(expired, decided, purged, "maintenance pass");
        }
        TickReport {
            expired,
            decided,
            purged,
        }
    }

    /// Run `tick` every `interval` until `shutdown` flips to `true`,
    /// persisting a ledger snapshot after each pass when configured.
    pub async fn run_maintenance(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "maintenance loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(self.clock.utc_now()).await;
                    if let Err(err) = self.persist().await {
                        error!(error = %err, "failed to persist ledger snapshot");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(err) = self.persist().await {
            error!(error = %err, "failed to persist ledger snapshot on shutdown");
        }
        info!("maintenance loop stopped");
    }

    /// Write the ledger snapshot if a snapshot path is configured.
    pub async fn persist(&self) -> Result<()> {
        if let Some(path) = &self.config.ledger_snapshot {
            persist_snapshot(path, &self.ledger.snapshot()).await?;
        }
        Ok(())
    }

    fn spawn_settle(&self, decision: Decision) -> JoinHandle<()> {
        tokio::spawn(settle(self.gateway.clone(), decision))
    }
}

async fn settle(gateway: Arc<FulfillmentGateway>, decision: Decision) {
    match decision {
        Decision::Consensus(result) => match gateway.deliver(&result).await {
            Ok(DeliveryOutcome::AlreadyHandled) => {
                debug!(request_id = %result.request_id, "delivery skipped")
            }
            Ok(outcome) => debug!(request_id = %result.request_id, ?outcome, "delivery finished"),
            Err(err) => error!(request_id = %result.request_id, error = %err, "delivery error"),
        },
        Decision::Failed { request_id, reason } => {
            if let Err(err) = gateway.fail(request_id, reason).await {
                error!(request_id = %request_id, error = %err, "could not fail request");
            }
        }
    }
}

#[async_trait]
impl ResponseSink for Coordinator {
    async fn post(&self, response: SignedResponse) -> Result<Receipt, SubmitError> {
        self.ingest(response).await
    }
}
