//! Escrow settlement seam
//!
//! Moving tokens is the ledger's business; the coordinator only decides who
//! gets paid. [`Treasury`] is the pluggable transfer capability, and the
//! settlement helpers never let a transfer failure undo a state change.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{error, info};

use crate::error::TreasuryError;
use crate::models::{Amount, NodeId, Request, RequestId};

#[async_trait]
pub trait Treasury: Send + Sync {
    /// Pay a node its share of the escrowed fee.
    async fn pay(&self, request_id: RequestId, node: &NodeId, amount: Amount)
        -> Result<(), TreasuryError>;

    /// Return escrowed fee to the requester.
    async fn refund(
        &self,
        request_id: RequestId,
        requester: &str,
        amount: Amount,
    ) -> Result<(), TreasuryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Payout,
    Refund,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub request_id: RequestId,
    pub kind: TransferKind,
    pub account: String,
    pub amount: Amount,
}

/// Balance-keeping treasury used by the server and in tests
#[derive(Debug, Default)]
pub struct InMemoryTreasury {
    balances: Mutex<HashMap<String, Amount>>,
    transfers: Mutex<Vec<Transfer>>,
}

impl InMemoryTreasury {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, account: &str) -> Amount {
        self.balances.lock().get(account).copied().unwrap_or(0)
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.transfers.lock().clone()
    }

    pub fn transfers_for(&self, request_id: RequestId) -> Vec<Transfer> {
        self.transfers
            .lock()
            .iter()
            .filter(|transfer| transfer.request_id == request_id)
            .cloned()
            .collect()
    }

    fn credit(&self, request_id: RequestId, kind: TransferKind, account: &str, amount: Amount) {
        {
            let mut balances = self.balances.lock();
            let balance = balances.entry(account.to_string()).or_insert(0);
            *balance = balance.saturating_add(amount);
        }
        self.transfers.lock().push(Transfer {
            request_id,
            kind,
            account: account.to_string(),
            amount,
        });
    }
}

#[async_trait]
impl Treasury for InMemoryTreasury {
    async fn pay(
        &self,
        request_id: RequestId,
        node: &NodeId,
        amount: Amount,
    ) -> Result<(), TreasuryError> {
        self.credit(request_id, TransferKind::Payout, node.as_str(), amount);
        Ok(())
    }

    async fn refund(
        &self,
        request_id: RequestId,
        requester: &str,
        amount: Amount,
    ) -> Result<(), TreasuryError> {
        self.credit(request_id, TransferKind::Refund, requester, amount);
        Ok(())
    }
}

/// Split of an escrowed fee between contributing nodes and the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeSplit {
    pub per_node: Amount,
    pub remainder: Amount,
}

/// Each contributing node receives `min(share, fee / n)`; whatever is left
/// goes back to the requester.
pub fn split_fee(fee: Amount, share: Amount, nodes: usize) -> FeeSplit {
    if nodes == 0 {
        return FeeSplit {
            per_node: 0,
            remainder: fee,
        };
    }

    let per_node = share.min(fee / nodes as Amount);
    let paid = per_node.saturating_mul(nodes as Amount);
    FeeSplit {
        per_node,
        remainder: fee.saturating_sub(paid),
    }
}

/// Pay contributing nodes after a successful delivery.
pub async fn settle_fulfilled(
    treasury: &dyn Treasury,
    request: &Request,
    nodes: &BTreeSet<NodeId>,
    share: Amount,
) {
    let split = split_fee(request.fee_reserved, share, nodes.len());

    if split.per_node > 0 {
        for node in nodes {
            if let Err(err) = treasury.pay(request.id, node, split.per_node).await {
                error!(request_id = %request.id, node_id = %node, error = %err, "fee payout failed");
            }
        }
    }

    if split.remainder > 0 {
        if let Err(err) = treasury
            .refund(request.id, &request.requester, split.remainder)
            .await
        {
            error!(request_id = %request.id, error = %err, "fee remainder refund failed");
        }
    }

    info!(
        request_id = %request.id,
        nodes = nodes.len(),
        per_node = split.per_node,
        remainder = split.remainder,
        "fee settled"
    );
}

/// Return the full escrowed fee after `Expired` or `Failed`.
pub async fn refund_escrow(treasury: &dyn Treasury, request: &Request) {
    if request.fee_reserved == 0 {
        return;
    }

    match treasury
        .refund(request.id, &request.requester, request.fee_reserved)
        .await
    {
        Ok(()) => info!(
            request_id = %request.id,
            requester = %request.requester,
            amount = request.fee_reserved,
            "escrow refunded"
        ),
        Err(err) => error!(request_id = %request.id, error = %err, "escrow refund failed"),
    }
}
