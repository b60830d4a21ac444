//! Admin approval queue over pending purchases, deposits, withdrawals,
//! installment payments and credit requests.
//!
//! The pending list is cached in process. The cache entry is tagged with the
//! `pending_generation` counter of the system state row, which every
//! operation that changes the pending set bumps in its own atomic unit, so a
//! stale entry is detected even when another process did the change.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::{debug, info};

use crate::capital::Settlement;
use crate::credit::Approval;
use crate::error::{LedgerError, LedgerResult};
use crate::gateway::SettlementOutcome;
use crate::ledger::{Ledger, Session};
use crate::model::{Credit, CreditStatus, Transaction, TransactionType};
use crate::store;
use crate::types::{Amount, CreditId, MemberId, Timestamp, TransactionId};

/// Kinds of items an administrator decides on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalItemType {
    QuotaPurchase,
    Deposit,
    Withdrawal,
    InstallmentPayment,
    CreditRequest,
}

impl ApprovalItemType {
    fn for_transaction(tx_type: TransactionType) -> Option<Self> {
        match tx_type {
            TransactionType::QuotaPurchase => Some(ApprovalItemType::QuotaPurchase),
            TransactionType::Deposit => Some(ApprovalItemType::Deposit),
            TransactionType::Withdrawal => Some(ApprovalItemType::Withdrawal),
            TransactionType::CreditRepayment => Some(ApprovalItemType::InstallmentPayment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approve,
    Reject,
}

/// One entry of the admin queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingItem {
    pub item_id: String,
    pub item_type: ApprovalItemType,
    pub member_id: MemberId,
    pub amount: Amount,
    pub created_at: Timestamp,
    pub gateway_reference: Option<String>,
}

impl PendingItem {
    fn from_transaction(tx: Transaction) -> Option<Self> {
        let item_type = ApprovalItemType::for_transaction(tx.transaction_type)?;
        Some(Self {
            item_id: tx.id.to_string(),
            item_type,
            member_id: tx.member_id,
            amount: tx.amount,
            created_at: tx.created_at,
            gateway_reference: tx.gateway_reference,
        })
    }

    fn from_credit(credit: Credit) -> Self {
        Self {
            item_id: credit.id.to_string(),
            item_type: ApprovalItemType::CreditRequest,
            member_id: credit.borrower_id,
            amount: credit.principal,
            created_at: credit.requested_at,
            gateway_reference: None,
        }
    }
}

/// What a decision did
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    CreditApproved(Box<Approval>),
    CreditRejected(Credit),
    Settled(Settlement),
}

/// Read-through cache of the pending queue keyed by generation
#[derive(Debug, Default)]
pub struct PendingQueueCache {
    entry: RwLock<Option<(i64, Vec<PendingItem>)>>,
}

impl PendingQueueCache {
    /// Cached items if they were built at `generation`
    pub fn get(&self, generation: i64) -> Option<Vec<PendingItem>> {
        let entry = self.entry.read().ok()?;
        match entry.as_ref() {
            Some((cached, items)) if *cached == generation => Some(items.clone()),
            _ => None,
        }
    }

    pub fn put(&self, generation: i64, items: Vec<PendingItem>) {
        if let Ok(mut entry) = self.entry.write() {
            *entry = Some((generation, items));
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut entry) = self.entry.write() {
            *entry = None;
        }
    }
}

fn load_pending(conn: &rusqlite::Connection) -> LedgerResult<Vec<PendingItem>> {
    let mut items: Vec<PendingItem> = store::pending_transactions(conn)?
        .into_iter()
        .filter_map(PendingItem::from_transaction)
        .collect();
    items.extend(
        store::credits_with_status(conn, CreditStatus::Pending)?
            .into_iter()
            .map(PendingItem::from_credit),
    );
    // stable: transactions keep ledger order among equal timestamps
    items.sort_by_key(|item| item.created_at);
    Ok(items)
}

impl<'a> Session<'a> {
    /// Apply an admin decision to one pending item
    pub fn decide(
        &mut self,
        admin: &MemberId,
        item_id: &str,
        item_type: ApprovalItemType,
        decision: Decision,
    ) -> LedgerResult<DecisionOutcome> {
        self.require_admin(admin)?;

        if item_type == ApprovalItemType::CreditRequest {
            let credit_id = CreditId::new(item_id);
            return match decision {
                Decision::Approve => {
                    let approval = self.approve_credit(admin, &credit_id)?;
                    Ok(DecisionOutcome::CreditApproved(Box::new(approval)))
                }
                Decision::Reject => {
                    let credit = self.reject_credit(admin, &credit_id)?;
                    Ok(DecisionOutcome::CreditRejected(credit))
                }
            };
        }

        let tx_id = TransactionId::new(item_id);
        let tx = store::get_transaction(self.conn(), &tx_id)?;
        if ApprovalItemType::for_transaction(tx.transaction_type) != Some(item_type) {
            return Err(LedgerError::Validation(format!(
                "Transaction {} is a {}, not {:?}",
                tx.id, tx.transaction_type, item_type
            )));
        }
        if !tx.is_pending() {
            return Err(LedgerError::AlreadyDecided(format!(
                "Transaction {} is {}",
                tx.id, tx.status
            )));
        }

        let outcome = match decision {
            Decision::Approve => SettlementOutcome::Completed,
            Decision::Reject => SettlementOutcome::Cancelled,
        };
        info!("Admin {} decided {:?} on {:?} {}", admin, decision, item_type, item_id);
        Ok(DecisionOutcome::Settled(self.settle_pending(&tx_id, outcome)?))
    }
}

impl Ledger {
    /// Everything awaiting a decision, oldest first
    pub fn list_pending(&self) -> LedgerResult<Vec<PendingItem>> {
        let generation = self.read(store::pending_generation)?;
        if let Some(items) = self.pending_cache.get(generation) {
            debug!("Pending queue served from cache (generation {})", generation);
            return Ok(items);
        }

        let (generation, items) =
            self.read(|conn| Ok((store::pending_generation(conn)?, load_pending(conn)?)))?;
        self.pending_cache.put(generation, items.clone());
        debug!("Pending queue rebuilt: {} items (generation {})", items.len(), generation);
        Ok(items)
    }

    pub fn decide(
        &self,
        admin: &MemberId,
        item_id: &str,
        item_type: ApprovalItemType,
        decision: Decision,
    ) -> LedgerResult<DecisionOutcome> {
        let outcome = self.atomically(|s| s.decide(admin, item_id, item_type, decision))?;
        self.pending_cache.invalidate();
        Ok(outcome)
    }
}
