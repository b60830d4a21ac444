//! Member-facing operations.
//!
//! Balance-funded actions complete inside the ledger; gateway-funded ones
//! commit a pending transaction first and only then ask the gateway for a
//! charge. If the gateway is unreachable the transaction stays pending and
//! only the charge creation may be retried; a refused charge cancels it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::capital::Settlement;
use crate::credit::Repayment;
use crate::error::{LedgerError, LedgerResult};
use crate::fees::Channel;
use crate::gateway::{ChargeRequest, GatewayError, PaymentGateway, SettlementOutcome};
use crate::ledger::Ledger;
use crate::model::{Credit, PayoutDestination, Transaction};
use crate::quota::{Purchase, Redemption};
use crate::types::{Amount, CreditId, MemberId, QuotaId, TransactionId};

/// Descriptor handed back while the gateway collects a charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCharge {
    pub transaction_id: TransactionId,
    pub reference: String,
    pub total: Amount,
    pub channel: Channel,
}

/// Immediate result, or a charge awaiting the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    PendingCharge(PendingCharge),
}

impl<T> Outcome<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::PendingCharge(_))
    }
}

/// Entry point of the presentation layer into the engine
pub struct MemberService {
    ledger: Arc<Ledger>,
    gateway: Arc<dyn PaymentGateway>,
}

impl MemberService {
    pub fn new(ledger: Arc<Ledger>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { ledger, gateway }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Run a blocking ledger call off the async executor
    async fn blocking<T, F>(&self, f: F) -> LedgerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Ledger) -> LedgerResult<T> + Send + 'static,
    {
        let ledger = self.ledger.clone();
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|e| LedgerError::Internal(format!("Ledger task failed: {}", e)))?
    }

    /// Ask the gateway to collect a committed pending transaction
    async fn charge(&self, tx: &Transaction) -> LedgerResult<PendingCharge> {
        let channel = tx.channel().filter(Channel::is_external).ok_or_else(|| {
            LedgerError::InvalidState(format!(
                "Transaction {} is not charged through a gateway",
                tx.id
            ))
        })?;
        let request = ChargeRequest {
            member_id: tx.member_id.clone(),
            pending_transaction_id: tx.id.clone(),
            total: tx.amount,
            channel,
        };

        let receipt = match self.gateway.charge(&request).await {
            Ok(receipt) => receipt,
            Err(GatewayError::Rejected(reason)) => {
                warn!("Charge for transaction {} rejected, cancelling: {}", tx.id, reason);
                let tx_id = tx.id.clone();
                self.blocking(move |ledger| {
                    ledger.settle_pending(&tx_id, SettlementOutcome::Cancelled)
                })
                .await?;
                return Err(LedgerError::ChargeRejected(format!(
                    "{}; transaction {} is cancelled",
                    reason, tx.id
                )));
            }
            Err(e) => {
                warn!("Charge for transaction {} failed, left pending: {}", tx.id, e);
                return Err(LedgerError::GatewayUnavailable(format!(
                    "{}; transaction {} is pending",
                    e, tx.id
                )));
            }
        };

        let tx_id = tx.id.clone();
        let reference = receipt.reference.clone();
        self.blocking(move |ledger| ledger.attach_gateway_reference(&tx_id, &reference))
            .await?;

        info!(
            "Charge {} created for transaction {} ({} via {})",
            receipt.reference, tx.id, tx.amount, channel
        );
        Ok(PendingCharge {
            transaction_id: tx.id.clone(),
            reference: receipt.reference,
            total: tx.amount,
            channel,
        })
    }

    pub async fn buy_quota(
        &self,
        member: &MemberId,
        quantity: i64,
        channel: Channel,
    ) -> LedgerResult<Outcome<Purchase>> {
        let member = member.clone();
        let purchase = self
            .blocking(move |ledger| ledger.purchase_quotas(&member, quantity, channel))
            .await?;
        if purchase.transaction.is_pending() {
            return Ok(Outcome::PendingCharge(self.charge(&purchase.transaction).await?));
        }
        Ok(Outcome::Completed(purchase))
    }

    pub async fn redeem_quota(
        &self,
        member: &MemberId,
        quota: &QuotaId,
    ) -> LedgerResult<Redemption> {
        let (member, quota) = (member.clone(), quota.clone());
        self.blocking(move |ledger| ledger.redeem_quota(&member, &quota)).await
    }

    /// Redeem every free quota; returns the sum credited
    pub async fn redeem_all_quotas(&self, member: &MemberId) -> LedgerResult<Amount> {
        let member = member.clone();
        let (_, total) = self.blocking(move |ledger| ledger.redeem_all_quotas(&member)).await?;
        Ok(total)
    }

    pub async fn request_credit(
        &self,
        member: &MemberId,
        principal: Amount,
        installments: i64,
        payout: PayoutDestination,
    ) -> LedgerResult<Credit> {
        let member = member.clone();
        self.blocking(move |ledger| ledger.request_credit(&member, principal, installments, payout))
            .await
    }

    pub async fn pay_installment(
        &self,
        member: &MemberId,
        credit: &CreditId,
        amount: Amount,
        channel: Channel,
    ) -> LedgerResult<Outcome<Repayment>> {
        let (member, credit) = (member.clone(), credit.clone());
        let repayment = self
            .blocking(move |ledger| ledger.pay_installment(&credit, &member, amount, channel))
            .await?;
        self.complete_or_charge(repayment).await
    }

    pub async fn pay_full_credit(
        &self,
        member: &MemberId,
        credit: &CreditId,
        channel: Channel,
    ) -> LedgerResult<Outcome<Repayment>> {
        let (member, credit) = (member.clone(), credit.clone());
        let repayment = self
            .blocking(move |ledger| ledger.pay_full_credit(&credit, &member, channel))
            .await?;
        self.complete_or_charge(repayment).await
    }

    async fn complete_or_charge(&self, repayment: Repayment) -> LedgerResult<Outcome<Repayment>> {
        if repayment.transaction.is_pending() {
            return Ok(Outcome::PendingCharge(self.charge(&repayment.transaction).await?));
        }
        Ok(Outcome::Completed(repayment))
    }

    /// Withdrawals always wait for an administrator to pay them out
    pub async fn request_withdrawal(
        &self,
        member: &MemberId,
        amount: Amount,
        destination: &str,
    ) -> LedgerResult<Transaction> {
        let (member, destination) = (member.clone(), destination.to_string());
        self.blocking(move |ledger| ledger.request_withdrawal(&member, amount, &destination))
            .await
    }

    pub async fn deposit(
        &self,
        member: &MemberId,
        amount: Amount,
        channel: Channel,
    ) -> LedgerResult<PendingCharge> {
        let member = member.clone();
        let tx = self
            .blocking(move |ledger| ledger.deposit(&member, amount, channel))
            .await?;
        self.charge(&tx).await
    }

    /// Gateway webhook; duplicate deliveries are harmless
    pub async fn on_settled(
        &self,
        transaction: &TransactionId,
        outcome: SettlementOutcome,
    ) -> LedgerResult<Settlement> {
        let transaction = transaction.clone();
        self.blocking(move |ledger| ledger.settle_pending(&transaction, outcome))
            .await
    }

    /// Retry charge creation for a pending transaction the gateway never acknowledged
    pub async fn retry_charge(&self, transaction: &TransactionId) -> LedgerResult<PendingCharge> {
        let id = transaction.clone();
        let tx = self.blocking(move |ledger| ledger.transaction(&id)).await?;
        if !tx.is_pending() {
            return Err(LedgerError::AlreadySettled(tx.id.to_string()));
        }
        if let Some(reference) = &tx.gateway_reference {
            return Err(LedgerError::InvalidState(format!(
                "Transaction {} already has charge {}",
                tx.id, reference
            )));
        }
        self.charge(&tx).await
    }
}
