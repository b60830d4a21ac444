//! Capital ledger: balances, transactions and the system state row.
//!
//! All balance changes in the engine go through [`Session::credit`],
//! [`Session::debit`] or [`Session::settle_pending`], each of which writes
//! exactly one transaction row in the same atomic unit as the balance change.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::fees::{compute_charge, withdrawal_fee, Channel};
use crate::gateway::{NotificationEvent, SettlementOutcome};
use crate::ledger::{Ledger, Session};
use crate::model::{Member, SystemState, Transaction, TransactionDetails, TransactionStatus};
use crate::quota::revalue_member;
use crate::store;
use crate::types::{Amount, MemberId, TransactionId};

/// Result of settling a pending transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Completed(Transaction),
    Cancelled(Transaction),
    /// The transaction had already been settled; nothing changed
    AlreadySettled(Transaction),
}

impl Settlement {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Settlement::Completed(tx)
            | Settlement::Cancelled(tx)
            | Settlement::AlreadySettled(tx) => tx,
        }
    }
}

/// Balance conservation check for one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceAudit {
    pub member_id: MemberId,
    pub balance: Amount,
    pub completed_effects: Amount,
    pub drift: Amount,
}

impl BalanceAudit {
    pub fn is_consistent(&self) -> bool {
        self.drift.is_zero() && !self.balance.is_negative()
    }
}

impl<'a> Session<'a> {
    /// Add a member with a zero balance
    pub fn register_member(&mut self, name: &str, is_admin: bool) -> LedgerResult<Member> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::Validation("Member name cannot be empty".to_string()));
        }

        let member = Member {
            id: MemberId::generate(),
            name: name.to_string(),
            balance: Amount::zero(),
            is_admin,
            quota_count: 0,
            quota_value: Amount::zero(),
            created_at: self.now(),
        };
        store::insert_member(self.conn(), &member)?;

        info!("Registered member {} ({})", member.id, member.name);
        Ok(member)
    }

    fn append(
        &mut self,
        member_id: &MemberId,
        amount: Amount,
        effect: Amount,
        status: TransactionStatus,
        details: TransactionDetails,
    ) -> LedgerResult<Transaction> {
        let settled_at = (status != TransactionStatus::Pending).then(|| self.now());
        let mut tx = Transaction {
            seq: 0,
            id: TransactionId::generate(),
            member_id: member_id.clone(),
            transaction_type: details.transaction_type(),
            amount,
            effect,
            status,
            details,
            gateway_reference: None,
            created_at: self.now(),
            settled_at,
        };
        tx.seq = store::insert_transaction(self.conn(), &tx)?;
        Ok(tx)
    }

    /// Lock the member row and move its balance by `effect`
    fn apply_effect(&mut self, member_id: &MemberId, effect: Amount) -> LedgerResult<Amount> {
        store::lock_member(self.conn(), member_id)?;
        let member = store::get_member(self.conn(), member_id)?;

        let balance = member.balance + effect;
        if balance.is_negative() {
            return Err(LedgerError::InsufficientBalance(format!(
                "Member {} has {} but needs {}",
                member_id, member.balance, -effect
            )));
        }
        store::set_balance(self.conn(), member_id, balance)?;
        Ok(balance)
    }

    /// Increase a member's balance, recording a completed transaction
    pub fn credit(
        &mut self,
        member_id: &MemberId,
        amount: Amount,
        details: TransactionDetails,
    ) -> LedgerResult<Transaction> {
        if amount.is_negative() {
            return Err(LedgerError::Validation(format!(
                "Credit amount cannot be negative: {}",
                amount
            )));
        }
        let balance = self.apply_effect(member_id, amount)?;
        let tx = self.append(member_id, amount, amount, TransactionStatus::Completed, details)?;

        debug!(
            "Credited {} to {} ({}), balance {}",
            amount, member_id, tx.transaction_type, balance
        );
        Ok(tx)
    }

    /// Decrease a member's balance, recording a completed transaction.
    /// Fails with `InsufficientBalance` if the debit would eat into money
    /// already promised to pending withdrawals.
    pub fn debit(
        &mut self,
        member_id: &MemberId,
        amount: Amount,
        details: TransactionDetails,
    ) -> LedgerResult<Transaction> {
        if amount.is_negative() {
            return Err(LedgerError::Validation(format!(
                "Debit amount cannot be negative: {}",
                amount
            )));
        }
        store::lock_member(self.conn(), member_id)?;
        let available = self.available_balance(member_id)?;
        if available < amount {
            return Err(LedgerError::InsufficientBalance(format!(
                "Member {} has {} available but needs {}",
                member_id, available, amount
            )));
        }
        let balance = self.apply_effect(member_id, -amount)?;
        let tx = self.append(member_id, amount, -amount, TransactionStatus::Completed, details)?;

        debug!(
            "Debited {} from {} ({}), balance {}",
            amount, member_id, tx.transaction_type, balance
        );
        Ok(tx)
    }

    /// Record a transaction awaiting external confirmation; no balance moves yet
    pub fn record_pending(
        &mut self,
        member_id: &MemberId,
        amount: Amount,
        details: TransactionDetails,
    ) -> LedgerResult<Transaction> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation(format!(
                "Pending amount must be positive: {}",
                amount
            )));
        }
        // Make sure the member exists before anything points at it
        store::get_member(self.conn(), member_id)?;

        let intended = match &details {
            TransactionDetails::Deposit { charge } => charge.base,
            TransactionDetails::Withdrawal { requested, .. } => -*requested,
            _ => Amount::zero(),
        };
        let tx = self.append(member_id, amount, intended, TransactionStatus::Pending, details)?;
        self.invalidate_pending_queue();

        info!("Recorded pending {} {} for {} ({})", tx.transaction_type, amount, member_id, tx.id);
        Ok(tx)
    }

    /// Resolve a pending transaction. Settling an already-settled transaction
    /// is a no-op so duplicate webhook deliveries are harmless.
    pub fn settle_pending(
        &mut self,
        transaction_id: &TransactionId,
        outcome: SettlementOutcome,
    ) -> LedgerResult<Settlement> {
        let mut tx = store::get_transaction(self.conn(), transaction_id)?;
        if !tx.is_pending() {
            debug!("Transaction {} already settled as {}", tx.id, tx.status);
            return Ok(Settlement::AlreadySettled(tx));
        }

        store::lock_member(self.conn(), &tx.member_id)?;
        tx.settled_at = Some(self.now());

        if outcome == SettlementOutcome::Cancelled {
            tx.status = TransactionStatus::Cancelled;
            tx.effect = Amount::zero();
            self.store_settlement(&tx)?;

            info!("Cancelled pending {} {}", tx.transaction_type, tx.id);
            return Ok(Settlement::Cancelled(tx));
        }

        let member_id = tx.member_id.clone();
        let effect = match &mut tx.details {
            TransactionDetails::Deposit { charge } => charge.base,
            TransactionDetails::Withdrawal { requested, fee, .. } => {
                self.add_to_profit_pool(*fee)?;
                -*requested
            }
            TransactionDetails::QuotaPurchase { quantity, unit_price, quota_ids, .. } => {
                let quotas = self.create_quotas(&member_id, *quantity, *unit_price)?;
                *quota_ids = quotas.into_iter().map(|q| q.id).collect();
                Amount::zero()
            }
            TransactionDetails::CreditRepayment { credit_id, charge, applied, refunded } => {
                let credit_id = credit_id.clone();
                let (paid, excess) = self.apply_external_repayment(&credit_id, charge.base)?;
                *applied = paid;
                *refunded = excess;
                excess
            }
            other => {
                return Err(LedgerError::Internal(format!(
                    "{} transactions are never pending",
                    other.transaction_type()
                )));
            }
        };

        self.apply_effect(&member_id, effect)?;
        tx.status = TransactionStatus::Completed;
        tx.effect = effect;
        self.store_settlement(&tx)?;

        info!("Completed pending {} {} (effect {})", tx.transaction_type, tx.id, effect);
        Ok(Settlement::Completed(tx))
    }

    fn store_settlement(&mut self, tx: &Transaction) -> LedgerResult<()> {
        if !store::settle_transaction(self.conn(), tx)? {
            return Err(LedgerError::AlreadySettled(tx.id.to_string()));
        }
        self.invalidate_pending_queue();
        self.notify(
            &tx.member_id,
            NotificationEvent::TransactionSettled,
            serde_json::json!({
                "transaction_id": tx.id,
                "type": tx.transaction_type,
                "status": tx.status,
                "amount": tx.amount,
            }),
        );
        Ok(())
    }

    /// Remember the gateway's reference for a pending charge
    pub fn attach_gateway_reference(
        &mut self,
        transaction_id: &TransactionId,
        reference: &str,
    ) -> LedgerResult<()> {
        let tx = store::get_transaction(self.conn(), transaction_id)?;
        if !tx.is_pending() {
            warn!("Ignoring gateway reference for settled transaction {}", tx.id);
            return Ok(());
        }
        store::set_gateway_reference(self.conn(), transaction_id, reference)?;
        self.invalidate_pending_queue();
        Ok(())
    }

    /// Move surplus into the profit pool
    pub fn add_to_profit_pool(&mut self, amount: Amount) -> LedgerResult<SystemState> {
        let mut state = store::lock_system_state(self.conn())?;
        if amount.is_zero() {
            return Ok(state);
        }
        if amount.is_negative() {
            return Err(LedgerError::Validation(format!(
                "Profit pool inflow cannot be negative: {}",
                amount
            )));
        }
        state.profit_pool += amount;
        store::update_system_state(self.conn(), &state)?;

        debug!("Profit pool +{} = {}", amount, state.profit_pool);
        Ok(state)
    }

    /// Record a gateway-funded deposit of `amount` net to the member
    pub fn deposit(
        &mut self,
        member_id: &MemberId,
        amount: Amount,
        channel: Channel,
    ) -> LedgerResult<Transaction> {
        if !channel.is_external() {
            return Err(LedgerError::Validation("Deposits need an external channel".to_string()));
        }
        if !amount.is_positive() {
            return Err(LedgerError::Validation(format!("Deposit must be positive: {}", amount)));
        }
        let charge = compute_charge(amount, channel, &self.config().fees)?;
        let total = charge.total;
        self.record_pending(member_id, total, TransactionDetails::Deposit { charge })
    }

    /// Balance not already promised to pending withdrawals
    pub fn available_balance(&self, member_id: &MemberId) -> LedgerResult<Amount> {
        let member = store::get_member(self.conn(), member_id)?;
        let reserved: Amount = store::pending_transactions(self.conn())?
            .into_iter()
            .filter(|tx| &tx.member_id == member_id)
            .filter_map(|tx| match tx.details {
                TransactionDetails::Withdrawal { requested, .. } => Some(requested),
                _ => None,
            })
            .sum();
        Ok(member.balance - reserved)
    }

    /// Ask to pay out part of the balance to an external account. The
    /// withdrawal stays pending until an administrator settles it.
    pub fn request_withdrawal(
        &mut self,
        member_id: &MemberId,
        amount: Amount,
        destination: &str,
    ) -> LedgerResult<Transaction> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation(format!("Withdrawal must be positive: {}", amount)));
        }
        if destination.trim().is_empty() {
            return Err(LedgerError::Validation(
                "Withdrawal destination cannot be empty".to_string(),
            ));
        }

        store::lock_member(self.conn(), member_id)?;
        let available = self.available_balance(member_id)?;
        if available < amount {
            return Err(LedgerError::InsufficientBalance(format!(
                "Member {} can withdraw at most {}",
                member_id, available
            )));
        }

        let quota_value = self.valuate_holdings(member_id)?;
        let policy = &self.config().withdrawal;
        let fee = withdrawal_fee(amount, quota_value, policy.fee_rate, policy.fee_floor)?;
        let details = TransactionDetails::Withdrawal {
            requested: amount,
            fee,
            net: amount - fee,
            destination: destination.to_string(),
            credit_id: None,
        };
        let tx = self.record_pending(member_id, amount, details)?;

        self.notify(
            member_id,
            NotificationEvent::WithdrawalRequested,
            serde_json::json!({ "transaction_id": tx.id, "amount": amount, "fee": fee }),
        );
        Ok(tx)
    }

    /// Compare a member's balance with the sum of their completed transactions
    pub fn audit_member(&self, member_id: &MemberId) -> LedgerResult<BalanceAudit> {
        audit(self.conn(), member_id)
    }
}

fn audit(conn: &rusqlite::Connection, member_id: &MemberId) -> LedgerResult<BalanceAudit> {
    let member = store::get_member(conn, member_id)?;
    let completed_effects = store::completed_effect_sum(conn, member_id)?;
    Ok(BalanceAudit {
        member_id: member_id.clone(),
        balance: member.balance,
        completed_effects,
        drift: member.balance - completed_effects,
    })
}

impl Ledger {
    pub fn register_member(&self, name: &str, is_admin: bool) -> LedgerResult<Member> {
        self.atomically(|s| s.register_member(name, is_admin))
    }

    /// A member with its quota aggregates valued at the current time
    pub fn member(&self, member_id: &MemberId) -> LedgerResult<Member> {
        let now = self.now();
        let policy = self.config().quota.valuation;
        self.read(|conn| revalue_member(conn, &policy, store::get_member(conn, member_id)?, now))
    }

    pub fn members(&self) -> LedgerResult<Vec<Member>> {
        let now = self.now();
        let policy = self.config().quota.valuation;
        self.read(|conn| {
            store::list_members(conn)?
                .into_iter()
                .map(|member| revalue_member(conn, &policy, member, now))
                .collect()
        })
    }

    /// A member's transactions in ledger order
    pub fn transactions_for(&self, member_id: &MemberId) -> LedgerResult<Vec<Transaction>> {
        self.read(|conn| store::transactions_for_member(conn, member_id))
    }

    pub fn transaction(&self, transaction_id: &TransactionId) -> LedgerResult<Transaction> {
        self.read(|conn| store::get_transaction(conn, transaction_id))
    }

    pub fn system_state(&self) -> LedgerResult<SystemState> {
        self.read(store::get_system_state)
    }

    pub fn audit_member(&self, member_id: &MemberId) -> LedgerResult<BalanceAudit> {
        self.read(|conn| audit(conn, member_id))
    }

    /// Audit every member; returns only the inconsistent ones
    pub fn audit_all(&self) -> LedgerResult<Vec<BalanceAudit>> {
        self.read(|conn| {
            let mut drifted = Vec::new();
            for member in store::list_members(conn)? {
                let audit = audit(conn, &member.id)?;
                if !audit.is_consistent() {
                    warn!("Balance drift for {}: {}", audit.member_id, audit.drift);
                    drifted.push(audit);
                }
            }
            Ok(drifted)
        })
    }

    /// Gateway callback: resolve a pending transaction
    pub fn settle_pending(
        &self,
        transaction_id: &TransactionId,
        outcome: SettlementOutcome,
    ) -> LedgerResult<Settlement> {
        self.atomically(|s| s.settle_pending(transaction_id, outcome))
    }

    /// Admin-issued cancellation of a pending transaction; never moves balance
    pub fn cancel_pending(
        &self,
        admin: &MemberId,
        transaction_id: &TransactionId,
    ) -> LedgerResult<Settlement> {
        self.atomically(|s| {
            s.require_admin(admin)?;
            s.settle_pending(transaction_id, SettlementOutcome::Cancelled)
        })
    }

    pub fn attach_gateway_reference(
        &self,
        transaction_id: &TransactionId,
        reference: &str,
    ) -> LedgerResult<()> {
        self.atomically(|s| s.attach_gateway_reference(transaction_id, reference))
    }

    pub fn deposit(
        &self,
        member_id: &MemberId,
        amount: Amount,
        channel: Channel,
    ) -> LedgerResult<Transaction> {
        self.atomically(|s| s.deposit(member_id, amount, channel))
    }

    pub fn request_withdrawal(
        &self,
        member_id: &MemberId,
        amount: Amount,
        destination: &str,
    ) -> LedgerResult<Transaction> {
        self.atomically(|s| s.request_withdrawal(member_id, amount, destination))
    }

    /// Debit a maintenance fee from a member into the profit pool
    pub fn charge_maintenance_fee(
        &self,
        admin: &MemberId,
        member_id: &MemberId,
        amount: Amount,
        memo: &str,
    ) -> LedgerResult<Transaction> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation(format!(
                "Maintenance fee must be positive: {}",
                amount
            )));
        }
        self.atomically(|s| {
            s.require_admin(admin)?;
            let details = TransactionDetails::MaintenanceFee { memo: memo.to_string() };
            let tx = s.debit(member_id, amount, details)?;
            s.add_to_profit_pool(amount)?;
            Ok(tx)
        })
    }

    /// Book surplus earned outside the engine into the profit pool
    pub fn fund_profit_pool(&self, admin: &MemberId, amount: Amount) -> LedgerResult<SystemState> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation(format!(
                "Funding amount must be positive: {}",
                amount
            )));
        }
        self.atomically(|s| {
            s.require_admin(admin)?;
            s.add_to_profit_pool(amount)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalItemType, Decision};
    use crate::config::LedgerConfig;
    use crate::fees::{Channel, ChargeBreakdown};

    fn ledger() -> Ledger {
        Ledger::open_in_memory(LedgerConfig::default()).unwrap()
    }

    fn deposit(net: i64) -> TransactionDetails {
        TransactionDetails::Deposit {
            charge: ChargeBreakdown {
                channel: Channel::InstantTransfer,
                base: Amount::new(net),
                fee: Amount::zero(),
                total: Amount::new(net),
            },
        }
    }

    fn fee() -> TransactionDetails {
        TransactionDetails::MaintenanceFee { memo: "monthly".into() }
    }

    #[test]
    fn test_credit_and_debit_pair_with_transactions() {
        let ledger = ledger();
        let member = ledger.register_member("Ana", false).unwrap();

        ledger.atomically(|s| s.credit(&member.id, Amount::new(10_000), deposit(10_000))).unwrap();
        ledger.atomically(|s| s.debit(&member.id, Amount::new(2_500), fee())).unwrap();

        assert_eq!(ledger.member(&member.id).unwrap().balance, Amount::new(7_500));
        let txs = ledger.transactions_for(&member.id).unwrap();
        assert_eq!(txs.len(), 2);
        assert!(txs[0].seq < txs[1].seq);
        assert!(ledger.audit_member(&member.id).unwrap().is_consistent());
    }

    #[test]
    fn test_debit_rejects_overdraft() {
        let ledger = ledger();
        let member = ledger.register_member("Ana", false).unwrap();

        let err = ledger
            .atomically(|s| s.debit(&member.id, Amount::new(1), fee()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));
        assert!(ledger.transactions_for(&member.id).unwrap().is_empty());
    }

    #[test]
    fn test_settle_pending_is_idempotent() {
        let ledger = ledger();
        let member = ledger.register_member("Ana", false).unwrap();

        let pending = ledger
            .atomically(|s| s.record_pending(&member.id, Amount::new(5_000), deposit(5_000)))
            .unwrap();
        assert_eq!(ledger.member(&member.id).unwrap().balance, Amount::zero());

        let first = ledger.settle_pending(&pending.id, SettlementOutcome::Completed).unwrap();
        assert!(matches!(first, Settlement::Completed(_)));
        let second = ledger.settle_pending(&pending.id, SettlementOutcome::Completed).unwrap();
        assert!(matches!(second, Settlement::AlreadySettled(_)));
        let third = ledger.settle_pending(&pending.id, SettlementOutcome::Cancelled).unwrap();
        assert!(matches!(third, Settlement::AlreadySettled(_)));

        assert_eq!(ledger.member(&member.id).unwrap().balance, Amount::new(5_000));
        assert!(ledger.audit_member(&member.id).unwrap().is_consistent());
    }

    #[test]
    fn test_cancelled_pending_has_no_effect() {
        let ledger = ledger();
        let admin = ledger.register_member("Admin", true).unwrap();
        let member = ledger.register_member("Ana", false).unwrap();

        let pending = ledger
            .atomically(|s| s.record_pending(&member.id, Amount::new(5_000), deposit(5_000)))
            .unwrap();

        let err = ledger.cancel_pending(&member.id, &pending.id).unwrap_err();
        assert!(matches!(err, LedgerError::PermissionDenied(_)));

        let settlement = ledger.cancel_pending(&admin.id, &pending.id).unwrap();
        assert_eq!(settlement.transaction().status, TransactionStatus::Cancelled);
        assert_eq!(ledger.member(&member.id).unwrap().balance, Amount::zero());
    }

    #[test]
    fn test_withdrawal_fee_waived_when_quotas_cover_amount() {
        let ledger = ledger();
        let member = ledger.register_member("Ana", false).unwrap();
        ledger.atomically(|s| s.credit(&member.id, Amount::new(40_000), deposit(40_000))).unwrap();
        ledger.purchase_quotas(&member.id, 4, Channel::Balance).unwrap();

        let tx = ledger.request_withdrawal(&member.id, Amount::new(20_000), "bank-1").unwrap();
        match &tx.details {
            TransactionDetails::Withdrawal { fee, net, .. } => {
                assert_eq!(*fee, Amount::zero());
                assert_eq!(*net, Amount::new(20_000));
            }
            other => panic!("unexpected details {:?}", other),
        }

        // The rest of the balance is already promised
        let err = ledger.request_withdrawal(&member.id, Amount::new(1), "bank-1").unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));
    }

    #[test]
    fn test_withdrawal_fee_charged_and_pooled_on_completion() {
        let ledger = ledger();
        let member = ledger.register_member("Ana", false).unwrap();
        ledger.atomically(|s| s.credit(&member.id, Amount::new(35_000), deposit(35_000))).unwrap();
        ledger.purchase_quotas(&member.id, 3, Channel::Balance).unwrap();

        let tx = ledger.request_withdrawal(&member.id, Amount::new(20_000), "bank-1").unwrap();
        let settled = ledger.settle_pending(&tx.id, SettlementOutcome::Completed).unwrap();

        assert_eq!(settled.transaction().effect, Amount::new(-20_000));
        assert_eq!(ledger.member(&member.id).unwrap().balance, Amount::zero());
        assert_eq!(ledger.system_state().unwrap().profit_pool, Amount::new(500));
    }

    #[test]
    fn test_pending_withdrawal_holds_balance_against_debits() {
        let ledger = ledger();
        let admin = ledger.register_member("Admin", true).unwrap();
        let member = ledger.register_member("Ana", false).unwrap();
        ledger.atomically(|s| s.credit(&member.id, Amount::new(10_000), deposit(10_000))).unwrap();

        let tx = ledger.request_withdrawal(&member.id, Amount::new(10_000), "bank-1").unwrap();

        let err = ledger.purchase_quotas(&member.id, 1, Channel::Balance).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));
        let err = ledger
            .charge_maintenance_fee(&admin.id, &member.id, Amount::new(100), "monthly")
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));

        ledger
            .decide(&admin.id, tx.id.as_str(), ApprovalItemType::Withdrawal, Decision::Approve)
            .unwrap();
        assert_eq!(ledger.member(&member.id).unwrap().balance, Amount::zero());
        assert!(ledger.list_pending().unwrap().is_empty());
    }

    #[test]
    fn test_gateway_reference_refreshes_pending_queue() {
        let ledger = ledger();
        let member = ledger.register_member("Ana", false).unwrap();
        let tx = ledger.deposit(&member.id, Amount::new(5_000), Channel::Card).unwrap();

        assert!(ledger.list_pending().unwrap()[0].gateway_reference.is_none());
        ledger.attach_gateway_reference(&tx.id, "charge-42").unwrap();
        let pending = ledger.list_pending().unwrap();
        assert_eq!(pending[0].gateway_reference.as_deref(), Some("charge-42"));
    }

    #[test]
    fn test_deposit_requires_external_channel() {
        let ledger = ledger();
        let member = ledger.register_member("Ana", false).unwrap();
        let err = ledger.deposit(&member.id, Amount::new(1_000), Channel::Balance).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let tx = ledger.deposit(&member.id, Amount::new(5_000), Channel::InstantTransfer).unwrap();
        assert_eq!(tx.amount, Amount::new(5_050));
        ledger.settle_pending(&tx.id, SettlementOutcome::Completed).unwrap();
        assert_eq!(ledger.member(&member.id).unwrap().balance, Amount::new(5_000));
    }

    #[test]
    fn test_maintenance_fee_feeds_profit_pool() {
        let ledger = ledger();
        let admin = ledger.register_member("Admin", true).unwrap();
        let member = ledger.register_member("Ana", false).unwrap();
        ledger.atomically(|s| s.credit(&member.id, Amount::new(1_000), deposit(1_000))).unwrap();

        ledger.charge_maintenance_fee(&admin.id, &member.id, Amount::new(300), "monthly").unwrap();

        assert_eq!(ledger.member(&member.id).unwrap().balance, Amount::new(700));
        assert_eq!(ledger.system_state().unwrap().profit_pool, Amount::new(300));
        assert!(ledger.audit_all().unwrap().is_empty());
    }
}
