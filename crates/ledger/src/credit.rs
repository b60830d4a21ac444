//! Mutual-aid credit state machine.
//!
//! A credit is requested against the borrower's free quotas, which are
//! pledged on request and stay frozen until the credit is paid, rejected or
//! liquidated. Collections recover principal first; anything collected
//! beyond the principal is interest and feeds the profit pool.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LedgerError, LedgerResult};
use crate::fees::{compute_charge, Channel};
use crate::gateway::NotificationEvent;
use crate::ledger::{Ledger, Session};
use crate::model::{Credit, CreditStatus, PayoutDestination, Transaction, TransactionDetails};
use crate::store;
use crate::types::{Amount, CreditId, MemberId};

/// Result of approving a credit
#[derive(Debug, Clone, PartialEq)]
pub struct Approval {
    pub credit: Credit,
    pub disbursement: Transaction,
    /// Pending withdrawal of the principal for external payouts
    pub payout_withdrawal: Option<Transaction>,
}

/// Result of a repayment; the transaction is pending for external channels
#[derive(Debug, Clone, PartialEq)]
pub struct Repayment {
    pub credit: Credit,
    pub transaction: Transaction,
}

/// How a collection was split between principal and interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub applied: Amount,
    pub interest: Amount,
}

/// Interest part of moving `amount_paid` from `before` to `after`
fn interest_share(principal: Amount, before: Amount, after: Amount) -> Amount {
    let over = |paid: Amount| (paid - principal).max(Amount::zero());
    over(after) - over(before)
}

impl<'a> Session<'a> {
    fn transition(&mut self, credit: &mut Credit, next: CreditStatus) -> LedgerResult<()> {
        if !credit.status.can_transition_to(next) {
            return Err(LedgerError::InvalidState(format!(
                "Credit {} cannot move from {} to {}",
                credit.id, credit.status, next
            )));
        }
        debug!("Credit {}: {} -> {}", credit.id, credit.status, next);
        credit.status = next;
        Ok(())
    }

    /// Lock and load a credit
    pub fn credit_for_update(&mut self, credit_id: &CreditId) -> LedgerResult<Credit> {
        store::lock_credit(self.conn(), credit_id)?;
        store::get_credit(self.conn(), credit_id)
    }

    /// Open a credit request, pledging enough free quotas to cover the principal
    pub fn request_credit(
        &mut self,
        borrower: &MemberId,
        principal: Amount,
        installments: i64,
        payout: PayoutDestination,
    ) -> LedgerResult<Credit> {
        let policy = self.config().credit.clone();
        if principal < policy.min_principal || principal > policy.max_principal {
            return Err(LedgerError::Validation(format!(
                "Principal must be between {} and {}, got {}",
                policy.min_principal, policy.max_principal, principal
            )));
        }
        if installments < policy.min_installments || installments > policy.max_installments {
            return Err(LedgerError::Validation(format!(
                "Installments must be between {} and {}, got {}",
                policy.min_installments, policy.max_installments, installments
            )));
        }
        if let PayoutDestination::External { account } = &payout {
            if account.trim().is_empty() {
                return Err(LedgerError::Validation("Payout account cannot be empty".to_string()));
            }
        }

        store::lock_member(self.conn(), borrower)?;

        let mut selected = Vec::new();
        let mut covered = Amount::zero();
        for mut quota in store::free_active_quotas(self.conn(), borrower)? {
            if covered >= principal {
                break;
            }
            covered += self.valuate(&mut quota)?;
            selected.push(quota);
        }
        if covered < principal {
            return Err(LedgerError::InsufficientCollateral(format!(
                "Free quota value {} does not cover principal {}",
                covered, principal
            )));
        }

        let credit = Credit {
            id: CreditId::generate(),
            borrower_id: borrower.clone(),
            principal,
            total_repayment: policy.interest.total_repayment(principal, installments)?,
            installments,
            installments_paid: 0,
            amount_paid: Amount::zero(),
            status: CreditStatus::Pending,
            payout,
            collateral: selected.iter().map(|q| q.id.clone()).collect(),
            requested_at: self.now(),
            decided_at: None,
            due_at: None,
            closed_at: None,
            shortfall: Amount::zero(),
        };
        store::insert_credit(self.conn(), &credit)?;

        for mut quota in selected {
            quota.pledged_to = Some(credit.id.clone());
            store::update_quota(self.conn(), &quota)?;
        }

        self.invalidate_pending_queue();
        self.notify(
            borrower,
            NotificationEvent::CreditRequested,
            serde_json::json!({
                "credit_id": credit.id,
                "principal": principal,
                "installments": installments,
            }),
        );
        info!(
            "Credit {} requested by {}: principal {}, total {}, {} quotas pledged",
            credit.id,
            borrower,
            principal,
            credit.total_repayment,
            credit.collateral.len()
        );
        Ok(credit)
    }

    /// Approve a pending credit: freeze collateral, disburse the principal
    pub fn approve_credit(
        &mut self,
        admin: &MemberId,
        credit_id: &CreditId,
    ) -> LedgerResult<Approval> {
        self.require_admin(admin)?;
        let mut credit = self.credit_for_update(credit_id)?;
        if credit.status != CreditStatus::Pending {
            return Err(LedgerError::AlreadyDecided(format!(
                "Credit {} is {}",
                credit.id, credit.status
            )));
        }

        let mut collateral_value = Amount::zero();
        for mut quota in store::pledged_quotas(self.conn(), credit_id)? {
            collateral_value += self.valuate(&mut quota)?;
        }
        if collateral_value < credit.principal {
            return Err(LedgerError::InsufficientCollateral(format!(
                "Collateral of credit {} is worth {}, principal is {}",
                credit.id, collateral_value, credit.principal
            )));
        }

        let interval = self.config().credit.installment_interval_days;
        self.transition(&mut credit, CreditStatus::Approved)?;
        credit.decided_at = Some(self.now());
        credit.due_at = Some(self.now() + Duration::days(credit.installments * interval));
        store::update_credit(self.conn(), &credit)?;

        let borrower = credit.borrower_id.clone();
        let disbursement = self.credit(
            &borrower,
            credit.principal,
            TransactionDetails::CreditDisbursement {
                credit_id: credit.id.clone(),
                payout: credit.payout.clone(),
            },
        )?;

        let payout_withdrawal = match &credit.payout {
            PayoutDestination::Balance => None,
            PayoutDestination::External { account } => Some(self.record_pending(
                &borrower,
                credit.principal,
                TransactionDetails::Withdrawal {
                    requested: credit.principal,
                    fee: Amount::zero(),
                    net: credit.principal,
                    destination: account.clone(),
                    credit_id: Some(credit.id.clone()),
                },
            )?),
        };

        self.invalidate_pending_queue();
        self.notify(
            &borrower,
            NotificationEvent::CreditApproved,
            serde_json::json!({
                "credit_id": credit.id,
                "principal": credit.principal,
                "due_at": credit.due_at,
            }),
        );
        info!("Credit {} approved by {}, due {:?}", credit.id, admin, credit.due_at);

        Ok(Approval {
            credit,
            disbursement,
            payout_withdrawal,
        })
    }

    /// Reject a pending credit and release its collateral
    pub fn reject_credit(
        &mut self,
        admin: &MemberId,
        credit_id: &CreditId,
    ) -> LedgerResult<Credit> {
        self.require_admin(admin)?;
        let mut credit = self.credit_for_update(credit_id)?;
        if credit.status != CreditStatus::Pending {
            return Err(LedgerError::AlreadyDecided(format!(
                "Credit {} is {}",
                credit.id, credit.status
            )));
        }

        self.transition(&mut credit, CreditStatus::Rejected)?;
        credit.decided_at = Some(self.now());
        credit.closed_at = Some(self.now());
        store::update_credit(self.conn(), &credit)?;
        let released = store::release_pledges(self.conn(), credit_id)?;

        self.invalidate_pending_queue();
        self.notify(
            &credit.borrower_id,
            NotificationEvent::CreditRejected,
            serde_json::json!({ "credit_id": credit.id }),
        );
        info!("Credit {} rejected by {}, {} quotas released", credit.id, admin, released);
        Ok(credit)
    }

    /// Apply a collection to an open credit. Returns the part that was
    /// actually owed; the rest is the caller's to refund.
    pub fn apply_collection(
        &mut self,
        credit: &mut Credit,
        amount: Amount,
    ) -> LedgerResult<Collection> {
        let applied = amount.min(credit.remaining()).max(Amount::zero());
        let before = credit.amount_paid;
        credit.amount_paid += applied;

        let interest = interest_share(credit.principal, before, credit.amount_paid);
        self.add_to_profit_pool(interest)?;

        let per_installment = credit.installment_amount();
        if per_installment.is_positive() {
            let covered = credit.amount_paid.minor_units() / per_installment.minor_units();
            credit.installments_paid = covered.min(credit.installments);
        }

        Ok(Collection { applied, interest })
    }

    /// Apply a member payment and move the credit to PARTIALLY_PAID or PAID
    fn apply_payment(&mut self, credit: &mut Credit, amount: Amount) -> LedgerResult<Collection> {
        let collection = self.apply_collection(credit, amount)?;

        if credit.remaining().is_zero() {
            self.transition(credit, CreditStatus::Paid)?;
            credit.closed_at = Some(self.now());
            let released = store::release_pledges(self.conn(), &credit.id)?;
            self.notify(
                &credit.borrower_id,
                NotificationEvent::CreditPaid,
                serde_json::json!({ "credit_id": credit.id, "amount_paid": credit.amount_paid }),
            );
            info!("Credit {} paid in full, {} quotas released", credit.id, released);
        } else {
            self.transition(credit, CreditStatus::PartiallyPaid)?;
            info!(
                "Credit {} paid {}, remaining {}",
                credit.id, collection.applied, credit.remaining()
            );
        }
        store::update_credit(self.conn(), credit)?;
        Ok(collection)
    }

    /// Pay towards a credit. Balance payments apply at once; external
    /// channels record a pending repayment applied on settlement.
    pub fn pay_installment(
        &mut self,
        credit_id: &CreditId,
        payer: &MemberId,
        amount: Amount,
        channel: Channel,
    ) -> LedgerResult<Repayment> {
        let mut credit = self.credit_for_update(credit_id)?;
        if &credit.borrower_id != payer {
            return Err(LedgerError::PermissionDenied(format!(
                "Credit {} does not belong to {}",
                credit_id, payer
            )));
        }
        if !credit.status.freezes_collateral() {
            return Err(LedgerError::InvalidState(format!(
                "Credit {} is {} and accepts no payments",
                credit_id, credit.status
            )));
        }
        if !amount.is_positive() || amount > credit.remaining() {
            return Err(LedgerError::Validation(format!(
                "Payment must be between 0.01 and {}, got {}",
                credit.remaining(),
                amount
            )));
        }

        let charge = compute_charge(amount, channel, &self.config().fees)?;

        if channel.is_external() {
            let total = charge.total;
            let transaction = self.record_pending(
                payer,
                total,
                TransactionDetails::CreditRepayment {
                    credit_id: credit.id.clone(),
                    charge,
                    applied: Amount::zero(),
                    refunded: Amount::zero(),
                },
            )?;
            return Ok(Repayment { credit, transaction });
        }

        let transaction = self.debit(
            payer,
            amount,
            TransactionDetails::CreditRepayment {
                credit_id: credit.id.clone(),
                charge,
                applied: amount,
                refunded: Amount::zero(),
            },
        )?;
        self.apply_payment(&mut credit, amount)?;
        Ok(Repayment { credit, transaction })
    }

    /// Pay the whole remaining balance
    pub fn pay_full(
        &mut self,
        credit_id: &CreditId,
        payer: &MemberId,
        channel: Channel,
    ) -> LedgerResult<Repayment> {
        let remaining = store::get_credit(self.conn(), credit_id)?.remaining();
        self.pay_installment(credit_id, payer, remaining, channel)
    }

    /// Apply a confirmed external repayment. Returns `(applied, refunded)`;
    /// whatever the credit no longer owes is refunded to the balance.
    pub(crate) fn apply_external_repayment(
        &mut self,
        credit_id: &CreditId,
        amount: Amount,
    ) -> LedgerResult<(Amount, Amount)> {
        let mut credit = self.credit_for_update(credit_id)?;
        if !credit.status.freezes_collateral() {
            info!("Credit {} is {}, refunding repayment of {}", credit_id, credit.status, amount);
            return Ok((Amount::zero(), amount));
        }
        let collection = self.apply_payment(&mut credit, amount)?;
        Ok((collection.applied, amount - collection.applied))
    }

    /// Flip an overdue credit to LATE; returns whether anything changed
    pub fn mark_late(&mut self, credit_id: &CreditId) -> LedgerResult<bool> {
        let mut credit = self.credit_for_update(credit_id)?;
        let overdue = credit.due_at.map(|due| self.now() > due).unwrap_or(false);
        let open = matches!(credit.status, CreditStatus::Approved | CreditStatus::PartiallyPaid);
        if !overdue || !open {
            return Ok(false);
        }

        self.transition(&mut credit, CreditStatus::Late)?;
        store::update_credit(self.conn(), &credit)?;
        self.notify(
            &credit.borrower_id,
            NotificationEvent::CreditLate,
            serde_json::json!({
                "credit_id": credit.id,
                "remaining": credit.remaining(),
                "due_at": credit.due_at,
            }),
        );
        info!("Credit {} is late, remaining {}", credit.id, credit.remaining());
        Ok(true)
    }
}

impl Ledger {
    pub fn request_credit(
        &self,
        borrower: &MemberId,
        principal: Amount,
        installments: i64,
        payout: PayoutDestination,
    ) -> LedgerResult<Credit> {
        self.atomically(|s| s.request_credit(borrower, principal, installments, payout))
    }

    pub fn approve_credit(&self, admin: &MemberId, credit_id: &CreditId) -> LedgerResult<Approval> {
        self.atomically(|s| s.approve_credit(admin, credit_id))
    }

    pub fn reject_credit(&self, admin: &MemberId, credit_id: &CreditId) -> LedgerResult<Credit> {
        self.atomically(|s| s.reject_credit(admin, credit_id))
    }

    pub fn pay_installment(
        &self,
        credit_id: &CreditId,
        payer: &MemberId,
        amount: Amount,
        channel: Channel,
    ) -> LedgerResult<Repayment> {
        self.atomically(|s| s.pay_installment(credit_id, payer, amount, channel))
    }

    pub fn pay_full_credit(
        &self,
        credit_id: &CreditId,
        payer: &MemberId,
        channel: Channel,
    ) -> LedgerResult<Repayment> {
        self.atomically(|s| s.pay_full(credit_id, payer, channel))
    }

    pub fn mark_late(&self, credit_id: &CreditId) -> LedgerResult<bool> {
        self.atomically(|s| s.mark_late(credit_id))
    }

    pub fn credit_by_id(&self, credit_id: &CreditId) -> LedgerResult<Credit> {
        self.read(|conn| store::get_credit(conn, credit_id))
    }

    pub fn credits_for(&self, borrower: &MemberId) -> LedgerResult<Vec<Credit>> {
        self.read(|conn| store::credits_for_borrower(conn, borrower))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::model::QuotaStatus;
    use crate::types::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    struct Fixture {
        ledger: Ledger,
        clock: Arc<ManualClock>,
        admin: MemberId,
        borrower: MemberId,
    }

    /// Borrower holds 4 quotas of 50.00 and 100.00 of spare balance
    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let ledger = Ledger::open_in_memory(LedgerConfig::default())
            .unwrap()
            .with_clock(clock.clone());
        let admin = ledger.register_member("Admin", true).unwrap().id;
        let borrower = ledger.register_member("Ana", false).unwrap().id;
        ledger
            .atomically(|s| {
                let funding = Amount::new(30_000);
                let charge = compute_charge(funding, Channel::Balance, &s.config().fees)?;
                s.credit(&borrower, funding, TransactionDetails::Deposit { charge })
            })
            .unwrap();
        ledger.purchase_quotas(&borrower, 4, Channel::Balance).unwrap();
        Fixture { ledger, clock, admin, borrower }
    }

    #[test]
    fn test_interest_share_recovers_principal_first() {
        let principal = Amount::new(10_000);
        let share = |before: i64, after: i64| {
            interest_share(principal, Amount::new(before), Amount::new(after))
        };
        assert_eq!(share(0, 6_000), Amount::zero());
        assert_eq!(share(6_000, 12_000), Amount::new(2_000));
        assert_eq!(share(11_000, 12_000), Amount::new(1_000));
    }

    #[test]
    fn test_request_pledges_oldest_quotas() {
        let f = fixture();
        let credit = f
            .ledger
            .request_credit(&f.borrower, Amount::new(10_000), 2, PayoutDestination::Balance)
            .unwrap();

        assert_eq!(credit.status, CreditStatus::Pending);
        assert_eq!(credit.total_repayment, Amount::new(12_000));
        assert_eq!(credit.collateral.len(), 2);

        let quotas = f.ledger.quotas_for(&f.borrower).unwrap();
        assert_eq!(quotas[0].pledged_to.as_ref(), Some(&credit.id));
        assert_eq!(quotas[1].pledged_to.as_ref(), Some(&credit.id));
        assert!(quotas[2].pledged_to.is_none());

        let err = f.ledger.redeem_quota(&f.borrower, &quotas[0].id).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
    }

    #[test]
    fn test_request_without_collateral_fails() {
        let f = fixture();
        let err = f
            .ledger
            .request_credit(&f.borrower, Amount::new(25_000), 2, PayoutDestination::Balance)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCollateral(_)));
    }

    #[test]
    fn test_request_validates_bounds() {
        let f = fixture();
        let low = f
            .ledger
            .request_credit(&f.borrower, Amount::new(100), 2, PayoutDestination::Balance)
            .unwrap_err();
        assert!(matches!(low, LedgerError::Validation(_)));

        let too_many = f
            .ledger
            .request_credit(&f.borrower, Amount::new(10_000), 13, PayoutDestination::Balance)
            .unwrap_err();
        assert!(matches!(too_many, LedgerError::Validation(_)));
    }

    #[test]
    fn test_approve_disburses_and_sets_due_date() {
        let f = fixture();
        let credit = f
            .ledger
            .request_credit(&f.borrower, Amount::new(10_000), 2, PayoutDestination::Balance)
            .unwrap();

        let non_admin = f.ledger.approve_credit(&f.borrower, &credit.id).unwrap_err();
        assert!(matches!(non_admin, LedgerError::PermissionDenied(_)));

        let approval = f.ledger.approve_credit(&f.admin, &credit.id).unwrap();
        assert_eq!(approval.credit.status, CreditStatus::Approved);
        assert_eq!(approval.credit.due_at, Some(f.ledger.now() + Duration::days(60)));
        assert_eq!(approval.disbursement.effect, Amount::new(10_000));
        assert!(approval.payout_withdrawal.is_none());
        assert_eq!(f.ledger.member(&f.borrower).unwrap().balance, Amount::new(20_000));

        let twice = f.ledger.approve_credit(&f.admin, &credit.id).unwrap_err();
        assert!(matches!(twice, LedgerError::AlreadyDecided(_)));
        assert!(twice.is_idempotent_noop());
    }

    #[test]
    fn test_external_payout_creates_pending_withdrawal() {
        let f = fixture();
        let credit = f
            .ledger
            .request_credit(
                &f.borrower,
                Amount::new(10_000),
                1,
                PayoutDestination::External { account: "bank-123".into() },
            )
            .unwrap();
        let approval = f.ledger.approve_credit(&f.admin, &credit.id).unwrap();

        let withdrawal = approval.payout_withdrawal.unwrap();
        assert!(withdrawal.is_pending());

        // 100.00 of own money plus the disbursed 100.00, which is held for the payout
        let err = f.ledger.purchase_quotas(&f.borrower, 3, Channel::Balance).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance(_)));
        f.ledger.purchase_quotas(&f.borrower, 2, Channel::Balance).unwrap();
        match withdrawal.details {
            TransactionDetails::Withdrawal { fee, net, .. } => {
                assert_eq!(fee, Amount::zero());
                assert_eq!(net, Amount::new(10_000));
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_reject_releases_collateral() {
        let f = fixture();
        let credit = f
            .ledger
            .request_credit(&f.borrower, Amount::new(10_000), 2, PayoutDestination::Balance)
            .unwrap();
        let rejected = f.ledger.reject_credit(&f.admin, &credit.id).unwrap();
        assert_eq!(rejected.status, CreditStatus::Rejected);
        assert!(f.ledger.quotas_for(&f.borrower).unwrap().iter().all(|q| q.pledged_to.is_none()));
        assert_eq!(f.ledger.member(&f.borrower).unwrap().balance, Amount::new(10_000));
    }

    #[test]
    fn test_installments_then_full_payment() {
        let f = fixture();
        let credit = f
            .ledger
            .request_credit(&f.borrower, Amount::new(10_000), 2, PayoutDestination::Balance)
            .unwrap();
        f.ledger.approve_credit(&f.admin, &credit.id).unwrap();

        let first = f
            .ledger
            .pay_installment(&credit.id, &f.borrower, Amount::new(6_000), Channel::Balance)
            .unwrap();
        assert_eq!(first.credit.status, CreditStatus::PartiallyPaid);
        assert_eq!(first.credit.installments_paid, 1);
        assert_eq!(f.ledger.system_state().unwrap().profit_pool, Amount::zero());

        let overpay = f
            .ledger
            .pay_installment(&credit.id, &f.borrower, Amount::new(7_000), Channel::Balance)
            .unwrap_err();
        assert!(matches!(overpay, LedgerError::Validation(_)));

        let rest = f.ledger.pay_full_credit(&credit.id, &f.borrower, Channel::Balance).unwrap();
        assert_eq!(rest.credit.status, CreditStatus::Paid);
        assert_eq!(rest.credit.installments_paid, 2);
        assert_eq!(f.ledger.system_state().unwrap().profit_pool, Amount::new(2_000));
        assert!(f
            .ledger
            .quotas_for(&f.borrower)
            .unwrap()
            .iter()
            .all(|q| q.status == QuotaStatus::Active && q.pledged_to.is_none()));
        assert_eq!(f.ledger.member(&f.borrower).unwrap().balance, Amount::new(8_000));
    }

    #[test]
    fn test_approved_credit_can_be_paid_at_once() {
        let f = fixture();
        let credit = f
            .ledger
            .request_credit(&f.borrower, Amount::new(10_000), 3, PayoutDestination::Balance)
            .unwrap();
        f.ledger.approve_credit(&f.admin, &credit.id).unwrap();

        let paid = f.ledger.pay_full_credit(&credit.id, &f.borrower, Channel::Balance).unwrap();
        assert_eq!(paid.credit.status, CreditStatus::Paid);
        assert_eq!(paid.transaction.effect, Amount::new(-12_000));
    }

    #[test]
    fn test_mark_late_only_after_due_date() {
        let f = fixture();
        let credit = f
            .ledger
            .request_credit(&f.borrower, Amount::new(10_000), 1, PayoutDestination::Balance)
            .unwrap();
        f.ledger.approve_credit(&f.admin, &credit.id).unwrap();

        assert!(!f.ledger.mark_late(&credit.id).unwrap());
        f.clock.advance(Duration::days(31));
        assert!(f.ledger.mark_late(&credit.id).unwrap());
        assert!(!f.ledger.mark_late(&credit.id).unwrap());
        assert_eq!(f.ledger.credit_by_id(&credit.id).unwrap().status, CreditStatus::Late);
    }
}
