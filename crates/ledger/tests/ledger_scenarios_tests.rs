//! End-to-end scenarios for the ledger engine
//!
//! Each test drives the public `Ledger` API the way the member service and
//! the scheduled jobs do, then checks balances, quotas and the audit.

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;

use coop_ledger::{
    compute_charge, Amount, Channel, CreditStatus, Distribution, Ledger, LedgerConfig, LedgerError,
    ManualClock, MemberId, PayoutDestination, QuotaStatus, SettlementOutcome, TransactionDetails,
    TransactionStatus,
};

struct Harness {
    ledger: Ledger,
    clock: Arc<ManualClock>,
    admin: MemberId,
}

impl Harness {
    fn new(config: LedgerConfig) -> Self {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let ledger = Ledger::open_in_memory(config).unwrap().with_clock(clock.clone());
        let admin = ledger.register_member("Admin", true).unwrap().id;
        Self { ledger, clock, admin }
    }

    /// Register a member and complete an instant-transfer deposit for them
    fn member_with_balance(&self, name: &str, net: i64) -> MemberId {
        let id = self.ledger.register_member(name, false).unwrap().id;
        if net > 0 {
            let tx = self.ledger.deposit(&id, Amount::new(net), Channel::InstantTransfer).unwrap();
            self.ledger.settle_pending(&tx.id, SettlementOutcome::Completed).unwrap();
        }
        id
    }

    fn assert_conserved(&self) {
        let drifted = self.ledger.audit_all().unwrap();
        assert!(drifted.is_empty(), "balance drift: {:?}", drifted);
    }
}

#[test_log::test]
fn scenario_buy_two_quotas_from_balance() {
    let h = Harness::new(LedgerConfig::default());
    let ana = h.member_with_balance("Ana", 15_000);

    let purchase = h.ledger.purchase_quotas(&ana, 2, Channel::Balance).unwrap();

    match &purchase.transaction.details {
        TransactionDetails::QuotaPurchase { charge, quota_ids, .. } => {
            assert_eq!(charge.base, Amount::new(10_000));
            assert_eq!(charge.fee, Amount::zero());
            assert_eq!(charge.total, Amount::new(10_000));
            assert_eq!(quota_ids.len(), 2);
        }
        other => panic!("unexpected details {:?}", other),
    }
    assert_eq!(h.ledger.member(&ana).unwrap().balance, Amount::new(5_000));
    let quotas = h.ledger.quotas_for(&ana).unwrap();
    assert_eq!(quotas.len(), 2);
    assert!(quotas
        .iter()
        .all(|q| q.status == QuotaStatus::Active && q.purchase_price == Amount::new(5_000)));
    h.assert_conserved();
}

#[test_log::test]
fn scenario_buy_one_quota_by_instant_transfer() {
    let h = Harness::new(LedgerConfig::default());
    let ana = h.member_with_balance("Ana", 0);

    let fees = &h.ledger.config().fees;
    let charge = compute_charge(Amount::new(5_000), Channel::InstantTransfer, fees).unwrap();
    assert_eq!(charge.total, Amount::new(5_050));
    assert_eq!(charge.fee, Amount::new(50));

    let purchase = h.ledger.purchase_quotas(&ana, 1, Channel::InstantTransfer).unwrap();
    assert_eq!(purchase.transaction.status, TransactionStatus::Pending);
    assert_eq!(purchase.transaction.amount, Amount::new(5_050));

    h.ledger
        .settle_pending(&purchase.transaction.id, SettlementOutcome::Completed)
        .unwrap();
    let member = h.ledger.member(&ana).unwrap();
    assert_eq!(member.quota_count, 1);
    assert_eq!(member.balance, Amount::zero());
    h.assert_conserved();
}

#[test_log::test]
fn scenario_withdrawal_fee_when_quotas_do_not_cover_amount() {
    let h = Harness::new(LedgerConfig::default());
    let ana = h.member_with_balance("Ana", 35_000);
    h.ledger.purchase_quotas(&ana, 3, Channel::Balance).unwrap();

    let tx = h.ledger.request_withdrawal(&ana, Amount::new(20_000), "bank-1").unwrap();
    match &tx.details {
        TransactionDetails::Withdrawal { fee, net, .. } => {
            assert_eq!(*fee, Amount::new(500));
            assert_eq!(*net, Amount::new(19_500));
        }
        other => panic!("unexpected details {:?}", other),
    }
}

#[test_log::test]
fn scenario_withdrawal_fee_waived_when_quotas_cover_amount() {
    let h = Harness::new(LedgerConfig::default());
    let ana = h.member_with_balance("Ana", 40_000);
    h.ledger.purchase_quotas(&ana, 4, Channel::Balance).unwrap();

    let tx = h.ledger.request_withdrawal(&ana, Amount::new(20_000), "bank-1").unwrap();
    match &tx.details {
        TransactionDetails::Withdrawal { fee, net, .. } => {
            assert_eq!(*fee, Amount::zero());
            assert_eq!(*net, Amount::new(20_000));
        }
        other => panic!("unexpected details {:?}", other),
    }
}

#[test_log::test]
fn scenario_sweep_liquidates_all_five_quotas() {
    let h = Harness::new(LedgerConfig::default());
    let ana = h.member_with_balance("Ana", 25_000);
    h.ledger.purchase_quotas(&ana, 5, Channel::Balance).unwrap();

    // 208.33 at a flat 20% owes 250.00
    let credit = h
        .ledger
        .request_credit(&ana, Amount::new(20_833), 1, PayoutDestination::Balance)
        .unwrap();
    assert_eq!(credit.total_repayment, Amount::new(25_000));
    assert_eq!(credit.collateral.len(), 5);
    let approval = h.ledger.approve_credit(&h.admin, &credit.id).unwrap();
    let due = approval.credit.due_at.unwrap();

    h.clock.set(due + Duration::days(6));
    let report = h.ledger.run_collateral_sweep().unwrap();

    assert_eq!(report.liquidated.len(), 1);
    let closed = &report.liquidated[0];
    assert_eq!(closed.debt, Amount::new(25_000));
    assert_eq!(closed.recovered, Amount::new(25_000));
    assert_eq!(closed.shortfall, Amount::zero());
    assert_eq!(closed.quotas_liquidated, 5);

    let credit = h.ledger.credit_by_id(&credit.id).unwrap();
    assert_eq!(credit.status, CreditStatus::Liquidated);
    assert!(h.ledger.quotas_for(&ana).unwrap().iter().all(|q| q.pledged_to.is_none()));
    assert_eq!(h.ledger.member(&ana).unwrap().quota_count, 0);

    // everything beyond the principal is interest
    assert_eq!(h.ledger.system_state().unwrap().profit_pool, Amount::new(4_167));
    h.assert_conserved();

    let again = h.ledger.run_collateral_sweep().unwrap();
    assert!(again.liquidated.is_empty());
}

#[test_log::test]
fn scenario_early_redemption_penalty() {
    let mut config = LedgerConfig::default();
    config.quota.unit_price = Amount::new(10_000);
    let h = Harness::new(config);
    let ana = h.member_with_balance("Ana", 10_000);
    let purchase = h.ledger.purchase_quotas(&ana, 1, Channel::Balance).unwrap();

    h.clock.advance(Duration::days(100));
    let redemption = h.ledger.redeem_quota(&ana, &purchase.quotas[0].id).unwrap();

    assert_eq!(redemption.penalty, Amount::new(4_000));
    assert_eq!(redemption.payout, redemption.value - Amount::new(4_000));
    assert_eq!(h.ledger.member(&ana).unwrap().balance, Amount::new(6_000));
    h.assert_conserved();
}

#[test_log::test]
fn frozen_collateral_cannot_be_redeemed_until_paid() {
    let h = Harness::new(LedgerConfig::default());
    let ana = h.member_with_balance("Ana", 22_000);
    let purchase = h.ledger.purchase_quotas(&ana, 2, Channel::Balance).unwrap();
    let credit = h
        .ledger
        .request_credit(&ana, Amount::new(10_000), 2, PayoutDestination::Balance)
        .unwrap();
    h.ledger.approve_credit(&h.admin, &credit.id).unwrap();

    let err = h.ledger.redeem_quota(&ana, &purchase.quotas[0].id).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));

    h.ledger.pay_full_credit(&credit.id, &ana, Channel::Balance).unwrap();
    h.clock.advance(Duration::days(365));
    let redemption = h.ledger.redeem_quota(&ana, &purchase.quotas[0].id).unwrap();
    assert_eq!(redemption.penalty, Amount::zero());
    h.assert_conserved();
}

#[test_log::test]
fn external_repayment_after_liquidation_is_refunded() {
    let h = Harness::new(LedgerConfig::default());
    let ana = h.member_with_balance("Ana", 20_000);
    h.ledger.purchase_quotas(&ana, 4, Channel::Balance).unwrap();
    let credit = h
        .ledger
        .request_credit(&ana, Amount::new(10_000), 1, PayoutDestination::Balance)
        .unwrap();
    h.ledger.approve_credit(&h.admin, &credit.id).unwrap();

    let repayment = h
        .ledger
        .pay_full_credit(&credit.id, &ana, Channel::InstantTransfer)
        .unwrap();
    assert!(repayment.transaction.is_pending());

    h.clock.advance(Duration::days(40));
    h.ledger.run_collateral_sweep().unwrap();
    let balance = h.ledger.member(&ana).unwrap().balance;

    // the webhook arrives late: the credit is closed, so the money is refunded
    let settled = h
        .ledger
        .settle_pending(&repayment.transaction.id, SettlementOutcome::Completed)
        .unwrap();
    assert_eq!(settled.transaction().effect, Amount::new(12_000));
    assert_eq!(h.ledger.member(&ana).unwrap().balance, balance + Amount::new(12_000));
    h.assert_conserved();
}

#[test_log::test]
fn distribution_after_interest_and_penalties() {
    let h = Harness::new(LedgerConfig::default());
    let ana = h.member_with_balance("Ana", 10_000);
    let bruno = h.member_with_balance("Bruno", 10_000);
    h.ledger.purchase_quotas(&ana, 2, Channel::Balance).unwrap();
    let bruno_quotas = h.ledger.purchase_quotas(&bruno, 2, Channel::Balance).unwrap();

    // Bruno leaves one quota early: 20.00 penalty into the pool
    h.ledger.redeem_quota(&bruno, &bruno_quotas.quotas[0].id).unwrap();
    assert_eq!(h.ledger.system_state().unwrap().profit_pool, Amount::new(2_000));

    let report = match h.ledger.distribute_profits().unwrap() {
        Distribution::Distributed(report) => report,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(report.active_quotas, 3);
    assert_eq!(report.per_quota, Amount::new(566));
    assert_eq!(report.per_quota.checked_mul(3).unwrap() + report.reserve, report.pool);

    let state = h.ledger.system_state().unwrap();
    assert_eq!(state.profit_pool, Amount::zero());
    assert_eq!(state.operating_reserve, Amount::new(302));
    h.assert_conserved();
}

#[test_log::test]
fn concurrent_debits_never_overdraw() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let setup = Ledger::open(&path, LedgerConfig::default()).unwrap();
    let ana = setup.register_member("Ana", false).unwrap().id;
    let tx = setup.deposit(&ana, Amount::new(10_000), Channel::InstantTransfer).unwrap();
    setup.settle_pending(&tx.id, SettlementOutcome::Completed).unwrap();
    drop(setup);

    // Each thread is its own connection, as separate processes would be
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let ana = ana.clone();
            std::thread::spawn(move || {
                let ledger = Ledger::open(&path, LedgerConfig::default()).unwrap();
                (0..5)
                    .filter(|_| ledger.purchase_quotas(&ana, 1, Channel::Balance).is_ok())
                    .count()
            })
        })
        .collect();
    let bought: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let ledger = Ledger::open(&path, LedgerConfig::default()).unwrap();
    assert_eq!(bought, 2);
    let member = ledger.member(&ana).unwrap();
    assert_eq!(member.balance, Amount::zero());
    assert_eq!(member.quota_count, 2);
    assert!(ledger.audit_all().unwrap().is_empty());
}
