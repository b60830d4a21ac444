//! Quota lifecycle: purchase, valuation and redemption.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ValuationPolicy;
use crate::error::{LedgerError, LedgerResult};
use crate::fees::{compute_charge, Channel};
use crate::gateway::NotificationEvent;
use crate::ledger::{Ledger, Session};
use crate::model::{LiquidationReason, Member, Quota, QuotaStatus, Transaction, TransactionDetails};
use crate::store;
use crate::types::{Amount, CreditId, MemberId, QuotaId, Timestamp};

/// Outcome of a purchase; `quotas` is empty while the charge is pending
#[derive(Debug, Clone, PartialEq)]
pub struct Purchase {
    pub transaction: Transaction,
    pub quotas: Vec<Quota>,
}

/// Outcome of a voluntary redemption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redemption {
    pub quota_id: QuotaId,
    pub value: Amount,
    pub penalty: Amount,
    pub payout: Amount,
    pub transaction: Transaction,
}

/// Outcome of a collateral liquidation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcedRedemption {
    pub quota_id: QuotaId,
    pub value: Amount,
    /// Part of the value that went to the debt
    pub applied: Amount,
    /// Part of the value credited back to the owner
    pub excess: Amount,
    pub transaction: Transaction,
}

/// Value of `quota` at `now` under `policy`. Never below the stored value.
pub fn valuation_at(
    policy: &ValuationPolicy,
    quota: &Quota,
    now: Timestamp,
) -> LedgerResult<Amount> {
    let derived = match policy {
        ValuationPolicy::Fixed => quota.purchase_price,
        ValuationPolicy::DailyAccrual { daily_rate } => {
            let days = (now - quota.purchased_at).num_days().max(0);
            quota
                .purchase_price
                .scale_floor(Decimal::ONE + *daily_rate * Decimal::from(days))?
        }
    };
    Ok(derived.max(quota.current_value).max(Amount::zero()))
}

/// Bring an ACTIVE quota's value up to `now` without persisting it
pub(crate) fn revalue(
    policy: &ValuationPolicy,
    mut quota: Quota,
    now: Timestamp,
) -> LedgerResult<Quota> {
    if quota.is_active() {
        quota.current_value = valuation_at(policy, &quota, now)?;
    }
    Ok(quota)
}

/// A member with the aggregate value of its ACTIVE quotas brought up to `now`
pub(crate) fn revalue_member(
    conn: &rusqlite::Connection,
    policy: &ValuationPolicy,
    mut member: Member,
    now: Timestamp,
) -> LedgerResult<Member> {
    let mut total = Amount::zero();
    for quota in store::quotas_for_owner(conn, &member.id)? {
        if quota.is_active() {
            total += valuation_at(policy, &quota, now)?;
        }
    }
    member.quota_value = total;
    Ok(member)
}

/// Whether a quota bought at `purchased_at` is still inside the vesting period
pub fn is_vesting(purchased_at: Timestamp, now: Timestamp, vesting_days: i64) -> bool {
    now - purchased_at < Duration::days(vesting_days)
}

impl<'a> Session<'a> {
    /// Create `quantity` ACTIVE quotas valued at `unit_price`
    pub fn create_quotas(
        &mut self,
        owner: &MemberId,
        quantity: i64,
        unit_price: Amount,
    ) -> LedgerResult<Vec<Quota>> {
        let mut quotas = Vec::with_capacity(quantity.max(0) as usize);
        for _ in 0..quantity {
            let quota = Quota {
                id: QuotaId::generate(),
                owner_id: owner.clone(),
                purchase_price: unit_price,
                current_value: unit_price,
                purchased_at: self.now(),
                status: QuotaStatus::Active,
                pledged_to: None,
                liquidated_at: None,
            };
            store::insert_quota(self.conn(), &quota)?;
            quotas.push(quota);
        }

        self.notify(
            owner,
            NotificationEvent::QuotaPurchased,
            serde_json::json!({ "quantity": quantity, "unit_price": unit_price }),
        );
        info!("Created {} quotas at {} for {}", quantity, unit_price, owner);
        Ok(quotas)
    }

    /// Buy quotas. Balance-funded purchases complete immediately; external
    /// channels record a pending purchase whose quotas appear on settlement.
    pub fn purchase_quotas(
        &mut self,
        member_id: &MemberId,
        quantity: i64,
        unit_price: Amount,
        channel: Channel,
    ) -> LedgerResult<Purchase> {
        let max = self.config().quota.max_purchase_quantity;
        if quantity < 1 || quantity > max {
            return Err(LedgerError::Validation(format!(
                "Quantity must be between 1 and {}, got {}",
                max, quantity
            )));
        }
        if !unit_price.is_positive() {
            return Err(LedgerError::Validation(format!(
                "Unit price must be positive: {}",
                unit_price
            )));
        }

        let cost = unit_price.checked_mul(quantity)?;
        let charge = compute_charge(cost, channel, &self.config().fees)?;

        if channel.is_external() {
            let total = charge.total;
            let details = TransactionDetails::QuotaPurchase {
                quantity,
                unit_price,
                charge,
                quota_ids: Vec::new(),
            };
            let transaction = self.record_pending(member_id, total, details)?;
            return Ok(Purchase { transaction, quotas: Vec::new() });
        }

        let quotas = self.create_quotas(member_id, quantity, unit_price)?;
        let details = TransactionDetails::QuotaPurchase {
            quantity,
            unit_price,
            charge,
            quota_ids: quotas.iter().map(|q| q.id.clone()).collect(),
        };
        let transaction = self.debit(member_id, cost, details)?;
        Ok(Purchase { transaction, quotas })
    }

    /// Bring a quota's value up to date, persisting it if it grew
    pub fn valuate(&mut self, quota: &mut Quota) -> LedgerResult<Amount> {
        if !quota.is_active() {
            return Ok(quota.current_value);
        }
        let value = valuation_at(&self.config().quota.valuation, quota, self.now())?;
        if value > quota.current_value {
            debug!("Quota {} revalued {} -> {}", quota.id, quota.current_value, value);
            quota.current_value = value;
            store::update_quota(self.conn(), quota)?;
        }
        Ok(value)
    }

    /// Load a quota with its value brought up to date
    pub fn valuated_quota(&mut self, quota_id: &QuotaId) -> LedgerResult<Quota> {
        let mut quota = store::get_quota(self.conn(), quota_id)?;
        self.valuate(&mut quota)?;
        Ok(quota)
    }

    /// Revalue every ACTIVE quota of a member; returns their combined value
    pub fn valuate_holdings(&mut self, member_id: &MemberId) -> LedgerResult<Amount> {
        let mut total = Amount::zero();
        for mut quota in store::quotas_for_owner(self.conn(), member_id)? {
            if quota.is_active() {
                total += self.valuate(&mut quota)?;
            }
        }
        Ok(total)
    }

    /// Owner-initiated exit; a penalty applies inside the vesting period
    pub fn redeem_voluntary(
        &mut self,
        quota_id: &QuotaId,
        requester: &MemberId,
    ) -> LedgerResult<Redemption> {
        let mut quota = self.valuated_quota(quota_id)?;
        if &quota.owner_id != requester {
            return Err(LedgerError::PermissionDenied(format!(
                "Quota {} does not belong to {}",
                quota_id, requester
            )));
        }
        if !quota.is_active() {
            return Err(LedgerError::InvalidState(format!(
                "Quota {} is already liquidated",
                quota_id
            )));
        }
        if let Some(credit_id) = &quota.pledged_to {
            return Err(LedgerError::InvalidState(format!(
                "Quota {} is collateral for credit {}",
                quota_id, credit_id
            )));
        }

        let policy = &self.config().quota;
        let penalty = if is_vesting(quota.purchased_at, self.now(), policy.vesting_days) {
            quota.purchase_price.scale_half_up(policy.early_exit_penalty_rate)?
        } else {
            Amount::zero()
        };
        let value = quota.current_value;
        let payout = (value - penalty).max(Amount::zero());

        quota.status = QuotaStatus::Liquidated;
        quota.liquidated_at = Some(self.now());
        store::update_quota(self.conn(), &quota)?;

        let owner = quota.owner_id.clone();
        let transaction = self.credit(
            &owner,
            payout,
            TransactionDetails::QuotaLiquidation {
                quota_id: quota.id.clone(),
                purchase_price: quota.purchase_price,
                value,
                penalty,
                reason: LiquidationReason::Voluntary,
            },
        )?;
        self.add_to_profit_pool(value - payout)?;

        self.notify(
            &owner,
            NotificationEvent::QuotaRedeemed,
            serde_json::json!({ "quota_id": quota.id, "payout": payout, "penalty": penalty }),
        );
        info!(
            "Quota {} redeemed by {}: value {}, penalty {}, payout {}",
            quota.id, owner, value, penalty, payout
        );

        Ok(Redemption {
            quota_id: quota.id,
            value,
            penalty,
            payout,
            transaction,
        })
    }

    /// Liquidate a pledged quota at full value towards `credit_id`'s debt.
    /// Anything beyond `amount_needed` goes back to the owner.
    pub fn redeem_forced(
        &mut self,
        quota_id: &QuotaId,
        amount_needed: Amount,
        credit_id: &CreditId,
    ) -> LedgerResult<ForcedRedemption> {
        let mut quota = self.valuated_quota(quota_id)?;
        if !quota.is_active() {
            return Err(LedgerError::InvalidState(format!(
                "Quota {} is already liquidated",
                quota_id
            )));
        }
        if quota.pledged_to.as_ref() != Some(credit_id) {
            return Err(LedgerError::InvalidState(format!(
                "Quota {} is not collateral for credit {}",
                quota_id, credit_id
            )));
        }

        let value = quota.current_value;
        let applied = value.min(amount_needed.max(Amount::zero()));
        let excess = value - applied;

        quota.status = QuotaStatus::Liquidated;
        quota.liquidated_at = Some(self.now());
        quota.pledged_to = None;
        store::update_quota(self.conn(), &quota)?;

        let owner = quota.owner_id.clone();
        let transaction = self.credit(
            &owner,
            excess,
            TransactionDetails::QuotaLiquidation {
                quota_id: quota.id.clone(),
                purchase_price: quota.purchase_price,
                value,
                penalty: Amount::zero(),
                reason: LiquidationReason::Collateral {
                    credit_id: credit_id.clone(),
                    applied_to_debt: applied,
                },
            },
        )?;

        self.notify(
            &owner,
            NotificationEvent::QuotaLiquidated,
            serde_json::json!({
                "quota_id": quota.id,
                "credit_id": credit_id,
                "applied": applied,
                "excess": excess,
            }),
        );
        info!(
            "Quota {} liquidated for credit {}: applied {}, excess {}",
            quota.id, credit_id, applied, excess
        );

        Ok(ForcedRedemption {
            quota_id: quota.id,
            value,
            applied,
            excess,
            transaction,
        })
    }

    /// Redeem every ACTIVE, unpledged quota of a member
    pub fn redeem_all(&mut self, member_id: &MemberId) -> LedgerResult<Vec<Redemption>> {
        let quotas = store::free_active_quotas(self.conn(), member_id)?;
        let mut redemptions = Vec::with_capacity(quotas.len());
        for quota in quotas {
            redemptions.push(self.redeem_voluntary(&quota.id, member_id)?);
        }
        Ok(redemptions)
    }
}

impl Ledger {
    /// Buy quotas at the configured unit price
    pub fn purchase_quotas(
        &self,
        member_id: &MemberId,
        quantity: i64,
        channel: Channel,
    ) -> LedgerResult<Purchase> {
        let unit_price = self.config().quota.unit_price;
        self.atomically(|s| s.purchase_quotas(member_id, quantity, unit_price, channel))
    }

    pub fn redeem_quota(
        &self,
        member_id: &MemberId,
        quota_id: &QuotaId,
    ) -> LedgerResult<Redemption> {
        self.atomically(|s| s.redeem_voluntary(quota_id, member_id))
    }

    /// Redeem every free quota; returns the redemptions and the sum credited
    pub fn redeem_all_quotas(
        &self,
        member_id: &MemberId,
    ) -> LedgerResult<(Vec<Redemption>, Amount)> {
        let redemptions = self.atomically(|s| s.redeem_all(member_id))?;
        let total = redemptions.iter().map(|r| r.payout).sum();
        Ok((redemptions, total))
    }

    /// A member's quotas, oldest first, valued as of now
    pub fn quotas_for(&self, member_id: &MemberId) -> LedgerResult<Vec<Quota>> {
        let now = self.now();
        let policy = self.config().quota.valuation;
        self.read(|conn| {
            store::quotas_for_owner(conn, member_id)?
                .into_iter()
                .map(|quota| revalue(&policy, quota, now))
                .collect()
        })
    }

    pub fn quota(&self, quota_id: &QuotaId) -> LedgerResult<Quota> {
        let now = self.now();
        let policy = self.config().quota.valuation;
        self.read(|conn| revalue(&policy, store::get_quota(conn, quota_id)?, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::types::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn setup() -> (Ledger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let ledger = Ledger::open_in_memory(LedgerConfig::default())
            .unwrap()
            .with_clock(clock.clone());
        (ledger, clock)
    }

    fn fund(ledger: &Ledger, member: &MemberId, amount: i64) {
        ledger
            .atomically(|s| {
                let amount = Amount::new(amount);
                let charge = compute_charge(amount, Channel::Balance, &s.config().fees)?;
                s.credit(member, amount, TransactionDetails::Deposit { charge })
            })
            .unwrap();
    }

    #[test]
    fn test_balance_purchase_creates_active_quotas() {
        let (ledger, _) = setup();
        let member = ledger.register_member("Ana", false).unwrap();
        fund(&ledger, &member.id, 20_000);

        let purchase = ledger.purchase_quotas(&member.id, 2, Channel::Balance).unwrap();
        assert_eq!(purchase.quotas.len(), 2);
        assert_eq!(purchase.transaction.effect, Amount::new(-10_000));

        let member = ledger.member(&member.id).unwrap();
        assert_eq!(member.balance, Amount::new(10_000));
        assert_eq!(member.quota_count, 2);
        assert_eq!(member.quota_value, Amount::new(10_000));
    }

    #[test]
    fn test_purchase_validates_quantity() {
        let (ledger, _) = setup();
        let member = ledger.register_member("Ana", false).unwrap();
        let err = ledger.purchase_quotas(&member.id, 0, Channel::Balance).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_early_redemption_pays_penalty() {
        let (ledger, clock) = setup();
        let member = ledger.register_member("Ana", false).unwrap();
        fund(&ledger, &member.id, 5_000);
        let purchase = ledger.purchase_quotas(&member.id, 1, Channel::Balance).unwrap();

        clock.advance(Duration::days(100));
        let redemption = ledger.redeem_quota(&member.id, &purchase.quotas[0].id).unwrap();

        assert_eq!(redemption.penalty, Amount::new(2_000));
        assert_eq!(redemption.payout, Amount::new(3_000));
        assert_eq!(ledger.member(&member.id).unwrap().balance, Amount::new(3_000));
        assert_eq!(ledger.system_state().unwrap().profit_pool, Amount::new(2_000));

        let quota = ledger.quota(&purchase.quotas[0].id).unwrap();
        assert_eq!(quota.status, QuotaStatus::Liquidated);

        let again = ledger.redeem_quota(&member.id, &quota.id).unwrap_err();
        assert!(matches!(again, LedgerError::InvalidState(_)));
    }

    #[test]
    fn test_vested_redemption_has_no_penalty() {
        let (ledger, clock) = setup();
        let member = ledger.register_member("Ana", false).unwrap();
        fund(&ledger, &member.id, 5_000);
        let purchase = ledger.purchase_quotas(&member.id, 1, Channel::Balance).unwrap();

        clock.advance(Duration::days(365));
        let redemption = ledger.redeem_quota(&member.id, &purchase.quotas[0].id).unwrap();
        assert_eq!(redemption.penalty, Amount::zero());
        assert_eq!(redemption.payout, Amount::new(5_000));
    }

    #[test]
    fn test_only_owner_can_redeem() {
        let (ledger, _) = setup();
        let owner = ledger.register_member("Ana", false).unwrap();
        let other = ledger.register_member("Bruno", false).unwrap();
        fund(&ledger, &owner.id, 5_000);
        let purchase = ledger.purchase_quotas(&owner.id, 1, Channel::Balance).unwrap();

        let err = ledger.redeem_quota(&other.id, &purchase.quotas[0].id).unwrap_err();
        assert!(matches!(err, LedgerError::PermissionDenied(_)));
    }

    #[test]
    fn test_daily_accrual_never_decreases() {
        let policy = ValuationPolicy::DailyAccrual { daily_rate: Decimal::new(1, 3) };
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut quota = Quota {
            id: QuotaId::new("q"),
            owner_id: MemberId::new("m"),
            purchase_price: Amount::new(10_000),
            current_value: Amount::new(10_000),
            purchased_at: start,
            status: QuotaStatus::Active,
            pledged_to: None,
            liquidated_at: None,
        };

        let later = start + Duration::days(10);
        assert_eq!(valuation_at(&policy, &quota, later).unwrap(), Amount::new(10_100));

        quota.current_value = Amount::new(20_000);
        assert_eq!(valuation_at(&policy, &quota, later).unwrap(), Amount::new(20_000));
        let fixed = valuation_at(&ValuationPolicy::Fixed, &quota, start).unwrap();
        assert_eq!(fixed, Amount::new(20_000));
    }

    #[test]
    fn test_reads_agree_on_accrued_value() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let mut config = LedgerConfig::default();
        config.quota.valuation = ValuationPolicy::DailyAccrual { daily_rate: Decimal::new(1, 3) };
        let ledger = Ledger::open_in_memory(config).unwrap().with_clock(clock.clone());
        let member = ledger.register_member("Ana", false).unwrap();
        fund(&ledger, &member.id, 5_000);
        let purchase = ledger.purchase_quotas(&member.id, 1, Channel::Balance).unwrap();

        clock.advance(Duration::days(10));
        let accrued = Amount::new(5_050);
        assert_eq!(ledger.quota(&purchase.quotas[0].id).unwrap().current_value, accrued);
        assert_eq!(ledger.quotas_for(&member.id).unwrap()[0].current_value, accrued);
        assert_eq!(ledger.member(&member.id).unwrap().quota_value, accrued);
        assert_eq!(ledger.members().unwrap()[0].quota_value, accrued);
    }

    #[test]
    fn test_redeem_all_sums_payouts() {
        let (ledger, clock) = setup();
        let member = ledger.register_member("Ana", false).unwrap();
        fund(&ledger, &member.id, 15_000);
        ledger.purchase_quotas(&member.id, 3, Channel::Balance).unwrap();

        clock.advance(Duration::days(400));
        let (redemptions, total) = ledger.redeem_all_quotas(&member.id).unwrap();
        assert_eq!(redemptions.len(), 3);
        assert_eq!(total, Amount::new(15_000));
        assert_eq!(ledger.member(&member.id).unwrap().quota_count, 0);
    }
}
