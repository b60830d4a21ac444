//! Profit distribution: splits the profit pool between quota holders and
//! the operating reserve in one all-or-nothing unit.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::LedgerResult;
use crate::gateway::NotificationEvent;
use crate::ledger::{Ledger, Session};
use crate::model::TransactionDetails;
use crate::store;
use crate::types::{Amount, Timestamp};

/// Why a distribution run did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoActiveQuotas,
    EmptyPool,
    /// The member share per quota rounds down to zero
    ShareTooSmall,
    /// The last run is more recent than the distribution interval
    NotDue,
}

/// Summary of a completed distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionReport {
    pub ran_at: Timestamp,
    pub pool: Amount,
    pub active_quotas: i64,
    pub per_quota: Amount,
    pub distributed: Amount,
    pub reserve: Amount,
    pub members_paid: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Distribution {
    Distributed(DistributionReport),
    Skipped { reason: SkipReason },
}

/// Split `pool` into a per-quota amount (rounded down) and the reserve remainder
pub fn split_pool(
    pool: Amount,
    member_share_rate: Decimal,
    active_quotas: i64,
) -> LedgerResult<Result<(Amount, Amount), SkipReason>> {
    if active_quotas <= 0 {
        return Ok(Err(SkipReason::NoActiveQuotas));
    }
    if !pool.is_positive() {
        return Ok(Err(SkipReason::EmptyPool));
    }
    let share = pool.to_decimal() * member_share_rate / Decimal::from(active_quotas);
    let per_quota = Amount::from_decimal_floor(share)?;
    if !per_quota.is_positive() {
        return Ok(Err(SkipReason::ShareTooSmall));
    }
    let reserve = pool - per_quota.checked_mul(active_quotas)?;
    Ok(Ok((per_quota, reserve)))
}

impl<'a> Session<'a> {
    /// Distribute the whole profit pool now
    pub fn distribute_profits(&mut self) -> LedgerResult<Distribution> {
        let mut state = store::lock_system_state(self.conn())?;
        let holdings = store::active_quota_counts(self.conn())?;
        let active_quotas: i64 = holdings.iter().map(|(_, n)| n).sum();
        let pool = state.profit_pool;

        let (per_quota, reserve) =
            match split_pool(pool, self.config().distribution.member_share_rate, active_quotas)? {
                Ok(split) => split,
                Err(reason) => {
                    info!("Profit distribution skipped ({:?}), pool {} left intact", reason, pool);
                    return Ok(Distribution::Skipped { reason });
                }
            };

        let mut distributed = Amount::zero();
        for (member_id, quotas) in &holdings {
            let share = per_quota.checked_mul(*quotas)?;
            self.credit(
                member_id,
                share,
                TransactionDetails::ProfitDistribution {
                    quotas: *quotas,
                    per_quota,
                },
            )?;
            self.notify(
                member_id,
                NotificationEvent::ProfitDistributed,
                serde_json::json!({ "quotas": quotas, "per_quota": per_quota, "amount": share }),
            );
            debug!("Distributed {} to {} for {} quotas", share, member_id, quotas);
            distributed += share;
        }

        state.operating_reserve += reserve;
        state.profit_pool = Amount::zero();
        state.last_distribution_at = Some(self.now());
        store::update_system_state(self.conn(), &state)?;

        info!(
            "Distributed {} of {} to {} members ({} per quota), {} to reserve",
            distributed,
            pool,
            holdings.len(),
            per_quota,
            reserve
        );
        Ok(Distribution::Distributed(DistributionReport {
            ran_at: self.now(),
            pool,
            active_quotas,
            per_quota,
            distributed,
            reserve,
            members_paid: holdings.len(),
        }))
    }

    /// Distribute only if the configured interval has passed since the last run
    pub fn distribute_if_due(&mut self) -> LedgerResult<Distribution> {
        let state = store::get_system_state(self.conn())?;
        let interval = Duration::hours(self.config().distribution.interval_hours);
        if let Some(last) = state.last_distribution_at {
            if self.now() - last < interval {
                debug!("Profit distribution not due, last run at {}", last);
                return Ok(Distribution::Skipped { reason: SkipReason::NotDue });
            }
        }
        self.distribute_profits()
    }
}

impl Ledger {
    pub fn distribute_profits(&self) -> LedgerResult<Distribution> {
        self.atomically(|s| s.distribute_profits())
    }

    pub fn distribute_if_due(&self) -> LedgerResult<Distribution> {
        self.atomically(|s| s.distribute_if_due())
    }
}
