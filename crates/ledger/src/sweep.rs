//! Collateral sweep: liquidates the collateral of credits overdue past the
//! grace period.
//!
//! Every credit is handled in its own atomic unit under the credit row lock,
//! so a concurrent repayment is either fully seen or not at all. A failure on
//! one credit is logged and the sweep moves on to the next.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::LedgerResult;
use crate::gateway::NotificationEvent;
use crate::ledger::{Ledger, Session};
use crate::model::CreditStatus;
use crate::store;
use crate::types::{Amount, CreditId, MemberId, Timestamp};

/// One credit closed by the sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidatedCredit {
    pub credit_id: CreditId,
    pub borrower_id: MemberId,
    pub debt: Amount,
    pub recovered: Amount,
    /// Debt left uncovered once collateral ran out; followed up manually
    pub shortfall: Amount,
    pub quotas_liquidated: usize,
}

/// A credit the sweep could not process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub credit_id: CreditId,
    pub error: String,
}

/// Summary of one sweep run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub ran_at: Timestamp,
    pub marked_late: usize,
    pub examined: usize,
    pub liquidated: Vec<LiquidatedCredit>,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn total_shortfall(&self) -> Amount {
        self.liquidated.iter().map(|c| c.shortfall).sum()
    }
}

impl<'a> Session<'a> {
    /// Liquidate the collateral of one credit if it is still overdue past
    /// `cutoff`. Returns `None` when the status guard says there is nothing to do.
    pub fn liquidate_credit(
        &mut self,
        credit_id: &CreditId,
        cutoff: Timestamp,
    ) -> LedgerResult<Option<LiquidatedCredit>> {
        let mut credit = self.credit_for_update(credit_id)?;
        let overdue = credit.due_at.map(|due| due < cutoff).unwrap_or(false);
        if !overdue || !matches!(credit.status, CreditStatus::Late | CreditStatus::Approved) {
            return Ok(None);
        }

        let debt = credit.remaining();
        let mut recovered = Amount::zero();
        let mut quotas_liquidated = 0;
        for quota in store::pledged_quotas(self.conn(), credit_id)? {
            if recovered >= debt {
                break;
            }
            let forced = self.redeem_forced(&quota.id, debt - recovered, credit_id)?;
            recovered += forced.applied;
            quotas_liquidated += 1;
        }

        self.apply_collection(&mut credit, recovered)?;
        credit.shortfall = debt - recovered;
        credit.status = CreditStatus::Liquidated;
        credit.closed_at = Some(self.now());
        store::update_credit(self.conn(), &credit)?;
        store::release_pledges(self.conn(), credit_id)?;

        self.notify(
            &credit.borrower_id,
            NotificationEvent::CreditLiquidated,
            serde_json::json!({
                "credit_id": credit.id,
                "recovered": recovered,
                "shortfall": credit.shortfall,
            }),
        );
        if credit.shortfall.is_positive() {
            warn!("Credit {} liquidated with shortfall {}", credit.id, credit.shortfall);
        } else {
            info!(
                "Credit {} liquidated, {} recovered from {} quotas",
                credit.id, recovered, quotas_liquidated
            );
        }

        Ok(Some(LiquidatedCredit {
            credit_id: credit.id,
            borrower_id: credit.borrower_id,
            debt,
            recovered,
            shortfall: credit.shortfall,
            quotas_liquidated,
        }))
    }
}

impl Ledger {
    /// Flip every overdue APPROVED or PARTIALLY_PAID credit to LATE
    pub fn mark_overdue_credits(&self) -> LedgerResult<usize> {
        let now = self.now();
        let candidates = self.read(|conn| {
            store::credits_due_before(
                conn,
                &[CreditStatus::Approved, CreditStatus::PartiallyPaid],
                now,
            )
        })?;

        let mut marked = 0;
        for credit_id in candidates {
            match self.mark_late(&credit_id) {
                Ok(true) => marked += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to mark credit {} late: {}", credit_id, e),
            }
        }
        Ok(marked)
    }

    /// Run the collateral sweep once
    pub fn run_collateral_sweep(&self) -> LedgerResult<SweepReport> {
        let ran_at = self.now();
        let marked_late = self.mark_overdue_credits()?;

        let cutoff = ran_at - Duration::days(self.config().sweep.grace_period_days);
        let candidates = self.read(|conn| {
            store::credits_due_before(conn, &[CreditStatus::Late, CreditStatus::Approved], cutoff)
        })?;

        let mut report = SweepReport {
            ran_at,
            marked_late,
            examined: candidates.len(),
            liquidated: Vec::new(),
            failures: Vec::new(),
        };

        for credit_id in candidates {
            match self.atomically(|s| s.liquidate_credit(&credit_id, cutoff)) {
                Ok(Some(liquidated)) => report.liquidated.push(liquidated),
                Ok(None) => {}
                Err(e) => {
                    error!("Collateral sweep failed for credit {}: {}", credit_id, e);
                    report.failures.push(SweepFailure {
                        credit_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Collateral sweep: {} marked late, {} examined, {} liquidated, {} failed",
            report.marked_late,
            report.examined,
            report.liquidated.len(),
            report.failures.len()
        );
        Ok(report)
    }
}
