//! Engine configuration.
//!
//! Every tunable of the ledger lives here. Money is expressed in minor units,
//! rates as decimals. [`LedgerConfig::validate`] must pass before a ledger is
//! opened; a failure is a startup error, never a user-facing one.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::fees::ChannelFeeTable;
use crate::types::Amount;

/// How a quota's current value evolves while it is held
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValuationPolicy {
    /// Value stays at the purchase price
    Fixed,
    /// Simple accrual on the purchase price for every full day held
    DailyAccrual { daily_rate: Decimal },
}

/// How the total repayment of a credit is derived from its principal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterestPolicy {
    /// `principal * (1 + rate)` regardless of the installment count
    FlatSurcharge { rate: Decimal },
    /// `principal * (1 + rate * installments)`
    PerInstallment { rate: Decimal },
}

impl InterestPolicy {
    /// Total amount to repay for a principal split into `installments`
    pub fn total_repayment(&self, principal: Amount, installments: i64) -> LedgerResult<Amount> {
        let factor = match self {
            InterestPolicy::FlatSurcharge { rate } => Decimal::ONE + rate,
            InterestPolicy::PerInstallment { rate } => {
                Decimal::ONE + rate * Decimal::from(installments)
            }
        };
        principal.scale_half_up(factor)
    }

    fn rate(&self) -> Decimal {
        match self {
            InterestPolicy::FlatSurcharge { rate } | InterestPolicy::PerInstallment { rate } => {
                *rate
            }
        }
    }
}

/// Quota purchase, valuation and redemption settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub unit_price: Amount,
    pub vesting_days: i64,
    pub early_exit_penalty_rate: Decimal,
    pub max_purchase_quantity: i64,
    pub valuation: ValuationPolicy,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            unit_price: Amount::new(5_000),
            vesting_days: 365,
            early_exit_penalty_rate: Decimal::new(40, 2),
            max_purchase_quantity: 1_000,
            valuation: ValuationPolicy::Fixed,
        }
    }
}

/// Mutual-aid credit bounds and pricing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPolicy {
    pub min_principal: Amount,
    pub max_principal: Amount,
    pub min_installments: i64,
    pub max_installments: i64,
    pub installment_interval_days: i64,
    pub interest: InterestPolicy,
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self {
            min_principal: Amount::new(10_000),
            max_principal: Amount::new(5_000_000),
            min_installments: 1,
            max_installments: 12,
            installment_interval_days: 30,
            interest: InterestPolicy::FlatSurcharge { rate: Decimal::new(20, 2) },
        }
    }
}

/// Fee rule for withdrawals not covered by the member's quota value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalPolicy {
    pub fee_rate: Decimal,
    pub fee_floor: Amount,
}

impl Default for WithdrawalPolicy {
    fn default() -> Self {
        Self {
            fee_rate: Decimal::new(2, 2),
            fee_floor: Amount::new(500),
        }
    }
}

/// Profit distribution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionPolicy {
    pub member_share_rate: Decimal,
    pub interval_hours: i64,
}

impl Default for DistributionPolicy {
    fn default() -> Self {
        Self {
            member_share_rate: Decimal::new(85, 2),
            interval_hours: 24,
        }
    }
}

/// Collateral sweep settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPolicy {
    pub grace_period_days: i64,
    pub interval_hours: i64,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            grace_period_days: 5,
            interval_hours: 24,
        }
    }
}

/// Configuration for the ledger engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub quota: QuotaPolicy,
    #[serde(default)]
    pub credit: CreditPolicy,
    #[serde(default)]
    pub withdrawal: WithdrawalPolicy,
    #[serde(default)]
    pub fees: ChannelFeeTable,
    #[serde(default)]
    pub distribution: DistributionPolicy,
    #[serde(default)]
    pub sweep: SweepPolicy,
}

fn unit_rate(name: &str, rate: Decimal) -> LedgerResult<()> {
    if rate < Decimal::ZERO || rate > Decimal::ONE {
        return Err(LedgerError::Configuration(format!("{} must be in [0, 1], got {}", name, rate)));
    }
    Ok(())
}

fn positive(name: &str, value: i64) -> LedgerResult<()> {
    if value <= 0 {
        return Err(LedgerError::Configuration(format!("{} must be positive, got {}", name, value)));
    }
    Ok(())
}

impl LedgerConfig {
    /// Check every setting; any failure is fatal
    pub fn validate(&self) -> LedgerResult<()> {
        positive("quota.unit_price", self.quota.unit_price.minor_units())?;
        positive("quota.max_purchase_quantity", self.quota.max_purchase_quantity)?;
        if self.quota.vesting_days < 0 {
            return Err(LedgerError::Configuration(
                "quota.vesting_days cannot be negative".to_string(),
            ));
        }
        unit_rate("quota.early_exit_penalty_rate", self.quota.early_exit_penalty_rate)?;
        if let ValuationPolicy::DailyAccrual { daily_rate } = self.quota.valuation {
            unit_rate("quota.valuation.daily_rate", daily_rate)?;
        }

        positive("credit.min_principal", self.credit.min_principal.minor_units())?;
        positive("credit.min_installments", self.credit.min_installments)?;
        positive("credit.installment_interval_days", self.credit.installment_interval_days)?;
        if self.credit.min_principal > self.credit.max_principal {
            return Err(LedgerError::Configuration(format!(
                "credit.min_principal ({}) exceeds credit.max_principal ({})",
                self.credit.min_principal, self.credit.max_principal
            )));
        }
        if self.credit.min_installments > self.credit.max_installments {
            return Err(LedgerError::Configuration(format!(
                "credit.min_installments ({}) exceeds credit.max_installments ({})",
                self.credit.min_installments, self.credit.max_installments
            )));
        }
        if self.credit.interest.rate() < Decimal::ZERO {
            return Err(LedgerError::Configuration(
                "credit.interest.rate cannot be negative".to_string(),
            ));
        }

        unit_rate("withdrawal.fee_rate", self.withdrawal.fee_rate)?;
        if self.withdrawal.fee_floor.is_negative() {
            return Err(LedgerError::Configuration(
                "withdrawal.fee_floor cannot be negative".to_string(),
            ));
        }

        self.fees.validate()?;

        unit_rate("distribution.member_share_rate", self.distribution.member_share_rate)?;
        positive("distribution.interval_hours", self.distribution.interval_hours)?;

        if self.sweep.grace_period_days < 0 {
            return Err(LedgerError::Configuration(
                "sweep.grace_period_days cannot be negative".to_string(),
            ));
        }
        positive("sweep.interval_hours", self.sweep.interval_hours)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LedgerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.quota.vesting_days, 365);
        assert_eq!(config.distribution.member_share_rate, Decimal::new(85, 2));
        assert_eq!(config.sweep.grace_period_days, 5);
    }

    #[test]
    fn test_interest_policies() {
        let flat = InterestPolicy::FlatSurcharge { rate: Decimal::new(20, 2) };
        assert_eq!(flat.total_repayment(Amount::new(100_000), 6).unwrap(), Amount::new(120_000));

        let per_installment = InterestPolicy::PerInstallment { rate: Decimal::new(20, 2) };
        let total = per_installment.total_repayment(Amount::new(100_000), 6).unwrap();
        assert_eq!(total, Amount::new(220_000));
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let mut config = LedgerConfig::default();
        config.fees.card.percentage = Decimal::ONE;
        assert!(matches!(config.validate(), Err(LedgerError::Configuration(_))));

        let mut config = LedgerConfig::default();
        config.credit.min_installments = 13;
        assert!(matches!(config.validate(), Err(LedgerError::Configuration(_))));

        let mut config = LedgerConfig::default();
        config.distribution.member_share_rate = Decimal::new(11, 1);
        assert!(matches!(config.validate(), Err(LedgerError::Configuration(_))));
    }

    #[test]
    fn test_config_json_roundtrip_keeps_policies() {
        let mut config = LedgerConfig::default();
        config.quota.valuation = ValuationPolicy::DailyAccrual { daily_rate: Decimal::new(1, 4) };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LedgerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
