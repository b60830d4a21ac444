//! Fee gross-up arithmetic.
//!
//! Pure functions converting the amount the cooperative must receive into the
//! amount the payer is charged, so that gateway fees are always passed on to
//! the payer and never absorbed by the ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LedgerError, LedgerResult};
use crate::types::Amount;

/// A payment channel a member can fund an operation through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// The member's ledger balance; settles immediately
    Balance,
    /// Instant bank transfer through the payment gateway
    InstantTransfer,
    /// Card payment through the payment gateway
    Card,
}

impl Channel {
    /// Whether funds move through the external payment gateway
    pub fn is_external(&self) -> bool {
        !matches!(self, Channel::Balance)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Balance => "balance",
            Channel::InstantTransfer => "instant_transfer",
            Channel::Card => "card",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fee charged by the gateway on one channel: `percentage` of the total plus `fixed`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelFees {
    pub percentage: Decimal,
    pub fixed: Amount,
}

impl ChannelFees {
    pub fn new(percentage: Decimal, fixed: Amount) -> Self {
        Self { percentage, fixed }
    }

    fn validate(&self, channel: Channel) -> LedgerResult<()> {
        if self.percentage < Decimal::ZERO || self.percentage >= Decimal::ONE {
            return Err(LedgerError::Configuration(format!(
                "Fee percentage for {} must be in [0, 1), got {}",
                channel, self.percentage
            )));
        }
        if self.fixed.is_negative() {
            return Err(LedgerError::Configuration(format!(
                "Fixed fee for {} cannot be negative, got {}",
                channel, self.fixed
            )));
        }
        Ok(())
    }
}

/// Gateway fees for every external channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFeeTable {
    pub instant_transfer: ChannelFees,
    pub card: ChannelFees,
}

impl ChannelFeeTable {
    /// Fees for a channel; `None` for the balance channel
    pub fn for_channel(&self, channel: Channel) -> Option<&ChannelFees> {
        match channel {
            Channel::Balance => None,
            Channel::InstantTransfer => Some(&self.instant_transfer),
            Channel::Card => Some(&self.card),
        }
    }

    pub fn validate(&self) -> LedgerResult<()> {
        self.instant_transfer.validate(Channel::InstantTransfer)?;
        self.card.validate(Channel::Card)
    }
}

impl Default for ChannelFeeTable {
    fn default() -> Self {
        Self {
            instant_transfer: ChannelFees::new(Decimal::new(99, 4), Amount::zero()),
            card: ChannelFees::new(Decimal::new(499, 4), Amount::new(39)),
        }
    }
}

/// The result of a gross-up: what the cooperative nets, the fee, and what is charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeBreakdown {
    pub channel: Channel,
    pub base: Amount,
    pub fee: Amount,
    pub total: Amount,
}

/// Compute the amount to charge so that the cooperative nets exactly `net`.
///
/// Solves `total * (1 - p) - f = net` for `total`, rounds half-up to the minor
/// unit and recomputes `fee = total - net` so the breakdown adds up exactly.
pub fn compute_charge(
    net: Amount,
    channel: Channel,
    fees: &ChannelFeeTable,
) -> LedgerResult<ChargeBreakdown> {
    if net.is_negative() {
        return Err(LedgerError::Configuration(format!("Net amount cannot be negative: {}", net)));
    }

    let Some(channel_fees) = fees.for_channel(channel) else {
        return Ok(ChargeBreakdown {
            channel,
            base: net,
            fee: Amount::zero(),
            total: net,
        });
    };
    channel_fees.validate(channel)?;

    let gross = (net + channel_fees.fixed).to_decimal() / (Decimal::ONE - channel_fees.percentage);
    let total = Amount::from_decimal_half_up(gross)?;

    Ok(ChargeBreakdown {
        channel,
        base: net,
        fee: total - net,
        total,
    })
}

/// Withdrawal fee: waived when the member's quota value covers the amount,
/// otherwise `max(floor, amount * rate)` capped at the amount itself.
pub fn withdrawal_fee(
    amount: Amount,
    quota_value: Amount,
    rate: Decimal,
    floor: Amount,
) -> LedgerResult<Amount> {
    if quota_value >= amount {
        return Ok(Amount::zero());
    }
    let proportional = amount.scale_half_up(rate)?;
    Ok(proportional.max(floor).min(amount))
}
