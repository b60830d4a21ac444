//! Ledger records: members, quotas, credits, transactions and the system state row.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;
use crate::fees::{Channel, ChargeBreakdown};
use crate::types::{Amount, CreditId, MemberId, QuotaId, Timestamp, TransactionId};

macro_rules! stored_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(LedgerError::Internal(format!(
                        "Unknown {} value: {}", stringify!($name), other
                    ))),
                }
            }
        }
    };
}

stored_enum!(
    /// Status of a quota
    QuotaStatus {
        Active => "ACTIVE",
        /// Terminal; the quota has been paid out or applied to a debt
        Liquidated => "LIQUIDATED",
    }
);

stored_enum!(
    /// Status of a mutual-aid credit
    CreditStatus {
        Pending => "PENDING",
        Approved => "APPROVED",
        PartiallyPaid => "PARTIALLY_PAID",
        Paid => "PAID",
        Late => "LATE",
        Liquidated => "LIQUIDATED",
        Rejected => "REJECTED",
    }
);

impl CreditStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, CreditStatus::Paid | CreditStatus::Rejected | CreditStatus::Liquidated)
    }

    /// States in which the credit's collateral is frozen
    pub fn freezes_collateral(&self) -> bool {
        matches!(self, CreditStatus::Approved | CreditStatus::PartiallyPaid | CreditStatus::Late)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: CreditStatus) -> bool {
        use CreditStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, PartiallyPaid)
                | (Approved, Paid)
                | (Approved, Late)
                | (Approved, Liquidated)
                | (PartiallyPaid, PartiallyPaid)
                | (PartiallyPaid, Paid)
                | (PartiallyPaid, Late)
                | (Late, PartiallyPaid)
                | (Late, Paid)
                | (Late, Liquidated)
        )
    }
}

stored_enum!(
    /// Type of a ledger transaction
    TransactionType {
        Deposit => "DEPOSIT",
        Withdrawal => "WITHDRAWAL",
        QuotaPurchase => "QUOTA_PURCHASE",
        QuotaLiquidation => "QUOTA_LIQUIDATION",
        CreditDisbursement => "CREDIT_DISBURSEMENT",
        CreditRepayment => "CREDIT_REPAYMENT",
        ProfitDistribution => "PROFIT_DISTRIBUTION",
        MaintenanceFee => "MAINTENANCE_FEE",
    }
);

stored_enum!(
    /// Status of a ledger transaction
    TransactionStatus {
        Pending => "PENDING",
        Completed => "COMPLETED",
        Cancelled => "CANCELLED",
    }
);

/// A cooperative member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    /// Balance in minor units; only the capital ledger changes it
    pub balance: Amount,
    pub is_admin: bool,
    /// Number of ACTIVE quotas held
    pub quota_count: i64,
    /// Combined current value of ACTIVE quotas
    pub quota_value: Amount,
    pub created_at: Timestamp,
}

/// A participation unit bought by a member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub id: QuotaId,
    pub owner_id: MemberId,
    pub purchase_price: Amount,
    pub current_value: Amount,
    pub purchased_at: Timestamp,
    pub status: QuotaStatus,
    /// Credit this quota secures, if any
    pub pledged_to: Option<CreditId>,
    pub liquidated_at: Option<Timestamp>,
}

impl Quota {
    pub fn is_active(&self) -> bool {
        self.status == QuotaStatus::Active
    }

    pub fn is_pledged(&self) -> bool {
        self.pledged_to.is_some()
    }
}

/// Where an approved credit's principal is paid out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayoutDestination {
    /// Credited to the member's ledger balance
    Balance,
    /// Credited, then withdrawn to an external account
    External { account: String },
}

/// A mutual-aid credit secured by quotas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credit {
    pub id: CreditId,
    pub borrower_id: MemberId,
    pub principal: Amount,
    pub total_repayment: Amount,
    pub installments: i64,
    pub installments_paid: i64,
    pub amount_paid: Amount,
    pub status: CreditStatus,
    pub payout: PayoutDestination,
    /// Collateral quotas in pledge order (oldest first)
    pub collateral: Vec<QuotaId>,
    pub requested_at: Timestamp,
    pub decided_at: Option<Timestamp>,
    pub due_at: Option<Timestamp>,
    pub closed_at: Option<Timestamp>,
    /// Debt left uncovered when collateral ran out during liquidation
    pub shortfall: Amount,
}

impl Credit {
    pub fn remaining(&self) -> Amount {
        (self.total_repayment - self.amount_paid).max(Amount::zero())
    }

    /// Amount of one installment; the last one may be smaller
    pub fn installment_amount(&self) -> Amount {
        let total = self.total_repayment.minor_units();
        let n = self.installments.max(1);
        Amount::new((total + n - 1) / n)
    }
}

/// Typed payload recorded with every transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionDetails {
    Deposit {
        charge: ChargeBreakdown,
    },
    Withdrawal {
        requested: Amount,
        fee: Amount,
        net: Amount,
        destination: String,
        credit_id: Option<CreditId>,
    },
    QuotaPurchase {
        quantity: i64,
        unit_price: Amount,
        charge: ChargeBreakdown,
        quota_ids: Vec<QuotaId>,
    },
    QuotaLiquidation {
        quota_id: QuotaId,
        purchase_price: Amount,
        value: Amount,
        penalty: Amount,
        reason: LiquidationReason,
    },
    CreditDisbursement {
        credit_id: CreditId,
        payout: PayoutDestination,
    },
    CreditRepayment {
        credit_id: CreditId,
        charge: ChargeBreakdown,
        applied: Amount,
        refunded: Amount,
    },
    ProfitDistribution {
        quotas: i64,
        per_quota: Amount,
    },
    MaintenanceFee {
        memo: String,
    },
}

impl TransactionDetails {
    /// The ledger transaction type this payload belongs to
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            TransactionDetails::Deposit { .. } => TransactionType::Deposit,
            TransactionDetails::Withdrawal { .. } => TransactionType::Withdrawal,
            TransactionDetails::QuotaPurchase { .. } => TransactionType::QuotaPurchase,
            TransactionDetails::QuotaLiquidation { .. } => TransactionType::QuotaLiquidation,
            TransactionDetails::CreditDisbursement { .. } => TransactionType::CreditDisbursement,
            TransactionDetails::CreditRepayment { .. } => TransactionType::CreditRepayment,
            TransactionDetails::ProfitDistribution { .. } => TransactionType::ProfitDistribution,
            TransactionDetails::MaintenanceFee { .. } => TransactionType::MaintenanceFee,
        }
    }
}

/// Why a quota was liquidated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LiquidationReason {
    /// The owner redeemed it
    Voluntary,
    /// It was sold to cover an overdue credit
    Collateral { credit_id: CreditId, applied_to_debt: Amount },
}

/// An append-only ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Position in the global total order
    pub seq: i64,
    pub id: TransactionId,
    pub member_id: MemberId,
    pub transaction_type: TransactionType,
    /// Gross amount the transaction is about
    pub amount: Amount,
    /// Signed change to the member's balance once completed
    pub effect: Amount,
    pub status: TransactionStatus,
    pub details: TransactionDetails,
    pub gateway_reference: Option<String>,
    pub created_at: Timestamp,
    pub settled_at: Option<Timestamp>,
}

impl Transaction {
    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }

    /// Channel the transaction was funded through, when it carries a charge
    pub fn channel(&self) -> Option<Channel> {
        match &self.details {
            TransactionDetails::Deposit { charge }
            | TransactionDetails::QuotaPurchase { charge, .. }
            | TransactionDetails::CreditRepayment { charge, .. } => Some(charge.channel),
            _ => None,
        }
    }
}

/// Singleton row of cooperative-wide balances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub operating_reserve: Amount,
    pub profit_pool: Amount,
    pub last_distribution_at: Option<Timestamp>,
    /// Bumped whenever the set of pending approval items changes
    pub pending_generation: i64,
}
