//! Credit & capital ledger engine for member-funded cooperatives
//!
//! Members buy quotas, borrow against them as collateral and share the
//! cooperative's surplus. This crate owns the money-moving invariants:
//!
//! - [`fees`]: gross-up of gateway charges
//! - [`capital`]: balances and the append-only transaction log
//! - [`quota`]: quota purchase, valuation and redemption
//! - [`credit`]: the mutual-aid credit state machine
//! - [`sweep`]: scheduled liquidation of overdue collateral
//! - [`distribution`]: scheduled profit distribution
//! - [`approval`]: the admin approval queue
//! - [`service`]: member-facing operations over the payment gateway
//!
//! All state lives in SQLite; every mutation is one atomic unit run through
//! [`Ledger::atomically`].

pub mod approval;
pub mod capital;
pub mod config;
pub mod credit;
pub mod distribution;
pub mod error;
pub mod fees;
pub mod gateway;
pub mod ledger;
pub mod model;
pub mod quota;
pub mod service;
pub mod store;
pub mod sweep;
pub mod types;

pub use approval::{ApprovalItemType, Decision, DecisionOutcome, PendingItem};
pub use capital::{BalanceAudit, Settlement};
pub use config::{
    CreditPolicy, DistributionPolicy, InterestPolicy, LedgerConfig, QuotaPolicy, SweepPolicy,
    ValuationPolicy, WithdrawalPolicy,
};
pub use credit::{Approval, Repayment};
pub use distribution::{Distribution, DistributionReport, SkipReason};
pub use error::{LedgerError, LedgerResult};
pub use fees::{compute_charge, Channel, ChannelFeeTable, ChannelFees, ChargeBreakdown};
pub use gateway::{
    ChargeReceipt, ChargeRequest, GatewayError, LogNotifier, Notification, NotificationEvent,
    NotificationSink, NotifyError, PaymentGateway, SettlementOutcome,
};
pub use ledger::{Ledger, Session};
pub use model::{
    Credit, CreditStatus, LiquidationReason, Member, PayoutDestination, Quota, QuotaStatus,
    SystemState, Transaction, TransactionDetails, TransactionStatus, TransactionType,
};
pub use quota::{ForcedRedemption, Purchase, Redemption};
pub use service::{MemberService, Outcome, PendingCharge};
pub use sweep::{LiquidatedCredit, SweepFailure, SweepReport};
pub use types::{
    Amount, Clock, CreditId, ManualClock, MemberId, QuotaId, SystemClock, Timestamp, TransactionId,
};
