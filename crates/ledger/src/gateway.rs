//! Contracts with the collaborators that live outside the engine.
//!
//! The payment gateway moves real money and reports back asynchronously; the
//! notification sink tells members what happened. Neither is implemented here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::info;

use crate::fees::Channel;
use crate::types::{Amount, MemberId, TransactionId};

/// A charge the gateway is asked to collect for a pending transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub member_id: MemberId,
    pub pending_transaction_id: TransactionId,
    pub total: Amount,
    pub channel: Channel,
}

/// What the gateway returns once a charge has been created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    /// Gateway-side reference (payment link, transfer code...)
    pub reference: String,
    pub pending_transaction_id: TransactionId,
}

/// Final word of the gateway (or an admin) on a pending transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    Completed,
    Cancelled,
}

/// Errors raised by a gateway client
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Charge rejected: {0}")]
    Rejected(String),
}

/// Client of the external payment gateway
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a charge; confirmation arrives later through `on_settled`
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError>;
}

/// Kinds of events members are told about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    QuotaPurchased,
    QuotaRedeemed,
    QuotaLiquidated,
    CreditRequested,
    CreditApproved,
    CreditRejected,
    CreditPaid,
    CreditLate,
    CreditLiquidated,
    WithdrawalRequested,
    TransactionSettled,
    ProfitDistributed,
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&text)
    }
}

/// A message queued by a ledger operation, delivered after commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub member_id: MemberId,
    pub event: NotificationEvent,
    pub payload: serde_json::Value,
}

/// Errors raised by a notification sink; logged, never propagated
#[derive(Error, Debug)]
#[error("Notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Fire-and-forget delivery of member notifications
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sink that only writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            member = %notification.member_id,
            event = %notification.event,
            "Notification: {}",
            notification.payload
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display_matches_wire_name() {
        assert_eq!(NotificationEvent::CreditLiquidated.to_string(), "credit_liquidated");
        assert_eq!(NotificationEvent::QuotaPurchased.to_string(), "quota_purchased");
    }

    #[test]
    fn test_log_notifier_never_fails() {
        let notification = Notification {
            member_id: MemberId::new("m1"),
            event: NotificationEvent::ProfitDistributed,
            payload: serde_json::json!({ "amount": 100 }),
        };
        assert!(LogNotifier.notify(&notification).is_ok());
    }
}
