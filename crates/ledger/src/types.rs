//! Common types used throughout the ledger engine.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

/// A timestamp used for timing events in the ledger
pub type Timestamp = DateTime<Utc>;

/// Convert a timestamp into the millisecond form stored in the database
pub(crate) fn to_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

/// Convert a stored millisecond value back into a timestamp
pub(crate) fn from_millis(ms: i64) -> Timestamp {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random identifier
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Wrap an existing identifier
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the identifier as a string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a cooperative member
    MemberId
);
string_id!(
    /// Identifier of a quota (participation unit)
    QuotaId
);
string_id!(
    /// Identifier of a mutual-aid credit
    CreditId
);
string_id!(
    /// Identifier of a ledger transaction
    TransactionId
);

/// An amount of money in integer minor currency units (cents)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    /// Create an amount from minor units
    pub const fn new(minor_units: i64) -> Self {
        Self(minor_units)
    }

    /// Create a zero amount
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the value in minor units
    pub const fn minor_units(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Get the value as a decimal number of minor units
    pub fn to_decimal(&self) -> Decimal {
        Decimal::from(self.0)
    }

    /// Convert a decimal number of minor units, rounding half-up
    pub fn from_decimal_half_up(value: Decimal) -> LedgerResult<Self> {
        Self::from_decimal(value, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Convert a decimal number of minor units, rounding towards zero
    pub fn from_decimal_floor(value: Decimal) -> LedgerResult<Self> {
        Self::from_decimal(value, RoundingStrategy::ToZero)
    }

    fn from_decimal(value: Decimal, strategy: RoundingStrategy) -> LedgerResult<Self> {
        value
            .round_dp_with_strategy(0, strategy)
            .to_i64()
            .map(Self)
            .ok_or_else(|| LedgerError::Validation(format!("Amount out of range: {}", value)))
    }

    /// Scale the amount by a rate, rounding towards zero
    pub fn scale_floor(&self, rate: Decimal) -> LedgerResult<Self> {
        Self::from_decimal_floor(self.to_decimal() * rate)
    }

    /// Scale the amount by a rate, rounding half-up
    pub fn scale_half_up(&self, rate: Decimal) -> LedgerResult<Self> {
        Self::from_decimal_half_up(self.to_decimal() * rate)
    }

    /// Multiply by an integer count, failing on overflow
    pub fn checked_mul(&self, count: i64) -> LedgerResult<Self> {
        self.0
            .checked_mul(count)
            .map(Self)
            .ok_or_else(|| LedgerError::Validation(format!(
                "Amount overflow: {} x {}",
                self.0, count
            )))
    }

    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Amount {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self(self.0 - other.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Neg for Amount {
    type Output = Self;

    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::zero(), |acc, a| acc + a)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// Source of "now" for every ledger operation
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to, used by tests and replays
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::RwLock<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: std::sync::RwLock::new(start),
        }
    }

    /// Move the clock to an absolute time
    pub fn set(&self, ts: Timestamp) {
        if let Ok(mut now) = self.now.write() {
            *now = ts;
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.write() {
            *now = *now + by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.read().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}
