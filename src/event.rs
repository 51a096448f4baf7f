use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::money::{Multiplier, Usd};

/// Lifecycle of a usage event. The state only ever moves forward from
/// `Reserved` to exactly one of the settled states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageState {
    Reserved,
    Committed,
    Void,
    Expired,
}

impl UsageState {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageState::Reserved => "reserved",
            UsageState::Committed => "committed",
            UsageState::Void => "void",
            UsageState::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reserved" => Some(UsageState::Reserved),
            "committed" => Some(UsageState::Committed),
            "void" => Some(UsageState::Void),
            "expired" => Some(UsageState::Expired),
            _ => None,
        }
    }

    pub fn is_settled(self) -> bool {
        self != UsageState::Reserved
    }
}

impl FromSql for UsageState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        UsageState::parse(raw).ok_or(FromSqlError::InvalidType)
    }
}

impl ToSql for UsageState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

/// Admission-time input: funds to set aside before the true cost is known.
#[derive(Clone, Debug)]
pub struct ReserveInput {
    /// Externally supplied request id, stored for audit; retry
    /// de-duplication happens upstream of the ledger.
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    /// Subscription-quota reservations never touch the wallet.
    pub subscription_id: Option<i64>,
    pub model: Option<String>,
    pub reserved_usd: Usd,
    /// How long the reservation stays live before the reclaimer may expire it.
    pub ttl: Duration,
}

/// Settlement input: the final cost plus the usage counters observed upstream.
#[derive(Clone, Debug, Default)]
pub struct CommitInput {
    pub event_id: i64,
    pub upstream_channel_id: Option<i64>,
    pub input_tokens: Option<i64>,
    pub cached_input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cached_output_tokens: Option<i64>,
    /// Zero means "confirm as reserved": the reservation amount becomes the
    /// committed cost.
    pub committed_usd: Usd,
    pub price_multiplier: Multiplier,
    pub price_multiplier_group: Multiplier,
    pub price_multiplier_payment: Multiplier,
    pub multiplier_source: Option<String>,
}

/// Transport metadata attached after the upstream call finishes. Carries no
/// state-machine semantics and may land before or after settlement.
#[derive(Clone, Debug, Default)]
pub struct FinalizeInput {
    pub event_id: i64,
    pub endpoint: String,
    pub method: String,
    pub status_code: i64,
    pub latency_ms: i64,
    pub first_token_latency_ms: i64,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub upstream_channel_id: Option<i64>,
    pub upstream_endpoint_id: Option<i64>,
    pub upstream_credential_id: Option<i64>,
    pub is_stream: bool,
    pub request_bytes: i64,
    pub response_bytes: i64,
}

/// One row per billable request attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: i64,
    pub ts_ms: i64,
    pub request_id: String,
    pub user_id: i64,
    pub subscription_id: Option<i64>,
    pub token_id: i64,
    pub state: UsageState,
    pub model: Option<String>,
    pub upstream_channel_id: Option<i64>,
    pub upstream_endpoint_id: Option<i64>,
    pub upstream_credential_id: Option<i64>,
    pub input_tokens: Option<i64>,
    pub cached_input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cached_output_tokens: Option<i64>,
    pub reserved_usd: Usd,
    pub committed_usd: Usd,
    pub price_multiplier: Multiplier,
    pub price_multiplier_group: Multiplier,
    pub price_multiplier_payment: Multiplier,
    pub multiplier_source: Option<String>,
    pub reserve_expires_at_ms: i64,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub status_code: i64,
    pub latency_ms: i64,
    pub first_token_latency_ms: i64,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub is_stream: bool,
    pub request_bytes: i64,
    pub response_bytes: i64,
    pub rollup_applied_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Committed spend plus still-live reserved liability over a window.
///
/// An in-flight reservation is a real hold against the user's limit, so
/// quota checks must count both.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub committed_usd: Usd,
    pub reserved_usd: Usd,
}

impl UsageTotals {
    pub fn outstanding(self) -> Usd {
        self.committed_usd.saturating_add(self.reserved_usd)
    }
}
