use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params};

use crate::config::RollupShardConfig;
use crate::error::{LedgerError, Result};
use crate::event::{
    CommitInput, FinalizeInput, ReserveInput, UsageEvent, UsageState, UsageTotals,
};
use crate::money::Usd;

const MAX_ENDPOINT_BYTES: usize = 128;
const MAX_METHOD_BYTES: usize = 16;
const MAX_ERROR_CLASS_BYTES: usize = 64;
const MAX_ERROR_MESSAGE_BYTES: usize = 255;
const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;

/// SQLite-backed wallet and usage-event ledger.
///
/// Every operation opens its own connection inside `spawn_blocking`; mutating
/// operations run in a single IMMEDIATE transaction. SQLite has one writer,
/// so balance mutations serialize and no partial state survives a failure.
#[derive(Clone, Debug)]
pub struct LedgerStore {
    path: PathBuf,
    shards: Option<RollupShardConfig>,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            shards: None,
        }
    }

    /// Enables the sharded hour-bucket representation for events at or after
    /// the configured cutover.
    pub fn with_rollup_shards(mut self, shards: RollupShardConfig) -> Self {
        self.shards = Some(shards);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn shard_config(&self) -> Option<RollupShardConfig> {
        self.shards
    }

    pub async fn init(&self) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Returns the available balance, zero for users without a wallet row.
    pub async fn balance(&self, user_id: i64) -> Result<Usd> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Usd> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let micros: Option<i64> = conn
                .query_row(
                    "SELECT usd_micros FROM user_balances WHERE user_id=?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(Usd::from_micros(micros.unwrap_or(0)))
        })
        .await?
    }

    /// Batch balance read; users without a row come back as zero.
    pub async fn balances(&self, user_ids: &[i64]) -> Result<HashMap<i64, Usd>> {
        let path = self.path.clone();
        let user_ids = user_ids.to_vec();
        tokio::task::spawn_blocking(move || -> Result<HashMap<i64, Usd>> {
            let mut out: HashMap<i64, Usd> =
                user_ids.iter().map(|id| (*id, Usd::ZERO)).collect();
            if user_ids.is_empty() {
                return Ok(out);
            }
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let placeholders = vec!["?"; user_ids.len()].join(",");
            let query = format!(
                "SELECT user_id, usd_micros FROM user_balances WHERE user_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(user_ids.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (user_id, micros) = row?;
                out.insert(user_id, Usd::from_micros(micros));
            }
            Ok(out)
        })
        .await?
    }

    /// Idempotent creation of a zero-balance wallet row.
    pub async fn ensure_balance(&self, user_id: i64) -> Result<()> {
        if user_id <= 0 {
            return Err(LedgerError::InvalidInput("user_id must be positive"));
        }
        let path = self.path.clone();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT OR IGNORE INTO user_balances (user_id, usd_micros, created_at_ms, updated_at_ms)
                 VALUES (?1, 0, ?2, ?2)",
                params![user_id, ts_ms],
            )?;
            Ok(())
        })
        .await?
    }

    /// Credits funds (top-up or refund from a payment provider) and returns
    /// the new balance. Rejects non-positive amounts.
    pub async fn top_up(&self, user_id: i64, amount: Usd) -> Result<Usd> {
        if user_id <= 0 {
            return Err(LedgerError::InvalidInput("user_id must be positive"));
        }
        if amount.micros() <= 0 {
            return Err(LedgerError::InvalidInput("top-up amount must be positive"));
        }
        let path = self.path.clone();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<Usd> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_balance_row(&tx, user_id, ts_ms)?;
            credit_balance(&tx, user_id, amount, ts_ms)?;
            let micros: i64 = tx.query_row(
                "SELECT usd_micros FROM user_balances WHERE user_id=?1",
                params![user_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(Usd::from_micros(micros))
        })
        .await?
    }

    /// Admission control: atomically debits the reservation from the wallet
    /// and inserts the `reserved` event. Fails with `InsufficientFunds` and
    /// creates nothing when the wallet is short. Subscription reservations
    /// insert the event without touching the wallet.
    pub async fn reserve(&self, input: ReserveInput) -> Result<i64> {
        if input.user_id <= 0 {
            return Err(LedgerError::InvalidInput("user_id must be positive"));
        }
        if input.token_id <= 0 {
            return Err(LedgerError::InvalidInput("token_id must be positive"));
        }
        if input.reserved_usd.is_negative() {
            return Err(LedgerError::InvalidInput("reserved amount must not be negative"));
        }
        if input.ttl == Duration::ZERO {
            return Err(LedgerError::InvalidInput("reservation ttl must be positive"));
        }

        let path = self.path.clone();
        let ts_ms = now_millis();
        let expires_at_ms = ts_ms.saturating_add(duration_to_millis(input.ttl));
        tokio::task::spawn_blocking(move || -> Result<i64> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if input.subscription_id.is_none() {
                ensure_balance_row(&tx, input.user_id, ts_ms)?;
                let balance = read_balance(&tx, input.user_id)?;
                if balance < input.reserved_usd {
                    return Err(LedgerError::InsufficientFunds {
                        balance,
                        required: input.reserved_usd,
                    });
                }
                debit_balance(&tx, input.user_id, input.reserved_usd, ts_ms)?;
            }

            tx.execute(
                "INSERT INTO usage_events (
                   ts_ms, request_id, user_id, subscription_id, token_id, state, model,
                   reserved_usd_micros, committed_usd_micros, reserve_expires_at_ms,
                   created_at_ms, updated_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?1, ?1)",
                params![
                    ts_ms,
                    input.request_id,
                    input.user_id,
                    input.subscription_id,
                    input.token_id,
                    UsageState::Reserved,
                    input.model,
                    input.reserved_usd.micros(),
                    expires_at_ms,
                ],
            )?;
            let event_id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(event_id)
        })
        .await?
    }

    /// Settles a reservation and reconciles the wallet.
    ///
    /// A second call on the same event is a no-op. A committed cost above the
    /// reservation debits at most the remaining balance; the stored committed
    /// cost then under-states the true cost rather than driving the wallet
    /// negative or failing the already-completed request.
    pub async fn commit(&self, input: CommitInput) -> Result<()> {
        if input.event_id <= 0 {
            return Err(LedgerError::InvalidInput("event_id must be positive"));
        }
        if input.committed_usd.is_negative() {
            return Err(LedgerError::InvalidInput("committed amount must not be negative"));
        }

        let path = self.path.clone();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row: Option<(i64, Option<i64>, UsageState, i64)> = tx
                .query_row(
                    "SELECT user_id, subscription_id, state, reserved_usd_micros
                     FROM usage_events WHERE id=?1",
                    params![input.event_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            let Some((user_id, subscription_id, state, reserved_micros)) = row else {
                return Err(LedgerError::EventNotFound(input.event_id));
            };
            if state.is_settled() {
                return Ok(());
            }
            let reserved = Usd::from_micros(reserved_micros);

            let outcome = if subscription_id.is_some() {
                // Subscription quota: settle the event, leave the wallet alone.
                Reconciliation {
                    refund: Usd::ZERO,
                    extra_debit: Usd::ZERO,
                    committed_effective: effective_cost(reserved, input.committed_usd),
                }
            } else {
                ensure_balance_row(&tx, user_id, ts_ms)?;
                let balance = read_balance(&tx, user_id)?;
                reconcile(reserved, input.committed_usd, balance)
            };

            if outcome.extra_debit.micros() > 0 {
                debit_balance(&tx, user_id, outcome.extra_debit, ts_ms)?;
            }

            tx.execute(
                "UPDATE usage_events
                 SET state=?1, upstream_channel_id=?2,
                     input_tokens=?3, cached_input_tokens=?4,
                     output_tokens=?5, cached_output_tokens=?6,
                     committed_usd_micros=?7,
                     price_multiplier_micros=?8, price_multiplier_group_micros=?9,
                     price_multiplier_payment_micros=?10, multiplier_source=?11,
                     updated_at_ms=?12
                 WHERE id=?13 AND state=?14",
                params![
                    UsageState::Committed,
                    input.upstream_channel_id,
                    input.input_tokens,
                    input.cached_input_tokens,
                    input.output_tokens,
                    input.cached_output_tokens,
                    outcome.committed_effective.micros(),
                    input.price_multiplier.normalized().micros(),
                    input.price_multiplier_group.normalized().micros(),
                    input.price_multiplier_payment.normalized().micros(),
                    input.multiplier_source,
                    ts_ms,
                    input.event_id,
                    UsageState::Reserved,
                ],
            )?;

            if outcome.refund.micros() > 0 {
                credit_balance(&tx, user_id, outcome.refund, ts_ms)?;
            }

            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// Cancels a reservation before any billable work happened: full refund,
    /// `committed_usd` zero. No-op for unknown or already-settled events.
    pub async fn void(&self, event_id: i64) -> Result<()> {
        if event_id <= 0 {
            return Ok(());
        }
        let path = self.path.clone();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row: Option<(i64, Option<i64>, UsageState, i64)> = tx
                .query_row(
                    "SELECT user_id, subscription_id, state, reserved_usd_micros
                     FROM usage_events WHERE id=?1",
                    params![event_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            let Some((user_id, subscription_id, state, reserved_micros)) = row else {
                return Ok(());
            };
            if state.is_settled() {
                return Ok(());
            }

            tx.execute(
                "UPDATE usage_events
                 SET state=?1, committed_usd_micros=0, updated_at_ms=?2
                 WHERE id=?3 AND state=?4",
                params![UsageState::Void, ts_ms, event_id, UsageState::Reserved],
            )?;

            let reserved = Usd::from_micros(reserved_micros);
            if subscription_id.is_none() && reserved.micros() > 0 {
                ensure_balance_row(&tx, user_id, ts_ms)?;
                credit_balance(&tx, user_id, reserved, ts_ms)?;
            }

            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// Attaches transport metadata to an event in any state. Purely
    /// informational; the financial columns are never touched here, so racing
    /// with commit/void is last-write-wins on disjoint fields.
    pub async fn finalize(&self, input: FinalizeInput) -> Result<()> {
        if input.event_id <= 0 {
            return Err(LedgerError::InvalidInput("event_id must be positive"));
        }

        let endpoint = clamp_text(&input.endpoint, MAX_ENDPOINT_BYTES);
        let method = clamp_text(&input.method, MAX_METHOD_BYTES);
        let status_code = if (0..=999).contains(&input.status_code) {
            input.status_code
        } else {
            0
        };
        let latency_ms = input.latency_ms.max(0);
        let first_token_latency_ms = input.first_token_latency_ms.max(0).min(latency_ms);
        let error_class = input
            .error_class
            .as_deref()
            .and_then(|raw| clamp_text(raw, MAX_ERROR_CLASS_BYTES));
        let error_message = input
            .error_message
            .as_deref()
            .and_then(|raw| clamp_text(raw, MAX_ERROR_MESSAGE_BYTES));
        let request_bytes = input.request_bytes.max(0);
        let response_bytes = input.response_bytes.max(0);

        let path = self.path.clone();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "UPDATE usage_events
                 SET endpoint=?1, method=?2, status_code=?3,
                     latency_ms=?4, first_token_latency_ms=?5,
                     error_class=?6, error_message=?7,
                     upstream_channel_id=COALESCE(?8, upstream_channel_id),
                     upstream_endpoint_id=?9, upstream_credential_id=?10,
                     is_stream=?11, request_bytes=?12, response_bytes=?13,
                     updated_at_ms=?14
                 WHERE id=?15",
                params![
                    endpoint,
                    method,
                    status_code,
                    latency_ms,
                    first_token_latency_ms,
                    error_class,
                    error_message,
                    input.upstream_channel_id,
                    input.upstream_endpoint_id,
                    input.upstream_credential_id,
                    input.is_stream,
                    request_bytes,
                    response_bytes,
                    ts_ms,
                    input.event_id,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn event(&self, event_id: i64) -> Result<UsageEvent> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<UsageEvent> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let query = format!("SELECT {EVENT_COLUMNS} FROM usage_events WHERE id=?1");
            conn.query_row(&query, params![event_id], event_from_row)
                .optional()?
                .ok_or(LedgerError::EventNotFound(event_id))
        })
        .await?
    }

    /// Newest-first settled-event page for a user; in-flight reservations are
    /// excluded from listings.
    pub async fn list_events_for_user(
        &self,
        user_id: i64,
        limit: usize,
        before_id: Option<i64>,
    ) -> Result<Vec<UsageEvent>> {
        let path = self.path.clone();
        let limit = clamp_limit(limit);
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageEvent>> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut out = Vec::new();
            if let Some(before_id) = before_id.filter(|id| *id > 0) {
                let query = format!(
                    "SELECT {EVENT_COLUMNS} FROM usage_events
                     WHERE user_id=?1 AND state<>?2 AND id<?3
                     ORDER BY id DESC LIMIT ?4"
                );
                let mut stmt = conn.prepare(&query)?;
                let rows = stmt.query_map(
                    params![user_id, UsageState::Reserved, before_id, limit as i64],
                    event_from_row,
                )?;
                for row in rows {
                    out.push(row?);
                }
            } else {
                let query = format!(
                    "SELECT {EVENT_COLUMNS} FROM usage_events
                     WHERE user_id=?1 AND state<>?2
                     ORDER BY id DESC LIMIT ?3"
                );
                let mut stmt = conn.prepare(&query)?;
                let rows = stmt.query_map(
                    params![user_id, UsageState::Reserved, limit as i64],
                    event_from_row,
                )?;
                for row in rows {
                    out.push(row?);
                }
            }
            Ok(out)
        })
        .await?
    }

    /// Committed spend for a user since a point in time.
    pub async fn sum_committed(&self, user_id: i64, since_ms: i64) -> Result<Usd> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Usd> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let micros: i64 = conn.query_row(
                "SELECT COALESCE(SUM(committed_usd_micros), 0)
                 FROM usage_events
                 WHERE state=?1 AND user_id=?2 AND ts_ms >= ?3",
                params![UsageState::Committed, user_id, since_ms],
                |row| row.get(0),
            )?;
            Ok(Usd::from_micros(micros))
        })
        .await?
    }

    /// Committed plus still-live reserved spend for a user over
    /// `[since_ms, until_ms)`. Reservations whose deadline has already passed
    /// are excluded even if the reclaimer has not swept them yet.
    pub async fn usage_totals_for_user(
        &self,
        user_id: i64,
        since_ms: i64,
        until_ms: i64,
        now_ms: i64,
    ) -> Result<UsageTotals> {
        self.usage_totals_where(
            "user_id=?4",
            Some(user_id),
            None,
            since_ms,
            until_ms,
            now_ms,
        )
        .await
    }

    pub async fn usage_totals_for_subscription(
        &self,
        user_id: i64,
        subscription_id: i64,
        since_ms: i64,
        until_ms: i64,
        now_ms: i64,
    ) -> Result<UsageTotals> {
        self.usage_totals_where(
            "user_id=?4 AND subscription_id=?5",
            Some(user_id),
            Some(subscription_id),
            since_ms,
            until_ms,
            now_ms,
        )
        .await
    }

    pub async fn usage_totals_global(
        &self,
        since_ms: i64,
        until_ms: i64,
        now_ms: i64,
    ) -> Result<UsageTotals> {
        self.usage_totals_where("1=1", None, None, since_ms, until_ms, now_ms)
            .await
    }

    async fn usage_totals_where(
        &self,
        filter: &'static str,
        user_id: Option<i64>,
        subscription_id: Option<i64>,
        since_ms: i64,
        until_ms: i64,
        now_ms: i64,
    ) -> Result<UsageTotals> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<UsageTotals> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let query = format!(
                "SELECT
                   COALESCE(SUM(CASE WHEN state='committed' THEN committed_usd_micros ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN state='reserved' AND reserve_expires_at_ms >= ?1
                                 THEN reserved_usd_micros ELSE 0 END), 0)
                 FROM usage_events
                 WHERE ts_ms >= ?2 AND ts_ms < ?3 AND state IN ('committed', 'reserved')
                   AND ({filter})"
            );
            let (committed, reserved): (i64, i64) = match (user_id, subscription_id) {
                (Some(user_id), Some(subscription_id)) => conn.query_row(
                    &query,
                    params![now_ms, since_ms, until_ms, user_id, subscription_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?,
                (Some(user_id), None) => conn.query_row(
                    &query,
                    params![now_ms, since_ms, until_ms, user_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?,
                _ => conn.query_row(&query, params![now_ms, since_ms, until_ms], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?,
            };
            Ok(UsageTotals {
                committed_usd: Usd::from_micros(committed),
                reserved_usd: Usd::from_micros(reserved),
            })
        })
        .await?
    }
}

/// Outcome of reconciling a final cost against its reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Reconciliation {
    pub refund: Usd,
    pub extra_debit: Usd,
    pub committed_effective: Usd,
}

/// Zero final cost means "confirm as reserved".
pub(crate) fn effective_cost(reserved: Usd, final_cost: Usd) -> Usd {
    if final_cost.is_zero() { reserved } else { final_cost }
}

/// Total reconciliation: under-cost refunds the difference, over-cost debits
/// at most the remaining balance (never driving it negative) and records
/// what was actually covered.
pub(crate) fn reconcile(reserved: Usd, final_cost: Usd, balance: Usd) -> Reconciliation {
    let cost = effective_cost(reserved, final_cost);
    if cost < reserved {
        Reconciliation {
            refund: reserved.saturating_sub(cost),
            extra_debit: Usd::ZERO,
            committed_effective: cost,
        }
    } else if cost > reserved {
        let shortfall = cost.saturating_sub(reserved);
        let covered = shortfall.min(balance);
        let extra_debit = if covered.is_negative() { Usd::ZERO } else { covered };
        Reconciliation {
            refund: Usd::ZERO,
            extra_debit,
            committed_effective: reserved.saturating_add(extra_debit),
        }
    } else {
        Reconciliation {
            refund: Usd::ZERO,
            extra_debit: Usd::ZERO,
            committed_effective: cost,
        }
    }
}

pub(crate) const EVENT_COLUMNS: &str = "id, ts_ms, request_id, user_id, subscription_id, token_id, state, model, \
     upstream_channel_id, upstream_endpoint_id, upstream_credential_id, \
     input_tokens, cached_input_tokens, output_tokens, cached_output_tokens, \
     reserved_usd_micros, committed_usd_micros, \
     price_multiplier_micros, price_multiplier_group_micros, price_multiplier_payment_micros, \
     multiplier_source, reserve_expires_at_ms, endpoint, method, status_code, \
     latency_ms, first_token_latency_ms, error_class, error_message, \
     is_stream, request_bytes, response_bytes, rollup_applied_at_ms, \
     created_at_ms, updated_at_ms";

pub(crate) fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageEvent> {
    Ok(UsageEvent {
        id: row.get(0)?,
        ts_ms: row.get(1)?,
        request_id: row.get(2)?,
        user_id: row.get(3)?,
        subscription_id: row.get(4)?,
        token_id: row.get(5)?,
        state: row.get(6)?,
        model: row.get(7)?,
        upstream_channel_id: row.get(8)?,
        upstream_endpoint_id: row.get(9)?,
        upstream_credential_id: row.get(10)?,
        input_tokens: row.get(11)?,
        cached_input_tokens: row.get(12)?,
        output_tokens: row.get(13)?,
        cached_output_tokens: row.get(14)?,
        reserved_usd: Usd::from_micros(row.get(15)?),
        committed_usd: Usd::from_micros(row.get(16)?),
        price_multiplier: crate::money::Multiplier::from_micros(row.get(17)?),
        price_multiplier_group: crate::money::Multiplier::from_micros(row.get(18)?),
        price_multiplier_payment: crate::money::Multiplier::from_micros(row.get(19)?),
        multiplier_source: row.get(20)?,
        reserve_expires_at_ms: row.get(21)?,
        endpoint: row.get(22)?,
        method: row.get(23)?,
        status_code: row.get(24)?,
        latency_ms: row.get(25)?,
        first_token_latency_ms: row.get(26)?,
        error_class: row.get(27)?,
        error_message: row.get(28)?,
        is_stream: row.get::<_, i64>(29)? != 0,
        request_bytes: row.get(30)?,
        response_bytes: row.get(31)?,
        rollup_applied_at_ms: row.get(32)?,
        created_at_ms: row.get(33)?,
        updated_at_ms: row.get(34)?,
    })
}

pub(crate) fn ensure_balance_row(
    tx: &Transaction<'_>,
    user_id: i64,
    ts_ms: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO user_balances (user_id, usd_micros, created_at_ms, updated_at_ms)
         VALUES (?1, 0, ?2, ?2)",
        params![user_id, ts_ms],
    )?;
    Ok(())
}

pub(crate) fn read_balance(tx: &Transaction<'_>, user_id: i64) -> rusqlite::Result<Usd> {
    let micros: Option<i64> = tx
        .query_row(
            "SELECT usd_micros FROM user_balances WHERE user_id=?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(Usd::from_micros(micros.unwrap_or(0)))
}

pub(crate) fn debit_balance(
    tx: &Transaction<'_>,
    user_id: i64,
    amount: Usd,
    ts_ms: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE user_balances
         SET usd_micros = usd_micros - ?2, updated_at_ms = ?3
         WHERE user_id = ?1",
        params![user_id, amount.micros(), ts_ms],
    )?;
    Ok(())
}

pub(crate) fn credit_balance(
    tx: &Transaction<'_>,
    user_id: i64,
    amount: Usd,
    ts_ms: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE user_balances
         SET usd_micros = usd_micros + ?2, updated_at_ms = ?3
         WHERE user_id = ?1",
        params![user_id, amount.micros(), ts_ms],
    )?;
    Ok(())
}

fn clamp_limit(limit: usize) -> usize {
    if limit == 0 || limit > MAX_LIST_LIMIT {
        DEFAULT_LIST_LIMIT
    } else {
        limit
    }
}

fn clamp_text(raw: &str, max_bytes: usize) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() <= max_bytes {
        return Some(trimmed.to_string());
    }
    let mut end = max_bytes;
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    Some(trimmed[..end].to_string())
}

fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn init_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_balances (
            user_id INTEGER PRIMARY KEY NOT NULL,
            usd_micros INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_ms INTEGER NOT NULL,
            request_id TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            subscription_id INTEGER,
            token_id INTEGER NOT NULL,
            state TEXT NOT NULL,
            model TEXT,
            upstream_channel_id INTEGER,
            upstream_endpoint_id INTEGER,
            upstream_credential_id INTEGER,
            input_tokens INTEGER,
            cached_input_tokens INTEGER,
            output_tokens INTEGER,
            cached_output_tokens INTEGER,
            reserved_usd_micros INTEGER NOT NULL DEFAULT 0,
            committed_usd_micros INTEGER NOT NULL DEFAULT 0,
            price_multiplier_micros INTEGER NOT NULL DEFAULT 1000000,
            price_multiplier_group_micros INTEGER NOT NULL DEFAULT 1000000,
            price_multiplier_payment_micros INTEGER NOT NULL DEFAULT 1000000,
            multiplier_source TEXT,
            reserve_expires_at_ms INTEGER NOT NULL,
            endpoint TEXT,
            method TEXT,
            status_code INTEGER NOT NULL DEFAULT 0,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            first_token_latency_ms INTEGER NOT NULL DEFAULT 0,
            error_class TEXT,
            error_message TEXT,
            is_stream INTEGER NOT NULL DEFAULT 0,
            request_bytes INTEGER NOT NULL DEFAULT 0,
            response_bytes INTEGER NOT NULL DEFAULT 0,
            rollup_applied_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_events_user_ts
            ON usage_events(user_id, ts_ms);
        CREATE INDEX IF NOT EXISTS idx_usage_events_state_expiry
            ON usage_events(state, reserve_expires_at_ms);
        CREATE INDEX IF NOT EXISTS idx_usage_events_ts
            ON usage_events(ts_ms);

        CREATE TABLE IF NOT EXISTS usage_event_details (
            usage_event_id INTEGER PRIMARY KEY NOT NULL,
            downstream_request_body TEXT,
            upstream_request_body TEXT,
            upstream_response_body TEXT,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

pub(crate) fn open_connection(path: PathBuf) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
