use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use crate::config::RollupShardConfig;
use crate::error::{LedgerError, Result};
use crate::event::UsageState;
use crate::money::Usd;
use crate::store::{LedgerStore, init_schema, now_millis, open_connection};

pub const HOUR_MS: i64 = 3_600_000;
pub const DAY_MS: i64 = 86_400_000;

/// Pre-aggregated counters for one bucket, or the merge of many.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupStats {
    pub requests_total: i64,
    pub committed_usd: Usd,
    pub input_tokens: i64,
    pub cached_input_tokens: i64,
    pub output_tokens: i64,
    pub cached_output_tokens: i64,
    pub first_token_latency_ms_sum: i64,
    pub first_token_samples: i64,
    pub decode_latency_ms_sum: i64,
}

impl RollupStats {
    pub fn merge(&mut self, other: RollupStats) {
        self.requests_total += other.requests_total;
        self.committed_usd = self.committed_usd.saturating_add(other.committed_usd);
        self.input_tokens += other.input_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_output_tokens += other.cached_output_tokens;
        self.first_token_latency_ms_sum += other.first_token_latency_ms_sum;
        self.first_token_samples += other.first_token_samples;
        self.decode_latency_ms_sum += other.decode_latency_ms_sum;
    }

    /// Mean time to first token across sampled streaming requests.
    pub fn avg_first_token_latency_ms(&self) -> Option<i64> {
        if self.first_token_samples > 0 {
            Some(self.first_token_latency_ms_sum / self.first_token_samples)
        } else {
            None
        }
    }
}

/// One half of a window split at the shard cutover.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HourSegment {
    pub start_ms: i64,
    pub end_ms: i64,
    pub sharded: bool,
}

/// Splits `[since_ms, until_ms)` into the bucket ranges each hour table can
/// hold rows for.
///
/// Events partition by their own timestamp, so a cutover that falls mid-hour
/// leaves the straddling bucket present in both tables; the two ranges then
/// overlap by that one bucket and the tables' disjoint contents keep the sum
/// correct. A cutover on an hour boundary splits cleanly.
pub fn hour_segments(
    since_ms: i64,
    until_ms: i64,
    shards: Option<RollupShardConfig>,
) -> Vec<HourSegment> {
    if since_ms >= until_ms {
        return Vec::new();
    }
    let Some(config) = shards else {
        return vec![HourSegment {
            start_ms: since_ms,
            end_ms: until_ms,
            sharded: false,
        }];
    };
    let floor = hour_bucket(config.cutover_at_ms);
    let ceil = if config.cutover_at_ms == floor {
        floor
    } else {
        floor + HOUR_MS
    };

    let mut segments = Vec::new();
    let unsharded_end = until_ms.min(ceil);
    if since_ms < unsharded_end {
        segments.push(HourSegment {
            start_ms: since_ms,
            end_ms: unsharded_end,
            sharded: false,
        });
    }
    let sharded_start = since_ms.max(floor);
    if sharded_start < until_ms {
        segments.push(HourSegment {
            start_ms: sharded_start,
            end_ms: until_ms,
            sharded: true,
        });
    }
    segments
}

pub fn hour_bucket(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(HOUR_MS)
}

pub fn day_bucket(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(DAY_MS)
}

/// Queries over windows shorter than an hour lose too much edge precision to
/// pre-aggregated buckets; answer those from raw events instead.
pub fn should_use_rollups(since_ms: i64, until_ms: i64) -> bool {
    until_ms.saturating_sub(since_ms) >= HOUR_MS
}

#[derive(Clone, Debug)]
struct Contribution {
    ts_ms: i64,
    user_id: i64,
    model: String,
    channel_id: Option<i64>,
    stats: RollupStats,
}

impl LedgerStore {
    /// Creates the rollup tables. Until this runs, rollups stay disabled and
    /// every apply/read quietly reports nothing.
    pub async fn init_rollups(&self) -> Result<()> {
        let path = self.path().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            init_rollup_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Folds one event into every bucket shape, exactly once.
    ///
    /// The claim (`rollup_applied_at_ms IS NULL`) and the upserts share a
    /// transaction, so a replay after a crash re-applies cleanly and a replay
    /// after success is a no-op. The fold takes the event as it stands:
    /// every state counts as one request, spend only when committed, so an
    /// abandoned reservation still reaches the buckets no matter who
    /// settles it later. Returns whether this call did the fold.
    pub async fn apply_rollups(&self, event_id: i64) -> Result<bool> {
        let path = self.path().to_path_buf();
        let shards = self.shard_config();
        let now_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            if !rollups_enabled(&conn)? {
                return Ok(false);
            }

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row: Option<(i64, i64, UsageState, Option<String>, Option<i64>, i64,
                Option<i64>, Option<i64>, Option<i64>, Option<i64>, i64, i64)> = tx
                .query_row(
                    "SELECT ts_ms, user_id, state, model, upstream_channel_id,
                            committed_usd_micros, input_tokens, cached_input_tokens,
                            output_tokens, cached_output_tokens,
                            latency_ms, first_token_latency_ms
                     FROM usage_events WHERE id=?1",
                    params![event_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                            row.get(10)?,
                            row.get(11)?,
                        ))
                    },
                )
                .optional()?;
            let Some((
                ts_ms,
                user_id,
                state,
                model,
                channel_id,
                committed_micros,
                input_tokens,
                cached_input_tokens,
                output_tokens,
                cached_output_tokens,
                latency_ms,
                first_token_latency_ms,
            )) = row
            else {
                return Err(LedgerError::EventNotFound(event_id));
            };

            let claimed = tx.execute(
                "UPDATE usage_events SET rollup_applied_at_ms=?1
                 WHERE id=?2 AND rollup_applied_at_ms IS NULL",
                params![now_ms, event_id],
            )?;
            if claimed == 0 {
                return Ok(false);
            }

            let committed = if state == UsageState::Committed {
                Usd::from_micros(committed_micros)
            } else {
                Usd::ZERO
            };
            let first_token_sampled = first_token_latency_ms > 0;
            let contribution = Contribution {
                ts_ms,
                user_id,
                model: model.unwrap_or_default(),
                channel_id,
                stats: RollupStats {
                    requests_total: 1,
                    committed_usd: committed,
                    input_tokens: input_tokens.unwrap_or(0),
                    cached_input_tokens: cached_input_tokens.unwrap_or(0),
                    output_tokens: output_tokens.unwrap_or(0),
                    cached_output_tokens: cached_output_tokens.unwrap_or(0),
                    first_token_latency_ms_sum: if first_token_sampled {
                        first_token_latency_ms
                    } else {
                        0
                    },
                    first_token_samples: i64::from(first_token_sampled),
                    decode_latency_ms_sum: (latency_ms - first_token_latency_ms).max(0),
                },
            };

            upsert_hour_buckets(&tx, &contribution, shards, event_id, now_ms)?;
            upsert_day_buckets(&tx, &contribution, now_ms)?;

            tx.commit()?;
            Ok(true)
        })
        .await?
    }

    /// Fleet-wide totals for `[since_ms, until_ms)`, summing the unsharded
    /// and sharded hour tables across the cutover.
    pub async fn global_hour_stats(&self, since_ms: i64, until_ms: i64) -> Result<RollupStats> {
        let path = self.path().to_path_buf();
        let segments = hour_segments(since_ms, until_ms, self.shard_config());
        tokio::task::spawn_blocking(move || -> Result<RollupStats> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            if !rollups_enabled(&conn)? {
                return Ok(RollupStats::default());
            }
            let mut total = RollupStats::default();
            for segment in segments {
                let table = if segment.sharded {
                    "usage_rollup_global_hour_sharded"
                } else {
                    "usage_rollup_global_hour"
                };
                let query = format!(
                    "SELECT {STATS_SUMS} FROM {table}
                     WHERE bucket_start_ms >= ?1 AND bucket_start_ms < ?2"
                );
                total.merge(conn.query_row(
                    &query,
                    params![segment.start_ms, segment.end_ms],
                    stats_from_row,
                )?);
            }
            Ok(total)
        })
        .await?
    }

    /// Per-upstream-channel totals across the cutover. Events settled
    /// without an upstream attribution skip the channel shape entirely.
    pub async fn channel_hour_stats(
        &self,
        channel_id: i64,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<RollupStats> {
        let path = self.path().to_path_buf();
        let segments = hour_segments(since_ms, until_ms, self.shard_config());
        tokio::task::spawn_blocking(move || -> Result<RollupStats> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            if !rollups_enabled(&conn)? {
                return Ok(RollupStats::default());
            }
            let mut total = RollupStats::default();
            for segment in segments {
                let table = if segment.sharded {
                    "usage_rollup_channel_hour_sharded"
                } else {
                    "usage_rollup_channel_hour"
                };
                let query = format!(
                    "SELECT {STATS_SUMS} FROM {table}
                     WHERE upstream_channel_id = ?1
                       AND bucket_start_ms >= ?2 AND bucket_start_ms < ?3"
                );
                total.merge(conn.query_row(
                    &query,
                    params![channel_id, segment.start_ms, segment.end_ms],
                    stats_from_row,
                )?);
            }
            Ok(total)
        })
        .await?
    }

    /// Per-hour time series, ascending by bucket start. Shards of the same
    /// bucket collapse into one point.
    pub async fn global_hour_series(
        &self,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<Vec<(i64, RollupStats)>> {
        let path = self.path().to_path_buf();
        let segments = hour_segments(since_ms, until_ms, self.shard_config());
        tokio::task::spawn_blocking(move || -> Result<Vec<(i64, RollupStats)>> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            if !rollups_enabled(&conn)? {
                return Ok(Vec::new());
            }
            // Both representations can hold the bucket straddling the
            // cutover; merge by bucket start.
            let mut series: std::collections::BTreeMap<i64, RollupStats> =
                std::collections::BTreeMap::new();
            for segment in segments {
                let table = if segment.sharded {
                    "usage_rollup_global_hour_sharded"
                } else {
                    "usage_rollup_global_hour"
                };
                let query = format!(
                    "SELECT bucket_start_ms, {STATS_SUMS} FROM {table}
                     WHERE bucket_start_ms >= ?1 AND bucket_start_ms < ?2
                     GROUP BY bucket_start_ms"
                );
                let mut stmt = conn.prepare(&query)?;
                let rows = stmt.query_map(params![segment.start_ms, segment.end_ms], |row| {
                    let bucket: i64 = row.get(0)?;
                    let stats = RollupStats {
                        requests_total: row.get(1)?,
                        committed_usd: Usd::from_micros(row.get(2)?),
                        input_tokens: row.get(3)?,
                        cached_input_tokens: row.get(4)?,
                        output_tokens: row.get(5)?,
                        cached_output_tokens: row.get(6)?,
                        first_token_latency_ms_sum: row.get(7)?,
                        first_token_samples: row.get(8)?,
                        decode_latency_ms_sum: row.get(9)?,
                    };
                    Ok((bucket, stats))
                })?;
                for row in rows {
                    let (bucket, stats) = row?;
                    series.entry(bucket).or_default().merge(stats);
                }
            }
            Ok(series.into_iter().collect())
        })
        .await?
    }

    /// Per-user daily totals; day buckets are never sharded.
    pub async fn user_day_stats(
        &self,
        user_id: i64,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<RollupStats> {
        let path = self.path().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<RollupStats> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            if !rollups_enabled(&conn)? {
                return Ok(RollupStats::default());
            }
            conn.query_row(
                &format!(
                    "SELECT {DAY_STATS_SUMS} FROM usage_rollup_user_day
                     WHERE user_id = ?1 AND day_start_ms >= ?2 AND day_start_ms < ?3"
                ),
                params![user_id, since_ms, until_ms],
                day_stats_from_row,
            )
            .map_err(Into::into)
        })
        .await?
    }

    /// Per-model daily totals; events settled without a model land under "".
    pub async fn model_day_stats(
        &self,
        model: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<RollupStats> {
        let path = self.path().to_path_buf();
        let model = model.to_string();
        tokio::task::spawn_blocking(move || -> Result<RollupStats> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            if !rollups_enabled(&conn)? {
                return Ok(RollupStats::default());
            }
            conn.query_row(
                &format!(
                    "SELECT {DAY_STATS_SUMS} FROM usage_rollup_model_day
                     WHERE model = ?1 AND day_start_ms >= ?2 AND day_start_ms < ?3"
                ),
                params![model, since_ms, until_ms],
                day_stats_from_row,
            )
            .map_err(Into::into)
        })
        .await?
    }
}

const STATS_SUMS: &str = "COALESCE(SUM(requests_total), 0), COALESCE(SUM(committed_usd_micros), 0), \
     COALESCE(SUM(input_tokens), 0), COALESCE(SUM(cached_input_tokens), 0), \
     COALESCE(SUM(output_tokens), 0), COALESCE(SUM(cached_output_tokens), 0), \
     COALESCE(SUM(first_token_latency_ms_sum), 0), COALESCE(SUM(first_token_samples), 0), \
     COALESCE(SUM(decode_latency_ms_sum), 0)";

const DAY_STATS_SUMS: &str = "COALESCE(SUM(requests_total), 0), COALESCE(SUM(committed_usd_micros), 0), \
     COALESCE(SUM(input_tokens), 0), COALESCE(SUM(cached_input_tokens), 0), \
     COALESCE(SUM(output_tokens), 0), COALESCE(SUM(cached_output_tokens), 0)";

fn stats_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RollupStats> {
    Ok(RollupStats {
        requests_total: row.get(0)?,
        committed_usd: Usd::from_micros(row.get(1)?),
        input_tokens: row.get(2)?,
        cached_input_tokens: row.get(3)?,
        output_tokens: row.get(4)?,
        cached_output_tokens: row.get(5)?,
        first_token_latency_ms_sum: row.get(6)?,
        first_token_samples: row.get(7)?,
        decode_latency_ms_sum: row.get(8)?,
    })
}

fn day_stats_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RollupStats> {
    Ok(RollupStats {
        requests_total: row.get(0)?,
        committed_usd: Usd::from_micros(row.get(1)?),
        input_tokens: row.get(2)?,
        cached_input_tokens: row.get(3)?,
        output_tokens: row.get(4)?,
        cached_output_tokens: row.get(5)?,
        ..Default::default()
    })
}

fn rollups_enabled(conn: &Connection) -> rusqlite::Result<bool> {
    let present: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='usage_rollup_global_hour'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(present.is_some())
}

fn upsert_hour_buckets(
    tx: &Transaction<'_>,
    c: &Contribution,
    shards: Option<RollupShardConfig>,
    event_id: i64,
    now_ms: i64,
) -> rusqlite::Result<()> {
    let bucket = hour_bucket(c.ts_ms);
    let sharded = shards.filter(|config| config.is_after_cutover(c.ts_ms));
    if let Some(config) = sharded {
        let shard = config.shard_for(event_id);
        tx.execute(
            "INSERT INTO usage_rollup_global_hour_sharded (
                bucket_start_ms, shard, requests_total, committed_usd_micros,
                input_tokens, cached_input_tokens, output_tokens, cached_output_tokens,
                first_token_latency_ms_sum, first_token_samples, decode_latency_ms_sum,
                updated_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(bucket_start_ms, shard) DO UPDATE SET
                requests_total = requests_total + excluded.requests_total,
                committed_usd_micros = committed_usd_micros + excluded.committed_usd_micros,
                input_tokens = input_tokens + excluded.input_tokens,
                cached_input_tokens = cached_input_tokens + excluded.cached_input_tokens,
                output_tokens = output_tokens + excluded.output_tokens,
                cached_output_tokens = cached_output_tokens + excluded.cached_output_tokens,
                first_token_latency_ms_sum = first_token_latency_ms_sum + excluded.first_token_latency_ms_sum,
                first_token_samples = first_token_samples + excluded.first_token_samples,
                decode_latency_ms_sum = decode_latency_ms_sum + excluded.decode_latency_ms_sum,
                updated_at_ms = excluded.updated_at_ms",
            params![
                bucket,
                shard,
                c.stats.requests_total,
                c.stats.committed_usd.micros(),
                c.stats.input_tokens,
                c.stats.cached_input_tokens,
                c.stats.output_tokens,
                c.stats.cached_output_tokens,
                c.stats.first_token_latency_ms_sum,
                c.stats.first_token_samples,
                c.stats.decode_latency_ms_sum,
                now_ms,
            ],
        )?;
        let Some(channel_id) = c.channel_id else {
            return Ok(());
        };
        tx.execute(
            "INSERT INTO usage_rollup_channel_hour_sharded (
                bucket_start_ms, upstream_channel_id, shard, requests_total, committed_usd_micros,
                input_tokens, cached_input_tokens, output_tokens, cached_output_tokens,
                first_token_latency_ms_sum, first_token_samples, decode_latency_ms_sum,
                updated_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(bucket_start_ms, upstream_channel_id, shard) DO UPDATE SET
                requests_total = requests_total + excluded.requests_total,
                committed_usd_micros = committed_usd_micros + excluded.committed_usd_micros,
                input_tokens = input_tokens + excluded.input_tokens,
                cached_input_tokens = cached_input_tokens + excluded.cached_input_tokens,
                output_tokens = output_tokens + excluded.output_tokens,
                cached_output_tokens = cached_output_tokens + excluded.cached_output_tokens,
                first_token_latency_ms_sum = first_token_latency_ms_sum + excluded.first_token_latency_ms_sum,
                first_token_samples = first_token_samples + excluded.first_token_samples,
                decode_latency_ms_sum = decode_latency_ms_sum + excluded.decode_latency_ms_sum,
                updated_at_ms = excluded.updated_at_ms",
            params![
                bucket,
                channel_id,
                shard,
                c.stats.requests_total,
                c.stats.committed_usd.micros(),
                c.stats.input_tokens,
                c.stats.cached_input_tokens,
                c.stats.output_tokens,
                c.stats.cached_output_tokens,
                c.stats.first_token_latency_ms_sum,
                c.stats.first_token_samples,
                c.stats.decode_latency_ms_sum,
                now_ms,
            ],
        )?;
        return Ok(());
    }

    tx.execute(
        "INSERT INTO usage_rollup_global_hour (
            bucket_start_ms, requests_total, committed_usd_micros,
            input_tokens, cached_input_tokens, output_tokens, cached_output_tokens,
            first_token_latency_ms_sum, first_token_samples, decode_latency_ms_sum,
            updated_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(bucket_start_ms) DO UPDATE SET
            requests_total = requests_total + excluded.requests_total,
            committed_usd_micros = committed_usd_micros + excluded.committed_usd_micros,
            input_tokens = input_tokens + excluded.input_tokens,
            cached_input_tokens = cached_input_tokens + excluded.cached_input_tokens,
            output_tokens = output_tokens + excluded.output_tokens,
            cached_output_tokens = cached_output_tokens + excluded.cached_output_tokens,
            first_token_latency_ms_sum = first_token_latency_ms_sum + excluded.first_token_latency_ms_sum,
            first_token_samples = first_token_samples + excluded.first_token_samples,
            decode_latency_ms_sum = decode_latency_ms_sum + excluded.decode_latency_ms_sum,
            updated_at_ms = excluded.updated_at_ms",
        params![
            bucket,
            c.stats.requests_total,
            c.stats.committed_usd.micros(),
            c.stats.input_tokens,
            c.stats.cached_input_tokens,
            c.stats.output_tokens,
            c.stats.cached_output_tokens,
            c.stats.first_token_latency_ms_sum,
            c.stats.first_token_samples,
            c.stats.decode_latency_ms_sum,
            now_ms,
        ],
    )?;
    let Some(channel_id) = c.channel_id else {
        return Ok(());
    };
    tx.execute(
        "INSERT INTO usage_rollup_channel_hour (
            bucket_start_ms, upstream_channel_id, requests_total, committed_usd_micros,
            input_tokens, cached_input_tokens, output_tokens, cached_output_tokens,
            first_token_latency_ms_sum, first_token_samples, decode_latency_ms_sum,
            updated_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(bucket_start_ms, upstream_channel_id) DO UPDATE SET
            requests_total = requests_total + excluded.requests_total,
            committed_usd_micros = committed_usd_micros + excluded.committed_usd_micros,
            input_tokens = input_tokens + excluded.input_tokens,
            cached_input_tokens = cached_input_tokens + excluded.cached_input_tokens,
            output_tokens = output_tokens + excluded.output_tokens,
            cached_output_tokens = cached_output_tokens + excluded.cached_output_tokens,
            first_token_latency_ms_sum = first_token_latency_ms_sum + excluded.first_token_latency_ms_sum,
            first_token_samples = first_token_samples + excluded.first_token_samples,
            decode_latency_ms_sum = decode_latency_ms_sum + excluded.decode_latency_ms_sum,
            updated_at_ms = excluded.updated_at_ms",
        params![
            bucket,
            channel_id,
            c.stats.requests_total,
            c.stats.committed_usd.micros(),
            c.stats.input_tokens,
            c.stats.cached_input_tokens,
            c.stats.output_tokens,
            c.stats.cached_output_tokens,
            c.stats.first_token_latency_ms_sum,
            c.stats.first_token_samples,
            c.stats.decode_latency_ms_sum,
            now_ms,
        ],
    )?;
    Ok(())
}

fn upsert_day_buckets(
    tx: &Transaction<'_>,
    c: &Contribution,
    now_ms: i64,
) -> rusqlite::Result<()> {
    let bucket = day_bucket(c.ts_ms);
    tx.execute(
        "INSERT INTO usage_rollup_user_day (
            day_start_ms, user_id, requests_total, committed_usd_micros,
            input_tokens, cached_input_tokens, output_tokens, cached_output_tokens,
            updated_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(day_start_ms, user_id) DO UPDATE SET
            requests_total = requests_total + excluded.requests_total,
            committed_usd_micros = committed_usd_micros + excluded.committed_usd_micros,
            input_tokens = input_tokens + excluded.input_tokens,
            cached_input_tokens = cached_input_tokens + excluded.cached_input_tokens,
            output_tokens = output_tokens + excluded.output_tokens,
            cached_output_tokens = cached_output_tokens + excluded.cached_output_tokens,
            updated_at_ms = excluded.updated_at_ms",
        params![
            bucket,
            c.user_id,
            c.stats.requests_total,
            c.stats.committed_usd.micros(),
            c.stats.input_tokens,
            c.stats.cached_input_tokens,
            c.stats.output_tokens,
            c.stats.cached_output_tokens,
            now_ms,
        ],
    )?;
    tx.execute(
        "INSERT INTO usage_rollup_model_day (
            day_start_ms, model, requests_total, committed_usd_micros,
            input_tokens, cached_input_tokens, output_tokens, cached_output_tokens,
            updated_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(day_start_ms, model) DO UPDATE SET
            requests_total = requests_total + excluded.requests_total,
            committed_usd_micros = committed_usd_micros + excluded.committed_usd_micros,
            input_tokens = input_tokens + excluded.input_tokens,
            cached_input_tokens = cached_input_tokens + excluded.cached_input_tokens,
            output_tokens = output_tokens + excluded.output_tokens,
            cached_output_tokens = cached_output_tokens + excluded.cached_output_tokens,
            updated_at_ms = excluded.updated_at_ms",
        params![
            bucket,
            c.model,
            c.stats.requests_total,
            c.stats.committed_usd.micros(),
            c.stats.input_tokens,
            c.stats.cached_input_tokens,
            c.stats.output_tokens,
            c.stats.cached_output_tokens,
            now_ms,
        ],
    )?;
    Ok(())
}

fn init_rollup_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS usage_rollup_global_hour (
            bucket_start_ms INTEGER PRIMARY KEY NOT NULL,
            requests_total INTEGER NOT NULL DEFAULT 0,
            committed_usd_micros INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            cached_input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cached_output_tokens INTEGER NOT NULL DEFAULT 0,
            first_token_latency_ms_sum INTEGER NOT NULL DEFAULT 0,
            first_token_samples INTEGER NOT NULL DEFAULT 0,
            decode_latency_ms_sum INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_rollup_global_hour_sharded (
            bucket_start_ms INTEGER NOT NULL,
            shard INTEGER NOT NULL,
            requests_total INTEGER NOT NULL DEFAULT 0,
            committed_usd_micros INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            cached_input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cached_output_tokens INTEGER NOT NULL DEFAULT 0,
            first_token_latency_ms_sum INTEGER NOT NULL DEFAULT 0,
            first_token_samples INTEGER NOT NULL DEFAULT 0,
            decode_latency_ms_sum INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (bucket_start_ms, shard)
        );

        CREATE TABLE IF NOT EXISTS usage_rollup_channel_hour (
            bucket_start_ms INTEGER NOT NULL,
            upstream_channel_id INTEGER NOT NULL,
            requests_total INTEGER NOT NULL DEFAULT 0,
            committed_usd_micros INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            cached_input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cached_output_tokens INTEGER NOT NULL DEFAULT 0,
            first_token_latency_ms_sum INTEGER NOT NULL DEFAULT 0,
            first_token_samples INTEGER NOT NULL DEFAULT 0,
            decode_latency_ms_sum INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (bucket_start_ms, upstream_channel_id)
        );

        CREATE TABLE IF NOT EXISTS usage_rollup_channel_hour_sharded (
            bucket_start_ms INTEGER NOT NULL,
            upstream_channel_id INTEGER NOT NULL,
            shard INTEGER NOT NULL,
            requests_total INTEGER NOT NULL DEFAULT 0,
            committed_usd_micros INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            cached_input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cached_output_tokens INTEGER NOT NULL DEFAULT 0,
            first_token_latency_ms_sum INTEGER NOT NULL DEFAULT 0,
            first_token_samples INTEGER NOT NULL DEFAULT 0,
            decode_latency_ms_sum INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (bucket_start_ms, upstream_channel_id, shard)
        );

        CREATE TABLE IF NOT EXISTS usage_rollup_user_day (
            day_start_ms INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            requests_total INTEGER NOT NULL DEFAULT 0,
            committed_usd_micros INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            cached_input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cached_output_tokens INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (day_start_ms, user_id)
        );

        CREATE TABLE IF NOT EXISTS usage_rollup_model_day (
            day_start_ms INTEGER NOT NULL,
            model TEXT NOT NULL,
            requests_total INTEGER NOT NULL DEFAULT 0,
            committed_usd_micros INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            cached_input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cached_output_tokens INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (day_start_ms, model)
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::{CommitInput, FinalizeInput, ReserveInput};

    fn usd(raw: &str) -> Usd {
        Usd::parse(raw).expect("usd literal")
    }

    fn store() -> (tempfile::TempDir, LedgerStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LedgerStore::new(dir.path().join("ledger.sqlite"));
        (dir, store)
    }

    async fn settled_event(store: &LedgerStore, user_id: i64, cost: &str) -> i64 {
        store.top_up(user_id, usd("100.00")).await.expect("top up");
        let event_id = store
            .reserve(ReserveInput {
                request_id: "req".to_string(),
                user_id,
                token_id: 1,
                subscription_id: None,
                model: Some("gpt-test".to_string()),
                reserved_usd: usd(cost),
                ttl: Duration::from_secs(3600),
            })
            .await
            .expect("reserve");
        store
            .commit(CommitInput {
                event_id,
                committed_usd: usd(cost),
                upstream_channel_id: Some(3),
                input_tokens: Some(100),
                output_tokens: Some(50),
                ..Default::default()
            })
            .await
            .expect("commit");
        event_id
    }

    #[test]
    fn bucket_math_floors_to_utc_boundaries() {
        assert_eq!(hour_bucket(0), 0);
        assert_eq!(hour_bucket(HOUR_MS - 1), 0);
        assert_eq!(hour_bucket(HOUR_MS), HOUR_MS);
        assert_eq!(day_bucket(DAY_MS + HOUR_MS), DAY_MS);
    }

    #[test]
    fn aligned_cutover_splits_the_window_cleanly() {
        let config = RollupShardConfig::new(4, HOUR_MS).expect("config");
        assert_eq!(
            hour_segments(0, 3 * HOUR_MS, Some(config)),
            vec![
                HourSegment { start_ms: 0, end_ms: HOUR_MS, sharded: false },
                HourSegment { start_ms: HOUR_MS, end_ms: 3 * HOUR_MS, sharded: true },
            ]
        );
        assert_eq!(
            hour_segments(HOUR_MS, 3 * HOUR_MS, Some(config)),
            vec![HourSegment { start_ms: HOUR_MS, end_ms: 3 * HOUR_MS, sharded: true }]
        );
        assert_eq!(
            hour_segments(0, HOUR_MS, Some(config)),
            vec![HourSegment { start_ms: 0, end_ms: HOUR_MS, sharded: false }]
        );
        assert_eq!(
            hour_segments(0, 2 * HOUR_MS, None),
            vec![HourSegment { start_ms: 0, end_ms: 2 * HOUR_MS, sharded: false }]
        );
        assert!(hour_segments(HOUR_MS, HOUR_MS, Some(config)).is_empty());
    }

    #[test]
    fn midhour_cutover_keeps_the_straddling_bucket_in_both_ranges() {
        let config = RollupShardConfig::new(4, HOUR_MS + 1_000).expect("config");
        assert_eq!(
            hour_segments(0, 3 * HOUR_MS, Some(config)),
            vec![
                HourSegment { start_ms: 0, end_ms: 2 * HOUR_MS, sharded: false },
                HourSegment { start_ms: HOUR_MS, end_ms: 3 * HOUR_MS, sharded: true },
            ]
        );
    }

    #[test]
    fn short_windows_bypass_rollups() {
        assert!(!should_use_rollups(0, HOUR_MS - 1));
        assert!(should_use_rollups(0, HOUR_MS));
    }

    #[tokio::test]
    async fn apply_is_idempotent_and_feeds_every_bucket_shape() {
        let (_dir, store) = store();
        store.init().await.expect("init");
        store.init_rollups().await.expect("init rollups");

        let event_id = settled_event(&store, 1, "0.40").await;
        assert!(store.apply_rollups(event_id).await.expect("first apply"));
        assert!(!store.apply_rollups(event_id).await.expect("second apply"));

        let stats = store
            .global_hour_stats(0, i64::MAX)
            .await
            .expect("global stats");
        assert_eq!(stats.requests_total, 1);
        assert_eq!(stats.committed_usd, usd("0.40"));
        assert_eq!(stats.input_tokens, 100);
        assert_eq!(stats.output_tokens, 50);

        let channel = store
            .channel_hour_stats(3, 0, i64::MAX)
            .await
            .expect("channel stats");
        assert_eq!(channel.requests_total, 1);

        let user = store.user_day_stats(1, 0, i64::MAX).await.expect("user stats");
        assert_eq!(user.committed_usd, usd("0.40"));

        let model = store
            .model_day_stats("gpt-test", 0, i64::MAX)
            .await
            .expect("model stats");
        assert_eq!(model.requests_total, 1);
    }

    #[tokio::test]
    async fn applies_accumulate_across_events() {
        let (_dir, store) = store();
        store.init().await.expect("init");
        store.init_rollups().await.expect("init rollups");

        let e1 = settled_event(&store, 1, "0.40").await;
        let e2 = settled_event(&store, 1, "0.25").await;
        assert!(store.apply_rollups(e1).await.expect("apply e1"));
        assert!(store.apply_rollups(e2).await.expect("apply e2"));

        let stats = store
            .global_hour_stats(0, i64::MAX)
            .await
            .expect("global stats");
        assert_eq!(stats.requests_total, 2);
        assert_eq!(stats.committed_usd, usd("0.65"));
    }

    #[tokio::test]
    async fn missing_tables_mean_disabled_not_broken() {
        let (_dir, store) = store();
        store.init().await.expect("init");
        let event_id = settled_event(&store, 1, "0.10").await;

        assert!(!store.apply_rollups(event_id).await.expect("apply"));
        let stats = store.global_hour_stats(0, i64::MAX).await.expect("stats");
        assert_eq!(stats, RollupStats::default());
        // The claim column stays untouched when nothing was folded.
        assert_eq!(
            store.event(event_id).await.expect("event").rollup_applied_at_ms,
            None
        );
    }

    #[tokio::test]
    async fn abandoned_reservations_still_reach_the_buckets() {
        let (_dir, store) = store();
        store.init().await.expect("init");
        store.init_rollups().await.expect("init rollups");
        store.top_up(1, usd("1.00")).await.expect("top up");

        let event_id = store
            .reserve(ReserveInput {
                request_id: "req".to_string(),
                user_id: 1,
                token_id: 1,
                subscription_id: None,
                model: None,
                reserved_usd: usd("0.10"),
                ttl: Duration::from_millis(1),
            })
            .await
            .expect("reserve");

        // Caller crashes right after reserve: the fold happens now, counting
        // the request with zero spend, and the later expiry changes nothing.
        assert!(store.apply_rollups(event_id).await.expect("apply reserved"));
        assert!(store
            .event(event_id)
            .await
            .expect("event")
            .rollup_applied_at_ms
            .is_some());

        let swept = store
            .sweep_expired(now_millis() + 60_000)
            .await
            .expect("sweep");
        assert_eq!(swept, 1);
        assert!(!store.apply_rollups(event_id).await.expect("replay"));

        let stats = store.global_hour_stats(0, i64::MAX).await.expect("stats");
        assert_eq!(stats.requests_total, 1);
        assert_eq!(stats.committed_usd, Usd::ZERO);
    }

    #[tokio::test]
    async fn voided_events_count_requests_but_no_spend() {
        let (_dir, store) = store();
        store.init().await.expect("init");
        store.init_rollups().await.expect("init rollups");
        store.top_up(1, usd("1.00")).await.expect("top up");

        let event_id = store
            .reserve(ReserveInput {
                request_id: "req".to_string(),
                user_id: 1,
                token_id: 1,
                subscription_id: None,
                model: None,
                reserved_usd: usd("0.10"),
                ttl: Duration::from_secs(3600),
            })
            .await
            .expect("reserve");
        store.void(event_id).await.expect("void");

        assert!(store.apply_rollups(event_id).await.expect("apply"));
        let stats = store.global_hour_stats(0, i64::MAX).await.expect("stats");
        assert_eq!(stats.requests_total, 1);
        assert_eq!(stats.committed_usd, Usd::ZERO);
    }

    #[tokio::test]
    async fn positive_first_token_latency_is_sampled_regardless_of_streaming() {
        let (_dir, store) = store();
        store.init().await.expect("init");
        store.init_rollups().await.expect("init rollups");

        let event_id = settled_event(&store, 1, "0.10").await;
        store
            .finalize(FinalizeInput {
                event_id,
                endpoint: "/v1/chat/completions".to_string(),
                method: "POST".to_string(),
                status_code: 200,
                latency_ms: 900,
                first_token_latency_ms: 300,
                is_stream: false,
                ..Default::default()
            })
            .await
            .expect("finalize");

        assert!(store.apply_rollups(event_id).await.expect("apply"));
        let stats = store.global_hour_stats(0, i64::MAX).await.expect("stats");
        assert_eq!(stats.first_token_samples, 1);
        assert_eq!(stats.first_token_latency_ms_sum, 300);
        assert_eq!(stats.decode_latency_ms_sum, 600);
        assert_eq!(stats.avg_first_token_latency_ms(), Some(300));
    }

    #[tokio::test]
    async fn zero_first_token_latency_is_not_a_sample() {
        let (_dir, store) = store();
        store.init().await.expect("init");
        store.init_rollups().await.expect("init rollups");

        let event_id = settled_event(&store, 1, "0.10").await;
        store
            .finalize(FinalizeInput {
                event_id,
                endpoint: "/v1/chat/completions".to_string(),
                method: "POST".to_string(),
                status_code: 200,
                latency_ms: 900,
                first_token_latency_ms: 0,
                is_stream: true,
                ..Default::default()
            })
            .await
            .expect("finalize");

        assert!(store.apply_rollups(event_id).await.expect("apply"));
        let stats = store.global_hour_stats(0, i64::MAX).await.expect("stats");
        assert_eq!(stats.first_token_samples, 0);
        assert_eq!(stats.first_token_latency_ms_sum, 0);
        assert_eq!(stats.decode_latency_ms_sum, 900);
        assert_eq!(stats.avg_first_token_latency_ms(), None);
    }

    #[tokio::test]
    async fn sharded_writes_split_from_unsharded_history_at_cutover() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Cutover in the distant past: every new event lands sharded.
        let config = RollupShardConfig::new(4, 0).expect("config");
        let store =
            LedgerStore::new(dir.path().join("ledger.sqlite")).with_rollup_shards(config);
        store.init().await.expect("init");
        store.init_rollups().await.expect("init rollups");

        let e1 = settled_event(&store, 1, "0.40").await;
        let e2 = settled_event(&store, 1, "0.25").await;
        assert!(store.apply_rollups(e1).await.expect("apply e1"));
        assert!(store.apply_rollups(e2).await.expect("apply e2"));

        // An unsharded reader sees nothing; the split reader sees everything.
        let unsharded = LedgerStore::new(store.path().to_path_buf());
        let stale = unsharded
            .global_hour_stats(0, i64::MAX)
            .await
            .expect("unsharded read");
        assert_eq!(stale.requests_total, 0);

        let stats = store
            .global_hour_stats(0, i64::MAX)
            .await
            .expect("split read");
        assert_eq!(stats.requests_total, 2);
        assert_eq!(stats.committed_usd, usd("0.65"));

        let channel = store
            .channel_hour_stats(3, 0, i64::MAX)
            .await
            .expect("channel split read");
        assert_eq!(channel.requests_total, 2);

        let series = store
            .global_hour_series(0, i64::MAX)
            .await
            .expect("series");
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].1.requests_total, 2);
    }
}
