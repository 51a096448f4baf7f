use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Environment variable naming the shard count for sharded hour rollups.
pub const ROLLUP_SHARDS_ENV: &str = "LEDGER_ROLLUP_SHARDS";
/// Environment variable naming the RFC 3339 cutover instant. Events at or
/// after this timestamp aggregate into the sharded hour tables.
pub const ROLLUP_SHARDS_CUTOVER_ENV: &str = "LEDGER_ROLLUP_SHARDS_CUTOVER_AT";

/// Sharded hour-rollup configuration: how many shards and from when.
///
/// The cutover splits history, it does not migrate it. Rows before the
/// cutover stay in the unsharded tables forever and readers sum both
/// representations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RollupShardConfig {
    pub shards: u32,
    pub cutover_at_ms: i64,
}

impl RollupShardConfig {
    pub fn new(shards: u32, cutover_at_ms: i64) -> Option<Self> {
        if shards == 0 {
            return None;
        }
        Some(Self {
            shards,
            cutover_at_ms,
        })
    }

    /// Reads the shard configuration from the environment. Both variables
    /// must be present and valid; anything else means "sharding off".
    pub fn from_env() -> Option<Self> {
        let shards_raw = std::env::var(ROLLUP_SHARDS_ENV).ok()?;
        let cutover_raw = std::env::var(ROLLUP_SHARDS_CUTOVER_ENV).ok()?;
        Self::from_values(&shards_raw, &cutover_raw)
    }

    fn from_values(shards_raw: &str, cutover_raw: &str) -> Option<Self> {
        let shards: u32 = match shards_raw.trim().parse() {
            Ok(n) if n >= 1 => n,
            _ => {
                tracing::warn!(value = %shards_raw, "invalid rollup shard count, sharding disabled");
                return None;
            }
        };
        let cutover = match OffsetDateTime::parse(cutover_raw.trim(), &Rfc3339) {
            Ok(ts) => ts,
            Err(error) => {
                tracing::warn!(value = %cutover_raw, %error, "invalid rollup shard cutover, sharding disabled");
                return None;
            }
        };
        let cutover_at_ms = (cutover.unix_timestamp_nanos() / 1_000_000) as i64;
        Some(Self {
            shards,
            cutover_at_ms,
        })
    }

    /// Shard index for an event, stable under replays of the same event.
    pub fn shard_for(self, event_id: i64) -> u32 {
        (event_id.rem_euclid(i64::from(self.shards))) as u32
    }

    pub fn is_after_cutover(self, ts_ms: i64) -> bool {
        ts_ms >= self.cutover_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_values() {
        let config =
            RollupShardConfig::from_values("4", "2026-03-01T00:00:00Z").expect("config");
        assert_eq!(config.shards, 4);
        assert_eq!(config.cutover_at_ms, 1_772_323_200_000);
    }

    #[test]
    fn rejects_zero_and_garbage_shards() {
        assert!(RollupShardConfig::from_values("0", "2026-03-01T00:00:00Z").is_none());
        assert!(RollupShardConfig::from_values("four", "2026-03-01T00:00:00Z").is_none());
    }

    #[test]
    fn rejects_malformed_cutover() {
        assert!(RollupShardConfig::from_values("4", "2026-03-01").is_none());
        assert!(RollupShardConfig::from_values("4", "not a timestamp").is_none());
    }

    #[test]
    fn shard_assignment_is_stable() {
        let config = RollupShardConfig::new(4, 0).expect("config");
        assert_eq!(config.shard_for(10), 2);
        assert_eq!(config.shard_for(10), 2);
        assert_eq!(config.shard_for(11), 3);
    }

    #[test]
    fn cutover_is_inclusive() {
        let config = RollupShardConfig::new(2, 1_000).expect("config");
        assert!(!config.is_after_cutover(999));
        assert!(config.is_after_cutover(1_000));
        assert!(config.is_after_cutover(1_001));
    }
}
