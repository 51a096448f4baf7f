pub mod config;
mod detail;
mod error;
pub mod event;
pub mod money;
mod reclaim;
pub mod rollup;
mod store;

pub use config::RollupShardConfig;
pub use detail::{EventDetail, PutDetailInput};
pub use error::{LedgerError, Result};
pub use event::{
    CommitInput, FinalizeInput, ReserveInput, UsageEvent, UsageState, UsageTotals,
};
pub use money::{Cny, Multiplier, Usd};
pub use rollup::{
    HourSegment, RollupStats, day_bucket, hour_bucket, hour_segments, should_use_rollups,
};
pub use store::LedgerStore;
