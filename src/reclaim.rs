use std::collections::BTreeMap;

use rusqlite::{TransactionBehavior, params};

use crate::error::Result;
use crate::event::UsageState;
use crate::money::Usd;
use crate::store::{
    LedgerStore, credit_balance, ensure_balance_row, init_schema, open_connection,
};

impl LedgerStore {
    /// Expires every reservation whose deadline has passed and refunds the
    /// held funds of pay-as-you-go reservations, one credit per user no
    /// matter how many of their reservations lapsed.
    ///
    /// Runs in a single transaction; a crash mid-sweep leaves every
    /// reservation either fully reclaimed or untouched for the next pass.
    /// Returns the number of reservations expired.
    pub async fn sweep_expired(&self, now_ms: i64) -> Result<u64> {
        let path = self.path().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // Pay-as-you-go holds, grouped so each user gets one credit.
            let mut refunds: BTreeMap<i64, Usd> = BTreeMap::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT user_id, reserved_usd_micros FROM usage_events
                     WHERE state=?1 AND reserve_expires_at_ms < ?2
                       AND subscription_id IS NULL",
                )?;
                let rows = stmt.query_map(params![UsageState::Reserved, now_ms], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (user_id, reserved_micros) = row?;
                    let entry = refunds.entry(user_id).or_insert(Usd::ZERO);
                    *entry = entry.saturating_add(Usd::from_micros(reserved_micros));
                }
            }

            for (user_id, refund) in &refunds {
                if refund.micros() <= 0 {
                    continue;
                }
                ensure_balance_row(&tx, *user_id, now_ms)?;
                credit_balance(&tx, *user_id, *refund, now_ms)?;
            }

            // Everything past the deadline expires, subscription holds included.
            let expired = tx.execute(
                "UPDATE usage_events
                 SET state=?1, committed_usd_micros=0, updated_at_ms=?2
                 WHERE state=?3 AND reserve_expires_at_ms < ?2",
                params![UsageState::Expired, now_ms, UsageState::Reserved],
            )?;
            tx.commit()?;

            if expired > 0 {
                tracing::info!(expired, users_refunded = refunds.len(), "expired reservations reclaimed");
            }
            Ok(expired as u64)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::{CommitInput, ReserveInput};
    use crate::store::now_millis;

    fn usd(raw: &str) -> Usd {
        Usd::parse(raw).expect("usd literal")
    }

    fn reserve_input(user_id: i64, amount: &str, ttl: Duration) -> ReserveInput {
        ReserveInput {
            request_id: "req".to_string(),
            user_id,
            token_id: 1,
            subscription_id: None,
            model: None,
            reserved_usd: usd(amount),
            ttl,
        }
    }

    #[tokio::test]
    async fn sweep_refunds_grouped_per_user_and_expires_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LedgerStore::new(dir.path().join("ledger.sqlite"));
        store.init().await.expect("init");
        store.top_up(1, usd("10.00")).await.expect("top up u1");
        store.top_up(2, usd("5.00")).await.expect("top up u2");

        let short = Duration::from_millis(1);
        let e1 = store
            .reserve(reserve_input(1, "1.00", short))
            .await
            .expect("e1");
        let e2 = store
            .reserve(reserve_input(1, "0.50", short))
            .await
            .expect("e2");
        let e3 = store
            .reserve(reserve_input(2, "2.00", short))
            .await
            .expect("e3");
        let live = store
            .reserve(reserve_input(1, "3.00", Duration::from_secs(3600)))
            .await
            .expect("live");

        let expired = store
            .sweep_expired(now_millis() + 60_000)
            .await
            .expect("sweep");
        assert_eq!(expired, 3);

        // Lapsed holds come back; the live one stays held.
        assert_eq!(store.balance(1).await.expect("balance"), usd("7.00"));
        assert_eq!(store.balance(2).await.expect("balance"), usd("5.00"));

        for id in [e1, e2, e3] {
            let event = store.event(id).await.expect("event");
            assert_eq!(event.state, UsageState::Expired);
            assert_eq!(event.committed_usd, Usd::ZERO);
        }
        assert_eq!(
            store.event(live).await.expect("event").state,
            UsageState::Reserved
        );
    }

    #[tokio::test]
    async fn sweep_skips_settled_and_subscription_holds_get_no_refund() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LedgerStore::new(dir.path().join("ledger.sqlite"));
        store.init().await.expect("init");
        store.top_up(1, usd("10.00")).await.expect("top up");

        let short = Duration::from_millis(1);
        let committed = store
            .reserve(reserve_input(1, "1.00", short))
            .await
            .expect("committed");
        store
            .commit(CommitInput {
                event_id: committed,
                committed_usd: usd("1.00"),
                ..Default::default()
            })
            .await
            .expect("commit");

        let mut sub = reserve_input(1, "4.00", short);
        sub.subscription_id = Some(7);
        let sub_id = store.reserve(sub).await.expect("sub reserve");

        let balance_before = store.balance(1).await.expect("balance");
        let expired = store
            .sweep_expired(now_millis() + 60_000)
            .await
            .expect("sweep");
        assert_eq!(expired, 1);

        // Subscription expiry never credits the wallet.
        assert_eq!(store.balance(1).await.expect("balance"), balance_before);
        assert_eq!(
            store.event(sub_id).await.expect("event").state,
            UsageState::Expired
        );
        assert_eq!(
            store.event(committed).await.expect("event").state,
            UsageState::Committed
        );
    }

    #[tokio::test]
    async fn sweep_of_empty_ledger_is_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LedgerStore::new(dir.path().join("ledger.sqlite"));
        store.init().await.expect("init");
        assert_eq!(store.sweep_expired(now_millis()).await.expect("sweep"), 0);
    }
}
