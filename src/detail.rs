use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::store::{LedgerStore, init_schema, now_millis, open_connection};

/// Hard cap per captured body. Debug payloads, not a durable archive.
const MAX_BODY_BYTES: usize = 256 << 10;
const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// Captured request/response bodies for one usage event.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventDetail {
    pub usage_event_id: i64,
    pub downstream_request_body: Option<String>,
    pub upstream_request_body: Option<String>,
    pub upstream_response_body: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Bodies to capture. Blank strings store as absent.
#[derive(Clone, Debug, Default)]
pub struct PutDetailInput {
    pub event_id: i64,
    pub downstream_request_body: Option<String>,
    pub upstream_request_body: Option<String>,
    pub upstream_response_body: Option<String>,
}

impl LedgerStore {
    /// Stores captured bodies for an event, truncating each to the size cap.
    /// Later calls overwrite earlier ones; a call with nothing to store
    /// writes nothing at all.
    pub async fn put_event_detail(&self, input: PutDetailInput) -> Result<()> {
        if input.event_id <= 0 {
            return Err(LedgerError::InvalidInput("event_id must be positive"));
        }
        let downstream = truncate_body(input.downstream_request_body.as_deref());
        let upstream_req = truncate_body(input.upstream_request_body.as_deref());
        let upstream_resp = truncate_body(input.upstream_response_body.as_deref());
        if downstream.is_none() && upstream_req.is_none() && upstream_resp.is_none() {
            return Ok(());
        }

        let path = self.path().to_path_buf();
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO usage_event_details (
                    usage_event_id, downstream_request_body, upstream_request_body,
                    upstream_response_body, created_at_ms, updated_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(usage_event_id) DO UPDATE SET
                    downstream_request_body = excluded.downstream_request_body,
                    upstream_request_body = excluded.upstream_request_body,
                    upstream_response_body = excluded.upstream_response_body,
                    updated_at_ms = excluded.updated_at_ms",
                params![
                    input.event_id,
                    downstream,
                    upstream_req,
                    upstream_resp,
                    ts_ms,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn event_detail(&self, event_id: i64) -> Result<Option<EventDetail>> {
        let path = self.path().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<Option<EventDetail>> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.query_row(
                "SELECT usage_event_id, downstream_request_body, upstream_request_body,
                        upstream_response_body, created_at_ms, updated_at_ms
                 FROM usage_event_details WHERE usage_event_id=?1",
                params![event_id],
                |row| {
                    Ok(EventDetail {
                        usage_event_id: row.get(0)?,
                        downstream_request_body: row.get(1)?,
                        upstream_request_body: row.get(2)?,
                        upstream_response_body: row.get(3)?,
                        created_at_ms: row.get(4)?,
                        updated_at_ms: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
        .await?
    }
}

/// Trims, drops blanks, and cuts oversized bodies at a char boundary with a
/// visible marker.
fn truncate_body(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() <= MAX_BODY_BYTES {
        return Some(trimmed.to_string());
    }
    let keep = MAX_BODY_BYTES - TRUNCATION_MARKER.len();
    let mut end = keep;
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    let mut body = trimmed[..end].to_string();
    body.push_str(TRUNCATION_MARKER);
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_bodies_store_as_absent() {
        assert_eq!(truncate_body(None), None);
        assert_eq!(truncate_body(Some("   ")), None);
        assert_eq!(truncate_body(Some(" {} ")).as_deref(), Some("{}"));
    }

    #[test]
    fn oversized_bodies_are_cut_with_a_marker() {
        let big = "x".repeat(MAX_BODY_BYTES + 100);
        let stored = truncate_body(Some(&big)).expect("body");
        assert_eq!(stored.len(), MAX_BODY_BYTES);
        assert!(stored.ends_with(TRUNCATION_MARKER));

        let exact = "y".repeat(MAX_BODY_BYTES);
        assert_eq!(truncate_body(Some(&exact)).expect("body"), exact);
    }

    #[tokio::test]
    async fn put_overwrites_and_empty_put_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LedgerStore::new(dir.path().join("ledger.sqlite"));
        store.init().await.expect("init");

        store
            .put_event_detail(PutDetailInput {
                event_id: 1,
                ..Default::default()
            })
            .await
            .expect("empty put");
        assert!(store.event_detail(1).await.expect("detail").is_none());

        store
            .put_event_detail(PutDetailInput {
                event_id: 1,
                downstream_request_body: Some("{\"model\":\"a\"}".to_string()),
                ..Default::default()
            })
            .await
            .expect("first put");
        store
            .put_event_detail(PutDetailInput {
                event_id: 1,
                upstream_response_body: Some("{\"ok\":true}".to_string()),
                ..Default::default()
            })
            .await
            .expect("second put");

        let detail = store.event_detail(1).await.expect("detail").expect("row");
        assert_eq!(detail.downstream_request_body, None);
        assert_eq!(detail.upstream_response_body.as_deref(), Some("{\"ok\":true}"));
    }
}
