use crate::db;
use crate::dispatch::{FollowUpHandler, FollowUpRequest};
use crate::error::BridgeError;
use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{info, instrument, warn};

/// Deliver the next due follow-up. Returns false when nothing was due.
///
/// Rejected payloads are dropped; storage and other transient failures are
/// rescheduled with capped exponential backoff.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &SqlitePool,
    handler: &FollowUpHandler,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some(item) = db::next_due_outbox(pool).await? else {
        return Ok(false);
    };
    let (id, entry_id, attempt) = (item.id, item.entry_id, item.attempt);

    let request: FollowUpRequest = match serde_json::from_str(&item.payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(id, entry_id, %err, "dropping unreadable outbox payload");
            db::delete_outbox(pool, id).await?;
            return Ok(true);
        }
    };

    match handler.handle(request).await {
        Ok(outcome) => {
            db::delete_outbox(pool, id).await?;
            info!(
                id,
                entry_id,
                reconciled = outcome.reconciled,
                duplicate = outcome.duplicate,
                errors = outcome.feed_errors.len(),
                "outbox task succeeded"
            );
        }
        Err(BridgeError::Validation(reason)) => {
            warn!(id, entry_id, %reason, "outbox task rejected; dropping");
            db::delete_outbox(pool, id).await?;
        }
        Err(err) => {
            warn!(%err, id, entry_id, attempt, "outbox task failed; backoff");
            db::backoff_outbox_with_cap(pool, id, attempt, max_backoff_secs).await?;
        }
    }
    Ok(true)
}
