use super::model::{FeedErrorRow, OutboxItem, SettingsRow};
use crate::model::{Entry, FeedConfig, FieldId, Form};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL and create its parent
/// directory. In-memory and non-sqlite URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx wants mode=rwc to create the file on first run.
    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{expanded}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// settings

#[instrument(skip_all)]
pub async fn load_settings(pool: &Pool) -> Result<SettingsRow> {
    let row = sqlx::query("SELECT data, revision, version FROM settings WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(match row {
        Some(row) => SettingsRow {
            data: row.get("data"),
            revision: row.get("revision"),
            version: row.get("version"),
        },
        None => SettingsRow {
            data: "{}".into(),
            revision: 0,
            version: String::new(),
        },
    })
}

/// Write the settings record only if it is still at `expected_revision`.
/// Returns the new revision, or `None` when another writer got there first.
#[instrument(skip_all)]
pub async fn save_settings_cas(pool: &Pool, data: &str, expected_revision: i64) -> Result<Option<i64>> {
    let done = sqlx::query(
        "UPDATE settings SET data = ?, revision = revision + 1, updated_at = CURRENT_TIMESTAMP \
         WHERE id = 1 AND revision = ?",
    )
    .bind(data)
    .bind(expected_revision)
    .execute(pool)
    .await?;
    if done.rows_affected() == 1 {
        Ok(Some(expected_revision + 1))
    } else {
        Ok(None)
    }
}

#[instrument(skip_all)]
pub async fn set_settings_version(pool: &Pool, version: &str) -> Result<()> {
    sqlx::query("UPDATE settings SET version = ? WHERE id = 1")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

// forms and feeds

#[instrument(skip_all)]
pub async fn upsert_form(pool: &Pool, form: &Form) -> Result<()> {
    let definition = serde_json::to_string(form)?;
    sqlx::query(
        "INSERT INTO forms (id, title, definition) VALUES (?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET title = excluded.title, definition = excluded.definition, \
         updated_at = CURRENT_TIMESTAMP",
    )
    .bind(form.id)
    .bind(&form.title)
    .bind(definition)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_form(pool: &Pool, form_id: i64) -> Result<Option<Form>> {
    let definition: Option<String> = sqlx::query_scalar("SELECT definition FROM forms WHERE id = ?")
        .bind(form_id)
        .fetch_optional(pool)
        .await?;
    definition
        .map(|d| serde_json::from_str(&d).with_context(|| format!("form {form_id} has invalid definition")))
        .transpose()
}

/// Store a feed; the row id becomes the feed id.
#[instrument(skip_all)]
pub async fn insert_feed(pool: &Pool, feed: &FeedConfig) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id: i64 = sqlx::query("INSERT INTO feeds (form_id, config) VALUES (?, '{}') RETURNING id")
        .bind(feed.form_id)
        .fetch_one(&mut *tx)
        .await?
        .get("id");
    let mut stored = feed.clone();
    stored.id = id;
    sqlx::query("UPDATE feeds SET config = ? WHERE id = ?")
        .bind(serde_json::to_string(&stored)?)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn list_feeds(pool: &Pool, form_id: i64) -> Result<Vec<FeedConfig>> {
    let rows = sqlx::query("SELECT id, form_id, config FROM feeds WHERE form_id = ? ORDER BY id ASC")
        .bind(form_id)
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|row| {
            let id: i64 = row.get("id");
            let config: String = row.get("config");
            let mut feed: FeedConfig = serde_json::from_str(&config)
                .with_context(|| format!("feed {id} has invalid config"))?;
            feed.id = id;
            feed.form_id = row.get("form_id");
            Ok(feed)
        })
        .collect()
}

// entries

#[instrument(skip_all)]
pub async fn insert_entry(pool: &Pool, form_id: i64, values: &BTreeMap<FieldId, String>) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id: i64 = sqlx::query("INSERT INTO entries (form_id) VALUES (?) RETURNING id")
        .bind(form_id)
        .fetch_one(&mut *tx)
        .await?
        .get("id");
    for (field_id, value) in values {
        sqlx::query("INSERT INTO entry_values (entry_id, field_id, value) VALUES (?, ?, ?)")
            .bind(id)
            .bind(i64::from(*field_id))
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn get_entry(pool: &Pool, entry_id: i64) -> Result<Option<Entry>> {
    let form_id: Option<i64> = sqlx::query_scalar("SELECT form_id FROM entries WHERE id = ?")
        .bind(entry_id)
        .fetch_optional(pool)
        .await?;
    let Some(form_id) = form_id else {
        return Ok(None);
    };
    let rows = sqlx::query("SELECT field_id, value FROM entry_values WHERE entry_id = ?")
        .bind(entry_id)
        .fetch_all(pool)
        .await?;
    let mut values = BTreeMap::new();
    for row in rows {
        let raw: i64 = row.get("field_id");
        let field_id = FieldId::try_from(raw).map_err(|_| anyhow!("field id {raw} out of range"))?;
        values.insert(field_id, row.get::<String, _>("value"));
    }
    Ok(Some(Entry {
        id: entry_id,
        form_id,
        values,
    }))
}

#[instrument(skip_all)]
pub async fn update_entry_value(pool: &Pool, entry_id: i64, field_id: FieldId, value: &str) -> Result<()> {
    let done = sqlx::query(
        "INSERT INTO entry_values (entry_id, field_id, value) \
         SELECT id, ?, ? FROM entries WHERE id = ? \
         ON CONFLICT(entry_id, field_id) DO UPDATE SET value = excluded.value",
    )
    .bind(i64::from(field_id))
    .bind(value)
    .bind(entry_id)
    .execute(pool)
    .await?;
    if done.rows_affected() == 0 {
        return Err(anyhow!("entry {} not found", entry_id));
    }
    Ok(())
}

// feed errors and notifications

#[instrument(skip_all)]
pub async fn add_feed_error(pool: &Pool, feed_id: i64, entry_id: i64, form_id: i64, message: &str) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO feed_errors (feed_id, entry_id, form_id, message) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(feed_id)
    .bind(entry_id)
    .bind(form_id)
    .bind(message)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

pub async fn list_feed_errors(pool: &Pool, entry_id: i64) -> Result<Vec<FeedErrorRow>> {
    let rows = sqlx::query(
        "SELECT id, feed_id, entry_id, form_id, message FROM feed_errors WHERE entry_id = ? ORDER BY id ASC",
    )
    .bind(entry_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| FeedErrorRow {
            id: row.get("id"),
            feed_id: row.get("feed_id"),
            entry_id: row.get("entry_id"),
            form_id: row.get("form_id"),
            message: row.get("message"),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn log_notification(pool: &Pool, form_id: i64, entry_id: i64, event: &str) -> Result<()> {
    sqlx::query("INSERT INTO notification_log (form_id, entry_id, event) VALUES (?, ?, ?)")
        .bind(form_id)
        .bind(entry_id)
        .bind(event)
        .execute(pool)
        .await?;
    Ok(())
}

/// Events sent for an entry, oldest first.
pub async fn list_notifications(pool: &Pool, entry_id: i64) -> Result<Vec<String>> {
    let events = sqlx::query_scalar("SELECT event FROM notification_log WHERE entry_id = ? ORDER BY id ASC")
        .bind(entry_id)
        .fetch_all(pool)
        .await?;
    Ok(events)
}

// follow-up markers

#[instrument(skip_all)]
pub async fn is_follow_up_done(pool: &Pool, entry_id: i64, position: i64) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM follow_up_done WHERE entry_id = ? AND position = ?")
            .bind(entry_id)
            .bind(position)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

#[instrument(skip_all)]
pub async fn mark_follow_up_done(pool: &Pool, entry_id: i64, position: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO follow_up_done (entry_id, position) VALUES (?, ?)")
        .bind(entry_id)
        .bind(position)
        .execute(pool)
        .await?;
    Ok(())
}

/// Stamp the entry as reconciled. True only for the first caller.
#[instrument(skip_all)]
pub async fn claim_reconcile(pool: &Pool, entry_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE entries SET reconciled_at = CURRENT_TIMESTAMP WHERE id = ? AND reconciled_at IS NULL",
    )
    .bind(entry_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn is_reconciled(pool: &Pool, entry_id: i64) -> Result<bool> {
    let stamped: Option<bool> =
        sqlx::query_scalar("SELECT reconciled_at IS NOT NULL FROM entries WHERE id = ?")
            .bind(entry_id)
            .fetch_optional(pool)
            .await?;
    Ok(stamped.unwrap_or(false))
}

// outbox

#[instrument(skip_all)]
pub async fn enqueue_outbox(pool: &Pool, entry_id: i64, payload: &str) -> Result<i64> {
    enqueue_outbox_at(pool, entry_id, payload, Utc::now()).await
}

pub async fn enqueue_outbox_at(
    pool: &Pool,
    entry_id: i64,
    payload: &str,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO outbox (entry_id, payload, attempt, due_at) VALUES (?, ?, 0, ?) RETURNING id",
    )
    .bind(entry_id)
    .bind(payload)
    .bind(due_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_outbox(pool: &Pool) -> Result<Option<OutboxItem>> {
    let row = sqlx::query(
        "SELECT id, entry_id, payload, attempt FROM outbox \
         WHERE datetime(due_at) <= CURRENT_TIMESTAMP ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| OutboxItem {
        id: row.get("id"),
        entry_id: row.get("entry_id"),
        payload: row.get("payload"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_outbox(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Push the task out by 5s * 2^attempt, capped at `max_cap_secs` when > 0.
#[instrument(skip_all)]
pub async fn backoff_outbox_with_cap(pool: &Pool, id: i64, attempt: i32, max_cap_secs: i64) -> Result<()> {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let secs = if max_cap_secs > 0 { secs.min(max_cap_secs) } else { secs };
    sqlx::query(
        "UPDATE outbox SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_remaining_outbox_tasks(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
