use std::collections::BTreeMap;
use std::cmp::Ordering;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::repo::{self, Pool};
use crate::error::{BridgeError, BridgeResult};
use crate::host::FormsHost;
use crate::model::{Entry, EntryId, FeedConfig, FeedId, FieldId, Form, FormId};
use crate::settings::{self, PluginSettings, SettingsStore, StoredSettings};

/// Forms host and settings store over the service's SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteHost {
    pool: Pool,
}

impl SqliteHost {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Apply settings migrations when the stored version is older than
    /// `current_version`, then record `current_version`.
    #[instrument(skip_all)]
    pub async fn run_upgrade(&self, current_version: &str) -> BridgeResult<bool> {
        let row = repo::load_settings(&self.pool).await?;
        if settings::compare_versions(&row.version, current_version) == Ordering::Equal {
            return Ok(false);
        }
        let stored = self.load().await?;
        let mut record = stored.settings;
        let changed = settings::upgrade(&mut record, &row.version);
        if changed {
            self.save(&record, stored.revision).await?;
            info!(from = %row.version, to = current_version, "settings upgraded");
        }
        repo::set_settings_version(&self.pool, current_version).await?;
        Ok(changed)
    }
}

#[async_trait]
impl SettingsStore for SqliteHost {
    async fn load(&self) -> BridgeResult<StoredSettings> {
        let row = repo::load_settings(&self.pool).await?;
        let settings: PluginSettings = serde_json::from_str(&row.data)
            .map_err(|e| BridgeError::Storage(format!("invalid settings record: {e}")))?;
        Ok(StoredSettings {
            settings,
            revision: row.revision,
        })
    }

    async fn save(&self, settings: &PluginSettings, expected_revision: i64) -> BridgeResult<i64> {
        let data = serde_json::to_string(settings)
            .map_err(|e| BridgeError::Storage(format!("cannot encode settings: {e}")))?;
        repo::save_settings_cas(&self.pool, &data, expected_revision)
            .await?
            .ok_or_else(|| {
                warn!(expected_revision, "settings revision conflict");
                BridgeError::Storage("settings revision conflict".into())
            })
    }
}

#[async_trait]
impl FormsHost for SqliteHost {
    async fn get_form(&self, form_id: FormId) -> BridgeResult<Option<Form>> {
        Ok(repo::get_form(&self.pool, form_id).await?)
    }

    async fn get_entry(&self, entry_id: EntryId) -> BridgeResult<Option<Entry>> {
        Ok(repo::get_entry(&self.pool, entry_id).await?)
    }

    async fn feeds_for_form(&self, form_id: FormId) -> BridgeResult<Vec<FeedConfig>> {
        Ok(repo::list_feeds(&self.pool, form_id).await?)
    }

    async fn create_entry(
        &self,
        form_id: FormId,
        values: BTreeMap<FieldId, String>,
    ) -> BridgeResult<Entry> {
        let id = repo::insert_entry(&self.pool, form_id, &values).await?;
        Ok(Entry { id, form_id, values })
    }

    async fn update_entry_field(
        &self,
        entry_id: EntryId,
        field_id: FieldId,
        value: &str,
    ) -> BridgeResult<()> {
        Ok(repo::update_entry_value(&self.pool, entry_id, field_id, value).await?)
    }

    async fn send_notification(&self, form: &Form, entry: &Entry, event: &str) -> BridgeResult<()> {
        let recipients = form
            .notifications
            .iter()
            .filter(|n| n.is_active && n.event == event)
            .count();
        repo::log_notification(&self.pool, form.id, entry.id, event).await?;
        info!(form_id = form.id, entry_id = entry.id, event, recipients, "notification sent");
        Ok(())
    }

    async fn add_feed_error(
        &self,
        feed_id: FeedId,
        entry_id: EntryId,
        form_id: FormId,
        message: &str,
    ) -> BridgeResult<()> {
        repo::add_feed_error(&self.pool, feed_id, entry_id, form_id, message).await?;
        Ok(())
    }

    async fn follow_up_done(&self, entry_id: EntryId, position: usize) -> BridgeResult<bool> {
        Ok(repo::is_follow_up_done(&self.pool, entry_id, position_key(position)?).await?)
    }

    async fn mark_follow_up_done(&self, entry_id: EntryId, position: usize) -> BridgeResult<()> {
        Ok(repo::mark_follow_up_done(&self.pool, entry_id, position_key(position)?).await?)
    }

    async fn claim_reconcile(&self, entry_id: EntryId) -> BridgeResult<bool> {
        Ok(repo::claim_reconcile(&self.pool, entry_id).await?)
    }

    async fn is_reconciled(&self, entry_id: EntryId) -> BridgeResult<bool> {
        Ok(repo::is_reconciled(&self.pool, entry_id).await?)
    }
}

fn position_key(position: usize) -> BridgeResult<i64> {
    i64::try_from(position).map_err(|_| BridgeError::Validation(format!("position {position} out of range")))
}
