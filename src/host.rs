//! The forms platform as seen by the pipeline.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::BridgeResult;
use crate::model::{Entry, EntryId, FeedConfig, FeedId, FieldId, Form, FormId};

#[async_trait]
pub trait FormsHost: Send + Sync {
    async fn get_form(&self, form_id: FormId) -> BridgeResult<Option<Form>>;

    async fn get_entry(&self, entry_id: EntryId) -> BridgeResult<Option<Entry>>;

    /// Feeds attached to a form, in configuration order.
    async fn feeds_for_form(&self, form_id: FormId) -> BridgeResult<Vec<FeedConfig>>;

    async fn create_entry(
        &self,
        form_id: FormId,
        values: BTreeMap<FieldId, String>,
    ) -> BridgeResult<Entry>;

    /// Overwrite one field; other fields are left alone.
    async fn update_entry_field(
        &self,
        entry_id: EntryId,
        field_id: FieldId,
        value: &str,
    ) -> BridgeResult<()>;

    async fn send_notification(&self, form: &Form, entry: &Entry, event: &str) -> BridgeResult<()>;

    async fn add_feed_error(
        &self,
        feed_id: FeedId,
        entry_id: EntryId,
        form_id: FormId,
        message: &str,
    ) -> BridgeResult<()>;

    /// Whether the follow-up at `position` already finished for this entry.
    async fn follow_up_done(&self, entry_id: EntryId, position: usize) -> BridgeResult<bool>;

    async fn mark_follow_up_done(&self, entry_id: EntryId, position: usize) -> BridgeResult<()>;

    /// Stamp the entry as reconciled. True only for the first caller.
    async fn claim_reconcile(&self, entry_id: EntryId) -> BridgeResult<bool>;

    async fn is_reconciled(&self, entry_id: EntryId) -> BridgeResult<bool>;
}
