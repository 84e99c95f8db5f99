//! Final merge of staged field values and release of held notifications.
//!
//! Follow-up calls for the same entry may run concurrently and out of order.
//! [`EntrySessions`] is the single place their staged updates meet; the call
//! flagged last waits for its siblings before reconciling.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::gate::SuppressedNotificationSet;
use crate::host::FormsHost;
use crate::model::{Entry, EntryId, FieldId, Form};

/// Reconciled entry ids remembered so late siblings are not re-staged.
const FINISHED_KEPT: usize = 1024;

struct EntrySession {
    pending: Mutex<BTreeMap<FieldId, String>>,
    completed: watch::Sender<usize>,
}

impl EntrySession {
    fn new() -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            pending: Mutex::new(BTreeMap::new()),
            completed,
        }
    }
}

#[derive(Default)]
struct Registry {
    live: HashMap<EntryId, Arc<EntrySession>>,
    finished: VecDeque<EntryId>,
}

/// Process-wide registry of in-flight entries.
#[derive(Default)]
pub struct EntrySessions {
    inner: Mutex<Registry>,
}

impl EntrySessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` once the entry has been handed to the reconciler.
    async fn session(&self, entry_id: EntryId) -> Option<Arc<EntrySession>> {
        let mut registry = self.inner.lock().await;
        if registry.finished.contains(&entry_id) {
            return None;
        }
        Some(
            registry
                .live
                .entry(entry_id)
                .or_insert_with(|| Arc::new(EntrySession::new()))
                .clone(),
        )
    }

    /// Merge one feed's staged updates and count it as finished. Returns
    /// false, dropping the updates, when the entry was already reconciled.
    pub async fn record(&self, entry_id: EntryId, updates: BTreeMap<FieldId, String>) -> bool {
        let Some(session) = self.session(entry_id).await else {
            debug!(entry_id, "entry already reconciled; staged updates dropped");
            return false;
        };
        session.pending.lock().await.extend(updates);
        session.completed.send_modify(|n| *n += 1);
        true
    }

    /// Wait until `expected` feeds have recorded. False on timeout; true
    /// straight away for an entry already reconciled.
    pub async fn wait_for(&self, entry_id: EntryId, expected: usize, timeout: Duration) -> bool {
        let Some(session) = self.session(entry_id).await else {
            return true;
        };
        let mut rx = session.completed.subscribe();
        let done = tokio::time::timeout(timeout, async {
            rx.wait_for(|n| *n >= expected).await.is_ok()
        })
        .await;
        matches!(done, Ok(true))
    }

    /// Hand the merged updates to the reconciler once. Later callers get
    /// `None`, and later `record` calls for the entry are dropped.
    pub async fn take_for_reconcile(&self, entry_id: EntryId) -> Option<BTreeMap<FieldId, String>> {
        let session = {
            let mut registry = self.inner.lock().await;
            let session = registry.live.remove(&entry_id)?;
            registry.finished.push_back(entry_id);
            if registry.finished.len() > FINISHED_KEPT {
                registry.finished.pop_front();
            }
            session
        };
        let pending = std::mem::take(&mut *session.pending.lock().await);
        Some(pending)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.live.is_empty()
    }
}

/// Undo a JSON string encoding left on a value by an upstream step:
/// `"\"https:\\/\\/x\""` becomes `https://x`. Other values pass through.
pub fn unwrap_quoted(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        if let Ok(decoded) = serde_json::from_str::<String>(value) {
            return decoded;
        }
        return value[1..value.len() - 1].replace('\\', "");
    }
    value.to_string()
}

/// Merge staged updates into `entry` and fire each held event once, in the
/// order first held.
#[instrument(skip_all, fields(entry_id = entry.id))]
pub async fn finalize(
    host: &dyn FormsHost,
    mut entry: Entry,
    pending_updates: &BTreeMap<FieldId, String>,
    suppressed_events: &[String],
    form: &Form,
) -> Entry {
    for (field_id, value) in pending_updates {
        entry.values.insert(*field_id, unwrap_quoted(value));
    }
    debug!(fields = pending_updates.len(), "merged staged updates");

    let events: SuppressedNotificationSet = suppressed_events.iter().cloned().collect();
    for event in events.events() {
        match host.send_notification(form, &entry, event).await {
            Ok(()) => info!(form_id = form.id, %event, "sent held notification"),
            Err(err) => warn!(form_id = form.id, %event, %err, "failed to send notification"),
        }
    }
    entry
}
