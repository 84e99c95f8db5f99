//! Synchronous part of a submission: store the entry, gate each feed and
//! decide about notifications. Remote work is left in the dispatcher.

use std::collections::BTreeMap;

use tracing::{info, instrument, warn};

use crate::dispatch::{DeferredDispatcher, DispatchState};
use crate::error::BridgeResult;
use crate::gate::{FeedGate, SuppressedNotificationSet};
use crate::host::FormsHost;
use crate::model::{Entry, FieldId, Form};
use crate::processor::NOT_INITIALIZED;
use crate::token::TokenManager;

#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub entry: Entry,
    pub queued: usize,
    /// Events held until the last feed finishes.
    pub suppressed: Vec<String>,
    /// Events sent right away because no feed qualified.
    pub sent: Vec<String>,
}

#[instrument(skip_all, fields(form_id = form.id))]
pub async fn accept_submission(
    host: &dyn FormsHost,
    tokens: &TokenManager,
    dispatcher: &mut DeferredDispatcher,
    form: &Form,
    values: BTreeMap<FieldId, String>,
) -> BridgeResult<SubmissionOutcome> {
    let entry = host.create_entry(form.id, values).await?;
    let feeds = host.feeds_for_form(form.id).await?;
    let api_ready = tokens.has_token().await?;

    for feed in feeds {
        if !FeedGate::evaluate(&feed, &entry, form).qualifies {
            continue;
        }
        if !api_ready {
            warn!(feed_id = feed.id, entry_id = entry.id, "{NOT_INITIALIZED}");
            host.add_feed_error(feed.id, entry.id, form.id, NOT_INITIALIZED).await?;
            continue;
        }
        dispatcher.enqueue(feed, entry.id, form.id)?;
    }

    let mut sent = Vec::new();
    if dispatcher.state() == DispatchState::Queued {
        FeedGate::suppress_notifications(form, dispatcher.suppressed_mut());
    } else {
        let mut events = SuppressedNotificationSet::default();
        FeedGate::suppress_notifications(form, &mut events);
        for event in events.into_events() {
            match host.send_notification(form, &entry, &event).await {
                Ok(()) => sent.push(event),
                Err(err) => warn!(%event, %err, "failed to send notification"),
            }
        }
    }

    let queued = dispatcher.queued().len();
    info!(entry_id = entry.id, queued, "submission accepted");
    Ok(SubmissionOutcome {
        entry,
        queued,
        suppressed: dispatcher.suppressed().events().to_vec(),
        sent,
    })
}
