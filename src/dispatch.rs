//! Deferred execution of qualifying feeds.
//!
//! A submission fills a [`DeferredDispatcher`]; once the response is on its
//! way, `flush` emits one signed [`FollowUpRequest`] per queued feed through a
//! [`FollowUpTransport`]. [`FollowUpHandler`] is the receiving side.
//!
//! With [`HttpFollowUp`] delivery is at-most-once and best-effort: nothing
//! retries a call that never arrived. [`OutboxFollowUp`] writes the requests
//! to the SQLite outbox instead, where the worker retries with backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::db;
use crate::error::{BridgeError, BridgeResult};
use crate::gate::SuppressedNotificationSet;
use crate::host::FormsHost;
use crate::model::{Entry, EntryId, FeedConfig, FormId, PendingFeedQueueItem};
use crate::nonce::{NonceSigner, UPLOAD_ACTION};
use crate::processor::{FieldProcessor, RequestContext};
use crate::reconcile::{self, EntrySessions};

/// Body of a follow-up call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpRequest {
    pub action: String,
    pub feed: FeedConfig,
    pub entry_id: EntryId,
    pub form_id: FormId,
    /// Zero-based position in the submission's queue.
    pub position: usize,
    pub is_last_feed: bool,
    #[serde(rename = "_nonce")]
    pub nonce: String,
    /// Present only on the last call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_events: Option<Vec<String>>,
}

#[async_trait]
pub trait FollowUpTransport: Send + Sync {
    /// Start delivery. Must not wait for the follow-up to be processed.
    async fn send(&self, request: FollowUpRequest) -> BridgeResult<()>;
}

/// Fire-and-forget POST to our own `/deferred` endpoint.
#[derive(Debug, Clone)]
pub struct HttpFollowUp {
    http: Client,
    endpoint: Url,
}

impl HttpFollowUp {
    pub fn new(http: Client, public_url: &str) -> BridgeResult<Self> {
        let base = Url::parse(&format!("{}/", public_url.trim_end_matches('/')))
            .map_err(|e| BridgeError::Config(format!("invalid public_url: {e}")))?;
        let endpoint = base
            .join("deferred")
            .map_err(|e| BridgeError::Config(format!("invalid public_url: {e}")))?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl FollowUpTransport for HttpFollowUp {
    async fn send(&self, request: FollowUpRequest) -> BridgeResult<()> {
        let req = self
            .http
            .post(self.endpoint.clone())
            .json(&request)
            .build()
            .map_err(|e| BridgeError::Config(format!("cannot build follow-up call: {e}")))?;
        let http = self.http.clone();
        let (feed_id, entry_id) = (request.feed.id, request.entry_id);
        tokio::spawn(async move {
            match http.execute(req).await {
                Ok(res) if res.status().is_success() => {
                    debug!(feed_id, entry_id, "follow-up call finished")
                }
                Ok(res) => warn!(feed_id, entry_id, status = %res.status(), "follow-up call rejected"),
                Err(err) => error!(feed_id, entry_id, %err, "follow-up call failed"),
            }
        });
        Ok(())
    }
}

/// Durable delivery through the SQLite outbox.
#[derive(Debug, Clone)]
pub struct OutboxFollowUp {
    pool: SqlitePool,
}

impl OutboxFollowUp {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FollowUpTransport for OutboxFollowUp {
    async fn send(&self, request: FollowUpRequest) -> BridgeResult<()> {
        let payload = serde_json::to_string(&request)
            .map_err(|e| BridgeError::Validation(format!("unserializable follow-up: {e}")))?;
        let id = db::enqueue_outbox(&self.pool, request.entry_id, &payload).await?;
        debug!(outbox_id = id, feed_id = request.feed.id, "follow-up queued in outbox");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Empty,
    Queued,
    Dispatching,
    Drained,
}

/// Queue for one submission.
pub struct DeferredDispatcher {
    state: DispatchState,
    queue: Vec<PendingFeedQueueItem>,
    suppressed: SuppressedNotificationSet,
    signer: NonceSigner,
    transport: Arc<dyn FollowUpTransport>,
}

impl DeferredDispatcher {
    pub fn new(signer: NonceSigner, transport: Arc<dyn FollowUpTransport>) -> Self {
        Self {
            state: DispatchState::Empty,
            queue: Vec::new(),
            suppressed: SuppressedNotificationSet::default(),
            signer,
            transport,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn queued(&self) -> &[PendingFeedQueueItem] {
        &self.queue
    }

    pub fn suppressed(&self) -> &SuppressedNotificationSet {
        &self.suppressed
    }

    pub fn suppressed_mut(&mut self) -> &mut SuppressedNotificationSet {
        &mut self.suppressed
    }

    pub fn enqueue(&mut self, feed: FeedConfig, entry_id: EntryId, form_id: FormId) -> BridgeResult<()> {
        match self.state {
            DispatchState::Empty | DispatchState::Queued => {}
            DispatchState::Dispatching | DispatchState::Drained => {
                return Err(BridgeError::Validation("dispatcher already flushed".into()))
            }
        }
        let enqueued_order = self.queue.len();
        debug!(feed_id = feed.id, entry_id, enqueued_order, "feed queued");
        self.queue.push(PendingFeedQueueItem {
            feed,
            entry_id,
            form_id,
            enqueued_order,
        });
        self.state = DispatchState::Queued;
        Ok(())
    }

    /// Emit one follow-up per queued feed in queue order. Only the first call
    /// does anything; returns how many follow-ups were started.
    #[instrument(skip_all)]
    pub async fn flush(&mut self) -> usize {
        match self.state {
            DispatchState::Empty => {
                self.state = DispatchState::Drained;
                return 0;
            }
            DispatchState::Dispatching | DispatchState::Drained => {
                warn!("dispatcher flushed twice");
                return 0;
            }
            DispatchState::Queued => {}
        }
        self.state = DispatchState::Dispatching;

        let items = std::mem::take(&mut self.queue);
        let total = items.len();
        let nonce = self.signer.create();
        let events = self.suppressed.events().to_vec();
        let mut started = 0;
        for item in items {
            let is_last_feed = item.enqueued_order + 1 == total;
            let request = FollowUpRequest {
                action: UPLOAD_ACTION.to_string(),
                entry_id: item.entry_id,
                form_id: item.form_id,
                position: item.enqueued_order,
                is_last_feed,
                nonce: nonce.clone(),
                notification_events: is_last_feed.then(|| events.clone()),
                feed: item.feed,
            };
            let (feed_id, entry_id) = (request.feed.id, request.entry_id);
            match self.transport.send(request).await {
                Ok(()) => started += 1,
                Err(err) => error!(feed_id, entry_id, %err, "could not start follow-up call"),
            }
        }
        self.state = DispatchState::Drained;
        info!(started, total, "queued feeds dispatched");
        started
    }
}

#[derive(Debug)]
pub struct FollowUpOutcome {
    pub entry: Entry,
    pub reconciled: bool,
    /// The call was delivered before and did nothing this time.
    pub duplicate: bool,
    pub feed_errors: Vec<String>,
}

/// Receiving side of follow-up calls.
pub struct FollowUpHandler {
    host: Arc<dyn FormsHost>,
    processor: FieldProcessor,
    sessions: EntrySessions,
    signer: NonceSigner,
    reconcile_wait: Duration,
}

impl FollowUpHandler {
    pub fn new(
        host: Arc<dyn FormsHost>,
        processor: FieldProcessor,
        signer: NonceSigner,
        reconcile_wait: Duration,
    ) -> Self {
        Self {
            host,
            processor,
            sessions: EntrySessions::new(),
            signer,
            reconcile_wait,
        }
    }

    pub fn verify(&self, request: &FollowUpRequest) -> BridgeResult<()> {
        if request.action != UPLOAD_ACTION {
            return Err(BridgeError::Validation(format!("unexpected action {}", request.action)));
        }
        if self.signer.verify(&request.nonce).is_none() {
            return Err(BridgeError::Validation("nonce rejected".into()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(feed_id = request.feed.id, entry_id = request.entry_id, position = request.position))]
    pub async fn handle(&self, request: FollowUpRequest) -> BridgeResult<FollowUpOutcome> {
        self.verify(&request)?;

        let form = self
            .host
            .get_form(request.form_id)
            .await?
            .ok_or_else(|| BridgeError::Validation(format!("form {} not found", request.form_id)))?;
        let entry = self
            .host
            .get_entry(request.entry_id)
            .await?
            .ok_or_else(|| BridgeError::Validation(format!("entry {} not found", request.entry_id)))?;
        if entry.form_id != form.id {
            return Err(BridgeError::Validation(format!(
                "entry {} does not belong to form {}",
                entry.id, form.id
            )));
        }

        if self.host.follow_up_done(entry.id, request.position).await? {
            info!("follow-up already processed; skipping");
            return Ok(FollowUpOutcome {
                entry,
                reconciled: false,
                duplicate: true,
                feed_errors: Vec::new(),
            });
        }

        let mut rctx = RequestContext::new();
        let mut entry = self
            .processor
            .process_feed(&request.feed, entry, &form, &mut rctx)
            .await;
        self.sessions.record(entry.id, rctx.take_updates()).await;

        let mut reconciled = false;
        if request.is_last_feed {
            let expected = request.position + 1;
            if !self.sessions.wait_for(entry.id, expected, self.reconcile_wait).await {
                warn!(expected, "reconciling before every queued feed reported back");
            }
            let stored = self.host.get_entry(entry.id).await?;
            if let Some(pending) = self.sessions.take_for_reconcile(entry.id).await {
                if self.host.claim_reconcile(entry.id).await? {
                    let stored = stored.unwrap_or(entry);
                    let events = request.notification_events.clone().unwrap_or_default();
                    entry = reconcile::finalize(self.host.as_ref(), stored, &pending, &events, &form).await;
                    reconciled = true;
                } else {
                    warn!("entry was reconciled earlier; held notifications not resent");
                }
            }
        }
        self.host.mark_follow_up_done(entry.id, request.position).await?;

        let deleted = rctx.delete_registered_files().await;
        info!(
            deleted,
            reconciled,
            errors = rctx.feed_errors().len(),
            "post_upload"
        );
        Ok(FollowUpOutcome {
            entry,
            reconciled,
            duplicate: false,
            feed_errors: rctx.feed_errors().to_vec(),
        })
    }
}
