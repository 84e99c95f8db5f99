//! Per-feed field processing: push files to Drive, rewrite entry values to
//! shareable links and append the mapped row.
//!
//! A failure on one file or field is recorded as a feed error and processing
//! moves on; only a missing or unrefreshable token stops the feed.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{AuthError, BridgeError};
use crate::google::{basename, join_path, normalize_path, CapabilityClient, Connector};
use crate::host::FormsHost;
use crate::model::{
    Entry, FeedConfig, FieldId, FileEntry, Form, JobStatus, RemoteJob, UploadCategory,
};
use crate::token::TokenManager;

pub const NOT_INITIALIZED: &str = "Feed was not processed because API was not initialized.";

/// State for one follow-up call, threaded through processing and
/// reconciliation instead of living in globals.
#[derive(Debug, Default)]
pub struct RequestContext {
    files_to_delete: Vec<PathBuf>,
    updated_fields: BTreeMap<FieldId, String>,
    feed_errors: Vec<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_deletion(&mut self, path: PathBuf) {
        if !self.files_to_delete.contains(&path) {
            self.files_to_delete.push(path);
        }
    }

    pub fn deregister_deletion(&mut self, path: &Path) {
        self.files_to_delete.retain(|p| p != path);
    }

    pub fn stage_update(&mut self, field_id: FieldId, value: String) {
        self.updated_fields.insert(field_id, value);
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.feed_errors.push(message.into());
    }

    pub fn files_to_delete(&self) -> &[PathBuf] {
        &self.files_to_delete
    }

    pub fn updated_fields(&self) -> &BTreeMap<FieldId, String> {
        &self.updated_fields
    }

    pub fn feed_errors(&self) -> &[String] {
        &self.feed_errors
    }

    pub fn take_updates(&mut self) -> BTreeMap<FieldId, String> {
        std::mem::take(&mut self.updated_fields)
    }

    /// Remove local copies registered during processing. Returns how many
    /// were deleted.
    pub async fn delete_registered_files(&mut self) -> usize {
        let mut deleted = 0;
        for path in self.files_to_delete.drain(..) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "deleted local upload");
                    deleted += 1;
                }
                Err(err) => warn!(path = %path.display(), %err, "failed to delete local upload"),
            }
        }
        deleted
    }
}

/// What a policy hook can see about the field being processed.
#[derive(Debug, Clone, Copy)]
pub struct FieldScope<'a> {
    pub form: &'a Form,
    pub feed: &'a FeedConfig,
    pub entry: &'a Entry,
    pub field_id: FieldId,
}

/// Overridable decisions about where files go and whether local copies stay.
pub trait UploadPolicy: Send + Sync {
    fn folder_path(&self, _scope: &FieldScope<'_>, configured: &str) -> String {
        configured.to_string()
    }

    fn file_name(&self, _scope: &FieldScope<'_>, name: &str) -> String {
        name.to_string()
    }

    fn store_local_version(&self, scope: &FieldScope<'_>, path: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUploadPolicy {
    pub keep_local: bool,
}

impl UploadPolicy for DefaultUploadPolicy {
    fn store_local_version(&self, _scope: &FieldScope<'_>, _path: &Path) -> bool {
        self.keep_local
    }
}

/// Maps public upload URLs back to files on local disk.
#[derive(Debug, Clone)]
pub struct LocalUploads {
    base_url: String,
    base_dir: PathBuf,
}

impl LocalUploads {
    pub fn new(base_url: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            base_dir: base_dir.into(),
        }
    }

    /// `None` for URLs outside the uploads tree.
    pub fn local_path(&self, url: &str) -> Option<PathBuf> {
        let rest = url.strip_prefix(&self.base_url)?.strip_prefix('/')?;
        if rest.is_empty() || rest.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return None;
        }
        Some(self.base_dir.join(rest))
    }
}

/// Entries of `after` whose revision was not present in `before`.
pub fn new_files(before: &[FileEntry], after: &[FileEntry]) -> Vec<FileEntry> {
    let seen: HashSet<&str> = before.iter().map(|f| f.rev.as_str()).collect();
    after
        .iter()
        .filter(|f| !seen.contains(f.rev.as_str()))
        .cloned()
        .collect()
}

/// File name for a fetched URL: last path segment without its query.
/// Sheets stops at column ZZZ.
pub const MAX_SHEET_COLUMNS: usize = 18_278;

/// Lay mapped field values out by column; unmapped columns stay empty.
pub fn sheet_row(feed: &FeedConfig, entry: &Entry) -> Result<Vec<String>, String> {
    if let Some(bad) = feed.field_map.iter().find(|m| m.column >= MAX_SHEET_COLUMNS) {
        return Err(format!(
            "Column {} mapped for field {} is out of range",
            bad.column, bad.field_id
        ));
    }
    let width = feed.field_map.iter().map(|m| m.column + 1).max().unwrap_or(0);
    let mut row = vec![String::new(); width];
    for mapping in &feed.field_map {
        row[mapping.column] = entry.value(mapping.field_id).to_string();
    }
    Ok(row)
}

pub fn remote_file_name(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    basename(without_query).to_string()
}

pub struct FieldProcessor {
    host: Arc<dyn FormsHost>,
    tokens: Arc<TokenManager>,
    connector: Arc<dyn Connector>,
    policy: Arc<dyn UploadPolicy>,
    uploads: LocalUploads,
    poll_interval: Duration,
    max_polls: u32,
}

impl FieldProcessor {
    pub fn new(
        host: Arc<dyn FormsHost>,
        tokens: Arc<TokenManager>,
        connector: Arc<dyn Connector>,
        policy: Arc<dyn UploadPolicy>,
        uploads: LocalUploads,
    ) -> Self {
        Self {
            host,
            tokens,
            connector,
            policy,
            uploads,
            poll_interval: Duration::from_secs(2),
            max_polls: 150,
        }
    }

    pub fn from_config(
        cfg: &Config,
        host: Arc<dyn FormsHost>,
        tokens: Arc<TokenManager>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let policy = Arc::new(DefaultUploadPolicy {
            keep_local: cfg.uploads.keep_local,
        });
        let uploads = LocalUploads::new(&cfg.uploads.base_url, &cfg.uploads.base_dir);
        Self::new(host, tokens, connector, policy, uploads)
            .with_polling(cfg.job_poll_interval(), cfg.uploads.max_job_polls)
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn UploadPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Run one feed over the entry and return it with rewritten values.
    #[instrument(skip_all, fields(feed_id = feed.id, entry_id = entry.id))]
    pub async fn process_feed(
        &self,
        feed: &FeedConfig,
        mut entry: Entry,
        form: &Form,
        rctx: &mut RequestContext,
    ) -> Entry {
        let token = match self.tokens.ensure_valid_token().await {
            Ok(token) => token,
            Err(err) => {
                let message = match err {
                    BridgeError::Auth(AuthError::NotConfigured) => NOT_INITIALIZED.to_string(),
                    other => format!("{NOT_INITIALIZED} {other}"),
                };
                self.feed_error(feed, &entry, None, rctx, message).await;
                return entry;
            }
        };
        let client = self.connector.connect(&token.access_token);

        let targets: Vec<(FieldId, UploadCategory)> = form
            .upload_fields()
            .filter(|(field, _)| feed.upload_field.matches(field.id))
            .map(|(field, category)| (field.id, category))
            .collect();

        for (field_id, category) in targets {
            if entry.is_blank(field_id) {
                debug!(field_id, "field empty; skipping");
                continue;
            }
            let value = entry.value(field_id).to_string();
            let scope = FieldScope {
                form,
                feed,
                entry: &entry,
                field_id,
            };
            let rewritten = match category {
                UploadCategory::DirectUpload { multiple: false } => {
                    Some(self.upload_local_file(client.as_ref(), &scope, &value, rctx).await)
                }
                UploadCategory::DirectUpload { multiple: true } => {
                    self.upload_local_files(client.as_ref(), &scope, &value, rctx).await
                }
                UploadCategory::RemoteUrlUpload => {
                    self.save_remote_urls(client.as_ref(), &scope, &value, rctx).await
                }
            };
            let Some(new_value) = rewritten else {
                continue;
            };

            if let Err(err) = self
                .host
                .update_entry_field(entry.id, field_id, &new_value)
                .await
            {
                let message = format!("Unable to save field {field_id}: {err}");
                self.feed_error(feed, &entry, Some(field_id), rctx, message).await;
            }
            entry.values.insert(field_id, new_value.clone());
            rctx.stage_update(field_id, new_value);
        }

        if !feed.sheet_id.trim().is_empty() && !feed.field_map.is_empty() {
            self.append_row(client.as_ref(), feed, &entry, rctx).await;
        }
        entry
    }

    async fn feed_error(
        &self,
        feed: &FeedConfig,
        entry: &Entry,
        field_id: Option<FieldId>,
        rctx: &mut RequestContext,
        message: String,
    ) {
        warn!(feed_id = feed.id, entry_id = entry.id, ?field_id, "{message}");
        if let Err(err) = self
            .host
            .add_feed_error(feed.id, entry.id, entry.form_id, &message)
            .await
        {
            warn!(%err, feed_id = feed.id, entry_id = entry.id, "failed to record feed error");
        }
        rctx.record_error(message);
    }

    /// Upload one local file and return its link, or the original URL when
    /// anything fails.
    async fn upload_local_file(
        &self,
        client: &dyn CapabilityClient,
        scope: &FieldScope<'_>,
        url: &str,
        rctx: &mut RequestContext,
    ) -> String {
        let (feed, entry) = (scope.feed, scope.entry);
        let field = Some(scope.field_id);

        let Some(local) = self.uploads.local_path(url) else {
            let message = format!("Unable to upload file {url}: not a local upload");
            self.feed_error(feed, entry, field, rctx, message).await;
            return url.to_string();
        };

        let folder = normalize_path(&self.policy.folder_path(scope, &feed.destination_folder));
        match client.get_metadata(&folder).await {
            Ok(Some(meta)) if !meta.is_dir => {
                let message = format!("Unable to upload file {url}: {folder} is not a folder");
                self.feed_error(feed, entry, field, rctx, message).await;
                return url.to_string();
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(err) = client.create_folder(&folder).await {
                    let message = format!("Unable to create folder {folder}: {err}");
                    self.feed_error(feed, entry, field, rctx, message).await;
                    return url.to_string();
                }
            }
            Err(err) => {
                let message = format!("Unable to read folder {folder}: {err}");
                self.feed_error(feed, entry, field, rctx, message).await;
                return url.to_string();
            }
        }

        let local_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut name = self.policy.file_name(scope, &local_name);
        if name.trim().is_empty() {
            name = local_name;
        }

        let file = match tokio::fs::File::open(&local).await {
            Ok(file) => file,
            Err(err) => {
                let message = format!("Unable to open {}: {err}", local.display());
                self.feed_error(feed, entry, field, rctx, message).await;
                return url.to_string();
            }
        };
        let uploaded = match client
            .upload_bytes(&join_path(&folder, &name), Box::pin(ReaderStream::new(file)))
            .await
        {
            Ok(uploaded) => uploaded,
            Err(err) => {
                let message = format!("Unable to upload file {url}: {err}");
                self.feed_error(feed, entry, field, rctx, message).await;
                return url.to_string();
            }
        };

        if self.policy.store_local_version(scope, &local) {
            rctx.deregister_deletion(&local);
        } else {
            rctx.register_deletion(local);
        }

        let remote_path = join_path(&folder, basename(&uploaded.path));
        match client.create_shareable_link(&remote_path).await {
            Ok(link) => {
                info!(entry_id = entry.id, field_id = scope.field_id, %remote_path, "file uploaded");
                link
            }
            Err(err) => {
                let message = format!("Unable to share {remote_path}: {err}");
                self.feed_error(feed, entry, field, rctx, message).await;
                url.to_string()
            }
        }
    }

    async fn upload_local_files(
        &self,
        client: &dyn CapabilityClient,
        scope: &FieldScope<'_>,
        value: &str,
        rctx: &mut RequestContext,
    ) -> Option<String> {
        let urls: Vec<String> = match serde_json::from_str(value) {
            Ok(urls) => urls,
            Err(err) => {
                let message = format!("Unable to read file list: {err}");
                self.feed_error(scope.feed, scope.entry, Some(scope.field_id), rctx, message)
                    .await;
                return None;
            }
        };
        let mut links = Vec::with_capacity(urls.len());
        for url in &urls {
            links.push(self.upload_local_file(client, scope, url, rctx).await);
        }
        serde_json::to_string(&links).ok()
    }

    async fn save_remote_urls(
        &self,
        client: &dyn CapabilityClient,
        scope: &FieldScope<'_>,
        value: &str,
        rctx: &mut RequestContext,
    ) -> Option<String> {
        let mut files: Vec<String> = match serde_json::from_str(value) {
            Ok(files) => files,
            Err(_) if value.starts_with("http") => vec![value.to_string()],
            Err(err) => {
                let message = format!("Unable to read file list: {err}");
                self.feed_error(scope.feed, scope.entry, Some(scope.field_id), rctx, message)
                    .await;
                return None;
            }
        };
        let destination =
            normalize_path(&self.policy.folder_path(scope, &scope.feed.destination_folder));

        for slot in files.iter_mut() {
            if let Some(link) = self
                .save_remote_url(client, scope, &destination, slot, rctx)
                .await
            {
                *slot = link;
            }
        }
        serde_json::to_string(&files).ok()
    }

    /// Fetch one URL into `destination`; `None` leaves the value as it was.
    async fn save_remote_url(
        &self,
        client: &dyn CapabilityClient,
        scope: &FieldScope<'_>,
        destination: &str,
        url: &str,
        rctx: &mut RequestContext,
    ) -> Option<String> {
        let (feed, entry) = (scope.feed, scope.entry);
        let field = Some(scope.field_id);

        let before = match client.get_metadata(destination).await {
            Ok(Some(meta)) => meta.contents,
            Ok(None) => match client.create_folder(destination).await {
                Ok(meta) => meta.contents,
                Err(err) => {
                    let message = format!("Unable to create folder {destination}: {err}");
                    self.feed_error(feed, entry, field, rctx, message).await;
                    return None;
                }
            },
            Err(err) => {
                let message = format!("Unable to read folder {destination}: {err}");
                self.feed_error(feed, entry, field, rctx, message).await;
                return None;
            }
        };

        let fetched_name = remote_file_name(url);
        let mut name = self.policy.file_name(scope, &fetched_name);
        if name.trim().is_empty() {
            name = fetched_name;
        }

        let job = match client.save_remote_url(url, &join_path(destination, &name)).await {
            Ok(job) => job,
            Err(err) => {
                let message = format!("Unable to upload file {url}: {err}");
                self.feed_error(feed, entry, field, rctx, message).await;
                return None;
            }
        };
        if job.status == JobStatus::Failed {
            let message = format!("Unable to upload file: {url}");
            self.feed_error(feed, entry, field, rctx, message).await;
            return None;
        }

        match self.wait_for_job(client, &job).await {
            Ok(JobStatus::Complete) => {}
            Ok(_) => {
                let message = format!("Unable to upload file: {url}");
                self.feed_error(feed, entry, field, rctx, message).await;
                return None;
            }
            Err(message) => {
                self.feed_error(feed, entry, field, rctx, message).await;
                return None;
            }
        }

        let after = match client.get_metadata(destination).await {
            Ok(Some(meta)) => meta.contents,
            Ok(None) => Vec::new(),
            Err(err) => {
                let message = format!("Unable to read folder {destination}: {err}");
                self.feed_error(feed, entry, field, rctx, message).await;
                return None;
            }
        };
        let Some(uploaded) = new_files(&before, &after).into_iter().next() else {
            let message = format!("Uploaded file for {url} not found in {destination}");
            self.feed_error(feed, entry, field, rctx, message).await;
            return None;
        };

        match client.create_shareable_link(&uploaded.path).await {
            Ok(link) => Some(link),
            Err(err) => {
                let message = format!("Unable to share {}: {err}", uploaded.path);
                self.feed_error(feed, entry, field, rctx, message).await;
                None
            }
        }
    }

    /// Poll until the job is terminal or the poll budget runs out.
    async fn wait_for_job(
        &self,
        client: &dyn CapabilityClient,
        job: &RemoteJob,
    ) -> Result<JobStatus, String> {
        let mut status = job.status;
        let mut polls = 0;
        while !status.is_terminal() {
            if polls >= self.max_polls {
                return Err(format!(
                    "Gave up waiting for job {} after {polls} polls",
                    job.job_id
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
            status = client
                .poll_job(&job.job_id)
                .await
                .map_err(|err| format!("Unable to poll job {}: {err}", job.job_id))?
                .status;
            polls += 1;
        }
        Ok(status)
    }

    async fn append_row(
        &self,
        client: &dyn CapabilityClient,
        feed: &FeedConfig,
        entry: &Entry,
        rctx: &mut RequestContext,
    ) {
        let row = match sheet_row(feed, entry) {
            Ok(row) => row,
            Err(message) => {
                self.feed_error(feed, entry, None, rctx, message).await;
                return;
            }
        };
        match client.append_row(&feed.sheet_id, &row).await {
            Ok(range) => info!(feed_id = feed.id, entry_id = entry.id, %range, "row appended"),
            Err(err) => {
                let message = format!("Unable to append row to sheet {}: {err}", feed.sheet_id);
                self.feed_error(feed, entry, None, rctx, message).await;
            }
        }
    }
}
