//! Drive and Sheets behind the small capability surface the feed pipeline
//! needs.
//!
//! Drive has no path addressing, so paths like `/uploads/cv.pdf` are resolved
//! one segment at a time by child-name queries starting at `root`. Drive also
//! has no server-side "fetch this URL" call; [`GoogleApiClient::save_remote_url`]
//! runs the download-and-upload as a detached task and exposes it as a
//! pollable job.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::RemoteError;
use crate::model::{FileEntry, JobStatus, Metadata, RemoteJob, SpreadsheetFile, UploadResult};

use self::model::{
    cell_text, AppendReq, AppendResp, CreateFileReq, DriveFile, FileList, PermissionReq, ValueRange,
    FOLDER_MIME, SPREADSHEET_MIME,
};

pub mod model;
pub mod oauth;

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";
const FILE_FIELDS: &str = "id,name,mimeType,headRevisionId,md5Checksum";

pub type RemoteResult<T> = Result<T, RemoteError>;

/// File contents streamed to [`CapabilityClient::upload_bytes`].
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

static QUERY_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?.*").expect("valid regex"));

/// Remote operations used by feeds and the admin endpoints. Nothing here
/// retries on its own; callers check [`RemoteError::is_retryable`].
#[async_trait]
pub trait CapabilityClient: Send + Sync {
    /// Spreadsheets visible to the account. Failures are logged and yield an
    /// empty list.
    async fn list_spreadsheet_files(&self) -> Vec<SpreadsheetFile>;

    /// Row 1 of the sheet, empty when unavailable.
    async fn get_header_row(&self, sheet_id: &str) -> Vec<String>;

    /// `Ok(None)` when nothing exists at `path`.
    async fn get_metadata(&self, path: &str) -> RemoteResult<Option<Metadata>>;

    async fn create_folder(&self, path: &str) -> RemoteResult<Metadata>;

    async fn upload_bytes(&self, path: &str, data: ByteStream) -> RemoteResult<UploadResult>;

    /// Public link to `path` with any query string removed.
    async fn create_shareable_link(&self, path: &str) -> RemoteResult<String>;

    async fn save_remote_url(&self, source_url: &str, destination_path: &str)
        -> RemoteResult<RemoteJob>;

    /// Single poll; the caller owns the loop.
    async fn poll_job(&self, job_id: &str) -> RemoteResult<RemoteJob>;

    /// Append one row; returns the updated range.
    async fn append_row(&self, sheet_id: &str, values: &[String]) -> RemoteResult<String>;
}

/// Binds a capability client to an access token.
pub trait Connector: Send + Sync {
    fn connect(&self, access_token: &str) -> Arc<dyn CapabilityClient>;
}

impl<F> Connector for F
where
    F: Fn(&str) -> Arc<dyn CapabilityClient> + Send + Sync,
{
    fn connect(&self, access_token: &str) -> Arc<dyn CapabilityClient> {
        self(access_token)
    }
}

pub fn strip_query(link: &str) -> String {
    QUERY_SUFFIX.replace(link, "").into_owned()
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Canonical form: leading slash, no trailing or doubled slashes.
pub fn normalize_path(path: &str) -> String {
    format!("/{}", segments(path).join("/"))
}

pub fn join_path(dir: &str, name: &str) -> String {
    let dir = normalize_path(dir);
    let name = name.trim_matches('/');
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Split into (parent directory, last segment).
pub fn split_parent(path: &str) -> (String, String) {
    let mut segs = segments(path);
    let name = segs.pop().unwrap_or_default().to_string();
    (format!("/{}", segs.join("/")), name)
}

pub fn basename(path: &str) -> &str {
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("")
}

fn escape_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Jobs nobody polled to completion are forgotten after this long.
const JOB_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
struct TrackedJob {
    status: JobStatus,
    touched: Instant,
}

type JobTable = Arc<Mutex<HashMap<String, TrackedJob>>>;

fn prune_jobs(jobs: &mut HashMap<String, TrackedJob>, now: Instant) {
    jobs.retain(|_, job| now.saturating_duration_since(job.touched) < JOB_TTL);
}

#[derive(Clone)]
struct Endpoints {
    drive: String,
    upload: String,
    sheets: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            drive: DRIVE_API_BASE.to_string(),
            upload: DRIVE_UPLOAD_BASE.to_string(),
            sheets: SHEETS_API_BASE.to_string(),
        }
    }
}

/// Drive v3 + Sheets v4 client bound to one access token.
#[derive(Clone)]
pub struct GoogleApiClient {
    http: Client,
    token: String,
    endpoints: Endpoints,
    jobs: JobTable,
}

impl fmt::Debug for GoogleApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleApiClient")
            .field("drive", &self.endpoints.drive)
            .finish_non_exhaustive()
    }
}

impl GoogleApiClient {
    pub fn new(http: Client, access_token: impl Into<String>) -> Self {
        Self {
            http,
            token: access_token.into(),
            endpoints: Endpoints::default(),
            jobs: Arc::default(),
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> RemoteResult<T> {
        let res = req
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "google api error");
            return Err(RemoteError::from_status(status.as_u16(), body));
        }
        res.json::<T>()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    async fn list_files(&self, q: &str, fields: &str) -> RemoteResult<Vec<DriveFile>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self
                .http
                .get(format!("{}/files", self.endpoints.drive))
                .query(&[("q", q), ("fields", fields), ("pageSize", "1000")]);
            if let Some(token) = page_token.as_deref() {
                req = req.query(&[("pageToken", token)]);
            }
            let page: FileList = self.send_json(req).await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => return Ok(files),
            }
        }
    }

    async fn find_child(&self, parent_id: &str, name: &str) -> RemoteResult<Option<DriveFile>> {
        let q = format!(
            "'{}' in parents and name = '{}' and trashed = false",
            escape_query_literal(parent_id),
            escape_query_literal(name)
        );
        let fields = format!("nextPageToken,files({FILE_FIELDS})");
        Ok(self.list_files(&q, &fields).await?.into_iter().next())
    }

    async fn children(&self, parent_id: &str) -> RemoteResult<Vec<DriveFile>> {
        let q = format!("'{}' in parents and trashed = false", escape_query_literal(parent_id));
        let fields = format!("nextPageToken,files({FILE_FIELDS})");
        self.list_files(&q, &fields).await
    }

    fn root() -> DriveFile {
        DriveFile {
            id: "root".into(),
            name: String::new(),
            mime_type: FOLDER_MIME.into(),
            head_revision_id: None,
            md5_checksum: None,
            web_view_link: None,
        }
    }

    /// Walk `path` from the drive root.
    async fn resolve(&self, path: &str) -> RemoteResult<Option<DriveFile>> {
        let mut current = Self::root();
        for seg in segments(path) {
            if !current.is_folder() {
                return Ok(None);
            }
            match self.find_child(&current.id, seg).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    async fn create_child_folder(&self, parent_id: &str, name: &str) -> RemoteResult<DriveFile> {
        let body = CreateFileReq {
            name,
            mime_type: Some(FOLDER_MIME),
            parents: vec![parent_id],
        };
        let req = self
            .http
            .post(format!("{}/files", self.endpoints.drive))
            .query(&[("fields", FILE_FIELDS)])
            .json(&body);
        self.send_json(req).await
    }

    async fn fetch_into(&self, source_url: &str, destination_path: &str) -> RemoteResult<UploadResult> {
        let res = self
            .http
            .get(source_url)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        let status = res.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status.as_u16(), format!("fetching {source_url}")));
        }
        let stream = res
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        self.upload_bytes(destination_path, Box::pin(stream)).await
    }

    async fn set_job(&self, job_id: &str, status: JobStatus) {
        let now = Instant::now();
        let mut jobs = self.jobs.lock().await;
        prune_jobs(&mut jobs, now);
        jobs.insert(job_id.to_string(), TrackedJob { status, touched: now });
    }
}

#[async_trait]
impl CapabilityClient for GoogleApiClient {
    #[instrument(skip_all)]
    async fn list_spreadsheet_files(&self) -> Vec<SpreadsheetFile> {
        let q = format!("mimeType = '{SPREADSHEET_MIME}' and trashed = false");
        match self.list_files(&q, "nextPageToken,files(id,name)").await {
            Ok(files) => files
                .into_iter()
                .map(|f| SpreadsheetFile { id: f.id, name: f.name })
                .collect(),
            Err(err) => {
                warn!(%err, "failed to list spreadsheets");
                Vec::new()
            }
        }
    }

    #[instrument(skip_all, fields(sheet_id = %sheet_id))]
    async fn get_header_row(&self, sheet_id: &str) -> Vec<String> {
        let req = self
            .http
            .get(format!(
                "{}/spreadsheets/{}/values/1:1",
                self.endpoints.sheets, sheet_id
            ))
            .query(&[("majorDimension", "ROWS")]);
        match self.send_json::<ValueRange>(req).await {
            Ok(range) => range
                .values
                .into_iter()
                .next()
                .map(|row| row.iter().map(cell_text).collect())
                .unwrap_or_default(),
            Err(err) => {
                warn!(%err, sheet_id, "failed to read header row");
                Vec::new()
            }
        }
    }

    #[instrument(skip_all)]
    async fn get_metadata(&self, path: &str) -> RemoteResult<Option<Metadata>> {
        let path = normalize_path(path);
        let Some(file) = self.resolve(&path).await? else {
            return Ok(None);
        };
        let contents = if file.is_folder() {
            self.children(&file.id)
                .await?
                .into_iter()
                .map(|child| FileEntry {
                    path: join_path(&path, &child.name),
                    is_dir: child.is_folder(),
                    rev: child.revision(),
                    id: child.id,
                    name: child.name,
                })
                .collect()
        } else {
            Vec::new()
        };
        Ok(Some(Metadata {
            rev: file.revision(),
            is_dir: file.is_folder(),
            id: file.id,
            path,
            contents,
        }))
    }

    #[instrument(skip_all)]
    async fn create_folder(&self, path: &str) -> RemoteResult<Metadata> {
        let path = normalize_path(path);
        let mut current = Self::root();
        for seg in segments(&path) {
            current = match self.find_child(&current.id, seg).await? {
                Some(existing) if existing.is_folder() => existing,
                Some(_) => {
                    return Err(RemoteError::Status {
                        code: 409,
                        body: format!("{seg} exists and is not a folder"),
                    })
                }
                None => {
                    debug!(seg, "creating folder");
                    self.create_child_folder(&current.id, seg).await?
                }
            };
        }
        info!(%path, "folder ready");
        Ok(Metadata {
            rev: current.revision(),
            id: current.id,
            path,
            is_dir: true,
            contents: Vec::new(),
        })
    }

    #[instrument(skip_all)]
    async fn upload_bytes(&self, path: &str, data: ByteStream) -> RemoteResult<UploadResult> {
        let (dir, name) = split_parent(path);
        let parent = match self.resolve(&dir).await? {
            Some(parent) if parent.is_folder() => parent,
            Some(_) => return Err(RemoteError::NotFound(format!("{dir} is not a folder"))),
            None => return Err(RemoteError::NotFound(dir)),
        };

        let body = CreateFileReq {
            name: &name,
            mime_type: None,
            parents: vec![parent.id.as_str()],
        };
        let init = self
            .http
            .post(format!("{}/files", self.endpoints.upload))
            .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        let status = init.status();
        if !status.is_success() {
            let body = init.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status.as_u16(), body));
        }
        let session = init
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| RemoteError::InvalidResponse("resumable upload without Location".into()))?;

        let req = self.http.put(session).body(reqwest::Body::wrap_stream(data));
        let file: DriveFile = self.send_json(req).await?;
        info!(file_id = %file.id, %dir, name = %file.name, "uploaded file");
        Ok(UploadResult {
            path: join_path(&dir, &file.name),
            id: file.id,
            name: file.name,
        })
    }

    #[instrument(skip_all)]
    async fn create_shareable_link(&self, path: &str) -> RemoteResult<String> {
        let file = self
            .resolve(path)
            .await?
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;

        let grant = self
            .http
            .post(format!("{}/files/{}/permissions", self.endpoints.drive, file.id))
            .json(&PermissionReq {
                role: "reader",
                kind: "anyone",
            });
        let _: Value = self.send_json(grant).await?;

        let req = self
            .http
            .get(format!("{}/files/{}", self.endpoints.drive, file.id))
            .query(&[("fields", "id,webViewLink")]);
        let with_link: DriveFile = self.send_json(req).await?;
        let link = with_link
            .web_view_link
            .ok_or_else(|| RemoteError::InvalidResponse("file has no webViewLink".into()))?;
        Ok(strip_query(&link))
    }

    async fn save_remote_url(
        &self,
        source_url: &str,
        destination_path: &str,
    ) -> RemoteResult<RemoteJob> {
        let job_id = Uuid::new_v4().to_string();
        let fetchable = url::Url::parse(source_url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !fetchable {
            warn!(source_url, "refusing to fetch non-http url");
            return Ok(RemoteJob {
                job_id,
                status: JobStatus::Failed,
            });
        }

        self.set_job(&job_id, JobStatus::Pending).await;
        let this = self.clone();
        let (id, source, dest) = (job_id.clone(), source_url.to_string(), destination_path.to_string());
        tokio::spawn(async move {
            this.set_job(&id, JobStatus::Running).await;
            let status = match this.fetch_into(&source, &dest).await {
                Ok(uploaded) => {
                    info!(job_id = %id, path = %uploaded.path, "save-url job complete");
                    JobStatus::Complete
                }
                Err(err) => {
                    warn!(job_id = %id, %err, "save-url job failed");
                    JobStatus::Failed
                }
            };
            this.set_job(&id, status).await;
        });

        Ok(RemoteJob {
            job_id,
            status: JobStatus::Pending,
        })
    }

    /// A terminal status is reported once; the job is then forgotten.
    async fn poll_job(&self, job_id: &str) -> RemoteResult<RemoteJob> {
        let mut jobs = self.jobs.lock().await;
        let status = jobs
            .get(job_id)
            .map(|job| job.status)
            .ok_or_else(|| RemoteError::NotFound(format!("job {job_id}")))?;
        if status.is_terminal() {
            jobs.remove(job_id);
        }
        Ok(RemoteJob {
            job_id: job_id.to_string(),
            status,
        })
    }

    #[instrument(skip_all, fields(sheet_id = %sheet_id))]
    async fn append_row(&self, sheet_id: &str, values: &[String]) -> RemoteResult<String> {
        let req = self
            .http
            .post(format!(
                "{}/spreadsheets/{}/values/A1:append",
                self.endpoints.sheets, sheet_id
            ))
            .query(&[
                ("valueInputOption", "USER_ENTERED"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&AppendReq {
                major_dimension: "ROWS",
                values: vec![values],
            });
        let resp: AppendResp = self.send_json(req).await?;
        Ok(resp.updates.map(|u| u.updated_range).unwrap_or_default())
    }
}

/// Hands out [`GoogleApiClient`]s that share one connection pool and one job
/// table, so a job started under one token can be polled under the next.
#[derive(Clone)]
pub struct GoogleConnector {
    http: Client,
    endpoints: Endpoints,
    jobs: JobTable,
}

impl GoogleConnector {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            endpoints: Endpoints::default(),
            jobs: Arc::default(),
        }
    }
}

impl Connector for GoogleConnector {
    fn connect(&self, access_token: &str) -> Arc<dyn CapabilityClient> {
        Arc::new(GoogleApiClient {
            http: self.http.clone(),
            token: access_token.to_string(),
            endpoints: self.endpoints.clone(),
            jobs: self.jobs.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shareable_links_lose_their_query() {
        assert_eq!(
            strip_query("https://drive.google.com/file/d/abc/view?usp=drivesdk"),
            "https://drive.google.com/file/d/abc/view"
        );
        assert_eq!(strip_query("https://x/y"), "https://x/y");
        assert!(!strip_query("https://x/y?a=1?b=2").contains('?'));
    }

    #[test]
    fn path_helpers() {
        assert_eq!(normalize_path("uploads//2024/"), "/uploads/2024");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(join_path("/", "a.pdf"), "/a.pdf");
        assert_eq!(join_path("uploads", "/a.pdf"), "/uploads/a.pdf");
        assert_eq!(split_parent("/uploads/a.pdf"), ("/uploads".into(), "a.pdf".into()));
        assert_eq!(split_parent("/a.pdf"), ("/".into(), "a.pdf".into()));
        assert_eq!(basename("/uploads/a.pdf"), "a.pdf");
        assert_eq!(basename("https://host/x/y.png"), "y.png");
    }

    #[test]
    fn query_literals_are_escaped() {
        assert_eq!(escape_query_literal("O'Brien"), "O\\'Brien");
        assert_eq!(escape_query_literal("a\\b"), "a\\\\b");
    }

    #[test]
    fn revision_falls_back_to_id() {
        let f: DriveFile = serde_json::from_str(r#"{"id":"f1","name":"a","mimeType":"text/plain"}"#).unwrap();
        assert_eq!(f.revision(), "f1");
        assert!(!f.is_folder());
        let f: DriveFile =
            serde_json::from_str(r#"{"id":"f1","headRevisionId":"r9","mimeType":"text/plain"}"#).unwrap();
        assert_eq!(f.revision(), "r9");
    }

    #[tokio::test]
    async fn non_http_source_is_failed_immediately() {
        let client = GoogleApiClient::new(Client::new(), "t");
        let job = client.save_remote_url("ftp://host/file", "/in/file").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(matches!(client.poll_job(&job.job_id).await, Err(RemoteError::NotFound(_))));
        assert!(client.jobs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn finished_jobs_leave_the_shared_table() {
        let connector = GoogleConnector::new(Client::new());
        let client = GoogleApiClient {
            http: connector.http.clone(),
            token: "t".into(),
            endpoints: connector.endpoints.clone(),
            jobs: connector.jobs.clone(),
        };
        for i in 0..100 {
            let id = format!("job-{i}");
            client.set_job(&id, JobStatus::Running).await;
            assert_eq!(client.poll_job(&id).await.unwrap().status, JobStatus::Running);
            let status = if i % 2 == 0 { JobStatus::Complete } else { JobStatus::Failed };
            client.set_job(&id, status).await;
            assert_eq!(client.poll_job(&id).await.unwrap().status, status);
        }
        assert!(connector.jobs.lock().await.is_empty());
        assert!(matches!(client.poll_job("job-0").await, Err(RemoteError::NotFound(_))));
    }

    #[test]
    fn abandoned_jobs_expire() {
        let now = Instant::now();
        let mut jobs = HashMap::from([
            ("fresh".to_string(), TrackedJob { status: JobStatus::Running, touched: now }),
            (
                "stale".to_string(),
                TrackedJob {
                    status: JobStatus::Pending,
                    touched: now,
                },
            ),
        ]);
        prune_jobs(&mut jobs, now + JOB_TTL - Duration::from_secs(1));
        assert_eq!(jobs.len(), 2);
        jobs.get_mut("fresh").unwrap().touched = now + JOB_TTL;
        prune_jobs(&mut jobs, now + JOB_TTL);
        assert_eq!(jobs.keys().collect::<Vec<_>>(), ["fresh"]);
    }
}
