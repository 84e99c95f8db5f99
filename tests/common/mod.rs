#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use sheets_bridge::db::{self, SqliteHost};
use sheets_bridge::dispatch::{FollowUpRequest, FollowUpTransport};
use sheets_bridge::error::{AuthError, BridgeResult, RemoteError};
use sheets_bridge::google::{split_parent, ByteStream, CapabilityClient, Connector, RemoteResult};
use sheets_bridge::model::{
    FeedCondition, FeedConfig, Field, FieldMapping, FieldType, FileEntry, Form, FormId, JobStatus,
    Metadata, Notification, RemoteJob, SpreadsheetFile, UploadFieldSelector, UploadResult,
};
use sheets_bridge::nonce::{NonceSigner, UPLOAD_ACTION};
use sheets_bridge::processor::{DefaultUploadPolicy, FieldProcessor, LocalUploads};
use sheets_bridge::settings::{PluginSettings, SettingsStore};
use sheets_bridge::token::{Credentials, EndpointFactory, Token, TokenEndpoint, TokenGrant, TokenManager};
use sqlx::sqlite::SqlitePoolOptions;

pub const UPLOAD_BASE: &str = "https://forms.example.com/uploads";

pub async fn setup_host() -> Arc<SqliteHost> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    Arc::new(SqliteHost::new(pool))
}

/// Store OAuth credentials and an access token valid for the next hour.
pub async fn authorize(host: &SqliteHost) {
    let stored = host.load().await.unwrap();
    let settings = PluginSettings {
        client_id: "cid".into(),
        client_secret: "secret".into(),
        access_token: Some(Token {
            access_token: "ya29.test".into(),
            refresh_token: Some("rt-1".into()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }),
        ..Default::default()
    };
    host.save(&settings, stored.revision).await.unwrap();
}

/// Token endpoint that never hands out anything.
struct DenyingEndpoint;

#[async_trait]
impl TokenEndpoint for DenyingEndpoint {
    fn authorization_url(&self) -> String {
        "https://accounts.example/consent".into()
    }

    async fn exchange_code(&self, _code: &str) -> Result<TokenGrant, AuthError> {
        Err(AuthError::InvalidGrant("unknown code".into()))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, AuthError> {
        Err(AuthError::RefreshDenied("not in tests".into()))
    }

    async fn revoke(&self, _token: &str) -> Result<(), RemoteError> {
        Ok(())
    }
}

pub struct DenyingFactory;

impl EndpointFactory for DenyingFactory {
    fn build(&self, _credentials: &Credentials) -> Arc<dyn TokenEndpoint> {
        Arc::new(DenyingEndpoint)
    }
}

pub fn token_manager(host: Arc<SqliteHost>) -> Arc<TokenManager> {
    Arc::new(TokenManager::new(
        host,
        Arc::new(DenyingFactory),
        None,
        "https://bridge.example/auth/callback",
    ))
}

pub fn signer() -> NonceSigner {
    NonceSigner::new("test-secret", UPLOAD_ACTION, 86_400)
}

pub fn processor(
    host: Arc<SqliteHost>,
    tokens: Arc<TokenManager>,
    drive: Arc<RecordingDrive>,
    uploads_dir: &Path,
) -> FieldProcessor {
    FieldProcessor::new(
        host,
        tokens,
        Arc::new(FixedConnector(drive)),
        Arc::new(DefaultUploadPolicy { keep_local: false }),
        LocalUploads::new(UPLOAD_BASE, uploads_dir),
    )
    .with_polling(Duration::from_millis(1), 5)
}

/// Write `contents` under the uploads dir and return its public URL.
pub fn local_upload(uploads_dir: &Path, rel: &str, contents: &str) -> String {
    let path = uploads_dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    format!("{UPLOAD_BASE}/{rel}")
}

fn notification(id: &str, event: &str, is_active: bool) -> Notification {
    Notification {
        id: id.into(),
        name: format!("{id} notice"),
        event: event.into(),
        is_active,
    }
}

fn field(id: u32, label: &str, input_type: FieldType, multiple_files: bool) -> Field {
    Field {
        id,
        label: label.into(),
        input_type,
        multiple_files,
    }
}

/// Fields: 1 CV (single upload), 2 Name, 3 Portfolio (multi upload),
/// 5 Links (remote URLs).
pub fn application_form(id: FormId) -> Form {
    Form {
        id,
        title: "Applications".into(),
        fields: vec![
            field(1, "CV", FieldType::FileUpload, false),
            field(2, "Name", FieldType::Text, false),
            field(3, "Portfolio", FieldType::FileUpload, true),
            field(5, "Links", FieldType::DriveUpload, false),
        ],
        notifications: vec![
            notification("admin", "form_submission", true),
            notification("applicant", "form_submission", true),
            notification("billing", "payment_completed", true),
            notification("legacy", "user_registered", false),
        ],
    }
}

pub fn feed(form_id: FormId, name: &str, upload_field: UploadFieldSelector, folder: &str) -> FeedConfig {
    FeedConfig {
        id: 0,
        form_id,
        name: name.into(),
        is_active: true,
        sheet_id: String::new(),
        destination_folder: folder.into(),
        field_map: Vec::new(),
        condition: FeedCondition::default(),
        upload_field,
    }
}

pub fn with_sheet(mut feed: FeedConfig, sheet_id: &str, columns: &[(u32, usize)]) -> FeedConfig {
    feed.sheet_id = sheet_id.into();
    feed.field_map = columns
        .iter()
        .map(|&(field_id, column)| FieldMapping { field_id, column })
        .collect();
    feed
}

/// Store the form and its feeds; returns the feeds with their ids.
pub async fn install(host: &SqliteHost, form: &Form, feeds: Vec<FeedConfig>) -> Vec<FeedConfig> {
    db::upsert_form(host.pool(), form).await.unwrap();
    let mut stored = Vec::new();
    for mut feed in feeds {
        feed.id = db::insert_feed(host.pool(), &feed).await.unwrap();
        stored.push(feed);
    }
    stored
}

pub fn values(pairs: &[(u32, &str)]) -> BTreeMap<u32, String> {
    pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
}

/// Captures follow-up calls instead of delivering them.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<FollowUpRequest>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<FollowUpRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl FollowUpTransport for RecordingTransport {
    async fn send(&self, request: FollowUpRequest) -> BridgeResult<()> {
        self.sent.lock().unwrap().push(request);
        Ok(())
    }
}

#[derive(Default)]
struct DriveState {
    folders: BTreeMap<String, Vec<FileEntry>>,
    next_id: usize,
    jobs: HashMap<String, (String, String)>,
    failing_urls: HashSet<String>,
    rejected_urls: HashSet<String>,
    stalled_urls: HashSet<String>,
    created_folders: Vec<String>,
    uploads: Vec<(String, Vec<u8>)>,
    saved_urls: Vec<(String, String)>,
    rows: Vec<(String, Vec<String>)>,
}

impl DriveState {
    fn add_file(&mut self, path: &str) -> RemoteResult<FileEntry> {
        let (parent, name) = split_parent(path);
        self.next_id += 1;
        let n = self.next_id;
        let files = self
            .folders
            .get_mut(&parent)
            .ok_or_else(|| RemoteError::NotFound(parent.clone()))?;
        let entry = FileEntry {
            id: format!("f{n}"),
            name,
            path: path.to_string(),
            is_dir: false,
            rev: format!("rev-{n}"),
        };
        files.push(entry.clone());
        Ok(entry)
    }

    fn find_file(&self, path: &str) -> Option<&FileEntry> {
        let (parent, _) = split_parent(path);
        self.folders.get(&parent)?.iter().find(|f| f.path == path)
    }
}

/// In-memory Drive/Sheets recording every mutating call.
#[derive(Default)]
pub struct RecordingDrive {
    state: Mutex<DriveState>,
}

impl RecordingDrive {
    /// Remote fetches of `url` end in FAILED.
    pub fn fail_url(&self, url: &str) {
        self.state.lock().unwrap().failing_urls.insert(url.to_string());
    }

    /// Remote fetches of `url` are refused when the job is created.
    pub fn reject_url(&self, url: &str) {
        self.state.lock().unwrap().rejected_urls.insert(url.to_string());
    }

    /// Remote fetches of `url` stay pending forever.
    pub fn stall_url(&self, url: &str) {
        self.state.lock().unwrap().stalled_urls.insert(url.to_string());
    }

    pub fn open_jobs(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    pub fn created_folders(&self) -> Vec<String> {
        self.state.lock().unwrap().created_folders.clone()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn saved_urls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().saved_urls.clone()
    }

    pub fn rows(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().rows.clone()
    }
}

#[async_trait]
impl CapabilityClient for RecordingDrive {
    async fn list_spreadsheet_files(&self) -> Vec<SpreadsheetFile> {
        vec![
            SpreadsheetFile {
                id: "sheet-1".into(),
                name: "Leads".into(),
            },
            SpreadsheetFile {
                id: "sheet-2".into(),
                name: "Archive".into(),
            },
        ]
    }

    async fn get_header_row(&self, sheet_id: &str) -> Vec<String> {
        match sheet_id {
            "sheet-1" => vec!["Name".into(), "CV".into()],
            _ => Vec::new(),
        }
    }

    async fn get_metadata(&self, path: &str) -> RemoteResult<Option<Metadata>> {
        let state = self.state.lock().unwrap();
        if let Some(contents) = state.folders.get(path) {
            return Ok(Some(Metadata {
                id: format!("folder:{path}"),
                path: path.to_string(),
                is_dir: true,
                rev: String::new(),
                contents: contents.clone(),
            }));
        }
        Ok(state.find_file(path).map(|f| Metadata {
            id: f.id.clone(),
            path: f.path.clone(),
            is_dir: false,
            rev: f.rev.clone(),
            contents: Vec::new(),
        }))
    }

    async fn create_folder(&self, path: &str) -> RemoteResult<Metadata> {
        let mut state = self.state.lock().unwrap();
        state.created_folders.push(path.to_string());
        state.folders.entry(path.to_string()).or_default();
        Ok(Metadata {
            id: format!("folder:{path}"),
            path: path.to_string(),
            is_dir: true,
            rev: String::new(),
            contents: Vec::new(),
        })
    }

    async fn upload_bytes(&self, path: &str, mut data: ByteStream) -> RemoteResult<UploadResult> {
        let mut bytes = Vec::new();
        while let Some(chunk) = data.next().await {
            let chunk = chunk.map_err(|e| RemoteError::Transport(e.to_string()))?;
            bytes.extend_from_slice(&chunk);
        }
        let mut state = self.state.lock().unwrap();
        let file = state.add_file(path)?;
        state.uploads.push((path.to_string(), bytes));
        Ok(UploadResult {
            id: file.id,
            name: file.name,
            path: file.path,
        })
    }

    async fn create_shareable_link(&self, path: &str) -> RemoteResult<String> {
        let state = self.state.lock().unwrap();
        state
            .find_file(path)
            .map(|f| format!("https://drive.google.com/file/d/{}/view", f.id))
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn save_remote_url(&self, source_url: &str, destination_path: &str) -> RemoteResult<RemoteJob> {
        let mut state = self.state.lock().unwrap();
        state
            .saved_urls
            .push((source_url.to_string(), destination_path.to_string()));
        state.next_id += 1;
        let job_id = format!("job-{}", state.next_id);
        if state.rejected_urls.contains(source_url) {
            return Ok(RemoteJob {
                job_id,
                status: JobStatus::Failed,
            });
        }
        state.jobs.insert(
            job_id.clone(),
            (source_url.to_string(), destination_path.to_string()),
        );
        Ok(RemoteJob {
            job_id,
            status: JobStatus::Pending,
        })
    }

    async fn poll_job(&self, job_id: &str) -> RemoteResult<RemoteJob> {
        let mut state = self.state.lock().unwrap();
        let (url, destination) = state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(job_id.to_string()))?;
        if state.stalled_urls.contains(&url) {
            return Ok(RemoteJob {
                job_id: job_id.to_string(),
                status: JobStatus::Running,
            });
        }
        state.jobs.remove(job_id);
        let status = if state.failing_urls.contains(&url) {
            JobStatus::Failed
        } else {
            state.add_file(&destination)?;
            JobStatus::Complete
        };
        Ok(RemoteJob {
            job_id: job_id.to_string(),
            status,
        })
    }

    async fn append_row(&self, sheet_id: &str, values: &[String]) -> RemoteResult<String> {
        let mut state = self.state.lock().unwrap();
        state.rows.push((sheet_id.to_string(), values.to_vec()));
        Ok(format!("Sheet1!A{}:B{}", state.rows.len() + 1, state.rows.len() + 1))
    }
}

pub struct FixedConnector(pub Arc<RecordingDrive>);

impl Connector for FixedConnector {
    fn connect(&self, _access_token: &str) -> Arc<dyn CapabilityClient> {
        self.0.clone()
    }
}
