use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type FormId = i64;
pub type EntryId = i64;
pub type FeedId = i64;
pub type FieldId = u32;

/// Input type of a form field as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Local upload stored by the host under its uploads directory.
    FileUpload,
    /// Upload picker whose value is a JSON list of remote URLs.
    DriveUpload,
    Text,
    Email,
    Number,
    #[serde(other)]
    Other,
}

/// How an upload-capable field reaches remote storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCategory {
    /// Bytes read from local storage and streamed up.
    DirectUpload { multiple: bool },
    /// Remote URLs fetched into storage by an asynchronous job.
    RemoteUrlUpload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub id: FieldId,
    #[serde(default)]
    pub label: String,
    pub input_type: FieldType,
    #[serde(default)]
    pub multiple_files: bool,
}

impl Field {
    /// `None` for fields that never carry files.
    pub fn upload_category(&self) -> Option<UploadCategory> {
        match self.input_type {
            FieldType::FileUpload => Some(UploadCategory::DirectUpload {
                multiple: self.multiple_files,
            }),
            FieldType::DriveUpload => Some(UploadCategory::RemoteUrlUpload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Event that triggers this notification, e.g. `form_submission`.
    pub event: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Form {
    pub id: FormId,
    pub title: String,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub notifications: Vec<Notification>,
}

impl Form {
    pub fn field(&self, id: FieldId) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Upload-capable fields in form order.
    pub fn upload_fields(&self) -> impl Iterator<Item = (&Field, UploadCategory)> {
        self.fields
            .iter()
            .filter_map(|f| f.upload_category().map(|c| (f, c)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub form_id: FormId,
    pub values: BTreeMap<FieldId, String>,
}

impl Entry {
    /// Value of a field, empty when absent.
    pub fn value(&self, field_id: FieldId) -> &str {
        self.values.get(&field_id).map(String::as_str).unwrap_or("")
    }

    /// Only a missing or empty value is blank; whitespace counts as filled.
    pub fn is_blank(&self, field_id: FieldId) -> bool {
        self.value(field_id).is_empty()
    }
}

/// Which upload fields a feed pushes: every one, or a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UploadFieldSelector {
    All,
    Field(FieldId),
}

impl UploadFieldSelector {
    pub fn matches(&self, field_id: FieldId) -> bool {
        match self {
            UploadFieldSelector::All => true,
            UploadFieldSelector::Field(id) => *id == field_id,
        }
    }
}

impl TryFrom<String> for UploadFieldSelector {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(UploadFieldSelector::All);
        }
        trimmed
            .parse::<FieldId>()
            .map(UploadFieldSelector::Field)
            .map_err(|_| format!("invalid upload field selector: {value}"))
    }
}

impl From<UploadFieldSelector> for String {
    fn from(value: UploadFieldSelector) -> Self {
        value.to_string()
    }
}

impl fmt::Display for UploadFieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadFieldSelector::All => f.write_str("all"),
            UploadFieldSelector::Field(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field_id: FieldId,
    /// Zero-based column index in the sheet's header row.
    pub column: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicType {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Is,
    #[serde(rename = "isnot")]
    IsNot,
    Contains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionRule {
    pub field_id: FieldId,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCondition {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub logic: LogicType,
    #[serde(default)]
    pub rules: Vec<ConditionRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub id: FeedId,
    pub form_id: FormId,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Spreadsheet receiving the mapped row; empty for upload-only feeds.
    #[serde(default)]
    pub sheet_id: String,
    #[serde(default)]
    pub destination_folder: String,
    #[serde(default)]
    pub field_map: Vec<FieldMapping>,
    #[serde(default)]
    pub condition: FeedCondition,
    pub upload_field: UploadFieldSelector,
}

/// A qualifying feed waiting for the deferred point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFeedQueueItem {
    pub feed: FeedConfig,
    pub entry_id: EntryId,
    pub form_id: FormId,
    pub enqueued_order: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJob {
    pub job_id: String,
    pub status: JobStatus,
}

/// One child of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    /// Content revision or identity; a new upload always has one not seen before.
    pub rev: String,
}

/// Metadata for a folder or file addressed by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    pub path: String,
    pub is_dir: bool,
    pub rev: String,
    #[serde(default)]
    pub contents: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub id: String,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadsheetFile {
    pub id: String,
    pub name: String,
}
