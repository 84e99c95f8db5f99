//! Database module: row models, SQL repositories and the SQLite-backed host.
//!
//! - `model`: view models returned by repositories.
//! - `repo`: SQL-only functions.
//! - `host`: [`SqliteHost`], the forms host and settings store used by the
//!   service.

pub mod host;
pub mod model;
pub mod repo;

pub use host::SqliteHost;
pub use model::{FeedErrorRow, OutboxItem, SettingsRow};
pub use repo::*;
