//! Forms to Google Sheets/Drive bridge.
//!
//! Submissions are gated per feed, the qualifying feeds are deferred to
//! follow-up calls, and each follow-up pushes the entry's files to Drive,
//! rewrites the entry with shareable links and appends the mapped row. The
//! last follow-up of a submission reconciles the entry and sends the
//! notifications that were held back.

pub mod app;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod google;
pub mod handlers;
pub mod host;
pub mod model;
pub mod nonce;
pub mod outbox;
pub mod processor;
pub mod reconcile;
pub mod settings;
pub mod submission;
pub mod token;
