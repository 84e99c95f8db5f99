//! Service wiring shared by the server and the maintenance binaries.

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::db::{self, Pool, SqliteHost};
use crate::dispatch::FollowUpHandler;
use crate::google::oauth::GoogleOAuthFactory;
use crate::google::{Connector, GoogleConnector};
use crate::host::FormsHost;
use crate::nonce::{NonceSigner, UPLOAD_ACTION};
use crate::processor::FieldProcessor;
use crate::settings::SettingsStore;
use crate::token::TokenManager;

pub struct Services {
    pub pool: Pool,
    pub host: Arc<dyn FormsHost>,
    pub tokens: Arc<TokenManager>,
    pub connector: Arc<dyn Connector>,
    pub signer: NonceSigner,
    pub follow_up: Arc<FollowUpHandler>,
}

pub fn http_client(cfg: &Config) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(concat!("sheets-bridge/", env!("CARGO_PKG_VERSION")))
        .timeout(cfg.http_timeout())
        .build()?)
}

/// Open the database, run migrations and settings upgrades, and build the
/// follow-up pipeline on top.
pub async fn build(cfg: &Config) -> Result<Services> {
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let sqlite_host = Arc::new(SqliteHost::new(pool.clone()));
    sqlite_host.run_upgrade(env!("CARGO_PKG_VERSION")).await?;
    let host: Arc<dyn FormsHost> = sqlite_host.clone();
    let store: Arc<dyn SettingsStore> = sqlite_host;

    let http = http_client(cfg)?;
    let tokens = Arc::new(TokenManager::new(
        store,
        Arc::new(GoogleOAuthFactory::new(http.clone())),
        cfg.google.default_app.clone(),
        cfg.google.redirect_uri.clone(),
    ));
    let connector: Arc<dyn Connector> = Arc::new(GoogleConnector::new(http));
    let signer = NonceSigner::new(&cfg.app.nonce_secret, UPLOAD_ACTION, cfg.app.nonce_lifetime_secs);

    let processor = FieldProcessor::from_config(cfg, host.clone(), tokens.clone(), connector.clone());
    let follow_up = Arc::new(FollowUpHandler::new(
        host.clone(),
        processor,
        signer.clone(),
        cfg.reconcile_wait(),
    ));

    Ok(Services {
        pool,
        host,
        tokens,
        connector,
        signer,
        follow_up,
    })
}
