//! Persisted plugin settings and the store that owns them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::DefaultApp;
use crate::error::{BridgeError, BridgeResult};
use crate::token::{Credentials, Token};

/// Whole settings record. Always written as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSettings {
    #[serde(rename = "clientID", default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// `false` in legacy records; `None` here.
    #[serde(default, deserialize_with = "token_or_false")]
    pub access_token: Option<Token>,
    #[serde(default)]
    pub default_app_enabled: bool,
    #[serde(default)]
    pub custom_app_key: String,
    #[serde(default)]
    pub custom_app_secret: String,
    /// Pre-1.0.6 flag, removed by [`upgrade`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_app_enable: Option<bool>,
}

fn token_or_false<'de, D>(deserializer: D) -> Result<Option<Token>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Token(Token),
        Other(serde_json::Value),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Token(t) => Ok(Some(t)),
        Raw::Other(serde_json::Value::Bool(_) | serde_json::Value::Null) => Ok(None),
        Raw::Other(other) => Err(serde::de::Error::custom(format!(
            "expected an access token or false, found {other}"
        ))),
    }
}

impl PluginSettings {
    /// Resolve the OAuth client credentials in effect.
    pub fn credentials(
        &self,
        default_app: Option<&DefaultApp>,
        redirect_uri: &str,
    ) -> BridgeResult<Credentials> {
        let (id, secret) = if self.default_app_enabled {
            let app = default_app.ok_or_else(|| {
                BridgeError::Config("default app enabled but not configured".into())
            })?;
            (app.client_id.clone(), app.client_secret.clone())
        } else if !self.client_id.trim().is_empty() {
            (self.client_id.clone(), self.client_secret.clone())
        } else {
            (self.custom_app_key.clone(), self.custom_app_secret.clone())
        };

        if id.trim().is_empty() || secret.trim().is_empty() {
            return Err(BridgeError::Config("missing credentials".into()));
        }
        Ok(Credentials {
            client_id: id,
            client_secret: secret,
            redirect_uri: redirect_uri.to_string(),
        })
    }
}

/// Settings plus the revision they were read at.
#[derive(Debug, Clone, Default)]
pub struct StoredSettings {
    pub settings: PluginSettings,
    pub revision: i64,
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> BridgeResult<StoredSettings>;

    /// Replace the record if it is still at `expected_revision`; returns the
    /// new revision. A stale revision fails without writing anything.
    async fn save(&self, settings: &PluginSettings, expected_revision: i64) -> BridgeResult<i64>;
}

/// Compare dotted versions numerically ("1.0.10" > "1.0.6").
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|p| {
                p.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (pa, pb) = (parse(a), parse(b));
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let x = pa.get(i).copied().unwrap_or(0);
        let y = pb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Installs upgraded from before 1.0.6 that never used a custom app switch to
/// the built-in app. Returns true when the record changed.
pub fn upgrade(settings: &mut PluginSettings, previous_version: &str) -> bool {
    if previous_version.trim().is_empty()
        || compare_versions(previous_version, "1.0.6") != Ordering::Less
    {
        return false;
    }
    let custom_enabled = settings.custom_app_enable.take().unwrap_or(false);
    if !custom_enabled && settings.access_token.is_some() {
        settings.default_app_enabled = true;
    }
    true
}
