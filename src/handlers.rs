//! HTTP surface: OAuth handshake, admin AJAX lookups, submission intake and
//! the follow-up endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::config::Config;
use crate::dispatch::{DeferredDispatcher, FollowUpHandler, FollowUpRequest, FollowUpTransport};
use crate::error::BridgeError;
use crate::google::{CapabilityClient, Connector};
use crate::host::FormsHost;
use crate::model::{FieldId, FormId};
use crate::nonce::NonceSigner;
use crate::submission::accept_submission;
use crate::token::TokenManager;

pub const SHEET_PLACEHOLDER: &str = "- Select a Sheet -";
pub const MISSING_SHEET_ID: &str = "Could not get sheet ID";

pub struct AppState {
    pub cfg: Config,
    pub host: Arc<dyn FormsHost>,
    pub tokens: Arc<TokenManager>,
    pub connector: Arc<dyn Connector>,
    pub follow_up: Arc<FollowUpHandler>,
    pub transport: Arc<dyn FollowUpTransport>,
    pub signer: NonceSigner,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/callback", get(auth_callback))
        .route("/auth/deauthorize", get(deauthorize))
        .route("/auth/url", get(auth_url))
        .route("/ajax/sheets", get(sheet_choices))
        .route("/ajax/field-map", get(field_map))
        .route("/submissions", post(submit))
        .route("/deferred", post(deferred))
        .with_state(state)
}

fn with_query(base: &str, pairs: &[(&str, &str)]) -> String {
    match Url::parse(base) {
        Ok(mut url) => {
            url.query_pairs_mut().extend_pairs(pairs);
            url.to_string()
        }
        Err(_) => base.to_string(),
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
}

#[instrument(skip_all)]
async fn auth_callback(State(state): State<Arc<AppState>>, Query(q): Query<CallbackQuery>) -> Redirect {
    let return_uri = &state.cfg.google.return_uri;
    let target = match (q.code.filter(|c| !c.trim().is_empty()), q.error) {
        (Some(code), _) => match state.tokens.exchange_auth_code(&code).await {
            Ok(_) => {
                info!("google account connected");
                with_query(return_uri, &[("auth", "success")])
            }
            Err(err) => {
                warn!(%err, "authorization code exchange failed");
                let message = match &err {
                    BridgeError::Auth(auth) => auth.user_message(),
                    other => other.to_string(),
                };
                with_query(return_uri, &[("auth", "error"), ("message", message.as_str())])
            }
        },
        (None, Some(provider_error)) => {
            with_query(return_uri, &[("auth", "error"), ("message", provider_error.as_str())])
        }
        (None, None) => with_query(
            return_uri,
            &[("auth", "error"), ("message", "missing authorization code")],
        ),
    };
    Redirect::to(&target)
}

#[derive(Debug, Deserialize)]
pub struct DeauthQuery {
    deauth: Option<String>,
}

#[instrument(skip_all)]
async fn deauthorize(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DeauthQuery>,
) -> Response {
    if !matches!(q.deauth.as_deref(), Some("1") | Some("true")) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let return_uri = &state.cfg.google.return_uri;
    let target = match state.tokens.revoke().await {
        Ok(()) => with_query(return_uri, &[("deauth", "success")]),
        Err(err) => {
            error!(%err, "failed to clear stored token");
            with_query(return_uri, &[("deauth", "error")])
        }
    };
    Redirect::to(&target).into_response()
}

async fn auth_url(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    state
        .tokens
        .authorization_url()
        .await
        .map(|url| Json(json!({ "url": url })))
        .map_err(|err| {
            warn!(%err, "cannot build authorization url");
            StatusCode::SERVICE_UNAVAILABLE
        })
}

async fn api_client(state: &AppState) -> Option<Arc<dyn CapabilityClient>> {
    match state.tokens.ensure_valid_token().await {
        Ok(token) => Some(state.connector.connect(&token.access_token)),
        Err(err) => {
            warn!(%err, "google api not initialized");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Choice {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChoice {
    pub label: String,
    pub value: String,
    pub name: String,
}

async fn sheet_choices(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut choices = vec![Choice {
        label: SHEET_PLACEHOLDER.to_string(),
        value: String::new(),
    }];
    if let Some(client) = api_client(&state).await {
        choices.extend(
            client
                .list_spreadsheet_files()
                .await
                .into_iter()
                .map(|f| Choice {
                    label: f.name,
                    value: f.id,
                }),
        );
    }
    Json(json!({ "success": true, "data": { "choices": choices } }))
}

#[derive(Debug, Deserialize)]
pub struct FieldMapQuery {
    sheet_id: Option<String>,
}

pub fn render_field_map(choices: &[FieldChoice]) -> String {
    let mut html = String::from("<select class=\"sheet-column\">");
    html.push_str("<option value=\"\"></option>");
    for choice in choices {
        html.push_str(&format!(
            "<option value=\"{}\">{}</option>",
            html_escape(&choice.value),
            html_escape(&choice.label)
        ));
    }
    html.push_str("</select>");
    html
}

async fn field_map(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FieldMapQuery>,
) -> Json<Value> {
    let Some(sheet_id) = q.sheet_id.filter(|s| !s.trim().is_empty()) else {
        return Json(json!({ "success": false, "data": { "error": MISSING_SHEET_ID } }));
    };
    let headers = match api_client(&state).await {
        Some(client) => client.get_header_row(&sheet_id).await,
        None => Vec::new(),
    };
    let choices: Vec<FieldChoice> = headers
        .into_iter()
        .enumerate()
        .map(|(i, label)| FieldChoice {
            label,
            value: i.to_string(),
            name: i.to_string(),
        })
        .collect();
    let html = render_field_map(&choices);
    Json(json!({ "success": true, "data": { "choices": choices, "html": html } }))
}

#[derive(Debug, Deserialize)]
pub struct SubmissionReq {
    pub form_id: FormId,
    #[serde(default)]
    pub values: BTreeMap<FieldId, String>,
}

#[instrument(skip_all, fields(form_id = req.form_id))]
async fn submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmissionReq>,
) -> Result<Json<Value>, StatusCode> {
    let form = state
        .host
        .get_form(req.form_id)
        .await
        .map_err(|err| {
            error!(%err, "failed to load form");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let mut dispatcher = DeferredDispatcher::new(state.signer.clone(), state.transport.clone());
    let outcome = accept_submission(
        state.host.as_ref(),
        &state.tokens,
        &mut dispatcher,
        &form,
        req.values,
    )
    .await
    .map_err(|err| {
        error!(%err, "submission failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let body = json!({
        "entry_id": outcome.entry.id,
        "queued": outcome.queued,
        "suppressed": outcome.suppressed,
        "sent": outcome.sent,
    });
    // Follow-ups start once the response is built.
    tokio::spawn(async move {
        dispatcher.flush().await;
    });
    Ok(Json(body))
}

/// Invalid calls get an empty 403 whatever the reason.
#[instrument(skip_all)]
async fn deferred(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: FollowUpRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            error!(%err, "malformed follow-up call");
            return StatusCode::FORBIDDEN.into_response();
        }
    };
    if let Err(err) = state.follow_up.verify(&request) {
        error!(%err, "follow-up call rejected");
        return StatusCode::FORBIDDEN.into_response();
    }

    match state.follow_up.handle(request).await {
        Ok(outcome) => Json(json!({
            "reconciled": outcome.reconciled,
            "errors": outcome.feed_errors,
        }))
        .into_response(),
        Err(BridgeError::Validation(reason)) => {
            warn!(%reason, "follow-up call rejected");
            StatusCode::FORBIDDEN.into_response()
        }
        Err(err) => {
            error!(%err, "follow-up processing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
