use crate::classifier::Message;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use thiserror::Error;

const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Refresh the token this many seconds before its reported expiry.
const TOKEN_SKEW_SECONDS: i64 = 60;

const MESSAGE_SELECT_FIELDS: &str = "id,subject,from,body,receivedDateTime";

#[derive(Debug, Error)]
pub enum GraphError {
    /// Credential exchange was rejected or unreachable.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The bearer token was rejected mid-run; re-authentication is needed.
    #[error("bearer token expired or rejected (status {0})")]
    Unauthorized(u16),
    #[error("graph request failed: status={status} body={body}")]
    Api { status: u16, body: String },
    #[error("graph transport error: {0}")]
    Http(#[from] reqwest::Error),
}

/// The mail-service operations the sweeper needs. Implemented by
/// [`GraphClient`] for real runs and by fakes in tests.
#[async_trait]
pub trait MailClient {
    /// Exchange or refresh credentials so subsequent calls carry a valid
    /// bearer token. A no-op when the current token is still fresh.
    async fn ensure_authenticated(&mut self) -> Result<(), GraphError>;

    /// Drop any cached token so the next [`ensure_authenticated`] call
    /// performs a fresh credential exchange. Used when the remote API
    /// rejects a token before its reported expiry.
    ///
    /// [`ensure_authenticated`]: MailClient::ensure_authenticated
    fn invalidate_token(&mut self);

    /// Messages in `folder` received at or after `since`, newest first,
    /// capped at `limit`. Filtering, ordering and paging are the remote
    /// API's concern.
    async fn list_recent(
        &self,
        folder: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, GraphError>;

    async fn move_message(&self, id: &str, destination: &str) -> Result<(), GraphError>;

    async fn delete_message(&self, id: &str) -> Result<(), GraphError>;
}

#[derive(Debug, Clone)]
struct BearerToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl BearerToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

pub struct GraphClient {
    http: reqwest::Client,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    mailbox: String,
    token: Option<BearerToken>,
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct GraphMessagePage {
    #[serde(default)]
    value: Vec<GraphMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    body: Option<GraphItemBody>,
    received_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    address: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphItemBody {
    content: Option<String>,
}

impl From<GraphMessage> for Message {
    fn from(raw: GraphMessage) -> Self {
        let email = raw.from.and_then(|f| f.email_address);
        let (sender_address, sender_name) = match email {
            Some(addr) => (
                addr.address.unwrap_or_default(),
                addr.name.unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };
        Message {
            id: raw.id,
            subject: raw.subject.unwrap_or_default(),
            sender_address,
            sender_name,
            body: raw.body.and_then(|b| b.content).unwrap_or_default(),
            received: raw.received_date_time.unwrap_or_else(Utc::now),
        }
    }
}

impl GraphClient {
    pub fn new(tenant_id: String, client_id: String, client_secret: String, mailbox: String) -> Self {
        GraphClient {
            http: reqwest::Client::new(),
            tenant_id,
            client_id,
            client_secret,
            mailbox,
            token: None,
        }
    }

    /// Whether the cached token is absent or within the refresh skew.
    pub fn token_refresh_due(&self) -> bool {
        match &self.token {
            Some(token) => token.is_expired(),
            None => true,
        }
    }

    async fn fetch_token(&self) -> Result<BearerToken, GraphError> {
        let token_url = format!("{LOGIN_BASE}/{}/oauth2/v2.0/token", self.tenant_id);

        let response = self
            .http
            .post(&token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| GraphError::Auth(format!("token request to {token_url}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GraphError::Auth(format!("read token response: {e}")))?;
        if !status.is_success() {
            return Err(GraphError::Auth(format!(
                "token endpoint returned {status}: {}",
                truncate_body(&body)
            )));
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body)
            .map_err(|e| GraphError::Auth(format!("decode token response: {e}")))?;
        let lifetime = (payload.expires_in as i64).saturating_sub(TOKEN_SKEW_SECONDS);
        Ok(BearerToken {
            access_token: payload.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(lifetime),
        })
    }

    fn bearer(&self) -> Result<&str, GraphError> {
        match &self.token {
            Some(token) => Ok(token.access_token.as_str()),
            None => Err(GraphError::Unauthorized(0)),
        }
    }

    fn check_status(status: reqwest::StatusCode, body: String) -> Result<(), GraphError> {
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(GraphError::Unauthorized(status.as_u16()))
        } else {
            Err(GraphError::Api {
                status: status.as_u16(),
                body: truncate_body(&body),
            })
        }
    }
}

#[async_trait]
impl MailClient for GraphClient {
    async fn ensure_authenticated(&mut self) -> Result<(), GraphError> {
        if !self.token_refresh_due() {
            return Ok(());
        }
        let token = self.fetch_token().await?;
        log::info!(
            "Obtained access token (expires {})",
            token.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        self.token = Some(token);
        Ok(())
    }

    fn invalidate_token(&mut self) {
        self.token = None;
    }

    async fn list_recent(
        &self,
        folder: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, GraphError> {
        let url = format!(
            "{GRAPH_API_BASE}/users/{}/mailFolders/{folder}/messages",
            self.mailbox
        );
        let top = limit.to_string();
        let time_filter = format!(
            "receivedDateTime ge {}",
            since.format("%Y-%m-%dT%H:%M:%SZ")
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(self.bearer()?)
            .query(&[
                ("$top", top.as_str()),
                ("$select", MESSAGE_SELECT_FIELDS),
                ("$filter", time_filter.as_str()),
                ("$orderby", "receivedDateTime desc"),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        Self::check_status(status, body.clone())?;

        let page: GraphMessagePage = serde_json::from_str(&body).map_err(|e| GraphError::Api {
            status: status.as_u16(),
            body: format!("decode message page: {e}"),
        })?;
        Ok(page.value.into_iter().map(Message::from).collect())
    }

    async fn move_message(&self, id: &str, destination: &str) -> Result<(), GraphError> {
        let url = format!("{GRAPH_API_BASE}/users/{}/messages/{id}/move", self.mailbox);

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.bearer()?)
            .json(&serde_json::json!({ "destinationId": destination }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        Self::check_status(status, body)
    }

    async fn delete_message(&self, id: &str) -> Result<(), GraphError> {
        let url = format!("{GRAPH_API_BASE}/users/{}/messages/{id}", self.mailbox);

        let response = self
            .http
            .delete(&url)
            .bearer_auth(self.bearer()?)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        Self::check_status(status, body)
    }
}

const BODY_SNIPPET_MAX: usize = 200;

// Error bodies are remote-controlled and may be non-ASCII; truncate on
// char boundaries, never by byte index.
fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= BODY_SNIPPET_MAX {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(BODY_SNIPPET_MAX).collect();
        format!("{head}... [truncated]")
    }
}
