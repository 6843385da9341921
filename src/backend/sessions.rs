//! Chat sessions and persisted message history

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{Message, Role};

use super::uploads::{SourceKind, UploadedSource};
use super::{id_string, BackendClient, BackendError};

/// Which kind of source a session talks about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureType {
    Pdf,
    Csv,
    Web,
    Multi,
    #[serde(other)]
    Other,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Pdf => "pdf",
            FeatureType::Csv => "csv",
            FeatureType::Web => "web",
            FeatureType::Multi => "multi",
            FeatureType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewSession {
    pub title: String,
    pub feature_type: FeatureType,
    pub source_id: String,
}

impl NewSession {
    /// Session about a freshly stored source.
    ///
    /// The backend resolves a non-empty `source_id` against its PDF table
    /// only, so other kinds are created unlinked (stored as NULL) and the
    /// source id travels with each chat request instead.
    pub fn for_source(source: &UploadedSource, source_id: &str) -> Self {
        let title = source
            .file_name
            .clone()
            .unwrap_or_else(|| source.url.clone());
        let source_id = match source.kind {
            SourceKind::Pdf => source_id.to_string(),
            SourceKind::Csv | SourceKind::Web => String::new(),
        };

        Self {
            title,
            feature_type: source.kind.feature_type(),
            source_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatSession {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub title: String,
    pub feature_type: FeatureType,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// A persisted message as returned by the history endpoint
#[derive(Debug, Clone, Deserialize)]
struct HistoryRecord {
    #[serde(default)]
    id: Value,
    role: String,
    message: String,
    #[serde(default)]
    timestamp: Option<String>,
}

impl From<HistoryRecord> for Message {
    fn from(record: HistoryRecord) -> Self {
        let role = match record.role.to_lowercase().as_str() {
            "user" | "human" => Role::User,
            _ => Role::Agent,
        };
        Message {
            id: id_string(&record.id).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            role,
            content: record.message,
            timestamp: record
                .timestamp
                .as_deref()
                .map(parse_timestamp)
                .unwrap_or_else(Utc::now),
            pending: false,
        }
    }
}

/// RFC 3339, falling back to a naive timestamp read as UTC
fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

impl BackendClient {
    pub async fn create_session(&self, session: &NewSession) -> Result<ChatSession, BackendError> {
        let path = format!("{}/create-session", self.endpoints.sessions);
        let data = self.call(self.request(Method::POST, &path).json(session)).await?;
        let created: ChatSession = parse(data)?;
        tracing::info!(session_id = %created.id, feature = session.feature_type.as_str(), "created chat session");
        Ok(created)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<ChatSession, BackendError> {
        let path = format!("{}/{}", self.endpoints.sessions, session_id);
        parse(self.call(self.request(Method::GET, &path)).await?)
    }

    /// Sessions for the current user, newest first
    pub async fn list_sessions(
        &self,
        feature_type: Option<FeatureType>,
    ) -> Result<Vec<ChatSession>, BackendError> {
        let path = format!("{}/", self.endpoints.sessions);
        let mut query = vec![("limit", self.list_limit.to_string())];
        if let Some(feature) = feature_type {
            query.push(("feature_type", feature.as_str().to_string()));
        }
        parse(self.call(self.request(Method::GET, &path).query(&query)).await?)
    }

    /// Delete a session together with its messages
    pub async fn delete_session(&self, session_id: &str) -> Result<(), BackendError> {
        let path = format!("{}/{}", self.endpoints.sessions, session_id);
        self.call(self.request(Method::DELETE, &path)).await?;
        tracing::info!(%session_id, "deleted chat session");
        Ok(())
    }

    /// Persisted messages of a session, oldest first
    pub async fn session_history(&self, session_id: &str) -> Result<Vec<Message>, BackendError> {
        let path = format!("{}/{}/messages", self.endpoints.sessions, session_id);
        let query = [("limit", self.list_limit.to_string())];
        let records: Vec<HistoryRecord> =
            parse(self.call(self.request(Method::GET, &path).query(&query)).await?)?;
        Ok(records.into_iter().map(Message::from).collect())
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, BackendError> {
    serde_json::from_value(data)
        .map_err(|e| BackendError::InvalidResponse(format!("Unexpected payload: {}", e)))
}
