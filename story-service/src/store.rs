// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{collections::HashMap, str::FromStr};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{Client as DynamoClient, error::DisplayErrorContext, types::AttributeValue};
use chrono::{DateTime, Utc};
use lifesim_common::{Session, SessionStatus};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

pub const DEFAULT_SESSIONS_TABLE: &str = "life_sessions";
const HEALTH_PROBE_KEY: &str = "health-check";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} already exists")]
    AlreadyExists(String),
    #[error("session {session_id} changed since version {expected}")]
    Conflict { session_id: String, expected: u64 },
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct StoreHealth {
    pub table: String,
    pub item_exists: bool,
}

/// Whole-record persistence for sessions. Writes always replace the full item.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Session, StoreError>;

    /// Overwrites the record if the stored version still equals `session.version`.
    /// Returns what was written: `updated_at` refreshed, `version` bumped.
    async fn put(&self, session: Session) -> Result<Session, StoreError>;

    async fn health(&self) -> Result<StoreHealth, StoreError>;
}

fn prepare_write(mut session: Session) -> Session {
    session.updated_at = Utc::now();
    session.version += 1;
    session
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

#[cfg(test)]
impl InMemorySessionStore {
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(StoreError::AlreadyExists(session.session_id.clone()));
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn put(&self, session: Session) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get(&session.session_id)
            .ok_or_else(|| StoreError::NotFound(session.session_id.clone()))?;
        if stored.version != session.version {
            return Err(StoreError::Conflict {
                session_id: session.session_id.clone(),
                expected: session.version,
            });
        }

        let written = prepare_write(session);
        sessions.insert(written.session_id.clone(), written.clone());
        Ok(written)
    }

    async fn health(&self) -> Result<StoreHealth, StoreError> {
        Ok(StoreHealth {
            table: "in-memory".to_string(),
            item_exists: self.sessions.read().await.contains_key(HEALTH_PROBE_KEY),
        })
    }
}

#[derive(Clone)]
pub struct DynamoSessionStore {
    client: DynamoClient,
    table_name: String,
}

impl DynamoSessionStore {
    /// Enabled when either a local endpoint or an AWS region is configured.
    pub async fn from_env() -> Option<Self> {
        if std::env::var("DYNAMODB_ENDPOINT").is_err() && std::env::var("AWS_REGION").is_err() {
            return None;
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Ok(endpoint) = std::env::var("DYNAMODB_ENDPOINT") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        let table_name = std::env::var("SESSIONS_TABLE")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_SESSIONS_TABLE.to_string());

        info!(table_name = %table_name, "DynamoDB session store enabled");
        Some(Self {
            client: DynamoClient::new(&config),
            table_name,
        })
    }
}

#[async_trait]
impl SessionStore for DynamoSessionStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let item = session_to_item(session)?;
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(session_id)")
            .send()
            .await
            .map_err(|error| {
                let error = error.into_service_error();
                if error.is_conditional_check_failed_exception() {
                    StoreError::AlreadyExists(session.session_id.clone())
                } else {
                    StoreError::Unavailable(format!(
                        "failed to create session record: {}",
                        DisplayErrorContext(&error)
                    ))
                }
            })?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("session_id", AttributeValue::S(session_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|error| {
                StoreError::Unavailable(format!(
                    "failed to read session record: {}",
                    DisplayErrorContext(&error)
                ))
            })?;

        let item = output
            .item()
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session_from_item(item)
    }

    async fn put(&self, session: Session) -> Result<Session, StoreError> {
        let expected = session.version;
        let session_id = session.session_id.clone();
        let written = prepare_write(session);
        let item = session_to_item(&written)?;

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("attribute_exists(session_id) AND #version = :expected")
            .expression_attribute_names("#version", "version")
            .expression_attribute_values(":expected", AttributeValue::N(expected.to_string()))
            .send()
            .await
            .map_err(|error| {
                let error = error.into_service_error();
                if error.is_conditional_check_failed_exception() {
                    StoreError::Conflict {
                        session_id: session_id.clone(),
                        expected,
                    }
                } else {
                    StoreError::Unavailable(format!(
                        "failed to update session record: {}",
                        DisplayErrorContext(&error)
                    ))
                }
            })?;
        Ok(written)
    }

    async fn health(&self) -> Result<StoreHealth, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("session_id", AttributeValue::S(HEALTH_PROBE_KEY.to_string()))
            .send()
            .await
            .map_err(|error| {
                StoreError::Unavailable(format!(
                    "health probe against {} failed: {}",
                    self.table_name,
                    DisplayErrorContext(&error)
                ))
            })?;

        Ok(StoreHealth {
            table: self.table_name.clone(),
            item_exists: output.item().is_some(),
        })
    }
}

fn json_value<T: Serialize>(value: &T, field: &str) -> Result<AttributeValue, StoreError> {
    serde_json::to_string(value)
        .map(AttributeValue::S)
        .map_err(|error| StoreError::Unavailable(format!("failed to encode {field}: {error}")))
}

fn session_to_item(session: &Session) -> Result<HashMap<String, AttributeValue>, StoreError> {
    let mut item = HashMap::new();
    item.insert(
        "session_id".to_string(),
        AttributeValue::S(session.session_id.clone()),
    );
    item.insert(
        "status".to_string(),
        AttributeValue::S(session.status.as_str().to_string()),
    );
    item.insert(
        "knowledge_base_id".to_string(),
        AttributeValue::S(session.knowledge_base_id.clone()),
    );
    item.insert(
        "world_context".to_string(),
        json_value(&session.world_context, "world_context")?,
    );
    item.insert(
        "player_identity".to_string(),
        json_value(&session.player_identity, "player_identity")?,
    );
    item.insert(
        "player_state".to_string(),
        json_value(&session.player_state, "player_state")?,
    );
    item.insert(
        "life_goal".to_string(),
        AttributeValue::S(session.life_goal.clone()),
    );
    item.insert(
        "current_summary".to_string(),
        AttributeValue::S(session.current_summary.clone()),
    );
    item.insert(
        "turn".to_string(),
        AttributeValue::N(session.turn.to_string()),
    );
    item.insert("history".to_string(), json_value(&session.history, "history")?);
    match session.final_result.as_ref() {
        Some(result) => {
            item.insert(
                "final_result".to_string(),
                json_value(result, "final_result")?,
            );
        }
        None => {
            item.insert("final_result".to_string(), AttributeValue::Null(true));
        }
    }
    item.insert(
        "created_at".to_string(),
        AttributeValue::S(session.created_at.to_rfc3339()),
    );
    item.insert(
        "updated_at".to_string(),
        AttributeValue::S(session.updated_at.to_rfc3339()),
    );
    item.insert(
        "expires_at".to_string(),
        AttributeValue::N(session.expires_at.to_string()),
    );
    item.insert(
        "version".to_string(),
        AttributeValue::N(session.version.to_string()),
    );
    Ok(item)
}

fn string_attr<'a>(
    item: &'a HashMap<String, AttributeValue>,
    name: &str,
) -> Result<&'a str, StoreError> {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .map(String::as_str)
        .ok_or_else(|| StoreError::Unavailable(format!("session record missing {name}")))
}

fn number_attr<T: FromStr>(
    item: &HashMap<String, AttributeValue>,
    name: &str,
) -> Result<T, StoreError> {
    item.get(name)
        .and_then(|value| value.as_n().ok())
        .and_then(|value| value.parse::<T>().ok())
        .ok_or_else(|| StoreError::Unavailable(format!("session record has invalid {name}")))
}

fn json_attr<T: DeserializeOwned>(
    item: &HashMap<String, AttributeValue>,
    name: &str,
) -> Result<T, StoreError> {
    let raw = string_attr(item, name)?;
    serde_json::from_str(raw)
        .map_err(|error| StoreError::Unavailable(format!("failed to decode {name}: {error}")))
}

fn timestamp_attr(
    item: &HashMap<String, AttributeValue>,
    name: &str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(string_attr(item, name)?)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| StoreError::Unavailable(format!("failed to decode {name}: {error}")))
}

fn session_from_item(item: &HashMap<String, AttributeValue>) -> Result<Session, StoreError> {
    let status = string_attr(item, "status")?;
    let final_result = match item.get("final_result") {
        Some(AttributeValue::S(raw)) => Some(serde_json::from_str(raw).map_err(|error| {
            StoreError::Unavailable(format!("failed to decode final_result: {error}"))
        })?),
        _ => None,
    };

    Ok(Session {
        session_id: string_attr(item, "session_id")?.to_string(),
        status: SessionStatus::parse(status)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown session status {status}")))?,
        knowledge_base_id: string_attr(item, "knowledge_base_id")?.to_string(),
        world_context: json_attr(item, "world_context")?,
        player_identity: json_attr(item, "player_identity")?,
        player_state: json_attr(item, "player_state")?,
        life_goal: string_attr(item, "life_goal")?.to_string(),
        current_summary: string_attr(item, "current_summary")?.to_string(),
        turn: number_attr(item, "turn")?,
        history: json_attr(item, "history")?,
        final_result,
        created_at: timestamp_attr(item, "created_at")?,
        updated_at: timestamp_attr(item, "updated_at")?,
        expires_at: number_attr(item, "expires_at")?,
        version: number_attr(item, "version")?,
    })
}
