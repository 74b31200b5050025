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

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lifesim_common::{
    Achievement, EventOption, FinalResult, GenerateBackgroundResponse, GenerateStoryResponse,
    HistoryItem, KeyDecision, PhaseTable, PlayerIdentity, PlayerState, ResolveEventResponse,
    SessionSnapshotResponse, SessionStatus, StatChange, StoryEvent, clamp_stat, event_turn,
    new_session_id, turn_event_id,
};
use reqwest::Method;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;

use crate::request::{ReqwestTransport, RequestClient, RequestError};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8090";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

#[async_trait]
pub trait GameBackend: Send + Sync {
    async fn generate_background(
        &self,
        knowledge_base_id: &str,
    ) -> Result<GenerateBackgroundResponse, RequestError>;

    async fn generate_story(&self, session_id: &str)
    -> Result<GenerateStoryResponse, RequestError>;

    async fn resolve_event(
        &self,
        session_id: &str,
        event: &StoryEvent,
        selected_option: &str,
    ) -> Result<ResolveEventResponse, RequestError>;

    async fn generate_result(&self, session_id: &str) -> Result<FinalResult, RequestError>;

    async fn session(&self, session_id: &str) -> Result<SessionSnapshotResponse, RequestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Live,
    Simulated,
}

impl BackendMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "live" => Some(Self::Live),
            "simulated" | "mock" => Some(Self::Simulated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub retries: u32,
    pub base_delay: Duration,
    pub mode: BackendMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            retries: DEFAULT_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            mode: BackendMode::Live,
        }
    }
}

impl ClientConfig {
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Self {
            base_url: var("LIFESIM_API_BASE_URL").unwrap_or(defaults.base_url),
            timeout: var("LIFESIM_API_TIMEOUT_SECONDS")
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retries: var("LIFESIM_API_RETRIES")
                .and_then(|raw| raw.parse::<u32>().ok())
                .unwrap_or(defaults.retries),
            base_delay: defaults.base_delay,
            mode: var("LIFESIM_BACKEND_MODE")
                .and_then(|raw| BackendMode::parse(&raw))
                .unwrap_or(defaults.mode),
        }
    }

    pub fn build_backend(&self) -> Arc<dyn GameBackend> {
        match self.mode {
            BackendMode::Live => {
                info!(base_url = %self.base_url, "using live story backend");
                Arc::new(LiveBackend::new(RequestClient::new(
                    Arc::new(ReqwestTransport::new()),
                    self.base_url.clone(),
                    self.timeout,
                    self.retries,
                    self.base_delay,
                )))
            }
            BackendMode::Simulated => {
                info!("using simulated story backend");
                Arc::new(SimulatedBackend::default())
            }
        }
    }
}

#[derive(Clone)]
pub struct LiveBackend {
    client: RequestClient,
}

impl LiveBackend {
    pub fn new(client: RequestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GameBackend for LiveBackend {
    async fn generate_background(
        &self,
        knowledge_base_id: &str,
    ) -> Result<GenerateBackgroundResponse, RequestError> {
        let body = json!({ "knowledge_base_id": knowledge_base_id });
        self.client
            .fetch_with_retry(Method::POST, "generate-background", Some(&body))
            .await
    }

    async fn generate_story(
        &self,
        session_id: &str,
    ) -> Result<GenerateStoryResponse, RequestError> {
        let body = json!({ "session_id": session_id });
        self.client
            .fetch_with_retry(Method::POST, "generate-story", Some(&body))
            .await
    }

    async fn resolve_event(
        &self,
        session_id: &str,
        event: &StoryEvent,
        selected_option: &str,
    ) -> Result<ResolveEventResponse, RequestError> {
        let body = json!({
            "session_id": session_id,
            "event": event,
            "selected_option": selected_option,
        });
        self.client
            .fetch_with_retry(Method::POST, "resolve-event", Some(&body))
            .await
    }

    async fn generate_result(&self, session_id: &str) -> Result<FinalResult, RequestError> {
        let body = json!({ "session_id": session_id });
        self.client
            .fetch_with_retry(Method::POST, "generate-result", Some(&body))
            .await
    }

    async fn session(&self, session_id: &str) -> Result<SessionSnapshotResponse, RequestError> {
        self.client
            .fetch_with_retry(Method::GET, &format!("sessions/{session_id}"), None)
            .await
    }
}

struct SimulatedSession {
    turn: u32,
    identity: PlayerIdentity,
    life_goal: String,
    player_state: PlayerState,
    summary: String,
    history: Vec<HistoryItem>,
    result: Option<FinalResult>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SimulatedSession {
    fn ended(&self) -> bool {
        self.result.is_some()
    }
}

/// In-process stand-in for the story service, for offline play and demos.
#[derive(Default)]
pub struct SimulatedBackend {
    phases: PhaseTable,
    sessions: Mutex<HashMap<String, SimulatedSession>>,
}

impl SimulatedBackend {
    pub fn new(phases: PhaseTable) -> Self {
        Self {
            phases,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

fn rejected(status: u16, code: &str, message: String) -> RequestError {
    RequestError {
        kind: crate::request::ErrorKind::ClientError,
        status: Some(status),
        code: Some(code.to_string()),
        message,
    }
}

fn not_found(session_id: &str) -> RequestError {
    rejected(404, "SESSION_NOT_FOUND", format!("session {session_id} not found"))
}

fn session_ended(session_id: &str) -> RequestError {
    rejected(
        409,
        "SESSION_ENDED",
        format!("session {session_id} has already ended"),
    )
}

fn game_complete(session_id: &str) -> RequestError {
    rejected(
        409,
        "GAME_COMPLETE",
        format!("session {session_id} has played every turn"),
    )
}

#[async_trait]
impl GameBackend for SimulatedBackend {
    async fn generate_background(
        &self,
        knowledge_base_id: &str,
    ) -> Result<GenerateBackgroundResponse, RequestError> {
        if knowledge_base_id.trim().is_empty() {
            return Err(rejected(
                400,
                "INVALID_INPUT",
                "knowledge_base_id is required".to_string(),
            ));
        }

        let identity = PlayerIdentity {
            age: 6,
            gender: "unspecified".to_string(),
            appearance: "small for their age, always muddy".to_string(),
            profession: "student".to_string(),
            initial_traits: vec!["curious".to_string()],
        };
        let life_goal = "Leave the town better than you found it.".to_string();
        let session_id = new_session_id();
        let now = Utc::now();
        self.sessions.lock().await.insert(
            session_id.clone(),
            SimulatedSession {
                turn: 0,
                identity: identity.clone(),
                life_goal: life_goal.clone(),
                player_state: PlayerState::from_identity(&identity),
                summary: String::new(),
                history: Vec::new(),
                result: None,
                created_at: now,
                updated_at: now,
            },
        );

        Ok(GenerateBackgroundResponse {
            session_id,
            background: json!({
                "era": "present day",
                "place": "a small river town",
                "description": format!("A quiet start drawn from {knowledge_base_id}."),
            }),
            player_identity: identity,
            life_goal,
            image: None,
        })
    }

    async fn generate_story(
        &self,
        session_id: &str,
    ) -> Result<GenerateStoryResponse, RequestError> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(session_id).ok_or_else(|| not_found(session_id))?;
        if session.ended() {
            return Err(session_ended(session_id));
        }
        let info = self.phases.phase_info(session.turn);
        if info.is_game_ending {
            return Err(game_complete(session_id));
        }

        Ok(GenerateStoryResponse {
            event_id: turn_event_id(session.turn, "offline"),
            event_description: format!(
                "{}: a crossroads appears ({}).",
                info.phase_name,
                info.progress_label()
            ),
            options: vec![
                EventOption {
                    option_id: "A".to_string(),
                    description: "Follow your ambition.".to_string(),
                },
                EventOption {
                    option_id: "B".to_string(),
                    description: "Follow your heart.".to_string(),
                },
            ],
            image_prompt: None,
            image: None,
            game_progress: info.game_progress(),
            should_generate_result: info.is_last_turn.then_some(true),
        })
    }

    async fn resolve_event(
        &self,
        session_id: &str,
        event: &StoryEvent,
        selected_option: &str,
    ) -> Result<ResolveEventResponse, RequestError> {
        let option = event.option(selected_option).ok_or_else(|| {
            rejected(400, "INVALID_INPUT", format!("unknown option {selected_option:?}"))
        })?;

        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        if session.ended() {
            return Err(session_ended(session_id));
        }
        if event_turn(&event.event_id).is_some_and(|turn| turn < session.turn) {
            return Err(rejected(
                409,
                "EVENT_ALREADY_RESOLVED",
                format!("event {} has already been resolved", event.event_id),
            ));
        }
        if self.phases.phase_info(session.turn).is_game_ending {
            return Err(game_complete(session_id));
        }

        let (stat, change) = if option.option_id == "A" {
            ("career_development", 6)
        } else {
            ("relationships", 6)
        };
        let state = &mut session.player_state;
        match stat {
            "career_development" => {
                state.career_development = clamp_stat(state.career_development + change)
            }
            _ => state.relationships = clamp_stat(state.relationships + change),
        }
        state.age += 7;

        let outcome = format!("You chose to {}", option.description.to_lowercase());
        session.summary = format!("{} {}", session.summary, outcome).trim().to_string();
        session.history.push(HistoryItem {
            event_id: event.event_id.clone(),
            event_description: event.event_description.clone(),
            selected_option: option.option_id.clone(),
            outcome: outcome.clone(),
            timestamp: Utc::now(),
        });
        session.turn += 1;
        session.updated_at = Utc::now();

        Ok(ResolveEventResponse {
            event_outcome: outcome,
            updated_player_state: session.player_state.clone(),
            stat_changes: vec![StatChange {
                stat: stat.to_string(),
                change,
                reason: option.description.clone(),
            }],
            current_summary: session.summary.clone(),
            image: None,
            game_progress: self.phases.phase_info(session.turn).game_progress(),
        })
    }

    async fn generate_result(&self, session_id: &str) -> Result<FinalResult, RequestError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;

        let key_decisions = (0..3)
            .map(|index| {
                let item = session.history.get(index * session.history.len() / 3);
                KeyDecision {
                    event_description: item
                        .map(|item| item.event_description.clone())
                        .unwrap_or_else(|| "An uneventful stretch".to_string()),
                    decision: item
                        .map(|item| format!("Option {}", item.selected_option))
                        .unwrap_or_else(|| "Nothing in particular".to_string()),
                    impact: item
                        .map(|item| item.outcome.clone())
                        .unwrap_or_else(|| "Time passed.".to_string()),
                }
            })
            .collect();

        let result = FinalResult {
            summary: session.summary.clone(),
            final_scores: session.player_state.scores(),
            achievements: vec![
                Achievement {
                    title: "Made It".to_string(),
                    description: format!("Lived through {} chapters.", session.history.len()),
                    icon: "🏁".to_string(),
                },
                Achievement {
                    title: "Offline Explorer".to_string(),
                    description: "Played without a network.".to_string(),
                    icon: "🧭".to_string(),
                },
            ],
            key_decisions,
            ending_type: "offline".to_string(),
            ending_title: "A Life, Simulated".to_string(),
            image: None,
        };
        session.result = Some(result.clone());
        session.updated_at = Utc::now();
        Ok(result)
    }

    async fn session(&self, session_id: &str) -> Result<SessionSnapshotResponse, RequestError> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(session_id).ok_or_else(|| not_found(session_id))?;
        Ok(SessionSnapshotResponse {
            session_id: session_id.to_string(),
            status: if session.ended() {
                SessionStatus::Ended
            } else {
                SessionStatus::Active
            },
            turn: session.turn,
            game_progress: self.phases.phase_info(session.turn).game_progress(),
            player_identity: session.identity.clone(),
            player_state: session.player_state.clone(),
            life_goal: session.life_goal.clone(),
            current_summary: session.summary.clone(),
            history: session.history.clone(),
            final_result: session.result.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ErrorKind, RawResponse, Transport};
    use serde_json::Value;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn config_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[]));
        assert_eq!(config.base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.retries, 2);
        assert_eq!(config.mode, BackendMode::Live);
    }

    #[test]
    fn config_reads_environment_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("LIFESIM_API_BASE_URL", "https://api.example.test/prod"),
            ("LIFESIM_API_TIMEOUT_SECONDS", "15"),
            ("LIFESIM_API_RETRIES", "0"),
            ("LIFESIM_BACKEND_MODE", "simulated"),
        ]));
        assert_eq!(config.base_url, "https://api.example.test/prod");
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.retries, 0);
        assert_eq!(config.mode, BackendMode::Simulated);
    }

    #[test]
    fn config_ignores_garbage_values() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("LIFESIM_API_TIMEOUT_SECONDS", "soon"),
            ("LIFESIM_BACKEND_MODE", "quantum"),
        ]));
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.mode, BackendMode::Live);
    }

    struct RecordingTransport {
        requests: std::sync::Mutex<Vec<(Method, String, Option<Value>)>>,
        answer: String,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            method: Method,
            url: &str,
            body: Option<&Value>,
        ) -> Result<RawResponse, RequestError> {
            self.requests
                .lock()
                .unwrap()
                .push((method, url.to_string(), body.cloned()));
            Ok(RawResponse {
                status: 200,
                body: self.answer.clone(),
            })
        }
    }

    #[tokio::test]
    async fn live_backend_posts_resolve_payload() {
        let transport = Arc::new(RecordingTransport {
            requests: std::sync::Mutex::new(Vec::new()),
            answer: json!({
                "event_outcome": "You moved to the city.",
                "updated_player_state": {
                    "age": 19, "career": "clerk", "wisdom": 55, "wealth": 40,
                    "relationships": 60, "career_development": 52, "wellbeing": 58,
                    "traits": ["restless"]
                },
                "stat_changes": [{"stat": "wealth", "change": -10, "reason": "rent"}],
                "current_summary": "A restless youth.",
                "game_progress": {
                    "turn": 3, "total_turns": 10, "phase": "Adolescence",
                    "phase_progress": "2/2", "turns_left": 6
                }
            })
            .to_string(),
        });
        let backend = LiveBackend::new(RequestClient::new(
            transport.clone(),
            "http://story.local",
            Duration::from_secs(1),
            0,
            Duration::from_millis(1),
        ));
        let event = StoryEvent {
            event_id: "evt-3".to_string(),
            event_description: "A letter from the city.".to_string(),
            options: vec![EventOption {
                option_id: "A".to_string(),
                description: "Go".to_string(),
            }],
        };

        let resolved = backend
            .resolve_event("session_1_abc", &event, "A")
            .await
            .unwrap();

        assert_eq!(resolved.game_progress.turn, 3);
        let requests = transport.requests.lock().unwrap();
        let (method, url, body) = &requests[0];
        assert_eq!(*method, Method::POST);
        assert_eq!(url, "http://story.local/resolve-event");
        let body = body.as_ref().unwrap();
        assert_eq!(body["session_id"], "session_1_abc");
        assert_eq!(body["selected_option"], "A");
        assert_eq!(body["event"]["event_id"], "evt-3");
    }

    #[tokio::test]
    async fn simulated_backend_rejects_unknown_sessions_like_the_service() {
        let backend = SimulatedBackend::default();
        let error = backend.generate_story("session_0_missing").await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::ClientError);
        assert_eq!(error.status, Some(404));
        assert!(error.has_code("SESSION_NOT_FOUND"));
    }

    #[tokio::test]
    async fn simulated_backend_stops_after_the_last_turn() {
        let backend = SimulatedBackend::new(PhaseTable::uniform(&["Only"], 2).unwrap());
        let started = backend.generate_background("kb-offline").await.unwrap();

        for _ in 0..2 {
            let event = backend.generate_story(&started.session_id).await.unwrap();
            backend
                .resolve_event(&started.session_id, &event.event(), "B")
                .await
                .unwrap();
        }

        let error = backend.generate_story(&started.session_id).await.unwrap_err();
        assert!(error.has_code("GAME_COMPLETE"));
        let result = backend.generate_result(&started.session_id).await.unwrap();
        assert_eq!(result.key_decisions.len(), 3);
        assert_eq!(result.final_scores.relationships, 62);

        let snapshot = backend.session(&started.session_id).await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::Ended);
        assert_eq!(snapshot.turn, 2);
        assert_eq!(snapshot.final_result, Some(result));
    }

    #[tokio::test]
    async fn simulated_backend_rejects_a_replayed_event() {
        let backend = SimulatedBackend::default();
        let started = backend.generate_background("kb-offline").await.unwrap();
        let event = backend.generate_story(&started.session_id).await.unwrap();
        backend
            .resolve_event(&started.session_id, &event.event(), "A")
            .await
            .unwrap();

        let error = backend
            .resolve_event(&started.session_id, &event.event(), "A")
            .await
            .unwrap_err();

        assert_eq!(error.status, Some(409));
        assert!(error.has_code("EVENT_ALREADY_RESOLVED"));
        let snapshot = backend.session(&started.session_id).await.unwrap();
        assert_eq!(snapshot.turn, 1);
        assert_eq!(snapshot.history.len(), 1);
    }

    #[tokio::test]
    async fn live_backend_fetches_the_session_snapshot() {
        let offline = SimulatedBackend::default();
        let started = offline.generate_background("kb-offline").await.unwrap();
        let snapshot = offline.session(&started.session_id).await.unwrap();
        let body = serde_json::to_string(&snapshot).unwrap();
        let transport = Arc::new(RecordingTransport {
            requests: std::sync::Mutex::new(Vec::new()),
            answer: body,
        });
        let backend = LiveBackend::new(RequestClient::new(
            transport.clone(),
            "http://story.local",
            Duration::from_secs(1),
            0,
            Duration::from_millis(1),
        ));

        let fetched = backend.session(&started.session_id).await.unwrap();

        assert_eq!(fetched.session_id, started.session_id);
        let requests = transport.requests.lock().unwrap();
        let (method, url, body) = &requests[0];
        assert_eq!(*method, Method::GET);
        assert_eq!(url, &format!("http://story.local/sessions/{}", started.session_id));
        assert!(body.is_none());
    }
}
