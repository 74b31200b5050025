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

use std::sync::Arc;

use chrono::Utc;
use lifesim_common::{
    Achievement, EventOption, FinalResult, GenerateBackgroundResponse, GenerateStoryResponse,
    HistoryItem, KEY_DECISION_COUNT, KeyDecision, MAX_ACHIEVEMENTS, MIN_ACHIEVEMENTS,
    OPTIONS_PER_EVENT, PhaseInfo, PhaseTable, PlayerIdentity, PlayerState, ResolveEventResponse,
    Session, SessionSnapshotResponse, StatChange, StatScores, StoryEvent, event_turn,
    new_session_id, turn_event_id,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::gateway::{Gateway, GenerationError, RetrievalQuery};
use crate::prompts::{PromptKind, portrait_prompt, poster_prompt};
use crate::store::{SessionStore, StoreError};

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} has already ended")]
    SessionEnded(String),
    #[error("session {session_id} has played all {total_turns} turns; generate the result")]
    GameComplete { session_id: String, total_turns: u32 },
    #[error("event {event_id} of session {session_id} has already been resolved")]
    EventAlreadyResolved {
        session_id: String,
        event_id: String,
    },
    #[error("session {0} was changed by another request; reload and retry")]
    Conflict(String),
    #[error("story generation failed: {0}")]
    GenerationFailed(String),
    #[error("story generation returned unusable output: {0}")]
    GenerationInvalid(String),
    #[error("{0}")]
    StorageUnavailable(String),
}

impl From<StoreError> for TurnError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(session_id) => Self::NotFound(session_id),
            StoreError::Conflict { session_id, .. } => Self::Conflict(session_id),
            other @ (StoreError::AlreadyExists(_) | StoreError::Unavailable(_)) => {
                Self::StorageUnavailable(other.to_string())
            }
        }
    }
}

impl From<GenerationError> for TurnError {
    fn from(error: GenerationError) -> Self {
        match error {
            GenerationError::Failed(message) => Self::GenerationFailed(message),
            invalid @ GenerationError::Invalid { .. } => {
                Self::GenerationInvalid(invalid.to_string())
            }
        }
    }
}

#[derive(Deserialize)]
struct GeneratedBackground {
    background: Value,
    player_identity: PlayerIdentity,
    life_goal: String,
}

#[derive(Deserialize)]
struct GeneratedEvent {
    event_id: String,
    event_description: String,
    options: Vec<EventOption>,
    #[serde(default)]
    image_prompt: Option<String>,
}

#[derive(Deserialize)]
struct GeneratedOutcome {
    event_outcome: String,
    updated_player_state: PlayerState,
    #[serde(default)]
    stat_changes: Vec<StatChange>,
    current_summary: String,
    #[serde(default)]
    image_prompt: Option<String>,
}

#[derive(Deserialize)]
struct GeneratedResult {
    summary: String,
    final_scores: StatScores,
    #[serde(default)]
    achievements: Vec<Achievement>,
    #[serde(default)]
    key_decisions: Vec<KeyDecision>,
    ending_type: String,
    #[serde(default)]
    ending_title: Option<String>,
}

#[derive(Clone)]
pub struct TurnOrchestrator {
    store: Arc<dyn SessionStore>,
    gateway: Gateway,
    phases: PhaseTable,
}

impl TurnOrchestrator {
    pub fn new(store: Arc<dyn SessionStore>, gateway: Gateway, phases: PhaseTable) -> Self {
        Self {
            store,
            gateway,
            phases,
        }
    }

    pub fn phases(&self) -> &PhaseTable {
        &self.phases
    }

    pub async fn start(
        &self,
        knowledge_base_id: Option<&str>,
    ) -> Result<GenerateBackgroundResponse, TurnError> {
        let knowledge_base_id = required(knowledge_base_id, "knowledge_base_id")?;
        let session_id = new_session_id();

        let mut variables = Map::new();
        variables.insert("knowledge_base_id".to_string(), json!(knowledge_base_id));
        let value = self
            .gateway
            .generate(PromptKind::Background, &variables, PromptKind::Background.schema())
            .await?;
        let generated: GeneratedBackground = decode(value, "background")?;
        if generated.player_identity.age == 0 {
            return Err(TurnError::GenerationInvalid(
                "background: player age must be positive".to_string(),
            ));
        }
        if generated.life_goal.trim().is_empty() {
            return Err(TurnError::GenerationInvalid(
                "background: life goal is empty".to_string(),
            ));
        }

        let session = Session::new(
            session_id.clone(),
            knowledge_base_id.to_string(),
            generated.background.clone(),
            generated.player_identity.clone(),
            generated.life_goal.clone(),
        );
        self.store.create(&session).await?;
        info!(
            session_id = %session_id,
            knowledge_base_id,
            total_turns = self.phases.total_turns(),
            "session started"
        );

        let identity = serde_json::to_value(&generated.player_identity).unwrap_or(Value::Null);
        let image = self.gateway.generate_image(&portrait_prompt(&identity)).await;

        Ok(GenerateBackgroundResponse {
            session_id,
            background: generated.background,
            player_identity: generated.player_identity,
            life_goal: generated.life_goal,
            image,
        })
    }

    /// Generates the event for the current turn. Does not modify the session,
    /// so calling it again for the same turn is safe.
    pub async fn next_event(
        &self,
        session_id: Option<&str>,
    ) -> Result<GenerateStoryResponse, TurnError> {
        let session_id = required(session_id, "session_id")?;
        let session = self.store.get(session_id).await?;
        let info = self.playable_phase(&session)?;

        let query = RetrievalQuery {
            knowledge_base_id: session.knowledge_base_id.clone(),
            query: format!("{} {}", session.current_summary, session.life_goal)
                .trim()
                .to_string(),
        };
        let value = self
            .gateway
            .generate_with_retrieval(
                PromptKind::StoryEvent,
                story_variables(&session, &info),
                PromptKind::StoryEvent.schema(),
                query,
            )
            .await?;
        let generated: GeneratedEvent = decode(value, "story_event")?;
        validate_options(&generated.options)?;
        let event_id = turn_event_id(session.turn, &generated.event_id);

        let image_prompt = generated
            .image_prompt
            .filter(|prompt| !prompt.trim().is_empty());
        let image = match &image_prompt {
            Some(prompt) => self.gateway.generate_image(prompt).await,
            None => None,
        };

        debug!(
            session_id,
            turn = session.turn,
            phase = %info.phase_name,
            event_id = %event_id,
            "event generated"
        );

        Ok(GenerateStoryResponse {
            event_id,
            event_description: generated.event_description,
            options: generated.options,
            image_prompt,
            image,
            game_progress: info.game_progress(),
            should_generate_result: info.is_last_turn.then_some(true),
        })
    }

    /// Applies the player's choice. The session is written once, conditionally
    /// on the version read here. An event from an earlier turn is rejected
    /// instead of being applied again.
    pub async fn resolve_choice(
        &self,
        session_id: Option<&str>,
        event: Option<StoryEvent>,
        selected_option: Option<&str>,
    ) -> Result<ResolveEventResponse, TurnError> {
        let session_id = required(session_id, "session_id")?;
        let event = event.ok_or_else(|| TurnError::InvalidInput("event is required".to_string()))?;
        let selected_option = required(selected_option, "selected_option")?;
        let option = event.option(selected_option).cloned().ok_or_else(|| {
            TurnError::InvalidInput(format!(
                "selected_option {selected_option:?} is not an option of event {:?}",
                event.event_id
            ))
        })?;

        let mut session = self.store.get(session_id).await?;
        if session.is_ended() {
            return Err(TurnError::SessionEnded(session.session_id));
        }
        check_event_turn(&session, &event.event_id)?;
        let info = self.playable_phase(&session)?;

        let mut variables = story_variables(&session, &info);
        variables.insert("event".to_string(), json!(event));
        variables.insert("selected_option".to_string(), json!(option));
        let value = self
            .gateway
            .generate(PromptKind::EventOutcome, &variables, PromptKind::EventOutcome.schema())
            .await?;
        let generated: GeneratedOutcome = decode(value, "event_outcome")?;

        let item = HistoryItem {
            event_id: event.event_id.clone(),
            event_description: event.event_description.clone(),
            selected_option: option.option_id.clone(),
            outcome: generated.event_outcome.clone(),
            timestamp: Utc::now(),
        };
        let player_state = generated.updated_player_state.clamped();
        session.record_turn(
            item,
            player_state.clone(),
            generated.current_summary.clone(),
        );
        let written = self.store.put(session).await?;
        info!(
            session_id,
            turn = written.turn,
            event_id = %event.event_id,
            option = %option.option_id,
            "event resolved"
        );

        let image_prompt = generated
            .image_prompt
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or_else(|| generated.event_outcome.clone());
        let image = self.gateway.generate_image(&image_prompt).await;

        Ok(ResolveEventResponse {
            event_outcome: generated.event_outcome,
            updated_player_state: player_state,
            stat_changes: generated.stat_changes,
            current_summary: generated.current_summary,
            image,
            game_progress: self.phases.phase_info(written.turn).game_progress(),
        })
    }

    /// Produces the closing report and ends the session. Calling it again
    /// regenerates and overwrites the stored result.
    pub async fn finalize(&self, session_id: Option<&str>) -> Result<FinalResult, TurnError> {
        let session_id = required(session_id, "session_id")?;
        let mut session = self.store.get(session_id).await?;

        let mut variables = Map::new();
        variables.insert("player_identity".to_string(), json!(session.player_identity));
        variables.insert("life_goal".to_string(), json!(session.life_goal));
        variables.insert("player_state".to_string(), json!(session.player_state));
        variables.insert("current_summary".to_string(), json!(session.current_summary));
        variables.insert("history".to_string(), json!(session.history));
        let value = self
            .gateway
            .generate(PromptKind::FinalResult, &variables, PromptKind::FinalResult.schema())
            .await?;
        let generated: GeneratedResult = decode(value, "final_result")?;

        let mut achievements = generated.achievements;
        if achievements.len() < MIN_ACHIEVEMENTS {
            return Err(TurnError::GenerationInvalid(format!(
                "final_result: expected at least {MIN_ACHIEVEMENTS} achievements, got {}",
                achievements.len()
            )));
        }
        achievements.truncate(MAX_ACHIEVEMENTS);
        if generated.key_decisions.len() != KEY_DECISION_COUNT {
            return Err(TurnError::GenerationInvalid(format!(
                "final_result: expected {KEY_DECISION_COUNT} key decisions, got {}",
                generated.key_decisions.len()
            )));
        }

        let ending_title = generated
            .ending_title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| generated.ending_type.clone());
        let mut result = FinalResult {
            summary: generated.summary,
            final_scores: generated.final_scores.clamped(),
            achievements,
            key_decisions: generated.key_decisions,
            ending_type: generated.ending_type,
            ending_title,
            image: None,
        };

        // Images stay out of the stored record.
        session.finish(result.clone());
        let written = self.store.put(session).await?;
        info!(
            session_id,
            turn = written.turn,
            ending_type = %result.ending_type,
            "session finalized"
        );

        result.image = self
            .gateway
            .generate_image(&poster_prompt(&result.ending_title, &result.summary))
            .await;
        Ok(result)
    }

    pub async fn session(&self, session_id: &str) -> Result<SessionSnapshotResponse, TurnError> {
        let session_id = required(Some(session_id), "session_id")?;
        let session = self.store.get(session_id).await?;
        let game_progress = self.phases.phase_info(session.turn).game_progress();
        Ok(SessionSnapshotResponse {
            session_id: session.session_id,
            status: session.status,
            turn: session.turn,
            game_progress,
            player_identity: session.player_identity,
            player_state: session.player_state,
            life_goal: session.life_goal,
            current_summary: session.current_summary,
            history: session.history,
            final_result: session.final_result,
            created_at: session.created_at,
            updated_at: session.updated_at,
        })
    }

    fn playable_phase(&self, session: &Session) -> Result<PhaseInfo, TurnError> {
        if session.is_ended() {
            return Err(TurnError::SessionEnded(session.session_id.clone()));
        }
        let info = self.phases.phase_info(session.turn);
        if info.is_game_ending {
            return Err(TurnError::GameComplete {
                session_id: session.session_id.clone(),
                total_turns: info.total_turns,
            });
        }
        Ok(info)
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, TurnError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TurnError::InvalidInput(format!("{field} is required")))
}

fn check_event_turn(session: &Session, event_id: &str) -> Result<(), TurnError> {
    let already_resolved = || TurnError::EventAlreadyResolved {
        session_id: session.session_id.clone(),
        event_id: event_id.to_string(),
    };
    match event_turn(event_id) {
        Some(turn) if turn < session.turn => Err(already_resolved()),
        Some(turn) if turn > session.turn => Err(TurnError::InvalidInput(format!(
            "event {event_id:?} belongs to turn {turn}, session is at turn {}",
            session.turn
        ))),
        Some(_) => Ok(()),
        None if session.history.iter().any(|item| item.event_id == event_id) => {
            Err(already_resolved())
        }
        None => Ok(()),
    }
}

fn decode<T: DeserializeOwned>(value: Value, schema: &str) -> Result<T, TurnError> {
    serde_json::from_value(value)
        .map_err(|error| TurnError::GenerationInvalid(format!("{schema}: {error}")))
}

fn validate_options(options: &[EventOption]) -> Result<(), TurnError> {
    if options.len() != OPTIONS_PER_EVENT {
        return Err(TurnError::GenerationInvalid(format!(
            "story_event: expected {OPTIONS_PER_EVENT} options, got {}",
            options.len()
        )));
    }
    for (index, option) in options.iter().enumerate() {
        if option.option_id.trim().is_empty() || option.description.trim().is_empty() {
            return Err(TurnError::GenerationInvalid(format!(
                "story_event: option {index} needs an id and a description"
            )));
        }
        if options[..index]
            .iter()
            .any(|earlier| earlier.option_id == option.option_id)
        {
            return Err(TurnError::GenerationInvalid(format!(
                "story_event: duplicate option id {:?}",
                option.option_id
            )));
        }
    }
    Ok(())
}

fn story_variables(session: &Session, info: &PhaseInfo) -> Map<String, Value> {
    let mut variables = Map::new();
    variables.insert("world_context".to_string(), session.world_context.clone());
    variables.insert("player_identity".to_string(), json!(session.player_identity));
    variables.insert("player_state".to_string(), json!(session.player_state));
    variables.insert("life_goal".to_string(), json!(session.life_goal));
    variables.insert("current_summary".to_string(), json!(session.current_summary));
    variables.insert("progress_label".to_string(), json!(info.progress_label()));
    variables.insert("pacing_hint".to_string(), json!(info.pacing_hint()));
    variables.insert("phase".to_string(), json!(info.phase_name));
    variables.insert("turn".to_string(), json!(info.turn));
    variables.insert("total_turns".to_string(), json!(info.total_turns));
    variables
}
