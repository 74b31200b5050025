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

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod phase;

pub use phase::{PhaseInfo, PhaseSpec, PhaseTable, PhaseTableError};

pub const SESSION_TTL_HOURS: i64 = 24;
pub const STAT_MIN: i32 = 0;
pub const STAT_MAX: i32 = 100;
pub const DEFAULT_STAT_VALUE: i32 = 50;
pub const OPTIONS_PER_EVENT: usize = 2;
pub const KEY_DECISION_COUNT: usize = 3;
pub const MIN_ACHIEVEMENTS: usize = 2;
pub const MAX_ACHIEVEMENTS: usize = 4;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerIdentity {
    pub age: u32,
    pub gender: String,
    pub appearance: String,
    pub profession: String,
    #[serde(default)]
    pub initial_traits: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerState {
    pub age: u32,
    pub career: String,
    pub wisdom: i32,
    pub wealth: i32,
    pub relationships: i32,
    pub career_development: i32,
    pub wellbeing: i32,
    #[serde(default)]
    pub traits: Vec<String>,
}

impl PlayerState {
    pub fn from_identity(identity: &PlayerIdentity) -> Self {
        Self {
            age: identity.age,
            career: identity.profession.clone(),
            wisdom: DEFAULT_STAT_VALUE,
            wealth: DEFAULT_STAT_VALUE,
            relationships: DEFAULT_STAT_VALUE,
            career_development: DEFAULT_STAT_VALUE,
            wellbeing: DEFAULT_STAT_VALUE,
            traits: identity.initial_traits.clone(),
        }
    }

    pub fn clamped(mut self) -> Self {
        self.wisdom = clamp_stat(self.wisdom);
        self.wealth = clamp_stat(self.wealth);
        self.relationships = clamp_stat(self.relationships);
        self.career_development = clamp_stat(self.career_development);
        self.wellbeing = clamp_stat(self.wellbeing);
        self
    }

    pub fn scores(&self) -> StatScores {
        StatScores {
            wisdom: self.wisdom,
            wealth: self.wealth,
            relationships: self.relationships,
            career_development: self.career_development,
            wellbeing: self.wellbeing,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatScores {
    pub wisdom: i32,
    pub wealth: i32,
    pub relationships: i32,
    pub career_development: i32,
    pub wellbeing: i32,
}

impl StatScores {
    pub fn clamped(self) -> Self {
        Self {
            wisdom: clamp_stat(self.wisdom),
            wealth: clamp_stat(self.wealth),
            relationships: clamp_stat(self.relationships),
            career_development: clamp_stat(self.career_development),
            wellbeing: clamp_stat(self.wellbeing),
        }
    }

    pub fn all_in_range(&self) -> bool {
        [
            self.wisdom,
            self.wealth,
            self.relationships,
            self.career_development,
            self.wellbeing,
        ]
        .iter()
        .all(|value| (STAT_MIN..=STAT_MAX).contains(value))
    }
}

pub fn clamp_stat(value: i32) -> i32 {
    value.clamp(STAT_MIN, STAT_MAX)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventOption {
    pub option_id: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoryEvent {
    pub event_id: String,
    pub event_description: String,
    #[serde(default)]
    pub options: Vec<EventOption>,
}

impl StoryEvent {
    pub fn option(&self, option_id: &str) -> Option<&EventOption> {
        self.options
            .iter()
            .find(|option| option.option_id == option_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryItem {
    pub event_id: String,
    pub event_description: String,
    pub selected_option: String,
    pub outcome: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatChange {
    pub stat: String,
    pub change: i32,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Achievement {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub icon: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyDecision {
    pub event_description: String,
    pub decision: String,
    pub impact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalResult {
    pub summary: String,
    pub final_scores: StatScores,
    pub achievements: Vec<Achievement>,
    pub key_decisions: Vec<KeyDecision>,
    pub ending_type: String,
    pub ending_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub knowledge_base_id: String,
    pub world_context: serde_json::Value,
    pub player_identity: PlayerIdentity,
    pub player_state: PlayerState,
    pub life_goal: String,
    pub current_summary: String,
    pub turn: u32,
    pub history: Vec<HistoryItem>,
    pub final_result: Option<FinalResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Unix seconds after which the store may drop the record. Set once.
    pub expires_at: i64,
    /// Write counter checked by conditional puts.
    pub version: u64,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        knowledge_base_id: String,
        world_context: serde_json::Value,
        player_identity: PlayerIdentity,
        life_goal: String,
    ) -> Self {
        let now = Utc::now();
        let player_state = PlayerState::from_identity(&player_identity);
        Self {
            session_id,
            status: SessionStatus::Active,
            knowledge_base_id,
            world_context,
            player_identity,
            player_state,
            life_goal,
            current_summary: String::new(),
            turn: 0,
            history: Vec::new(),
            final_result: None,
            created_at: now,
            updated_at: now,
            expires_at: (now + Duration::hours(SESSION_TTL_HOURS)).timestamp(),
            version: 0,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.status == SessionStatus::Ended
    }

    /// Applies one resolved event. `history.len() == turn` holds before and after.
    pub fn record_turn(&mut self, item: HistoryItem, player_state: PlayerState, summary: String) {
        self.history.push(item);
        self.player_state = player_state;
        self.current_summary = summary;
        self.turn += 1;
    }

    pub fn finish(&mut self, result: FinalResult) {
        self.final_result = Some(result);
        self.status = SessionStatus::Ended;
    }
}

/// Time-based id; the random suffix keeps ids distinct within one millisecond.
pub fn new_session_id() -> SessionId {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "session_{}_{}",
        Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

/// Prefixes an event id with the turn it was issued for, e.g. `t3:evt-harbor`.
pub fn turn_event_id(turn: u32, event_id: &str) -> String {
    format!("t{turn}:{event_id}")
}

/// Turn an event was issued for, if its id carries one.
pub fn event_turn(event_id: &str) -> Option<u32> {
    let (turn, _) = event_id.strip_prefix('t')?.split_once(':')?;
    turn.parse().ok()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameProgress {
    pub turn: u32,
    pub total_turns: u32,
    pub phase: String,
    pub phase_progress: String,
    pub turns_left: u32,
}

impl GameProgress {
    pub fn is_complete(&self) -> bool {
        self.turn >= self.total_turns
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateBackgroundRequest {
    #[serde(default)]
    pub knowledge_base_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateBackgroundResponse {
    pub session_id: SessionId,
    pub background: serde_json::Value,
    pub player_identity: PlayerIdentity,
    pub life_goal: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateStoryRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateStoryResponse {
    pub event_id: String,
    pub event_description: String,
    pub options: Vec<EventOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub game_progress: GameProgress,
    /// Only ever serialized as `true`; absence means "keep playing".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_generate_result: Option<bool>,
}

impl GenerateStoryResponse {
    pub fn event(&self) -> StoryEvent {
        StoryEvent {
            event_id: self.event_id.clone(),
            event_description: self.event_description.clone(),
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolveEventRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub event: Option<StoryEvent>,
    #[serde(default)]
    pub selected_option: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveEventResponse {
    pub event_outcome: String,
    pub updated_player_state: PlayerState,
    #[serde(default)]
    pub stat_changes: Vec<StatChange>,
    pub current_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub game_progress: GameProgress,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateResultRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

pub type GenerateResultResponse = FinalResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshotResponse {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub turn: u32,
    pub game_progress: GameProgress,
    pub player_identity: PlayerIdentity,
    pub player_state: PlayerState,
    pub life_goal: String,
    pub current_summary: String,
    pub history: Vec<HistoryItem>,
    pub final_result: Option<FinalResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbHealthResponse {
    pub ok: bool,
    pub table: String,
    #[serde(rename = "itemExists")]
    pub item_exists: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LambdaHealthResponse {
    pub ok: bool,
    pub timestamp: DateTime<Utc>,
}

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    });
    ENV_VAR.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}
