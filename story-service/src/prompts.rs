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

use regex::Regex;
use serde_json::{Map, Value};

use crate::gateway::{Field, FieldKind, Schema};

pub const SYSTEM_PROMPT: &str = "You narrate a life simulation game. Every answer is a single JSON object with exactly the requested fields and no commentary.";
pub const NO_REFERENCE_CONTEXT: &str = "(no reference material available)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Background,
    StoryEvent,
    EventOutcome,
    FinalResult,
}

impl PromptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::StoryEvent => "story_event",
            Self::EventOutcome => "event_outcome",
            Self::FinalResult => "final_result",
        }
    }

    pub fn template(self) -> &'static str {
        match self {
            Self::Background => BACKGROUND_TEMPLATE,
            Self::StoryEvent => STORY_EVENT_TEMPLATE,
            Self::EventOutcome => EVENT_OUTCOME_TEMPLATE,
            Self::FinalResult => FINAL_RESULT_TEMPLATE,
        }
    }

    pub fn schema(self) -> &'static Schema {
        match self {
            Self::Background => &BACKGROUND_SCHEMA,
            Self::StoryEvent => &STORY_EVENT_SCHEMA,
            Self::EventOutcome => &EVENT_OUTCOME_SCHEMA,
            Self::FinalResult => &FINAL_RESULT_SCHEMA,
        }
    }
}

pub static BACKGROUND_SCHEMA: Schema = Schema {
    name: "background",
    required: &[
        Field::new("background", FieldKind::Any),
        Field::new("player_identity", FieldKind::Object),
        Field::new("life_goal", FieldKind::String),
    ],
};

pub static STORY_EVENT_SCHEMA: Schema = Schema {
    name: "story_event",
    required: &[
        Field::new("event_id", FieldKind::String),
        Field::new("event_description", FieldKind::String),
        Field::new("options", FieldKind::Array),
    ],
};

pub static EVENT_OUTCOME_SCHEMA: Schema = Schema {
    name: "event_outcome",
    required: &[
        Field::new("event_outcome", FieldKind::String),
        Field::new("updated_player_state", FieldKind::Object),
        Field::new("current_summary", FieldKind::String),
    ],
};

pub static FINAL_RESULT_SCHEMA: Schema = Schema {
    name: "final_result",
    required: &[
        Field::new("summary", FieldKind::String),
        Field::new("final_scores", FieldKind::Object),
        Field::new("ending_type", FieldKind::String),
    ],
};

const BACKGROUND_TEMPLATE: &str = r#"Start a new life story drawing on the world of knowledge base "{knowledge_base_id}".
Invent the circumstances the character is born into, the character, and one lifelong goal.

Respond with JSON fields:
- "background": object with "era", "place", "family" and "description"
- "player_identity": object with "age" (positive integer), "gender", "appearance", "profession", "initial_traits" (list of strings)
- "life_goal": one sentence"#;

const STORY_EVENT_TEMPLATE: &str = r#"World: {world_context}
Character: {player_identity}
Current state: {player_state}
Life goal: {life_goal}
Story so far: {current_summary}
Progress: {progress_label}
Pacing: {pacing_hint}

Reference material:
{reference_context}

Write the next event of this life. Respond with JSON fields:
- "event_id": short unique string
- "event_description": what happens, in the second person
- "options": exactly two objects with "option_id" ("A" and "B") and "description"
- "image_prompt": optional one-line scene description"#;

const EVENT_OUTCOME_TEMPLATE: &str = r#"World: {world_context}
Character: {player_identity}
State before the event: {player_state}
Life goal: {life_goal}
Story so far: {current_summary}
Progress: {progress_label}

Event: {event}
Chosen option: {selected_option}

Describe what follows from the choice. Respond with JSON fields:
- "event_outcome": the consequence
- "updated_player_state": object with "age", "career", "wisdom", "wealth", "relationships", "career_development", "wellbeing" (integers 0-100) and "traits" (list of strings)
- "stat_changes": list of objects with "stat", "change" (signed integer) and "reason"
- "current_summary": the whole story so far, updated with this event
- "image_prompt": optional one-line scene description"#;

const FINAL_RESULT_TEMPLATE: &str = r#"Character: {player_identity}
Life goal: {life_goal}
Final state: {player_state}
Story: {current_summary}
Decisions in order: {history}

Write the closing report of this life. Respond with JSON fields:
- "summary": a retrospective of the whole life
- "final_scores": object with "wisdom", "wealth", "relationships", "career_development", "wellbeing" (integers 0-100)
- "achievements": two to four objects with "title", "description" and "icon" (a single emoji)
- "key_decisions": exactly three objects with "event_description", "decision" and "impact"
- "ending_type": one word classifying the ending
- "ending_title": a short title for this life"#;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern is valid"));

/// Fills `{name}` placeholders. Strings are inserted verbatim, other values as JSON.
/// Unknown placeholders render as an empty string.
pub fn render_template(template: &str, variables: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| match variables.get(&caps[1]) {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        })
        .into_owned()
}

pub fn portrait_prompt(identity: &Value) -> String {
    format!("Illustrated character portrait, warm storybook style: {identity}")
}

pub fn poster_prompt(ending_title: &str, summary: &str) -> String {
    format!("Poster artwork titled \"{ending_title}\" summarising a life: {summary}")
}
