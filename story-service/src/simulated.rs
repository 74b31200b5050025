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

use async_trait::async_trait;
use lifesim_common::{
    HistoryItem, KEY_DECISION_COUNT, MAX_ACHIEVEMENTS, MIN_ACHIEVEMENTS, PlayerState, clamp_stat,
};
use serde_json::{Map, Value, json};

use crate::gateway::{ModelClient, ModelRequest};
use crate::prompts::PromptKind;

const SETTINGS: [(&str, &str, &str); 4] = [
    ("1960s", "a fishing village on a windy coast", "a family of net menders"),
    ("1980s", "a crowded port city", "shopkeepers above their own store"),
    ("2000s", "a mountain town with one railway", "a schoolteacher and a mechanic"),
    ("2010s", "the outskirts of a growing capital", "two parents who work night shifts"),
];

const GOALS: [&str; 4] = [
    "Build something that outlasts you.",
    "Keep the people you love close, whatever it costs.",
    "See as much of the world as one life allows.",
    "Master a craft well enough to teach it.",
];

const SITUATIONS: [&str; 6] = [
    "A stranger offers you an apprenticeship far from home.",
    "Your closest friend asks for help with a risky plan.",
    "An unexpected sum of money lands in your hands.",
    "A chance to lead arrives before you feel ready.",
    "Someone from your past returns with an apology.",
    "Your health sends a quiet warning.",
];

#[derive(Debug, Clone, Default)]
pub struct SimulatedModelClient;

impl SimulatedModelClient {
    pub fn new() -> Self {
        Self
    }

    fn background(&self, variables: &Map<String, Value>) -> Value {
        let seed = seed_of(text_var(variables, "knowledge_base_id"));
        let (era, place, family) = SETTINGS[seed % SETTINGS.len()];
        json!({
            "background": {
                "era": era,
                "place": place,
                "family": family,
                "description": format!("You are born in {era} in {place}, raised by {family}."),
            },
            "player_identity": {
                "age": 6,
                "gender": if seed % 2 == 0 { "female" } else { "male" },
                "appearance": "bright-eyed, with a scraped knee",
                "profession": "student",
                "initial_traits": ["curious", "stubborn"],
            },
            "life_goal": GOALS[seed % GOALS.len()],
        })
    }

    fn story_event(&self, variables: &Map<String, Value>) -> Value {
        let turn = variables.get("turn").and_then(Value::as_u64).unwrap_or(0);
        let phase = text_var(variables, "phase");
        let situation = SITUATIONS[turn as usize % SITUATIONS.len()];
        json!({
            "event_id": format!("sim-evt-{turn}"),
            "event_description": format!("{phase}: {situation}"),
            "options": [
                {"option_id": "A", "description": "Take the bold path."},
                {"option_id": "B", "description": "Stay with what you know."},
            ],
            "image_prompt": situation,
        })
    }

    fn event_outcome(&self, variables: &Map<String, Value>) -> Value {
        let mut state = variables
            .get("player_state")
            .cloned()
            .and_then(|value| serde_json::from_value::<PlayerState>(value).ok())
            .unwrap_or_else(default_state);
        let bold = variables
            .get("selected_option")
            .and_then(|option| option.get("option_id"))
            .and_then(Value::as_str)
            == Some("A");

        let changes = if bold {
            vec![("career_development", 8), ("wisdom", 5), ("wellbeing", -4)]
        } else {
            vec![("relationships", 7), ("wellbeing", 5), ("wealth", -3)]
        };
        for (stat, change) in &changes {
            let slot = match *stat {
                "wisdom" => &mut state.wisdom,
                "wealth" => &mut state.wealth,
                "relationships" => &mut state.relationships,
                "career_development" => &mut state.career_development,
                _ => &mut state.wellbeing,
            };
            *slot = clamp_stat(*slot + change);
        }
        state.age += 7;

        let outcome = if bold {
            "You leap, stumble, and land somewhere new."
        } else {
            "You hold steady and the people around you notice."
        };
        let previous = text_var(variables, "current_summary");
        let summary = if previous.is_empty() {
            outcome.to_string()
        } else {
            format!("{previous} {outcome}")
        };

        json!({
            "event_outcome": outcome,
            "updated_player_state": state,
            "stat_changes": changes
                .iter()
                .map(|(stat, change)| json!({
                    "stat": stat,
                    "change": change,
                    "reason": if bold { "took a risk" } else { "played it safe" },
                }))
                .collect::<Vec<_>>(),
            "current_summary": summary,
        })
    }

    fn final_result(&self, variables: &Map<String, Value>) -> Value {
        let state = variables
            .get("player_state")
            .cloned()
            .and_then(|value| serde_json::from_value::<PlayerState>(value).ok())
            .unwrap_or_else(default_state);
        let history: Vec<HistoryItem> = variables
            .get("history")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        let scores = state.scores();

        let mut ranked = [
            ("Sage", "wisdom", scores.wisdom, "🦉"),
            ("Fortune Maker", "wealth", scores.wealth, "💰"),
            ("Beloved", "relationships", scores.relationships, "❤️"),
            ("Trailblazer", "career_development", scores.career_development, "🚀"),
            ("At Peace", "wellbeing", scores.wellbeing, "🌿"),
        ];
        ranked.sort_by(|a, b| b.2.cmp(&a.2));
        let earned = ranked.iter().filter(|entry| entry.2 >= 60).count();
        let achievements: Vec<Value> = ranked
            .iter()
            .take(earned.clamp(MIN_ACHIEVEMENTS, MAX_ACHIEVEMENTS))
            .map(|(title, stat, value, icon)| {
                json!({
                    "title": title,
                    "description": format!("Finished life with {stat} at {value}."),
                    "icon": icon,
                })
            })
            .collect();

        let key_decisions: Vec<Value> = (0..KEY_DECISION_COUNT)
            .map(|index| match history.get(index * history.len().max(1) / KEY_DECISION_COUNT) {
                Some(item) => json!({
                    "event_description": item.event_description,
                    "decision": format!("Chose option {}", item.selected_option),
                    "impact": item.outcome,
                }),
                None => json!({
                    "event_description": "A quiet year",
                    "decision": "Let life happen",
                    "impact": "Little changed.",
                }),
            })
            .collect();

        let average = (scores.wisdom
            + scores.wealth
            + scores.relationships
            + scores.career_development
            + scores.wellbeing)
            / 5;
        let (ending_type, ending_title) = match average {
            70.. => ("triumphant", "A Life Well Spent"),
            45..=69 => ("balanced", "An Ordinary Wonder"),
            _ => ("bittersweet", "Lessons Learned Late"),
        };

        json!({
            "summary": format!(
                "A life of {} decisions, ending at age {}.",
                history.len(),
                state.age
            ),
            "final_scores": scores,
            "achievements": achievements,
            "key_decisions": key_decisions,
            "ending_type": ending_type,
            "ending_title": ending_title,
        })
    }
}

#[async_trait]
impl ModelClient for SimulatedModelClient {
    async fn complete(&self, request: &ModelRequest) -> anyhow::Result<String> {
        let value = match request.kind {
            PromptKind::Background => self.background(&request.variables),
            PromptKind::StoryEvent => self.story_event(&request.variables),
            PromptKind::EventOutcome => self.event_outcome(&request.variables),
            PromptKind::FinalResult => self.final_result(&request.variables),
        };
        Ok(value.to_string())
    }
}

fn text_var<'a>(variables: &'a Map<String, Value>, name: &str) -> &'a str {
    variables.get(name).and_then(Value::as_str).unwrap_or_default()
}

fn seed_of(text: &str) -> usize {
    text.bytes()
        .fold(7usize, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte as usize))
}

fn default_state() -> PlayerState {
    PlayerState {
        age: 6,
        career: "student".to_string(),
        wisdom: 50,
        wealth: 50,
        relationships: 50,
        career_development: 50,
        wellbeing: 50,
        traits: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::parse_model_output;
    use chrono::Utc;

    async fn answer(kind: PromptKind, variables: Value) -> Value {
        let request = ModelRequest {
            kind,
            system: String::new(),
            prompt: String::new(),
            variables: variables.as_object().cloned().unwrap_or_default(),
        };
        let raw = SimulatedModelClient::new().complete(&request).await.unwrap();
        parse_model_output(&raw, kind.schema()).unwrap()
    }

    #[tokio::test]
    async fn background_is_stable_per_knowledge_base() {
        let first = answer(PromptKind::Background, json!({"knowledge_base_id": "kb-7"})).await;
        let second = answer(PromptKind::Background, json!({"knowledge_base_id": "kb-7"})).await;
        assert_eq!(first, second);
        assert!(first["player_identity"]["age"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn story_event_offers_two_options() {
        let event = answer(PromptKind::StoryEvent, json!({"turn": 3, "phase": "Midlife"})).await;
        assert_eq!(event["event_id"], json!("sim-evt-3"));
        assert_eq!(event["options"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bold_choice_moves_career_and_keeps_stats_in_range() {
        let mut state = default_state();
        state.career_development = 98;
        let outcome = answer(
            PromptKind::EventOutcome,
            json!({
                "player_state": state,
                "selected_option": {"option_id": "A", "description": "Take the bold path."},
                "current_summary": "You grew up by the sea.",
            }),
        )
        .await;

        let updated: PlayerState =
            serde_json::from_value(outcome["updated_player_state"].clone()).unwrap();
        assert_eq!(updated.career_development, 100);
        assert_eq!(updated.age, 13);
        assert!(updated.scores().all_in_range());
        assert!(
            outcome["current_summary"]
                .as_str()
                .unwrap()
                .starts_with("You grew up by the sea.")
        );
    }

    #[tokio::test]
    async fn final_result_has_three_decisions_and_bounded_achievements() {
        let history: Vec<HistoryItem> = (0..10)
            .map(|index| HistoryItem {
                event_id: format!("sim-evt-{index}"),
                event_description: format!("event {index}"),
                selected_option: "A".to_string(),
                outcome: "it went fine".to_string(),
                timestamp: Utc::now(),
            })
            .collect();
        let result = answer(
            PromptKind::FinalResult,
            json!({"player_state": default_state(), "history": history}),
        )
        .await;

        assert_eq!(
            result["key_decisions"].as_array().unwrap().len(),
            KEY_DECISION_COUNT
        );
        let achievements = result["achievements"].as_array().unwrap().len();
        assert!((MIN_ACHIEVEMENTS..=MAX_ACHIEVEMENTS).contains(&achievements));
        assert_eq!(result["key_decisions"][1]["event_description"], json!("event 3"));
    }
}
