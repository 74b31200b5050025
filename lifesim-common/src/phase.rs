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

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::GameProgress;

pub const DEFAULT_TURNS_PER_PHASE: u32 = 2;
pub const DEFAULT_PHASE_NAMES: [&str; 5] = [
    "Childhood",
    "Adolescence",
    "Young Adulthood",
    "Midlife",
    "Later Years",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseSpec {
    pub name: String,
    #[serde(default = "default_turns_per_phase")]
    pub turns: u32,
}

fn default_turns_per_phase() -> u32 {
    DEFAULT_TURNS_PER_PHASE
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseTableError {
    #[error("phase table must contain at least one phase")]
    Empty,
    #[error("phase {name:?} must last at least one turn")]
    ZeroLength { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTable {
    phases: Vec<PhaseSpec>,
    starts: Vec<u32>,
    total_turns: u32,
}

impl PhaseTable {
    pub fn new(phases: Vec<PhaseSpec>) -> Result<Self, PhaseTableError> {
        if phases.is_empty() {
            return Err(PhaseTableError::Empty);
        }
        if let Some(phase) = phases.iter().find(|phase| phase.turns == 0) {
            return Err(PhaseTableError::ZeroLength {
                name: phase.name.clone(),
            });
        }

        let mut starts = Vec::with_capacity(phases.len());
        let mut total_turns = 0_u32;
        for phase in &phases {
            starts.push(total_turns);
            total_turns += phase.turns;
        }

        Ok(Self {
            phases,
            starts,
            total_turns,
        })
    }

    pub fn uniform(names: &[&str], turns_per_phase: u32) -> Result<Self, PhaseTableError> {
        Self::new(
            names
                .iter()
                .map(|name| PhaseSpec {
                    name: (*name).to_string(),
                    turns: turns_per_phase,
                })
                .collect(),
        )
    }

    pub fn total_turns(&self) -> u32 {
        self.total_turns
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn phase_info(&self, turn: u32) -> PhaseInfo {
        let last_index = self.phases.len() - 1;
        let phase_index = if turn >= self.total_turns {
            last_index
        } else {
            // Index of the last phase starting at or before `turn`.
            self.starts.partition_point(|start| *start <= turn) - 1
        };

        let phase = &self.phases[phase_index];
        let offset = turn - self.starts[phase_index];
        let turn_in_phase = if turn >= self.total_turns {
            offset % phase.turns
        } else {
            offset
        };
        let turns_left_in_phase = phase.turns - turn_in_phase - 1;

        PhaseInfo {
            turn,
            total_turns: self.total_turns,
            phase_index,
            phase_count: self.phases.len(),
            phase_name: phase.name.clone(),
            next_phase_name: self
                .phases
                .get(phase_index + 1)
                .map(|next| next.name.clone()),
            phase_turns: phase.turns,
            turn_in_phase,
            turns_left_in_phase,
            total_turns_left: self.total_turns.saturating_sub(turn).saturating_sub(1),
            is_last_turn_of_phase: turns_left_in_phase == 0,
            is_last_phase: phase_index == last_index,
            is_game_ending: turn >= self.total_turns,
            is_last_turn: turn + 1 == self.total_turns,
        }
    }
}

impl Default for PhaseTable {
    fn default() -> Self {
        Self {
            phases: DEFAULT_PHASE_NAMES
                .iter()
                .map(|name| PhaseSpec {
                    name: (*name).to_string(),
                    turns: DEFAULT_TURNS_PER_PHASE,
                })
                .collect(),
            starts: (0..DEFAULT_PHASE_NAMES.len() as u32)
                .map(|index| index * DEFAULT_TURNS_PER_PHASE)
                .collect(),
            total_turns: DEFAULT_PHASE_NAMES.len() as u32 * DEFAULT_TURNS_PER_PHASE,
        }
    }
}

/// Position of a turn within the life story. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseInfo {
    pub turn: u32,
    pub total_turns: u32,
    pub phase_index: usize,
    pub phase_count: usize,
    pub phase_name: String,
    pub next_phase_name: Option<String>,
    pub phase_turns: u32,
    pub turn_in_phase: u32,
    pub turns_left_in_phase: u32,
    pub total_turns_left: u32,
    pub is_last_turn_of_phase: bool,
    pub is_last_phase: bool,
    /// The turn counter has moved past the last playable turn.
    pub is_game_ending: bool,
    /// The final playable turn.
    pub is_last_turn: bool,
}

impl PhaseInfo {
    pub fn phase_progress(&self) -> String {
        format!("{}/{}", self.turn_in_phase + 1, self.phase_turns)
    }

    pub fn progress_label(&self) -> String {
        if self.is_game_ending {
            return format!("Life complete ({} of {} events)", self.total_turns, self.total_turns);
        }
        format!(
            "{} ({}), event {} of {}",
            self.phase_name,
            self.phase_progress(),
            self.turn + 1,
            self.total_turns
        )
    }

    /// Narrative pacing instruction handed to the story prompt.
    pub fn pacing_hint(&self) -> String {
        if self.is_game_ending {
            return "The life story is complete. Do not introduce new events.".to_string();
        }
        if self.is_last_turn {
            return format!(
                "This is the final event of the whole life, set in {}. Bring the story to a meaningful close and let the choice reflect on the life goal.",
                self.phase_name
            );
        }
        if self.is_last_turn_of_phase {
            return match &self.next_phase_name {
                Some(next) => format!(
                    "This is the last event of {}. Resolve its open threads and foreshadow the move into {}.",
                    self.phase_name, next
                ),
                None => format!(
                    "This is the last event of {}. Resolve its open threads.",
                    self.phase_name
                ),
            };
        }
        if self.turn_in_phase == 0 {
            return format!(
                "This event opens {}. Establish the new stage of life and what has changed.",
                self.phase_name
            );
        }
        format!(
            "This event develops {}; build on earlier choices. {} events remain in this phase after it.",
            self.phase_name, self.turns_left_in_phase
        )
    }

    pub fn game_progress(&self) -> GameProgress {
        GameProgress {
            turn: self.turn,
            total_turns: self.total_turns,
            phase: self.phase_name.clone(),
            phase_progress: self.phase_progress(),
            turns_left: self.total_turns_left,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uneven_table() -> PhaseTable {
        PhaseTable::new(vec![
            PhaseSpec {
                name: "Childhood".to_string(),
                turns: 1,
            },
            PhaseSpec {
                name: "Youth".to_string(),
                turns: 3,
            },
            PhaseSpec {
                name: "Adulthood".to_string(),
                turns: 2,
            },
        ])
        .unwrap()
    }

    #[test]
    fn default_table_has_ten_turns_over_five_phases() {
        let table = PhaseTable::default();
        assert_eq!(table.total_turns(), 10);
        assert_eq!(table.phases().len(), 5);
        assert_eq!(
            table,
            PhaseTable::uniform(&DEFAULT_PHASE_NAMES, DEFAULT_TURNS_PER_PHASE).unwrap()
        );
    }

    #[test]
    fn uniform_table_matches_modulo_arithmetic() {
        let table = PhaseTable::uniform(&["a", "b", "c", "d"], 3).unwrap();
        let total = table.total_turns();
        for turn in 0..total + 5 {
            let info = table.phase_info(turn);
            assert_eq!(info.phase_index, ((turn / 3) as usize).min(3));
            assert_eq!(info.turn_in_phase, turn % 3);
            assert_eq!(info.turns_left_in_phase, 3 - turn % 3 - 1);
        }
    }

    #[test]
    fn phase_index_is_monotonic_and_clamped() {
        for table in [PhaseTable::default(), uneven_table()] {
            let mut previous = 0;
            for turn in 0..table.total_turns() + 6 {
                let info = table.phase_info(turn);
                assert!(info.phase_index >= previous);
                previous = info.phase_index;
                if turn >= table.total_turns() {
                    assert_eq!(info.phase_index, table.phases().len() - 1);
                    assert!(info.is_game_ending);
                }
            }
        }
    }

    #[test]
    fn each_phase_has_exactly_one_closing_turn() {
        for table in [PhaseTable::default(), uneven_table()] {
            let mut closing = vec![0; table.phases().len()];
            for turn in 0..table.total_turns() {
                let info = table.phase_info(turn);
                if info.is_last_turn_of_phase {
                    closing[info.phase_index] += 1;
                }
            }
            assert!(closing.iter().all(|count| *count == 1), "{closing:?}");
        }
    }

    #[test]
    fn last_turn_is_only_the_final_playable_turn() {
        let table = uneven_table();
        for turn in 0..table.total_turns() + 3 {
            let info = table.phase_info(turn);
            assert_eq!(info.is_last_turn, turn == table.total_turns() - 1);
            assert_eq!(info.is_game_ending, turn >= table.total_turns());
        }
    }

    #[test]
    fn uneven_table_uses_cumulative_boundaries() {
        let table = uneven_table();
        let info = table.phase_info(3);
        assert_eq!(info.phase_name, "Youth");
        assert_eq!(info.turn_in_phase, 2);
        assert!(info.is_last_turn_of_phase);
        assert_eq!(info.next_phase_name.as_deref(), Some("Adulthood"));
        assert_eq!(info.total_turns_left, 2);

        let info = table.phase_info(4);
        assert_eq!(info.phase_name, "Adulthood");
        assert_eq!(info.turn_in_phase, 0);
        assert!(info.is_last_phase);
        assert_eq!(info.phase_progress(), "1/2");
    }

    #[test]
    fn overrun_saturates_remaining_turns() {
        let table = PhaseTable::default();
        let info = table.phase_info(table.total_turns());
        assert_eq!(info.total_turns_left, 0);
        assert_eq!(info.game_progress().turns_left, 0);
        assert!(info.progress_label().starts_with("Life complete"));
    }

    #[test]
    fn pacing_hint_tracks_position_in_phase() {
        let table = PhaseTable::default();
        assert!(table.phase_info(0).pacing_hint().contains("opens Childhood"));
        assert!(table.phase_info(1).pacing_hint().contains("foreshadow the move into Adolescence"));
        assert!(table.phase_info(9).pacing_hint().contains("final event"));
    }

    #[test]
    fn invalid_tables_are_rejected() {
        assert_eq!(PhaseTable::new(vec![]), Err(PhaseTableError::Empty));
        assert_eq!(
            PhaseTable::new(vec![PhaseSpec {
                name: "void".to_string(),
                turns: 0
            }]),
            Err(PhaseTableError::ZeroLength {
                name: "void".to_string()
            })
        );
    }
}
