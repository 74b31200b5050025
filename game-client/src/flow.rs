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

use lifesim_common::{
    FinalResult, GameProgress, GenerateBackgroundResponse, GenerateStoryResponse,
    ResolveEventResponse, SessionStatus,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::GameBackend;
use crate::request::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStage {
    NotStarted,
    Ready,
    AwaitingChoice,
    ReadyForResult,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    Start { knowledge_base_id: String },
    LoadEvent,
    Choose { option_id: String },
    Finish,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("{action} is not possible while the game is {stage:?}")]
    WrongStage {
        action: &'static str,
        stage: FlowStage,
    },
    #[error("option {0:?} is not offered by the current event")]
    UnknownOption(String),
    #[error("there is no failed action to retry")]
    NothingToRetry,
}

impl FlowError {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Request(error) => error.kind.as_str(),
            Self::WrongStage { .. } | Self::UnknownOption(_) | Self::NothingToRetry => "flow",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowFailure {
    pub action: FlowAction,
    pub error_type: &'static str,
    pub message: String,
}

/// Drives one playthrough from background to final report.
pub struct GameFlow {
    backend: Arc<dyn GameBackend>,
    stage: FlowStage,
    background: Option<GenerateBackgroundResponse>,
    current_event: Option<GenerateStoryResponse>,
    outcomes: Vec<ResolveEventResponse>,
    progress: Option<GameProgress>,
    result: Option<FinalResult>,
    failure: Option<FlowFailure>,
}

impl GameFlow {
    pub fn new(backend: Arc<dyn GameBackend>) -> Self {
        Self {
            backend,
            stage: FlowStage::NotStarted,
            background: None,
            current_event: None,
            outcomes: Vec::new(),
            progress: None,
            result: None,
            failure: None,
        }
    }

    pub fn stage(&self) -> FlowStage {
        self.stage
    }

    pub fn session_id(&self) -> Option<&str> {
        self.background
            .as_ref()
            .map(|background| background.session_id.as_str())
    }

    pub fn background(&self) -> Option<&GenerateBackgroundResponse> {
        self.background.as_ref()
    }

    pub fn current_event(&self) -> Option<&GenerateStoryResponse> {
        self.current_event.as_ref()
    }

    pub fn outcomes(&self) -> &[ResolveEventResponse] {
        &self.outcomes
    }

    pub fn progress(&self) -> Option<&GameProgress> {
        self.progress.as_ref()
    }

    pub fn result(&self) -> Option<&FinalResult> {
        self.result.as_ref()
    }

    pub fn last_failure(&self) -> Option<&FlowFailure> {
        self.failure.as_ref()
    }

    pub fn dismiss_error(&mut self) {
        self.failure = None;
    }

    pub async fn start(&mut self, knowledge_base_id: &str) -> Result<(), FlowError> {
        self.run(FlowAction::Start {
            knowledge_base_id: knowledge_base_id.to_string(),
        })
        .await
    }

    pub async fn load_next_event(&mut self) -> Result<(), FlowError> {
        self.run(FlowAction::LoadEvent).await
    }

    pub async fn choose(&mut self, option_id: &str) -> Result<(), FlowError> {
        self.run(FlowAction::Choose {
            option_id: option_id.to_string(),
        })
        .await
    }

    pub async fn finish(&mut self) -> Result<(), FlowError> {
        self.run(FlowAction::Finish).await
    }

    /// Re-issues the last failed action. Turns already recorded are kept.
    pub async fn retry(&mut self) -> Result<(), FlowError> {
        let failure = self.failure.clone().ok_or(FlowError::NothingToRetry)?;
        info!(error_type = failure.error_type, "retrying failed action");
        self.run(failure.action).await
    }

    async fn run(&mut self, action: FlowAction) -> Result<(), FlowError> {
        let outcome = match &action {
            FlowAction::Start { knowledge_base_id } => self.do_start(knowledge_base_id).await,
            FlowAction::LoadEvent => self.do_load_event().await,
            FlowAction::Choose { option_id } => self.do_choose(option_id).await,
            FlowAction::Finish => self.do_finish().await,
        };

        match outcome {
            Ok(()) => {
                self.failure = None;
                Ok(())
            }
            Err(FlowError::Request(error)) => {
                warn!(
                    action = %action,
                    error_type = error.kind.as_str(),
                    status = ?error.status,
                    "game action failed"
                );
                self.failure = Some(FlowFailure {
                    action,
                    error_type: error.kind.as_str(),
                    message: error.message.clone(),
                });
                Err(FlowError::Request(error))
            }
            Err(error) => Err(error),
        }
    }

    fn require_stage(
        &self,
        action: &'static str,
        allowed: &[FlowStage],
    ) -> Result<(), FlowError> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(FlowError::WrongStage {
                action,
                stage: self.stage,
            })
        }
    }

    fn require_session(&self, action: &'static str) -> Result<String, FlowError> {
        self.session_id()
            .map(str::to_string)
            .ok_or(FlowError::WrongStage {
                action,
                stage: self.stage,
            })
    }

    async fn do_start(&mut self, knowledge_base_id: &str) -> Result<(), FlowError> {
        self.require_stage("start", &[FlowStage::NotStarted])?;
        let background = self.backend.generate_background(knowledge_base_id).await?;
        info!(session_id = %background.session_id, "game started");
        self.background = Some(background);
        self.stage = FlowStage::Ready;
        Ok(())
    }

    async fn do_load_event(&mut self) -> Result<(), FlowError> {
        // Reloading while a choice is pending replaces the event; the
        // service does not advance until a choice is resolved.
        self.require_stage("load event", &[FlowStage::Ready, FlowStage::AwaitingChoice])?;
        let session_id = self.require_session("load event")?;

        match self.backend.generate_story(&session_id).await {
            Ok(event) => {
                debug!(session_id = %session_id, event_id = %event.event_id, "event loaded");
                self.progress = Some(event.game_progress.clone());
                self.current_event = Some(event);
                self.stage = FlowStage::AwaitingChoice;
                Ok(())
            }
            Err(error) if error.has_code("GAME_COMPLETE") => {
                info!(session_id = %session_id, "service reports every turn played");
                self.current_event = None;
                self.stage = FlowStage::ReadyForResult;
                Ok(())
            }
            Err(error) if error.has_code("SESSION_ENDED") => {
                info!(session_id = %session_id, "service reports the session ended");
                self.resync(&session_id, None).await
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn do_choose(&mut self, option_id: &str) -> Result<(), FlowError> {
        self.require_stage("choose", &[FlowStage::AwaitingChoice])?;
        let session_id = self.require_session("choose")?;
        let Some(current) = self.current_event.as_ref() else {
            return Err(FlowError::WrongStage {
                action: "choose",
                stage: self.stage,
            });
        };
        if !current.options.iter().any(|option| option.option_id == option_id) {
            return Err(FlowError::UnknownOption(option_id.to_string()));
        }
        let last_turn = current.should_generate_result == Some(true);
        let event = current.event();

        let resolved = match self
            .backend
            .resolve_event(&session_id, &event, option_id)
            .await
        {
            Ok(resolved) => resolved,
            // An earlier attempt landed even though its response was lost.
            Err(error) if error.has_code("EVENT_ALREADY_RESOLVED") => {
                info!(
                    session_id = %session_id,
                    event_id = %event.event_id,
                    "choice already applied; reloading session"
                );
                return self.resync(&session_id, Some(event.event_id.as_str())).await;
            }
            Err(error) if error.has_code("SESSION_ENDED") => {
                info!(session_id = %session_id, "service reports the session ended");
                return self.resync(&session_id, None).await;
            }
            Err(error) if error.has_code("GAME_COMPLETE") => {
                info!(session_id = %session_id, "service reports every turn played");
                self.current_event = None;
                self.stage = FlowStage::ReadyForResult;
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        let finished = last_turn || resolved.game_progress.is_complete();
        self.progress = Some(resolved.game_progress.clone());
        self.outcomes.push(resolved);
        self.current_event = None;
        self.stage = if finished {
            FlowStage::ReadyForResult
        } else {
            FlowStage::Ready
        };
        debug!(
            session_id = %session_id,
            turns = self.outcomes.len(),
            finished,
            "choice resolved"
        );
        Ok(())
    }

    /// Rebuilds local state from the stored session, recovering the outcome
    /// of `resolved_event` when it is in the history.
    async fn resync(
        &mut self,
        session_id: &str,
        resolved_event: Option<&str>,
    ) -> Result<(), FlowError> {
        let snapshot = self.backend.session(session_id).await?;
        let recovered = resolved_event.and_then(|event_id| {
            snapshot
                .history
                .iter()
                .rev()
                .find(|item| item.event_id == event_id)
        });
        if let Some(item) = recovered {
            self.outcomes.push(ResolveEventResponse {
                event_outcome: item.outcome.clone(),
                updated_player_state: snapshot.player_state.clone(),
                stat_changes: Vec::new(),
                current_summary: snapshot.current_summary.clone(),
                image: None,
                game_progress: snapshot.game_progress.clone(),
            });
        }

        let complete =
            snapshot.status == SessionStatus::Ended || snapshot.game_progress.is_complete();
        self.current_event = None;
        self.progress = Some(snapshot.game_progress);
        self.stage = match snapshot.final_result {
            Some(result) => {
                self.result = Some(result);
                FlowStage::Finished
            }
            None if complete => FlowStage::ReadyForResult,
            None => FlowStage::Ready,
        };
        debug!(
            session_id = %session_id,
            turn = snapshot.turn,
            stage = ?self.stage,
            "session reloaded"
        );
        Ok(())
    }

    async fn do_finish(&mut self) -> Result<(), FlowError> {
        self.require_stage("finish", &[FlowStage::ReadyForResult, FlowStage::Finished])?;
        let session_id = self.require_session("finish")?;
        let result = self.backend.generate_result(&session_id).await?;
        info!(session_id = %session_id, ending_type = %result.ending_type, "game finished");
        self.result = Some(result);
        self.stage = FlowStage::Finished;
        Ok(())
    }
}

impl std::fmt::Display for FlowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start { .. } => f.write_str("start"),
            Self::LoadEvent => f.write_str("load event"),
            Self::Choose { option_id } => write!(f, "choose {option_id}"),
            Self::Finish => f.write_str("finish"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::request::ErrorKind;
    use async_trait::async_trait;
    use lifesim_common::{PhaseTable, SessionSnapshotResponse, StoryEvent};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails the next `failures_left` resolve calls with a 503. The next
    /// `lost_responses` calls are applied but answered with a timeout.
    #[derive(Default)]
    struct FlakyBackend {
        inner: SimulatedBackend,
        failures_left: Mutex<u32>,
        lost_responses: Mutex<u32>,
        rejection: Mutex<Option<RequestError>>,
        resolve_calls: Mutex<u32>,
    }

    #[async_trait]
    impl GameBackend for FlakyBackend {
        async fn generate_background(
            &self,
            knowledge_base_id: &str,
        ) -> Result<GenerateBackgroundResponse, RequestError> {
            self.inner.generate_background(knowledge_base_id).await
        }

        async fn generate_story(
            &self,
            session_id: &str,
        ) -> Result<GenerateStoryResponse, RequestError> {
            self.inner.generate_story(session_id).await
        }

        async fn resolve_event(
            &self,
            session_id: &str,
            event: &StoryEvent,
            selected_option: &str,
        ) -> Result<ResolveEventResponse, RequestError> {
            *self.resolve_calls.lock().unwrap() += 1;
            {
                let mut failures_left = self.failures_left.lock().unwrap();
                if *failures_left > 0 {
                    *failures_left -= 1;
                    return Err(RequestError::from_status(
                        503,
                        r#"{"message":"model overloaded","error":"GENERATION_FAILED"}"#,
                    ));
                }
            }
            let rejection = self.rejection.lock().unwrap().take();
            if let Some(rejection) = rejection {
                return Err(rejection);
            }
            let resolved = self
                .inner
                .resolve_event(session_id, event, selected_option)
                .await?;
            let mut lost_responses = self.lost_responses.lock().unwrap();
            if *lost_responses > 0 {
                *lost_responses -= 1;
                return Err(RequestError::timeout(Duration::from_secs(60)));
            }
            Ok(resolved)
        }

        async fn generate_result(&self, session_id: &str) -> Result<FinalResult, RequestError> {
            self.inner.generate_result(session_id).await
        }

        async fn session(
            &self,
            session_id: &str,
        ) -> Result<SessionSnapshotResponse, RequestError> {
            self.inner.session(session_id).await
        }
    }

    fn simulated_flow() -> GameFlow {
        GameFlow::new(Arc::new(SimulatedBackend::default()))
    }

    #[tokio::test]
    async fn plays_a_full_simulated_game() {
        let mut flow = simulated_flow();
        flow.start("kb-offline").await.unwrap();
        assert_eq!(flow.stage(), FlowStage::Ready);

        let mut turns = 0;
        while flow.stage() != FlowStage::ReadyForResult {
            flow.load_next_event().await.unwrap();
            let option = flow.current_event().unwrap().options[turns % 2].option_id.clone();
            flow.choose(&option).await.unwrap();
            turns += 1;
            assert!(turns <= 10, "game did not end");
        }

        assert_eq!(turns, 10);
        assert_eq!(flow.outcomes().len(), 10);
        assert!(flow.progress().unwrap().is_complete());

        flow.finish().await.unwrap();
        assert_eq!(flow.stage(), FlowStage::Finished);
        assert_eq!(flow.result().unwrap().key_decisions.len(), 3);
    }

    #[tokio::test]
    async fn failed_choice_can_be_retried_without_losing_turns() {
        let backend = Arc::new(FlakyBackend::default());
        let mut flow = GameFlow::new(backend.clone());
        flow.start("kb-1").await.unwrap();
        flow.load_next_event().await.unwrap();
        flow.choose("A").await.unwrap();
        flow.load_next_event().await.unwrap();

        *backend.failures_left.lock().unwrap() = 1;
        let error = flow.choose("B").await.unwrap_err();

        assert_eq!(error.error_type(), "5xx");
        let failure = flow.last_failure().unwrap();
        assert_eq!(failure.error_type, "5xx");
        assert_eq!(
            failure.action,
            FlowAction::Choose {
                option_id: "B".to_string()
            }
        );
        assert_eq!(flow.outcomes().len(), 1);
        assert_eq!(flow.stage(), FlowStage::AwaitingChoice);

        flow.retry().await.unwrap();

        assert!(flow.last_failure().is_none());
        assert_eq!(flow.outcomes().len(), 2);
        assert_eq!(flow.progress().unwrap().turn, 2);
        assert_eq!(*backend.resolve_calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn last_turn_flag_ends_the_loop() {
        let backend = SimulatedBackend::new(PhaseTable::uniform(&["Brief"], 1).unwrap());
        let mut flow = GameFlow::new(Arc::new(backend));
        flow.start("kb-1").await.unwrap();
        flow.load_next_event().await.unwrap();
        assert_eq!(
            flow.current_event().unwrap().should_generate_result,
            Some(true)
        );

        flow.choose("A").await.unwrap();

        assert_eq!(flow.stage(), FlowStage::ReadyForResult);
        let error = flow.load_next_event().await.unwrap_err();
        assert!(matches!(error, FlowError::WrongStage { .. }));
        assert_eq!(error.error_type(), "flow");
    }

    #[tokio::test]
    async fn unknown_option_is_rejected_locally() {
        let mut flow = simulated_flow();
        flow.start("kb-1").await.unwrap();
        flow.load_next_event().await.unwrap();

        let error = flow.choose("Z").await.unwrap_err();

        assert!(matches!(error, FlowError::UnknownOption(option) if option == "Z"));
        assert!(flow.last_failure().is_none());
        assert_eq!(flow.stage(), FlowStage::AwaitingChoice);
    }

    #[tokio::test]
    async fn start_failure_is_tagged_and_retryable() {
        let mut flow = simulated_flow();

        let error = flow.start("  ").await.unwrap_err();

        assert!(matches!(
            &error,
            FlowError::Request(request) if request.kind == ErrorKind::ClientError
        ));
        assert_eq!(flow.last_failure().unwrap().error_type, "4xx");
        assert_eq!(flow.stage(), FlowStage::NotStarted);
        assert!(flow.retry().await.is_err());
    }

    #[tokio::test]
    async fn retry_without_failure_is_an_error() {
        let mut flow = simulated_flow();
        assert!(matches!(flow.retry().await, Err(FlowError::NothingToRetry)));
    }

    #[tokio::test]
    async fn game_complete_from_service_moves_to_result() {
        let backend = Arc::new(SimulatedBackend::new(
            PhaseTable::uniform(&["Brief"], 1).unwrap(),
        ));
        let mut flow = GameFlow::new(backend.clone());
        flow.start("kb-1").await.unwrap();
        let session_id = flow.session_id().unwrap().to_string();

        // Another client plays the only turn behind our back.
        let event = backend.generate_story(&session_id).await.unwrap();
        backend
            .resolve_event(&session_id, &event.event(), "A")
            .await
            .unwrap();

        flow.load_next_event().await.unwrap();
        assert_eq!(flow.stage(), FlowStage::ReadyForResult);
        flow.finish().await.unwrap();
        assert!(flow.result().is_some());
    }

    #[tokio::test]
    async fn retried_choice_that_already_landed_reloads_the_session() {
        let backend = Arc::new(FlakyBackend::default());
        let mut flow = GameFlow::new(backend.clone());
        flow.start("kb-1").await.unwrap();
        flow.load_next_event().await.unwrap();
        let session_id = flow.session_id().unwrap().to_string();

        *backend.lost_responses.lock().unwrap() = 1;
        let error = flow.choose("A").await.unwrap_err();
        assert_eq!(error.error_type(), "timeout");
        assert_eq!(flow.stage(), FlowStage::AwaitingChoice);

        flow.retry().await.unwrap();

        assert!(flow.last_failure().is_none());
        assert_eq!(flow.stage(), FlowStage::Ready);
        assert_eq!(flow.outcomes().len(), 1);
        assert_eq!(flow.progress().unwrap().turn, 1);
        let snapshot = backend.session(&session_id).await.unwrap();
        assert_eq!(snapshot.turn, 1);
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(
            flow.outcomes()[0].event_outcome,
            snapshot.history[0].outcome
        );

        flow.load_next_event().await.unwrap();
        flow.choose("B").await.unwrap();
        assert_eq!(flow.progress().unwrap().turn, 2);
    }

    #[tokio::test]
    async fn session_ended_elsewhere_while_choosing_shows_the_result() {
        let backend = Arc::new(SimulatedBackend::default());
        let mut flow = GameFlow::new(backend.clone());
        flow.start("kb-1").await.unwrap();
        flow.load_next_event().await.unwrap();
        let session_id = flow.session_id().unwrap().to_string();

        // Another client finalizes the session.
        let result = backend.generate_result(&session_id).await.unwrap();

        flow.choose("A").await.unwrap();

        assert_eq!(flow.stage(), FlowStage::Finished);
        assert_eq!(flow.result(), Some(&result));
        assert!(flow.current_event().is_none());
        assert!(flow.last_failure().is_none());
    }

    #[tokio::test]
    async fn session_ended_elsewhere_while_loading_shows_the_result() {
        let backend = Arc::new(SimulatedBackend::default());
        let mut flow = GameFlow::new(backend.clone());
        flow.start("kb-1").await.unwrap();
        let session_id = flow.session_id().unwrap().to_string();
        backend.generate_result(&session_id).await.unwrap();

        flow.load_next_event().await.unwrap();

        assert_eq!(flow.stage(), FlowStage::Finished);
        assert!(flow.result().is_some());
        assert_eq!(flow.progress().unwrap().turn, 0);
    }

    #[tokio::test]
    async fn game_complete_while_choosing_moves_to_result() {
        let backend = Arc::new(FlakyBackend::default());
        let mut flow = GameFlow::new(backend.clone());
        flow.start("kb-1").await.unwrap();
        flow.load_next_event().await.unwrap();

        *backend.rejection.lock().unwrap() = Some(RequestError::from_status(
            409,
            r#"{"message":"all turns played","error":"GAME_COMPLETE"}"#,
        ));
        flow.choose("A").await.unwrap();

        assert_eq!(flow.stage(), FlowStage::ReadyForResult);
        assert!(flow.current_event().is_none());
        flow.finish().await.unwrap();
        assert_eq!(flow.stage(), FlowStage::Finished);
    }
}
