//! Core loop engine for autonomous task execution.
//!
//! Drives the iterate → detect → transition → persist cycle: build the
//! outbound messages from session history, call the model, classify the
//! reply, advance the phase machine on phase completion, and checkpoint the
//! session. Interruption is cooperative: the cancellation token is polled at
//! the top of each iteration, so an in-flight model call always completes.

use crate::client::{Message, ModelClient};
use crate::display::Display;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use taskloop_core::completion::{CompletionDetector, CompletionResult, CompletionStatus};
use taskloop_core::config::Config;
use taskloop_core::phases::{PhaseMachine, PhaseName};
use taskloop_core::session::{self, Session};

/// Session state is checkpointed every this many iterations.
const CHECKPOINT_INTERVAL: u32 = 5;

/// Status of the loop engine. `Running` is internal only and never appears
/// in a returned [`LoopResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Running,
    Completed,
    Interrupted,
    MaxIterations,
    Error,
    NeedsInput,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::MaxIterations => "max_iterations",
            Self::Error => "error",
            Self::NeedsInput => "needs_input",
        }
    }
}

/// Result of loop execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopResult {
    /// Terminal status of the loop.
    pub status: LoopStatus,
    /// Iterations completed within this run.
    pub iterations: u32,
    /// Reason for stopping.
    pub reason: String,
    /// Final output from the loop, when one exists.
    pub output: String,
    /// Error detail, for `Error` results.
    pub error: String,
}

impl LoopResult {
    fn new(status: LoopStatus, iterations: u32, reason: impl Into<String>) -> Self {
        Self {
            status,
            iterations,
            reason: reason.into(),
            output: String::new(),
            error: String::new(),
        }
    }

    fn with_output(mut self, output: &str) -> Self {
        self.output = output.to_string();
        self
    }
}

/// Context passed through loop iterations.
#[derive(Debug, Clone)]
pub struct LoopContext {
    pub task_description: String,
    pub project_root: PathBuf,
    pub current_input: String,
    /// Current iteration number; starts at 1 and is monotonic within a run.
    pub iteration: u32,
    pub metadata: BTreeMap<String, Value>,
}

impl LoopContext {
    fn new(task_description: &str, project_root: &Path, current_input: String) -> Self {
        Self {
            task_description: task_description.to_string(),
            project_root: project_root.to_path_buf(),
            current_input,
            iteration: 0,
            metadata: BTreeMap::new(),
        }
    }
}

/// Callback invoked after each iteration with the iteration number and the
/// model's output.
pub type IterationCallback<'a> = &'a mut (dyn FnMut(u32, &str) + Send);

/// Core loop engine for autonomous task execution.
pub struct LoopEngine<C> {
    client: C,
    config: Config,
    display: Display,
    session: Session,
    phases: PhaseMachine,
    detector: CompletionDetector,
}

impl<C> std::fmt::Debug for LoopEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopEngine")
            .field("session_id", &self.session.session_id)
            .field("phase", &self.phases.current_phase_name())
            .finish_non_exhaustive()
    }
}

impl<C: ModelClient> LoopEngine<C> {
    pub fn new(
        client: C,
        config: Config,
        display: Display,
        session: Session,
        phases: PhaseMachine,
    ) -> Self {
        Self {
            client,
            config,
            display,
            session,
            phases,
            detector: CompletionDetector::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn current_phase_name(&self) -> PhaseName {
        self.phases.current_phase_name()
    }

    /// Run the loop on a task, starting from the task description as the
    /// first input.
    pub async fn run(
        &mut self,
        task_description: &str,
        project_root: &Path,
        max_iterations: Option<u32>,
        cancel: &CancellationToken,
        mut on_iteration: Option<IterationCallback<'_>>,
    ) -> LoopResult {
        self.session.task_description = task_description.to_string();
        self.session.touch();

        let max_iter = max_iterations.unwrap_or(self.config.max_iterations);
        let mut context = LoopContext::new(
            task_description,
            project_root,
            task_description.to_string(),
        );

        self.session.current_phase = self.phases.current_phase_name().as_str().to_string();

        let phase = self.phases.current_phase();
        self.display.show_phase(phase.name.as_str(), phase.description);
        info!(
            session_id = %self.session.session_id,
            phase = %phase.name,
            max_iterations = max_iter,
            "starting loop"
        );

        let mut system_prompt = self.phases.entry_prompt().to_string();

        for iteration in 1..=max_iter {
            // Cooperative interrupt: checked before issuing another model
            // call, so an in-flight exchange always completes first.
            if cancel.is_cancelled() {
                self.display
                    .show_status("Interrupt received. Saving state and stopping...", false);
                self.save_state();
                return LoopResult::new(LoopStatus::Interrupted, iteration - 1, "User interrupted");
            }

            context.iteration = iteration;
            self.display.show_iteration(iteration, max_iter);

            if !context.current_input.is_empty() {
                self.display.log_interaction(
                    "user",
                    &context.current_input,
                    Some(json!({"iteration": iteration})),
                );
                self.session.add_message("user", &context.current_input);
            }

            let messages = self.build_messages(&context, &system_prompt);

            let output = match self.client.chat(&messages, &self.config.model).await {
                Ok(response) => response.content,
                Err(e) => {
                    warn!(
                        session_id = %self.session.session_id,
                        iteration,
                        error = %e,
                        "model call failed"
                    );
                    self.save_state();
                    return LoopResult {
                        status: LoopStatus::Error,
                        iterations: iteration,
                        reason: "LLM error".to_string(),
                        output: String::new(),
                        error: e.to_string(),
                    };
                }
            };

            if output.is_empty() {
                self.display.show_action("(no output)");
            } else {
                self.display.show_action(&output);
            }

            let completion = self.process_response(&output, &context);

            if let Some(callback) = on_iteration.as_mut() {
                callback(iteration, &output);
            }

            match completion.status {
                CompletionStatus::TaskComplete => {
                    self.save_state();
                    info!(
                        session_id = %self.session.session_id,
                        iteration,
                        reason = %completion.reason,
                        "task complete"
                    );
                    return LoopResult::new(LoopStatus::Completed, iteration, completion.reason)
                        .with_output(&output);
                }
                CompletionStatus::NeedsUserInput => {
                    self.save_state();
                    return LoopResult::new(LoopStatus::NeedsInput, iteration, completion.reason)
                        .with_output(&output);
                }
                CompletionStatus::PhaseComplete if self.phases.can_advance() => {
                    // Advance and re-enter with the new phase's entry prompt
                    // as both the next input and the next system prompt.
                    if let Some(new_phase) = self.phases.advance(&completion.reason) {
                        self.display
                            .show_phase(new_phase.name.as_str(), new_phase.description);
                        self.session.current_phase = new_phase.name.as_str().to_string();
                        self.session.touch();
                        info!(
                            session_id = %self.session.session_id,
                            iteration,
                            phase = %new_phase.name,
                            "phase advanced"
                        );
                        context.current_input = new_phase.entry_prompt.to_string();
                        system_prompt = new_phase.entry_prompt.to_string();
                    }
                }
                _ => {
                    // Plain continuation; the next turn relies entirely on
                    // accumulated history.
                    context.current_input = String::new();
                }
            }

            if iteration % CHECKPOINT_INTERVAL == 0 {
                self.save_state();
            }
        }

        self.save_state();
        LoopResult::new(
            LoopStatus::MaxIterations,
            max_iter,
            format!("Reached maximum iterations ({max_iter})"),
        )
    }

    /// Resume a previously interrupted loop.
    ///
    /// Restores the phase from the session's saved phase id (unknown ids
    /// keep the default phase), then re-enters [`run`](Self::run) with the
    /// original task description. The task is therefore re-sent as a fresh
    /// user message on every resume, and any supplied input is superseded
    /// by it before the first outbound request is built. The iteration
    /// counter restarts at 1.
    pub async fn resume(
        &mut self,
        project_root: &Path,
        user_input: Option<&str>,
        max_iterations: Option<u32>,
        cancel: &CancellationToken,
        on_iteration: Option<IterationCallback<'_>>,
    ) -> LoopResult {
        if let Some(phase) = PhaseName::parse(&self.session.current_phase) {
            self.phases.set_phase(phase, "Resumed from session");
        }

        if let Some(input) = user_input {
            debug!(
                session_id = %self.session.session_id,
                input,
                "resume input superseded by task re-send"
            );
        }

        let task = self.session.task_description.clone();
        self.run(&task, project_root, max_iterations, cancel, on_iteration)
            .await
    }

    /// Assemble the outbound message sequence: optional system prompt, the
    /// full conversation history, then the current input once more. The
    /// input therefore appears twice relative to the history append done
    /// just before this call; that duplication is part of the loop's
    /// observable behavior and is preserved.
    fn build_messages(&self, context: &LoopContext, system_prompt: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.session.conversation_history.len() + 2);

        if !system_prompt.is_empty() {
            messages.push(Message::new("system", system_prompt));
        }

        for msg in &self.session.conversation_history {
            messages.push(Message::new(msg.role.clone(), msg.content.clone()));
        }

        if !context.current_input.is_empty() {
            messages.push(Message::new("user", context.current_input.clone()));
        }

        messages
    }

    fn process_response(&mut self, output: &str, context: &LoopContext) -> CompletionResult {
        self.display.log_interaction(
            "assistant",
            output,
            Some(json!({
                "iteration": context.iteration,
                "phase": self.phases.current_phase_name().as_str(),
            })),
        );
        self.session.add_message("assistant", output);
        self.detector.detect(output)
    }

    /// Persist the session; failures are reported but never abort the loop.
    fn save_state(&self) {
        match session::save(&self.session, &self.config.session_dir) {
            Ok(()) => self.display.show_status("State saved", false),
            Err(e) => {
                warn!(
                    session_id = %self.session.session_id,
                    error = %e,
                    "failed to save session state"
                );
                self.display
                    .show_status(&format!("Failed to save state: {e}"), true);
            }
        }
    }

}

/// Construct a configured loop engine starting at the given phase.
pub fn create_loop_engine<C: ModelClient>(
    client: C,
    config: Config,
    display: Display,
    session: Session,
    initial_phase: PhaseName,
) -> LoopEngine<C> {
    LoopEngine::new(client, config, display, session, PhaseMachine::new(initial_phase))
}
