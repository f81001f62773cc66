//! Phase management for the structured development workflow.
//!
//! Six phases form a single chain (PRD → TICKETS → RESEARCH → PLANNING →
//! IMPLEMENTATION → REFACTORING); the final phase has no successor. The
//! registry is a fixed table; `PhaseMachine` tracks the current phase and an
//! append-only transition history.

use serde::{Deserialize, Serialize};

/// Names of workflow phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Prd,
    Tickets,
    Research,
    Planning,
    Implementation,
    Refactoring,
}

impl PhaseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prd => "prd",
            Self::Tickets => "tickets",
            Self::Research => "research",
            Self::Planning => "planning",
            Self::Implementation => "implementation",
            Self::Refactoring => "refactoring",
        }
    }

    /// Parse a phase id. Returns `None` for unrecognized ids so callers can
    /// fall back to the default phase.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prd" => Some(Self::Prd),
            "tickets" => Some(Self::Tickets),
            "research" => Some(Self::Research),
            "planning" => Some(Self::Planning),
            "implementation" => Some(Self::Implementation),
            "refactoring" => Some(Self::Refactoring),
            _ => None,
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for PhaseName {
    fn default() -> Self {
        Self::Prd
    }
}

/// Definition of a workflow phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    /// The phase identifier.
    pub name: PhaseName,
    /// Human-readable description.
    pub description: &'static str,
    /// Prompt sent when entering this phase (also used as the system prompt).
    pub entry_prompt: &'static str,
    /// Description of what triggers phase completion.
    pub completion_criteria: &'static str,
    /// The phase to transition to; `None` for the final phase.
    pub next_phase: Option<PhaseName>,
}

const PRD_ENTRY_PROMPT: &str = "You are a PRD (Product Requirements Document) interviewer. \
DO NOT write any code yet. Your job is to ask the user questions to understand what they want to build.\n\n\
Ask ONE question at a time and wait for the user's response. Questions to ask:\n\
1. What do you want to name this project?\n\
2. What problem does this solve?\n\
3. Who will use this? (A. Just me, B. My team, C. Customers, D. Public)\n\
4. What are the 3 most important features?\n\
5. What does success look like?\n\
6. What is explicitly out of scope?\n\n\
Start by asking: 'What do you want to name this project?'\n\
After gathering all answers, generate a PRD document and mark [PHASE_COMPLETE].";

const TICKETS_ENTRY_PROMPT: &str = "You are in the TICKETS phase. Read the PRD and break it down into \
small, actionable user stories. Each story should be completable in \
one coding session. Order stories by dependencies (database first, \
then backend, then frontend). Save the stories to prd.json. Mark \
[PHASE_COMPLETE] when done.";

const RESEARCH_ENTRY_PROMPT: &str = "You are in the RESEARCH phase. Explore the codebase to understand \
the architecture, existing patterns, and relevant files. Document \
your findings. Identify any constraints or dependencies. Mark \
[PHASE_COMPLETE] when you have enough context to plan implementation.";

const PLANNING_ENTRY_PROMPT: &str = "You are in the PLANNING phase. Based on the user stories and research \
findings, create an implementation plan. Identify which files to \
create/modify, the order of changes, and any risks. Mark \
[PHASE_COMPLETE] when you have a clear plan.";

const IMPLEMENTATION_ENTRY_PROMPT: &str = "You are in the IMPLEMENTATION phase. Follow the plan to implement \
each user story. Write clean, well-tested code. Run tests and fix \
any failures. Mark each story complete when done. Mark \
[PHASE_COMPLETE] when all stories are implemented.";

const REFACTORING_ENTRY_PROMPT: &str = "You are in the REFACTORING phase. Review the implemented code for \
improvements. Look for: code duplication, unclear naming, missing \
error handling, performance issues. Make improvements without \
changing functionality. Run tests after each change. Mark \
[TASK_COMPLETE] when code quality is satisfactory.";

/// All workflow phases, in pipeline order.
const PHASES: &[Phase] = &[
    Phase {
        name: PhaseName::Prd,
        description: "Product Requirements Document - define what to build",
        entry_prompt: PRD_ENTRY_PROMPT,
        completion_criteria: "PRD document generated and saved",
        next_phase: Some(PhaseName::Tickets),
    },
    Phase {
        name: PhaseName::Tickets,
        description: "Break down PRD into actionable tickets/stories",
        entry_prompt: TICKETS_ENTRY_PROMPT,
        completion_criteria: "User stories created and saved to prd.json",
        next_phase: Some(PhaseName::Research),
    },
    Phase {
        name: PhaseName::Research,
        description: "Research codebase and gather context",
        entry_prompt: RESEARCH_ENTRY_PROMPT,
        completion_criteria: "Research findings documented",
        next_phase: Some(PhaseName::Planning),
    },
    Phase {
        name: PhaseName::Planning,
        description: "Plan implementation approach",
        entry_prompt: PLANNING_ENTRY_PROMPT,
        completion_criteria: "Implementation plan created",
        next_phase: Some(PhaseName::Implementation),
    },
    Phase {
        name: PhaseName::Implementation,
        description: "Implement the planned changes",
        entry_prompt: IMPLEMENTATION_ENTRY_PROMPT,
        completion_criteria: "All user stories implemented and tests passing",
        next_phase: Some(PhaseName::Refactoring),
    },
    Phase {
        name: PhaseName::Refactoring,
        description: "Refactor and improve code quality",
        entry_prompt: REFACTORING_ENTRY_PROMPT,
        completion_criteria: "Code reviewed and refactored",
        next_phase: None,
    },
];

/// Look up a phase definition by name.
pub fn get_phase(name: PhaseName) -> &'static Phase {
    // The registry covers every PhaseName variant.
    PHASES
        .iter()
        .find(|p| p.name == name)
        .expect("phase registry covers all variants")
}

/// All phases in workflow order.
pub fn all_phases() -> &'static [Phase] {
    PHASES
}

/// Record of a phase transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTransition {
    /// The phase transitioned from; `None` only for the initial record.
    pub from_phase: Option<PhaseName>,
    /// The phase transitioned to.
    pub to_phase: PhaseName,
    /// Why the transition occurred.
    pub reason: String,
}

/// Serialized form of a transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from_phase: Option<String>,
    pub to_phase: String,
    #[serde(default)]
    pub reason: String,
}

/// Serialized phase machine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    pub current_phase: String,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

/// Optional callback invoked on each phase transition.
pub type TransitionCallback = Box<dyn Fn(&PhaseTransition) + Send>;

/// Tracks the current phase and handles transitions when completion
/// criteria are met.
pub struct PhaseMachine {
    current: PhaseName,
    history: Vec<PhaseTransition>,
    on_transition: Option<TransitionCallback>,
}

impl std::fmt::Debug for PhaseMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseMachine")
            .field("current", &self.current)
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new(PhaseName::default())
    }
}

impl PhaseMachine {
    pub fn new(initial_phase: PhaseName) -> Self {
        Self {
            current: initial_phase,
            history: vec![PhaseTransition {
                from_phase: None,
                to_phase: initial_phase,
                reason: "Initial phase".to_string(),
            }],
            on_transition: None,
        }
    }

    /// Register a callback invoked on each subsequent transition.
    pub fn with_callback(mut self, callback: TransitionCallback) -> Self {
        self.on_transition = Some(callback);
        self
    }

    /// The current phase definition.
    pub fn current_phase(&self) -> &'static Phase {
        get_phase(self.current)
    }

    /// The current phase name.
    pub fn current_phase_name(&self) -> PhaseName {
        self.current
    }

    /// The transition history, oldest first.
    pub fn history(&self) -> &[PhaseTransition] {
        &self.history
    }

    /// True iff there is a next phase to advance to.
    pub fn can_advance(&self) -> bool {
        self.current_phase().next_phase.is_some()
    }

    /// True iff currently in the final phase.
    pub fn is_final_phase(&self) -> bool {
        !self.can_advance()
    }

    /// Entry prompt for the current phase.
    pub fn entry_prompt(&self) -> &'static str {
        self.current_phase().entry_prompt
    }

    /// Advance to the next phase.
    ///
    /// Returns `None` at the final phase; no history entry is recorded in
    /// that case.
    pub fn advance(&mut self, reason: &str) -> Option<&'static Phase> {
        let next = self.current_phase().next_phase?;
        self.record_transition(next, reason);
        Some(get_phase(next))
    }

    /// Set the current phase directly (resume or manual override).
    ///
    /// A no-op (no history entry) if the target equals the current phase.
    pub fn set_phase(&mut self, phase: PhaseName, reason: &str) -> &'static Phase {
        if phase != self.current {
            self.record_transition(phase, reason);
        }
        get_phase(phase)
    }

    fn record_transition(&mut self, to: PhaseName, reason: &str) {
        let transition = PhaseTransition {
            from_phase: Some(self.current),
            to_phase: to,
            reason: reason.to_string(),
        };
        self.history.push(transition);
        self.current = to;
        if let Some(callback) = &self.on_transition {
            // History is never empty after a push.
            if let Some(last) = self.history.last() {
                callback(last);
            }
        }
    }

    /// Serialize the machine state.
    pub fn snapshot(&self) -> PhaseSnapshot {
        PhaseSnapshot {
            current_phase: self.current.as_str().to_string(),
            history: self
                .history
                .iter()
                .map(|t| TransitionRecord {
                    from_phase: t.from_phase.map(|p| p.as_str().to_string()),
                    to_phase: t.to_phase.as_str().to_string(),
                    reason: t.reason.clone(),
                })
                .collect(),
        }
    }

    /// Restore a machine from a snapshot.
    ///
    /// Lenient: an unrecognized current phase falls back to the default
    /// initial phase, and malformed history is replaced with a fresh one.
    pub fn restore(snapshot: &PhaseSnapshot) -> Self {
        let current = PhaseName::parse(&snapshot.current_phase).unwrap_or_default();
        let mut machine = Self::new(current);

        if !snapshot.history.is_empty() {
            let mut history = Vec::with_capacity(snapshot.history.len());
            for record in &snapshot.history {
                let from_phase = record
                    .from_phase
                    .as_deref()
                    .and_then(PhaseName::parse);
                let to_phase = PhaseName::parse(&record.to_phase).unwrap_or_default();
                history.push(PhaseTransition {
                    from_phase,
                    to_phase,
                    reason: record.reason.clone(),
                });
            }
            machine.history = history;
        }

        machine
    }
}
