//! Completion detection for knowing when to stop iterating.
//!
//! Classifies one block of model output into a completion status. Explicit
//! markers are checked first (needs-input, then task, then phase); implicit
//! regex signals apply only when no action-intent phrase appears in the same
//! text.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Explicit markers signalling the whole task is done.
const TASK_COMPLETE_MARKERS: &[&str] = &[
    "[TASK_COMPLETE]",
    "[TASK COMPLETE]",
    "TASK_COMPLETE",
    "<task_complete>",
];

/// Explicit markers signalling the current phase is done.
const PHASE_COMPLETE_MARKERS: &[&str] = &[
    "[PHASE_COMPLETE]",
    "[PHASE COMPLETE]",
    "PHASE_COMPLETE",
    "<phase_complete>",
];

/// Explicit markers signalling the model is blocked on the user.
const NEEDS_INPUT_MARKERS: &[&str] = &[
    "[NEEDS_USER_INPUT]",
    "[NEEDS USER INPUT]",
    "NEEDS_USER_INPUT",
    "<needs_user_input>",
    "[WAITING_FOR_USER]",
];

/// Implicit completion signals with per-pattern confidence.
const IMPLICIT_COMPLETE_PATTERNS: &[(&str, f64)] = &[
    // Tests passing
    (r"all\s+tests?\s+pass", 0.7),
    (r"tests?\s+passed", 0.6),
    (r"✓.*tests?\s+pass", 0.7),
    // Implementation complete phrases
    (r"implementation\s+is\s+complete", 0.8),
    (r"feature\s+is\s+complete", 0.8),
    (r"successfully\s+implemented", 0.7),
    // No more work needed
    (r"no\s+(more\s+)?changes?\s+(are\s+)?needed", 0.8),
    (r"nothing\s+(more\s+)?(to|left\s+to)\s+do", 0.8),
];

/// Phrases suggesting the model still intends further work.
const ACTION_PATTERNS: &[&str] = &[
    r"(let\s+me|i('ll|\s+will)|going\s+to)\s+(create|write|implement|add|fix|update)",
    r"(need\s+to|should|must)\s+(create|write|implement|add|fix|update)",
    r"(creating|writing|implementing|adding|fixing|updating)\s+",
    r"next,?\s+(i('ll|\s+will)|we\s+should)",
];

/// Status of completion detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    NotComplete,
    TaskComplete,
    PhaseComplete,
    NeedsUserInput,
    MaxIterations,
    Error,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotComplete => "not_complete",
            Self::TaskComplete => "task_complete",
            Self::PhaseComplete => "phase_complete",
            Self::NeedsUserInput => "needs_user_input",
            Self::MaxIterations => "max_iterations",
            Self::Error => "error",
        }
    }
}

/// Result of completion detection.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    /// The detected status.
    pub status: CompletionStatus,
    /// Human-readable reason for the status.
    pub reason: String,
    /// Confidence in [0, 1]; 1.0 for explicit markers.
    pub confidence: f64,
}

impl CompletionResult {
    fn explicit(status: CompletionStatus, marker: &str) -> Self {
        Self {
            status,
            reason: format!("Explicit marker found: {marker}"),
            confidence: 1.0,
        }
    }
}

/// Detects when a task or phase is complete.
///
/// Pattern tables are compiled once at construction; `detect` is a pure
/// function of the input text.
#[derive(Debug)]
pub struct CompletionDetector {
    implicit_patterns: Vec<(Regex, f64)>,
    action_patterns: Vec<Regex>,
}

impl Default for CompletionDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn case_insensitive(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("fixed pattern table must compile")
}

impl CompletionDetector {
    pub fn new() -> Self {
        Self {
            implicit_patterns: IMPLICIT_COMPLETE_PATTERNS
                .iter()
                .map(|(pattern, confidence)| (case_insensitive(pattern), *confidence))
                .collect(),
            action_patterns: ACTION_PATTERNS.iter().map(|p| case_insensitive(p)).collect(),
        }
    }

    /// Detect completion status from model output.
    ///
    /// Explicit markers win over implicit signals; needs-input markers win
    /// over task markers, which win over phase markers. Marker matching is
    /// case-insensitive substring containment.
    pub fn detect(&self, output: &str) -> CompletionResult {
        let output_upper = output.to_uppercase();

        for marker in NEEDS_INPUT_MARKERS {
            if output_upper.contains(&marker.to_uppercase()) {
                return CompletionResult::explicit(CompletionStatus::NeedsUserInput, marker);
            }
        }

        for marker in TASK_COMPLETE_MARKERS {
            if output_upper.contains(&marker.to_uppercase()) {
                return CompletionResult::explicit(CompletionStatus::TaskComplete, marker);
            }
        }

        for marker in PHASE_COMPLETE_MARKERS {
            if output_upper.contains(&marker.to_uppercase()) {
                return CompletionResult::explicit(CompletionStatus::PhaseComplete, marker);
            }
        }

        for (pattern, confidence) in &self.implicit_patterns {
            if let Some(found) = pattern.find(output) {
                // An action-intent phrase anywhere in the text suppresses the
                // implicit signal.
                let has_actions = self.action_patterns.iter().any(|p| p.is_match(output));
                if !has_actions {
                    return CompletionResult {
                        status: CompletionStatus::TaskComplete,
                        reason: format!("Implicit completion detected: '{}'", found.as_str()),
                        confidence: *confidence,
                    };
                }
            }
        }

        CompletionResult {
            status: CompletionStatus::NotComplete,
            reason: "No completion markers or signals detected".to_string(),
            confidence: 1.0,
        }
    }

    /// True iff the output indicates the task or phase is complete.
    pub fn is_complete(&self, output: &str) -> bool {
        matches!(
            self.detect(output).status,
            CompletionStatus::TaskComplete | CompletionStatus::PhaseComplete
        )
    }

    /// True iff the output indicates user input is needed.
    pub fn needs_user_input(&self, output: &str) -> bool {
        self.detect(output).status == CompletionStatus::NeedsUserInput
    }
}
