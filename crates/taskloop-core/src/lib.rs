pub mod completion;
pub mod config;
pub mod phases;
pub mod session;

pub use completion::{CompletionDetector, CompletionResult, CompletionStatus};
pub use config::Config;
pub use phases::{Phase, PhaseMachine, PhaseName, PhaseTransition};
pub use session::{Session, SessionInfo, SessionMessage};
