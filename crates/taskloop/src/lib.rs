pub mod client;
pub mod display;
pub mod engine;
pub mod health;

pub use client::{ChatResponse, ClientError, Message, ModelClient, OllamaClient};
pub use display::Display;
pub use engine::{LoopEngine, LoopResult, LoopStatus};
