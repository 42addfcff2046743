//! Reasoning-engine contract and its HTTP-backed implementations.
//!
//! The orchestration loop treats the engine as an opaque
//! `think(system, user, options) -> response` call; retries and
//! self-correction live in the loop, not here.

pub mod provider;
pub mod providers;

pub use provider::{
    FinishReason, LlmError, LlmProvider, ResponseFormat, ThinkOptions, ThinkResponse,
};
pub use providers::create_provider;
