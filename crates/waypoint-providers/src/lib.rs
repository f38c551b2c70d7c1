//! # Waypoint Providers
//!
//! LLM provider clients consumed for diagnosis, quality scoring and plan
//! regeneration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod openai;
pub mod traits;

pub use openai::OpenAIProvider;
pub use traits::{
    CompletionRequest, CompletionResponse, Message, Provider, ProviderError, Role, StopReason,
};
