//! # arbiter-core
//!
//! Shared data model for the Arbiter dispatch core.
//!
//! This crate defines the types that cross the boundary between
//! evaluation collaborators and the dispatch runtime: call targets,
//! prompt payloads, completion responses, the per-attempt interaction
//! audit record, and the transport-level error taxonomy.
//!
//! ## Important
//!
//! This crate is pure data. It performs no I/O, holds no shared state,
//! and never makes model calls. The async machinery lives in
//! `arbiter-runtime`.

mod error;
mod payload;
mod record;
mod target;

pub use error::{ErrorClass, ProviderError};
pub use payload::{ChatMessage, CompletionResponse, PromptPayload, TokenUsage};
pub use record::{CallResult, InteractionRecord};
pub use target::{ModelTarget, TargetKey};
