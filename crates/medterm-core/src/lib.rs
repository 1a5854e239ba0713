//! Core domain logic for the medterm terminology assistant.
//!
//! This crate holds everything that does not talk to the network: the shared
//! error type, environment configuration, the interactive session store, the
//! conversation history, intent/follow-up heuristics, the concept set cache,
//! the semantic relevance filter, and search-result extraction.

pub mod concept_set;
pub mod config;
pub mod error;
pub mod extract;
pub mod history;
pub mod intent;
pub mod relations;
pub mod relevance;
pub mod search;
pub mod session;
pub mod text;

// Re-export common error type
pub use error::{MedtermError, Result};
