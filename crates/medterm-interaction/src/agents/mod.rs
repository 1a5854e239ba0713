//! Specialized agents: general chat plus the ICD and SNOMED retrieval
//! agents with interactive-session support.

mod chat;
mod icd;
mod snomed;

pub use chat::ChatAgent;
pub use icd::IcdAgent;
pub use snomed::{ConceptDetails, SnomedAgent};

/// Result of a retrieval agent run: the raw hits (as JSON, for downstream
/// workflow stages) and the user-facing message.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    /// JSON-encoded list of search hits ("[]" when the run produced none)
    pub data: String,
    /// Rendered response for the user
    pub message: String,
}

impl AgentOutput {
    pub fn new(data: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            message: message.into(),
        }
    }

    /// A response with no backing search data.
    pub fn message_only(message: impl Into<String>) -> Self {
        Self::new("[]", message)
    }
}
