//! Interaction layer: REST clients for the external services and the
//! specialized retrieval agents built on top of them.
//!
//! The two external services (a chat-completion LLM and a terminology
//! search index) are consumed over plain HTTP in the style of direct REST
//! agents; everything is behind traits so the agents can be tested with
//! canned backends.

pub mod agent;
pub mod agents;
pub mod azure;
pub mod prompts;
pub mod retry;

pub use agent::{AgentError, ChatModel, ChatRequest};
pub use agents::{AgentOutput, ChatAgent, IcdAgent, SnomedAgent};
pub use retry::{RetryPolicy, retry_with_backoff};
