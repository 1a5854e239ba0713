//! REST clients for the Azure-hosted services.

mod openai;
mod search;

pub use openai::{AzureOpenAIChat, AzureOpenAIEmbedder};
pub use search::AzureSearchClient;
