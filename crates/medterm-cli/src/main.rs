//! medterm CLI - a line-oriented chat front end for the terminology
//! assistant. Thin glue: env loading, logging setup, and a REPL.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use medterm_application::MasterAgent;
use medterm_core::config::AppConfig;
use medterm_core::intent::AgentKind;
use medterm_core::relevance::TextEmbedder;
use medterm_interaction::azure::{AzureOpenAIChat, AzureOpenAIEmbedder, AzureSearchClient};

#[derive(Parser)]
#[command(name = "medterm")]
#[command(about = "Medical terminology chat assistant (ICD-10 / SNOMED CT)", long_about = None)]
struct Cli {
    /// Session id to chat under; a fresh one is generated when omitted
    #[arg(long)]
    session: Option<String>,

    /// Force a specific agent instead of auto-classification
    #[arg(long, value_enum)]
    agent: Option<AgentArg>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single query and exit
    Ask {
        /// The query text
        query: String,
    },
    /// List saved session ids
    Sessions,
    /// Show conversation history statistics
    Stats,
    /// Delete old session files and evict stale in-memory sessions
    Cleanup,
}

#[derive(Copy, Clone, ValueEnum)]
enum AgentArg {
    Chat,
    Icd,
    Snomed,
}

impl From<AgentArg> for AgentKind {
    fn from(agent: AgentArg) -> Self {
        match agent {
            AgentArg::Chat => AgentKind::Chat,
            AgentArg::Icd => AgentKind::Icd,
            AgentArg::Snomed => AgentKind::Snomed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    let model = Arc::new(AzureOpenAIChat::from_config(&config));
    let search = Arc::new(AzureSearchClient::from_config(&config));
    let embedder: Option<Arc<dyn TextEmbedder>> = match AzureOpenAIEmbedder::from_config(&config) {
        Ok(embedder) => Some(Arc::new(embedder)),
        Err(_) => None,
    };

    let mut master = MasterAgent::new(config, model, search, embedder)?;
    let session_id = cli
        .session
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let agent = cli.agent.map(AgentKind::from);

    match cli.command {
        Some(Commands::Ask { query }) => {
            let response = master.chat(&query, agent, &session_id).await;
            println!("{response}");
            master.shutdown();
        }
        Some(Commands::Sessions) => {
            for id in master.sessions().list_saved_sessions()? {
                println!("{id}");
            }
        }
        Some(Commands::Stats) => {
            println!("{}", serde_json::to_string_pretty(&master.history_stats())?);
        }
        Some(Commands::Cleanup) => {
            let stats = master.cleanup_sessions();
            println!(
                "Evicted {} in-memory sessions, deleted {}/{} session files",
                stats.memory_sessions_cleared, stats.disk_files_deleted, stats.disk_files_total
            );
        }
        None => {
            repl(&mut master, agent, &session_id).await?;
        }
    }

    Ok(())
}

/// Reads queries line by line until EOF or an exit command.
async fn repl(master: &mut MasterAgent, agent: Option<AgentKind>, session_id: &str) -> Result<()> {
    println!("medterm - medical terminology assistant (session {session_id})");
    println!("Type a query, or 'exit' to quit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if matches!(query, "exit" | "quit") {
            break;
        }

        let response = master.chat(query, agent, session_id).await;
        println!("\n{response}\n");
    }

    master.shutdown();
    Ok(())
}
