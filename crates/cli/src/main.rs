//! Colloquy CLI: the main entry point.
//!
//! Commands:
//! - `init`    : Create the config directory and a default config
//! - `chat`    : Interactive chat or single-message mode
//! - `history` : List chats or show the messages of one chat
//! - `usage`   : Token usage per provider and model
//! - `status`  : Show configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod terminal;

#[derive(Parser)]
#[command(
    name = "colloquy",
    about = "Colloquy — streaming, knowledge-augmented chat",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config directory and a default config file
    Init,

    /// Chat with the model
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Continue an existing chat instead of starting a new one
        #[arg(short, long)]
        chat: Option<String>,

        /// Directory of .md/.txt files to use as a knowledge collection
        #[arg(short, long)]
        knowledge: Option<PathBuf>,
    },

    /// List chats, or show the messages of one chat
    History {
        /// Chat to show
        chat_id: Option<String>,

        /// Only show messages containing this keyword
        #[arg(short, long)]
        keyword: Option<String>,
    },

    /// Show token usage per provider and model
    Usage,

    /// Show configuration
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => commands::init::run()?,
        Commands::Chat {
            message,
            chat,
            knowledge,
        } => commands::chat::run(message, chat, knowledge).await?,
        Commands::History { chat_id, keyword } => commands::history::run(chat_id, keyword).await?,
        Commands::Usage => commands::usage::run().await?,
        Commands::Status => commands::status::run()?,
    }

    Ok(())
}
