//! `colloquy chat`: Interactive or single-message chat mode.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use colloquy_config::AppConfig;
use colloquy_core::DomainEvent;
use colloquy_core::chat::ChatId;
use colloquy_core::knowledge::{KnowledgeChunk, KnowledgeCollection, KnowledgeFile, KnowledgeService};
use colloquy_providers::OpenAiCompatChatService;
use colloquy_session::{ChatSession, Folder, Services, SessionError, TurnOutcome, TurnStatus};
use colloquy_store::{InMemoryKnowledgeStore, SqliteChatStore};
use colloquy_telemetry::LogTelemetrySink;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::info;

use crate::terminal::{TerminalNotifier, TerminalViewport, spawn_renderer};

pub async fn run(
    message: Option<String>,
    chat: Option<String>,
    knowledge_dir: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    config.validate()?;

    // Check for API key early: give a clear error
    let service = OpenAiCompatChatService::from_config(&config)?;
    if !config.has_api_key() && config.default_provider != "ollama" {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    COLLOQUY_API_KEY = 'sk-...'   (generic)");
        eprintln!("    OPENAI_API_KEY   = 'sk-...'   (for OpenAI direct)");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        bail!("No API key found. See above for setup instructions.");
    }

    let store = Arc::new(SqliteChatStore::open(&config.database_path()).await?);
    let knowledge = Arc::new(InMemoryKnowledgeStore::new());
    let folder = match &knowledge_dir {
        Some(dir) => Some(load_knowledge(&knowledge, dir)?),
        None => None,
    };

    let services = Services {
        store: store.clone(),
        chat: Arc::new(service),
        knowledge: knowledge.clone(),
        usage: store,
        telemetry: Arc::new(LogTelemetrySink::new(config.telemetry.enabled)),
        notifier: Arc::new(TerminalNotifier),
        viewport: Arc::new(TerminalViewport),
    };
    let session = ChatSession::builder(services, &config).build();
    let renderer = spawn_renderer(&session);

    session.select_folder(folder.clone());
    match chat {
        Some(id) => {
            let chat_id = ChatId::from(&id);
            session.open_chat(chat_id.clone(), None).await?;
            if let Some(folder) = &folder {
                knowledge
                    .set_chat_collections(&chat_id, &folder.collection_ids)
                    .await?;
            }
        }
        None => session.open_chat(ChatId::temporary(), None).await?,
    }

    if let Some(msg) = message {
        // Single message mode
        let outcome = run_turn(&session, &msg).await?;
        report(&session, outcome.as_ref());
    } else {
        interactive(&session, &config).await?;
    }

    renderer.abort();
    Ok(())
}

async fn interactive(session: &ChatSession, config: &AppConfig) -> anyhow::Result<()> {
    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║         Colloquy — Interactive Mode          ║");
    println!("  ╚══════════════════════════════════════════════╝");
    println!();
    println!("  Provider:  {}", config.default_provider);
    println!("  Model:     {}", config.default_model);
    println!();
    println!("  Type your message and press Enter. Ctrl+C stops a reply.");
    println!("  /new starts a new chat, /open <id> resumes one,");
    println!("  /find <keyword> searches this chat, /exit quits.");
    println!();

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        prompt_marker()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/exit" | "/quit", _) => break,
            ("/new", _) => session.open_chat(ChatId::temporary(), None).await?,
            ("/open", id) if !id.trim().is_empty() => {
                if let Err(e) = session.open_chat(ChatId::from(id.trim()), None).await {
                    eprintln!("  [Error] {e}");
                }
            }
            ("/find", keyword) => find(session, keyword.trim()).await,
            _ if line.is_empty() => {}
            _ => match run_turn(session, line).await {
                Ok(outcome) => report(session, outcome.as_ref()),
                Err(SessionError::TurnInProgress { .. }) => {
                    eprintln!("  A reply is still streaming.");
                }
                Err(e) => eprintln!("  [Error] {e}"),
            },
        }
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

fn prompt_marker() -> std::io::Result<()> {
    use std::io::Write;
    print!("  You > ");
    std::io::stdout().flush()
}

/// Submit one prompt. Ctrl+C while it streams aborts the turn.
async fn run_turn(session: &ChatSession, prompt: &str) -> Result<Option<TurnOutcome>, SessionError> {
    let turn = session.submit(prompt);
    tokio::pin!(turn);
    tokio::select! {
        outcome = &mut turn => outcome,
        _ = tokio::signal::ctrl_c() => {
            session.abort(&session.active_chat());
            turn.await
        }
    }
}

fn report(session: &ChatSession, outcome: Option<&TurnOutcome>) {
    let Some(outcome) = outcome else { return };
    if outcome.status == TurnStatus::Aborted {
        println!("  (stopped)");
    }
    let messages = session.messages();
    let Some(message) = messages.iter().find(|m| m.id == outcome.message_id) else {
        return;
    };
    if !message.cited_files.is_empty() {
        println!("  Sources: {}", message.cited_files.join(", "));
    }
    if let (Some(input), Some(output)) = (message.input_tokens, message.output_tokens) {
        println!("  ({input} in / {output} out tokens, chat {})", outcome.chat_id);
    }
    println!();
}

/// Longest `/find` waits for the reload of the chat.
const FIND_TIMEOUT: Duration = Duration::from_secs(10);

/// How the reload behind a `/find` ended.
#[derive(Debug, PartialEq, Eq)]
enum Reload {
    Loaded,
    Failed(String),
    TimedOut,
}

async fn find(session: &ChatSession, keyword: &str) {
    let chat_id = session.active_chat();
    if chat_id.is_temporary() {
        println!("  Nothing to search yet.");
        return;
    }
    let mut events = session.subscribe();
    session.set_keyword(&chat_id, keyword);
    match wait_for_reload(&mut events, &chat_id, FIND_TIMEOUT).await {
        Reload::Loaded => {}
        Reload::Failed(error) => {
            println!("  Search failed: {error}");
            return;
        }
        Reload::TimedOut => {
            println!("  Search timed out.");
            return;
        }
    }
    let messages = session.messages();
    println!("  {} matching message(s)", messages.len());
    for message in messages {
        println!("  ─ {}", message.prompt);
    }
}

/// Wait for the coalesced reload of `chat_id` to land or fail.
async fn wait_for_reload(
    events: &mut broadcast::Receiver<Arc<DomainEvent>>,
    chat_id: &ChatId,
    limit: Duration,
) -> Reload {
    let wait = async {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Reload::Failed("session closed".into());
                }
            };
            match event.as_ref() {
                DomainEvent::MessagesLoaded { chat_id: id, .. } if id == chat_id => {
                    return Reload::Loaded;
                }
                DomainEvent::MessagesLoadFailed { chat_id: id, error } if id == chat_id => {
                    return Reload::Failed(error.clone());
                }
                _ => {}
            }
        }
    };
    tokio::time::timeout(limit, wait)
        .await
        .unwrap_or(Reload::TimedOut)
}

/// Load a directory of notes as one knowledge collection, wrapped in a
/// folder so new chats start with it attached.
fn load_knowledge(store: &InMemoryKnowledgeStore, dir: &Path) -> anyhow::Result<Folder> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "knowledge".into());
    let collection_id = format!("dir-{name}").replace(char::is_whitespace, "_");
    store.add_collection(KnowledgeCollection {
        id: collection_id.clone(),
        name: name.clone(),
    });

    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .is_some_and(|ext| ext == "md" || ext == "txt")
        })
        .collect();
    entries.sort();

    let mut chunk_count = 0;
    for (file_idx, path) in entries.iter().enumerate() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file = KnowledgeFile {
            id: format!("f{file_idx}"),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let chunks: Vec<KnowledgeChunk> = text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .enumerate()
            .map(|(n, paragraph)| KnowledgeChunk {
                id: format!("{}-{n}", file.id),
                file_id: file.id.clone(),
                content: paragraph.to_string(),
            })
            .collect();
        chunk_count += chunks.len();
        store.add_file(&collection_id, file, chunks);
    }

    info!(collection = %collection_id, files = entries.len(), chunks = chunk_count, "Knowledge loaded");
    println!("  Knowledge: {} files, {} passages from {}", entries.len(), chunk_count, dir.display());

    Ok(Folder {
        id: collection_id.clone(),
        name,
        collection_ids: vec![collection_id],
    })
}
