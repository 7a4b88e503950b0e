//! `colloquy history`: List chats or show the messages of one chat.

use colloquy_config::AppConfig;
use colloquy_core::chat::ChatId;
use colloquy_core::message::MessageQuery;
use colloquy_core::store::ChatStore;
use colloquy_store::SqliteChatStore;

pub async fn run(chat_id: Option<String>, keyword: Option<String>) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let store = SqliteChatStore::open(&config.database_path()).await?;

    let Some(chat_id) = chat_id else {
        let chats = store.list_chats().await?;
        if chats.is_empty() {
            println!("No chats yet. Start one with `colloquy chat`.");
            return Ok(());
        }
        println!("{:<38} {:<20} Summary", "Chat", "Updated");
        for chat in chats {
            println!(
                "{:<38} {:<20} {}",
                chat.id,
                chat.updated_at.format("%Y-%m-%d %H:%M"),
                chat.summary
            );
        }
        return Ok(());
    };

    let chat_id = ChatId::from(&chat_id);
    let chat = store
        .get_chat(&chat_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Chat not found: {chat_id}"))?;
    let messages = store
        .fetch_messages(MessageQuery::new(chat_id, keyword.unwrap_or_default()))
        .await?;

    println!("💬 {}", chat.summary);
    println!("─────────────────────────────────────");
    for message in messages {
        println!("  You > {}", message.prompt);
        if let Some(reasoning) = &message.reasoning {
            println!("  (thinking) {}", reasoning.lines().next().unwrap_or_default());
        }
        for line in message.reply.lines() {
            println!("  Assistant > {line}");
        }
        if !message.cited_files.is_empty() {
            println!("  Sources: {}", message.cited_files.join(", "));
        }
        if let (Some(input), Some(output)) = (message.input_tokens, message.output_tokens) {
            println!("  [{} · {input} in / {output} out]", message.model);
        }
        println!();
    }

    Ok(())
}
