//! `colloquy usage`: Token usage per provider and model.

use colloquy_config::AppConfig;
use colloquy_store::SqliteChatStore;
use colloquy_telemetry::summarize;

pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let store = SqliteChatStore::open(&config.database_path()).await?;
    let totals = summarize(&store.list_usage().await?);

    if totals.is_empty() {
        println!("No usage recorded yet.");
        return Ok(());
    }

    println!("📊 Token Usage");
    println!("─────────────────────────────────────────────────────────────────────");
    println!(
        "{:<12} {:<30} {:>6} {:>10} {:>10}",
        "Provider", "Model", "Turns", "Input", "Output"
    );
    for row in &totals {
        println!(
            "{:<12} {:<30} {:>6} {:>10} {:>10}",
            row.provider, row.model, row.turns, row.input_tokens, row.output_tokens
        );
    }

    let input: u64 = totals.iter().map(|t| t.input_tokens).sum();
    let output: u64 = totals.iter().map(|t| t.output_tokens).sum();
    println!();
    println!("  Total: {input} input + {output} output = {} tokens", input + output);

    Ok(())
}
