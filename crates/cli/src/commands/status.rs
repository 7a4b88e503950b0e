//! `colloquy status`: Show configuration.

use colloquy_config::AppConfig;

pub fn run() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    println!("Colloquy Status");
    println!("===============");
    println!("  Config dir:   {}", AppConfig::config_dir().display());
    println!("  Database:     {}", config.database_path().display());
    println!("  Provider:     {}", config.default_provider);
    println!("  Endpoint:     {}", config.api_url);
    println!("  Model:        {}", config.default_model);
    println!("  Temperature:  {}", config.default_temperature);
    println!("  Max tokens:   {}", config.default_max_tokens);
    println!("  API key:      {}", if config.has_api_key() { "set" } else { "missing" });
    println!("  Analytics:    {}", if config.telemetry.enabled { "enabled" } else { "disabled" });

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("\n  ✅ Config file found");
    } else {
        println!("\n  ⚠️  No config file — run `colloquy init` first");
    }

    if let Err(e) = config.validate() {
        println!("  ⛔ {e}");
    }

    Ok(())
}
