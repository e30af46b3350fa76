//! `identra config`: Configuration management commands.

use std::path::Path;

pub async fn validate(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match super::load_config(config_path) {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();

            if config.database.backend == "memory" {
                warnings.push("Memory store selected: contacts are lost on restart");
            }

            if config.resolver.max_retries == 0 {
                warnings.push("resolver.max_retries = 0: concurrent merges fail instead of retrying");
            }

            if config.gateway.allowed_origins.is_empty() {
                warnings.push("No CORS origins configured: browsers on other origins are refused");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Store:     {}", config.database.backend);
            println!(
                "   Database:  {}",
                identra_config::redact_url(&config.database.url)
            );
            println!(
                "   Gateway:   {}:{}",
                config.gateway.host, config.gateway.port
            );
            println!("   Retries:   {}", config.resolver.max_retries);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = super::load_config(config_path)?;
    config.database.url = identra_config::redact_url(&config.database.url);
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", super::config_file(config_path).display());
    Ok(())
}
