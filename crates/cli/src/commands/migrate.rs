//! `identra migrate`: Provision the contact schema.

use std::path::Path;

pub async fn run(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;

    // connect() would migrate on its own when run_migrations is set.
    let mut database = config.database.clone();
    database.run_migrations = false;

    let store = identra_store::connect(&database).await?;
    let result = store.migrate().await;
    store.close().await;
    result?;

    println!(
        "✅ Schema ready ({} at {})",
        store.name(),
        identra_config::redact_url(&config.database.url)
    );
    Ok(())
}
