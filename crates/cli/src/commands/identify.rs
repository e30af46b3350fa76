//! `identra identify`: Resolve one request without the HTTP layer.

use identra_core::Error;
use identra_resolver::ClusterResolver;
use std::path::Path;
use tracing::error;

pub async fn run(
    config_path: Option<&Path>,
    email: Option<String>,
    phone: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let store = identra_store::connect(&config.database).await?;
    let resolver = ClusterResolver::new(store.clone(), &config.resolver);

    let result = resolver.identify(email, phone).await;
    store.close().await;

    let view = result.inspect_err(|e| {
        if let Error::InvariantViolation(detail) = e {
            error!(kind = "invariant_violation", detail = %detail, "Contact cluster is corrupt");
        }
    })?;

    let body = serde_json::json!({ "contact": view });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
