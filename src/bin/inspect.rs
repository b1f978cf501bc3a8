//! fbp-inspect: connect to an FBP runtime and print what it offers.
//!
//! # Usage
//!
//! ```bash
//! fbp-inspect ws://localhost:3569 [SECRET]
//! ```
//!
//! # Environment Variables
//!
//! - `FBP_CLIENT_CONNECTION_TIMEOUT_MS`: handshake timeout (default: 1000)
//! - `FBP_CLIENT_COMMAND_TIMEOUT_MS`: per-command timeout (default: 10000)
//! - `FBP_CLIENT_SKIP_VALIDATION`, `FBP_CLIENT_SKIP_PERMISSIONS`: `true` to disable checks
//! - `RUST_LOG`: tracing filter (default: "info,fbp_client=debug")

use anyhow::Context;
use fbp_client::{ClientOptions, FbpClient, RuntimeDefinition};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fbp_client=debug".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let address = args
        .next()
        .context("usage: fbp-inspect <address> [secret]")?;
    let mut definition = RuntimeDefinition::new(address);
    if let Some(secret) = args.next() {
        definition = definition.with_secret(secret);
    }

    let client = FbpClient::new(definition, ClientOptions::from_env())?;
    let runtime = client.connect().await?;
    println!("{}", serde_json::to_string_pretty(&runtime)?);

    if client.can_send("component", "list") {
        let components = client.component().list(json!({})).await?;
        let names: Vec<&str> = components
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|component| component.get("name").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        tracing::info!("{} components available", names.len());
        for name in names {
            println!("{name}");
        }
    } else {
        tracing::warn!("runtime does not permit listing components");
    }

    client.disconnect().await?;
    Ok(())
}
